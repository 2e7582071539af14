//! Session metrics
//!
//! - `session_refreshes_total` (counter): label `outcome` (`ok`, `invalid`, `error`)

use crate::error::Result;
use crate::tokens::AccessToken;

pub fn record_refresh(outcome: &Result<Option<AccessToken>>) {
    let label = match outcome {
        Ok(Some(_)) => "ok",
        Ok(None) => "invalid",
        Err(_) => "error",
    };
    metrics::counter!("session_refreshes_total", "outcome" => label).increment(1);
}

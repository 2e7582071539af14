//! Prometheus metrics exposition
//!
//! - `broker_requests_total` (counter): labels `endpoint`, `status`
//! - `broker_request_duration_seconds` (histogram): label `endpoint`
//! - `broker_session_valid` (gauge): 1 while the session is usable, 0 once invalidated
//! - `broker_background_errors_total` (counter): label `location`
//!
//! Cache and session counters (`async_cache_*`, `session_refreshes_total`)
//! are recorded by their crates and rendered through the same recorder.

use anyhow::Context;
use metrics_exporter_prometheus::{Matcher, PrometheusBuilder, PrometheusHandle};

/// Token requests are dominated by refresh round-trips, so buckets run from
/// 1ms (cache hit) to the retry horizon.
const DURATION_BUCKETS: &[f64] = &[
    0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0,
];

fn builder() -> anyhow::Result<PrometheusBuilder> {
    PrometheusBuilder::new()
        .set_buckets_for_metric(
            Matcher::Full("broker_request_duration_seconds".to_string()),
            DURATION_BUCKETS,
        )
        .context("failed to set histogram buckets")
}

/// Install the global Prometheus recorder and return a handle for `/metrics`.
pub fn install_recorder() -> anyhow::Result<PrometheusHandle> {
    builder()?
        .install_recorder()
        .context("failed to install Prometheus recorder")
}

pub fn record_request(endpoint: &'static str, status: u16, duration_secs: f64) {
    metrics::counter!("broker_requests_total", "endpoint" => endpoint, "status" => status.to_string())
        .increment(1);
    metrics::histogram!("broker_request_duration_seconds", "endpoint" => endpoint)
        .record(duration_secs);
}

pub fn set_session_valid(valid: bool) {
    metrics::gauge!("broker_session_valid").set(if valid { 1.0 } else { 0.0 });
}

pub fn record_background_error(location: &str) {
    metrics::counter!("broker_background_errors_total", "location" => location.to_string())
        .increment(1);
}

#[cfg(test)]
mod tests {
    use super::*;
    use metrics_exporter_prometheus::PrometheusRecorder;

    /// Isolated recorder; `install_recorder` may only succeed once per process.
    fn isolated_recorder() -> (PrometheusRecorder, PrometheusHandle) {
        let recorder = builder().unwrap().build_recorder();
        let handle = recorder.handle();
        (recorder, handle)
    }

    #[test]
    fn record_functions_do_not_panic_without_recorder() {
        record_request("token", 200, 0.01);
        set_session_valid(true);
        record_background_error("test");
    }

    #[test]
    fn record_request_renders_counter_and_histogram() {
        let (recorder, handle) = isolated_recorder();
        let _guard = metrics::set_default_local_recorder(&recorder);

        record_request("token", 200, 0.002);
        record_request("token_refresh", 502, 1.2);

        let output = handle.render();
        assert!(output.contains("broker_requests_total"));
        assert!(output.contains("endpoint=\"token\""));
        assert!(output.contains("endpoint=\"token_refresh\""));
        assert!(output.contains("status=\"502\""));
        assert!(
            output.contains("broker_request_duration_seconds_bucket"),
            "histogram must render _bucket lines"
        );
        assert!(output.contains("le=\"0.001\""));
        assert!(output.contains("le=\"30\""));
    }

    #[test]
    fn session_gauge_and_background_errors_render() {
        let (recorder, handle) = isolated_recorder();
        let _guard = metrics::set_default_local_recorder(&recorder);

        set_session_valid(false);
        record_background_error("async_cache.refresh");

        let output = handle.render();
        assert!(output.contains("broker_session_valid 0"));
        assert!(output.contains("location=\"async_cache.refresh\""));
    }
}

//! Configuration types and loading
//!
//! Config precedence: CLI args > env vars > config file > defaults.
//! Secrets never live in the TOML: the refresh token comes from
//! TOKEN_BROKER_REFRESH_TOKEN or `refresh_token_file`, the publishable client
//! key from TOKEN_BROKER_CLIENT_KEY.

use common::Secret;
use serde::Deserialize;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use async_cache::CacheOptions;
use async_state::{RateLimitOptions, RetryOptions};

pub const REFRESH_TOKEN_ENV: &str = "TOKEN_BROKER_REFRESH_TOKEN";
pub const CLIENT_KEY_ENV: &str = "TOKEN_BROKER_CLIENT_KEY";

/// Root configuration
#[derive(Debug, Deserialize)]
pub struct Config {
    pub broker: BrokerConfig,
    pub auth: AuthConfig,
    #[serde(default)]
    pub cache: CacheConfig,
    #[serde(default)]
    pub retry: RetryConfig,
}

/// HTTP listener settings
#[derive(Debug, Deserialize)]
pub struct BrokerConfig {
    pub listen_addr: SocketAddr,
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,
}

/// Auth server and session credentials
#[derive(Debug, Deserialize)]
pub struct AuthConfig {
    pub base_url: String,
    pub project_id: String,
    /// Path to a file containing the refresh token (alternative to the env var)
    #[serde(default)]
    pub refresh_token_file: Option<PathBuf>,
    #[serde(default = "default_timeout")]
    pub timeout_secs: u64,
    #[serde(skip)]
    pub refresh_token: Option<Secret<String>>,
    #[serde(skip)]
    pub client_key: Option<Secret<String>>,
}

/// Pacing of forced refreshes
#[derive(Debug, Deserialize)]
pub struct CacheConfig {
    #[serde(default = "default_throttle_ms")]
    pub throttle_ms: u64,
    #[serde(default)]
    pub gap_ms: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            throttle_ms: default_throttle_ms(),
            gap_ms: 0,
        }
    }
}

impl CacheConfig {
    pub fn cache_options(&self) -> CacheOptions {
        CacheOptions {
            rate_limit: RateLimitOptions {
                batch_calls: true,
                throttle: Duration::from_millis(self.throttle_ms),
                gap: Duration::from_millis(self.gap_ms),
                ..Default::default()
            },
            ..Default::default()
        }
    }
}

/// Retry policy for token endpoint calls
#[derive(Debug, Deserialize)]
pub struct RetryConfig {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_delay_base_ms")]
    pub exponential_delay_base_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            exponential_delay_base_ms: default_delay_base_ms(),
        }
    }
}

impl RetryConfig {
    pub fn options(&self) -> RetryOptions {
        RetryOptions {
            exponential_delay_base: Duration::from_millis(self.exponential_delay_base_ms),
        }
    }
}

fn default_max_connections() -> usize {
    1000
}

fn default_timeout() -> u64 {
    30
}

fn default_throttle_ms() -> u64 {
    300
}

fn default_max_attempts() -> u32 {
    3
}

fn default_delay_base_ms() -> u64 {
    2000
}

impl Config {
    /// Load configuration from a TOML file, then overlay environment variables.
    ///
    /// Refresh token resolution order:
    /// 1. TOKEN_BROKER_REFRESH_TOKEN env var
    /// 2. refresh_token_file path from config
    pub fn load(path: &Path) -> common::Result<Self> {
        let contents = std::fs::read_to_string(path).map_err(|source| common::Error::ReadFile {
            path: path.to_path_buf(),
            source,
        })?;
        let mut config: Config = toml::from_str(&contents)?;
        config.validate()?;

        config.auth.refresh_token = match Secret::from_env(REFRESH_TOKEN_ENV) {
            Some(token) => Some(token),
            None => config
                .auth
                .refresh_token_file
                .as_ref()
                .map(Secret::from_file)
                .transpose()?,
        };
        config.auth.client_key = Secret::from_env(CLIENT_KEY_ENV);

        Ok(config)
    }

    fn validate(&self) -> common::Result<()> {
        if !self.auth.base_url.starts_with("http://") && !self.auth.base_url.starts_with("https://")
        {
            return Err(common::Error::Config(format!(
                "base_url must start with http:// or https://, got: {}",
                self.auth.base_url
            )));
        }
        if self.auth.project_id.trim().is_empty() {
            return Err(common::Error::Config("project_id must not be empty".into()));
        }
        if self.auth.timeout_secs == 0 {
            return Err(common::Error::Config(
                "timeout_secs must be greater than 0".into(),
            ));
        }
        if self.broker.max_connections == 0 {
            return Err(common::Error::Config(
                "max_connections must be greater than 0".into(),
            ));
        }
        if self.retry.max_attempts == 0 {
            return Err(common::Error::Config(
                "max_attempts must be greater than 0".into(),
            ));
        }
        Ok(())
    }

    /// Resolve config file path from CLI arg or CONFIG_PATH env var.
    pub fn resolve_path(cli_path: Option<&str>) -> PathBuf {
        if let Some(p) = cli_path {
            return PathBuf::from(p);
        }
        if let Ok(p) = std::env::var("CONFIG_PATH") {
            return PathBuf::from(p);
        }
        PathBuf::from("token-broker.toml")
    }
}

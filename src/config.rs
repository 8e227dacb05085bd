//! Runtime configuration.
//!
//! Defaults suit a cart service on localhost; `from_env` overlays
//! `CART_SYNC_*` environment variables.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use crate::api::normalize_base_url;
use crate::debounce::DEFAULT_DEBOUNCE;
use crate::error::CartError;
use crate::retry::RetryPolicy;

const DEFAULT_BASE_URL: &str = "http://localhost:8000/api";
const DEFAULT_TIMEOUT_SECS: u64 = 30;
const DEFAULT_RETAINED_LOG_FILES: usize = 7;
const DEFAULT_LOG_FILTER: &str = "info,grocery_cart_sync_lib=debug";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    /// Directory for daily rolling log files; console only when unset.
    pub dir: Option<PathBuf>,
    pub retained_files: usize,
    /// Used when `RUST_LOG` is not set.
    pub default_filter: String,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            dir: None,
            retained_files: DEFAULT_RETAINED_LOG_FILES,
            default_filter: DEFAULT_LOG_FILTER.to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CartSyncConfig {
    pub base_url: String,
    pub request_timeout_secs: u64,
    pub debounce_ms: u64,
    pub retry: RetryPolicy,
    /// Where `cart.db` lives; an in-memory database is used when unset.
    pub data_dir: Option<PathBuf>,
    pub log: LogConfig,
}

impl Default for CartSyncConfig {
    fn default() -> Self {
        Self {
            base_url: DEFAULT_BASE_URL.to_string(),
            request_timeout_secs: DEFAULT_TIMEOUT_SECS,
            debounce_ms: DEFAULT_DEBOUNCE.as_millis() as u64,
            retry: RetryPolicy::default(),
            data_dir: None,
            log: LogConfig::default(),
        }
    }
}

fn env_value(key: &str) -> Option<String> {
    std::env::var(key)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

fn env_parse<T: FromStr>(key: &str) -> Result<Option<T>, CartError> {
    match env_value(key) {
        Some(raw) => raw
            .parse::<T>()
            .map(Some)
            .map_err(|_| CartError::Config(format!("{key} has invalid value '{raw}'"))),
        None => Ok(None),
    }
}

impl CartSyncConfig {
    pub fn from_env() -> Result<Self, CartError> {
        let mut config = Self::default();

        if let Some(url) = env_value("CART_SYNC_BASE_URL") {
            config.base_url = url;
        }
        if let Some(secs) = env_parse::<u64>("CART_SYNC_TIMEOUT_SECS")? {
            config.request_timeout_secs = secs;
        }
        if let Some(ms) = env_parse::<u64>("CART_SYNC_DEBOUNCE_MS")? {
            config.debounce_ms = ms;
        }
        if let Some(attempts) = env_parse::<u32>("CART_SYNC_RETRY_ATTEMPTS")? {
            config.retry.max_attempts = attempts;
        }
        if let Some(ms) = env_parse::<u64>("CART_SYNC_RETRY_BASE_MS")? {
            config.retry.base_delay_ms = ms;
        }
        if let Some(dir) = env_value("CART_SYNC_DATA_DIR") {
            config.data_dir = Some(PathBuf::from(dir));
        }
        if let Some(dir) = env_value("CART_SYNC_LOG_DIR") {
            config.log.dir = Some(PathBuf::from(dir));
        }

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&mut self) -> Result<(), CartError> {
        if self.base_url.trim().is_empty() {
            return Err(CartError::Config("base URL is empty".into()));
        }
        if self.retry.max_attempts == 0 {
            return Err(CartError::Config("retry attempts must be at least 1".into()));
        }
        if self.request_timeout_secs == 0 {
            return Err(CartError::Config("request timeout must be positive".into()));
        }
        self.base_url = normalize_base_url(&self.base_url);
        Ok(())
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn debounce(&self) -> Duration {
        Duration::from_millis(self.debounce_ms)
    }
}

// Engine Config - Tunables for sync sessions, retries and transports

use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

/// Hard cap on changes per page, enforced on both sides of the wire
pub const MAX_BATCH_SIZE: usize = 1000;

/// Errors from configuration validation
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// Configuration for the sync engine
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Changes per page when streaming
    pub batch_size: usize,
    /// Sector digests per page when reconciling
    pub sector_page_size: usize,
    /// Timeout for one request/response round trip
    pub request_timeout_secs: u64,
    /// Retries after the first failed session attempt
    pub max_retries: u32,
    /// Backoff before the first retry, doubled per attempt
    pub retry_backoff_ms: u64,
    /// Upper bound for the backoff
    pub max_backoff_ms: u64,
    /// Period of the background scheduler; `None` disables it
    pub sync_interval_secs: Option<u64>,
    /// Largest TCP frame accepted
    pub max_frame_bytes: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            batch_size: 100,
            sector_page_size: 64,
            request_timeout_secs: 30,
            max_retries: 3,
            retry_backoff_ms: 500,
            max_backoff_ms: 30_000,
            sync_interval_secs: Some(60),
            max_frame_bytes: 16 * 1024 * 1024,
        }
    }
}

impl EngineConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_batch_size(mut self, size: usize) -> Self {
        self.batch_size = size;
        self
    }

    pub fn with_sector_page_size(mut self, size: usize) -> Self {
        self.sector_page_size = size;
        self
    }

    pub fn with_request_timeout_secs(mut self, secs: u64) -> Self {
        self.request_timeout_secs = secs;
        self
    }

    pub fn with_max_retries(mut self, retries: u32) -> Self {
        self.max_retries = retries;
        self
    }

    pub fn with_retry_backoff_ms(mut self, ms: u64) -> Self {
        self.retry_backoff_ms = ms;
        self
    }

    pub fn with_max_backoff_ms(mut self, ms: u64) -> Self {
        self.max_backoff_ms = ms;
        self
    }

    pub fn with_sync_interval_secs(mut self, secs: Option<u64>) -> Self {
        self.sync_interval_secs = secs;
        self
    }

    pub fn with_max_frame_bytes(mut self, bytes: usize) -> Self {
        self.max_frame_bytes = bytes;
        self
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    /// Backoff before retry number `attempt` (1-based)
    pub fn backoff_for(&self, attempt: u32) -> Duration {
        let shift = attempt.saturating_sub(1).min(32);
        let ms = self
            .retry_backoff_ms
            .saturating_mul(1u64 << shift)
            .min(self.max_backoff_ms);
        Duration::from_millis(ms)
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.batch_size == 0 || self.batch_size > MAX_BATCH_SIZE {
            return Err(ConfigError::Invalid(format!(
                "batch_size must be in 1..={}",
                MAX_BATCH_SIZE
            )));
        }
        if self.sector_page_size == 0 || self.sector_page_size > crate::ledger::SECTOR_COUNT {
            return Err(ConfigError::Invalid(
                "sector_page_size must be in 1..=256".to_string(),
            ));
        }
        if self.request_timeout_secs == 0 {
            return Err(ConfigError::Invalid(
                "request_timeout_secs must be > 0".to_string(),
            ));
        }
        if self.max_backoff_ms < self.retry_backoff_ms {
            return Err(ConfigError::Invalid(
                "max_backoff_ms must be >= retry_backoff_ms".to_string(),
            ));
        }
        if self.sync_interval_secs == Some(0) {
            return Err(ConfigError::Invalid(
                "sync_interval_secs must be > 0 when set".to_string(),
            ));
        }
        if self.max_frame_bytes < 1024 {
            return Err(ConfigError::Invalid(
                "max_frame_bytes must be at least 1024".to_string(),
            ));
        }
        Ok(())
    }
}

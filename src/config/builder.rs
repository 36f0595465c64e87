//! Builder for [`AppConfig`] with range validation.

use std::path::PathBuf;

use super::types::AppConfig;

/// Configuration errors surfaced at build time, before any service starts.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("{field} must be at least {min}, got {got}")]
    BelowMinimum {
        field: &'static str,
        min: i64,
        got: i64,
    },
    #[error("{field} must not exceed {max}, got {got}")]
    AboveMaximum {
        field: &'static str,
        max: i64,
        got: i64,
    },
    #[error("invalid value for {key}: {value:?}")]
    InvalidEnvValue { key: &'static str, value: String },
}

/// Fluent builder over the default configuration.
#[derive(Debug, Default)]
pub struct AppConfigBuilder {
    config: AppConfig,
}

impl AppConfigBuilder {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn max_concurrent_scans(mut self, n: usize) -> Self {
        self.config.queue.max_concurrent_scans = n;
        self
    }

    #[must_use]
    pub fn max_queue_size(mut self, n: usize) -> Self {
        self.config.queue.max_queue_size = n;
        self
    }

    #[must_use]
    pub fn max_queued_jobs_per_ip(mut self, n: usize) -> Self {
        self.config.queue.max_queued_jobs_per_ip = n;
        self
    }

    #[must_use]
    pub fn max_pages_per_scan(mut self, n: usize) -> Self {
        self.config.crawler.max_pages_per_scan = n;
        self
    }

    #[must_use]
    pub fn page_timeout_secs(mut self, secs: u64) -> Self {
        self.config.crawler.page_timeout_secs = secs;
        self
    }

    #[must_use]
    pub fn max_scan_duration_secs(mut self, secs: u64) -> Self {
        self.config.crawler.max_scan_duration_secs = secs;
        self
    }

    #[must_use]
    pub fn enforce_https(mut self, on: bool) -> Self {
        self.config.security.enforce_https = on;
        self
    }

    #[must_use]
    pub fn retention_hours(mut self, hours: i64) -> Self {
        self.config.retention.retention_hours = hours;
        self
    }

    #[must_use]
    pub fn db_path(mut self, path: PathBuf) -> Self {
        self.config.server.db_path = path;
        self
    }

    #[must_use]
    pub fn bind_addr(mut self, addr: String) -> Self {
        self.config.server.bind_addr = addr;
        self
    }

    /// Validate ranges and produce the final configuration.
    pub fn build(self) -> Result<AppConfig, ConfigError> {
        let c = &self.config;

        if c.queue.max_concurrent_scans == 0 {
            return Err(ConfigError::BelowMinimum {
                field: "queue.max_concurrent_scans",
                min: 1,
                got: 0,
            });
        }
        if c.queue.max_queue_size == 0 {
            return Err(ConfigError::BelowMinimum {
                field: "queue.max_queue_size",
                min: 1,
                got: 0,
            });
        }
        if c.crawler.max_pages_per_scan == 0 {
            return Err(ConfigError::BelowMinimum {
                field: "crawler.max_pages_per_scan",
                min: 1,
                got: 0,
            });
        }
        if c.crawler.max_pages_per_scan > 10_000 {
            return Err(ConfigError::AboveMaximum {
                field: "crawler.max_pages_per_scan",
                max: 10_000,
                got: c.crawler.max_pages_per_scan as i64,
            });
        }
        if c.crawler.checkpoint_interval_pages == 0 {
            return Err(ConfigError::BelowMinimum {
                field: "crawler.checkpoint_interval_pages",
                min: 1,
                got: 0,
            });
        }
        if c.queue.fairness_slot_secs <= 0 {
            return Err(ConfigError::BelowMinimum {
                field: "queue.fairness_slot_secs",
                min: 1,
                got: c.queue.fairness_slot_secs,
            });
        }
        if c.retention.retention_hours <= 0 {
            return Err(ConfigError::BelowMinimum {
                field: "retention.retention_hours",
                min: 1,
                got: c.retention.retention_hours,
            });
        }

        Ok(self.config)
    }
}

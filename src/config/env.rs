//! Environment-variable overrides.
//!
//! Every recognized key is enumerated here and nowhere else. Each variable
//! overrides exactly one nested configuration field; unset variables leave
//! the default in place, and unparseable values are an error rather than a
//! silent fallback.

use tracing::debug;

use super::builder::ConfigError;
use super::types::AppConfig;

/// Apply all recognized `WEBPSCAN`-relevant environment variables on top of
/// `config`.
pub fn apply_env_overrides(mut config: AppConfig) -> Result<AppConfig, ConfigError> {
    // Queue sizing
    if let Some(v) = parse_env::<usize>("MAX_CONCURRENT_SCANS")? {
        config.queue.max_concurrent_scans = v;
    }
    if let Some(v) = parse_env::<usize>("MAX_QUEUE_SIZE")? {
        config.queue.max_queue_size = v;
    }
    if let Some(v) = parse_env::<usize>("MAX_QUEUED_JOBS_PER_IP")? {
        config.queue.max_queued_jobs_per_ip = v;
    }
    if let Some(v) = parse_env::<i64>("FAIRNESS_SLOT_SECONDS")? {
        config.queue.fairness_slot_secs = v;
    }
    if let Some(v) = parse_env::<i64>("AGING_BOOST_SECONDS")? {
        config.queue.aging_boost_secs = v;
    }
    if let Some(v) = parse_env::<u64>("COOLDOWN_SECONDS")? {
        config.queue.cooldown_secs = v;
    }

    // Crawler limits
    if let Some(v) = parse_env::<usize>("MAX_PAGES_PER_SCAN")? {
        config.crawler.max_pages_per_scan = v;
    }
    if let Some(v) = parse_env::<u64>("PAGE_TIMEOUT_SECONDS")? {
        config.crawler.page_timeout_secs = v;
    }
    if let Some(v) = parse_env::<u64>("MAX_SCAN_DURATION_SECONDS")? {
        config.crawler.max_scan_duration_secs = v;
    }
    if let Some(v) = parse_env::<u64>("DELAY_BETWEEN_PAGES_MS")? {
        config.crawler.delay_between_pages_ms = v;
    }

    // Security
    if let Some(v) = parse_env::<u32>("MAX_REQUESTS_PER_MINUTE")? {
        config.security.max_requests_per_minute = v;
    }
    if let Some(v) = parse_env::<bool>("ENFORCE_HTTPS")? {
        config.security.enforce_https = v;
    }

    // Retention
    if let Some(v) = parse_env::<i64>("RETENTION_HOURS")? {
        config.retention.retention_hours = v;
    }

    // Process wiring
    if let Ok(v) = std::env::var("BIND_ADDR") {
        config.server.bind_addr = v;
    }
    if let Ok(v) = std::env::var("DATABASE_PATH") {
        config.server.db_path = v.into();
    }
    if let Ok(v) = std::env::var("BUNDLE_DIR") {
        config.retention.bundle_dir = v.into();
    }
    if let Some(v) = parse_env::<bool>("EMAIL_ENABLED")? {
        config.server.email_enabled = v;
    }

    Ok(config)
}

fn parse_env<T: std::str::FromStr>(key: &'static str) -> Result<Option<T>, ConfigError> {
    match std::env::var(key) {
        Ok(raw) => {
            let parsed = raw
                .trim()
                .parse::<T>()
                .map_err(|_| ConfigError::InvalidEnvValue { key, value: raw })?;
            debug!(key, "configuration override from environment");
            Ok(Some(parsed))
        }
        Err(_) => Ok(None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // Env-var tests mutate process state; keep them serialized on one lock.
    static ENV_LOCK: parking_lot::Mutex<()> = parking_lot::Mutex::new(());

    #[test]
    fn unset_vars_leave_defaults() {
        let _guard = ENV_LOCK.lock();
        unsafe { std::env::remove_var("MAX_QUEUE_SIZE") };
        let config = apply_env_overrides(AppConfig::default()).unwrap();
        assert_eq!(config.queue.max_queue_size, 100);
    }

    #[test]
    fn numeric_override_applies() {
        let _guard = ENV_LOCK.lock();
        unsafe { std::env::set_var("MAX_QUEUE_SIZE", "7") };
        let config = apply_env_overrides(AppConfig::default()).unwrap();
        assert_eq!(config.queue.max_queue_size, 7);
        unsafe { std::env::remove_var("MAX_QUEUE_SIZE") };
    }

    #[test]
    fn garbage_value_is_an_error() {
        let _guard = ENV_LOCK.lock();
        unsafe { std::env::set_var("MAX_PAGES_PER_SCAN", "a lot") };
        let err = apply_env_overrides(AppConfig::default()).unwrap_err();
        assert!(matches!(err, ConfigError::InvalidEnvValue { .. }));
        unsafe { std::env::remove_var("MAX_PAGES_PER_SCAN") };
    }
}

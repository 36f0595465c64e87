//! Core configuration types for the scan service.
//!
//! Every tunable lives in one of the nested sections below; the env-var
//! override surface is enumerated in `env.rs` and the builder in
//! `builder.rs`. Components receive these structs by value at construction
//! time — there is no dynamic lookup at runtime.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Desktop user agent advertised to origin servers so content negotiation
/// behaves the way it would for a real visitor.
pub const DESKTOP_USER_AGENT: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) \
AppleWebKit/537.36 (KHTML, like Gecko) Chrome/126.0.0.0 Safari/537.36";

/// Top-level configuration, one section per subsystem.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    pub queue: QueueConfig,
    pub crawler: CrawlerConfig,
    pub security: SecurityConfig,
    pub retention: RetentionConfig,
    pub server: ServerConfig,
}

/// Fair-share queue and processor tuning.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueConfig {
    /// Upper bound on simultaneously active crawl workers.
    pub max_concurrent_scans: usize,
    /// Admission fails with `QueueFull` at this many queued jobs.
    pub max_queue_size: usize,
    /// Admission fails with `IpLimit` at this many queued-or-processing jobs
    /// from one submitter.
    pub max_queued_jobs_per_ip: usize,
    /// Width of one fairness slot in seconds. A submitter's k-th job is
    /// scored one slot behind everyone else's (k-1)-th within this window.
    pub fairness_slot_secs: i64,
    /// Seconds subtracted from a waiting job's score per aging pass.
    pub aging_boost_secs: i64,
    /// Jobs must have waited at least this long before aging touches them.
    pub aging_min_wait_secs: i64,
    /// Cadence of the background aging pass.
    pub aging_interval_secs: u64,
    /// Per-IP cooldown after a scan finishes before the next admission.
    pub cooldown_secs: u64,
    /// Queue processor poll interval.
    pub processor_tick_ms: u64,
    /// Pages assumed per queued-but-unstarted job when estimating wait time.
    pub default_pages_estimate: i64,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            max_concurrent_scans: 2,
            max_queue_size: 100,
            max_queued_jobs_per_ip: 3,
            fairness_slot_secs: 3600,
            aging_boost_secs: 30,
            aging_min_wait_secs: 300,
            aging_interval_secs: 300,
            cooldown_secs: 60,
            processor_tick_ms: 1000,
            default_pages_estimate: 25,
        }
    }
}

/// Crawl engine limits and timings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CrawlerConfig {
    /// Hard cap on visited pages per scan; hitting it completes the scan
    /// with the page-limit flag set.
    pub max_pages_per_scan: usize,
    /// Per-page navigation timeout, nested under the worker deadline.
    pub page_timeout_secs: u64,
    /// Worker deadline; expiry fails the scan with a timeout error.
    pub max_scan_duration_secs: u64,
    /// Self-throttle between page visits. Robots crawl-delay can only
    /// lengthen this, never shorten it.
    pub delay_between_pages_ms: u64,
    /// Window with no outstanding network requests that counts as quiet.
    pub network_idle_ms: u64,
    /// Hard cap on the quiescence wait, chatty pages included.
    pub max_settle_wait_ms: u64,
    /// Post-settle grace so in-flight image responses can land.
    pub response_grace_ms: u64,
    /// Progressively scroll the page to trigger lazy-loaded images.
    pub scroll_for_lazy_images: bool,
    /// Retries per page for transient failures (network, 5xx, 429).
    pub max_retries: u32,
    /// First backoff step; doubles per attempt with jitter.
    pub retry_base_delay_ms: u64,
    /// Single responses above this are dropped by policy.
    pub per_request_size_cap_bytes: i64,
    /// Cumulative response budget per page; beyond it the page is partial.
    pub per_page_size_cap_bytes: i64,
    /// Response-count budget per page; beyond it the page is partial.
    pub per_page_request_cap: usize,
    /// Checkpoint cadence in visited pages.
    pub checkpoint_interval_pages: usize,
    /// Off-origin hosts (CDNs) whose images are still admitted.
    pub allowed_external_domains: Vec<String>,
    pub respect_robots_txt: bool,
    pub user_agent: String,
    pub browser: BrowserPolicy,
}

impl Default for CrawlerConfig {
    fn default() -> Self {
        Self {
            max_pages_per_scan: 50,
            page_timeout_secs: 30,
            max_scan_duration_secs: 600,
            delay_between_pages_ms: 250,
            network_idle_ms: 500,
            max_settle_wait_ms: 5000,
            response_grace_ms: 300,
            scroll_for_lazy_images: true,
            max_retries: 2,
            retry_base_delay_ms: 500,
            per_request_size_cap_bytes: 20 * 1024 * 1024,
            per_page_size_cap_bytes: 100 * 1024 * 1024,
            per_page_request_cap: 500,
            checkpoint_interval_pages: 10,
            allowed_external_domains: Vec::new(),
            respect_robots_txt: true,
            user_agent: DESKTOP_USER_AGENT.to_string(),
            browser: BrowserPolicy::default(),
        }
    }
}

/// Launch policy for the per-scan browser instance.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BrowserPolicy {
    pub headless: bool,
    /// Chromium sandbox; off by default for container deployments.
    pub sandbox: bool,
    pub window_width: u32,
    pub window_height: u32,
    /// `--js-flags=--max-old-space-size` bound in megabytes.
    pub memory_limit_mb: Option<u32>,
}

impl Default for BrowserPolicy {
    fn default() -> Self {
        Self {
            headless: true,
            sandbox: false,
            window_width: 1920,
            window_height: 1080,
            memory_limit_mb: Some(512),
        }
    }
}

/// Ingress and admission hardening.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SecurityConfig {
    /// Fixed-window per-IP request budget on the HTTP surface.
    pub max_requests_per_minute: u32,
    /// Reject plain-http submissions outright.
    pub enforce_https: bool,
}

impl Default for SecurityConfig {
    fn default() -> Self {
        Self {
            max_requests_per_minute: 30,
            enforce_https: false,
        }
    }
}

/// Retention windows for completed scans and derived artifacts.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetentionConfig {
    /// Completed/failed scans older than this are purged.
    pub retention_hours: i64,
    pub sweep_interval_secs: u64,
    /// Upper bound on deletions per sweeper pass.
    pub max_deletes_per_run: u32,
    /// Directory holding converted-image archives.
    pub bundle_dir: PathBuf,
}

impl Default for RetentionConfig {
    fn default() -> Self {
        Self {
            retention_hours: 7 * 24,
            sweep_interval_secs: 3600,
            max_deletes_per_run: 500,
            bundle_dir: PathBuf::from("./data/converted"),
        }
    }
}

/// Process-level wiring.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    pub bind_addr: String,
    /// Embedded SQLite database file.
    pub db_path: PathBuf,
    /// Feature flag surfaced to the UI via `GET /api/config`.
    pub email_enabled: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "0.0.0.0:8080".to_string(),
            db_path: PathBuf::from("./data/webpscan.sqlite"),
            email_enabled: false,
        }
    }
}

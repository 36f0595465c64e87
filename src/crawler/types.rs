//! Crawl engine types: errors, network observations, and run outcomes.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::store::StoreError;

/// Crawl failures. Page-granularity kinds are recorded against the page and
/// never abort the scan; only seed failures, launch failures, cancellation,
/// the worker deadline, and storage loss are scan-fatal.
#[derive(Debug, thiserror::Error)]
pub enum CrawlError {
    #[error("browser could not be launched: {0}")]
    BrowserLaunch(String),

    #[error("navigation timed out")]
    NavigationTimeout,

    #[error("navigation failed: {0}")]
    NavigationError(String),

    #[error("page responded with http {0}")]
    HttpStatus(u16),

    #[error("page requires authentication")]
    AuthRequired,

    #[error("page response size budget exceeded")]
    SizeCapExceeded,

    #[error("page request count budget exceeded")]
    RequestCountExceeded,

    #[error("host blocked by connect-time validation")]
    BlockedHost,

    #[error("disallowed by robots.txt")]
    RobotsDisallowed,

    #[error("scan cancelled")]
    Cancelled,

    #[error("scan deadline exceeded")]
    Timeout,

    #[error(transparent)]
    Store(#[from] StoreError),
}

impl CrawlError {
    /// Stable machine-readable code for logs and skip records.
    #[must_use]
    pub fn code(&self) -> &'static str {
        match self {
            Self::BrowserLaunch(_) => "BrowserLaunch",
            Self::NavigationTimeout => "NavigationTimeout",
            Self::NavigationError(_) => "NavigationError",
            Self::HttpStatus(_) => "NavigationError",
            Self::AuthRequired => "AuthRequired",
            Self::SizeCapExceeded => "SizeCapExceeded",
            Self::RequestCountExceeded => "RequestCountExceeded",
            Self::BlockedHost => "UrlBlockedHost",
            Self::RobotsDisallowed => "RobotsDisallowed",
            Self::Cancelled => "Cancelled",
            Self::Timeout => "Timeout",
            Self::Store(_) => "StorageError",
        }
    }

    /// Short curated message for user-facing failure surfaces. Raw error
    /// detail stays in logs.
    #[must_use]
    pub fn user_message(&self) -> &'static str {
        match self {
            Self::BrowserLaunch(_) => "The scanning browser could not be started.",
            Self::NavigationTimeout | Self::NavigationError(_) | Self::HttpStatus(_) => {
                "The site could not be reached."
            }
            Self::AuthRequired => "The site requires authentication.",
            Self::SizeCapExceeded | Self::RequestCountExceeded => {
                "The site exceeded scan resource limits."
            }
            Self::BlockedHost => "The site resolves to a blocked address.",
            Self::RobotsDisallowed => "The site disallows scanning.",
            Self::Cancelled => "The scan was cancelled.",
            Self::Timeout => "The scan exceeded its time limit.",
            Self::Store(_) => "An internal storage error interrupted the scan.",
        }
    }
}

/// One network response observed on a page.
#[derive(Debug, Clone, PartialEq)]
pub struct NetworkResponse {
    pub url: String,
    pub mime_type: String,
    pub status: u16,
    pub body_size: i64,
}

/// Result of a page navigation.
#[derive(Debug, Clone)]
pub struct NavigationOutcome {
    /// URL after redirects.
    pub final_url: String,
    /// HTTP status of the document response, when observed.
    pub status: Option<u16>,
}

/// Quiescence/scroll policy handed to the page session after navigation.
#[derive(Debug, Clone, Copy)]
pub struct SettlePolicy {
    pub network_idle_ms: u64,
    pub max_wait_ms: u64,
    pub grace_ms: u64,
    pub scroll: bool,
}

/// One image sighting, emitted to the observer the first time a URL is seen
/// in a scan.
#[derive(Debug, Clone, Serialize)]
pub struct ImageHit {
    pub image_url: String,
    pub mime_type: String,
    pub size: i64,
    pub width: Option<i64>,
    pub height: Option<i64>,
    /// Page the image was first served on.
    pub page_url: String,
    pub is_non_webp: bool,
}

/// A unique image accumulated over the whole crawl.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CrawledImage {
    pub image_url: String,
    pub mime_type: String,
    pub file_size: i64,
    pub width: Option<i64>,
    pub height: Option<i64>,
    /// Ordered, deduplicated; never empty.
    pub page_urls: Vec<String>,
}

/// Counter snapshot passed with `page_completed`.
#[derive(Debug, Clone, Copy, Serialize)]
pub struct CrawlProgress {
    pub pages_scanned: i64,
    pub pages_discovered: i64,
    pub non_webp_images_found: i64,
}

/// A page skipped without contributing images or links.
#[derive(Debug, Clone, Serialize)]
pub struct SkippedPage {
    pub url: String,
    pub reason: &'static str,
}

/// Final result of a crawl run.
#[derive(Debug, Default)]
pub struct CrawlOutcome {
    pub pages_scanned: i64,
    pub pages_discovered: i64,
    pub non_webp_images_found: i64,
    pub reached_page_limit: bool,
    pub images: Vec<CrawledImage>,
    pub skipped_pages: Vec<SkippedPage>,
    /// Pages where a resource budget cut response capture short.
    pub partial_pages: i64,
}

/// Inputs for one crawl run.
#[derive(Debug)]
pub struct CrawlRequest {
    pub scan_id: Uuid,
    pub seed_url: String,
    pub resume_from: Option<crate::models::CrawlCheckpoint>,
    /// Images persisted before the interruption; seeds the image map so a
    /// resumed crawl converges on the same final set.
    pub resume_images: Vec<CrawledImage>,
}

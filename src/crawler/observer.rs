//! Progress reporting abstraction for crawl runs.
//!
//! The worker supplies an implementation that fans events into the live
//! tracker and the push layer; the engine itself never knows about either.
//! Within one scan, calls arrive in source order on the crawling task.

use uuid::Uuid;

use super::types::{CrawlError, CrawlOutcome, CrawlProgress, ImageHit};

/// Lifecycle callbacks invoked by the crawl engine.
pub trait CrawlObserver: Send + Sync {
    /// A page visit is starting.
    fn page_started(&self, scan_id: Uuid, url: &str);

    /// A page visit finished, with cumulative counters.
    fn page_completed(&self, scan_id: Uuid, url: &str, progress: &CrawlProgress);

    /// A new unique image URL was served. Repeat sightings of the same URL
    /// do not re-fire.
    fn image_found(&self, scan_id: Uuid, image: &ImageHit, non_webp_total: i64);

    /// The crawl finished and `outcome` is final.
    fn crawl_completed(&self, scan_id: Uuid, outcome: &CrawlOutcome);

    /// The crawl aborted with a scan-fatal error.
    fn crawl_failed(&self, scan_id: Uuid, error: &CrawlError);
}

/// Observer that does nothing; used by tests that only care about outcomes.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoOpObserver;

impl CrawlObserver for NoOpObserver {
    #[inline(always)]
    fn page_started(&self, _scan_id: Uuid, _url: &str) {}

    #[inline(always)]
    fn page_completed(&self, _scan_id: Uuid, _url: &str, _progress: &CrawlProgress) {}

    #[inline(always)]
    fn image_found(&self, _scan_id: Uuid, _image: &ImageHit, _non_webp_total: i64) {}

    #[inline(always)]
    fn crawl_completed(&self, _scan_id: Uuid, _outcome: &CrawlOutcome) {}

    #[inline(always)]
    fn crawl_failed(&self, _scan_id: Uuid, _error: &CrawlError) {}
}

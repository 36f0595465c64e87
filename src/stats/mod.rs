//! In-memory live statistics for scans currently in flight, merged on
//! demand with the persisted lifetime aggregates.
//!
//! Each active scan owns one record; all counter mutations on that record
//! are serialized under its own lock, while cross-scan reads take consistent
//! per-record snapshots. Sums use 64-bit signed integers, percentages 64-bit
//! floats, and negative savings are clamped before summing — identical to
//! the aggregate upsert path so merged views never disagree with themselves.

mod category;

pub use category::classify_image_url;

use std::collections::{HashMap, VecDeque};

use dashmap::DashMap;
use parking_lot::Mutex;
use serde::Serialize;
use uuid::Uuid;

use crate::models::AggregateStats;
use crate::savings::is_non_webp_raster;
use crate::store::{ScanStore, StoreError};

/// How many recent scan completions feed the seconds-per-page average.
const PAGE_RATE_WINDOW: usize = 32;

/// Live counters for one in-flight scan.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ScanCounters {
    pub pages_scanned: i64,
    pub pages_discovered: i64,
    pub images_found: i64,
    pub non_webp_images: i64,
    pub original_size: i64,
    pub estimated_webp_size: i64,
    pub savings_percent_sum: f64,
    pub by_mime: HashMap<String, LiveBucket>,
    pub by_category: HashMap<String, LiveBucket>,
}

/// Per-MIME / per-category live tallies.
#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct LiveBucket {
    pub image_count: i64,
    pub original_size: i64,
    pub estimated_webp_size: i64,
    pub savings_percent_sum: f64,
}

/// Combined live totals across every active scan.
#[derive(Debug, Clone, Default, Serialize)]
pub struct LiveTotals {
    pub active_scans: i64,
    pub pages_scanned: i64,
    pub images_found: i64,
    pub original_size: i64,
    pub estimated_webp_size: i64,
    pub savings_percent_sum: f64,
    pub by_mime: HashMap<String, LiveBucket>,
    pub by_category: HashMap<String, LiveBucket>,
}

/// Tracker service. Initialized at process start, handed to the processor
/// and the push layer; tests construct a fresh instance.
#[derive(Default)]
pub struct LiveStatsTracker {
    scans: DashMap<Uuid, Mutex<ScanCounters>>,
    page_rates: Mutex<VecDeque<f64>>,
}

impl LiveStatsTracker {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a scan; idempotent.
    pub fn start(&self, scan_id: Uuid) {
        self.scans.entry(scan_id).or_default();
    }

    /// Drop a scan's live record, optionally feeding its page rate into the
    /// wait estimator.
    pub fn stop(&self, scan_id: Uuid, duration_secs: Option<f64>) {
        if let Some((_, record)) = self.scans.remove(&scan_id) {
            if let Some(secs) = duration_secs {
                let pages = record.lock().pages_scanned;
                if pages > 0 && secs > 0.0 {
                    let mut rates = self.page_rates.lock();
                    rates.push_back(secs / pages as f64);
                    while rates.len() > PAGE_RATE_WINDOW {
                        rates.pop_front();
                    }
                }
            }
        }
    }

    pub fn update_pages(&self, scan_id: Uuid, scanned: i64, discovered: i64) {
        if let Some(record) = self.scans.get(&scan_id) {
            let mut counters = record.lock();
            counters.pages_scanned = scanned;
            counters.pages_discovered = discovered;
        }
    }

    /// Fold one image sighting into the scan's counters.
    pub fn add_image(
        &self,
        scan_id: Uuid,
        mime: &str,
        url: &str,
        size: i64,
        webp_size: i64,
        savings_percent: f64,
    ) {
        let Some(record) = self.scans.get(&scan_id) else {
            return;
        };
        let included = is_non_webp_raster(mime);
        let savings = savings_percent.max(0.0);

        let mut counters = record.lock();
        counters.images_found += 1;
        if !included {
            return;
        }
        counters.non_webp_images += 1;
        counters.original_size += size;
        counters.estimated_webp_size += webp_size;
        counters.savings_percent_sum += savings;

        let mime_bucket = counters.by_mime.entry(mime.to_string()).or_default();
        mime_bucket.image_count += 1;
        mime_bucket.original_size += size;
        mime_bucket.estimated_webp_size += webp_size;
        mime_bucket.savings_percent_sum += savings;

        let category = classify_image_url(url).label().to_string();
        let cat_bucket = counters.by_category.entry(category).or_default();
        cat_bucket.image_count += 1;
        cat_bucket.original_size += size;
        cat_bucket.estimated_webp_size += webp_size;
        cat_bucket.savings_percent_sum += savings;
    }

    /// Consistent snapshot of one scan's counters.
    #[must_use]
    pub fn snapshot(&self, scan_id: Uuid) -> Option<ScanCounters> {
        self.scans.get(&scan_id).map(|record| record.lock().clone())
    }

    /// Combined totals across all active scans.
    #[must_use]
    pub fn combined_live(&self) -> LiveTotals {
        let mut totals = LiveTotals::default();
        for record in self.scans.iter() {
            let counters = record.lock().clone();
            totals.active_scans += 1;
            totals.pages_scanned += counters.pages_scanned;
            totals.images_found += counters.non_webp_images;
            totals.original_size += counters.original_size;
            totals.estimated_webp_size += counters.estimated_webp_size;
            totals.savings_percent_sum += counters.savings_percent_sum;
            for (mime, bucket) in counters.by_mime {
                merge_bucket(totals.by_mime.entry(mime).or_default(), bucket);
            }
            for (category, bucket) in counters.by_category {
                merge_bucket(totals.by_category.entry(category).or_default(), bucket);
            }
        }
        totals
    }

    /// Mean seconds per page over recent completions; `None` until the first
    /// scan has finished.
    #[must_use]
    pub fn avg_secs_per_page(&self) -> Option<f64> {
        let rates = self.page_rates.lock();
        if rates.is_empty() {
            return None;
        }
        Some(rates.iter().sum::<f64>() / rates.len() as f64)
    }

    /// Remaining-page total across in-flight scans, for wait estimation.
    #[must_use]
    pub fn remaining_pages_live(&self, max_pages_per_scan: i64) -> i64 {
        self.scans
            .iter()
            .map(|record| {
                let counters = record.lock();
                (max_pages_per_scan - counters.pages_scanned).max(0)
            })
            .sum()
    }
}

fn merge_bucket(into: &mut LiveBucket, from: LiveBucket) {
    into.image_count += from.image_count;
    into.original_size += from.original_size;
    into.estimated_webp_size += from.estimated_webp_size;
    into.savings_percent_sum += from.savings_percent_sum;
}

/// Persisted lifetime aggregates with the live totals folded on top: the
/// payload for `StatsUpdate` pushes and `GET /api/scan/stats`.
pub async fn merged_snapshot(
    store: &ScanStore,
    tracker: &LiveStatsTracker,
) -> Result<AggregateStats, StoreError> {
    let mut stats = store.fetch_aggregate_stats().await?;
    let live = tracker.combined_live();

    stats.total_pages_crawled += live.pages_scanned;
    stats.total_images_found += live.images_found;
    stats.total_original_size += live.original_size;
    stats.total_estimated_webp_size += live.estimated_webp_size;
    stats.total_savings_percent_sum += live.savings_percent_sum;

    for (mime, bucket) in live.by_mime {
        match stats.by_mime.iter_mut().find(|row| row.mime_type == mime) {
            Some(row) => {
                row.image_count += bucket.image_count;
                row.original_size += bucket.original_size;
                row.estimated_webp_size += bucket.estimated_webp_size;
                row.savings_percent_sum += bucket.savings_percent_sum;
            }
            None => stats.by_mime.push(crate::models::MimeStats {
                mime_type: mime,
                image_count: bucket.image_count,
                original_size: bucket.original_size,
                estimated_webp_size: bucket.estimated_webp_size,
                savings_percent_sum: bucket.savings_percent_sum,
            }),
        }
    }
    for (category, bucket) in live.by_category {
        match stats
            .by_category
            .iter_mut()
            .find(|row| row.category == category)
        {
            Some(row) => {
                row.image_count += bucket.image_count;
                row.original_size += bucket.original_size;
                row.estimated_webp_size += bucket.estimated_webp_size;
                row.savings_percent_sum += bucket.savings_percent_sum;
            }
            None => stats.by_category.push(crate::models::CategoryStats {
                category,
                image_count: bucket.image_count,
                original_size: bucket.original_size,
                estimated_webp_size: bucket.estimated_webp_size,
                savings_percent_sum: bucket.savings_percent_sum,
            }),
        }
    }

    Ok(stats)
}

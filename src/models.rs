//! Domain types shared across the queue, crawler, store and push layers.
//!
//! Everything here is a plain value object: persistence lives in `store`,
//! mutation rules live in the services that own each aggregate.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Lifecycle of a scan job.
///
/// Exactly one terminal state is ever reached; `started_at` is stamped on the
/// transition into `Processing` and `completed_at` on the transition into
/// either terminal state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ScanStatus {
    Queued,
    Processing,
    Completed,
    Failed,
}

impl ScanStatus {
    /// Stable string form used in the `scan_jobs.status` column.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Queued => "queued",
            Self::Processing => "processing",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }

    #[must_use]
    pub fn from_str_lossy(s: &str) -> Self {
        match s {
            "processing" => Self::Processing,
            "completed" => Self::Completed,
            "failed" => Self::Failed,
            _ => Self::Queued,
        }
    }

    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }
}

/// One scan request admitted into the pool.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScanJob {
    pub scan_id: Uuid,
    pub target_url: String,
    pub email: Option<String>,
    pub status: ScanStatus,
    pub submitter_ip: Option<String>,
    /// Ordinal among queued-or-processing submissions from this IP at
    /// admission time; feeds the fair-share priority formula.
    pub submission_count: i64,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub pages_scanned: i64,
    pub pages_discovered: i64,
    pub non_webp_images_found: i64,
    pub error_message: Option<String>,
    /// Lower is earlier. Only the queue service writes this field.
    pub priority_score: i64,
    pub convert_to_webp: bool,
    pub reached_page_limit: bool,
}

impl ScanJob {
    /// Fresh job in `Queued` state. Priority is assigned by the queue.
    #[must_use]
    pub fn new(
        target_url: String,
        email: Option<String>,
        submitter_ip: Option<String>,
        convert_to_webp: bool,
    ) -> Self {
        Self {
            scan_id: Uuid::new_v4(),
            target_url,
            email,
            status: ScanStatus::Queued,
            submitter_ip,
            submission_count: 1,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
            pages_scanned: 0,
            pages_discovered: 0,
            non_webp_images_found: 0,
            error_message: None,
            priority_score: 0,
            convert_to_webp,
            reached_page_limit: false,
        }
    }
}

/// A unique image URL served during one scan.
///
/// Uniqueness is per scan; repeat sightings on other pages accumulate in
/// `page_urls` (ordered, deduplicated, never empty) instead of producing new
/// rows.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiscoveredImage {
    pub scan_job_id: Uuid,
    pub image_url: String,
    pub page_urls: Vec<String>,
    pub mime_type: String,
    pub file_size: i64,
    pub width: Option<i64>,
    pub height: Option<i64>,
    pub estimated_webp_size: i64,
    /// Clamped to `[0, 100]`; negative projections collapse to zero before
    /// any aggregation.
    pub potential_savings_percent: f64,
}

/// Persisted crawl progress snapshot. At most one per scan job.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CrawlCheckpoint {
    pub scan_job_id: Uuid,
    pub visited_urls: Vec<String>,
    pub pending_urls: Vec<String>,
    pub pages_visited: i64,
    pub pages_discovered: i64,
    pub non_webp_images_found: i64,
    pub current_url: Option<String>,
    pub updated_at: DateTime<Utc>,
}

/// Lifetime totals across all completed scans.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AggregateStats {
    pub total_scans: i64,
    pub total_pages_crawled: i64,
    pub total_images_found: i64,
    pub total_original_size: i64,
    pub total_estimated_webp_size: i64,
    /// Sum of per-image savings percentages; divide by `total_images_found`
    /// for the lifetime mean.
    pub total_savings_percent_sum: f64,
    pub by_mime: Vec<MimeStats>,
    pub by_category: Vec<CategoryStats>,
}

/// Lifetime totals for one canonical MIME type.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MimeStats {
    pub mime_type: String,
    pub image_count: i64,
    pub original_size: i64,
    pub estimated_webp_size: i64,
    pub savings_percent_sum: f64,
}

/// Lifetime totals for one image category.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CategoryStats {
    pub category: String,
    pub image_count: i64,
    pub original_size: i64,
    pub estimated_webp_size: i64,
    pub savings_percent_sum: f64,
}

/// Fixed category set for discovered images.
///
/// Classification is a case-insensitive substring lookup on the image URL;
/// the first matching category wins and unmatched URLs fall through to
/// `OtherImages`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ImageCategory {
    HeroAndBanners,
    Thumbnails,
    ProductImages,
    BlogAndArticles,
    LogosAndIcons,
    UserAvatars,
    Backgrounds,
    OtherImages,
}

impl ImageCategory {
    /// Display label, also the `aggregate_category_stats` key.
    #[must_use]
    pub fn label(&self) -> &'static str {
        match self {
            Self::HeroAndBanners => "Hero & Banners",
            Self::Thumbnails => "Thumbnails",
            Self::ProductImages => "Product Images",
            Self::BlogAndArticles => "Blog & Articles",
            Self::LogosAndIcons => "Logos & Icons",
            Self::UserAvatars => "User Avatars",
            Self::Backgrounds => "Backgrounds",
            Self::OtherImages => "Other Images",
        }
    }
}

/// A materialized converted-image archive tied to a completed scan.
///
/// Purely derived data: the retention sweeper removes expired rows and their
/// on-disk files without touching the owning scan.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConvertedImageBundle {
    pub download_id: Uuid,
    pub scan_job_id: Uuid,
    pub file_path: String,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_round_trips_through_column_form() {
        for status in [
            ScanStatus::Queued,
            ScanStatus::Processing,
            ScanStatus::Completed,
            ScanStatus::Failed,
        ] {
            assert_eq!(ScanStatus::from_str_lossy(status.as_str()), status);
        }
    }

    #[test]
    fn terminal_statuses() {
        assert!(!ScanStatus::Queued.is_terminal());
        assert!(!ScanStatus::Processing.is_terminal());
        assert!(ScanStatus::Completed.is_terminal());
        assert!(ScanStatus::Failed.is_terminal());
    }

    #[test]
    fn new_job_starts_queued_with_zero_counters() {
        let job = ScanJob::new("https://example.com".into(), None, None, false);
        assert_eq!(job.status, ScanStatus::Queued);
        assert_eq!(job.pages_scanned, 0);
        assert!(job.started_at.is_none());
        assert!(job.completed_at.is_none());
    }
}

//! Downloadable scan report assembly.
//!
//! The report is plain data; rendering beyond JSON (PDF, mail) belongs to
//! external collaborators consuming this structure.

use chrono::{DateTime, Utc};
use serde::Serialize;
use uuid::Uuid;

use crate::models::{DiscoveredImage, ScanJob};
use crate::savings::{ESTIMATE_DISCLAIMER, SavingsSummary, estimate, is_non_webp_raster};
use crate::stats::classify_image_url;
use crate::store::{ScanStore, StoreError};

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ScanReport {
    pub scan_id: Uuid,
    pub target_url: String,
    pub generated_at: DateTime<Utc>,
    pub pages_scanned: i64,
    pub pages_discovered: i64,
    /// True when a page/size budget truncated the crawl; the report is
    /// complete for everything that was visited.
    pub completed_with_warnings: bool,
    pub summary: SavingsSummary,
    pub images: Vec<ReportImage>,
    pub disclaimer: &'static str,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ReportImage {
    pub image_url: String,
    pub mime_type: String,
    pub category: &'static str,
    pub file_size: i64,
    pub estimated_webp_size: i64,
    pub potential_savings_percent: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub width: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub height: Option<i64>,
    pub page_urls: Vec<String>,
}

/// Assemble the report for a completed scan.
pub async fn build_report(store: &ScanStore, job: &ScanJob) -> Result<ScanReport, StoreError> {
    let images = store.images_for_scan(job.scan_id).await?;
    Ok(report_from_parts(job, &images))
}

fn report_from_parts(job: &ScanJob, images: &[DiscoveredImage]) -> ScanReport {
    let mut summary = SavingsSummary::default();
    let mut report_images = Vec::with_capacity(images.len());

    for image in images {
        if is_non_webp_raster(&image.mime_type) {
            let est = estimate(&image.mime_type, image.file_size);
            summary.add(image.file_size, &est);
        }
        report_images.push(ReportImage {
            image_url: image.image_url.clone(),
            mime_type: image.mime_type.clone(),
            category: classify_image_url(&image.image_url).label(),
            file_size: image.file_size,
            estimated_webp_size: image.estimated_webp_size,
            potential_savings_percent: image.potential_savings_percent,
            width: image.width,
            height: image.height,
            page_urls: image.page_urls.clone(),
        });
    }

    ScanReport {
        scan_id: job.scan_id,
        target_url: job.target_url.clone(),
        generated_at: Utc::now(),
        pages_scanned: job.pages_scanned,
        pages_discovered: job.pages_discovered,
        completed_with_warnings: job.reached_page_limit,
        summary,
        images: report_images,
        disclaimer: ESTIMATE_DISCLAIMER,
    }
}

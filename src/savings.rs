//! WebP conversion savings estimation from empirical compression ratios.
//!
//! Estimates are deliberately simple: projected size is the observed wire
//! size multiplied by a per-format ratio measured over large conversion
//! corpora. Reports carrying these numbers must include
//! [`ESTIMATE_DISCLAIMER`].

use serde::Serialize;

/// Shown verbatim on every report that carries projected sizes.
pub const ESTIMATE_DISCLAIMER: &str = "Projected WebP sizes are estimates derived from \
empirical compression ratios and will vary with image content and encoder settings.";

/// Empirical projected-size ratio for a source MIME type, or `None` when the
/// format is excluded from the optimization set (already modern, or vector).
#[must_use]
pub fn webp_ratio(mime: &str) -> Option<f64> {
    match normalize_mime(mime).as_str() {
        "image/png" => Some(0.26),
        "image/jpeg" | "image/jpg" => Some(0.75),
        "image/gif" => Some(0.50),
        "image/bmp" => Some(0.30),
        "image/tiff" => Some(0.35),
        _ => None,
    }
}

/// Whether this MIME type counts toward the non-WebP raster set.
#[must_use]
pub fn is_non_webp_raster(mime: &str) -> bool {
    webp_ratio(mime).is_some()
}

/// Canonical MIME form: lowercased, parameters stripped.
#[must_use]
pub fn normalize_mime(mime: &str) -> String {
    mime.split(';').next().unwrap_or("").trim().to_lowercase()
}

/// Per-image estimate.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Estimate {
    pub estimated_webp_size: i64,
    /// `max(0, 100 * (original - estimated) / original)`.
    pub savings_percent: f64,
    /// False for formats excluded from the optimization set; their estimate
    /// equals the original size and they contribute nothing to summaries.
    pub included: bool,
}

/// Estimate the converted size of one image.
#[must_use]
pub fn estimate(mime: &str, file_size: i64) -> Estimate {
    match webp_ratio(mime) {
        Some(ratio) if file_size > 0 => {
            let projected = (file_size as f64 * ratio).round() as i64;
            let savings =
                (100.0 * (file_size - projected) as f64 / file_size as f64).max(0.0);
            Estimate {
                estimated_webp_size: projected,
                savings_percent: savings,
                included: true,
            }
        }
        Some(_) => Estimate {
            estimated_webp_size: 0,
            savings_percent: 0.0,
            included: true,
        },
        None => Estimate {
            estimated_webp_size: file_size,
            savings_percent: 0.0,
            included: false,
        },
    }
}

/// Materialize crawl-collected images as storable records with estimates
/// applied. Excluded formats are kept (they are part of the inventory) with
/// a zero-savings estimate.
#[must_use]
pub fn discovered_from_crawl(
    scan_id: uuid::Uuid,
    images: &[crate::crawler::CrawledImage],
) -> Vec<crate::models::DiscoveredImage> {
    images
        .iter()
        .map(|image| {
            let est = estimate(&image.mime_type, image.file_size);
            crate::models::DiscoveredImage {
                scan_job_id: scan_id,
                image_url: image.image_url.clone(),
                page_urls: image.page_urls.clone(),
                mime_type: normalize_mime(&image.mime_type),
                file_size: image.file_size,
                width: image.width,
                height: image.height,
                estimated_webp_size: est.estimated_webp_size,
                potential_savings_percent: est.savings_percent,
            }
        })
        .collect()
}

/// Scan-level rollup over included (non-WebP raster) images.
#[derive(Debug, Clone, Default, Serialize)]
pub struct SavingsSummary {
    pub image_count: i64,
    pub total_original_size: i64,
    pub total_estimated_webp_size: i64,
    pub total_savings_bytes: i64,
    /// Simple mean over included images.
    pub mean_savings_percent: f64,
    /// Sum of per-image percentages, kept for aggregate-stats deltas.
    pub savings_percent_sum: f64,
}

impl SavingsSummary {
    /// Fold one included image into the rollup. Excluded images must not be
    /// passed here.
    pub fn add(&mut self, file_size: i64, estimate: &Estimate) {
        debug_assert!(estimate.included);
        self.image_count += 1;
        self.total_original_size += file_size;
        self.total_estimated_webp_size += estimate.estimated_webp_size;
        self.total_savings_bytes += (file_size - estimate.estimated_webp_size).max(0);
        self.savings_percent_sum += estimate.savings_percent;
        self.mean_savings_percent = self.savings_percent_sum / self.image_count as f64;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ratios_match_the_published_table() {
        assert_eq!(webp_ratio("image/png"), Some(0.26));
        assert_eq!(webp_ratio("image/jpeg"), Some(0.75));
        assert_eq!(webp_ratio("image/jpg"), Some(0.75));
        assert_eq!(webp_ratio("image/gif"), Some(0.50));
        assert_eq!(webp_ratio("image/bmp"), Some(0.30));
        assert_eq!(webp_ratio("image/tiff"), Some(0.35));
    }

    #[test]
    fn modern_and_vector_formats_are_excluded() {
        for excluded in ["image/webp", "image/avif", "image/svg+xml"] {
            assert!(webp_ratio(excluded).is_none());
            let e = estimate(excluded, 1000);
            assert!(!e.included);
            assert_eq!(e.estimated_webp_size, 1000);
            assert_eq!(e.savings_percent, 0.0);
        }
    }

    #[test]
    fn mime_parameters_are_ignored() {
        assert_eq!(webp_ratio("image/PNG; charset=binary"), Some(0.26));
        assert!(is_non_webp_raster("IMAGE/JPEG"));
    }

    #[test]
    fn png_and_jpeg_thousand_byte_fixtures() {
        let png = estimate("image/png", 1000);
        assert_eq!(png.estimated_webp_size, 260);
        assert!((png.savings_percent - 74.0).abs() < f64::EPSILON);

        let jpg = estimate("image/jpeg", 1000);
        assert_eq!(jpg.estimated_webp_size, 750);
        assert!((jpg.savings_percent - 25.0).abs() < f64::EPSILON);
    }

    #[test]
    fn summary_over_mixed_scan_matches_hand_math() {
        let mut summary = SavingsSummary::default();
        let png = estimate("image/png", 1000);
        let jpg = estimate("image/jpeg", 1000);
        summary.add(1000, &png);
        summary.add(1000, &jpg);

        assert_eq!(summary.image_count, 2);
        assert_eq!(summary.total_savings_bytes, 990);
        assert!((summary.mean_savings_percent - 49.5).abs() < 0.5);
    }

    #[test]
    fn zero_byte_image_never_divides_by_zero() {
        let e = estimate("image/png", 0);
        assert!(e.included);
        assert_eq!(e.estimated_webp_size, 0);
        assert_eq!(e.savings_percent, 0.0);
    }
}

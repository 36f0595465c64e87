//! Retention sweepers.
//!
//! Two periodic, idempotent passes: one purges terminal scans (children
//! cascade) older than the retention window, the other removes expired
//! converted-image bundles and their on-disk archives. Both bound the work
//! per pass and exit promptly on shutdown.

use std::path::Path;

use chrono::{Duration as ChronoDuration, Utc};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::RetentionConfig;
use crate::store::ScanStore;

/// Purge terminal scans past the retention window. Returns deleted count.
pub async fn sweep_expired_scans(
    store: &ScanStore,
    config: &RetentionConfig,
) -> Result<usize, crate::store::StoreError> {
    let cutoff = Utc::now() - ChronoDuration::hours(config.retention_hours);
    let deleted = store
        .delete_terminal_before(cutoff, config.max_deletes_per_run as i64)
        .await?;
    if !deleted.is_empty() {
        info!(count = deleted.len(), "retention sweep removed scans");
    }
    Ok(deleted.len())
}

/// Remove expired bundle rows and their archive files. File removal errors
/// are logged and do not block the row delete — a missing file is already
/// the desired end state.
pub async fn sweep_expired_bundles(
    store: &ScanStore,
    config: &RetentionConfig,
) -> Result<usize, crate::store::StoreError> {
    let expired = store
        .expired_bundles(Utc::now(), config.max_deletes_per_run as i64)
        .await?;
    let count = expired.len();

    for bundle in expired {
        let path = Path::new(&bundle.file_path);
        if path.exists() {
            if let Err(e) = tokio::fs::remove_file(path).await {
                warn!(path = %bundle.file_path, "bundle file removal failed: {e}");
            }
        }
        store.delete_bundle(bundle.download_id).await?;
        debug!(download_id = %bundle.download_id, "expired bundle removed");
    }

    if count > 0 {
        info!(count, "bundle sweep removed archives");
    }
    Ok(count)
}

/// Run both sweepers on the configured cadence until shutdown.
pub fn spawn_sweepers(
    store: ScanStore,
    config: RetentionConfig,
    shutdown: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let interval = std::time::Duration::from_secs(config.sweep_interval_secs);
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = tokio::time::sleep(interval) => {}
            }
            if let Err(e) = sweep_expired_scans(&store, &config).await {
                warn!("scan retention sweep failed: {e}");
            }
            if let Err(e) = sweep_expired_bundles(&store, &config).await {
                warn!("bundle sweep failed: {e}");
            }
        }
        debug!("sweepers stopped");
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{ConvertedImageBundle, ScanJob, ScanStatus};
    use uuid::Uuid;

    #[tokio::test]
    async fn scan_sweep_is_idempotent() {
        let store = ScanStore::open_in_memory().await.unwrap();
        let config = RetentionConfig::default();

        let job = ScanJob::new("https://example.com".into(), None, None, false);
        store.insert_job(&job).await.unwrap();
        let long_ago = Utc::now() - ChronoDuration::days(30);
        store.mark_processing(job.scan_id, long_ago).await.unwrap();
        store
            .mark_terminal(job.scan_id, ScanStatus::Completed, long_ago, None)
            .await
            .unwrap();

        assert_eq!(sweep_expired_scans(&store, &config).await.unwrap(), 1);
        assert_eq!(sweep_expired_scans(&store, &config).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn bundle_sweep_removes_row_and_file() {
        let store = ScanStore::open_in_memory().await.unwrap();
        let config = RetentionConfig::default();
        let dir = tempfile::tempdir().unwrap();

        let job = ScanJob::new("https://example.com".into(), None, None, true);
        store.insert_job(&job).await.unwrap();

        let archive = dir.path().join("bundle.zip");
        tokio::fs::write(&archive, b"zipbytes").await.unwrap();
        let bundle = ConvertedImageBundle {
            download_id: Uuid::new_v4(),
            scan_job_id: job.scan_id,
            file_path: archive.to_string_lossy().into_owned(),
            created_at: Utc::now() - ChronoDuration::hours(48),
            expires_at: Utc::now() - ChronoDuration::hours(1),
        };
        store.insert_bundle(&bundle).await.unwrap();

        assert_eq!(sweep_expired_bundles(&store, &config).await.unwrap(), 1);
        assert!(!archive.exists());
        assert!(store.fetch_bundle(bundle.download_id).await.unwrap().is_none());

        // Interrupted/repeated sweeps are harmless.
        assert_eq!(sweep_expired_bundles(&store, &config).await.unwrap(), 0);
    }
}

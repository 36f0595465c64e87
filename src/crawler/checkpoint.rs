//! Checkpoint assembly and the persistence seam.
//!
//! The engine snapshots `{visited, pending, counters, current}` every
//! `checkpoint_interval_pages` pages through a [`CheckpointSink`]; the
//! production sink writes through the store, tests capture in memory.
//! On resume the engine restores both sets; the in-flight URL (never counted
//! as visited) goes back to the front of pending, and the seed is
//! re-enqueued only if a torn checkpoint lost it.

use async_trait::async_trait;
use chrono::Utc;
use uuid::Uuid;

use crate::models::CrawlCheckpoint;
use crate::savings::discovered_from_crawl;
use crate::store::{ScanStore, StoreError};

use super::types::CrawledImage;

/// Where checkpoint snapshots go.
#[async_trait]
pub trait CheckpointSink: Send + Sync {
    async fn save(
        &self,
        checkpoint: &CrawlCheckpoint,
        images: &[CrawledImage],
    ) -> Result<(), StoreError>;
}

/// Store-backed sink used in production.
pub struct StoreCheckpointSink {
    store: ScanStore,
}

impl StoreCheckpointSink {
    #[must_use]
    pub fn new(store: ScanStore) -> Self {
        Self { store }
    }
}

#[async_trait]
impl CheckpointSink for StoreCheckpointSink {
    async fn save(
        &self,
        checkpoint: &CrawlCheckpoint,
        images: &[CrawledImage],
    ) -> Result<(), StoreError> {
        self.store.upsert_checkpoint(checkpoint).await?;
        // Images collected so far are persisted with the snapshot; a resumed
        // crawl reloads them so the final set matches a single-shot run.
        let discovered = discovered_from_crawl(checkpoint.scan_job_id, images);
        self.store
            .replace_images_for_scan(checkpoint.scan_job_id, &discovered)
            .await?;
        // Progress counters on the job row track the checkpoint so status
        // polls stay truthful across restarts.
        self.store
            .update_progress(
                checkpoint.scan_job_id,
                checkpoint.pages_visited,
                checkpoint.pages_discovered,
                checkpoint.non_webp_images_found,
            )
            .await
    }
}

/// Sink that drops snapshots; for tests that do not exercise resume.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoOpCheckpointSink;

#[async_trait]
impl CheckpointSink for NoOpCheckpointSink {
    async fn save(
        &self,
        _checkpoint: &CrawlCheckpoint,
        _images: &[CrawledImage],
    ) -> Result<(), StoreError> {
        Ok(())
    }
}

/// Build a snapshot from engine state.
#[must_use]
pub fn build_checkpoint(
    scan_id: Uuid,
    visited: &[String],
    pending: &std::collections::VecDeque<String>,
    pages_visited: i64,
    pages_discovered: i64,
    non_webp_images_found: i64,
    current_url: Option<&str>,
) -> CrawlCheckpoint {
    CrawlCheckpoint {
        scan_job_id: scan_id,
        visited_urls: visited.to_vec(),
        pending_urls: pending.iter().cloned().collect(),
        pages_visited,
        pages_discovered,
        non_webp_images_found,
        current_url: current_url.map(str::to_string),
        updated_at: Utc::now(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::ScanJob;
    use std::collections::VecDeque;

    #[tokio::test]
    async fn store_sink_persists_snapshot_and_progress() {
        let store = ScanStore::open_in_memory().await.unwrap();
        let job = ScanJob::new("https://example.com".into(), None, None, false);
        store.insert_job(&job).await.unwrap();

        let pending: VecDeque<String> = ["https://example.com/b".to_string()].into();
        let cp = build_checkpoint(
            job.scan_id,
            &["https://example.com/".to_string()],
            &pending,
            1,
            2,
            3,
            Some("https://example.com/b"),
        );

        let images = vec![CrawledImage {
            image_url: "https://example.com/a.png".into(),
            mime_type: "image/png".into(),
            file_size: 1000,
            width: None,
            height: None,
            page_urls: vec!["https://example.com/".into()],
        }];
        let sink = StoreCheckpointSink::new(store.clone());
        sink.save(&cp, &images).await.unwrap();

        let loaded = store.fetch_checkpoint(job.scan_id).await.unwrap().unwrap();
        assert_eq!(loaded.pending_urls, vec!["https://example.com/b"]);
        assert_eq!(loaded.current_url.as_deref(), Some("https://example.com/b"));

        let refreshed = store.fetch_job(job.scan_id).await.unwrap();
        assert_eq!(refreshed.pages_scanned, 1);
        assert_eq!(refreshed.pages_discovered, 2);
        assert_eq!(refreshed.non_webp_images_found, 3);

        let persisted_images = store.images_for_scan(job.scan_id).await.unwrap();
        assert_eq!(persisted_images.len(), 1);
        assert_eq!(persisted_images[0].estimated_webp_size, 260);
    }
}

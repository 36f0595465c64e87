//! Crawl checkpoint persistence: at most one row per scan, JSON-encoded
//! visited/pending sets, overwritten in place on every checkpoint tick.

use sqlx::Row;
use uuid::Uuid;

use crate::models::CrawlCheckpoint;

use super::{ScanStore, StoreError, parse_ts};

impl ScanStore {
    pub async fn upsert_checkpoint(&self, cp: &CrawlCheckpoint) -> Result<(), StoreError> {
        let visited = serde_json::to_string(&cp.visited_urls)
            .map_err(|e| StoreError::Corrupted(format!("visited encode: {e}")))?;
        let pending = serde_json::to_string(&cp.pending_urls)
            .map_err(|e| StoreError::Corrupted(format!("pending encode: {e}")))?;

        sqlx::query(
            "INSERT INTO crawl_checkpoints (scan_job_id, visited_urls, pending_urls, \
             pages_visited, pages_discovered, non_webp_images_found, current_url, updated_at) \
             VALUES (?, ?, ?, ?, ?, ?, ?, ?) \
             ON CONFLICT(scan_job_id) DO UPDATE SET \
                 visited_urls = excluded.visited_urls, \
                 pending_urls = excluded.pending_urls, \
                 pages_visited = excluded.pages_visited, \
                 pages_discovered = excluded.pages_discovered, \
                 non_webp_images_found = excluded.non_webp_images_found, \
                 current_url = excluded.current_url, \
                 updated_at = excluded.updated_at",
        )
        .bind(cp.scan_job_id.to_string())
        .bind(visited)
        .bind(pending)
        .bind(cp.pages_visited)
        .bind(cp.pages_discovered)
        .bind(cp.non_webp_images_found)
        .bind(&cp.current_url)
        .bind(cp.updated_at.to_rfc3339())
        .execute(self.pool())
        .await?;
        Ok(())
    }

    pub async fn fetch_checkpoint(
        &self,
        scan_id: Uuid,
    ) -> Result<Option<CrawlCheckpoint>, StoreError> {
        let row = sqlx::query(
            "SELECT visited_urls, pending_urls, pages_visited, pages_discovered, \
             non_webp_images_found, current_url, updated_at \
             FROM crawl_checkpoints WHERE scan_job_id = ?",
        )
        .bind(scan_id.to_string())
        .fetch_optional(self.pool())
        .await?;

        let Some(row) = row else {
            return Ok(None);
        };

        let visited_raw: String = row.try_get("visited_urls")?;
        let pending_raw: String = row.try_get("pending_urls")?;
        let updated_raw: String = row.try_get("updated_at")?;

        Ok(Some(CrawlCheckpoint {
            scan_job_id: scan_id,
            visited_urls: serde_json::from_str(&visited_raw)
                .map_err(|e| StoreError::Corrupted(format!("visited decode: {e}")))?,
            pending_urls: serde_json::from_str(&pending_raw)
                .map_err(|e| StoreError::Corrupted(format!("pending decode: {e}")))?,
            pages_visited: row.try_get("pages_visited")?,
            pages_discovered: row.try_get("pages_discovered")?,
            non_webp_images_found: row.try_get("non_webp_images_found")?,
            current_url: row.try_get("current_url")?,
            updated_at: parse_ts(&updated_raw)?,
        }))
    }

    pub async fn delete_checkpoint(&self, scan_id: Uuid) -> Result<(), StoreError> {
        sqlx::query("DELETE FROM crawl_checkpoints WHERE scan_job_id = ?")
            .bind(scan_id.to_string())
            .execute(self.pool())
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::ScanJob;
    use chrono::Utc;

    #[tokio::test]
    async fn checkpoint_round_trip_recovers_everything() {
        let store = ScanStore::open_in_memory().await.unwrap();
        let job = ScanJob::new("https://example.com".into(), None, None, false);
        store.insert_job(&job).await.unwrap();

        let cp = CrawlCheckpoint {
            scan_job_id: job.scan_id,
            visited_urls: vec![
                "https://example.com/".into(),
                "https://example.com/about".into(),
            ],
            pending_urls: vec!["https://example.com/shop".into()],
            pages_visited: 2,
            pages_discovered: 3,
            non_webp_images_found: 5,
            current_url: Some("https://example.com/shop".into()),
            updated_at: Utc::now(),
        };
        store.upsert_checkpoint(&cp).await.unwrap();

        let loaded = store.fetch_checkpoint(job.scan_id).await.unwrap().unwrap();
        assert_eq!(loaded.visited_urls, cp.visited_urls);
        assert_eq!(loaded.pending_urls, cp.pending_urls);
        assert_eq!(loaded.pages_visited, 2);
        assert_eq!(loaded.pages_discovered, 3);
        assert_eq!(loaded.non_webp_images_found, 5);
        assert_eq!(loaded.current_url, cp.current_url);
    }

    #[tokio::test]
    async fn upsert_overwrites_the_single_row() {
        let store = ScanStore::open_in_memory().await.unwrap();
        let job = ScanJob::new("https://example.com".into(), None, None, false);
        store.insert_job(&job).await.unwrap();

        let mut cp = CrawlCheckpoint {
            scan_job_id: job.scan_id,
            visited_urls: vec!["https://example.com/".into()],
            pending_urls: vec![],
            pages_visited: 1,
            pages_discovered: 1,
            non_webp_images_found: 0,
            current_url: None,
            updated_at: Utc::now(),
        };
        store.upsert_checkpoint(&cp).await.unwrap();

        cp.pages_visited = 7;
        cp.visited_urls.push("https://example.com/b".into());
        store.upsert_checkpoint(&cp).await.unwrap();

        let loaded = store.fetch_checkpoint(job.scan_id).await.unwrap().unwrap();
        assert_eq!(loaded.pages_visited, 7);
        assert_eq!(loaded.visited_urls.len(), 2);
    }

    #[tokio::test]
    async fn missing_checkpoint_is_none() {
        let store = ScanStore::open_in_memory().await.unwrap();
        assert!(store.fetch_checkpoint(Uuid::new_v4()).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn delete_is_idempotent() {
        let store = ScanStore::open_in_memory().await.unwrap();
        let job = ScanJob::new("https://example.com".into(), None, None, false);
        store.insert_job(&job).await.unwrap();
        store.delete_checkpoint(job.scan_id).await.unwrap();
        store.delete_checkpoint(job.scan_id).await.unwrap();
    }
}

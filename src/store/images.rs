//! Discovered-image persistence. `page_urls` is a JSON-encoded array column,
//! materialized on read — no lazy loading behind field access.

use sqlx::Row;
use sqlx::sqlite::SqliteRow;
use uuid::Uuid;

use crate::models::DiscoveredImage;

use super::{ScanStore, StoreError};

fn image_from_row(row: &SqliteRow) -> Result<DiscoveredImage, StoreError> {
    let scan_id: String = row.try_get("scan_job_id")?;
    let page_urls_raw: String = row.try_get("page_urls")?;
    let page_urls: Vec<String> = serde_json::from_str(&page_urls_raw)
        .map_err(|e| StoreError::Corrupted(format!("bad page_urls json: {e}")))?;

    Ok(DiscoveredImage {
        scan_job_id: Uuid::parse_str(&scan_id)
            .map_err(|e| StoreError::Corrupted(format!("bad scan_job_id {scan_id:?}: {e}")))?,
        image_url: row.try_get("image_url")?,
        page_urls,
        mime_type: row.try_get("mime_type")?,
        file_size: row.try_get("file_size")?,
        width: row.try_get("width")?,
        height: row.try_get("height")?,
        estimated_webp_size: row.try_get("estimated_webp_size")?,
        potential_savings_percent: row.try_get("potential_savings_percent")?,
    })
}

impl ScanStore {
    /// Replace the full image set for one scan in a single transaction.
    ///
    /// Crawls produce the complete set at the end; replacing wholesale keeps
    /// re-runs (checkpoint resume included) idempotent.
    pub async fn replace_images_for_scan(
        &self,
        scan_id: Uuid,
        images: &[DiscoveredImage],
    ) -> Result<(), StoreError> {
        let mut tx = self.pool().begin().await?;

        sqlx::query("DELETE FROM discovered_images WHERE scan_job_id = ?")
            .bind(scan_id.to_string())
            .execute(&mut *tx)
            .await?;

        for image in images {
            let page_urls = serde_json::to_string(&image.page_urls)
                .map_err(|e| StoreError::Corrupted(format!("page_urls encode: {e}")))?;
            sqlx::query(
                "INSERT INTO discovered_images (scan_job_id, image_url, page_urls, \
                 mime_type, file_size, width, height, estimated_webp_size, \
                 potential_savings_percent) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)",
            )
            .bind(scan_id.to_string())
            .bind(&image.image_url)
            .bind(page_urls)
            .bind(&image.mime_type)
            .bind(image.file_size)
            .bind(image.width)
            .bind(image.height)
            .bind(image.estimated_webp_size)
            .bind(image.potential_savings_percent)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(())
    }

    /// Full image set for a scan in discovery order.
    pub async fn images_for_scan(
        &self,
        scan_id: Uuid,
    ) -> Result<Vec<DiscoveredImage>, StoreError> {
        let rows = sqlx::query(
            "SELECT scan_job_id, image_url, page_urls, mime_type, file_size, width, \
             height, estimated_webp_size, potential_savings_percent \
             FROM discovered_images WHERE scan_job_id = ? ORDER BY id ASC",
        )
        .bind(scan_id.to_string())
        .fetch_all(self.pool())
        .await?;

        rows.iter().map(image_from_row).collect()
    }

    pub async fn image_count_for_scan(&self, scan_id: Uuid) -> Result<i64, StoreError> {
        let (count,): (i64,) =
            sqlx::query_as("SELECT COUNT(*) FROM discovered_images WHERE scan_job_id = ?")
                .bind(scan_id.to_string())
                .fetch_one(self.pool())
                .await?;
        Ok(count)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{ScanJob, ScanStatus};
    use chrono::Utc;

    async fn store_with_job() -> (ScanStore, Uuid) {
        let store = ScanStore::open_in_memory().await.unwrap();
        let job = ScanJob::new("https://example.com".into(), None, None, false);
        store.insert_job(&job).await.unwrap();
        (store, job.scan_id)
    }

    fn png(scan_id: Uuid, url: &str, pages: &[&str]) -> DiscoveredImage {
        DiscoveredImage {
            scan_job_id: scan_id,
            image_url: url.into(),
            page_urls: pages.iter().map(|p| p.to_string()).collect(),
            mime_type: "image/png".into(),
            file_size: 1000,
            width: Some(800),
            height: None,
            estimated_webp_size: 260,
            potential_savings_percent: 74.0,
        }
    }

    #[tokio::test]
    async fn round_trips_images_with_page_urls() {
        let (store, scan_id) = store_with_job().await;
        let images = vec![
            png(scan_id, "https://example.com/a.png", &["https://example.com/"]),
            png(
                scan_id,
                "https://example.com/b.png",
                &["https://example.com/", "https://example.com/about"],
            ),
        ];
        store.replace_images_for_scan(scan_id, &images).await.unwrap();

        let loaded = store.images_for_scan(scan_id).await.unwrap();
        assert_eq!(loaded.len(), 2);
        assert_eq!(loaded[1].page_urls.len(), 2);
        assert_eq!(loaded[0].width, Some(800));
        assert_eq!(loaded[0].height, None);
    }

    #[tokio::test]
    async fn replace_is_idempotent() {
        let (store, scan_id) = store_with_job().await;
        let images = vec![png(scan_id, "https://example.com/a.png", &["https://example.com/"])];
        store.replace_images_for_scan(scan_id, &images).await.unwrap();
        store.replace_images_for_scan(scan_id, &images).await.unwrap();
        assert_eq!(store.image_count_for_scan(scan_id).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn cascade_removes_images_with_their_scan() {
        let (store, scan_id) = store_with_job().await;
        let images = vec![png(scan_id, "https://example.com/a.png", &["https://example.com/"])];
        store.replace_images_for_scan(scan_id, &images).await.unwrap();

        store.mark_processing(scan_id, Utc::now()).await.unwrap();
        store
            .mark_terminal(scan_id, ScanStatus::Completed, Utc::now() - chrono::Duration::days(30), None)
            .await
            .unwrap();
        store
            .delete_terminal_before(Utc::now() - chrono::Duration::days(7), 10)
            .await
            .unwrap();

        assert_eq!(store.image_count_for_scan(scan_id).await.unwrap(), 0);
    }
}

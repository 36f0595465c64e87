//! Converted-image bundle records. The archives themselves live on disk
//! under the configured bundle directory; rows here only track ownership
//! and expiry for the retention sweeper.

use chrono::{DateTime, Utc};
use sqlx::Row;
use uuid::Uuid;

use crate::models::ConvertedImageBundle;

use super::{ScanStore, StoreError, parse_ts};

impl ScanStore {
    pub async fn insert_bundle(&self, bundle: &ConvertedImageBundle) -> Result<(), StoreError> {
        sqlx::query(
            "INSERT INTO converted_image_zips \
             (download_id, scan_job_id, file_path, created_at, expires_at) \
             VALUES (?, ?, ?, ?, ?)",
        )
        .bind(bundle.download_id.to_string())
        .bind(bundle.scan_job_id.to_string())
        .bind(&bundle.file_path)
        .bind(bundle.created_at.to_rfc3339())
        .bind(bundle.expires_at.to_rfc3339())
        .execute(self.pool())
        .await?;
        Ok(())
    }

    pub async fn fetch_bundle(
        &self,
        download_id: Uuid,
    ) -> Result<Option<ConvertedImageBundle>, StoreError> {
        let row = sqlx::query(
            "SELECT download_id, scan_job_id, file_path, created_at, expires_at \
             FROM converted_image_zips WHERE download_id = ?",
        )
        .bind(download_id.to_string())
        .fetch_optional(self.pool())
        .await?;

        row.map(|row| bundle_from_row(&row)).transpose()
    }

    pub async fn fetch_bundle_for_scan(
        &self,
        scan_id: Uuid,
    ) -> Result<Option<ConvertedImageBundle>, StoreError> {
        let row = sqlx::query(
            "SELECT download_id, scan_job_id, file_path, created_at, expires_at \
             FROM converted_image_zips WHERE scan_job_id = ? ORDER BY created_at DESC LIMIT 1",
        )
        .bind(scan_id.to_string())
        .fetch_optional(self.pool())
        .await?;

        row.map(|row| bundle_from_row(&row)).transpose()
    }

    /// Expired bundle rows, oldest first, bounded per sweep.
    pub async fn expired_bundles(
        &self,
        now: DateTime<Utc>,
        limit: i64,
    ) -> Result<Vec<ConvertedImageBundle>, StoreError> {
        let rows = sqlx::query(
            "SELECT download_id, scan_job_id, file_path, created_at, expires_at \
             FROM converted_image_zips WHERE expires_at < ? \
             ORDER BY expires_at ASC LIMIT ?",
        )
        .bind(now.to_rfc3339())
        .bind(limit)
        .fetch_all(self.pool())
        .await?;

        rows.iter().map(bundle_from_row).collect()
    }

    pub async fn delete_bundle(&self, download_id: Uuid) -> Result<(), StoreError> {
        sqlx::query("DELETE FROM converted_image_zips WHERE download_id = ?")
            .bind(download_id.to_string())
            .execute(self.pool())
            .await?;
        Ok(())
    }
}

fn bundle_from_row(row: &sqlx::sqlite::SqliteRow) -> Result<ConvertedImageBundle, StoreError> {
    let download_id: String = row.try_get("download_id")?;
    let scan_job_id: String = row.try_get("scan_job_id")?;
    let created_at: String = row.try_get("created_at")?;
    let expires_at: String = row.try_get("expires_at")?;

    Ok(ConvertedImageBundle {
        download_id: Uuid::parse_str(&download_id)
            .map_err(|e| StoreError::Corrupted(format!("bad download_id: {e}")))?,
        scan_job_id: Uuid::parse_str(&scan_job_id)
            .map_err(|e| StoreError::Corrupted(format!("bad scan_job_id: {e}")))?,
        file_path: row.try_get("file_path")?,
        created_at: parse_ts(&created_at)?,
        expires_at: parse_ts(&expires_at)?,
    })
}

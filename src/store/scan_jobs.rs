//! Scan-job queries: the contracts the fair-share queue and the processor
//! are built on.
//!
//! Ordering is always the lexicographic pair `(priority_score, created_at)`,
//! ascending; `created_at` is stored as RFC3339 text which compares
//! correctly as a string.

use chrono::{DateTime, Utc};
use sqlx::Row;
use sqlx::sqlite::SqliteRow;
use uuid::Uuid;

use crate::models::{ScanJob, ScanStatus};

use super::{ScanStore, StoreError, parse_ts, parse_ts_opt};

const JOB_COLUMNS: &str = "scan_id, target_url, email, status, submitter_ip, \
submission_count, created_at, started_at, completed_at, pages_scanned, \
pages_discovered, non_webp_images_found, error_message, priority_score, \
convert_to_webp, reached_page_limit";

fn job_from_row(row: &SqliteRow) -> Result<ScanJob, StoreError> {
    let scan_id: String = row.try_get("scan_id")?;
    let status: String = row.try_get("status")?;
    let created_at: String = row.try_get("created_at")?;

    Ok(ScanJob {
        scan_id: Uuid::parse_str(&scan_id)
            .map_err(|e| StoreError::Corrupted(format!("bad scan_id {scan_id:?}: {e}")))?,
        target_url: row.try_get("target_url")?,
        email: row.try_get("email")?,
        status: ScanStatus::from_str_lossy(&status),
        submitter_ip: row.try_get("submitter_ip")?,
        submission_count: row.try_get("submission_count")?,
        created_at: parse_ts(&created_at)?,
        started_at: parse_ts_opt(row.try_get("started_at")?)?,
        completed_at: parse_ts_opt(row.try_get("completed_at")?)?,
        pages_scanned: row.try_get("pages_scanned")?,
        pages_discovered: row.try_get("pages_discovered")?,
        non_webp_images_found: row.try_get("non_webp_images_found")?,
        error_message: row.try_get("error_message")?,
        priority_score: row.try_get("priority_score")?,
        convert_to_webp: row.try_get::<i64, _>("convert_to_webp")? != 0,
        reached_page_limit: row.try_get::<i64, _>("reached_page_limit")? != 0,
    })
}

impl ScanStore {
    /// Persist a freshly admitted job.
    pub async fn insert_job(&self, job: &ScanJob) -> Result<(), StoreError> {
        sqlx::query(
            "INSERT INTO scan_jobs (scan_id, target_url, email, status, submitter_ip, \
             submission_count, created_at, priority_score, convert_to_webp) \
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(job.scan_id.to_string())
        .bind(&job.target_url)
        .bind(&job.email)
        .bind(job.status.as_str())
        .bind(&job.submitter_ip)
        .bind(job.submission_count)
        .bind(job.created_at.to_rfc3339())
        .bind(job.priority_score)
        .bind(job.convert_to_webp as i64)
        .execute(self.pool())
        .await?;
        Ok(())
    }

    pub async fn fetch_job(&self, scan_id: Uuid) -> Result<ScanJob, StoreError> {
        let row = sqlx::query(&format!(
            "SELECT {JOB_COLUMNS} FROM scan_jobs WHERE scan_id = ?"
        ))
        .bind(scan_id.to_string())
        .fetch_optional(self.pool())
        .await?
        .ok_or(StoreError::NotFound)?;

        job_from_row(&row)
    }

    /// Queued jobs, lowest `(priority_score, created_at)` first.
    pub async fn get_queued_ordered(&self, limit: i64) -> Result<Vec<ScanJob>, StoreError> {
        let rows = sqlx::query(&format!(
            "SELECT {JOB_COLUMNS} FROM scan_jobs WHERE status = 'queued' \
             ORDER BY priority_score ASC, created_at ASC LIMIT ?"
        ))
        .bind(limit)
        .fetch_all(self.pool())
        .await?;

        rows.iter().map(job_from_row).collect()
    }

    pub async fn queued_count(&self) -> Result<i64, StoreError> {
        let (count,): (i64,) =
            sqlx::query_as("SELECT COUNT(*) FROM scan_jobs WHERE status = 'queued'")
                .fetch_one(self.pool())
                .await?;
        Ok(count)
    }

    pub async fn processing_count(&self) -> Result<i64, StoreError> {
        let (count,): (i64,) =
            sqlx::query_as("SELECT COUNT(*) FROM scan_jobs WHERE status = 'processing'")
                .fetch_one(self.pool())
                .await?;
        Ok(count)
    }

    /// Queued-or-processing jobs from one submitter.
    pub async fn jobs_by_ip(&self, ip: &str) -> Result<i64, StoreError> {
        let (count,): (i64,) = sqlx::query_as(
            "SELECT COUNT(*) FROM scan_jobs \
             WHERE submitter_ip = ? AND status IN ('queued', 'processing')",
        )
        .bind(ip)
        .fetch_one(self.pool())
        .await?;
        Ok(count)
    }

    /// 1-based queue position among queued jobs, `None` when the job is not
    /// queued.
    pub async fn position_of(&self, scan_id: Uuid) -> Result<Option<i64>, StoreError> {
        let job = self.fetch_job(scan_id).await?;
        if job.status != ScanStatus::Queued {
            return Ok(None);
        }

        let (ahead,): (i64,) = sqlx::query_as(
            "SELECT COUNT(*) FROM scan_jobs WHERE status = 'queued' \
             AND (priority_score < ?1 OR (priority_score = ?1 AND created_at < ?2))",
        )
        .bind(job.priority_score)
        .bind(job.created_at.to_rfc3339())
        .fetch_one(self.pool())
        .await?;

        Ok(Some(1 + ahead))
    }

    /// Transactional batch of priority rewrites, used by aging passes.
    pub async fn update_many_priorities(
        &self,
        updates: &[(Uuid, i64)],
    ) -> Result<(), StoreError> {
        if updates.is_empty() {
            return Ok(());
        }
        let mut tx = self.pool().begin().await?;
        for (scan_id, score) in updates {
            sqlx::query(
                "UPDATE scan_jobs SET priority_score = ? WHERE scan_id = ? AND status = 'queued'",
            )
            .bind(score)
            .bind(scan_id.to_string())
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    /// Conditional Queued → Processing transition; the `status = 'queued'`
    /// guard makes concurrent dequeues settle on exactly one winner.
    pub async fn mark_processing(
        &self,
        scan_id: Uuid,
        started_at: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        let result = sqlx::query(
            "UPDATE scan_jobs SET status = 'processing', started_at = ? \
             WHERE scan_id = ? AND status = 'queued'",
        )
        .bind(started_at.to_rfc3339())
        .bind(scan_id.to_string())
        .execute(self.pool())
        .await?;
        Ok(result.rows_affected() == 1)
    }

    /// Transition into a terminal state. The non-terminal guard preserves
    /// the exactly-one-terminal-status invariant under racing writers.
    pub async fn mark_terminal(
        &self,
        scan_id: Uuid,
        status: ScanStatus,
        completed_at: DateTime<Utc>,
        error_message: Option<&str>,
    ) -> Result<(), StoreError> {
        debug_assert!(status.is_terminal());
        let result = sqlx::query(
            "UPDATE scan_jobs SET status = ?, completed_at = ?, error_message = ? \
             WHERE scan_id = ? AND status IN ('queued', 'processing')",
        )
        .bind(status.as_str())
        .bind(completed_at.to_rfc3339())
        .bind(error_message)
        .bind(scan_id.to_string())
        .execute(self.pool())
        .await?;

        if result.rows_affected() == 1 {
            Ok(())
        } else {
            Err(StoreError::NotFound)
        }
    }

    /// Live progress counters written by the owning worker.
    pub async fn update_progress(
        &self,
        scan_id: Uuid,
        pages_scanned: i64,
        pages_discovered: i64,
        non_webp_images_found: i64,
    ) -> Result<(), StoreError> {
        sqlx::query(
            "UPDATE scan_jobs SET pages_scanned = ?, pages_discovered = ?, \
             non_webp_images_found = ? WHERE scan_id = ?",
        )
        .bind(pages_scanned)
        .bind(pages_discovered)
        .bind(non_webp_images_found)
        .bind(scan_id.to_string())
        .execute(self.pool())
        .await?;
        Ok(())
    }

    pub async fn set_reached_page_limit(&self, scan_id: Uuid) -> Result<(), StoreError> {
        sqlx::query("UPDATE scan_jobs SET reached_page_limit = 1 WHERE scan_id = ?")
            .bind(scan_id.to_string())
            .execute(self.pool())
            .await?;
        Ok(())
    }

    /// Jobs that were mid-flight when the process stopped; the processor
    /// re-queues them at startup so checkpoints can resume.
    pub async fn non_terminal_jobs(&self) -> Result<Vec<ScanJob>, StoreError> {
        let rows = sqlx::query(&format!(
            "SELECT {JOB_COLUMNS} FROM scan_jobs \
             WHERE status IN ('queued', 'processing') \
             ORDER BY priority_score ASC, created_at ASC"
        ))
        .fetch_all(self.pool())
        .await?;
        rows.iter().map(job_from_row).collect()
    }

    /// Requeue a job found in `processing` after a restart.
    pub async fn requeue_stale_processing(&self, scan_id: Uuid) -> Result<(), StoreError> {
        sqlx::query(
            "UPDATE scan_jobs SET status = 'queued' \
             WHERE scan_id = ? AND status = 'processing'",
        )
        .bind(scan_id.to_string())
        .execute(self.pool())
        .await?;
        Ok(())
    }

    /// Delete terminal scans older than `cutoff`, children cascading, at
    /// most `limit` per call. Returns ids removed.
    pub async fn delete_terminal_before(
        &self,
        cutoff: DateTime<Utc>,
        limit: i64,
    ) -> Result<Vec<Uuid>, StoreError> {
        let rows: Vec<(String,)> = sqlx::query_as(
            "SELECT scan_id FROM scan_jobs \
             WHERE status IN ('completed', 'failed') AND completed_at < ? \
             ORDER BY completed_at ASC LIMIT ?",
        )
        .bind(cutoff.to_rfc3339())
        .bind(limit)
        .fetch_all(self.pool())
        .await?;

        let mut deleted = Vec::with_capacity(rows.len());
        let mut tx = self.pool().begin().await?;
        for (id,) in &rows {
            sqlx::query("DELETE FROM scan_jobs WHERE scan_id = ?")
                .bind(id)
                .execute(&mut *tx)
                .await?;
            if let Ok(uuid) = Uuid::parse_str(id) {
                deleted.push(uuid);
            }
        }
        tx.commit().await?;
        Ok(deleted)
    }
}

//! Persistent scan-job store over embedded SQLite.
//!
//! One database file holds every aggregate: scan jobs, discovered images,
//! crawl checkpoints, lifetime statistics, and converted-image bundles.
//! WAL mode keeps reads concurrent with the single writer; every mutation
//! runs in a transaction. Queries are runtime-checked (`sqlx::query`),
//! matching how the rest of this codebase talks to SQLite.
//!
//! Query contracts the queue and processor depend on live in
//! `scan_jobs.rs`; the retry-bounded lifetime-counter upsert is in
//! `aggregate.rs`.

mod aggregate;
mod bundles;
mod checkpoints;
mod images;
mod scan_jobs;

pub use aggregate::{AggregateDelta, RowDelta, delta_for_completed_scan};

use std::path::Path;

use chrono::{DateTime, Utc};
use sqlx::sqlite::{
    SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteSynchronous,
};
use sqlx::SqlitePool;

/// SQL schema, idempotent so startup can always run it.
const SCHEMA_SQL: &str = r#"
CREATE TABLE IF NOT EXISTS scan_jobs (
    scan_id TEXT PRIMARY KEY,
    target_url TEXT NOT NULL,
    email TEXT,
    status TEXT NOT NULL,
    submitter_ip TEXT,
    submission_count INTEGER NOT NULL DEFAULT 1,
    created_at TEXT NOT NULL,
    started_at TEXT,
    completed_at TEXT,
    pages_scanned INTEGER NOT NULL DEFAULT 0,
    pages_discovered INTEGER NOT NULL DEFAULT 0,
    non_webp_images_found INTEGER NOT NULL DEFAULT 0,
    error_message TEXT,
    priority_score INTEGER NOT NULL,
    convert_to_webp INTEGER NOT NULL DEFAULT 0,
    reached_page_limit INTEGER NOT NULL DEFAULT 0
);

CREATE INDEX IF NOT EXISTS idx_scan_jobs_status ON scan_jobs(status);
CREATE INDEX IF NOT EXISTS idx_scan_jobs_priority ON scan_jobs(priority_score);
CREATE INDEX IF NOT EXISTS idx_scan_jobs_created ON scan_jobs(created_at);
CREATE INDEX IF NOT EXISTS idx_scan_jobs_ip ON scan_jobs(submitter_ip);

CREATE TABLE IF NOT EXISTS discovered_images (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    scan_job_id TEXT NOT NULL REFERENCES scan_jobs(scan_id) ON DELETE CASCADE,
    image_url TEXT NOT NULL,
    page_urls TEXT NOT NULL,
    mime_type TEXT NOT NULL,
    file_size INTEGER NOT NULL,
    width INTEGER,
    height INTEGER,
    estimated_webp_size INTEGER NOT NULL,
    potential_savings_percent REAL NOT NULL,
    UNIQUE(scan_job_id, image_url)
);

CREATE INDEX IF NOT EXISTS idx_images_scan ON discovered_images(scan_job_id);

CREATE TABLE IF NOT EXISTS crawl_checkpoints (
    scan_job_id TEXT PRIMARY KEY REFERENCES scan_jobs(scan_id) ON DELETE CASCADE,
    visited_urls TEXT NOT NULL,
    pending_urls TEXT NOT NULL,
    pages_visited INTEGER NOT NULL,
    pages_discovered INTEGER NOT NULL,
    non_webp_images_found INTEGER NOT NULL,
    current_url TEXT,
    updated_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS aggregate_stats (
    id INTEGER PRIMARY KEY CHECK (id = 1),
    total_scans INTEGER NOT NULL DEFAULT 0,
    total_pages_crawled INTEGER NOT NULL DEFAULT 0,
    total_images_found INTEGER NOT NULL DEFAULT 0,
    total_original_size INTEGER NOT NULL DEFAULT 0,
    total_estimated_webp_size INTEGER NOT NULL DEFAULT 0,
    total_savings_percent_sum REAL NOT NULL DEFAULT 0
);

INSERT OR IGNORE INTO aggregate_stats (id) VALUES (1);

CREATE TABLE IF NOT EXISTS aggregate_mime_stats (
    mime_type TEXT PRIMARY KEY,
    image_count INTEGER NOT NULL DEFAULT 0,
    original_size INTEGER NOT NULL DEFAULT 0,
    estimated_webp_size INTEGER NOT NULL DEFAULT 0,
    savings_percent_sum REAL NOT NULL DEFAULT 0
);

CREATE TABLE IF NOT EXISTS aggregate_category_stats (
    category TEXT PRIMARY KEY,
    image_count INTEGER NOT NULL DEFAULT 0,
    original_size INTEGER NOT NULL DEFAULT 0,
    estimated_webp_size INTEGER NOT NULL DEFAULT 0,
    savings_percent_sum REAL NOT NULL DEFAULT 0
);

CREATE TABLE IF NOT EXISTS converted_image_zips (
    download_id TEXT PRIMARY KEY,
    scan_job_id TEXT NOT NULL REFERENCES scan_jobs(scan_id) ON DELETE CASCADE,
    file_path TEXT NOT NULL,
    created_at TEXT NOT NULL,
    expires_at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_zips_expires ON converted_image_zips(expires_at);
"#;

/// Store errors with the structured kinds the rest of the system reacts to.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("record not found")]
    NotFound,

    /// Another writer won; the caller decides whether to retry.
    #[error("concurrent update conflict")]
    ConcurrencyConflict,

    #[error("stored data is corrupted: {0}")]
    Corrupted(String),

    #[error(transparent)]
    Database(#[from] sqlx::Error),
}

/// Handle to the embedded database. Cheap to clone; all clones share one
/// pool.
#[derive(Clone)]
pub struct ScanStore {
    pool: SqlitePool,
}

impl ScanStore {
    /// Open (or create) the database file and run the idempotent schema.
    pub async fn open(db_path: &Path) -> Result<Self, StoreError> {
        if let Some(parent) = db_path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| StoreError::Corrupted(format!("cannot create data dir: {e}")))?;
        }

        let options = SqliteConnectOptions::new()
            .filename(db_path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .synchronous(SqliteSynchronous::Normal)
            .foreign_keys(true)
            .busy_timeout(std::time::Duration::from_secs(30));

        let pool = SqlitePoolOptions::new()
            .max_connections(8)
            .connect_with(options)
            .await?;

        let store = Self { pool };
        store.run_schema().await?;
        Ok(store)
    }

    /// In-memory store for tests.
    pub async fn open_in_memory() -> Result<Self, StoreError> {
        let options = SqliteConnectOptions::new()
            .in_memory(true)
            .foreign_keys(true);

        // A single connection keeps the in-memory database alive and shared.
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await?;

        let store = Self { pool };
        store.run_schema().await?;
        Ok(store)
    }

    async fn run_schema(&self) -> Result<(), StoreError> {
        sqlx::raw_sql(SCHEMA_SQL).execute(&self.pool).await?;
        Ok(())
    }

    pub(crate) fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }
}

/// RFC3339 column text → UTC timestamp.
pub(crate) fn parse_ts(raw: &str) -> Result<DateTime<Utc>, StoreError> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| StoreError::Corrupted(format!("bad timestamp {raw:?}: {e}")))
}

pub(crate) fn parse_ts_opt(raw: Option<String>) -> Result<Option<DateTime<Utc>>, StoreError> {
    raw.as_deref().map(parse_ts).transpose()
}

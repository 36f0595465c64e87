//! Fair-share scan queue.
//!
//! Admission control, priority assignment, aging, and terminal transitions
//! for scan jobs. The queue owns the ordering fields of `scan_jobs` — no
//! other service writes `priority_score`.
//!
//! Priority is the pair `(priority_score, created_at)`, lower first, with
//!
//! ```text
//! submission_count = 1 + queued-or-processing jobs from this ip
//! priority_score   = submission_count * fairness_slot_secs + created_at seconds
//! ```
//!
//! so a submitter's second job is scored one fairness slot (default one
//! hour) behind everyone else's first. Aging subtracts a fixed boost from
//! waiting jobs each pass, floored at the baseline of the oldest queued
//! admission so boosted jobs can catch up but never leapfrog it.

mod cooldown;

pub use cooldown::CooldownTable;

use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::{debug, info};
use uuid::Uuid;

use crate::config::QueueConfig;
use crate::models::{ScanJob, ScanStatus};
use crate::store::{ScanStore, StoreError};

/// Capacity and pacing failures surfaced to submitters with stable codes.
#[derive(Debug, thiserror::Error)]
pub enum QueueError {
    #[error("scan queue is full")]
    QueueFull,

    #[error("too many pending scans from this address")]
    IpLimit,

    #[error("address is cooling down after a recent scan")]
    Cooldown,

    #[error(transparent)]
    Store(#[from] StoreError),
}

impl QueueError {
    #[must_use]
    pub fn code(&self) -> &'static str {
        match self {
            Self::QueueFull => "QueueFull",
            Self::IpLimit => "IpLimit",
            Self::Cooldown => "Cooldown",
            Self::Store(_) => "StorageError",
        }
    }
}

/// Time source, injectable so queue tests can steer aging and cooldowns.
#[derive(Clone)]
pub struct Clock(Arc<dyn Fn() -> DateTime<Utc> + Send + Sync>);

impl Clock {
    #[must_use]
    pub fn system() -> Self {
        Self(Arc::new(Utc::now))
    }

    #[must_use]
    pub fn new(f: impl Fn() -> DateTime<Utc> + Send + Sync + 'static) -> Self {
        Self(Arc::new(f))
    }

    #[must_use]
    pub fn now(&self) -> DateTime<Utc> {
        (self.0)()
    }
}

impl Default for Clock {
    fn default() -> Self {
        Self::system()
    }
}

/// A validated submission ready for admission.
#[derive(Debug, Clone)]
pub struct ScanSubmission {
    pub target_url: String,
    pub email: Option<String>,
    pub submitter_ip: Option<String>,
    pub convert_to_webp: bool,
}

/// Priority score for one admission.
#[must_use]
pub fn priority_score(submission_count: i64, created_at: DateTime<Utc>, slot_secs: i64) -> i64 {
    submission_count * slot_secs + created_at.timestamp()
}

/// The fair-share queue service.
pub struct FairShareQueue {
    store: ScanStore,
    config: QueueConfig,
    cooldowns: CooldownTable,
    clock: Clock,
}

impl FairShareQueue {
    #[must_use]
    pub fn new(store: ScanStore, config: QueueConfig) -> Self {
        Self::with_clock(store, config, Clock::system())
    }

    #[must_use]
    pub fn with_clock(store: ScanStore, config: QueueConfig, clock: Clock) -> Self {
        let cooldowns = CooldownTable::new(config.cooldown_secs, clock.clone());
        Self {
            store,
            config,
            cooldowns,
            clock,
        }
    }

    #[must_use]
    pub fn config(&self) -> &QueueConfig {
        &self.config
    }

    #[must_use]
    pub fn store(&self) -> &ScanStore {
        &self.store
    }

    /// Admit a submission: capacity, per-IP cap, and cooldown checks in that
    /// order, then priority assignment and persistence.
    pub async fn enqueue(&self, submission: ScanSubmission) -> Result<ScanJob, QueueError> {
        if self.store.queued_count().await? >= self.config.max_queue_size as i64 {
            return Err(QueueError::QueueFull);
        }

        let mut submission_count = 1i64;
        if let Some(ip) = submission.submitter_ip.as_deref() {
            let pending = self.store.jobs_by_ip(ip).await?;
            if pending >= self.config.max_queued_jobs_per_ip as i64 {
                return Err(QueueError::IpLimit);
            }
            if self.cooldowns.is_active(ip) {
                return Err(QueueError::Cooldown);
            }
            submission_count = 1 + pending;
        }

        let now = self.clock.now();
        let mut job = ScanJob::new(
            submission.target_url,
            submission.email,
            submission.submitter_ip,
            submission.convert_to_webp,
        );
        job.created_at = now;
        job.submission_count = submission_count;
        job.priority_score =
            priority_score(submission_count, now, self.config.fairness_slot_secs);

        self.store.insert_job(&job).await?;
        info!(
            scan_id = %job.scan_id,
            priority = job.priority_score,
            submission_count,
            "scan admitted"
        );
        Ok(job)
    }

    /// Pop the best queued job if a worker slot is free.
    ///
    /// Ordering is evaluated at the moment of dequeue: aging between calls
    /// can change which job comes out next. The conditional store transition
    /// makes concurrent dequeues settle on distinct jobs.
    pub async fn dequeue(&self) -> Result<Option<ScanJob>, QueueError> {
        if self.store.processing_count().await? >= self.config.max_concurrent_scans as i64 {
            return Ok(None);
        }

        let candidates = self.store.get_queued_ordered(8).await?;
        for mut job in candidates {
            let started_at = self.clock.now();
            if self.store.mark_processing(job.scan_id, started_at).await? {
                job.status = ScanStatus::Processing;
                job.started_at = Some(started_at);
                debug!(scan_id = %job.scan_id, "scan dequeued");
                return Ok(Some(job));
            }
        }
        Ok(None)
    }

    /// One aging pass: every job waiting longer than the minimum wait gets
    /// the boost subtracted, floored at the oldest admission's baseline.
    /// Returns the ids whose score actually moved.
    pub async fn age_priorities(&self) -> Result<Vec<Uuid>, QueueError> {
        let queued = self
            .store
            .get_queued_ordered(self.config.max_queue_size as i64)
            .await?;
        if queued.is_empty() {
            return Ok(Vec::new());
        }

        let now = self.clock.now();
        let oldest_admission = queued
            .iter()
            .map(|job| job.created_at)
            .min()
            .unwrap_or(now);
        // A first submission admitted at the oldest time scores this much;
        // aging may approach it but not cross it.
        let floor = priority_score(1, oldest_admission, self.config.fairness_slot_secs);

        let mut updates = Vec::new();
        for job in &queued {
            let waited = (now - job.created_at).num_seconds();
            if waited < self.config.aging_min_wait_secs {
                continue;
            }
            let boosted = (job.priority_score - self.config.aging_boost_secs).max(floor);
            if boosted < job.priority_score {
                updates.push((job.scan_id, boosted));
            }
        }

        if !updates.is_empty() {
            self.store.update_many_priorities(&updates).await?;
            debug!(moved = updates.len(), "aging pass rescored jobs");
        }
        Ok(updates.into_iter().map(|(id, _)| id).collect())
    }

    /// Start the post-scan cooldown for a submitter.
    pub fn record_cooldown(&self, ip: &str) {
        self.cooldowns.record(ip);
    }

    #[must_use]
    pub fn in_cooldown(&self, ip: &str) -> bool {
        self.cooldowns.is_active(ip)
    }

    /// Transition a scan to its terminal state.
    pub async fn complete(
        &self,
        scan_id: Uuid,
        success: bool,
        error_message: Option<&str>,
    ) -> Result<(), QueueError> {
        let status = if success {
            ScanStatus::Completed
        } else {
            ScanStatus::Failed
        };
        self.store
            .mark_terminal(scan_id, status, self.clock.now(), error_message)
            .await?;
        Ok(())
    }

    /// 1-based queue position, `None` once the job has left the queue.
    pub async fn position_of(&self, scan_id: Uuid) -> Result<Option<i64>, QueueError> {
        Ok(self.store.position_of(scan_id).await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use parking_lot::Mutex;
    use proptest::prelude::*;

    fn test_clock(start: DateTime<Utc>) -> (Clock, Arc<Mutex<DateTime<Utc>>>) {
        let now = Arc::new(Mutex::new(start));
        let handle = Arc::clone(&now);
        (Clock::new(move || *handle.lock()), now)
    }

    fn submission(url: &str, ip: &str) -> ScanSubmission {
        ScanSubmission {
            target_url: url.into(),
            email: None,
            submitter_ip: Some(ip.into()),
            convert_to_webp: false,
        }
    }

    async fn queue_with_clock(config: QueueConfig) -> (FairShareQueue, Arc<Mutex<DateTime<Utc>>>) {
        let store = ScanStore::open_in_memory().await.unwrap();
        let (clock, now) = test_clock(Utc::now());
        (FairShareQueue::with_clock(store, config, clock), now)
    }

    #[tokio::test]
    async fn fair_interleave_across_submitters() {
        // Two quick submissions from A and one from B inside the same
        // second: B's first must overtake A's second.
        let config = QueueConfig {
            max_concurrent_scans: 1,
            ..Default::default()
        };
        let (queue, now) = queue_with_clock(config).await;

        let s1 = queue.enqueue(submission("https://a1.example", "ipA")).await.unwrap();
        *now.lock() += Duration::milliseconds(300);
        let s2 = queue.enqueue(submission("https://a2.example", "ipA")).await.unwrap();
        *now.lock() += Duration::milliseconds(300);
        let s3 = queue.enqueue(submission("https://b1.example", "ipB")).await.unwrap();

        let first = queue.dequeue().await.unwrap().unwrap();
        assert_eq!(first.scan_id, s1.scan_id);
        queue.complete(first.scan_id, true, None).await.unwrap();

        let second = queue.dequeue().await.unwrap().unwrap();
        assert_eq!(second.scan_id, s3.scan_id);
        queue.complete(second.scan_id, true, None).await.unwrap();

        let third = queue.dequeue().await.unwrap().unwrap();
        assert_eq!(third.scan_id, s2.scan_id);
    }

    #[tokio::test]
    async fn queue_full_at_exact_capacity() {
        let config = QueueConfig {
            max_queue_size: 2,
            max_queued_jobs_per_ip: 10,
            ..Default::default()
        };
        let (queue, _) = queue_with_clock(config).await;

        queue.enqueue(submission("https://1.example", "a")).await.unwrap();
        queue.enqueue(submission("https://2.example", "b")).await.unwrap();

        let err = queue
            .enqueue(submission("https://3.example", "c"))
            .await
            .unwrap_err();
        assert!(matches!(err, QueueError::QueueFull));
    }

    #[tokio::test]
    async fn ip_limit_counts_queued_and_processing() {
        let config = QueueConfig {
            max_queued_jobs_per_ip: 2,
            ..Default::default()
        };
        let (queue, _) = queue_with_clock(config).await;

        queue.enqueue(submission("https://1.example", "ip")).await.unwrap();
        queue.dequeue().await.unwrap().unwrap(); // now processing
        queue.enqueue(submission("https://2.example", "ip")).await.unwrap();

        let err = queue
            .enqueue(submission("https://3.example", "ip"))
            .await
            .unwrap_err();
        assert!(matches!(err, QueueError::IpLimit));
    }

    #[tokio::test]
    async fn cooldown_blocks_resubmission_until_expiry() {
        let config = QueueConfig {
            cooldown_secs: 60,
            ..Default::default()
        };
        let (queue, now) = queue_with_clock(config).await;

        let job = queue.enqueue(submission("https://1.example", "ip")).await.unwrap();
        queue.dequeue().await.unwrap().unwrap();
        queue.complete(job.scan_id, true, None).await.unwrap();
        queue.record_cooldown("ip");

        let err = queue
            .enqueue(submission("https://2.example", "ip"))
            .await
            .unwrap_err();
        assert!(matches!(err, QueueError::Cooldown));

        *now.lock() += Duration::seconds(61);
        assert!(queue.enqueue(submission("https://2.example", "ip")).await.is_ok());
    }

    #[tokio::test]
    async fn dequeue_respects_concurrency_cap() {
        let config = QueueConfig {
            max_concurrent_scans: 1,
            ..Default::default()
        };
        let (queue, _) = queue_with_clock(config).await;

        queue.enqueue(submission("https://1.example", "a")).await.unwrap();
        queue.enqueue(submission("https://2.example", "b")).await.unwrap();

        let first = queue.dequeue().await.unwrap();
        assert!(first.is_some());
        assert!(queue.dequeue().await.unwrap().is_none());

        queue.complete(first.unwrap().scan_id, true, None).await.unwrap();
        assert!(queue.dequeue().await.unwrap().is_some());
    }

    #[tokio::test]
    async fn aging_rescues_deep_submissions() {
        // ipB's 50th submission starts 50 slots deep; enough aging passes
        // must pull it ahead of a newly admitted job.
        let config = QueueConfig {
            max_queue_size: 200,
            max_queued_jobs_per_ip: 100,
            aging_boost_secs: 30,
            aging_min_wait_secs: 0,
            fairness_slot_secs: 3600,
            ..Default::default()
        };
        let (queue, now) = queue_with_clock(config).await;

        let mut deep_id = None;
        for i in 0..50 {
            let job = queue
                .enqueue(submission(&format!("https://b{i}.example"), "ipB"))
                .await
                .unwrap();
            deep_id = Some(job.scan_id);
        }
        let deep_id = deep_id.unwrap();

        // 30 passes at 30s knock 900s off the deep job's score while the
        // queue sits.
        for _ in 0..30 {
            queue.age_priorities().await.unwrap();
        }

        // Two days later ipA shows up; its score carries the much later
        // admission timestamp, so the aged job now sorts ahead.
        *now.lock() += Duration::seconds(176_400);
        let fresh = queue.enqueue(submission("https://a.example", "ipA")).await.unwrap();

        let deep = queue.store().fetch_job(deep_id).await.unwrap();
        assert!(
            deep.priority_score < fresh.priority_score,
            "aged job ({}) should precede fresh admission ({})",
            deep.priority_score,
            fresh.priority_score
        );
    }

    #[tokio::test]
    async fn aging_never_crosses_the_oldest_admission_baseline() {
        let config = QueueConfig {
            aging_boost_secs: 1_000_000,
            aging_min_wait_secs: 0,
            ..Default::default()
        };
        let (queue, _) = queue_with_clock(config).await;

        let first = queue.enqueue(submission("https://1.example", "a")).await.unwrap();
        let second = queue.enqueue(submission("https://2.example", "a")).await.unwrap();

        queue.age_priorities().await.unwrap();

        let floor = priority_score(1, first.created_at, 3600);
        let aged_first = queue.store().fetch_job(first.scan_id).await.unwrap();
        let aged_second = queue.store().fetch_job(second.scan_id).await.unwrap();
        assert!(aged_first.priority_score >= floor);
        assert!(aged_second.priority_score >= floor);
    }

    #[tokio::test]
    async fn aging_reports_only_moved_ids() {
        let config = QueueConfig {
            aging_boost_secs: 30,
            aging_min_wait_secs: 3600,
            ..Default::default()
        };
        let (queue, now) = queue_with_clock(config).await;

        // a1 defines the baseline and cannot move; a2 sits one slot deeper
        // and is eligible once it has waited long enough.
        let a1 = queue.enqueue(submission("https://a1.example", "a")).await.unwrap();
        let a2 = queue.enqueue(submission("https://a2.example", "a")).await.unwrap();
        *now.lock() += Duration::seconds(7200);
        let young = queue.enqueue(submission("https://new.example", "b")).await.unwrap();

        let moved = queue.age_priorities().await.unwrap();
        assert!(moved.contains(&a2.scan_id));
        assert!(!moved.contains(&a1.scan_id));
        assert!(!moved.contains(&young.scan_id));
    }

    proptest! {
        /// Within one fairness window, a submitter's k-th job always scores
        /// behind any other submitter's (k-1)-th.
        #[test]
        fn kth_submission_scores_behind_others_first(
            offset_a in 0i64..3000,
            offset_b in 0i64..3000,
            k in 2i64..10,
        ) {
            let base = DateTime::<Utc>::from_timestamp(1_700_000_000, 0).unwrap();
            let kth = priority_score(k, base + Duration::seconds(offset_a), 3600);
            let other_prev = priority_score(
                k - 1,
                base + Duration::seconds(offset_b),
                3600,
            );
            prop_assert!(other_prev < kth);
        }
    }
}

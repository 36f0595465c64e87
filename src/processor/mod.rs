//! Background queue processor.
//!
//! A long-lived tick loop dequeues whenever a worker slot is free and
//! spawns one isolated task per scan. Worker panics and errors are reaped
//! and logged without touching sibling scans. Each worker carries a
//! cancellation token and the `max_scan_duration` deadline; on expiry the
//! crawler is cancelled and given a bounded window to release its browser.

use std::pin::pin;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use tokio::task::{JoinHandle, JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use url::Url;
use uuid::Uuid;

use crate::config::CrawlerConfig;
use crate::crawler::{
    CrawlEngine, CrawlError, CrawlObserver, CrawlOutcome, CrawlProgress, CrawlRequest,
    CrawledImage, ImageHit, RobotsPolicy, SessionFactory, StoreCheckpointSink,
};
use crate::models::{ScanJob, ScanStatus};
use crate::push::{ProgressBroadcaster, ScanServerMessage, publish_queue_positions};
use crate::queue::FairShareQueue;
use crate::savings::{discovered_from_crawl, estimate};
use crate::stats::{LiveStatsTracker, merged_snapshot};
use crate::store::{ScanStore, delta_for_completed_scan};
use crate::validation::HostCheck;

/// Grace window for the crawler to release its browser after cancellation.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

/// Everything a worker needs, shared by reference.
pub struct QueueProcessor {
    queue: Arc<FairShareQueue>,
    store: ScanStore,
    tracker: Arc<LiveStatsTracker>,
    broadcaster: Arc<ProgressBroadcaster>,
    factory: Arc<dyn SessionFactory>,
    host_check: Arc<dyn HostCheck>,
    crawler_config: CrawlerConfig,
}

impl QueueProcessor {
    #[must_use]
    pub fn new(
        queue: Arc<FairShareQueue>,
        store: ScanStore,
        tracker: Arc<LiveStatsTracker>,
        broadcaster: Arc<ProgressBroadcaster>,
        factory: Arc<dyn SessionFactory>,
        host_check: Arc<dyn HostCheck>,
        crawler_config: CrawlerConfig,
    ) -> Self {
        Self {
            queue,
            store,
            tracker,
            broadcaster,
            factory,
            host_check,
            crawler_config,
        }
    }

    /// Requeue scans left in `Processing` by an unclean shutdown so their
    /// checkpoints can resume.
    pub async fn recover_interrupted(&self) -> Result<usize, crate::store::StoreError> {
        let mut recovered = 0;
        for job in self.store.non_terminal_jobs().await? {
            if job.status == ScanStatus::Processing {
                self.store.requeue_stale_processing(job.scan_id).await?;
                recovered += 1;
                info!(scan_id = %job.scan_id, "requeued interrupted scan");
            }
        }
        Ok(recovered)
    }

    /// Start the dequeue loop. Returns the loop's join handle.
    pub fn spawn(self: Arc<Self>, shutdown: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move {
            let tick = Duration::from_millis(self.queue.config().processor_tick_ms);
            let mut workers: JoinSet<Uuid> = JoinSet::new();

            loop {
                // Reap finished workers without blocking the tick.
                while let Some(reaped) = workers.try_join_next() {
                    match reaped {
                        Ok(scan_id) => debug!(%scan_id, "worker finished"),
                        Err(e) if e.is_panic() => error!("worker panicked: {e}"),
                        Err(e) => warn!("worker join error: {e}"),
                    }
                }

                match self.queue.dequeue().await {
                    Ok(Some(job)) => {
                        let processor = Arc::clone(&self);
                        let cancel = shutdown.child_token();
                        let scan_id = job.scan_id;
                        workers.spawn(async move {
                            processor.run_scan(job, cancel).await;
                            scan_id
                        });
                        // Head of queue moved; let waiting subscribers know.
                        if let Err(e) = publish_queue_positions(
                            &self.queue,
                            &self.tracker,
                            &self.broadcaster,
                            self.crawler_config.max_pages_per_scan as i64,
                        )
                        .await
                        {
                            warn!("queue position publish failed: {e}");
                        }
                        // Immediately try to fill remaining slots.
                        continue;
                    }
                    Ok(None) => {}
                    Err(e) => warn!("dequeue failed: {e}"),
                }

                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = tokio::time::sleep(tick) => {}
                }
            }

            info!("queue processor stopping; waiting for active workers");
            while workers.join_next().await.is_some() {}
        })
    }

    /// Start the periodic aging pass.
    pub fn spawn_aging(self: Arc<Self>, shutdown: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move {
            let interval = Duration::from_secs(self.queue.config().aging_interval_secs);
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = tokio::time::sleep(interval) => {}
                }
                match self.queue.age_priorities().await {
                    Ok(moved) if !moved.is_empty() => {
                        debug!(moved = moved.len(), "aging pass changed ordering");
                        if let Err(e) = publish_queue_positions(
                            &self.queue,
                            &self.tracker,
                            &self.broadcaster,
                            self.crawler_config.max_pages_per_scan as i64,
                        )
                        .await
                        {
                            warn!("queue position publish failed: {e}");
                        }
                    }
                    Ok(_) => {}
                    Err(e) => warn!("aging pass failed: {e}"),
                }
            }
        })
    }

    /// Run one scan to its terminal state.
    async fn run_scan(&self, job: ScanJob, cancel: CancellationToken) {
        let scan_id = job.scan_id;
        let started = Instant::now();
        let started_at = job.started_at.unwrap_or_else(Utc::now);

        self.tracker.start(scan_id);
        self.broadcaster.publish(
            scan_id,
            ScanServerMessage::ScanStarted {
                scan_id,
                target_url: job.target_url.clone(),
                started_at,
            },
        );

        let result = self.crawl_job(&job, cancel).await;

        match result {
            Ok(outcome) => {
                if let Err(e) = self.finish_success(&job, &outcome).await {
                    // Storage died under a finished crawl; the scan must
                    // still reach a terminal state if at all possible.
                    error!(%scan_id, "completion persistence failed: {e}");
                    self.finish_failure(&job, &CrawlError::Store(e)).await;
                } else {
                    self.broadcaster.publish(
                        scan_id,
                        ScanServerMessage::ScanComplete {
                            scan_id,
                            pages_scanned: outcome.pages_scanned,
                            images_found: outcome.images.len() as i64,
                            non_webp_count: outcome.non_webp_images_found,
                            duration_seconds: started.elapsed().as_secs_f64(),
                            completed_at: Utc::now(),
                            reached_page_limit: outcome.reached_page_limit,
                        },
                    );
                }
            }
            Err(err) => {
                self.finish_failure(&job, &err).await;
            }
        }

        if let Some(ip) = job.submitter_ip.as_deref() {
            self.queue.record_cooldown(ip);
        }
        self.tracker
            .stop(scan_id, Some(started.elapsed().as_secs_f64()));

        // Best-effort stats fanout after the terminal message.
        match merged_snapshot(&self.store, &self.tracker).await {
            Ok(stats) => {
                self.broadcaster.publish_stats(stats);
            }
            Err(e) => debug!("stats snapshot failed: {e}"),
        }
        self.broadcaster.remove_scan(scan_id);
    }

    async fn crawl_job(
        &self,
        job: &ScanJob,
        cancel: CancellationToken,
    ) -> Result<CrawlOutcome, CrawlError> {
        let scan_id = job.scan_id;

        let checkpoint = self.store.fetch_checkpoint(scan_id).await?;
        let resume_images: Vec<CrawledImage> = if checkpoint.is_some() {
            self.store
                .images_for_scan(scan_id)
                .await?
                .into_iter()
                .map(|image| CrawledImage {
                    image_url: image.image_url,
                    mime_type: image.mime_type,
                    file_size: image.file_size,
                    width: image.width,
                    height: image.height,
                    page_urls: image.page_urls,
                })
                .collect()
        } else {
            Vec::new()
        };

        let robots = if self.crawler_config.respect_robots_txt {
            match Url::parse(&job.target_url) {
                Ok(seed) => Some(RobotsPolicy::fetch(&seed, &self.crawler_config.user_agent).await),
                Err(_) => None,
            }
        } else {
            None
        };

        let observer = WorkerObserver {
            tracker: Arc::clone(&self.tracker),
            broadcaster: Arc::clone(&self.broadcaster),
            max_pages: self.crawler_config.max_pages_per_scan as i64,
        };
        let sink = StoreCheckpointSink::new(self.store.clone());
        let engine = CrawlEngine::new(
            &self.crawler_config,
            &*self.host_check,
            robots,
            cancel.clone(),
        );
        let request = CrawlRequest {
            scan_id,
            seed_url: job.target_url.clone(),
            resume_from: checkpoint,
            resume_images,
        };

        let deadline = Duration::from_secs(self.crawler_config.max_scan_duration_secs);
        let mut run = pin!(engine.run(&*self.factory, request, &observer, &sink));

        tokio::select! {
            result = &mut run => result,
            _ = tokio::time::sleep(deadline) => {
                warn!(%scan_id, "scan deadline reached, cancelling worker");
                cancel.cancel();
                // The crawler must wind down (browser released, listeners
                // closed) within the bounded shutdown window.
                if tokio::time::timeout(SHUTDOWN_GRACE, &mut run).await.is_err() {
                    error!(%scan_id, "crawler did not shut down within grace window");
                }
                Err(CrawlError::Timeout)
            }
        }
    }

    async fn finish_success(
        &self,
        job: &ScanJob,
        outcome: &CrawlOutcome,
    ) -> Result<(), crate::store::StoreError> {
        let scan_id = job.scan_id;
        let images = discovered_from_crawl(scan_id, &outcome.images);

        self.store.replace_images_for_scan(scan_id, &images).await?;
        self.store
            .update_progress(
                scan_id,
                outcome.pages_scanned,
                outcome.pages_discovered,
                outcome.non_webp_images_found,
            )
            .await?;
        if outcome.reached_page_limit {
            self.store.set_reached_page_limit(scan_id).await?;
        }
        self.store
            .mark_terminal(scan_id, ScanStatus::Completed, Utc::now(), None)
            .await?;
        self.store.delete_checkpoint(scan_id).await?;

        // Lifetime stats are best-effort; a conflict storm must not fail
        // the scan.
        let delta = delta_for_completed_scan(outcome.pages_scanned, &images);
        if let Err(e) = self.store.apply_aggregate_delta(&delta).await {
            warn!(%scan_id, "aggregate stats update dropped: {e}");
        }

        info!(
            %scan_id,
            pages = outcome.pages_scanned,
            images = images.len(),
            "scan completed"
        );
        Ok(())
    }

    async fn finish_failure(&self, job: &ScanJob, err: &CrawlError) {
        let scan_id = job.scan_id;
        let message = err.user_message();
        warn!(%scan_id, error = %err, "scan failed");

        if let Err(e) = self
            .store
            .mark_terminal(scan_id, ScanStatus::Failed, Utc::now(), Some(message))
            .await
        {
            error!(%scan_id, "failed to mark scan failed: {e}");
        }
        if let Err(e) = self.store.delete_checkpoint(scan_id).await {
            warn!(%scan_id, "checkpoint cleanup failed: {e}");
        }

        self.broadcaster.publish(
            scan_id,
            ScanServerMessage::ScanFailed {
                scan_id,
                error_message: message.to_string(),
                failed_at: Utc::now(),
            },
        );
    }
}

/// Fans engine callbacks into the live tracker and the push layer.
struct WorkerObserver {
    tracker: Arc<LiveStatsTracker>,
    broadcaster: Arc<ProgressBroadcaster>,
    max_pages: i64,
}

impl CrawlObserver for WorkerObserver {
    fn page_started(&self, scan_id: Uuid, url: &str) {
        let counters = self.tracker.snapshot(scan_id).unwrap_or_default();
        self.broadcaster.publish(
            scan_id,
            ScanServerMessage::PageProgress {
                scan_id,
                current_url: url.to_string(),
                pages_scanned: counters.pages_scanned,
                pages_discovered: counters.pages_discovered,
                progress_percent: progress_percent(counters.pages_scanned, self.max_pages),
            },
        );
    }

    fn page_completed(&self, scan_id: Uuid, url: &str, progress: &CrawlProgress) {
        self.tracker
            .update_pages(scan_id, progress.pages_scanned, progress.pages_discovered);
        self.broadcaster.publish(
            scan_id,
            ScanServerMessage::PageProgress {
                scan_id,
                current_url: url.to_string(),
                pages_scanned: progress.pages_scanned,
                pages_discovered: progress.pages_discovered,
                progress_percent: progress_percent(progress.pages_scanned, self.max_pages),
            },
        );
    }

    fn image_found(&self, scan_id: Uuid, image: &ImageHit, non_webp_total: i64) {
        let est = estimate(&image.mime_type, image.size);
        self.tracker.add_image(
            scan_id,
            &image.mime_type,
            &image.image_url,
            image.size,
            est.estimated_webp_size,
            est.savings_percent,
        );
        self.broadcaster.publish(
            scan_id,
            ScanServerMessage::ImageFound {
                scan_id,
                image_url: image.image_url.clone(),
                mime_type: image.mime_type.clone(),
                size: image.size,
                is_non_webp: image.is_non_webp,
                total_non_webp_count: non_webp_total,
                page_url: image.page_url.clone(),
            },
        );
    }

    fn crawl_completed(&self, _scan_id: Uuid, _outcome: &CrawlOutcome) {
        // Terminal handling (persistence, ScanComplete) happens in the
        // worker after the run returns.
    }

    fn crawl_failed(&self, _scan_id: Uuid, _error: &CrawlError) {}
}

fn progress_percent(pages_scanned: i64, max_pages: i64) -> f64 {
    if max_pages <= 0 {
        return 0.0;
    }
    ((pages_scanned as f64 / max_pages as f64) * 100.0).min(100.0)
}

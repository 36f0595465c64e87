//! Live progress push.
//!
//! Subscribers attach to a per-scan group; each group is one broadcast
//! channel, so per-scan ordering is whatever the publishing worker emitted.
//! Delivery is best-effort: a subscriber that lags simply misses messages
//! and reconciles through the `GetCurrentProgress` snapshot, which returns
//! the authoritative job status plus live counters.

pub mod hub;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::debug;
use uuid::Uuid;

use crate::models::{AggregateStats, ScanStatus};
use crate::queue::FairShareQueue;
use crate::stats::LiveStatsTracker;
use crate::store::{ScanStore, StoreError};

/// Buffered messages per subscriber group before laggards start missing.
const GROUP_CAPACITY: usize = 256;

/// How many head-of-queue entries get position updates on reorders.
const POSITION_FANOUT: usize = 10;

/// Server → subscriber messages.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
#[allow(clippy::large_enum_variant)]
pub enum ScanServerMessage {
    #[serde(rename_all = "camelCase")]
    QueuePositionUpdate {
        scan_id: Uuid,
        position: i64,
        total_in_queue: i64,
        #[serde(skip_serializing_if = "Option::is_none")]
        estimated_wait_seconds: Option<i64>,
    },
    #[serde(rename_all = "camelCase")]
    ScanStarted {
        scan_id: Uuid,
        target_url: String,
        started_at: DateTime<Utc>,
    },
    #[serde(rename_all = "camelCase")]
    PageProgress {
        scan_id: Uuid,
        current_url: String,
        pages_scanned: i64,
        pages_discovered: i64,
        progress_percent: f64,
    },
    #[serde(rename_all = "camelCase")]
    ImageFound {
        scan_id: Uuid,
        image_url: String,
        mime_type: String,
        size: i64,
        is_non_webp: bool,
        total_non_webp_count: i64,
        page_url: String,
    },
    #[serde(rename_all = "camelCase")]
    ScanComplete {
        scan_id: Uuid,
        pages_scanned: i64,
        images_found: i64,
        non_webp_count: i64,
        duration_seconds: f64,
        completed_at: DateTime<Utc>,
        reached_page_limit: bool,
    },
    #[serde(rename_all = "camelCase")]
    ScanFailed {
        scan_id: Uuid,
        error_message: String,
        failed_at: DateTime<Utc>,
    },
    #[serde(rename_all = "camelCase")]
    StatsUpdate { stats: AggregateStats },
    /// Reply to `GetCurrentProgress`; also the reconnect resync payload.
    #[serde(rename_all = "camelCase")]
    CurrentProgress { snapshot: ScanProgressSnapshot },
}

/// Authoritative status plus live counters for one scan.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScanProgressSnapshot {
    pub scan_id: Uuid,
    pub target_url: String,
    pub status: ScanStatus,
    pub pages_scanned: i64,
    pub pages_discovered: i64,
    pub non_webp_images_found: i64,
    pub reached_page_limit: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub queue_position: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
}

/// Owns the map from scan id to subscriber channels.
pub struct ProgressBroadcaster {
    groups: DashMap<Uuid, broadcast::Sender<ScanServerMessage>>,
    stats: broadcast::Sender<ScanServerMessage>,
}

impl Default for ProgressBroadcaster {
    fn default() -> Self {
        Self::new()
    }
}

impl ProgressBroadcaster {
    #[must_use]
    pub fn new() -> Self {
        let (stats, _) = broadcast::channel(GROUP_CAPACITY);
        Self {
            groups: DashMap::new(),
            stats,
        }
    }

    /// Attach to a scan's group, creating it on first use.
    #[must_use]
    pub fn subscribe_scan(&self, scan_id: Uuid) -> broadcast::Receiver<ScanServerMessage> {
        self.groups
            .entry(scan_id)
            .or_insert_with(|| broadcast::channel(GROUP_CAPACITY).0)
            .subscribe()
    }

    /// Attach to the process-wide stats feed.
    #[must_use]
    pub fn subscribe_stats(&self) -> broadcast::Receiver<ScanServerMessage> {
        self.stats.subscribe()
    }

    /// Publish to a scan's group. Returns delivered-subscriber count.
    pub fn publish(&self, scan_id: Uuid, message: ScanServerMessage) -> usize {
        match self.groups.get(&scan_id) {
            Some(sender) => sender.send(message).unwrap_or(0),
            None => 0,
        }
    }

    pub fn publish_stats(&self, stats: AggregateStats) -> usize {
        self.stats
            .send(ScanServerMessage::StatsUpdate { stats })
            .unwrap_or(0)
    }

    /// Drop a scan's group after its terminal message has been sent.
    pub fn remove_scan(&self, scan_id: Uuid) {
        if self.groups.remove(&scan_id).is_some() {
            debug!(%scan_id, "subscriber group removed");
        }
    }

    #[must_use]
    pub fn group_count(&self) -> usize {
        self.groups.len()
    }
}

/// Assemble the reconnect snapshot: job row as ground truth, overlaid with
/// fresher live counters when the scan is mid-flight.
pub async fn snapshot_for(
    store: &ScanStore,
    tracker: &LiveStatsTracker,
    scan_id: Uuid,
) -> Result<ScanProgressSnapshot, StoreError> {
    let job = store.fetch_job(scan_id).await?;
    let mut snapshot = ScanProgressSnapshot {
        scan_id,
        target_url: job.target_url.clone(),
        status: job.status,
        pages_scanned: job.pages_scanned,
        pages_discovered: job.pages_discovered,
        non_webp_images_found: job.non_webp_images_found,
        reached_page_limit: job.reached_page_limit,
        queue_position: None,
        error_message: job.error_message.clone(),
    };

    if job.status == ScanStatus::Queued {
        snapshot.queue_position = store.position_of(scan_id).await?;
    }
    if let Some(live) = tracker.snapshot(scan_id) {
        snapshot.pages_scanned = snapshot.pages_scanned.max(live.pages_scanned);
        snapshot.pages_discovered = snapshot.pages_discovered.max(live.pages_discovered);
        snapshot.non_webp_images_found =
            snapshot.non_webp_images_found.max(live.non_webp_images);
    }
    Ok(snapshot)
}

/// Push fresh `QueuePositionUpdate`s to the first few queued scans.
///
/// Called whenever the ordering may have changed: admission, dequeue, and
/// aging passes that moved ids. The wait estimate is recomputed here and
/// only here, and omitted entirely until at least one scan has completed.
pub async fn publish_queue_positions(
    queue: &FairShareQueue,
    tracker: &LiveStatsTracker,
    broadcaster: &ProgressBroadcaster,
    max_pages_per_scan: i64,
) -> Result<(), StoreError> {
    let store = queue.store();
    let total_in_queue = store.queued_count().await?;
    let head = store.get_queued_ordered(POSITION_FANOUT as i64).await?;
    let avg_secs = tracker.avg_secs_per_page();
    let pages_per_queued_job = queue.config().default_pages_estimate;

    for (idx, job) in head.iter().enumerate() {
        let position = idx as i64 + 1;
        let estimated_wait_seconds = avg_secs.map(|avg| {
            let live_remaining = tracker.remaining_pages_live(max_pages_per_scan);
            let queued_ahead = position - 1;
            (avg * (live_remaining + queued_ahead * pages_per_queued_job) as f64).round() as i64
        });
        broadcaster.publish(
            job.scan_id,
            ScanServerMessage::QueuePositionUpdate {
                scan_id: job.scan_id,
                position,
                total_in_queue,
                estimated_wait_seconds,
            },
        );
    }
    Ok(())
}

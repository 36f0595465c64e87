//! End-to-end service behavior: submissions flow through the fair-share
//! queue, the processor drives scripted crawls, and subscribers observe
//! terminal messages or reconcile via the snapshot.

mod common;

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use common::{AllowAllHosts, PageFixture, ScriptedFactory, ScriptedSite, test_crawler_config};
use webpscan::config::QueueConfig;
use webpscan::models::ScanStatus;
use webpscan::processor::QueueProcessor;
use webpscan::push::{ProgressBroadcaster, ScanServerMessage, snapshot_for};
use webpscan::queue::{FairShareQueue, ScanSubmission};
use webpscan::stats::LiveStatsTracker;
use webpscan::store::ScanStore;

fn submission(url: &str, ip: &str) -> ScanSubmission {
    ScanSubmission {
        target_url: url.into(),
        email: None,
        submitter_ip: Some(ip.into()),
        convert_to_webp: false,
    }
}

async fn wait_terminal(store: &ScanStore, scan_id: uuid::Uuid) -> ScanStatus {
    for _ in 0..1000 {
        let job = store.fetch_job(scan_id).await.unwrap();
        if job.status.is_terminal() {
            return job.status;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("scan {scan_id} never reached a terminal state");
}

fn one_page_site(urls: &[&str]) -> Arc<ScriptedSite> {
    let site = ScriptedSite::new();
    for url in urls {
        site.add_page(
            url,
            PageFixture::ok().with_image(&format!("{url}img.png"), "image/png", 1000),
        );
    }
    site
}

#[tokio::test]
async fn fair_interleave_runs_second_submitter_before_repeat() {
    let store = ScanStore::open_in_memory().await.unwrap();
    let queue = Arc::new(FairShareQueue::new(
        store.clone(),
        QueueConfig {
            max_concurrent_scans: 1,
            processor_tick_ms: 10,
            cooldown_secs: 0,
            ..Default::default()
        },
    ));
    let tracker = Arc::new(LiveStatsTracker::new());
    let broadcaster = Arc::new(ProgressBroadcaster::new());
    let site = one_page_site(&["https://a1.test/", "https://a2.test/", "https://b1.test/"]);

    let s1 = queue.enqueue(submission("https://a1.test/", "ipA")).await.unwrap();
    let s2 = queue.enqueue(submission("https://a2.test/", "ipA")).await.unwrap();
    let s3 = queue.enqueue(submission("https://b1.test/", "ipB")).await.unwrap();

    // Subscribers attach before processing starts.
    let mut rx3 = broadcaster.subscribe_scan(s3.scan_id);

    let processor = Arc::new(QueueProcessor::new(
        Arc::clone(&queue),
        store.clone(),
        Arc::clone(&tracker),
        Arc::clone(&broadcaster),
        Arc::new(ScriptedFactory(site)),
        Arc::new(AllowAllHosts),
        test_crawler_config(),
    ));
    let shutdown = CancellationToken::new();
    let handle = Arc::clone(&processor).spawn(shutdown.clone());

    for id in [s1.scan_id, s2.scan_id, s3.scan_id] {
        assert_eq!(
            wait_terminal(&store, id).await,
            ScanStatus::Completed,
            "scan {id} should complete"
        );
    }
    shutdown.cancel();
    let _ = tokio::time::timeout(Duration::from_secs(5), handle).await;

    // With one worker slot, start order equals dequeue order: the second
    // submitter's first job overtakes ipA's second.
    let store_ref = &store;
    let started = |id| async move {
        store_ref.fetch_job(id).await.unwrap().started_at.expect("started")
    };
    let t1 = started(s1.scan_id).await;
    let t2 = started(s2.scan_id).await;
    let t3 = started(s3.scan_id).await;
    assert!(t1 <= t3, "S1 should start before S3");
    assert!(t3 <= t2, "S3 (ipB's first) should start before S2 (ipA's second)");

    // A subscriber attached before completion saw the terminal message.
    let mut saw_complete = false;
    while let Ok(Ok(message)) =
        tokio::time::timeout(Duration::from_millis(200), rx3.recv()).await
    {
        if matches!(message, ScanServerMessage::ScanComplete { .. }) {
            saw_complete = true;
            break;
        }
    }
    assert!(saw_complete, "subscriber should receive ScanComplete");

    // Lifetime aggregates saw all three scans exactly once.
    let stats = store.fetch_aggregate_stats().await.unwrap();
    assert_eq!(stats.total_scans, 3);
    assert_eq!(stats.total_pages_crawled, 3);
    assert_eq!(stats.total_images_found, 3);
}

#[tokio::test]
async fn late_subscribers_reconcile_through_the_snapshot() {
    let store = ScanStore::open_in_memory().await.unwrap();
    let queue = Arc::new(FairShareQueue::new(
        store.clone(),
        QueueConfig {
            processor_tick_ms: 10,
            cooldown_secs: 0,
            ..Default::default()
        },
    ));
    let tracker = Arc::new(LiveStatsTracker::new());
    let broadcaster = Arc::new(ProgressBroadcaster::new());
    let site = one_page_site(&["https://solo.test/"]);

    let job = queue.enqueue(submission("https://solo.test/", "ip")).await.unwrap();

    let processor = Arc::new(QueueProcessor::new(
        Arc::clone(&queue),
        store.clone(),
        Arc::clone(&tracker),
        Arc::clone(&broadcaster),
        Arc::new(ScriptedFactory(site)),
        Arc::new(AllowAllHosts),
        test_crawler_config(),
    ));
    let shutdown = CancellationToken::new();
    let handle = Arc::clone(&processor).spawn(shutdown.clone());

    assert_eq!(wait_terminal(&store, job.scan_id).await, ScanStatus::Completed);
    shutdown.cancel();
    let _ = tokio::time::timeout(Duration::from_secs(5), handle).await;

    // The push group is long gone; the snapshot is the source of truth.
    let snapshot = snapshot_for(&store, &tracker, job.scan_id).await.unwrap();
    assert_eq!(snapshot.status, ScanStatus::Completed);
    assert_eq!(snapshot.pages_scanned, 1);
    assert_eq!(snapshot.non_webp_images_found, 1);
    assert!(snapshot.queue_position.is_none());
}

#[tokio::test]
async fn failed_seed_yields_failed_status_with_curated_message() {
    let store = ScanStore::open_in_memory().await.unwrap();
    let queue = Arc::new(FairShareQueue::new(
        store.clone(),
        QueueConfig {
            processor_tick_ms: 10,
            cooldown_secs: 0,
            ..Default::default()
        },
    ));
    let tracker = Arc::new(LiveStatsTracker::new());
    let broadcaster = Arc::new(ProgressBroadcaster::new());
    // No fixture for the URL: every navigation attempt fails.
    let site = ScriptedSite::new();

    let job = queue
        .enqueue(submission("https://unreachable.test/", "ip"))
        .await
        .unwrap();
    let mut rx = broadcaster.subscribe_scan(job.scan_id);

    let processor = Arc::new(QueueProcessor::new(
        Arc::clone(&queue),
        store.clone(),
        Arc::clone(&tracker),
        Arc::clone(&broadcaster),
        Arc::new(ScriptedFactory(site)),
        Arc::new(AllowAllHosts),
        test_crawler_config(),
    ));
    let shutdown = CancellationToken::new();
    let handle = Arc::clone(&processor).spawn(shutdown.clone());

    assert_eq!(wait_terminal(&store, job.scan_id).await, ScanStatus::Failed);
    shutdown.cancel();
    let _ = tokio::time::timeout(Duration::from_secs(5), handle).await;

    let failed = store.fetch_job(job.scan_id).await.unwrap();
    assert_eq!(
        failed.error_message.as_deref(),
        Some("The site could not be reached.")
    );

    let mut saw_failed = false;
    while let Ok(Ok(message)) =
        tokio::time::timeout(Duration::from_millis(200), rx.recv()).await
    {
        if matches!(message, ScanServerMessage::ScanFailed { .. }) {
            saw_failed = true;
            break;
        }
    }
    assert!(saw_failed, "subscriber should receive ScanFailed");

    // Failed scans contribute nothing to lifetime stats.
    let stats = store.fetch_aggregate_stats().await.unwrap();
    assert_eq!(stats.total_scans, 0);
}

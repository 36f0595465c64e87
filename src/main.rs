//! Service entry point: configuration, store, background services, HTTP.

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use tokio_util::sync::CancellationToken;
use tracing::info;
use tracing_subscriber::EnvFilter;

use webpscan::config::{AppConfigBuilder, apply_env_overrides};
use webpscan::crawler::ChromiumFactory;
use webpscan::processor::QueueProcessor;
use webpscan::push::ProgressBroadcaster;
use webpscan::queue::FairShareQueue;
use webpscan::server::{self, AppState};
use webpscan::stats::LiveStatsTracker;
use webpscan::store::ScanStore;
use webpscan::validation::ResolvingHostCheck;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config = AppConfigBuilder::new()
        .build()
        .context("default configuration invalid")?;
    let config = Arc::new(apply_env_overrides(config).context("bad environment override")?);

    let store = ScanStore::open(&config.server.db_path)
        .await
        .context("opening scan store")?;
    tokio::fs::create_dir_all(&config.retention.bundle_dir)
        .await
        .context("creating bundle directory")?;

    let tracker = Arc::new(LiveStatsTracker::new());
    let broadcaster = Arc::new(ProgressBroadcaster::new());
    let queue = Arc::new(FairShareQueue::new(store.clone(), config.queue.clone()));

    let processor = Arc::new(QueueProcessor::new(
        Arc::clone(&queue),
        store.clone(),
        Arc::clone(&tracker),
        Arc::clone(&broadcaster),
        Arc::new(ChromiumFactory::new(config.crawler.clone())),
        Arc::new(ResolvingHostCheck),
        config.crawler.clone(),
    ));

    let recovered = processor
        .recover_interrupted()
        .await
        .context("recovering interrupted scans")?;
    if recovered > 0 {
        info!(recovered, "requeued scans interrupted by previous shutdown");
    }

    let shutdown = CancellationToken::new();
    let processor_task = Arc::clone(&processor).spawn(shutdown.clone());
    let aging_task = Arc::clone(&processor).spawn_aging(shutdown.clone());
    let sweeper_task = webpscan::cleanup::spawn_sweepers(
        store.clone(),
        config.retention.clone(),
        shutdown.clone(),
    );

    let state = AppState::new(
        store.clone(),
        queue,
        tracker,
        broadcaster,
        Arc::clone(&config),
    );
    let app = server::router(state);

    let addr: SocketAddr = config
        .server
        .bind_addr
        .parse()
        .context("parsing bind address")?;
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("binding {addr}"))?;
    info!(%addr, "webpscan listening");

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(async {
        let _ = tokio::signal::ctrl_c().await;
        info!("shutdown signal received");
    })
    .await
    .context("http server")?;

    shutdown.cancel();
    let _ = processor_task.await;
    let _ = aging_task.await;
    let _ = sweeper_task.await;
    store.close().await;
    info!("shutdown complete");
    Ok(())
}

//! HTTP ingress: the REST API of the scan service plus the ws push hub.

mod handlers;
mod rate_limit;
pub mod report;

pub use rate_limit::RateLimiter;

use std::sync::Arc;

use axum::routing::{get, post};
use axum::Router;
use tower_http::trace::TraceLayer;

use crate::config::AppConfig;
use crate::push::ProgressBroadcaster;
use crate::queue::FairShareQueue;
use crate::stats::LiveStatsTracker;
use crate::store::ScanStore;

/// Shared handler state. Cheap to clone.
#[derive(Clone)]
pub struct AppState {
    pub store: ScanStore,
    pub queue: Arc<FairShareQueue>,
    pub tracker: Arc<LiveStatsTracker>,
    pub broadcaster: Arc<ProgressBroadcaster>,
    pub config: Arc<AppConfig>,
    pub rate_limiter: Arc<RateLimiter>,
}

impl AppState {
    #[must_use]
    pub fn new(
        store: ScanStore,
        queue: Arc<FairShareQueue>,
        tracker: Arc<LiveStatsTracker>,
        broadcaster: Arc<ProgressBroadcaster>,
        config: Arc<AppConfig>,
    ) -> Self {
        let rate_limiter = Arc::new(RateLimiter::new(config.security.max_requests_per_minute));
        Self {
            store,
            queue,
            tracker,
            broadcaster,
            config,
            rate_limiter,
        }
    }
}

/// Build the API router.
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/api/scan", post(handlers::submit_scan))
        .route("/api/scan/stats", get(handlers::aggregate_stats))
        .route("/api/scan/{id}/status", get(handlers::scan_status))
        .route("/api/scan/{id}/report", get(handlers::scan_report))
        .route("/api/scan/{id}/images", get(handlers::scan_bundle))
        .route("/api/health", get(handlers::health))
        .route("/api/config", get(handlers::ui_config))
        .route("/hubs/scanprogress", get(handlers::scan_progress_hub))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

//! HTTP handlers for the scan API.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::extract::ws::WebSocketUpgrade;
use axum::extract::{ConnectInfo, Path, State};
use axum::http::{StatusCode, header};
use axum::response::{IntoResponse, Response};
use axum::Json;
use chrono::Utc;
use serde::Deserialize;
use serde_json::json;
use tracing::{info, warn};
use uuid::Uuid;

use crate::models::ScanStatus;
use crate::push::hub::ScanProgressHub;
use crate::push::{publish_queue_positions, snapshot_for};
use crate::queue::{QueueError, ScanSubmission};
use crate::stats::merged_snapshot;
use crate::store::StoreError;
use crate::validation::{HostCheck, ResolvingHostCheck, validate_submission};

use super::report::build_report;
use super::AppState;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScanRequestBody {
    pub url: String,
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default)]
    pub convert_to_web_p: bool,
}

/// POST /api/scan
pub async fn submit_scan(
    State(state): State<AppState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    Json(body): Json<ScanRequestBody>,
) -> Response {
    let ip = addr.ip();
    if !state.rate_limiter.allow(ip) {
        return error_response(StatusCode::TOO_MANY_REQUESTS, "RateLimited", "rate limit exceeded");
    }

    let enforce_https = state.config.security.enforce_https;
    let parsed = match validate_submission(&body.url, body.email.as_deref(), enforce_https) {
        Ok(url) => url,
        Err(reasons) => {
            let codes: Vec<&str> = reasons.iter().map(|r| r.code()).collect();
            return (
                StatusCode::BAD_REQUEST,
                Json(json!({ "error": "ValidationFailed", "reasons": codes })),
            )
                .into_response();
        }
    };

    // Admission-time DNS gate; the crawler re-checks per page.
    if ResolvingHostCheck.check_url(&parsed).await.is_err() {
        return (
            StatusCode::BAD_REQUEST,
            Json(json!({ "error": "ValidationFailed", "reasons": ["UrlBlockedHost"] })),
        )
            .into_response();
    }

    let email = if state.config.server.email_enabled {
        body.email
    } else {
        None
    };
    let submission = ScanSubmission {
        target_url: parsed.to_string(),
        email,
        submitter_ip: Some(ip.to_string()),
        convert_to_webp: body.convert_to_web_p,
    };

    match state.queue.enqueue(submission).await {
        Ok(job) => {
            info!(scan_id = %job.scan_id, url = %job.target_url, "scan submitted");
            let position = state
                .queue
                .position_of(job.scan_id)
                .await
                .ok()
                .flatten()
                .unwrap_or(1);
            if let Err(e) = publish_queue_positions(
                &state.queue,
                &state.tracker,
                &state.broadcaster,
                state.config.crawler.max_pages_per_scan as i64,
            )
            .await
            {
                warn!("queue position publish failed: {e}");
            }
            (
                StatusCode::CREATED,
                Json(json!({ "scanId": job.scan_id, "queuePosition": position })),
            )
                .into_response()
        }
        Err(err @ QueueError::QueueFull) => {
            error_response(StatusCode::SERVICE_UNAVAILABLE, err.code(), "queue is full")
        }
        Err(err @ (QueueError::IpLimit | QueueError::Cooldown)) => {
            error_response(StatusCode::CONFLICT, err.code(), "submission limit reached")
        }
        Err(err) => {
            warn!("enqueue failed: {err}");
            error_response(
                StatusCode::INTERNAL_SERVER_ERROR,
                err.code(),
                "internal error",
            )
        }
    }
}

/// GET /api/scan/{id}/status
pub async fn scan_status(
    State(state): State<AppState>,
    Path(scan_id): Path<Uuid>,
) -> Response {
    match snapshot_for(&state.store, &state.tracker, scan_id).await {
        Ok(snapshot) => (StatusCode::OK, Json(snapshot)).into_response(),
        Err(StoreError::NotFound) => not_found(),
        Err(e) => internal_error(e),
    }
}

/// GET /api/scan/{id}/report
pub async fn scan_report(
    State(state): State<AppState>,
    Path(scan_id): Path<Uuid>,
) -> Response {
    let job = match state.store.fetch_job(scan_id).await {
        Ok(job) => job,
        Err(StoreError::NotFound) => return not_found(),
        Err(e) => return internal_error(e),
    };
    if job.status != ScanStatus::Completed {
        return error_response(
            StatusCode::CONFLICT,
            "NotCompleted",
            "report is available once the scan completes",
        );
    }

    match build_report(&state.store, &job).await {
        Ok(report) => {
            let body = match serde_json::to_vec_pretty(&report) {
                Ok(body) => body,
                Err(e) => return internal_error(e),
            };
            (
                StatusCode::OK,
                [
                    (header::CONTENT_TYPE, "application/json".to_string()),
                    (
                        header::CONTENT_DISPOSITION,
                        format!("attachment; filename=\"webpscan-report-{scan_id}.json\""),
                    ),
                ],
                body,
            )
                .into_response()
        }
        Err(e) => internal_error(e),
    }
}

/// GET /api/scan/{id}/images
pub async fn scan_bundle(
    State(state): State<AppState>,
    Path(scan_id): Path<Uuid>,
) -> Response {
    let bundle = match state.store.fetch_bundle_for_scan(scan_id).await {
        Ok(Some(bundle)) => bundle,
        Ok(None) => return not_found(),
        Err(e) => return internal_error(e),
    };
    if bundle.expires_at < Utc::now() {
        return error_response(StatusCode::GONE, "Expired", "download has expired");
    }

    match tokio::fs::read(&bundle.file_path).await {
        Ok(bytes) => (
            StatusCode::OK,
            [
                (header::CONTENT_TYPE, "application/octet-stream".to_string()),
                (
                    header::CONTENT_DISPOSITION,
                    format!("attachment; filename=\"webpscan-images-{scan_id}.zip\""),
                ),
            ],
            bytes,
        )
            .into_response(),
        Err(_) => not_found(),
    }
}

/// GET /api/scan/stats
pub async fn aggregate_stats(State(state): State<AppState>) -> Response {
    match merged_snapshot(&state.store, &state.tracker).await {
        Ok(stats) => (StatusCode::OK, Json(stats)).into_response(),
        Err(e) => internal_error(e),
    }
}

/// GET /api/health
pub async fn health(State(state): State<AppState>) -> Response {
    let queued = state.store.queued_count().await.unwrap_or(-1);
    let processing = state.store.processing_count().await.unwrap_or(-1);
    (
        StatusCode::OK,
        Json(json!({
            "status": "ok",
            "queued": queued,
            "processing": processing,
            "timestamp": Utc::now(),
        })),
    )
        .into_response()
}

/// GET /api/config
pub async fn ui_config(State(state): State<AppState>) -> Response {
    (
        StatusCode::OK,
        Json(json!({ "emailEnabled": state.config.server.email_enabled })),
    )
        .into_response()
}

/// GET /hubs/scanprogress
pub async fn scan_progress_hub(
    State(state): State<AppState>,
    upgrade: WebSocketUpgrade,
) -> Response {
    let hub = Arc::new(ScanProgressHub {
        store: state.store.clone(),
        tracker: Arc::clone(&state.tracker),
        broadcaster: Arc::clone(&state.broadcaster),
    });
    upgrade.on_upgrade(move |socket| hub.handle_socket(socket))
}

fn error_response(status: StatusCode, code: &str, message: &str) -> Response {
    (status, Json(json!({ "error": code, "message": message }))).into_response()
}

fn not_found() -> Response {
    error_response(StatusCode::NOT_FOUND, "NotFound", "no such scan")
}

fn internal_error(err: impl std::fmt::Display) -> Response {
    warn!("request failed: {err}");
    error_response(
        StatusCode::INTERNAL_SERVER_ERROR,
        "Internal",
        "internal error",
    )
}

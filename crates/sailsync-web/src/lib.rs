//! HTTP surface: supplier webhook intake, admin triggers, lock and pool status.

use std::sync::Arc;
use std::time::Duration;

use axum::{
    body::Bytes,
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use chrono::Utc;
use sailsync_core::TriggerSource;
use sailsync_storage::PoolState;
use sailsync_sync::{normalize_webhook, Admission, IntakeError, SyncEngine};
use serde::Deserialize;
use serde_json::json;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{debug, info, warn};

pub const CRATE_NAME: &str = "sailsync-web";

#[derive(Clone)]
pub struct AppState {
    pub engine: Arc<SyncEngine>,
    /// How long the webhook waits for its event to be logged before acking anyway.
    pub intake_timeout: Duration,
}

impl AppState {
    pub fn new(engine: Arc<SyncEngine>) -> Self {
        Self {
            engine,
            intake_timeout: Duration::from_secs(2),
        }
    }
}

#[derive(Debug, Default, Deserialize)]
struct SyncQuery {
    #[serde(default)]
    force: bool,
}

pub fn app(state: AppState) -> Router {
    Router::new()
        .route("/webhooks/traveltek", post(webhook_handler))
        .route("/admin/scopes/{line_id}/sync", post(admin_sync_handler))
        .route("/admin/scopes/{line_id}/lock", get(lock_handler))
        .route("/health", get(health_handler))
        .with_state(Arc::new(state))
}

pub async fn serve(engine: Arc<SyncEngine>, mut shutdown: watch::Receiver<bool>) -> anyhow::Result<()> {
    let port = engine.config().web_port;
    let listener = TcpListener::bind(("0.0.0.0", port)).await?;
    info!(port, "http listening");
    axum::serve(listener, app(AppState::new(engine)))
        .with_graceful_shutdown(async move {
            let _ = shutdown.wait_for(|stop| *stop).await;
        })
        .await?;
    Ok(())
}

fn received() -> Response {
    (StatusCode::OK, Json(json!({ "received": true }))).into_response()
}

/// Always answers 200. The event is logged on a detached task so a slow store
/// delays the ack by at most `intake_timeout` and never loses the trigger.
async fn webhook_handler(State(state): State<Arc<AppState>>, body: Bytes) -> Response {
    let trigger = match normalize_webhook(state.engine.mapping(), &body, Utc::now()) {
        Ok(trigger) => trigger,
        Err(err) => {
            warn!(error = %err, bytes = body.len(), "webhook ignored");
            return received();
        }
    };

    let engine = Arc::clone(&state.engine);
    let admit = tokio::spawn(async move { engine.submit(&trigger).await });
    match tokio::time::timeout(state.intake_timeout, admit).await {
        Ok(Ok(Ok(admission))) => debug!(event = %admission.event_id(), queued = admission.is_queued(), "webhook admitted"),
        Ok(Ok(Err(err))) => warn!(error = %err, "webhook event not recorded"),
        Ok(Err(err)) => warn!(error = %err, "webhook intake task failed"),
        Err(_) => warn!("webhook intake still running; acknowledging anyway"),
    }
    received()
}

async fn admin_sync_handler(
    State(state): State<Arc<AppState>>,
    Path(line_id): Path<i32>,
    Query(query): Query<SyncQuery>,
) -> Response {
    match state
        .engine
        .request_sync(line_id, query.force, TriggerSource::Admin)
        .await
    {
        Ok(Admission::Queued { event_id }) => (
            StatusCode::ACCEPTED,
            Json(json!({ "status": "queued", "event_id": event_id })),
        )
            .into_response(),
        Ok(Admission::Deduplicated { event_id, reason }) => (
            StatusCode::OK,
            Json(json!({ "status": "deduplicated", "reason": reason, "event_id": event_id })),
        )
            .into_response(),
        Err(err) => match err.downcast_ref::<IntakeError>() {
            Some(intake) => not_found(intake.to_string()),
            None => server_error(err),
        },
    }
}

async fn lock_handler(State(state): State<Arc<AppState>>, Path(line_id): Path<i32>) -> Response {
    let Some(scope_id) = state.engine.mapping().canonical(line_id) else {
        return not_found(IntakeError::UnmappedLine(line_id).to_string());
    };
    match state.engine.lock_status(scope_id).await {
        Ok(Some(lock)) => Json(lock).into_response(),
        Ok(None) => not_found(format!("no lock recorded for cruise line {scope_id}")),
        Err(err) => server_error(err.into()),
    }
}

async fn health_handler(State(state): State<Arc<AppState>>) -> Response {
    let stats = state.engine.pool().stats();
    let status = match stats.state {
        PoolState::Healthy => "ok",
        _ => "degraded",
    };
    Json(json!({ "status": status, "pool": stats })).into_response()
}

fn not_found(message: String) -> Response {
    (StatusCode::NOT_FOUND, Json(json!({ "error": message }))).into_response()
}

fn server_error(err: anyhow::Error) -> Response {
    warn!(error = %format!("{err:#}"), "request failed");
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(json!({ "error": err.to_string() })),
    )
        .into_response()
}

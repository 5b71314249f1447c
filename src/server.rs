//! HTTP ingress — webhooks, manual retry, health, and status.
//!
//! Webhook bodies are verified against the provider's HMAC secret before
//! any parsing happens, so malformed JSON can never reach the filter with
//! an unverified signature. Responses return as soon as admission
//! completes; task execution is the processor's business.

use crate::config::Config;
use crate::engine::queue::TaskQueue;
use crate::engine::Processor;
use crate::providers::{IssueProvider, ProviderKind, ProviderRegistry, Trigger, WebhookEvent};
use crate::task::{Task, TaskStatus};
use axum::body::Bytes;
use axum::extract::{ConnectInfo, Path, Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Deserialize;
use serde_json::json;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;
use tokio::net::TcpListener;

pub struct AppState {
    pub config: Arc<Config>,
    pub queue: Arc<TaskQueue>,
    pub providers: Arc<ProviderRegistry>,
    pub processor: Arc<Processor>,
    pub started_at: Instant,
}

pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/webhook/{provider}", post(handle_webhook))
        .route("/retry/{issue_id}", post(handle_retry))
        .route("/health", get(handle_health))
        .route("/status", get(handle_status))
        .with_state(state)
}

/// Bind and serve until SIGINT/SIGTERM.
pub async fn serve(state: Arc<AppState>, port: u16) -> anyhow::Result<()> {
    let listener = TcpListener::bind(("0.0.0.0", port))
        .await
        .map_err(|e| anyhow::anyhow!("failed to bind port {port}: {e}"))?;
    tracing::info!(port, "http server listening");

    let app = router(state);
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal())
    .await
    .map_err(|e| anyhow::anyhow!("http server exited unexpectedly: {e}"))
}

async fn shutdown_signal() {
    let sigterm = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                tracing::warn!(?e, "failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };
    tokio::select! {
        _ = tokio::signal::ctrl_c() => tracing::info!("received SIGINT, shutting down"),
        _ = sigterm => tracing::info!("received SIGTERM, shutting down"),
    }
}

fn error_response(status: StatusCode, message: &str) -> Response {
    (status, Json(json!({ "error": message }))).into_response()
}

// ── Admission ────────────────────────────────────────────────────────

enum AdmitOutcome {
    Enqueued { identifier: String },
    Duplicate,
    NotFound,
    RepoUnresolved { identifier: String },
}

/// Shared admission pipeline: fetch, resolve repository, derive the
/// workspace, insert, wake the processor. Duplicate detection stays inside
/// the queue's `add`.
async fn admit(
    state: &AppState,
    provider: &Arc<dyn IssueProvider>,
    issue_id: &str,
) -> anyhow::Result<AdmitOutcome> {
    let Some(issue) = provider.get_issue(issue_id).await? else {
        return Ok(AdmitOutcome::NotFound);
    };

    let Some(repo) = provider.repository(&issue) else {
        return Ok(AdmitOutcome::RepoUnresolved {
            identifier: issue.identifier,
        });
    };

    let branch = provider.branch_name(&issue);
    let task = Task {
        provider: provider.kind(),
        issue_id: issue.id.clone(),
        identifier: issue.identifier.clone(),
        repo,
        workspace: state.config.worktrees.join(&branch),
        title: issue.title.clone(),
        status: TaskStatus::Queued,
        started_at: None,
    };

    if !state.queue.add(task) {
        return Ok(AdmitOutcome::Duplicate);
    }
    tracing::info!(
        issue = %issue.identifier,
        provider = %provider.kind(),
        "task enqueued"
    );
    state.processor.trigger();
    Ok(AdmitOutcome::Enqueued {
        identifier: issue.identifier,
    })
}

// ── Handlers ─────────────────────────────────────────────────────────

async fn handle_webhook(
    State(state): State<Arc<AppState>>,
    Path(provider_name): Path<String>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let provider = ProviderKind::parse(&provider_name).and_then(|kind| state.providers.get(kind));
    let Some(provider) = provider else {
        return error_response(
            StatusCode::SERVICE_UNAVAILABLE,
            &format!("provider {provider_name} is not configured"),
        );
    };

    if let Err(e) = provider.verify_webhook(&body, &headers) {
        tracing::warn!(
            provider = %provider_name,
            client = %addr.ip(),
            reason = %e,
            "webhook signature rejected"
        );
        return error_response(StatusCode::UNAUTHORIZED, "Invalid signature");
    }

    let payload: serde_json::Value = match serde_json::from_slice(&body) {
        Ok(payload) => payload,
        Err(_) => return error_response(StatusCode::BAD_REQUEST, "Invalid JSON payload"),
    };
    let event = WebhookEvent {
        name: headers
            .get("x-github-event")
            .and_then(|v| v.to_str().ok())
            .map(String::from),
        payload,
    };

    let trigger = match provider.should_trigger(&event).await {
        Ok(trigger) => trigger,
        Err(e) => {
            tracing::error!(provider = %provider_name, ?e, "trigger filter failed");
            return error_response(StatusCode::INTERNAL_SERVER_ERROR, "trigger filter failed");
        }
    };

    let issue_id = match trigger {
        Trigger::Ignore => {
            return (StatusCode::OK, Json(json!({ "status": "ignored" }))).into_response();
        }
        Trigger::Admit { issue_id, label } => {
            tracing::info!(provider = %provider_name, issue_id = %issue_id, label = %label, "trigger label added");
            issue_id
        }
    };

    match admit(&state, &provider, &issue_id).await {
        Ok(AdmitOutcome::Enqueued { identifier }) => (
            StatusCode::OK,
            Json(json!({ "status": "enqueued", "issueId": identifier })),
        )
            .into_response(),
        Ok(AdmitOutcome::Duplicate) => (
            StatusCode::OK,
            Json(json!({ "status": "already_processing" })),
        )
            .into_response(),
        Ok(AdmitOutcome::NotFound) => {
            error_response(StatusCode::BAD_REQUEST, "Issue not found upstream")
        }
        Ok(AdmitOutcome::RepoUnresolved { identifier }) => error_response(
            StatusCode::BAD_REQUEST,
            &format!(
                "Could not resolve a repository for issue {identifier}; \
                 check the provider's repository configuration"
            ),
        ),
        Err(e) => {
            tracing::error!(provider = %provider_name, issue_id = %issue_id, ?e, "admission failed");
            error_response(StatusCode::INTERNAL_SERVER_ERROR, "admission failed")
        }
    }
}

#[derive(Debug, Deserialize)]
struct RetryParams {
    provider: Option<String>,
}

async fn handle_retry(
    State(state): State<Arc<AppState>>,
    Path(issue_id): Path<String>,
    Query(params): Query<RetryParams>,
) -> Response {
    let provider = params
        .provider
        .as_deref()
        .and_then(ProviderKind::parse)
        .and_then(|kind| state.providers.get(kind));
    let Some(provider) = provider else {
        return error_response(StatusCode::BAD_REQUEST, "provider is not configured");
    };

    match admit(&state, &provider, &issue_id).await {
        Ok(AdmitOutcome::Enqueued { identifier }) => (
            StatusCode::OK,
            Json(json!({ "status": "enqueued", "issueId": identifier })),
        )
            .into_response(),
        Ok(AdmitOutcome::Duplicate) => error_response(
            StatusCode::CONFLICT,
            "Task is already queued or running for this issue",
        ),
        Ok(AdmitOutcome::NotFound) => error_response(StatusCode::NOT_FOUND, "Issue not found"),
        Ok(AdmitOutcome::RepoUnresolved { identifier }) => error_response(
            StatusCode::BAD_REQUEST,
            &format!(
                "Could not resolve a repository for issue {identifier}; \
                 check the provider's repository configuration"
            ),
        ),
        Err(e) => {
            tracing::error!(issue_id = %issue_id, ?e, "retry admission failed");
            error_response(StatusCode::INTERNAL_SERVER_ERROR, "admission failed")
        }
    }
}

async fn handle_health(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(json!({
        "status": "ok",
        "uptime_seconds": state.started_at.elapsed().as_secs(),
        "providers": state.providers.names(),
    }))
}

async fn handle_status(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let queue = state.queue.status();
    Json(json!({
        "queued": queue.queued,
        "running": queue.running,
        "running_tasks": queue.running_tasks,
        "providers": state.providers.names(),
    }))
}

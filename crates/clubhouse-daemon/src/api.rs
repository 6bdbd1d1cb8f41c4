//! Operator HTTP API.
//!
//! | Route | Method | Effect |
//! |-------|--------|--------|
//! | `/status` | GET | Chain view, session, and ticket list |
//! | `/tickets` | POST | Allocate a ticket |
//! | `/session/reset` | POST | Start a new session (requires confirmation) |
//! | `/metrics` | GET | Prometheus metrics |
//!
//! The server binds to localhost by default. Allocation and reset write to
//! the counter store, so they run on the blocking pool.

use std::sync::Arc;

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use clubhouse_core::engine::{AccessEngine, ResetConfirmation};
use clubhouse_core::session::{SessionError, Ticket};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::net::TcpListener;
use tracing::{error, info};

use crate::ledger::ChainHead;
use crate::metrics::{MetricsError, SharedMetricsRegistry};
use crate::state::SharedState;

/// How long a newly resolved head counts as fresh.
pub const HEAD_FRESHNESS_WINDOW_MS: i64 = 5_100;

/// State shared by all handlers.
#[derive(Clone)]
pub struct ApiState {
    /// Admission state.
    pub engine: Arc<AccessEngine>,
    /// Ledger view and shutdown flag.
    pub daemon: SharedState,
    /// Metrics registry.
    pub metrics: SharedMetricsRegistry,
    /// Contract being watched, echoed in `/status`.
    pub contract_address: Arc<str>,
}

/// Errors returned by API handlers.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum ApiError {
    /// The engine refused or failed the operation.
    #[error(transparent)]
    Session(#[from] SessionError),

    /// Metrics could not be encoded.
    #[error(transparent)]
    Metrics(#[from] MetricsError),

    /// A blocking task panicked or was cancelled.
    #[error("internal error: {0}")]
    Internal(String),
}

impl ApiError {
    fn status(&self) -> StatusCode {
        match self {
            Self::Session(SessionError::ConfirmationMismatch { .. }) => StatusCode::CONFLICT,
            Self::Session(_) | Self::Metrics(_) | Self::Internal(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            },
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            error!(error = %self, "request failed");
        }
        (status, Json(ErrorBody {
            error: self.to_string(),
        }))
            .into_response()
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct ErrorBody {
    error: String,
}

/// Approval state of one ticket.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TicketState {
    /// The ticket's challenge has been observed on the ledger.
    Approved,
    /// Still waiting for the authorization.
    Waiting,
}

/// One row of the ticket list.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TicketStatus {
    /// Ticket number.
    pub number: u64,
    /// Approval state.
    pub state: TicketState,
}

/// Body of `GET /status`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusResponse {
    /// Whether the last ledger call succeeded.
    pub connected: bool,
    /// Whether the node reported it is syncing.
    pub is_syncing: Option<bool>,
    /// Latest head.
    pub head: Option<ChainHead>,
    /// Whether a resolved head arrived recently.
    pub head_fresh: bool,
    /// Contract being watched.
    pub contract_address: String,
    /// Current session id.
    pub session_id: String,
    /// Tickets allocated in this session.
    pub allocation_count: u64,
    /// Approved tickets, ascending.
    pub approved: Vec<u64>,
    /// Most recently allocated ticket.
    pub latest_ticket: Option<Ticket>,
    /// Every ticket of the session with its state.
    pub tickets: Vec<TicketStatus>,
    /// Seconds since the daemon started.
    pub uptime_secs: u64,
}

/// Body of `POST /session/reset`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResetResponse {
    /// The discarded session.
    pub previous_session_id: String,
    /// The new session.
    pub session_id: String,
}

/// Builds the API router.
pub fn router(state: ApiState) -> Router {
    Router::new()
        .route("/", get(index))
        .route("/status", get(status))
        .route("/tickets", post(allocate_ticket))
        .route("/session/reset", post(reset_session))
        .route("/metrics", get(metrics))
        .with_state(state)
}

/// Serves `router` on `listener` until shutdown is requested.
///
/// # Errors
///
/// Returns an error if the server fails.
pub async fn serve(listener: TcpListener, router: Router, daemon: SharedState) -> std::io::Result<()> {
    if let Ok(addr) = listener.local_addr() {
        info!(addr = %addr, "API server listening");
    }
    axum::serve(listener, router)
        .with_graceful_shutdown(async move { daemon.shutdown_requested().await })
        .await
}

async fn index() -> &'static str {
    "clubhouse-daemon\n\n\
     GET  /status        - chain and ticket status\n\
     POST /tickets       - allocate a ticket\n\
     POST /session/reset - start a new session\n\
     GET  /metrics       - Prometheus metrics\n"
}

async fn status(State(api): State<ApiState>) -> Result<Json<StatusResponse>, ApiError> {
    let engine = Arc::clone(&api.engine);
    let snapshot = tokio::task::spawn_blocking(move || engine.snapshot())
        .await
        .map_err(|e| ApiError::Internal(e.to_string()))?;
    let view = api.daemon.read().await.clone();

    let tickets = (1..=snapshot.allocation_count)
        .map(|number| TicketStatus {
            number,
            state: if snapshot.approved.binary_search(&number).is_ok() {
                TicketState::Approved
            } else {
                TicketState::Waiting
            },
        })
        .collect();

    Ok(Json(StatusResponse {
        connected: view.connected,
        is_syncing: view.is_syncing,
        head_fresh: view.is_fresh(chrono::Duration::milliseconds(HEAD_FRESHNESS_WINDOW_MS)),
        head: view.head,
        contract_address: api.contract_address.to_string(),
        session_id: snapshot.session_id.to_string(),
        allocation_count: snapshot.allocation_count,
        approved: snapshot.approved,
        latest_ticket: snapshot.latest_ticket,
        tickets,
        uptime_secs: api.daemon.uptime_secs(),
    }))
}

async fn allocate_ticket(
    State(api): State<ApiState>,
) -> Result<(StatusCode, Json<Ticket>), ApiError> {
    let engine = Arc::clone(&api.engine);
    let (ticket, outcome) = tokio::task::spawn_blocking(move || engine.allocate_and_reconcile())
        .await
        .map_err(|e| ApiError::Internal(e.to_string()))??;

    let metrics = api.metrics.clubhouse_metrics();
    metrics.ticket_allocated();
    if outcome.newly_approved().is_some() {
        metrics.ticket_approved();
    }
    info!(ticket = ticket.number, "ticket allocated");
    Ok((StatusCode::CREATED, Json(ticket)))
}

async fn reset_session(
    State(api): State<ApiState>,
    Json(confirmation): Json<ResetConfirmation>,
) -> Result<Json<ResetResponse>, ApiError> {
    let engine = Arc::clone(&api.engine);
    let previous = confirmation.confirm_session_id.clone();
    let session_id = tokio::task::spawn_blocking(move || engine.reset_session(&confirmation))
        .await
        .map_err(|e| ApiError::Internal(e.to_string()))??;

    api.metrics.clubhouse_metrics().session_reset();
    Ok(Json(ResetResponse {
        previous_session_id: previous,
        session_id: session_id.to_string(),
    }))
}

async fn metrics(State(api): State<ApiState>) -> Result<Response, ApiError> {
    let body = api.metrics.encode_text()?;
    Ok((
        StatusCode::OK,
        [("content-type", "text/plain; version=0.0.4; charset=utf-8")],
        body,
    )
        .into_response())
}

//! Status API (hub)
//!
//! Read-only HTTP view of the running pilot: the live tunnel snapshot, the
//! last evaluation, and per-candidate results. Handlers only read owned
//! snapshots and never touch the Supervisor's mutable state.

mod common;

pub use common::{ApiError, ApiResult};

use crate::controller::EvaluationSlot;
use crate::pool::CandidatePool;
use crate::select::{EvaluationSummary, NonViable, RankedEntry};
use crate::supervisor::{Supervisor, TunnelSnapshot};
use crate::{Result, VERSION};

use axum::{
    extract::{Path, State},
    routing::get,
    Json, Router,
};
use serde::Serialize;
use serde_json::{json, Value};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;
use tracing::info;

/// Application state shared across all handlers
#[derive(Clone)]
pub struct AppState {
    pub supervisor: Arc<Supervisor>,
    pub pool: Arc<CandidatePool>,
    pub evaluations: EvaluationSlot,
    /// Output of `<binary> version` at startup
    pub tunnel_version: String,
}

impl AppState {
    pub fn new(
        supervisor: Arc<Supervisor>,
        pool: Arc<CandidatePool>,
        evaluations: EvaluationSlot,
        tunnel_version: String,
    ) -> Self {
        AppState {
            supervisor,
            pool,
            evaluations,
            tunnel_version,
        }
    }

    fn last_evaluation(&self) -> Option<EvaluationSummary> {
        self.evaluations.read().clone()
    }
}

#[derive(Debug, Serialize)]
pub struct StatusResponse {
    pub tunnel: TunnelSnapshot,
    pub candidates: Vec<String>,
    pub evaluation: Option<EvaluationSummary>,
}

/// Latest known result for one candidate
#[derive(Debug, Serialize)]
pub struct CandidateResponse {
    pub id: String,
    pub path: String,
    pub active: bool,
    /// Position in the last ranking, 1-based
    pub rank: Option<usize>,
    pub score_ms: Option<f64>,
    pub non_viable: Option<NonViable>,
}

/// Create the status router
pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/", get(hello))
        .route("/version", get(version))
        .route("/status", get(status))
        .route("/candidates/:id", get(candidate))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Serve the status API until `shutdown` fires
pub async fn start_server(
    state: AppState,
    addr: SocketAddr,
    shutdown: CancellationToken,
) -> Result<()> {
    let router = create_router(state);
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!("Status API listening on {}", listener.local_addr()?);
    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown.cancelled_owned())
        .await?;
    Ok(())
}

async fn hello() -> Json<Value> {
    Json(json!({ "hello": "tunnel-pilot" }))
}

async fn version(State(state): State<AppState>) -> Json<Value> {
    Json(json!({
        "version": format!("tunnel-pilot {}", VERSION),
        "tunnel": state.tunnel_version,
    }))
}

async fn status(State(state): State<AppState>) -> Json<StatusResponse> {
    Json(StatusResponse {
        tunnel: state.supervisor.snapshot(),
        candidates: state.pool.ids(),
        evaluation: state.last_evaluation(),
    })
}

async fn candidate(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<Json<CandidateResponse>> {
    let Some(candidate) = state.pool.get(&id) else {
        return Err(ApiError::not_found(&format!("candidate '{}'", id)));
    };

    let snapshot = state.supervisor.snapshot();
    let evaluation = state.last_evaluation();
    let ranked: Option<(usize, &RankedEntry)> = evaluation.as_ref().and_then(|e| {
        e.ranking
            .iter()
            .enumerate()
            .find(|(_, r)| r.candidate == id)
    });

    Ok(Json(CandidateResponse {
        id: id.clone(),
        path: candidate.path().display().to_string(),
        active: snapshot.candidate.as_deref() == Some(id.as_str()),
        rank: ranked.map(|(i, _)| i + 1),
        score_ms: ranked.map(|(_, r)| r.score_ms),
        non_viable: evaluation
            .as_ref()
            .and_then(|e| e.non_viable.iter().find(|n| n.candidate == id).cloned()),
    }))
}

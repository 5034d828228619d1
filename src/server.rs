use std::net::SocketAddr;

use anyhow::{Context, Result};
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::{Json, Router};
use serde::Serialize;
use tracing::info;

use crate::cycle::SharedLastRecord;

#[derive(Clone)]
pub struct ServerState {
    pub last_record: SharedLastRecord,
}

/// Always-200 monitoring summary. Every `last_*` field is null until the
/// first cycle completes.
#[derive(Debug, Serialize)]
struct HealthResponse {
    ok: bool,
    last_cycle_utc: Option<String>,
    last_cycle_local: Option<String>,
    last_confidence: Option<f64>,
    last_actuation_errors: Option<Vec<String>>,
    last_actuation_ok: Option<bool>,
    last_decision_id: Option<String>,
}

pub fn build_router(state: ServerState) -> Router {
    Router::new()
        .route("/healthz", get(health))
        .route("/last-decision", get(last_decision))
        .with_state(state)
}

pub async fn serve(state: ServerState, port: u16) -> Result<()> {
    let bind_addr: SocketAddr = ([0, 0, 0, 0], port).into();
    let listener = tokio::net::TcpListener::bind(bind_addr)
        .await
        .with_context(|| format!("Failed to bind {bind_addr}"))?;
    info!(%bind_addr, "HTTP server listening");
    axum::serve(listener, build_router(state))
        .await
        .context("HTTP server error")?;
    Ok(())
}

async fn health(State(state): State<ServerState>) -> Json<HealthResponse> {
    let guard = state.last_record.read().await;
    let last = guard.as_ref();
    Json(HealthResponse {
        ok: true,
        last_cycle_utc: last.map(|r| r.timestamp_utc_iso.clone()),
        last_cycle_local: last.map(|r| r.timestamp_local_iso.clone()),
        last_confidence: last.map(|r| r.decision.confidence_0_1),
        last_actuation_errors: last.map(|r| r.actuation.errors.clone()),
        last_actuation_ok: last.map(|r| r.actuation.actuation_ok),
        last_decision_id: last.map(|r| r.decision_id.clone()),
    })
}

/// Most recent cycle record, or 404 before the first cycle completes.
async fn last_decision(State(state): State<ServerState>) -> impl IntoResponse {
    let record = state.last_record.read().await.clone();
    match record {
        Some(record) => Json(record).into_response(),
        None => (StatusCode::NOT_FOUND, "no cycle has completed yet").into_response(),
    }
}

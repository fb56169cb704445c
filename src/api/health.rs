//! Health check endpoints

use std::sync::Arc;

use axum::{Json, Router, extract::State, http::StatusCode, routing::get};
use serde::Serialize;

use super::ApiState;
use crate::ledger::LedgerMode;

/// Health check response
#[derive(Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub version: &'static str,
}

/// Readiness response
#[derive(Serialize)]
pub struct ReadinessResponse {
    pub status: &'static str,
    pub ledger: LedgerCheck,
    pub pending_turns: usize,
}

#[derive(Serialize)]
pub struct LedgerCheck {
    pub mode: LedgerMode,
    pub backend: &'static str,
}

/// Liveness check: is the service running?
async fn health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
    })
}

/// Readiness check
///
/// A degraded ledger still serves traffic, so this stays 200 and reports
/// the mode instead of failing the check.
async fn ready(State(state): State<Arc<ApiState>>) -> (StatusCode, Json<ReadinessResponse>) {
    let dispatcher = &state.dispatcher;
    let mode = dispatcher.ledger_mode();

    let status = match mode {
        LedgerMode::Durable => "ok",
        LedgerMode::Degraded => "degraded",
    };

    (
        StatusCode::OK,
        Json(ReadinessResponse {
            status,
            ledger: LedgerCheck {
                mode,
                backend: dispatcher.ledger_backend(),
            },
            pending_turns: dispatcher.aggregator().pending_turns(),
        }),
    )
}

/// Build health router
pub fn router(state: Arc<ApiState>) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/health/ready", get(ready))
        .with_state(state)
}

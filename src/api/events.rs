//! Generic event ingress and pipeline stats
//!
//! For adapters other than Messenger and for tooling: events arrive already
//! normalized and skip classification.

use std::sync::Arc;

use axum::{
    Json, Router,
    extract::State,
    http::StatusCode,
    routing::{get, post},
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::ApiState;
use crate::dispatcher::Submitted;
use crate::events::{EventKind, EventPayload};
use crate::turns::StatsSnapshot;

/// Normalized inbound event
#[derive(Debug, Deserialize)]
pub struct SubmitEventRequest {
    pub user_id: String,
    pub kind: EventKind,
    pub payload: EventPayload,
    /// Defaults to the time the request arrived
    pub received_at: Option<DateTime<Utc>>,
    pub source_message_id: String,
}

#[derive(Debug, Serialize)]
pub struct SubmitEventResponse {
    pub accepted: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub outcome: Option<Submitted>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

async fn submit_event(
    State(state): State<Arc<ApiState>>,
    Json(req): Json<SubmitEventRequest>,
) -> (StatusCode, Json<SubmitEventResponse>) {
    let received_at = req.received_at.unwrap_or_else(Utc::now);

    match state
        .dispatcher
        .submit_event(&req.user_id, req.kind, req.payload, received_at, &req.source_message_id)
        .await
    {
        Ok(outcome) => (
            StatusCode::ACCEPTED,
            Json(SubmitEventResponse {
                accepted: true,
                outcome: Some(outcome),
                error: None,
            }),
        ),
        Err(e) => {
            tracing::warn!(user_id = %req.user_id, error = %e, "rejected event");
            (
                StatusCode::BAD_REQUEST,
                Json(SubmitEventResponse {
                    accepted: false,
                    outcome: None,
                    error: Some(e.to_string()),
                }),
            )
        }
    }
}

async fn stats(State(state): State<Arc<ApiState>>) -> Json<StatsSnapshot> {
    Json(state.dispatcher.stats())
}

/// Build events router
pub fn router(state: Arc<ApiState>) -> Router {
    Router::new()
        .route("/events", post(submit_event))
        .route("/stats", get(stats))
        .with_state(state)
}

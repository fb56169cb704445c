//! Facebook Messenger webhook handler
//!
//! Receives page webhooks, checks the `X-Hub-Signature-256` header, and
//! submits every classified event to the dispatcher.

use std::sync::Arc;

use axum::{
    body::Bytes,
    extract::{Query, State},
    http::{HeaderMap, StatusCode},
};
use chrono::Utc;
use serde::Deserialize;

use crate::api::ApiState;
use crate::channels::messenger::{self, types::MessengerWebhook};
use crate::dispatcher::Submitted;
use crate::events::classify::classify_webhook;

const SIGNATURE_HEADER: &str = "x-hub-signature-256";

/// Subscription handshake parameters
#[derive(Debug, Deserialize)]
pub struct VerifyParams {
    #[serde(rename = "hub.mode")]
    pub mode: Option<String>,
    #[serde(rename = "hub.verify_token")]
    pub verify_token: Option<String>,
    #[serde(rename = "hub.challenge")]
    pub challenge: Option<String>,
}

/// Answer Messenger's subscription check by echoing the challenge
pub async fn verify_subscription(
    State(state): State<Arc<ApiState>>,
    Query(params): Query<VerifyParams>,
) -> (StatusCode, String) {
    match messenger::verify_subscription(
        params.mode.as_deref(),
        params.verify_token.as_deref(),
        params.challenge.as_deref(),
        state.verify_token.as_ref(),
    ) {
        Some(challenge) => {
            tracing::info!("Messenger webhook subscription verified");
            (StatusCode::OK, challenge.to_string())
        }
        None => {
            tracing::warn!(mode = ?params.mode, "Messenger webhook verification rejected");
            (StatusCode::FORBIDDEN, String::new())
        }
    }
}

/// Handle a webhook delivery
pub async fn handle_delivery(
    State(state): State<Arc<ApiState>>,
    headers: HeaderMap,
    body: Bytes,
) -> (StatusCode, &'static str) {
    let received_at = Utc::now();

    if let Some(secret) = &state.app_secret {
        let signature = headers
            .get(SIGNATURE_HEADER)
            .and_then(|v| v.to_str().ok());
        if let Err(e) = messenger::verify_signature(secret, &body, signature) {
            tracing::warn!(error = %e, "rejected Messenger webhook");
            return (StatusCode::FORBIDDEN, "invalid signature");
        }
    }

    let webhook: MessengerWebhook = match serde_json::from_slice(&body) {
        Ok(webhook) => webhook,
        Err(e) => {
            tracing::warn!(error = %e, "malformed Messenger webhook payload");
            return (StatusCode::BAD_REQUEST, "malformed payload");
        }
    };

    let events = classify_webhook(&webhook, received_at);
    tracing::debug!(count = events.len(), "classified Messenger webhook");

    let mut accepted = 0usize;
    for event in events {
        if matches!(state.dispatcher.submit(event).await, Submitted::Accepted { .. }) {
            accepted += 1;
        }
    }
    if accepted > 0 {
        tracing::debug!(accepted, "Messenger events submitted");
    }

    (StatusCode::OK, "EVENT_RECEIVED")
}

//! Webhook endpoints for channel integrations

use std::sync::Arc;

use axum::{Router, routing::get};

use super::ApiState;

pub mod messenger;

/// Build webhooks router
pub fn router(state: Arc<ApiState>) -> Router {
    Router::new()
        .route(
            "/messenger",
            get(messenger::verify_subscription).post(messenger::handle_delivery),
        )
        .with_state(state)
}

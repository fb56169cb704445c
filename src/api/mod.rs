//! HTTP API server for beacon turns

pub mod events;
pub mod health;
pub mod webhooks;

use std::sync::Arc;

use axum::Router;
use secrecy::SecretString;
use tokio::net::TcpListener;
use tower_http::trace::TraceLayer;

use crate::Result;
use crate::dispatcher::TurnDispatcher;

/// Shared state for API handlers
#[derive(Clone)]
pub struct ApiState {
    pub dispatcher: Arc<TurnDispatcher>,

    /// Token Messenger echoes during subscription
    pub verify_token: Option<SecretString>,

    /// App secret for webhook signature checks; unsigned payloads are
    /// accepted when unset
    pub app_secret: Option<SecretString>,
}

/// Configuration for building an API server
pub struct ApiServerBuilder {
    dispatcher: Arc<TurnDispatcher>,
    port: u16,
    verify_token: Option<SecretString>,
    app_secret: Option<SecretString>,
}

impl ApiServerBuilder {
    /// Create a new API server builder
    #[must_use]
    pub const fn new(dispatcher: Arc<TurnDispatcher>, port: u16) -> Self {
        Self {
            dispatcher,
            port,
            verify_token: None,
            app_secret: None,
        }
    }

    /// Set the Messenger subscription verify token
    #[must_use]
    pub fn verify_token(mut self, token: Option<SecretString>) -> Self {
        self.verify_token = token;
        self
    }

    /// Set the Messenger app secret
    #[must_use]
    pub fn app_secret(mut self, secret: Option<SecretString>) -> Self {
        self.app_secret = secret;
        self
    }

    /// Build the API server
    #[must_use]
    pub fn build(self) -> ApiServer {
        ApiServer {
            state: Arc::new(ApiState {
                dispatcher: self.dispatcher,
                verify_token: self.verify_token,
                app_secret: self.app_secret,
            }),
            port: self.port,
        }
    }
}

/// Build the router with all routes
pub fn router(state: Arc<ApiState>) -> Router {
    Router::new()
        .nest("/webhooks", webhooks::router(state.clone()))
        .nest("/api", events::router(state.clone()))
        .merge(health::router(state))
        .layer(TraceLayer::new_for_http())
}

/// HTTP API server
pub struct ApiServer {
    state: Arc<ApiState>,
    port: u16,
}

impl ApiServer {
    #[must_use]
    pub fn router(&self) -> Router {
        router(self.state.clone())
    }

    /// Run the API server until `shutdown` resolves
    ///
    /// # Errors
    ///
    /// Returns error if server fails to bind or run
    pub async fn run(self, shutdown: impl Future<Output = ()> + Send + 'static) -> Result<()> {
        let addr = format!("0.0.0.0:{}", self.port);
        let listener = TcpListener::bind(&addr)
            .await
            .map_err(|e| crate::Error::Config(format!("failed to bind API server: {e}")))?;

        tracing::info!(port = self.port, "API server listening");

        axum::serve(listener, self.router())
            .with_graceful_shutdown(shutdown)
            .await
            .map_err(|e| crate::Error::Config(format!("API server error: {e}")))?;

        Ok(())
    }
}

//! Reasoner client
//!
//! The reasoner is the opaque downstream that turns a resolved turn into a
//! reply. It is called once per turn; retries and fallbacks are the
//! dispatcher's business.

use async_trait::async_trait;
use serde::Deserialize;

use crate::turns::ResolvedTurn;
use crate::{Error, Result};

/// Produces a reply for a resolved turn
///
/// An empty reply means nothing needs to be sent.
#[async_trait]
pub trait Reasoner: Send + Sync {
    fn name(&self) -> &'static str;

    async fn resolve_turn(&self, turn: &ResolvedTurn) -> Result<String>;
}

/// Reasoner reached over HTTP
///
/// Posts the turn as JSON and expects `{"reply": "..."}` back.
#[derive(Debug, Clone)]
pub struct HttpReasoner {
    client: reqwest::Client,
    url: String,
}

#[derive(Deserialize)]
struct ReasonerResponse {
    #[serde(default)]
    reply: String,
}

impl HttpReasoner {
    /// Create a client for the given endpoint
    ///
    /// # Errors
    ///
    /// Returns error if the URL is empty
    pub fn new(url: impl Into<String>) -> Result<Self> {
        let url = url.into();
        if url.trim().is_empty() {
            return Err(Error::Config("reasoner URL is empty".to_string()));
        }

        Ok(Self {
            client: reqwest::Client::new(),
            url,
        })
    }

    #[must_use]
    pub fn url(&self) -> &str {
        &self.url
    }
}

#[async_trait]
impl Reasoner for HttpReasoner {
    fn name(&self) -> &'static str {
        "http"
    }

    async fn resolve_turn(&self, turn: &ResolvedTurn) -> Result<String> {
        let response = self.client.post(&self.url).json(turn).send().await?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(Error::Reasoner(format!("reasoner returned {status}: {body}")));
        }

        let body: ReasonerResponse = response.json().await?;
        Ok(body.reply.trim().to_string())
    }
}

/// Reasoner that only logs turns, used when no endpoint is configured
#[derive(Debug, Default)]
pub struct LogReasoner;

#[async_trait]
impl Reasoner for LogReasoner {
    fn name(&self) -> &'static str {
        "log"
    }

    async fn resolve_turn(&self, turn: &ResolvedTurn) -> Result<String> {
        tracing::info!(
            user_id = %turn.user_id,
            turn_id = turn.turn_id,
            text = %turn.combined_text,
            attachments = turn.attachments.len(),
            linked = turn.linked_context.is_some(),
            "resolved turn (no reasoner configured)"
        );
        Ok(String::new())
    }
}

//! Facebook Messenger channel adapter
//!
//! Outbound replies go through the Graph API Send endpoint. Inbound traffic
//! arrives on the webhook router (`api::webhooks::messenger`), which uses the
//! verification helpers here.

pub mod retry;
pub mod types;

use async_trait::async_trait;
use hmac::{Hmac, Mac};
use reqwest::Client;
use secrecy::{ExposeSecret, SecretString};
use sha2::Sha256;

use self::retry::{RetryPolicy, delay_for_attempt, is_recoverable};
use self::types::{
    GRAPH_API_BASE, MAX_TEXT_CHARS, Participant, SendMessageBody, SendMessageRequest,
};
use super::{Channel, OutgoingMessage};
use crate::{Error, Result};

type HmacSha256 = Hmac<Sha256>;

/// Messenger channel adapter
pub struct MessengerChannel {
    page_access_token: SecretString,
    api_base: String,
    api_version: String,
    client: Client,
    retry: RetryPolicy,
}

impl MessengerChannel {
    /// Create a new Messenger channel adapter
    #[must_use]
    pub fn new(page_access_token: SecretString, api_version: impl Into<String>) -> Self {
        Self {
            page_access_token,
            api_base: GRAPH_API_BASE.to_string(),
            api_version: api_version.into(),
            client: Client::new(),
            retry: RetryPolicy::default(),
        }
    }

    /// Point the adapter at a different Graph API host
    #[must_use]
    pub fn with_api_base(mut self, api_base: impl Into<String>) -> Self {
        self.api_base = api_base.into();
        self
    }

    #[must_use]
    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    fn messages_url(&self) -> String {
        format!(
            "{}/{}/me/messages",
            self.api_base.trim_end_matches('/'),
            self.api_version
        )
    }

    /// Send a text message, retrying recoverable failures
    ///
    /// # Errors
    ///
    /// Returns error if the Send API rejects the message or every attempt fails
    pub async fn send_text(&self, recipient_id: &str, text: &str) -> Result<()> {
        let request = SendMessageRequest {
            recipient: Participant {
                id: recipient_id.to_string(),
            },
            messaging_type: "RESPONSE",
            message: SendMessageBody {
                text: truncate_text(text),
            },
        };
        let url = self.messages_url();
        let max_attempts = self.retry.max_attempts.max(1);

        let mut attempt = 0;
        loop {
            attempt += 1;

            let result = self
                .client
                .post(&url)
                .query(&[("access_token", self.page_access_token.expose_secret())])
                .json(&request)
                .send()
                .await;

            let (status, body, recoverable) = match result {
                Ok(response) if response.status().is_success() => {
                    tracing::debug!(recipient_id, attempt, "messenger reply sent");
                    return Ok(());
                }
                Ok(response) => {
                    let status = response.status().as_u16();
                    let body = response.text().await.unwrap_or_default();
                    let recoverable = is_recoverable(status, &body);
                    (status, body, recoverable)
                }
                Err(e) => {
                    let recoverable = e.is_timeout() || e.is_connect();
                    (0, e.to_string(), recoverable || is_recoverable(0, &e.to_string()))
                }
            };

            if !recoverable || attempt >= max_attempts {
                return Err(Error::Channel(format!(
                    "messenger send failed after {attempt} attempt(s) ({status}): {body}"
                )));
            }

            let delay = delay_for_attempt(&self.retry, attempt - 1);
            tracing::warn!(
                recipient_id,
                attempt,
                status,
                delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                "messenger send failed, retrying"
            );
            tokio::time::sleep(delay).await;
        }
    }
}

#[async_trait]
impl Channel for MessengerChannel {
    fn name(&self) -> &'static str {
        "messenger"
    }

    async fn send(&self, message: OutgoingMessage) -> Result<()> {
        self.send_text(&message.recipient_id, &message.content).await
    }
}

/// Cut text to the Send API limit on a character boundary
#[must_use]
pub fn truncate_text(text: &str) -> String {
    match text.char_indices().nth(MAX_TEXT_CHARS) {
        Some((idx, _)) => text[..idx].to_string(),
        None => text.to_string(),
    }
}

/// Verify an `X-Hub-Signature-256` header against the raw request body
///
/// # Errors
///
/// Returns `Error::Signature` if the header is missing, malformed or does
/// not match
pub fn verify_signature(
    app_secret: &SecretString,
    body: &[u8],
    header: Option<&str>,
) -> Result<()> {
    let header = header.ok_or_else(|| Error::Signature("missing signature header".to_string()))?;
    let hex_sig = header
        .strip_prefix("sha256=")
        .ok_or_else(|| Error::Signature("unsupported signature scheme".to_string()))?;
    let expected =
        hex::decode(hex_sig).map_err(|e| Error::Signature(format!("invalid hex: {e}")))?;

    let mut mac = HmacSha256::new_from_slice(app_secret.expose_secret().as_bytes())
        .map_err(|e| Error::Signature(e.to_string()))?;
    mac.update(body);
    mac.verify_slice(&expected)
        .map_err(|_| Error::Signature("signature mismatch".to_string()))
}

/// Compute the `sha256=<hex>` signature Messenger would send for a body
#[must_use]
pub fn sign_body(app_secret: &SecretString, body: &[u8]) -> String {
    let Ok(mut mac) = HmacSha256::new_from_slice(app_secret.expose_secret().as_bytes()) else {
        return String::new();
    };
    mac.update(body);
    format!("sha256={}", hex::encode(mac.finalize().into_bytes()))
}

/// Answer a webhook subscription handshake
///
/// Returns the challenge to echo back when the mode is `subscribe` and the
/// token matches the configured verify token.
#[must_use]
pub fn verify_subscription<'a>(
    mode: Option<&str>,
    token: Option<&str>,
    challenge: Option<&'a str>,
    expected_token: Option<&SecretString>,
) -> Option<&'a str> {
    let expected = expected_token?;
    if mode? != "subscribe" || token? != expected.expose_secret() {
        return None;
    }
    challenge
}

//! Messaging channel adapters
//!
//! Each channel implements the `Channel` trait, the send primitive the
//! dispatcher relays replies through.

pub mod messenger;

use async_trait::async_trait;

pub use messenger::MessengerChannel;

use crate::Result;

/// A message to send to a channel
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutgoingMessage {
    /// Channel-native recipient (Messenger page-scoped id)
    pub recipient_id: String,

    /// Message content
    pub content: String,
}

impl OutgoingMessage {
    /// Create a simple text message
    #[must_use]
    pub fn text(recipient_id: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            recipient_id: recipient_id.into(),
            content: content.into(),
        }
    }
}

/// Trait for messaging channel adapters
#[async_trait]
pub trait Channel: Send + Sync {
    /// Channel name (e.g., "messenger")
    fn name(&self) -> &'static str;

    /// Send a message
    async fn send(&self, message: OutgoingMessage) -> Result<()>;
}

/// Channel that only logs replies, used when no page token is configured
#[derive(Debug, Default)]
pub struct LogChannel;

#[async_trait]
impl Channel for LogChannel {
    fn name(&self) -> &'static str {
        "log"
    }

    async fn send(&self, message: OutgoingMessage) -> Result<()> {
        tracing::info!(
            recipient_id = %message.recipient_id,
            content = %message.content,
            "reply (no channel configured)"
        );
        Ok(())
    }
}

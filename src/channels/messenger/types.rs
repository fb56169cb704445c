//! Messenger Platform webhook and Send API types

use serde::{Deserialize, Serialize};

/// Graph API base URL
pub(crate) const GRAPH_API_BASE: &str = "https://graph.facebook.com";

/// Send API text limit
pub const MAX_TEXT_CHARS: usize = 2000;

/// Webhook delivery body (`object: page`)
#[derive(Debug, Deserialize)]
pub struct MessengerWebhook {
    pub object: String,
    #[serde(default)]
    pub entry: Vec<WebhookEntry>,
}

/// One page entry in a webhook delivery
#[derive(Debug, Deserialize)]
pub struct WebhookEntry {
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub time: Option<i64>,
    #[serde(default)]
    pub messaging: Vec<MessagingEvent>,
}

/// A single messaging event (message, postback, read receipt, ...)
#[derive(Debug, Clone, Deserialize)]
pub struct MessagingEvent {
    pub sender: Participant,
    #[serde(default)]
    pub recipient: Option<Participant>,

    /// Milliseconds since the epoch
    #[serde(default)]
    pub timestamp: Option<i64>,
    #[serde(default)]
    pub message: Option<MessengerMessage>,
    #[serde(default)]
    pub postback: Option<Postback>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Participant {
    pub id: String,
}

/// Inbound message body
#[derive(Debug, Clone, Deserialize)]
pub struct MessengerMessage {
    #[serde(default)]
    pub mid: Option<String>,
    #[serde(default)]
    pub text: Option<String>,

    /// Set on copies of messages the page itself sent
    #[serde(default)]
    pub is_echo: bool,
    #[serde(default)]
    pub attachments: Vec<RawAttachment>,
    #[serde(default)]
    pub quick_reply: Option<QuickReply>,
}

/// Attachment as delivered; the payload shape varies by `type`
#[derive(Debug, Clone, Deserialize)]
pub struct RawAttachment {
    #[serde(rename = "type", default)]
    pub kind: Option<String>,
    #[serde(default)]
    pub payload: Option<serde_json::Value>,
    #[serde(default)]
    pub title: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct QuickReply {
    pub payload: String,
}

/// Button tap
#[derive(Debug, Clone, Deserialize)]
pub struct Postback {
    #[serde(default)]
    pub mid: Option<String>,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub payload: Option<String>,
}

/// Send API request
#[derive(Debug, Serialize)]
pub(crate) struct SendMessageRequest {
    pub recipient: Participant,
    pub messaging_type: &'static str,
    pub message: SendMessageBody,
}

#[derive(Debug, Serialize)]
pub(crate) struct SendMessageBody {
    pub text: String,
}

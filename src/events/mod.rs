//! Normalized channel events
//!
//! Every inbound channel message is broken down into one or more
//! [`ChannelEvent`]s before it reaches the turn aggregator. One Messenger
//! message with text and two photos becomes three events sharing a
//! `source_message_id`.

pub mod classify;
pub mod dedup;

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::{Error, Result};

/// Longest user id accepted from a channel
const MAX_USER_ID_LEN: usize = 128;

/// Kind of a normalized event
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventKind {
    Text,
    Image,
    Video,
    Audio,
    File,
    Location,
}

impl EventKind {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Text => "text",
            Self::Image => "image",
            Self::Video => "video",
            Self::Audio => "audio",
            Self::File => "file",
            Self::Location => "location",
        }
    }

    /// Parse from the stored string form
    #[must_use]
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "text" => Some(Self::Text),
            "image" => Some(Self::Image),
            "video" => Some(Self::Video),
            "audio" => Some(Self::Audio),
            "file" => Some(Self::File),
            "location" => Some(Self::Location),
            _ => None,
        }
    }

    /// Image, video, audio or file
    #[must_use]
    pub const fn is_media(self) -> bool {
        matches!(self, Self::Image | Self::Video | Self::Audio | Self::File)
    }

    /// Determine media kind from MIME type
    #[must_use]
    pub fn from_mime(mime_type: &str) -> Self {
        let lower = mime_type.to_lowercase();
        if lower.starts_with("image/") {
            Self::Image
        } else if lower.starts_with("audio/") {
            Self::Audio
        } else if lower.starts_with("video/") {
            Self::Video
        } else {
            Self::File
        }
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Where to fetch an attachment and what it is
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttachmentDescriptor {
    pub url: String,
    pub media_type: String,
}

impl AttachmentDescriptor {
    #[must_use]
    pub fn new(url: impl Into<String>, media_type: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            media_type: media_type.into(),
        }
    }

    /// Short human-readable form for history and logs
    #[must_use]
    pub fn summary(&self) -> String {
        let kind = EventKind::from_mime(&self.media_type);
        if self.url.is_empty() {
            format!("[{kind}]")
        } else {
            format!("[{kind}] {}", self.url)
        }
    }
}

/// A shared location
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Coordinates {
    pub lat: f64,
    pub long: f64,
}

/// Event content
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EventPayload {
    Text { text: String },
    Attachment(AttachmentDescriptor),
    Location(Coordinates),
}

impl EventPayload {
    /// Whether this payload shape is valid for the given kind
    #[must_use]
    pub const fn fits(&self, kind: EventKind) -> bool {
        match self {
            Self::Text { .. } => matches!(kind, EventKind::Text),
            Self::Attachment(_) => kind.is_media(),
            Self::Location(_) => matches!(kind, EventKind::Location),
        }
    }
}

/// One normalized inbound event
///
/// Immutable once created. Construct through [`ChannelEvent::new`], which
/// validates the user id and the kind/payload pairing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChannelEvent {
    pub user_id: String,
    pub kind: EventKind,
    pub payload: EventPayload,

    /// Local receipt time
    pub received_at: DateTime<Utc>,

    /// Channel-native message id, shared by events split from one message
    pub source_message_id: String,

    /// Position within the source message: 0 for the text, attachments
    /// from 1 in delivery order
    #[serde(default)]
    pub part_index: u32,
}

impl ChannelEvent {
    /// Create a validated event
    ///
    /// # Errors
    ///
    /// Returns `Error::InvalidEvent` if the user id is malformed or the
    /// payload does not match the kind
    pub fn new(
        user_id: impl Into<String>,
        kind: EventKind,
        payload: EventPayload,
        received_at: DateTime<Utc>,
        source_message_id: impl Into<String>,
    ) -> Result<Self> {
        let user_id = user_id.into();
        validate_user_id(&user_id)?;

        if !payload.fits(kind) {
            return Err(Error::InvalidEvent(format!(
                "payload does not match kind {kind}"
            )));
        }

        Ok(Self {
            user_id,
            kind,
            payload,
            received_at,
            source_message_id: source_message_id.into(),
            part_index: 0,
        })
    }

    /// Set the position of this event within its source message
    #[must_use]
    pub const fn with_part_index(mut self, part_index: u32) -> Self {
        self.part_index = part_index;
        self
    }

    /// Convenience constructor for a text event
    ///
    /// # Errors
    ///
    /// Returns `Error::InvalidEvent` if the user id is malformed
    pub fn text(
        user_id: impl Into<String>,
        text: impl Into<String>,
        received_at: DateTime<Utc>,
        source_message_id: impl Into<String>,
    ) -> Result<Self> {
        Self::new(
            user_id,
            EventKind::Text,
            EventPayload::Text { text: text.into() },
            received_at,
            source_message_id,
        )
    }

    /// Convenience constructor for an attachment event, kind taken from the
    /// media type
    ///
    /// # Errors
    ///
    /// Returns `Error::InvalidEvent` if the user id is malformed
    pub fn attachment(
        user_id: impl Into<String>,
        descriptor: AttachmentDescriptor,
        received_at: DateTime<Utc>,
        source_message_id: impl Into<String>,
    ) -> Result<Self> {
        let kind = EventKind::from_mime(&descriptor.media_type);
        Self::new(
            user_id,
            kind,
            EventPayload::Attachment(descriptor),
            received_at,
            source_message_id,
        )
    }

    /// Idempotency key: hex SHA-256 over user, source id, part index, kind
    /// and payload
    #[must_use]
    pub fn fingerprint(&self) -> String {
        let payload = serde_json::to_string(&self.payload).unwrap_or_default();

        let mut hasher = Sha256::new();
        hasher.update(self.user_id.as_bytes());
        hasher.update([0]);
        hasher.update(self.source_message_id.as_bytes());
        hasher.update([0]);
        hasher.update(self.part_index.to_be_bytes());
        hasher.update(self.kind.as_str().as_bytes());
        hasher.update([0]);
        hasher.update(payload.as_bytes());
        hex::encode(hasher.finalize())
    }

    /// Text content, if this is a text event
    #[must_use]
    pub fn text_content(&self) -> Option<&str> {
        match &self.payload {
            EventPayload::Text { text } => Some(text),
            _ => None,
        }
    }
}

/// Reject empty ids, whitespace, control characters and absurd lengths
///
/// # Errors
///
/// Returns `Error::InvalidEvent` describing the problem
pub fn validate_user_id(user_id: &str) -> Result<()> {
    if user_id.is_empty() {
        return Err(Error::InvalidEvent("empty user_id".to_string()));
    }
    if user_id.len() > MAX_USER_ID_LEN {
        return Err(Error::InvalidEvent(format!(
            "user_id longer than {MAX_USER_ID_LEN} bytes"
        )));
    }
    if user_id
        .chars()
        .any(|c| c.is_whitespace() || c.is_control())
    {
        return Err(Error::InvalidEvent(
            "user_id contains whitespace or control characters".to_string(),
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn now() -> DateTime<Utc> {
        Utc::now()
    }

    #[test]
    fn rejects_malformed_user_ids() {
        let long = "x".repeat(200);
        for bad in ["", "has space", "tab\there", "nl\n", long.as_str()] {
            let err = ChannelEvent::text(bad, "hi", now(), "m1").unwrap_err();
            assert!(matches!(err, Error::InvalidEvent(_)), "accepted {bad:?}");
        }
    }

    #[test]
    fn accepts_page_scoped_ids() {
        assert!(ChannelEvent::text("24536173499312345", "hi", now(), "m1").is_ok());
    }

    #[test]
    fn rejects_kind_payload_mismatch() {
        let err = ChannelEvent::new(
            "u1",
            EventKind::Image,
            EventPayload::Text {
                text: "hi".to_string(),
            },
            now(),
            "m1",
        )
        .unwrap_err();
        assert!(matches!(err, Error::InvalidEvent(_)));

        let err = ChannelEvent::new(
            "u1",
            EventKind::Location,
            EventPayload::Attachment(AttachmentDescriptor::new("u", "image/png")),
            now(),
            "m1",
        )
        .unwrap_err();
        assert!(matches!(err, Error::InvalidEvent(_)));
    }

    #[test]
    fn attachment_kind_follows_media_type() {
        let e = ChannelEvent::attachment(
            "u1",
            AttachmentDescriptor::new("https://cdn/x.mp4", "video/mp4"),
            now(),
            "m1",
        )
        .unwrap();
        assert_eq!(e.kind, EventKind::Video);
    }

    #[test]
    fn fingerprint_is_stable_and_discriminating() {
        let at = now();
        let a = ChannelEvent::text("u1", "hello", at, "m1").unwrap();
        let b = ChannelEvent::text("u1", "hello", at, "m1").unwrap();
        let c = ChannelEvent::text("u1", "hello", at, "m2").unwrap();
        let d = ChannelEvent::text("u2", "hello", at, "m1").unwrap();

        assert_eq!(a.fingerprint(), b.fingerprint());
        assert_ne!(a.fingerprint(), c.fingerprint());
        assert_ne!(a.fingerprint(), d.fingerprint());
        assert_eq!(a.fingerprint().len(), 64);
    }

    #[test]
    fn fingerprint_separates_identical_parts_of_one_message() {
        let at = now();
        let descriptor = AttachmentDescriptor::new("https://cdn/same.jpg", "image/jpeg");
        let first = ChannelEvent::attachment("u1", descriptor.clone(), at, "m1")
            .unwrap()
            .with_part_index(1);
        let second = ChannelEvent::attachment("u1", descriptor, at, "m1")
            .unwrap()
            .with_part_index(2);

        assert_ne!(first.fingerprint(), second.fingerprint());
    }

    #[test]
    fn fingerprint_ignores_receipt_time() {
        let a = ChannelEvent::text("u1", "hello", now(), "m1").unwrap();
        let b = ChannelEvent::text("u1", "hello", now() + chrono::Duration::seconds(5), "m1")
            .unwrap();
        assert_eq!(a.fingerprint(), b.fingerprint());
    }

    #[test]
    fn payload_serializes_tagged() {
        let json = serde_json::to_value(EventPayload::Location(Coordinates {
            lat: 10.77,
            long: 106.7,
        }))
        .unwrap();
        assert_eq!(json["type"], "location");
        assert_eq!(json["lat"], 10.77);
    }

    #[test]
    fn kind_round_trips_through_str() {
        for kind in [
            EventKind::Text,
            EventKind::Image,
            EventKind::Video,
            EventKind::Audio,
            EventKind::File,
            EventKind::Location,
        ] {
            assert_eq!(EventKind::parse(kind.as_str()), Some(kind));
        }
        assert_eq!(EventKind::parse("sticker"), None);
    }
}

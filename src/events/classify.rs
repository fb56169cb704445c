//! Attachment classifier
//!
//! Maps Messenger messaging entries onto normalized [`ChannelEvent`]s. The
//! mapping is permissive: unknown or malformed attachments become `file`
//! events with whatever descriptor can be salvaged, and every such fallback
//! is logged.

use chrono::{DateTime, Utc};
use serde_json::Value;

use super::{AttachmentDescriptor, ChannelEvent, Coordinates, EventKind, EventPayload};
use crate::channels::messenger::types::{MessagingEvent, MessengerWebhook, RawAttachment};

const OCTET_STREAM: &str = "application/octet-stream";

/// Classify every messaging entry of a webhook delivery
#[must_use]
pub fn classify_webhook(
    webhook: &MessengerWebhook,
    received_at: DateTime<Utc>,
) -> Vec<ChannelEvent> {
    if webhook.object != "page" {
        tracing::warn!(object = %webhook.object, "ignoring non-page webhook object");
        return Vec::new();
    }

    webhook
        .entry
        .iter()
        .flat_map(|entry| entry.messaging.iter())
        .flat_map(|messaging| classify_messaging(messaging, received_at))
        .collect()
}

/// Classify a single messaging entry
///
/// Yields text first, then attachments in delivery order, each tagged with
/// its position in the message. Echoes, read receipts and other
/// non-message entries yield nothing.
#[must_use]
pub fn classify_messaging(
    messaging: &MessagingEvent,
    received_at: DateTime<Utc>,
) -> Vec<ChannelEvent> {
    let user_id = messaging.sender.id.as_str();
    let mut events = Vec::new();

    if let Some(message) = &messaging.message {
        if message.is_echo {
            tracing::trace!(user_id, "ignoring echo");
            return events;
        }

        let source_id = message
            .mid
            .clone()
            .unwrap_or_else(|| synthetic_id(user_id, messaging.timestamp));

        if let Some(text) = message.text.as_deref().filter(|t| !t.trim().is_empty()) {
            push(
                &mut events,
                ChannelEvent::new(
                    user_id,
                    EventKind::Text,
                    EventPayload::Text {
                        text: text.to_string(),
                    },
                    received_at,
                    source_id.as_str(),
                ),
            );
        }

        for (raw, part_index) in message.attachments.iter().zip(1u32..) {
            let (kind, payload) = classify_attachment(user_id, raw);
            push(
                &mut events,
                ChannelEvent::new(user_id, kind, payload, received_at, source_id.as_str())
                    .map(|event| event.with_part_index(part_index)),
            );
        }
    } else if let Some(postback) = &messaging.postback {
        let text = postback
            .title
            .as_deref()
            .or(postback.payload.as_deref())
            .filter(|t| !t.trim().is_empty());

        if let Some(text) = text {
            let source_id = postback
                .mid
                .clone()
                .unwrap_or_else(|| synthetic_id(user_id, messaging.timestamp));
            push(
                &mut events,
                ChannelEvent::text(user_id, text, received_at, source_id),
            );
        } else {
            tracing::warn!(user_id, "postback without title or payload");
        }
    } else {
        tracing::debug!(user_id, "messaging entry carries no message or postback");
    }

    events
}

fn push(events: &mut Vec<ChannelEvent>, event: crate::Result<ChannelEvent>) {
    match event {
        Ok(event) => events.push(event),
        Err(e) => tracing::warn!(error = %e, "dropping unclassifiable messaging entry"),
    }
}

fn synthetic_id(user_id: &str, timestamp: Option<i64>) -> String {
    format!("{user_id}:{}", timestamp.unwrap_or_default())
}

fn classify_attachment(user_id: &str, raw: &RawAttachment) -> (EventKind, EventPayload) {
    let declared = raw.kind.as_deref().unwrap_or_default();
    let url = raw
        .payload
        .as_ref()
        .and_then(|p| p.get("url"))
        .and_then(Value::as_str)
        .unwrap_or_default();

    let kind = match declared {
        "image" => Some(EventKind::Image),
        "video" => Some(EventKind::Video),
        "audio" => Some(EventKind::Audio),
        "file" => Some(EventKind::File),
        "location" => {
            if let Some(coords) = raw.payload.as_ref().and_then(coordinates) {
                return (EventKind::Location, EventPayload::Location(coords));
            }
            tracing::warn!(
                user_id,
                "location attachment without coordinates, classifying as file"
            );
            None
        }
        other => {
            tracing::warn!(
                user_id,
                attachment_type = other,
                "unknown attachment type, classifying as file"
            );
            None
        }
    };

    match kind {
        Some(kind) if !url.is_empty() => (
            kind,
            EventPayload::Attachment(AttachmentDescriptor::new(url, guess_media_type(kind, url))),
        ),
        Some(kind) => {
            tracing::warn!(
                user_id,
                attachment_type = %kind,
                "attachment without url, classifying as file"
            );
            file_fallback(raw, url)
        }
        None => file_fallback(raw, url),
    }
}

fn file_fallback(raw: &RawAttachment, url: &str) -> (EventKind, EventPayload) {
    let url = if url.is_empty() {
        raw.title.as_deref().unwrap_or_default()
    } else {
        url
    };
    let media_type = if url.is_empty() {
        OCTET_STREAM.to_string()
    } else {
        guess_media_type(EventKind::File, url)
    };
    (
        EventKind::File,
        EventPayload::Attachment(AttachmentDescriptor::new(url, media_type)),
    )
}

fn coordinates(payload: &Value) -> Option<Coordinates> {
    let coords = payload.get("coordinates")?;
    Some(Coordinates {
        lat: coords.get("lat")?.as_f64()?,
        long: coords.get("long")?.as_f64()?,
    })
}

/// Best-effort MIME type from the URL's extension, constrained to the kind
#[must_use]
pub fn guess_media_type(kind: EventKind, url: &str) -> String {
    let path = url.split(['?', '#']).next().unwrap_or_default();
    let file_name = path.rsplit('/').next().unwrap_or_default();
    let ext = file_name
        .rsplit_once('.')
        .map(|(_, ext)| ext.to_lowercase())
        .unwrap_or_default();

    let guessed = match (kind, ext.as_str()) {
        (EventKind::Audio, "mp4" | "m4a") => Some("audio/mp4"),
        (_, "jpg" | "jpeg") => Some("image/jpeg"),
        (_, "png") => Some("image/png"),
        (_, "gif") => Some("image/gif"),
        (_, "webp") => Some("image/webp"),
        (_, "mp4") => Some("video/mp4"),
        (_, "mov") => Some("video/quicktime"),
        (_, "mp3") => Some("audio/mpeg"),
        (_, "aac") => Some("audio/aac"),
        (_, "wav") => Some("audio/wav"),
        (_, "ogg") => Some("audio/ogg"),
        (_, "pdf") => Some("application/pdf"),
        (_, "txt") => Some("text/plain"),
        (_, "csv") => Some("text/csv"),
        (_, "docx") => Some("application/vnd.openxmlformats-officedocument.wordprocessingml.document"),
        (_, "xlsx") => Some("application/vnd.openxmlformats-officedocument.spreadsheetml.sheet"),
        _ => None,
    };

    match guessed {
        Some(mime) if kind == EventKind::File || EventKind::from_mime(mime) == kind => {
            mime.to_string()
        }
        _ => default_media_type(kind).to_string(),
    }
}

const fn default_media_type(kind: EventKind) -> &'static str {
    match kind {
        EventKind::Image => "image/jpeg",
        EventKind::Video => "video/mp4",
        EventKind::Audio => "audio/mpeg",
        EventKind::Text => "text/plain",
        EventKind::File | EventKind::Location => OCTET_STREAM,
    }
}

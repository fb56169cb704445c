//! Turn resolution
//!
//! A *turn* is everything a user says before they expect an answer: a text
//! typed in three bursts, an image followed by "how much is this combo?",
//! and so on. The aggregator collects a user's events into a
//! [`PendingTurn`] until its deadline passes, then freezes it into a
//! [`ResolvedTurn`] for the reasoner.

pub mod aggregator;
pub mod linker;
pub mod policy;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::task::AbortHandle;
use tokio::time::Instant;

pub use aggregator::{AggregatorStats, StatsSnapshot, TurnAggregator, TurnHandler};
pub use linker::ContextLinker;
pub use policy::{ReferenceDetector, WaitDecision, WaitPolicy, WaitReason};

use crate::events::{AttachmentDescriptor, ChannelEvent, Coordinates, EventPayload};
use crate::history::Modality;

/// Lifecycle of a pending turn
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TurnState {
    /// Accepting events
    Open,
    /// Deadline passed, content frozen
    Finalizing,
    /// Handed off downstream
    Closed,
}

/// Text fragment with the ordering keys it was received with
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TextFragment {
    pub received_at: DateTime<Utc>,
    pub source_message_id: String,
    pub text: String,
}

/// A user's turn while it is still collecting events
#[derive(Debug)]
pub struct PendingTurn {
    pub turn_id: u64,
    pub user_id: String,
    text_fragments: Vec<TextFragment>,
    attachments: Vec<AttachmentDescriptor>,
    locations: Vec<Coordinates>,
    event_ids: Vec<String>,
    pub opened_at: Instant,
    pub opened_wall: DateTime<Utc>,
    pub last_event_at: Instant,
    pub deadline_at: Instant,
    pub state: TurnState,
    pub(crate) timer: Option<AbortHandle>,
}

impl PendingTurn {
    /// Open a turn from its first event
    #[must_use]
    pub fn open(turn_id: u64, event: ChannelEvent, now: Instant) -> Self {
        let mut turn = Self {
            turn_id,
            user_id: event.user_id.clone(),
            text_fragments: Vec::new(),
            attachments: Vec::new(),
            locations: Vec::new(),
            event_ids: Vec::new(),
            opened_at: now,
            opened_wall: Utc::now(),
            last_event_at: now,
            deadline_at: now,
            state: TurnState::Open,
            timer: None,
        };
        turn.absorb(event, now);
        turn
    }

    /// Merge an event into an open turn
    ///
    /// # Errors
    ///
    /// Hands the event back when the turn is not `Open`
    pub fn merge(
        &mut self,
        event: ChannelEvent,
        now: Instant,
    ) -> std::result::Result<(), Box<ChannelEvent>> {
        if self.state != TurnState::Open {
            return Err(Box::new(event));
        }
        self.absorb(event, now);
        Ok(())
    }

    fn absorb(&mut self, event: ChannelEvent, now: Instant) {
        self.event_ids.push(event.fingerprint());
        self.last_event_at = now;

        match event.payload {
            EventPayload::Text { text } => self.text_fragments.push(TextFragment {
                received_at: event.received_at,
                source_message_id: event.source_message_id,
                text,
            }),
            EventPayload::Attachment(descriptor) => self.attachments.push(descriptor),
            EventPayload::Location(coords) => self.locations.push(coords),
        }
    }

    #[must_use]
    pub fn has_text(&self) -> bool {
        self.text_fragments.iter().any(|f| !f.text.trim().is_empty())
    }

    /// Attachments or shared locations
    #[must_use]
    pub fn has_media(&self) -> bool {
        !self.attachments.is_empty() || !self.locations.is_empty()
    }

    #[must_use]
    pub fn event_count(&self) -> usize {
        self.event_ids.len()
    }

    #[must_use]
    pub fn attachments(&self) -> &[AttachmentDescriptor] {
        &self.attachments
    }

    /// Fragments ordered by receipt time, ties broken by source message id
    #[must_use]
    pub fn combined_text(&self) -> String {
        let mut fragments: Vec<&TextFragment> = self.text_fragments.iter().collect();
        fragments.sort_by(|a, b| {
            a.received_at
                .cmp(&b.received_at)
                .then_with(|| a.source_message_id.cmp(&b.source_message_id))
        });

        fragments
            .iter()
            .map(|f| f.text.trim())
            .filter(|t| !t.is_empty())
            .collect::<Vec<_>>()
            .join(" ")
    }

    /// Freeze the turn's content; the turn accepts no further merges
    pub fn finalize(&mut self, finalized_at: DateTime<Utc>) -> ResolvedTurn {
        self.state = TurnState::Finalizing;

        ResolvedTurn {
            turn_id: self.turn_id,
            user_id: self.user_id.clone(),
            combined_text: self.combined_text(),
            attachments: self.attachments.clone(),
            locations: self.locations.clone(),
            linked_context: None,
            opened_at: self.opened_wall,
            finalized_at,
            event_ids: self.event_ids.clone(),
        }
    }
}

/// A frozen turn on its way to the reasoner
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ResolvedTurn {
    pub turn_id: u64,
    pub user_id: String,
    pub combined_text: String,
    pub attachments: Vec<AttachmentDescriptor>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub locations: Vec<Coordinates>,
    pub linked_context: Option<String>,
    pub opened_at: DateTime<Utc>,
    pub finalized_at: DateTime<Utc>,

    /// Fingerprints of the events merged into this turn
    #[serde(skip)]
    pub event_ids: Vec<String>,
}

impl ResolvedTurn {
    #[must_use]
    pub fn has_text(&self) -> bool {
        !self.combined_text.is_empty()
    }

    /// Attachments only; shared locations count as text-like context
    #[must_use]
    pub fn has_attachments(&self) -> bool {
        !self.attachments.is_empty()
    }

    #[must_use]
    pub fn modality(&self) -> Modality {
        Modality::of(self.has_text(), self.has_attachments())
    }

    /// One-line summary recorded into recent history
    #[must_use]
    pub fn summary(&self) -> String {
        let mut parts = Vec::new();
        if self.has_text() {
            parts.push(self.combined_text.clone());
        }
        parts.extend(self.attachments.iter().map(AttachmentDescriptor::summary));
        parts.extend(
            self.locations
                .iter()
                .map(|c| format!("[location] {},{}", c.lat, c.long)),
        );
        parts.join(" ")
    }
}

#[cfg(test)]
mod tests {
    use chrono::TimeDelta;

    use super::*;

    fn text_at(text: &str, at: DateTime<Utc>, mid: &str) -> ChannelEvent {
        ChannelEvent::text("u1", text, at, mid).unwrap()
    }

    #[test]
    fn fragments_sort_by_time_then_source_id() {
        let t0 = Utc::now();
        let now = Instant::now();
        let first = text_at("bàn", t0 + TimeDelta::milliseconds(20), "m3");
        let mut turn = PendingTurn::open(1, first, now);
        turn.merge(text_at("muốn đặt", t0 + TimeDelta::milliseconds(10), "m2"), now)
            .unwrap();
        turn.merge(text_at("anh", t0 + TimeDelta::milliseconds(10), "m1"), now)
            .unwrap();

        assert_eq!(turn.combined_text(), "anh muốn đặt bàn");
    }

    #[test]
    fn finalized_turn_rejects_merges() {
        let now = Instant::now();
        let mut turn = PendingTurn::open(1, text_at("a", Utc::now(), "m1"), now);
        let resolved = turn.finalize(Utc::now());
        assert_eq!(turn.state, TurnState::Finalizing);
        assert_eq!(resolved.combined_text, "a");

        let late = text_at("b", Utc::now(), "m2");
        assert_eq!(turn.merge(late.clone(), now), Err(Box::new(late)));
    }

    #[test]
    fn resolved_turn_carries_event_ids_and_media() {
        let now = Instant::now();
        let first = text_at("combo này", Utc::now(), "m1");
        let image = ChannelEvent::attachment(
            "u1",
            AttachmentDescriptor::new("https://cdn/c.jpg", "image/jpeg"),
            Utc::now(),
            "m2",
        )
        .unwrap();
        let ids = [first.fingerprint(), image.fingerprint()];

        let mut turn = PendingTurn::open(7, first, now);
        turn.merge(image, now).unwrap();
        let resolved = turn.finalize(Utc::now());

        assert_eq!(resolved.turn_id, 7);
        assert_eq!(resolved.event_ids, ids);
        assert_eq!(resolved.modality(), Modality::Mixed);
        assert_eq!(resolved.summary(), "combo này [image] https://cdn/c.jpg");
    }

    #[test]
    fn serialized_turn_omits_internal_ids() {
        let now = Instant::now();
        let mut turn = PendingTurn::open(1, text_at("hi", Utc::now(), "m1"), now);
        let json = serde_json::to_value(turn.finalize(Utc::now())).unwrap();

        assert!(json.get("event_ids").is_none());
        assert!(json.get("locations").is_none());
        assert_eq!(json["combined_text"], "hi");
        assert!(json["linked_context"].is_null());
    }
}

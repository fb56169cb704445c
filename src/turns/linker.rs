//! Cross-turn context linking
//!
//! A user sometimes sends "how much is this combo?" long after the photo,
//! or a photo after the question has already been answered. The linker
//! backfills the missing half from recent history.

use std::sync::Arc;
use std::time::Duration;

use super::{ReferenceDetector, ResolvedTurn};
use crate::config::LinkerConfig;
use crate::history::{HistoryRole, HistoryStore, RecentHistoryEntry};

/// History rows scanned per lookup before filtering by modality
const SCAN_LIMIT: usize = 20;

/// Attaches relevant recent history to resolved turns
pub struct ContextLinker {
    history: Arc<dyn HistoryStore>,
    detector: ReferenceDetector,
    window: Duration,
    max_entries: usize,
}

impl ContextLinker {
    #[must_use]
    pub fn new(
        history: Arc<dyn HistoryStore>,
        detector: ReferenceDetector,
        config: &LinkerConfig,
    ) -> Self {
        Self {
            history,
            detector,
            window: config.link_window,
            max_entries: config.max_linked_entries.max(1),
        }
    }

    /// Set `linked_context` on the turn when it is missing a half
    ///
    /// History failures are logged and leave the turn unlinked.
    pub async fn link(&self, turn: &mut ResolvedTurn) {
        let wants_attachment =
            !turn.has_attachments() && self.detector.references_attachment(&turn.combined_text);
        let wants_text = turn.has_attachments() && !turn.has_text();

        if !wants_attachment && !wants_text {
            return;
        }

        let entries = match self
            .history
            .query_recent(&turn.user_id, SCAN_LIMIT, self.window)
            .await
        {
            Ok(entries) => entries,
            Err(e) => {
                tracing::warn!(
                    user_id = %turn.user_id,
                    turn_id = turn.turn_id,
                    backend = self.history.name(),
                    error = %e,
                    "history lookup failed, turn left unlinked"
                );
                return;
            }
        };

        let user_entries = entries.iter().filter(|e| e.role == HistoryRole::User);

        let linked: Vec<&RecentHistoryEntry> = if wants_attachment {
            user_entries
                .filter(|e| e.modality.has_attachment())
                .take(self.max_entries)
                .collect()
        } else {
            // Only the immediately preceding utterance, and only if it had text
            user_entries
                .take(1)
                .filter(|e| e.modality.has_text())
                .collect()
        };

        if linked.is_empty() {
            return;
        }

        tracing::debug!(
            user_id = %turn.user_id,
            turn_id = turn.turn_id,
            linked = linked.len(),
            "linked recent history"
        );
        turn.linked_context = Some(format_context(&linked));
    }
}

fn format_context(entries: &[&RecentHistoryEntry]) -> String {
    entries
        .iter()
        .map(|e| format!("[{}] {}", e.timestamp.format("%H:%M"), e.content_summary))
        .collect::<Vec<_>>()
        .join("\n")
}

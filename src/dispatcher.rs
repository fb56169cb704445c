//! Turn dispatcher
//!
//! Front door of the pipeline. Every normalized event is deduplicated,
//! appended to the ledger, and fed to the aggregator. Finalized turns come
//! back through [`Delivery`], which links context, asks the reasoner, relays
//! the reply and records the exchange in history.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::Result;
use crate::channels::{Channel, OutgoingMessage};
use crate::config::Config;
use crate::events::{ChannelEvent, EventKind, EventPayload, dedup::EventDedup};
use crate::history::{HistoryRole, HistoryStore, Modality};
use crate::ledger::{LedgerGate, LedgerMode, Recorded};
use crate::reasoner::Reasoner;
use crate::turns::{
    AggregatorStats, ContextLinker, ResolvedTurn, StatsSnapshot, TurnAggregator, TurnHandler,
    WaitPolicy,
};

/// Outcome of submitting an event
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Submitted {
    /// Fed to the aggregator; `durable` tells whether the ledger has it
    Accepted { durable: bool },
    /// Seen before, dropped
    Duplicate,
}

/// Handles a finalized turn end to end
pub struct Delivery {
    ledger: Arc<LedgerGate>,
    linker: ContextLinker,
    history: Arc<dyn HistoryStore>,
    reasoner: Arc<dyn Reasoner>,
    channel: Arc<dyn Channel>,
    stats: Arc<AggregatorStats>,
    reasoner_timeout: Duration,
    fallback_reply: String,
}

impl Delivery {
    async fn ask_reasoner(&self, turn: &ResolvedTurn) -> Result<String> {
        tokio::time::timeout(self.reasoner_timeout, self.reasoner.resolve_turn(turn))
            .await
            .map_err(|_| crate::Error::ReasonerTimeout(self.reasoner_timeout))?
    }

    async fn remember(&self, user_id: &str, role: HistoryRole, modality: Modality, summary: &str) {
        if let Err(e) = self
            .history
            .append(user_id, role, modality, summary, Utc::now())
            .await
        {
            tracing::warn!(
                user_id,
                role = role.as_str(),
                backend = self.history.name(),
                error = %e,
                "failed to record history"
            );
        }
    }
}

#[async_trait::async_trait]
impl TurnHandler for Delivery {
    async fn handle(&self, mut turn: ResolvedTurn) {
        // Consumed before the reasoner runs: a crash mid-call must not
        // replay the turn and answer twice
        self.ledger.acknowledge(&turn.event_ids).await;

        self.linker.link(&mut turn).await;
        self.remember(&turn.user_id, HistoryRole::User, turn.modality(), &turn.summary())
            .await;

        let (reply, answered) = match self.ask_reasoner(&turn).await {
            Ok(reply) => (reply, true),
            Err(e) => {
                self.stats.record_reasoner_failure();
                tracing::error!(
                    user_id = %turn.user_id,
                    turn_id = turn.turn_id,
                    reasoner = self.reasoner.name(),
                    text = %turn.combined_text,
                    attachments = turn.attachments.len(),
                    linked = ?turn.linked_context,
                    events = turn.event_ids.len(),
                    error = %e,
                    "reasoner failed, sending fallback reply"
                );
                (self.fallback_reply.clone(), false)
            }
        };

        if reply.is_empty() {
            tracing::debug!(user_id = %turn.user_id, turn_id = turn.turn_id, "no reply needed");
            return;
        }

        if let Err(e) = self
            .channel
            .send(OutgoingMessage::text(&turn.user_id, &reply))
            .await
        {
            tracing::warn!(
                user_id = %turn.user_id,
                turn_id = turn.turn_id,
                channel = self.channel.name(),
                error = %e,
                "failed to send reply"
            );
            return;
        }

        tracing::info!(
            user_id = %turn.user_id,
            turn_id = turn.turn_id,
            reply_len = reply.len(),
            "reply sent"
        );

        if answered {
            self.remember(&turn.user_id, HistoryRole::Bot, Modality::Text, &reply)
                .await;
        }
    }
}

/// Collaborators a dispatcher is built from
pub struct DispatcherParts {
    pub ledger: LedgerGate,
    pub history: Arc<dyn HistoryStore>,
    pub reasoner: Arc<dyn Reasoner>,
    pub channel: Arc<dyn Channel>,
}

/// Owns the aggregator and everything around it
pub struct TurnDispatcher {
    aggregator: TurnAggregator,
    ledger: Arc<LedgerGate>,
    dedup: EventDedup,
    history: Arc<dyn HistoryStore>,
    stats: Arc<AggregatorStats>,
    replay_max_age: Duration,
}

impl TurnDispatcher {
    /// Wire a dispatcher from configuration and its collaborators
    ///
    /// Must be called from within a Tokio runtime.
    ///
    /// # Errors
    ///
    /// Returns error if the wait policy is invalid
    pub fn new(config: &Config, parts: DispatcherParts) -> Result<Self> {
        let policy = WaitPolicy::new(&config.turns)?;
        let ledger = Arc::new(parts.ledger);
        let stats = Arc::new(AggregatorStats::default());

        let delivery = Arc::new(Delivery {
            ledger: ledger.clone(),
            linker: ContextLinker::new(
                parts.history.clone(),
                policy.detector().clone(),
                &config.linker,
            ),
            history: parts.history.clone(),
            reasoner: parts.reasoner,
            channel: parts.channel,
            stats: stats.clone(),
            reasoner_timeout: config.reasoner.timeout,
            fallback_reply: config.reasoner.fallback_reply.clone(),
        });

        tracing::info!(
            ledger = ledger.backend_name(),
            mode = ledger.mode().as_str(),
            history = parts.history.name(),
            "turn dispatcher ready"
        );

        Ok(Self {
            aggregator: TurnAggregator::new(policy, delivery, stats.clone()),
            ledger,
            dedup: EventDedup::default(),
            history: parts.history,
            stats,
            replay_max_age: config.ledger.replay_max_age,
        })
    }

    /// Normalize and submit one inbound event
    ///
    /// # Errors
    ///
    /// Returns `Error::InvalidEvent` if the user id is malformed or the
    /// payload does not match the kind
    pub async fn submit_event(
        &self,
        user_id: &str,
        kind: EventKind,
        payload: EventPayload,
        received_at: DateTime<Utc>,
        source_message_id: &str,
    ) -> Result<Submitted> {
        let event = ChannelEvent::new(user_id, kind, payload, received_at, source_message_id)?;
        Ok(self.submit(event).await)
    }

    /// Submit an already validated event
    pub async fn submit(&self, event: ChannelEvent) -> Submitted {
        let fingerprint = event.fingerprint();

        if self.dedup.is_duplicate(&fingerprint) {
            self.stats.record_duplicate();
            tracing::debug!(
                user_id = %event.user_id,
                source_message_id = %event.source_message_id,
                "duplicate event dropped"
            );
            return Submitted::Duplicate;
        }

        let durable = match self.ledger.record(&event).await {
            Recorded::Durable => true,
            Recorded::MemoryOnly => false,
            Recorded::Duplicate => {
                self.stats.record_duplicate();
                tracing::debug!(
                    user_id = %event.user_id,
                    source_message_id = %event.source_message_id,
                    "event already in ledger"
                );
                return Submitted::Duplicate;
            }
        };

        tracing::trace!(user_id = %event.user_id, kind = %event.kind, durable, "event accepted");
        self.aggregator.submit(event);
        Submitted::Accepted { durable }
    }

    /// Feed unconsumed ledger events back through the aggregator
    ///
    /// Returns how many events were replayed.
    pub async fn replay(&self) -> usize {
        let events = self.ledger.replayable(self.replay_max_age).await;
        let count = events.len();

        for event in events {
            self.dedup.remember(&event.fingerprint());
            self.aggregator.submit(event);
        }

        if count > 0 {
            tracing::info!(count, "replayed unconsumed ledger events");
        }
        count
    }

    /// Drop expired history and old consumed ledger rows
    pub async fn prune(&self, ledger_older_than: Duration) -> (usize, usize) {
        let ledger_rows = self.ledger.prune(ledger_older_than).await;
        let history_rows = match self.history.prune().await {
            Ok(n) => n,
            Err(e) => {
                tracing::warn!(backend = self.history.name(), error = %e, "history prune failed");
                0
            }
        };

        if ledger_rows + history_rows > 0 {
            tracing::info!(ledger_rows, history_rows, "pruned old records");
        }
        (ledger_rows, history_rows)
    }

    /// Finalize every open turn and wait for deliveries, up to `grace`
    pub async fn shutdown(&self, grace: Duration) -> bool {
        let flushed = self.aggregator.flush_all();
        tracing::info!(flushed, "flushing open turns");

        let idle = self.aggregator.wait_idle(grace).await;
        if !idle {
            tracing::warn!(
                in_flight = self.aggregator.in_flight(),
                "shutdown grace elapsed with turns still in flight"
            );
        }
        idle
    }

    #[must_use]
    pub fn ledger_mode(&self) -> LedgerMode {
        self.ledger.mode()
    }

    #[must_use]
    pub fn ledger_backend(&self) -> &'static str {
        self.ledger.backend_name()
    }

    #[must_use]
    pub fn stats(&self) -> StatsSnapshot {
        self.aggregator.stats()
    }

    #[must_use]
    pub const fn aggregator(&self) -> &TurnAggregator {
        &self.aggregator
    }
}

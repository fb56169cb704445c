//! Per-user turn aggregation
//!
//! Each user owns one slot in a sharded map. Every mutation of a user's
//! pending turn happens under that slot's lock, so different users never
//! contend and one user's events are applied one at a time.
//!
//! A pending turn has exactly one live deadline timer. Merging an event
//! aborts it and spawns a replacement; a timer that still fires after being
//! replaced notices its deadline no longer matches and does nothing.
//!
//! Finalized turns go onto the user's delivery queue, drained by a single
//! worker per user, so turns reach the handler strictly in the order they
//! were created while a new turn can already be collecting events.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use dashmap::DashMap;
use serde::Serialize;
use tokio::sync::mpsc;
use tokio::time::Instant;

use super::{PendingTurn, ResolvedTurn, TurnState, WaitPolicy};
use crate::events::ChannelEvent;

/// Receives finalized turns, one at a time per user
#[async_trait]
pub trait TurnHandler: Send + Sync {
    async fn handle(&self, turn: ResolvedTurn);
}

/// Pipeline counters
#[derive(Debug, Default)]
pub struct AggregatorStats {
    events_received: AtomicU64,
    events_merged: AtomicU64,
    duplicates_dropped: AtomicU64,
    turns_opened: AtomicU64,
    turns_finalized: AtomicU64,
    invariant_violations: AtomicU64,
    reasoner_failures: AtomicU64,
}

impl AggregatorStats {
    pub fn record_duplicate(&self) {
        self.duplicates_dropped.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_reasoner_failure(&self) {
        self.reasoner_failures.fetch_add(1, Ordering::Relaxed);
    }

    #[must_use]
    pub fn snapshot(&self, pending_turns: usize) -> StatsSnapshot {
        StatsSnapshot {
            events_received: self.events_received.load(Ordering::Relaxed),
            events_merged: self.events_merged.load(Ordering::Relaxed),
            duplicates_dropped: self.duplicates_dropped.load(Ordering::Relaxed),
            turns_opened: self.turns_opened.load(Ordering::Relaxed),
            turns_finalized: self.turns_finalized.load(Ordering::Relaxed),
            invariant_violations: self.invariant_violations.load(Ordering::Relaxed),
            reasoner_failures: self.reasoner_failures.load(Ordering::Relaxed),
            pending_turns,
        }
    }
}

/// Point-in-time copy of the counters
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct StatsSnapshot {
    pub events_received: u64,
    pub events_merged: u64,
    pub duplicates_dropped: u64,
    pub turns_opened: u64,
    pub turns_finalized: u64,
    pub invariant_violations: u64,
    pub reasoner_failures: u64,
    pub pending_turns: usize,
}

/// Read-only view of a user's pending turn
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PendingView {
    pub turn_id: u64,
    pub state: TurnState,
    pub event_count: usize,
    pub opened_at: Instant,
    pub deadline_at: Instant,
}

struct UserSlot {
    pending: Option<PendingTurn>,
    in_flight: usize,
    outbox: mpsc::UnboundedSender<ResolvedTurn>,
}

struct Inner {
    me: Weak<Inner>,
    policy: WaitPolicy,
    slots: DashMap<String, UserSlot>,
    handler: Arc<dyn TurnHandler>,
    stats: Arc<AggregatorStats>,
    next_turn_id: AtomicU64,
}

/// Owner of every user's pending turn
#[derive(Clone)]
pub struct TurnAggregator {
    inner: Arc<Inner>,
}

impl TurnAggregator {
    /// Create an aggregator delivering finalized turns to `handler`
    #[must_use]
    pub fn new(
        policy: WaitPolicy,
        handler: Arc<dyn TurnHandler>,
        stats: Arc<AggregatorStats>,
    ) -> Self {
        let inner = Arc::new_cyclic(|me| Inner {
            me: me.clone(),
            policy,
            slots: DashMap::new(),
            handler,
            stats,
            next_turn_id: AtomicU64::new(1),
        });
        Self { inner }
    }

    /// Feed one event: open a turn or merge into the open one, then
    /// reschedule its deadline
    ///
    /// Must be called from within a Tokio runtime.
    pub fn submit(&self, event: ChannelEvent) {
        self.inner.submit(event);
    }

    /// Finalize a user's open turn now instead of at its deadline
    ///
    /// Returns whether a turn was finalized.
    pub fn flush(&self, user_id: &str) -> bool {
        let Some(mut slot) = self.inner.slots.get_mut(user_id) else {
            return false;
        };
        self.inner.hand_off(user_id, &mut slot, "flush")
    }

    /// Finalize every open turn
    pub fn flush_all(&self) -> usize {
        let users: Vec<String> = self
            .inner
            .slots
            .iter()
            .map(|entry| entry.key().clone())
            .collect();
        users.iter().filter(|user| self.flush(user)).count()
    }

    /// Users with a turn still collecting events
    #[must_use]
    pub fn pending_turns(&self) -> usize {
        self.inner
            .slots
            .iter()
            .filter(|slot| slot.pending.is_some())
            .count()
    }

    /// Finalized turns not yet fully handled
    #[must_use]
    pub fn in_flight(&self) -> usize {
        self.inner.slots.iter().map(|slot| slot.in_flight).sum()
    }

    #[must_use]
    pub fn pending(&self, user_id: &str) -> Option<PendingView> {
        let slot = self.inner.slots.get(user_id)?;
        slot.pending.as_ref().map(|turn| PendingView {
            turn_id: turn.turn_id,
            state: turn.state,
            event_count: turn.event_count(),
            opened_at: turn.opened_at,
            deadline_at: turn.deadline_at,
        })
    }

    #[must_use]
    pub fn stats(&self) -> StatsSnapshot {
        self.inner.stats.snapshot(self.pending_turns())
    }

    #[must_use]
    pub fn policy(&self) -> &WaitPolicy {
        &self.inner.policy
    }

    /// Wait until no turn is pending or in flight, up to `grace`
    ///
    /// Returns whether the aggregator went idle in time.
    pub async fn wait_idle(&self, grace: Duration) -> bool {
        let deadline = Instant::now() + grace;
        loop {
            if self.pending_turns() == 0 && self.in_flight() == 0 {
                return true;
            }
            if Instant::now() >= deadline {
                return false;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    }
}

impl Inner {
    fn submit(&self, event: ChannelEvent) {
        self.stats.events_received.fetch_add(1, Ordering::Relaxed);
        let now = Instant::now();
        let user_id = event.user_id.clone();

        let mut slot = self
            .slots
            .entry(user_id.clone())
            .or_insert_with(|| UserSlot {
                pending: None,
                in_flight: 0,
                outbox: self.spawn_outbox(&user_id),
            });

        let leftover = if let Some(turn) = slot.pending.as_mut() {
            match turn.merge(event, now) {
                Ok(()) => {
                    self.stats.events_merged.fetch_add(1, Ordering::Relaxed);
                    tracing::debug!(
                        user_id = %user_id,
                        turn_id = turn.turn_id,
                        events = turn.event_count(),
                        "event merged into open turn"
                    );
                    None
                }
                Err(rejected) => Some((rejected, true)),
            }
        } else {
            Some((Box::new(event), false))
        };

        if let Some((event, violated)) = leftover {
            if violated {
                self.stats.invariant_violations.fetch_add(1, Ordering::Relaxed);
                tracing::error!(
                    user_id = %user_id,
                    turn = ?slot.pending,
                    "merge into a turn that is not open, finalizing it"
                );
                self.hand_off(&user_id, &mut slot, "invariant");
            }

            let turn_id = self.next_turn_id.fetch_add(1, Ordering::Relaxed);
            slot.pending = Some(PendingTurn::open(turn_id, *event, now));
            self.stats.turns_opened.fetch_add(1, Ordering::Relaxed);
            tracing::debug!(user_id = %user_id, turn_id, "turn opened");
        }

        let Some(turn) = slot.pending.as_mut() else {
            return;
        };
        let (deadline, decision) = self.policy.deadline(turn, now);
        turn.deadline_at = deadline;
        self.arm_timer(turn);

        tracing::debug!(
            user_id = %user_id,
            turn_id = turn.turn_id,
            reason = ?decision.reason,
            wait_ms = u64::try_from(deadline.saturating_duration_since(now).as_millis())
                .unwrap_or(u64::MAX),
            "turn deadline scheduled"
        );
    }

    /// Replace the turn's timer with one for its current deadline
    fn arm_timer(&self, turn: &mut PendingTurn) {
        if let Some(old) = turn.timer.take() {
            old.abort();
        }

        let me = self.me.clone();
        let user_id = turn.user_id.clone();
        let turn_id = turn.turn_id;
        let deadline = turn.deadline_at;

        let task = tokio::spawn(async move {
            tokio::time::sleep_until(deadline).await;
            if let Some(inner) = me.upgrade() {
                inner.on_deadline(&user_id, turn_id, deadline);
            }
        });
        turn.timer = Some(task.abort_handle());
    }

    fn on_deadline(&self, user_id: &str, turn_id: u64, deadline: Instant) {
        let Some(mut slot) = self.slots.get_mut(user_id) else {
            tracing::debug!(user_id, turn_id, "timer fired after user slot was released");
            return;
        };

        let Some(turn) = slot.pending.as_mut() else {
            tracing::debug!(user_id, turn_id, "timer fired after turn was finalized");
            return;
        };

        if turn.turn_id != turn_id {
            tracing::debug!(
                user_id,
                turn_id,
                live_turn = turn.turn_id,
                "timer for a previous turn ignored"
            );
            return;
        }

        // Woke before a merge rescheduled the turn; the replacement timer
        // owns the deadline now
        if turn.deadline_at != deadline {
            tracing::debug!(user_id, turn_id, "superseded timer ignored");
            return;
        }

        // This task is the timer; let it finish rather than abort itself
        turn.timer = None;
        self.hand_off(user_id, &mut slot, "deadline");
    }

    /// Finalize the slot's pending turn and queue it for delivery
    fn hand_off(&self, user_id: &str, slot: &mut UserSlot, trigger: &'static str) -> bool {
        let Some(mut turn) = slot.pending.take() else {
            return false;
        };
        if let Some(timer) = turn.timer.take() {
            timer.abort();
        }

        let resolved = turn.finalize(Utc::now());
        tracing::info!(
            user_id,
            turn_id = resolved.turn_id,
            trigger,
            events = resolved.event_ids.len(),
            attachments = resolved.attachments.len(),
            open_ms = u64::try_from(turn.opened_at.elapsed().as_millis()).unwrap_or(u64::MAX),
            "turn finalized"
        );

        slot.in_flight += 1;
        if let Err(e) = slot.outbox.send(resolved) {
            slot.in_flight -= 1;
            tracing::error!(user_id, turn_id = e.0.turn_id, "delivery queue closed, turn dropped");
            return false;
        }

        turn.state = TurnState::Closed;
        tracing::trace!(user_id, turn_id = turn.turn_id, state = ?turn.state, "turn handed off");
        self.stats.turns_finalized.fetch_add(1, Ordering::Relaxed);
        true
    }

    /// Start the user's delivery worker
    fn spawn_outbox(&self, user_id: &str) -> mpsc::UnboundedSender<ResolvedTurn> {
        let (tx, mut rx) = mpsc::unbounded_channel::<ResolvedTurn>();
        let me = self.me.clone();
        let handler = self.handler.clone();
        let user_id = user_id.to_string();

        tokio::spawn(async move {
            while let Some(turn) = rx.recv().await {
                let turn_id = turn.turn_id;
                let handler = handler.clone();

                // Isolated so a panicking handler does not stall the queue
                if let Err(e) = tokio::spawn(async move { handler.handle(turn).await }).await {
                    tracing::error!(user_id = %user_id, turn_id, error = %e, "turn handler failed");
                }

                match me.upgrade() {
                    Some(inner) => inner.delivered(&user_id),
                    None => break,
                }
            }
        });

        tx
    }

    fn delivered(&self, user_id: &str) {
        if let Some(mut slot) = self.slots.get_mut(user_id) {
            slot.in_flight = slot.in_flight.saturating_sub(1);
        }
        self.slots
            .remove_if(user_id, |_, slot| slot.pending.is_none() && slot.in_flight == 0);
    }
}

//! Event ledger
//!
//! Append-only log of inbound channel events. The ledger is what makes
//! aggregation crash tolerant: events are appended before they are fed to
//! the aggregator, marked consumed once their turn has been handed to the
//! reasoner, and replayed at startup if they never were.
//!
//! The backend is selected once at startup. [`LedgerGate`] wraps it so the
//! rest of the pipeline runs one code path whether the ledger is durable,
//! flapping or absent.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;

use crate::Result;
use crate::events::ChannelEvent;

/// Outcome of a successful append
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Appended {
    /// First time this event was recorded
    New,
    /// The event's fingerprint was already in the ledger
    Duplicate,
}

/// Durable event log backend
#[async_trait]
pub trait EventLedger: Send + Sync {
    /// Backend name for logs
    fn name(&self) -> &'static str;

    /// Append an event, keyed by its fingerprint
    ///
    /// Returns `Error::LedgerUnavailable` when the backend cannot be reached.
    async fn append(&self, event: &ChannelEvent) -> Result<Appended>;

    /// Mark events consumed by their fingerprints
    async fn mark_consumed(&self, event_ids: &[String]) -> Result<usize>;

    /// Unconsumed events no older than `max_age`, in receipt order
    async fn unconsumed(&self, max_age: Duration) -> Result<Vec<ChannelEvent>>;

    /// Delete consumed events older than `older_than`
    async fn prune_consumed(&self, older_than: Duration) -> Result<usize>;
}

/// Current durability of event intake
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum LedgerMode {
    Durable,
    Degraded,
}

impl LedgerMode {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Durable => "durable",
            Self::Degraded => "degraded",
        }
    }
}

/// Result of recording an event through the gate
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Recorded {
    /// Durably appended
    Durable,
    /// Already present in the ledger
    Duplicate,
    /// Not persisted (no ledger, or the ledger is down)
    MemoryOnly,
}

/// Ledger front used by the dispatcher
///
/// Outage logging is edge triggered: one warning when the backend first
/// fails, one info line when it recovers.
pub struct LedgerGate {
    backend: Option<Arc<dyn EventLedger>>,
    outage: AtomicBool,
}

impl LedgerGate {
    /// Gate over a durable backend
    #[must_use]
    pub fn durable(backend: Arc<dyn EventLedger>) -> Self {
        Self {
            backend: Some(backend),
            outage: AtomicBool::new(false),
        }
    }

    /// Gate with no backend: in-memory aggregation only
    #[must_use]
    pub fn in_memory() -> Self {
        tracing::warn!("event ledger unavailable, aggregating in memory only");
        Self {
            backend: None,
            outage: AtomicBool::new(false),
        }
    }

    #[must_use]
    pub fn mode(&self) -> LedgerMode {
        if self.backend.is_some() && !self.outage.load(Ordering::Acquire) {
            LedgerMode::Durable
        } else {
            LedgerMode::Degraded
        }
    }

    /// Backend name, or "memory" when running without one
    #[must_use]
    pub fn backend_name(&self) -> &'static str {
        self.backend.as_ref().map_or("memory", |b| b.name())
    }

    /// Append an event; never fails
    pub async fn record(&self, event: &ChannelEvent) -> Recorded {
        let Some(backend) = &self.backend else {
            return Recorded::MemoryOnly;
        };

        match backend.append(event).await {
            Ok(appended) => {
                self.recovered();
                match appended {
                    Appended::New => Recorded::Durable,
                    Appended::Duplicate => Recorded::Duplicate,
                }
            }
            Err(e) => {
                self.failed(&e);
                Recorded::MemoryOnly
            }
        }
    }

    /// Mark events consumed; failures are logged and swallowed
    pub async fn acknowledge(&self, event_ids: &[String]) {
        let Some(backend) = &self.backend else {
            return;
        };
        if event_ids.is_empty() {
            return;
        }

        match backend.mark_consumed(event_ids).await {
            Ok(count) => {
                self.recovered();
                tracing::trace!(count, "ledger events consumed");
            }
            Err(e) => self.failed(&e),
        }
    }

    /// Events to replay after a restart
    pub async fn replayable(&self, max_age: Duration) -> Vec<ChannelEvent> {
        let Some(backend) = &self.backend else {
            return Vec::new();
        };

        match backend.unconsumed(max_age).await {
            Ok(events) => {
                self.recovered();
                events
            }
            Err(e) => {
                self.failed(&e);
                Vec::new()
            }
        }
    }

    /// Drop old consumed events
    pub async fn prune(&self, older_than: Duration) -> usize {
        let Some(backend) = &self.backend else {
            return 0;
        };

        match backend.prune_consumed(older_than).await {
            Ok(n) => n,
            Err(e) => {
                self.failed(&e);
                0
            }
        }
    }

    fn failed(&self, error: &crate::Error) {
        if self.outage.swap(true, Ordering::AcqRel) {
            tracing::debug!(error = %error, "event ledger still unavailable");
        } else {
            tracing::warn!(
                backend = self.backend_name(),
                error = %error,
                "event ledger unavailable, continuing with in-memory aggregation"
            );
        }
    }

    fn recovered(&self) {
        if self.outage.swap(false, Ordering::AcqRel) {
            tracing::info!(backend = self.backend_name(), "event ledger recovered");
        }
    }
}

//! Shared test utilities
#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use beacon_turns::channels::{Channel, OutgoingMessage};
use beacon_turns::config::file::TurnsConfigFile;
use beacon_turns::history::{HistoryStore, MemoryHistoryStore};
use beacon_turns::{
    AttachmentDescriptor, ChannelEvent, Config, DispatcherParts, Error, LedgerGate, Reasoner,
    ResolvedTurn, Result, TurnDispatcher, db,
};
use chrono::Utc;
use tokio::sync::Mutex;
use tokio::time::Instant;

/// Configuration with defaults and the given overrides
pub fn test_config(vars: &[(&str, &str)]) -> Config {
    let vars: Vec<(String, String)> = vars
        .iter()
        .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
        .collect();
    Config::from_sources(TurnsConfigFile::default(), move |key| {
        vars.iter().find(|(k, _)| k == key).map(|(_, v)| v.clone())
    })
    .expect("valid test config")
}

/// Channel that records every reply
#[derive(Default)]
pub struct MockChannel {
    pub sent: Mutex<Vec<(Instant, OutgoingMessage)>>,
}

impl MockChannel {
    pub async fn contents(&self) -> Vec<String> {
        self.sent
            .lock()
            .await
            .iter()
            .map(|(_, m)| m.content.clone())
            .collect()
    }
}

#[async_trait]
impl Channel for MockChannel {
    fn name(&self) -> &'static str {
        "mock"
    }

    async fn send(&self, message: OutgoingMessage) -> Result<()> {
        self.sent.lock().await.push((Instant::now(), message));
        Ok(())
    }
}

#[derive(Clone, Copy)]
pub enum Behavior {
    /// Reply "re: <combined text>"
    Echo,
    /// Fail every call
    Fail,
    /// Never answer
    Hang,
}

/// Reasoner that records the turns it is asked about
pub struct MockReasoner {
    behavior: Behavior,
    delay: Duration,
    pub calls: Mutex<Vec<(Instant, ResolvedTurn)>>,
    pub finished: Mutex<Vec<u64>>,
}

impl MockReasoner {
    pub fn new(behavior: Behavior) -> Self {
        Self::with_delay(behavior, Duration::ZERO)
    }

    pub fn with_delay(behavior: Behavior, delay: Duration) -> Self {
        Self {
            behavior,
            delay,
            calls: Mutex::new(Vec::new()),
            finished: Mutex::new(Vec::new()),
        }
    }

    pub async fn turns(&self) -> Vec<ResolvedTurn> {
        self.calls.lock().await.iter().map(|(_, t)| t.clone()).collect()
    }
}

#[async_trait]
impl Reasoner for MockReasoner {
    fn name(&self) -> &'static str {
        "mock"
    }

    async fn resolve_turn(&self, turn: &ResolvedTurn) -> Result<String> {
        self.calls.lock().await.push((Instant::now(), turn.clone()));
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        self.finished.lock().await.push(turn.turn_id);

        match self.behavior {
            Behavior::Echo => Ok(format!("re: {}", turn.combined_text)),
            Behavior::Fail => Err(Error::Reasoner("mock failure".to_string())),
            Behavior::Hang => {
                std::future::pending::<()>().await;
                Ok(String::new())
            }
        }
    }
}

/// Everything a pipeline test needs to observe
pub struct Harness {
    pub dispatcher: Arc<TurnDispatcher>,
    pub reasoner: Arc<MockReasoner>,
    pub channel: Arc<MockChannel>,
    pub history: Arc<dyn HistoryStore>,
}

/// Dispatcher with an in-memory ledger and history
pub fn harness(reasoner: MockReasoner) -> Harness {
    harness_with(&test_config(&[]), LedgerGate::in_memory(), reasoner)
}

/// Dispatcher over a durable `SQLite` ledger
pub fn durable_harness(reasoner: MockReasoner) -> Harness {
    let pool = db::init_memory().expect("failed to init test db");
    let ledger = LedgerGate::durable(Arc::new(db::SqliteLedger::new(pool)));
    harness_with(&test_config(&[]), ledger, reasoner)
}

pub fn harness_with(config: &Config, ledger: LedgerGate, reasoner: MockReasoner) -> Harness {
    let reasoner = Arc::new(reasoner);
    let channel = Arc::new(MockChannel::default());
    let history: Arc<dyn HistoryStore> = Arc::new(MemoryHistoryStore::new(
        config.history.ttl,
        config.history.max_entries_per_user,
    ));

    let dispatcher = TurnDispatcher::new(
        config,
        DispatcherParts {
            ledger,
            history: history.clone(),
            reasoner: reasoner.clone(),
            channel: channel.clone(),
        },
    )
    .expect("valid dispatcher");

    Harness {
        dispatcher: Arc::new(dispatcher),
        reasoner,
        channel,
        history,
    }
}

pub fn text(user: &str, body: &str, mid: &str) -> ChannelEvent {
    ChannelEvent::text(user, body, Utc::now(), mid).expect("valid text event")
}

pub fn image(user: &str, mid: &str) -> ChannelEvent {
    ChannelEvent::attachment(
        user,
        AttachmentDescriptor::new(format!("https://cdn.example/{mid}.jpg"), "image/jpeg"),
        Utc::now(),
        mid,
    )
    .expect("valid attachment event")
}

/// Advance the paused clock and let spawned tasks run
pub async fn advance(d: Duration) {
    tokio::time::sleep(d).await;
    for _ in 0..20 {
        tokio::task::yield_now().await;
    }
}

pub const fn ms(n: u64) -> Duration {
    Duration::from_millis(n)
}

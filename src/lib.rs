//! Beacon Turns - turn aggregation for messaging-channel AI assistants
//!
//! Chat users rarely say everything in one message. They type in bursts,
//! send a photo and then ask about it, or ask first and send the photo
//! later. This crate sits between a messaging channel and a reasoner and
//! groups each user's raw events into one coherent *turn* before asking for
//! a reply.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────┐
//! │           Messenger webhook  │  /api/events          │
//! └────────────────────┬────────────────────────────────┘
//!                      │ ChannelEvent
//! ┌────────────────────▼────────────────────────────────┐
//! │  Dispatcher: dedup → ledger → TurnAggregator        │
//! │  (per-user pending turn, wait policy, deadlines)    │
//! └────────────────────┬────────────────────────────────┘
//!                      │ ResolvedTurn
//! ┌────────────────────▼────────────────────────────────┐
//! │  ContextLinker → Reasoner → Channel → History       │
//! └─────────────────────────────────────────────────────┘
//! ```

pub mod api;
pub mod channels;
pub mod config;
pub mod daemon;
pub mod db;
pub mod dispatcher;
pub mod error;
pub mod events;
pub mod history;
pub mod ledger;
pub mod reasoner;
pub mod turns;

pub use config::Config;
pub use daemon::Daemon;
pub use db::{DbConn, DbPool};
pub use dispatcher::{DispatcherParts, Submitted, TurnDispatcher};
pub use error::{Error, Result};
pub use events::{AttachmentDescriptor, ChannelEvent, EventKind, EventPayload};
pub use history::{HistoryStore, MemoryHistoryStore};
pub use ledger::{EventLedger, LedgerGate, LedgerMode};
pub use reasoner::{HttpReasoner, Reasoner};
pub use turns::{ResolvedTurn, TurnAggregator};

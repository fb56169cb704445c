//! Recent conversation history
//!
//! A short-lived, per-user log of what was said in each resolved turn. The
//! context linker reads it to stitch a late image onto earlier text (and the
//! reverse). Entries expire after a retention window and each user's log is
//! capped.

use std::collections::VecDeque;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, TimeDelta, Utc};
use dashmap::DashMap;
use serde::Serialize;

use crate::Result;

/// Who produced a history entry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HistoryRole {
    User,
    Bot,
}

impl HistoryRole {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::User => "user",
            Self::Bot => "bot",
        }
    }

    #[must_use]
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "user" => Some(Self::User),
            "bot" => Some(Self::Bot),
            _ => None,
        }
    }
}

/// What a history entry carried
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Modality {
    Text,
    Attachment,
    Mixed,
}

impl Modality {
    /// Derive from the presence of text and attachments
    #[must_use]
    pub const fn of(has_text: bool, has_attachments: bool) -> Self {
        match (has_text, has_attachments) {
            (true, true) => Self::Mixed,
            (false, true) => Self::Attachment,
            _ => Self::Text,
        }
    }

    #[must_use]
    pub const fn has_text(self) -> bool {
        matches!(self, Self::Text | Self::Mixed)
    }

    #[must_use]
    pub const fn has_attachment(self) -> bool {
        matches!(self, Self::Attachment | Self::Mixed)
    }

    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Text => "text",
            Self::Attachment => "attachment",
            Self::Mixed => "mixed",
        }
    }

    #[must_use]
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "text" => Some(Self::Text),
            "attachment" => Some(Self::Attachment),
            "mixed" => Some(Self::Mixed),
            _ => None,
        }
    }
}

/// One remembered utterance
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RecentHistoryEntry {
    pub user_id: String,
    pub role: HistoryRole,
    pub modality: Modality,
    pub content_summary: String,
    pub timestamp: DateTime<Utc>,
    #[serde(skip)]
    pub ttl: Duration,
}

impl RecentHistoryEntry {
    #[must_use]
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        TimeDelta::from_std(self.ttl)
            .ok()
            .and_then(|ttl| self.timestamp.checked_add_signed(ttl))
            .is_some_and(|expires| expires <= now)
    }
}

/// Earliest timestamp still inside `max_age`
#[must_use]
pub fn cutoff(now: DateTime<Utc>, max_age: Duration) -> DateTime<Utc> {
    TimeDelta::from_std(max_age)
        .ok()
        .and_then(|age| now.checked_sub_signed(age))
        .unwrap_or(DateTime::<Utc>::MIN_UTC)
}

/// Storage for recent history
#[async_trait]
pub trait HistoryStore: Send + Sync {
    /// Backend name for logs
    fn name(&self) -> &'static str;

    /// Record an entry, evicting the user's oldest entries beyond the cap
    async fn append(
        &self,
        user_id: &str,
        role: HistoryRole,
        modality: Modality,
        content_summary: &str,
        timestamp: DateTime<Utc>,
    ) -> Result<()>;

    /// Live entries for a user no older than `max_age`, newest first
    async fn query_recent(
        &self,
        user_id: &str,
        limit: usize,
        max_age: Duration,
    ) -> Result<Vec<RecentHistoryEntry>>;

    /// Drop expired entries, returning how many were removed
    async fn prune(&self) -> Result<usize>;
}

/// In-process history store
#[derive(Debug)]
pub struct MemoryHistoryStore {
    entries: DashMap<String, VecDeque<RecentHistoryEntry>>,
    ttl: Duration,
    max_entries_per_user: usize,
}

impl MemoryHistoryStore {
    #[must_use]
    pub fn new(ttl: Duration, max_entries_per_user: usize) -> Self {
        Self {
            entries: DashMap::new(),
            ttl,
            max_entries_per_user: max_entries_per_user.max(1),
        }
    }
}

#[async_trait]
impl HistoryStore for MemoryHistoryStore {
    fn name(&self) -> &'static str {
        "memory"
    }

    async fn append(
        &self,
        user_id: &str,
        role: HistoryRole,
        modality: Modality,
        content_summary: &str,
        timestamp: DateTime<Utc>,
    ) -> Result<()> {
        let mut log = self.entries.entry(user_id.to_string()).or_default();
        log.push_back(RecentHistoryEntry {
            user_id: user_id.to_string(),
            role,
            modality,
            content_summary: content_summary.to_string(),
            timestamp,
            ttl: self.ttl,
        });
        while log.len() > self.max_entries_per_user {
            log.pop_front();
        }
        Ok(())
    }

    async fn query_recent(
        &self,
        user_id: &str,
        limit: usize,
        max_age: Duration,
    ) -> Result<Vec<RecentHistoryEntry>> {
        let now = Utc::now();
        let since = cutoff(now, max_age);

        let Some(log) = self.entries.get(user_id) else {
            return Ok(Vec::new());
        };

        let mut live: Vec<_> = log
            .iter()
            .filter(|e| e.timestamp >= since && !e.is_expired(now))
            .cloned()
            .collect();
        live.sort_by(|a, b| b.timestamp.cmp(&a.timestamp));
        live.truncate(limit);
        Ok(live)
    }

    async fn prune(&self) -> Result<usize> {
        let now = Utc::now();
        let mut removed = 0;

        for mut log in self.entries.iter_mut() {
            let before = log.len();
            log.retain(|e| !e.is_expired(now));
            removed += before - log.len();
        }
        self.entries.retain(|_, log| !log.is_empty());

        Ok(removed)
    }
}

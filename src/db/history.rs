//! `SQLite`-backed recent history store

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, TimeDelta, Utc};

use super::{DbPool, format_datetime, parse_datetime, run_blocking};
use crate::history::{HistoryRole, HistoryStore, Modality, RecentHistoryEntry, cutoff};
use crate::{Error, Result};

/// Stored instead of an expiry that would overflow
const FAR_FUTURE: &str = "9999-12-31T23:59:59.999999Z";

/// History store over the `history_entries` table
#[derive(Clone)]
pub struct SqliteHistoryStore {
    pool: DbPool,
    ttl: Duration,
    max_entries_per_user: usize,
}

impl SqliteHistoryStore {
    /// Create a new history store
    #[must_use]
    pub fn new(pool: DbPool, ttl: Duration, max_entries_per_user: usize) -> Self {
        Self {
            pool,
            ttl,
            max_entries_per_user: max_entries_per_user.max(1),
        }
    }

    fn expires_at(&self, timestamp: DateTime<Utc>) -> String {
        TimeDelta::from_std(self.ttl)
            .ok()
            .and_then(|ttl| timestamp.checked_add_signed(ttl))
            .map_or_else(|| FAR_FUTURE.to_string(), format_datetime)
    }

    fn append_sync(
        &self,
        user_id: &str,
        role: HistoryRole,
        modality: Modality,
        content_summary: &str,
        timestamp: DateTime<Utc>,
    ) -> Result<()> {
        let conn = self
            .pool
            .get()
            .map_err(|e| Error::Database(e.to_string()))?;

        conn.execute(
            "INSERT INTO history_entries
             (user_id, role, modality, content_summary, created_at, expires_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            rusqlite::params![
                user_id,
                role.as_str(),
                modality.as_str(),
                content_summary,
                format_datetime(timestamp),
                self.expires_at(timestamp),
            ],
        )?;

        // Keep only the newest entries for this user
        let cap = i64::try_from(self.max_entries_per_user).unwrap_or(i64::MAX);
        conn.execute(
            "DELETE FROM history_entries
             WHERE user_id = ?1 AND id NOT IN (
                 SELECT id FROM history_entries WHERE user_id = ?1
                 ORDER BY created_at DESC, id DESC LIMIT ?2
             )",
            rusqlite::params![user_id, cap],
        )?;

        Ok(())
    }

    fn query_sync(
        &self,
        user_id: &str,
        limit: usize,
        max_age: Duration,
    ) -> Result<Vec<RecentHistoryEntry>> {
        let conn = self
            .pool
            .get()
            .map_err(|e| Error::Database(e.to_string()))?;
        let now = Utc::now();
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);

        let mut stmt = conn.prepare(
            "SELECT user_id, role, modality, content_summary, created_at
             FROM history_entries
             WHERE user_id = ?1 AND created_at >= ?2 AND expires_at > ?3
             ORDER BY created_at DESC, id DESC
             LIMIT ?4",
        )?;

        let rows = stmt.query_map(
            rusqlite::params![
                user_id,
                format_datetime(cutoff(now, max_age)),
                format_datetime(now),
                limit,
            ],
            |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, String>(3)?,
                    row.get::<_, String>(4)?,
                ))
            },
        )?;

        let mut entries = Vec::new();
        for row in rows {
            let (user_id, role, modality, content_summary, created_at) = row?;
            let (Some(role), Some(modality)) =
                (HistoryRole::parse(&role), Modality::parse(&modality))
            else {
                tracing::warn!(
                    user_id = %user_id,
                    role = %role,
                    modality = %modality,
                    "skipping malformed history row"
                );
                continue;
            };
            entries.push(RecentHistoryEntry {
                user_id,
                role,
                modality,
                content_summary,
                timestamp: parse_datetime(&created_at),
                ttl: self.ttl,
            });
        }

        Ok(entries)
    }

    fn prune_sync(&self) -> Result<usize> {
        let conn = self
            .pool
            .get()
            .map_err(|e| Error::Database(e.to_string()))?;

        Ok(conn.execute(
            "DELETE FROM history_entries WHERE expires_at <= ?1",
            [format_datetime(Utc::now())],
        )?)
    }
}

#[async_trait]
impl HistoryStore for SqliteHistoryStore {
    fn name(&self) -> &'static str {
        "sqlite"
    }

    async fn append(
        &self,
        user_id: &str,
        role: HistoryRole,
        modality: Modality,
        content_summary: &str,
        timestamp: DateTime<Utc>,
    ) -> Result<()> {
        let store = self.clone();
        let user_id = user_id.to_string();
        let content_summary = content_summary.to_string();
        run_blocking(move || {
            store.append_sync(&user_id, role, modality, &content_summary, timestamp)
        })
        .await
    }

    async fn query_recent(
        &self,
        user_id: &str,
        limit: usize,
        max_age: Duration,
    ) -> Result<Vec<RecentHistoryEntry>> {
        let store = self.clone();
        let user_id = user_id.to_string();
        run_blocking(move || store.query_sync(&user_id, limit, max_age)).await
    }

    async fn prune(&self) -> Result<usize> {
        let store = self.clone();
        run_blocking(move || store.prune_sync()).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::init_memory;

    fn setup(ttl: Duration, cap: usize) -> SqliteHistoryStore {
        SqliteHistoryStore::new(init_memory().unwrap(), ttl, cap)
    }

    #[tokio::test]
    async fn newest_first_with_limit() {
        let store = setup(Duration::from_secs(3600), 100);
        let now = Utc::now();
        for (i, summary) in ["a", "b", "c"].iter().enumerate() {
            let at = now - TimeDelta::seconds(10 - i64::try_from(i).unwrap());
            store
                .append("u1", HistoryRole::User, Modality::Text, summary, at)
                .await
                .unwrap();
        }

        let entries = store
            .query_recent("u1", 2, Duration::from_secs(60))
            .await
            .unwrap();
        let summaries: Vec<_> = entries.iter().map(|e| e.content_summary.as_str()).collect();
        assert_eq!(summaries, ["c", "b"]);
    }

    #[tokio::test]
    async fn cap_is_enforced_per_user() {
        let store = setup(Duration::from_secs(3600), 2);
        let now = Utc::now();
        for i in 0..4 {
            store
                .append(
                    "u1",
                    HistoryRole::User,
                    Modality::Text,
                    &format!("m{i}"),
                    now + TimeDelta::milliseconds(i),
                )
                .await
                .unwrap();
        }
        store
            .append("u2", HistoryRole::Bot, Modality::Text, "other", now)
            .await
            .unwrap();

        let mine = store
            .query_recent("u1", 10, Duration::from_secs(60))
            .await
            .unwrap();
        assert_eq!(mine.len(), 2);
        assert_eq!(mine[0].content_summary, "m3");

        let theirs = store
            .query_recent("u2", 10, Duration::from_secs(60))
            .await
            .unwrap();
        assert_eq!(theirs.len(), 1);
        assert_eq!(theirs[0].role, HistoryRole::Bot);
    }

    #[tokio::test]
    async fn expired_entries_are_hidden_and_pruned() {
        let store = setup(Duration::from_secs(60), 100);
        let now = Utc::now();
        store
            .append(
                "u1",
                HistoryRole::User,
                Modality::Attachment,
                "[image] x",
                now - TimeDelta::seconds(120),
            )
            .await
            .unwrap();
        store
            .append("u1", HistoryRole::User, Modality::Mixed, "hi [image] y", now)
            .await
            .unwrap();

        let entries = store
            .query_recent("u1", 10, Duration::from_secs(3600))
            .await
            .unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].modality, Modality::Mixed);

        assert_eq!(store.prune().await.unwrap(), 1);
    }
}

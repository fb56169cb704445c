//! `SQLite`-backed event ledger

use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;

use super::{DbPool, format_datetime, parse_datetime, run_blocking};
use crate::events::{ChannelEvent, EventKind, EventPayload};
use crate::history::cutoff;
use crate::ledger::{Appended, EventLedger};
use crate::{Error, Result};

/// Event ledger stored in the `channel_events` table
#[derive(Clone)]
pub struct SqliteLedger {
    pool: DbPool,
}

impl SqliteLedger {
    /// Create a new ledger over a pool
    #[must_use]
    #[allow(clippy::missing_const_for_fn)]
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }

    fn unavailable(e: impl std::fmt::Display) -> Error {
        Error::LedgerUnavailable(e.to_string())
    }

    fn append_sync(&self, event: &ChannelEvent) -> Result<Appended> {
        let conn = self.pool.get().map_err(Self::unavailable)?;
        let payload = serde_json::to_string(&event.payload)?;

        let inserted = conn
            .execute(
                "INSERT OR IGNORE INTO channel_events
                 (event_id, user_id, kind, payload, received_at, source_message_id,
                  part_index, appended_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
                rusqlite::params![
                    event.fingerprint(),
                    event.user_id,
                    event.kind.as_str(),
                    payload,
                    format_datetime(event.received_at),
                    event.source_message_id,
                    event.part_index,
                    format_datetime(Utc::now()),
                ],
            )
            .map_err(Self::unavailable)?;

        Ok(if inserted == 0 {
            Appended::Duplicate
        } else {
            Appended::New
        })
    }

    fn mark_consumed_sync(&self, event_ids: &[String]) -> Result<usize> {
        let mut conn = self.pool.get().map_err(Self::unavailable)?;
        let tx = conn.transaction().map_err(Self::unavailable)?;
        let now = format_datetime(Utc::now());

        let mut updated = 0;
        {
            let mut stmt = tx
                .prepare(
                    "UPDATE channel_events SET consumed_at = ?1
                     WHERE event_id = ?2 AND consumed_at IS NULL",
                )
                .map_err(Self::unavailable)?;
            for id in event_ids {
                updated += stmt
                    .execute([now.as_str(), id.as_str()])
                    .map_err(Self::unavailable)?;
            }
        }
        tx.commit().map_err(Self::unavailable)?;

        Ok(updated)
    }

    fn unconsumed_sync(&self, max_age: Duration) -> Result<Vec<ChannelEvent>> {
        let conn = self.pool.get().map_err(Self::unavailable)?;
        let since = format_datetime(cutoff(Utc::now(), max_age));

        let mut stmt = conn
            .prepare(
                "SELECT event_id, user_id, kind, payload, received_at, source_message_id,
                        part_index
                 FROM channel_events
                 WHERE consumed_at IS NULL AND received_at >= ?1
                 ORDER BY received_at, seq",
            )
            .map_err(Self::unavailable)?;

        let rows = stmt
            .query_map([since], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, String>(3)?,
                    row.get::<_, String>(4)?,
                    row.get::<_, String>(5)?,
                    row.get::<_, u32>(6)?,
                ))
            })
            .map_err(Self::unavailable)?;

        let mut events = Vec::new();
        for row in rows {
            let (event_id, user_id, kind, payload, received_at, source_message_id, part_index) =
                row.map_err(Self::unavailable)?;

            match decode_event(&user_id, &kind, &payload, &received_at, source_message_id) {
                Ok(event) => events.push(event.with_part_index(part_index)),
                Err(e) => tracing::warn!(
                    event_id = %event_id,
                    error = %e,
                    "skipping undecodable ledger row"
                ),
            }
        }

        Ok(events)
    }

    fn prune_consumed_sync(&self, older_than: Duration) -> Result<usize> {
        let conn = self.pool.get().map_err(Self::unavailable)?;
        let before = format_datetime(cutoff(Utc::now(), older_than));

        conn.execute(
            "DELETE FROM channel_events WHERE consumed_at IS NOT NULL AND consumed_at < ?1",
            [before],
        )
        .map_err(Self::unavailable)
    }
}

fn decode_event(
    user_id: &str,
    kind: &str,
    payload: &str,
    received_at: &str,
    source_message_id: String,
) -> Result<ChannelEvent> {
    let kind = EventKind::parse(kind)
        .ok_or_else(|| Error::InvalidEvent(format!("unknown kind {kind}")))?;
    let payload: EventPayload = serde_json::from_str(payload)?;

    ChannelEvent::new(
        user_id,
        kind,
        payload,
        parse_datetime(received_at),
        source_message_id,
    )
}

#[async_trait]
impl EventLedger for SqliteLedger {
    fn name(&self) -> &'static str {
        "sqlite"
    }

    async fn append(&self, event: &ChannelEvent) -> Result<Appended> {
        let ledger = self.clone();
        let event = event.clone();
        run_blocking(move || ledger.append_sync(&event)).await
    }

    async fn mark_consumed(&self, event_ids: &[String]) -> Result<usize> {
        let ledger = self.clone();
        let ids = event_ids.to_vec();
        run_blocking(move || ledger.mark_consumed_sync(&ids)).await
    }

    async fn unconsumed(&self, max_age: Duration) -> Result<Vec<ChannelEvent>> {
        let ledger = self.clone();
        run_blocking(move || ledger.unconsumed_sync(max_age)).await
    }

    async fn prune_consumed(&self, older_than: Duration) -> Result<usize> {
        let ledger = self.clone();
        run_blocking(move || ledger.prune_consumed_sync(older_than)).await
    }
}

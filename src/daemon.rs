//! Daemon - the turn pipeline service
//!
//! Wires storage, reasoner and channel into a dispatcher, replays events
//! left over from the previous run, and serves the HTTP API until
//! interrupted.

use std::sync::Arc;
use std::time::Duration;

use crate::api::ApiServerBuilder;
use crate::channels::{Channel, LogChannel, MessengerChannel};
use crate::db::{self, DbPool, SqliteHistoryStore, SqliteLedger};
use crate::dispatcher::{DispatcherParts, TurnDispatcher};
use crate::history::{HistoryStore, MemoryHistoryStore};
use crate::ledger::LedgerGate;
use crate::reasoner::{HttpReasoner, LogReasoner, Reasoner};
use crate::{Config, Result};

/// How often old ledger rows and expired history are pruned
const PRUNE_INTERVAL: Duration = Duration::from_secs(3600);

/// Time allowed for in-flight turns to finish on shutdown
const SHUTDOWN_GRACE: Duration = Duration::from_secs(15);

/// The turn pipeline daemon
pub struct Daemon {
    config: Config,
    dispatcher: Arc<TurnDispatcher>,
}

impl Daemon {
    /// Create a new daemon instance
    ///
    /// Storage problems are not fatal: without a database the daemon keeps
    /// aggregating in memory.
    ///
    /// # Errors
    ///
    /// Returns error if the reasoner or wait policy configuration is invalid
    pub fn new(config: Config) -> Result<Self> {
        let (ledger, history) = open_storage(&config);
        let reasoner = build_reasoner(&config)?;
        let channel = build_channel(&config);

        tracing::info!(
            reasoner = reasoner.name(),
            channel = channel.name(),
            "pipeline components selected"
        );

        let dispatcher = TurnDispatcher::new(
            &config,
            DispatcherParts {
                ledger,
                history,
                reasoner,
                channel,
            },
        )?;

        Ok(Self {
            config,
            dispatcher: Arc::new(dispatcher),
        })
    }

    #[must_use]
    pub const fn dispatcher(&self) -> &Arc<TurnDispatcher> {
        &self.dispatcher
    }

    /// Run the daemon until interrupted
    ///
    /// # Errors
    ///
    /// Returns error if the API server fails to bind or run
    pub async fn run(self) -> Result<()> {
        tracing::info!(
            port = self.config.api_server.port,
            ledger = self.dispatcher.ledger_backend(),
            mode = self.dispatcher.ledger_mode().as_str(),
            "daemon running"
        );

        self.dispatcher.replay().await;

        let pruner = {
            let dispatcher = self.dispatcher.clone();
            let retention = self.config.ledger.prune_after;
            tokio::spawn(async move {
                let mut interval = tokio::time::interval(PRUNE_INTERVAL);
                // Skip the first immediate tick
                interval.tick().await;

                loop {
                    interval.tick().await;
                    dispatcher.prune(retention).await;
                }
            })
        };

        let messenger = &self.config.messenger;
        let server = ApiServerBuilder::new(self.dispatcher.clone(), self.config.api_server.port)
            .verify_token(messenger.verify_token.clone())
            .app_secret(messenger.app_secret.clone())
            .build();

        let result = server
            .run(async {
                if tokio::signal::ctrl_c().await.is_ok() {
                    tracing::info!("shutdown requested");
                }
            })
            .await;

        pruner.abort();
        self.dispatcher.shutdown(SHUTDOWN_GRACE).await;
        tracing::info!(stats = ?self.dispatcher.stats(), "daemon stopped");

        result
    }
}

/// Open the ledger database configured in `config`
///
/// # Errors
///
/// Returns error if the ledger is disabled or the database cannot be opened
pub fn open_database(config: &Config) -> Result<DbPool> {
    if !config.ledger.enabled {
        return Err(crate::Error::Config("event ledger is disabled".to_string()));
    }

    let pool = db::init(&config.ledger.database_path)?;
    tracing::info!(path = %config.ledger.database_path.display(), "database initialized");
    Ok(pool)
}

fn open_storage(config: &Config) -> (LedgerGate, Arc<dyn HistoryStore>) {
    let memory_history = || -> Arc<dyn HistoryStore> {
        Arc::new(MemoryHistoryStore::new(
            config.history.ttl,
            config.history.max_entries_per_user,
        ))
    };

    if !config.ledger.enabled {
        tracing::info!("event ledger disabled by configuration");
        return (LedgerGate::in_memory(), memory_history());
    }

    match open_database(config) {
        Ok(pool) => {
            let ledger = LedgerGate::durable(Arc::new(SqliteLedger::new(pool.clone())));
            let history = Arc::new(SqliteHistoryStore::new(
                pool,
                config.history.ttl,
                config.history.max_entries_per_user,
            ));
            (ledger, history)
        }
        Err(e) => {
            tracing::warn!(
                path = %config.ledger.database_path.display(),
                error = %e,
                "failed to open database, continuing without durability"
            );
            (LedgerGate::in_memory(), memory_history())
        }
    }
}

fn build_reasoner(config: &Config) -> Result<Arc<dyn Reasoner>> {
    match &config.reasoner.url {
        Some(url) => {
            tracing::info!(
                url = %url,
                timeout = ?config.reasoner.timeout,
                "HTTP reasoner configured"
            );
            Ok(Arc::new(HttpReasoner::new(url.clone())?))
        }
        None => {
            tracing::warn!("REASONER_URL not set, resolved turns will only be logged");
            Ok(Arc::new(LogReasoner))
        }
    }
}

fn build_channel(config: &Config) -> Arc<dyn Channel> {
    match &config.messenger.page_access_token {
        Some(token) => Arc::new(MessengerChannel::new(
            token.clone(),
            config.messenger.api_version.clone(),
        )),
        None => {
            tracing::warn!("FB_PAGE_ACCESS_TOKEN not set, replies will only be logged");
            Arc::new(LogChannel)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::file::TurnsConfigFile;
    use crate::ledger::LedgerMode;

    fn config(vars: &[(&str, String)]) -> Config {
        let vars = vars.to_vec();
        Config::from_sources(TurnsConfigFile::default(), move |key| {
            vars.iter().find(|(k, _)| *k == key).map(|(_, v)| v.clone())
        })
        .unwrap()
    }

    #[tokio::test]
    async fn durable_when_database_opens() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("turns.db").display().to_string();
        let daemon = Daemon::new(config(&[("BEACON_TURNS_DB_PATH", path)])).unwrap();

        assert_eq!(daemon.dispatcher().ledger_mode(), LedgerMode::Durable);
        assert_eq!(daemon.dispatcher().ledger_backend(), "sqlite");
    }

    #[tokio::test]
    async fn degraded_when_ledger_disabled() {
        let daemon = Daemon::new(config(&[("BEACON_TURNS_LEDGER", "false".to_string())])).unwrap();
        assert_eq!(daemon.dispatcher().ledger_mode(), LedgerMode::Degraded);
        assert_eq!(daemon.dispatcher().ledger_backend(), "memory");
    }

    #[tokio::test]
    async fn degraded_when_database_cannot_open() {
        let file = tempfile::NamedTempFile::new().unwrap();
        // A path below a regular file cannot be created
        let path = file.path().join("nested/turns.db").display().to_string();
        let daemon = Daemon::new(config(&[("BEACON_TURNS_DB_PATH", path)])).unwrap();
        assert_eq!(daemon.dispatcher().ledger_mode(), LedgerMode::Degraded);
    }

    #[test]
    fn empty_reasoner_url_is_a_config_error() {
        let result = build_reasoner(&config(&[("REASONER_URL", " ".to_string())]));
        assert!(result.is_err());
    }
}

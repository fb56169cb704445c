use std::process::ExitCode;
use std::time::Duration;

use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use beacon_turns::db::{SqliteHistoryStore, SqliteLedger};
use beacon_turns::history::HistoryStore;
use beacon_turns::ledger::EventLedger;
use beacon_turns::{Config, Daemon, daemon};

/// Beacon Turns - turn aggregation for messaging-channel AI assistants
#[derive(Parser)]
#[command(name = "beacon-turns", version, about)]
struct Cli {
    /// Port to listen on (overrides config)
    #[arg(long, env = "BEACON_TURNS_PORT")]
    port: Option<u16>,

    /// Increase verbosity (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Run the webhook server and turn pipeline (default)
    Serve,
    /// Print unconsumed ledger events as JSON lines
    Replay {
        /// Only events received within this many seconds
        #[arg(long)]
        max_age: Option<u64>,
    },
    /// Drop old consumed ledger events and expired history
    Prune,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    // Set up logging based on verbosity
    let filter = match cli.verbose {
        0 => "info,beacon_turns=info",
        1 => "info,beacon_turns=debug",
        2 => "debug",
        _ => "trace",
    };

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter)),
        )
        .init();

    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!("fatal: {e:#}");
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    let mut config = Config::load()?;
    if let Some(port) = cli.port {
        config.api_server.port = port;
    }
    tracing::debug!(?config, "loaded configuration");

    match cli.command.unwrap_or(Command::Serve) {
        Command::Serve => {
            tracing::info!(port = config.api_server.port, "starting beacon turns");
            Daemon::new(config)?.run().await?;
        }
        Command::Replay { max_age } => {
            let max_age = max_age.map_or(config.ledger.replay_max_age, Duration::from_secs);
            let ledger = SqliteLedger::new(daemon::open_database(&config)?);

            for event in ledger.unconsumed(max_age).await? {
                println!("{}", serde_json::to_string(&event)?);
            }
        }
        Command::Prune => {
            let pool = daemon::open_database(&config)?;
            let ledger_rows = SqliteLedger::new(pool.clone())
                .prune_consumed(config.ledger.prune_after)
                .await?;
            let history_rows = SqliteHistoryStore::new(
                pool,
                config.history.ttl,
                config.history.max_entries_per_user,
            )
            .prune()
            .await?;

            println!("pruned {ledger_rows} ledger events, {history_rows} history entries");
        }
    }

    Ok(())
}

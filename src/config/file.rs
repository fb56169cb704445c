//! TOML configuration file loading
//!
//! Supports `~/.config/omni/beacon-turns/config.toml` as a persistent config
//! source. All fields are optional; the file is a partial overlay on top of
//! defaults.

use std::path::{Path, PathBuf};

use serde::Deserialize;

/// Top-level TOML configuration file schema
#[derive(Debug, Default, Deserialize)]
pub struct TurnsConfigFile {
    /// HTTP server configuration
    #[serde(default)]
    pub server: ServerFileConfig,

    /// Turn aggregation windows
    #[serde(default)]
    pub turns: TurnsFileConfig,

    /// Context linking
    #[serde(default)]
    pub linker: LinkerFileConfig,

    /// Recent-history retention
    #[serde(default)]
    pub history: HistoryFileConfig,

    /// Downstream reasoner
    #[serde(default)]
    pub reasoner: ReasonerFileConfig,

    /// Event ledger
    #[serde(default)]
    pub ledger: LedgerFileConfig,

    /// Messenger channel
    #[serde(default)]
    pub messenger: MessengerFileConfig,
}

/// Server/runtime configuration
#[derive(Debug, Default, Deserialize)]
pub struct ServerFileConfig {
    /// API server port
    pub port: Option<u16>,
}

/// Wait policy configuration, all durations in seconds
#[derive(Debug, Default, Deserialize)]
pub struct TurnsFileConfig {
    pub short_wait_seconds: Option<f64>,
    pub attachment_first_wait_seconds: Option<f64>,
    pub reference_keyword_wait_seconds: Option<f64>,
    pub combo_wait_seconds: Option<f64>,
    pub hard_ceiling_seconds: Option<f64>,
    pub short_question_max_words: Option<usize>,
    pub smart_delay_enabled: Option<bool>,

    /// Phrases that refer to an attachment (replaces the defaults)
    pub reference_phrases: Option<Vec<String>>,
}

/// Context linker configuration
#[derive(Debug, Default, Deserialize)]
pub struct LinkerFileConfig {
    pub link_window_seconds: Option<u64>,
    pub max_linked_entries: Option<usize>,
}

/// Recent-history configuration
#[derive(Debug, Default, Deserialize)]
pub struct HistoryFileConfig {
    pub ttl_seconds: Option<u64>,
    pub max_entries_per_user: Option<usize>,
}

/// Reasoner configuration
#[derive(Debug, Default, Deserialize)]
pub struct ReasonerFileConfig {
    /// Endpoint receiving resolved turns
    pub url: Option<String>,
    pub timeout_seconds: Option<f64>,

    /// Reply sent when the reasoner fails
    pub fallback_reply: Option<String>,
}

/// Event ledger configuration
#[derive(Debug, Default, Deserialize)]
pub struct LedgerFileConfig {
    /// Disable to run with in-memory aggregation only
    pub enabled: Option<bool>,
    pub database_path: Option<String>,
    pub replay_max_age_seconds: Option<u64>,
    pub prune_after_seconds: Option<u64>,
}

/// Messenger configuration
#[derive(Debug, Default, Deserialize)]
pub struct MessengerFileConfig {
    pub api_version: Option<String>,
    pub verify_token: Option<String>,
    pub page_access_token: Option<String>,
    pub app_secret: Option<String>,
}

/// Parse config file contents
///
/// # Errors
///
/// Returns error if the content is not valid TOML for this schema
pub fn parse_config_file(content: &str) -> crate::Result<TurnsConfigFile> {
    Ok(toml::from_str(content)?)
}

/// Load the TOML config file from the standard path
///
/// Returns `TurnsConfigFile::default()` if the file doesn't exist or can't be parsed.
pub fn load_config_file() -> TurnsConfigFile {
    config_file_path().map_or_else(TurnsConfigFile::default, |path| load_config_file_at(&path))
}

/// Load a TOML config file from an explicit path
pub fn load_config_file_at(path: &Path) -> TurnsConfigFile {
    if !path.exists() {
        return TurnsConfigFile::default();
    }

    match std::fs::read_to_string(path) {
        Ok(content) => match parse_config_file(&content) {
            Ok(config) => {
                tracing::info!(path = %path.display(), "loaded config file");
                config
            }
            Err(e) => {
                tracing::warn!(
                    path = %path.display(),
                    error = %e,
                    "failed to parse config file, using defaults"
                );
                TurnsConfigFile::default()
            }
        },
        Err(e) => {
            tracing::warn!(
                path = %path.display(),
                error = %e,
                "failed to read config file"
            );
            TurnsConfigFile::default()
        }
    }
}

/// Return the config file path: `~/.config/omni/beacon-turns/config.toml`
pub fn config_file_path() -> Option<PathBuf> {
    directories::BaseDirs::new().map(|d| {
        d.config_dir()
            .join("omni")
            .join("beacon-turns")
            .join("config.toml")
    })
}

//! Configuration management for the turn pipeline

pub mod file;

use std::path::PathBuf;
use std::time::Duration;

use secrecy::SecretString;

use crate::{Error, Result};

/// Phrases (Vietnamese and English) that point at an image, file or dish the
/// user is about to send or has just sent
pub const DEFAULT_REFERENCE_PHRASES: &[&str] = &[
    "mô tả ảnh",
    "xem ảnh",
    "ảnh này",
    "hình này",
    "hình ảnh này",
    "phân tích ảnh",
    "ảnh trên",
    "hình trên",
    "xem hình",
    "ảnh gì",
    "hình gì",
    "trong ảnh",
    "trong hình",
    "ảnh đó",
    "hình đó",
    "file này",
    "tài liệu",
    "đọc file",
    "phân tích file",
    "nội dung file",
    "xem file",
    "file đính kèm",
    "tệp tin này",
    "món này",
    "combo này",
    "cái này",
    "describe image",
    "analyze image",
    "this image",
    "this picture",
    "this photo",
];

/// Apology sent when the reasoner fails or times out
pub const DEFAULT_FALLBACK_REPLY: &str =
    "Xin lỗi, hệ thống gặp sự cố tạm thời. Bạn vui lòng thử lại sau nhé.";

/// Top-level configuration
#[derive(Debug)]
pub struct Config {
    /// Path to data directory (database)
    pub data_dir: PathBuf,

    /// HTTP API server configuration
    pub api_server: ApiServerConfig,

    /// Wait policy
    pub turns: TurnConfig,

    /// Context linker
    pub linker: LinkerConfig,

    /// Recent-history retention
    pub history: HistoryConfig,

    /// Downstream reasoner
    pub reasoner: ReasonerConfig,

    /// Event ledger
    pub ledger: LedgerConfig,

    /// Messenger channel
    pub messenger: MessengerConfig,
}

/// HTTP API server configuration
#[derive(Debug, Clone)]
pub struct ApiServerConfig {
    /// Port to listen on
    pub port: u16,
}

/// Wait policy tunables
#[derive(Debug, Clone, PartialEq)]
pub struct TurnConfig {
    /// Plain text with no attachment involvement
    pub short_wait: Duration,

    /// Attachment arrived without text
    pub attachment_first_wait: Duration,

    /// Text refers to an attachment that has not arrived yet
    pub reference_keyword_wait: Duration,

    /// Text and attachment both present
    pub combo_wait: Duration,

    /// Upper bound on a turn's lifetime, measured from when it opened
    pub hard_ceiling: Duration,

    /// A question mark in a message this short counts as a reference
    pub short_question_max_words: usize,

    /// When false every turn waits `short_wait`
    pub smart_delay_enabled: bool,

    pub reference_phrases: Vec<String>,
}

impl Default for TurnConfig {
    fn default() -> Self {
        Self {
            short_wait: Duration::from_millis(500),
            attachment_first_wait: Duration::from_millis(200),
            reference_keyword_wait: Duration::from_secs(8),
            combo_wait: Duration::from_secs(10),
            hard_ceiling: Duration::from_secs(12),
            short_question_max_words: 5,
            smart_delay_enabled: true,
            reference_phrases: DEFAULT_REFERENCE_PHRASES
                .iter()
                .map(|p| (*p).to_string())
                .collect(),
        }
    }
}

impl TurnConfig {
    /// Check that waits are positive and fit under the hard ceiling
    ///
    /// # Errors
    ///
    /// Returns error describing the first offending value
    pub fn validate(&self) -> Result<()> {
        let waits = [
            ("short_wait", self.short_wait),
            ("attachment_first_wait", self.attachment_first_wait),
            ("reference_keyword_wait", self.reference_keyword_wait),
            ("combo_wait", self.combo_wait),
            ("hard_ceiling", self.hard_ceiling),
        ];

        for (name, wait) in waits {
            if wait.is_zero() {
                return Err(Error::Config(format!("{name} must be positive")));
            }
            if wait > self.hard_ceiling {
                return Err(Error::Config(format!(
                    "{name} ({wait:?}) exceeds hard_ceiling ({:?})",
                    self.hard_ceiling
                )));
            }
        }

        Ok(())
    }
}

/// Context linker tunables
#[derive(Debug, Clone)]
pub struct LinkerConfig {
    /// Only history newer than this is considered
    pub link_window: Duration,

    /// Top-N entries attached as linked context
    pub max_linked_entries: usize,
}

impl Default for LinkerConfig {
    fn default() -> Self {
        Self {
            link_window: Duration::from_secs(300),
            max_linked_entries: 3,
        }
    }
}

/// Recent-history retention
#[derive(Debug, Clone)]
pub struct HistoryConfig {
    pub ttl: Duration,
    pub max_entries_per_user: usize,
}

impl Default for HistoryConfig {
    fn default() -> Self {
        Self {
            ttl: Duration::from_secs(86_400),
            max_entries_per_user: 100,
        }
    }
}

/// Reasoner configuration
#[derive(Debug, Clone)]
pub struct ReasonerConfig {
    /// Endpoint receiving resolved turns (`REASONER_URL`)
    pub url: Option<String>,

    /// Calls slower than this are treated as failures
    pub timeout: Duration,

    pub fallback_reply: String,
}

impl Default for ReasonerConfig {
    fn default() -> Self {
        Self {
            url: None,
            timeout: Duration::from_secs(30),
            fallback_reply: DEFAULT_FALLBACK_REPLY.to_string(),
        }
    }
}

/// Event ledger configuration
#[derive(Debug, Clone)]
pub struct LedgerConfig {
    /// Disabled means in-memory aggregation only
    pub enabled: bool,

    pub database_path: PathBuf,

    /// Unconsumed events older than this are not replayed at startup
    pub replay_max_age: Duration,

    /// Consumed events older than this are pruned
    pub prune_after: Duration,
}

/// Messenger channel configuration
#[derive(Debug)]
pub struct MessengerConfig {
    /// Graph API version (e.g. "v18.0")
    pub api_version: String,

    /// Token echoed back during webhook subscription
    pub verify_token: Option<SecretString>,

    /// Page token used for the Send API
    pub page_access_token: Option<SecretString>,

    /// App secret for `X-Hub-Signature-256` verification
    pub app_secret: Option<SecretString>,
}

impl Default for MessengerConfig {
    fn default() -> Self {
        Self {
            api_version: "v18.0".to_string(),
            verify_token: None,
            page_access_token: None,
            app_secret: None,
        }
    }
}

/// Default data directory: `~/.local/share/omni/beacon-turns`
fn default_data_dir() -> PathBuf {
    directories::BaseDirs::new().map_or_else(
        || PathBuf::from("."),
        |d| d.data_dir().join("omni").join("beacon-turns"),
    )
}

/// Parse a seconds value, rejecting negatives and NaN
fn seconds(name: &str, value: f64) -> Result<Duration> {
    Duration::try_from_secs_f64(value)
        .map_err(|e| Error::Config(format!("{name} = {value}: {e}")))
}

fn parse_bool(value: &str) -> bool {
    value == "1" || value.eq_ignore_ascii_case("true")
}

impl Config {
    /// Load configuration (env > toml > default)
    ///
    /// # Errors
    ///
    /// Returns error if a value is malformed or fails validation
    pub fn load() -> Result<Self> {
        let fc = file::load_config_file();
        Self::from_sources(fc, |key| std::env::var(key).ok())
    }

    /// Build configuration from a parsed file and an environment lookup
    ///
    /// # Errors
    ///
    /// Returns error if a value is malformed or fails validation
    pub fn from_sources(
        fc: file::TurnsConfigFile,
        env: impl Fn(&str) -> Option<String>,
    ) -> Result<Self> {
        let env_f64 = |key: &str| env(key).and_then(|s| s.parse::<f64>().ok());
        let env_u64 = |key: &str| env(key).and_then(|s| s.parse::<u64>().ok());
        let env_usize = |key: &str| env(key).and_then(|s| s.parse::<usize>().ok());

        let api_server = ApiServerConfig {
            port: env("BEACON_TURNS_PORT")
                .or_else(|| env("PORT"))
                .and_then(|s| s.parse().ok())
                .or(fc.server.port)
                .unwrap_or(18_791),
        };

        let defaults = TurnConfig::default();
        let t = fc.turns;
        let wait = |key: &str, file: Option<f64>, default: Duration| -> Result<Duration> {
            env_f64(key)
                .or(file)
                .map_or(Ok(default), |v| seconds(key, v))
        };
        let turns = TurnConfig {
            short_wait: wait(
                "BEACON_TURNS_SHORT_WAIT_SECONDS",
                t.short_wait_seconds,
                defaults.short_wait,
            )?,
            attachment_first_wait: wait(
                "BEACON_TURNS_ATTACHMENT_FIRST_WAIT_SECONDS",
                t.attachment_first_wait_seconds,
                defaults.attachment_first_wait,
            )?,
            reference_keyword_wait: wait(
                "BEACON_TURNS_REFERENCE_KEYWORD_WAIT_SECONDS",
                t.reference_keyword_wait_seconds,
                defaults.reference_keyword_wait,
            )?,
            combo_wait: wait(
                "BEACON_TURNS_COMBO_WAIT_SECONDS",
                t.combo_wait_seconds,
                defaults.combo_wait,
            )?,
            hard_ceiling: wait(
                "BEACON_TURNS_HARD_CEILING_SECONDS",
                t.hard_ceiling_seconds,
                defaults.hard_ceiling,
            )?,
            short_question_max_words: env_usize("BEACON_TURNS_SHORT_QUESTION_MAX_WORDS")
                .or(t.short_question_max_words)
                .unwrap_or(defaults.short_question_max_words),
            smart_delay_enabled: env("BEACON_TURNS_SMART_DELAY")
                .map(|v| parse_bool(&v))
                .or(t.smart_delay_enabled)
                .unwrap_or(defaults.smart_delay_enabled),
            reference_phrases: t.reference_phrases.unwrap_or(defaults.reference_phrases),
        };
        let linker_defaults = LinkerConfig::default();
        let linker = LinkerConfig {
            link_window: env_u64("BEACON_TURNS_LINK_WINDOW_SECONDS")
                .or(fc.linker.link_window_seconds)
                .map_or(linker_defaults.link_window, Duration::from_secs),
            max_linked_entries: fc
                .linker
                .max_linked_entries
                .unwrap_or(linker_defaults.max_linked_entries),
        };

        let history_defaults = HistoryConfig::default();
        let history = HistoryConfig {
            ttl: env_u64("BEACON_TURNS_HISTORY_TTL_SECONDS")
                .or(fc.history.ttl_seconds)
                .map_or(history_defaults.ttl, Duration::from_secs),
            max_entries_per_user: env_usize("BEACON_TURNS_HISTORY_MAX_ENTRIES")
                .or(fc.history.max_entries_per_user)
                .unwrap_or(history_defaults.max_entries_per_user),
        };

        let reasoner_defaults = ReasonerConfig::default();
        let reasoner_timeout = env_f64("BEACON_TURNS_REASONER_TIMEOUT_SECONDS")
            .or(fc.reasoner.timeout_seconds)
            .map_or(Ok(reasoner_defaults.timeout), |v| {
                seconds("reasoner_timeout_seconds", v)
            })?;
        let reasoner = ReasonerConfig {
            url: env("REASONER_URL").or(fc.reasoner.url),
            timeout: reasoner_timeout,
            fallback_reply: fc
                .reasoner
                .fallback_reply
                .unwrap_or(reasoner_defaults.fallback_reply),
        };

        let data_dir = env("BEACON_TURNS_DATA_DIR").map_or_else(default_data_dir, PathBuf::from);
        let ledger = LedgerConfig {
            enabled: env("BEACON_TURNS_LEDGER")
                .map(|v| parse_bool(&v))
                .or(fc.ledger.enabled)
                .unwrap_or(true),
            database_path: env("BEACON_TURNS_DB_PATH")
                .or(fc.ledger.database_path)
                .map_or_else(|| data_dir.join("beacon-turns.db"), PathBuf::from),
            replay_max_age: Duration::from_secs(
                env_u64("BEACON_TURNS_REPLAY_MAX_AGE_SECONDS")
                    .or(fc.ledger.replay_max_age_seconds)
                    .unwrap_or(600),
            ),
            prune_after: Duration::from_secs(fc.ledger.prune_after_seconds.unwrap_or(86_400)),
        };

        let messenger_defaults = MessengerConfig::default();
        let messenger = MessengerConfig {
            api_version: env("FB_API_VERSION")
                .or(fc.messenger.api_version)
                .unwrap_or(messenger_defaults.api_version),
            verify_token: env("FB_VERIFY_TOKEN")
                .or(fc.messenger.verify_token)
                .map(SecretString::from),
            page_access_token: env("FB_PAGE_ACCESS_TOKEN")
                .or(fc.messenger.page_access_token)
                .map(SecretString::from),
            app_secret: env("FB_APP_SECRET")
                .or(fc.messenger.app_secret)
                .map(SecretString::from),
        };

        if messenger.app_secret.is_none() {
            tracing::warn!("FB_APP_SECRET not set, webhook signatures will not be verified");
        }

        let config = Self {
            data_dir,
            api_server,
            turns,
            linker,
            history,
            reasoner,
            ledger,
            messenger,
        };
        config.validate()?;
        Ok(config)
    }

    /// Check cross-field constraints
    ///
    /// # Errors
    ///
    /// Returns error if a wait is not positive, exceeds the hard ceiling, or
    /// the reasoner timeout is zero
    pub fn validate(&self) -> Result<()> {
        self.turns.validate()?;
        if self.reasoner.timeout.is_zero() {
            return Err(Error::Config(
                "reasoner_timeout_seconds must be positive".to_string(),
            ));
        }
        Ok(())
    }
}

use config::{Config, ConfigError, Environment, File};
use serde::Deserialize;

#[derive(Debug, Deserialize, Clone)]
pub struct AppConfig {
    pub imap: ImapConfig,
    pub sender: Option<String>,
    pub log_file: Option<String>,
    pub log_level: Option<String>,
    #[serde(default)]
    pub quiet: bool,
}

/// Connection settings handed to the transport as-is. Nothing here is
/// validated locally.
#[derive(Debug, Deserialize, Clone)]
pub struct ImapConfig {
    pub host: String,
    pub port: u16,
    pub username: String,
    pub password: String,
    #[serde(default = "default_true")]
    pub use_tls: bool,
    #[serde(default)]
    pub accept_invalid_certs: bool,
    #[serde(default = "default_mailbox")]
    pub mailbox: String,
    /// Open the mailbox with EXAMINE instead of SELECT
    #[serde(default = "default_true")]
    pub read_only: bool,
    #[serde(default)]
    pub recency: RecencyStrategy,
}

/// How the "most recent" message is picked among the search results.
#[derive(Debug, Deserialize, Clone, Copy, Default, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum RecencyStrategy {
    /// Highest identifier returned by the search
    #[default]
    LastSearchResult,
    /// Latest server-side INTERNALDATE, falling back to the highest identifier
    InternalDate,
}

pub const DEFAULT_MAILBOX: &str = "INBOX";

fn default_true() -> bool {
    true
}

fn default_mailbox() -> String {
    DEFAULT_MAILBOX.to_string()
}

// Implement loading configuration
impl AppConfig {
    // Load config from defaults, then file (if exists), then environment variables
    pub fn new() -> Result<Self, ConfigError> {
        Self::configure_defaults()?
            // Merge in config file if present
            .add_source(File::with_name("config").required(false))
            // e.g. APP_SENDER=... APP_IMAP__HOST=...
            .add_source(Environment::with_prefix("APP").separator("__"))
            .build()?
            .try_deserialize()
    }

    // Load config from a specific file path
    pub fn new_from_file(path: &str) -> Result<Self, ConfigError> {
        Self::configure_defaults()?
            .add_source(File::with_name(path).required(true))
            .add_source(Environment::with_prefix("APP").separator("__"))
            .build()?
            .try_deserialize()
    }

    fn configure_defaults()
    -> Result<config::ConfigBuilder<config::builder::DefaultState>, ConfigError> {
        Ok(Config::builder())
    }
}

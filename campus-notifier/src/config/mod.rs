//! Service configuration.
//!
//! Defaults, then an optional JSON file named by `NOTIFIER_CONFIG`, then
//! environment overrides (`.env` is loaded first via `dotenvy`).

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::notification::channels::TransportConfig;
use crate::notification::delivery::DeliveryConfig;
use crate::notification::ledger::LedgerConfig;
use crate::notification::scanner::ScannerConfig;
use crate::notification::watcher::WatcherConfig;
use crate::{Error, Result};

/// Environment variable naming the optional JSON config file.
pub const CONFIG_PATH_ENV: &str = "NOTIFIER_CONFIG";

/// Top-level configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NotifierConfig {
    pub database_url: String,
    pub max_db_connections: u32,
    pub log_dir: PathBuf,
    /// Initial log filter; `RUST_LOG` takes precedence.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub log_filter: Option<String>,
    /// How long in-flight work may run after shutdown is requested.
    pub shutdown_grace_secs: u64,
    pub scanner: ScannerConfig,
    pub delivery: DeliveryConfig,
    pub ledger: LedgerConfig,
    pub watcher: WatcherConfig,
    pub transport: TransportConfig,
}

impl Default for NotifierConfig {
    fn default() -> Self {
        Self {
            database_url: "sqlite:student_bot.db?mode=rwc".to_string(),
            max_db_connections: 5,
            log_dir: PathBuf::from("logs"),
            log_filter: None,
            shutdown_grace_secs: 10,
            scanner: ScannerConfig::default(),
            delivery: DeliveryConfig::default(),
            ledger: LedgerConfig::default(),
            watcher: WatcherConfig::default(),
            transport: TransportConfig::default(),
        }
    }
}

impl NotifierConfig {
    /// Load from `.env`, the optional config file and the process environment.
    pub fn load() -> Result<Self> {
        dotenvy::dotenv().ok();

        let mut config = match std::env::var(CONFIG_PATH_ENV) {
            Ok(path) => Self::from_file(Path::new(&path))?,
            Err(_) => Self::default(),
        };
        config.apply_env_overrides(|key| std::env::var(key).ok())?;
        config.validate()?;
        Ok(config)
    }

    /// Parse a JSON config file. Missing fields take their defaults.
    pub fn from_file(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .map_err(|e| Error::io_path("reading config file", path, e))?;
        let config = serde_json::from_str(&raw)?;
        debug!(path = %path.display(), "Loaded config file");
        Ok(config)
    }

    /// Apply overrides from an environment lookup.
    ///
    /// Recognized keys: `DATABASE_URL`, `BOT_TOKEN`, `LOG_DIR`, `LOG_FILTER`,
    /// `WATCH_FILES` (comma separated), `POLL_INTERVAL_SECS` and
    /// `NOTIFIER_TRANSPORT` (`telegram` or `log`).
    pub fn apply_env_overrides<F>(&mut self, var: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(url) = var("DATABASE_URL") {
            self.database_url = url;
        }
        if let Some(dir) = var("LOG_DIR") {
            self.log_dir = PathBuf::from(dir);
        }
        if let Some(filter) = var("LOG_FILTER") {
            self.log_filter = Some(filter);
        }
        if let Some(files) = var("WATCH_FILES") {
            self.watcher.paths = files
                .split(',')
                .map(str::trim)
                .filter(|p| !p.is_empty())
                .map(PathBuf::from)
                .collect();
        }
        if let Some(secs) = var("POLL_INTERVAL_SECS") {
            self.scanner.poll_interval_secs = secs
                .trim()
                .parse()
                .map_err(|e| Error::config(format!("POLL_INTERVAL_SECS: {e}")))?;
        }
        if let Some(kind) = var("NOTIFIER_TRANSPORT") {
            match kind.trim().to_ascii_lowercase().as_str() {
                "log" => self.transport = TransportConfig::Log,
                "telegram" => {
                    if !matches!(self.transport, TransportConfig::Telegram(_)) {
                        self.transport = TransportConfig::default();
                    }
                }
                other => {
                    return Err(Error::config(format!("Unknown transport '{other}'")));
                }
            }
        }
        if let Some(token) = var("BOT_TOKEN")
            && let TransportConfig::Telegram(telegram) = &mut self.transport
        {
            telegram.bot_token = token;
        }
        Ok(())
    }

    /// Reject configurations the service cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.database_url.trim().is_empty() {
            return Err(Error::config("database_url must not be empty"));
        }
        if self.max_db_connections == 0 {
            return Err(Error::config("max_db_connections must be at least 1"));
        }
        if self.scanner.poll_interval_secs == 0 {
            return Err(Error::config("scanner.poll_interval_secs must be positive"));
        }
        if self.scanner.error_backoff_secs == 0 {
            return Err(Error::config("scanner.error_backoff_secs must be positive"));
        }
        if self.delivery.max_concurrent_sends == 0 {
            return Err(Error::config("delivery.max_concurrent_sends must be at least 1"));
        }
        if self.delivery.batch_size == 0 {
            return Err(Error::config("delivery.batch_size must be at least 1"));
        }
        if self.delivery.max_attempts == 0 {
            return Err(Error::config("delivery.max_attempts must be at least 1"));
        }
        if self.ledger.prune_interval_secs == 0 {
            return Err(Error::config("ledger.prune_interval_secs must be positive"));
        }
        if !self.watcher.paths.is_empty() && self.watcher.check_interval_secs == 0 {
            return Err(Error::config("watcher.check_interval_secs must be positive"));
        }
        if let TransportConfig::Telegram(telegram) = &self.transport
            && telegram.bot_token.trim().is_empty()
        {
            return Err(Error::config(
                "Telegram transport requires a bot token (set BOT_TOKEN)",
            ));
        }
        Ok(())
    }
}

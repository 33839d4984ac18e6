//! Ledger configuration.

use std::time::Duration;

use balanced_common::constants::{default_lock_timeout, max_lock_timeout};
use balanced_common::{LedgerError, Result};

/// Main ledger configuration.
#[derive(Debug, Clone)]
pub struct LedgerConfig {
    /// Bound on every row-lock wait.
    pub lock_timeout: Duration,
    /// PostgreSQL URL. `None` selects the in-memory store.
    pub database_url: Option<String>,
    /// Connection pool size for PostgreSQL.
    pub max_connections: u32,
    /// Log level.
    pub log_level: String,
}

impl Default for LedgerConfig {
    fn default() -> Self {
        Self {
            lock_timeout: default_lock_timeout(),
            database_url: None,
            max_connections: 10,
            log_level: "info".to_string(),
        }
    }
}

impl LedgerConfig {
    /// Load configuration from environment variables.
    ///
    /// Unparseable numeric values are ignored and the default is kept.
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Ok(ms) = std::env::var("LEDGER_LOCK_TIMEOUT_MS") {
            if let Ok(ms) = ms.parse() {
                config.lock_timeout = Duration::from_millis(ms);
            }
        }

        if let Ok(url) = std::env::var("DATABASE_URL") {
            if !url.is_empty() {
                config.database_url = Some(url);
            }
        }

        if let Ok(max) = std::env::var("LEDGER_MAX_CONNECTIONS") {
            if let Ok(max) = max.parse() {
                config.max_connections = max;
            }
        }

        if let Ok(level) = std::env::var("LOG_LEVEL") {
            config.log_level = level;
        }

        config
    }

    /// Override the lock wait bound.
    pub fn with_lock_timeout(mut self, lock_timeout: Duration) -> Self {
        self.lock_timeout = lock_timeout;
        self
    }

    /// Validate configuration.
    pub fn validate(&self) -> Result<()> {
        if self.lock_timeout.is_zero() {
            return Err(LedgerError::ConfigurationError(
                "Lock timeout cannot be 0".to_string(),
            ));
        }

        if self.lock_timeout > max_lock_timeout() {
            return Err(LedgerError::ConfigurationError(format!(
                "Lock timeout cannot exceed {}s",
                max_lock_timeout().as_secs()
            )));
        }

        if self.max_connections == 0 {
            return Err(LedgerError::ConfigurationError(
                "Max connections cannot be 0".to_string(),
            ));
        }

        if matches!(&self.database_url, Some(url) if !url.starts_with("postgres")) {
            return Err(LedgerError::ConfigurationError(
                "Database URL must be a postgres:// URL".to_string(),
            ));
        }

        Ok(())
    }
}

use serde::{Deserialize, Serialize};
use std::fmt;
use std::fs;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse config yaml: {0}")]
    Parse(#[from] serde_yaml::Error),

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct AppConfig {
    pub log_level: String,
    pub log_dir: String,
    pub log_file: String,
    pub use_json: bool,
    pub rotation: String,
    pub escrow: EscrowConfig,
    #[serde(default)]
    pub reaper: ReaperConfig,
    #[serde(default)]
    pub notifications: NotificationConfig,
    #[serde(default)]
    pub trades: TradeRules,
    /// PostgreSQL connection URL; the in-memory store is used when absent
    #[serde(default)]
    pub postgres_url: Option<String>,
}

/// Escrow wallet and funds transfer endpoint, handed to the ledger at construction.
#[derive(Serialize, Deserialize, Clone)]
pub struct EscrowConfig {
    /// Base address of the transfer service, e.g. `http://lid:8080`
    pub transfer_base_url: String,
    pub escrow_wallet: String,
    pub escrow_wallet_secret: String,
    #[serde(default = "default_transfer_timeout_ms")]
    pub transfer_timeout_ms: u64,
}

fn default_transfer_timeout_ms() -> u64 {
    10_000
}

impl EscrowConfig {
    pub fn transfer_endpoint(&self) -> String {
        format!(
            "{}/api/v1/wallet/transfer",
            self.transfer_base_url.trim_end_matches('/')
        )
    }

    pub fn transfer_timeout(&self) -> Duration {
        Duration::from_millis(self.transfer_timeout_ms)
    }
}

// The wallet secret must never end up in logs.
impl fmt::Debug for EscrowConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EscrowConfig")
            .field("transfer_base_url", &self.transfer_base_url)
            .field("escrow_wallet", &self.escrow_wallet)
            .field("escrow_wallet_secret", &"<redacted>")
            .field("transfer_timeout_ms", &self.transfer_timeout_ms)
            .finish()
    }
}

/// Stale-trade reaper timing
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct ReaperConfig {
    pub poll_interval_secs: u64,
    pub stale_after_secs: u64,
}

impl Default for ReaperConfig {
    fn default() -> Self {
        Self {
            poll_interval_secs: 60,
            stale_after_secs: 600,
        }
    }
}

/// Outbound notification queue
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct NotificationConfig {
    pub queue_capacity: usize,
    pub max_attempts: u32,
    pub retry_backoff_ms: u64,
}

impl Default for NotificationConfig {
    fn default() -> Self {
        Self {
            queue_capacity: 1024,
            max_attempts: 3,
            retry_backoff_ms: 500,
        }
    }
}

/// Business rules for opening trades
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct TradeRules {
    /// Once anything is sold, reject trades larger than the amount already sold.
    /// Long-standing service behavior; `amount_left` is checked regardless.
    pub enforce_sold_cap: bool,
}

impl Default for TradeRules {
    fn default() -> Self {
        Self {
            enforce_sold_cap: true,
        }
    }
}

impl AppConfig {
    pub fn load(env: &str) -> Result<Self, ConfigError> {
        let config_path = format!("config/{}.yaml", env);
        let content = fs::read_to_string(&config_path).map_err(|source| ConfigError::Read {
            path: config_path.clone(),
            source,
        })?;
        let mut config = Self::from_yaml(&content)?;
        config.apply_env_overrides(|key| std::env::var(key).ok());
        config.validate()?;
        Ok(config)
    }

    pub fn from_yaml(content: &str) -> Result<Self, ConfigError> {
        Ok(serde_yaml::from_str(content)?)
    }

    /// Deployment secrets and addresses may come from the environment instead of the file.
    pub fn apply_env_overrides<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(addr) = lookup("LID_SERVER_ADDR") {
            self.escrow.transfer_base_url = addr;
        }
        if let Some(wallet) = lookup("ESCROW_WALLET") {
            self.escrow.escrow_wallet = wallet;
        }
        if let Some(secret) = lookup("ESCROW_WALLET_SECRET") {
            self.escrow.escrow_wallet_secret = secret;
        }
        if let Some(url) = lookup("DATABASE_URL") {
            self.postgres_url = Some(url);
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.escrow.transfer_base_url.trim().is_empty() {
            return Err(ConfigError::Invalid("escrow.transfer_base_url is empty".into()));
        }
        if self.escrow.escrow_wallet.trim().is_empty() {
            return Err(ConfigError::Invalid("escrow.escrow_wallet is empty".into()));
        }
        if self.escrow.transfer_timeout_ms == 0 {
            return Err(ConfigError::Invalid("escrow.transfer_timeout_ms must be > 0".into()));
        }
        if self.reaper.poll_interval_secs == 0 || self.reaper.stale_after_secs == 0 {
            return Err(ConfigError::Invalid("reaper intervals must be > 0".into()));
        }
        if self.notifications.queue_capacity == 0 {
            return Err(ConfigError::Invalid("notifications.queue_capacity must be > 0".into()));
        }
        Ok(())
    }
}

//! Configuration for the relay

use bridge_core::LedgerId;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::PathBuf;
use std::time::Duration;

/// Relay configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Service name
    pub service_name: String,

    /// Transfer store
    pub store: bridge_core::Config,

    /// Watched ledgers (exactly two)
    pub ledgers: Vec<LedgerConfig>,

    /// Relay driver
    pub driver: DriverConfig,

    /// Retry budget for remote calls
    pub retry: RetryConfig,

    /// Observation-time checks
    pub validation: ValidationConfig,

    /// Status snapshot interval (ms)
    pub status_interval_ms: u64,

    /// Hex seed of the relay's Ed25519 identity
    pub relay_key_seed: Option<String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            service_name: "bridge-relay".to_string(),
            store: bridge_core::Config::default(),
            ledgers: vec![
                LedgerConfig {
                    id: LedgerId(1),
                    name: "source".to_string(),
                    counterpart: LedgerId(2),
                    // Less finalized side waits longer
                    confirmations: 12,
                    replay_window: 256,
                    poll_interval_ms: 2_000,
                },
                LedgerConfig {
                    id: LedgerId(2),
                    name: "destination".to_string(),
                    counterpart: LedgerId(1),
                    confirmations: 2,
                    replay_window: 256,
                    poll_interval_ms: 1_000,
                },
            ],
            driver: DriverConfig::default(),
            retry: RetryConfig::default(),
            validation: ValidationConfig::default(),
            status_interval_ms: 5_000,
            relay_key_seed: None,
        }
    }
}

/// One watched ledger
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LedgerConfig {
    /// Ledger id (also committed into every leaf)
    pub id: LedgerId,

    /// Human-readable name for logs
    pub name: String,

    /// Ledger that settles transfers initiated here
    pub counterpart: LedgerId,

    /// Blocks required on top of an event before it is recorded
    pub confirmations: u64,

    /// Blocks re-read behind the checkpoint on startup
    pub replay_window: u64,

    /// Observer poll interval (ms)
    pub poll_interval_ms: u64,
}

impl LedgerConfig {
    /// Observer poll interval
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

/// Proof-tree strategy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProofStrategy {
    /// One tree (and one root registration) per transfer
    Single,
    /// One tree per destination per cycle
    Batched,
}

impl std::str::FromStr for ProofStrategy {
    type Err = crate::Error;

    fn from_str(s: &str) -> crate::Result<Self> {
        match s {
            "single" => Ok(ProofStrategy::Single),
            "batched" => Ok(ProofStrategy::Batched),
            other => Err(crate::Error::Config(format!("unknown proof strategy: {}", other))),
        }
    }
}

/// Relay driver configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DriverConfig {
    /// Poll interval over pending transfers (ms)
    pub poll_interval_ms: u64,

    /// Pending transfers taken per cycle
    pub batch_size: usize,

    /// Proof-tree strategy
    pub strategy: ProofStrategy,

    /// Maximum wait for a submitted operation to settle (ms)
    pub settlement_timeout_ms: u64,

    /// Receipt poll interval while waiting (ms)
    pub receipt_poll_interval_ms: u64,

    /// Interval between sweeps over transfers stuck in ProofBuilding (ms)
    pub recovery_interval_ms: u64,
}

impl Default for DriverConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: 1_000,
            batch_size: 100,
            strategy: ProofStrategy::Single,
            settlement_timeout_ms: 120_000,
            receipt_poll_interval_ms: 500,
            recovery_interval_ms: 30_000,
        }
    }
}

impl DriverConfig {
    /// Poll interval
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    /// Settlement wait bound
    pub fn settlement_timeout(&self) -> Duration {
        Duration::from_millis(self.settlement_timeout_ms)
    }

    /// Receipt poll interval
    pub fn receipt_poll_interval(&self) -> Duration {
        Duration::from_millis(self.receipt_poll_interval_ms)
    }

    /// Recovery sweep interval
    pub fn recovery_interval(&self) -> Duration {
        Duration::from_millis(self.recovery_interval_ms)
    }
}

/// Retry configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Total attempts per call, first included
    pub max_attempts: u32,

    /// Delay before the second attempt (ms)
    pub initial_backoff_ms: u64,

    /// Delay cap (ms)
    pub max_backoff_ms: u64,

    /// Backoff growth per attempt
    pub multiplier: f64,

    /// Random spread as a fraction of the delay
    pub jitter: f64,

    /// Deadline of a single remote call (ms)
    pub call_timeout_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_backoff_ms: 500,
            max_backoff_ms: 10_000,
            multiplier: 2.0,
            jitter: 0.1,
            call_timeout_ms: 10_000,
        }
    }
}

/// Observation-time validation
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ValidationConfig {
    /// Smallest accepted amount, in whole units
    pub min_amount: Decimal,

    /// Largest accepted amount, in whole units
    pub max_amount: Decimal,
}

impl Default for ValidationConfig {
    fn default() -> Self {
        Self {
            min_amount: Decimal::new(1, 6),
            max_amount: Decimal::from(1_000_000u64),
        }
    }
}

impl Config {
    /// Load from file
    pub fn from_file(path: impl AsRef<std::path::Path>) -> crate::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)
            .map_err(|e| crate::Error::Config(format!("Failed to parse config: {}", e)))?;
        Ok(config)
    }

    /// Load from environment variables
    pub fn from_env() -> crate::Result<Self> {
        let mut config = Config::default();

        if let Ok(dir) = std::env::var("BRIDGE_DATA_DIR") {
            config.store.data_dir = PathBuf::from(dir);
        }

        if let Ok(seed) = std::env::var("BRIDGE_RELAY_KEY") {
            config.relay_key_seed = Some(seed);
        }

        if let Ok(strategy) = std::env::var("BRIDGE_STRATEGY") {
            config.driver.strategy = strategy.parse()?;
        }

        if let Ok(size) = std::env::var("BRIDGE_BATCH_SIZE") {
            config.driver.batch_size = size
                .parse()
                .map_err(|_| crate::Error::Config(format!("BRIDGE_BATCH_SIZE: {}", size)))?;
        }

        if let Ok(attempts) = std::env::var("BRIDGE_MAX_ATTEMPTS") {
            config.retry.max_attempts = attempts
                .parse()
                .map_err(|_| crate::Error::Config(format!("BRIDGE_MAX_ATTEMPTS: {}", attempts)))?;
        }

        Ok(config)
    }

    /// Reject inconsistent settings
    pub fn validate(&self) -> crate::Result<()> {
        if self.ledgers.len() != 2 {
            return Err(crate::Error::Config(format!(
                "exactly two ledgers required, got {}",
                self.ledgers.len()
            )));
        }

        let ids: HashSet<LedgerId> = self.ledgers.iter().map(|l| l.id).collect();
        if ids.len() != self.ledgers.len() {
            return Err(crate::Error::Config("duplicate ledger id".to_string()));
        }

        for ledger in &self.ledgers {
            if ledger.counterpart == ledger.id || !ids.contains(&ledger.counterpart) {
                return Err(crate::Error::Config(format!(
                    "ledger {} has unknown counterpart {}",
                    ledger.id, ledger.counterpart
                )));
            }
        }

        if self.retry.max_attempts == 0 {
            return Err(crate::Error::Config("retry.max_attempts must be >= 1".to_string()));
        }

        if !(0.0..=1.0).contains(&self.retry.jitter) || self.retry.multiplier < 1.0 {
            return Err(crate::Error::Config(
                "retry.jitter must be in [0, 1] and retry.multiplier >= 1".to_string(),
            ));
        }

        if self.driver.batch_size == 0 {
            return Err(crate::Error::Config("driver.batch_size must be >= 1".to_string()));
        }

        if self.driver.recovery_interval_ms == 0 {
            return Err(crate::Error::Config(
                "driver.recovery_interval_ms must be >= 1".to_string(),
            ));
        }

        if self.validation.min_amount > self.validation.max_amount {
            return Err(crate::Error::Config(format!(
                "validation.min_amount {} exceeds max_amount {}",
                self.validation.min_amount, self.validation.max_amount
            )));
        }

        Ok(())
    }

    /// Config of one ledger
    pub fn ledger(&self, id: LedgerId) -> Option<&LedgerConfig> {
        self.ledgers.iter().find(|l| l.id == id)
    }

    /// Status snapshot interval
    pub fn status_interval(&self) -> Duration {
        Duration::from_millis(self.status_interval_ms)
    }
}

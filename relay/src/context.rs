//! Relay context
//!
//! Everything the observer, driver and status tasks share, constructed once at
//! startup and cloned into each task.

use crate::chain::LedgerRuntime;
use crate::{Config, Error, Result};
use bridge_core::{KeyPair, LedgerId, Metrics, TransferLedger};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::watch;

/// Shared relay state
#[derive(Debug, Clone)]
pub struct RelayContext {
    /// Relay configuration
    pub config: Arc<Config>,

    /// Durable transfer record
    pub ledger: Arc<TransferLedger>,

    /// Runtimes by ledger id
    pub runtimes: HashMap<LedgerId, Arc<dyn LedgerRuntime>>,

    /// Identity that signs root registrations
    pub identity: Arc<KeyPair>,

    /// Prometheus metrics
    pub metrics: Metrics,

    /// Flips to `true` when the process should stop
    pub shutdown: watch::Receiver<bool>,
}

impl RelayContext {
    /// Assemble a context; every configured ledger needs a runtime
    pub fn new(
        config: Config,
        ledger: Arc<TransferLedger>,
        runtimes: Vec<Arc<dyn LedgerRuntime>>,
        identity: Arc<KeyPair>,
        shutdown: watch::Receiver<bool>,
    ) -> Result<Self> {
        config.validate()?;

        let runtimes: HashMap<LedgerId, Arc<dyn LedgerRuntime>> = runtimes
            .into_iter()
            .map(|rt| (rt.ledger_id(), rt))
            .collect();

        for ledger in &config.ledgers {
            if !runtimes.contains_key(&ledger.id) {
                return Err(Error::Config(format!(
                    "no runtime for ledger {} ({})",
                    ledger.id, ledger.name
                )));
            }
        }

        let metrics =
            Metrics::new().map_err(|e| Error::Config(format!("metrics registry: {}", e)))?;

        Ok(Self {
            config: Arc::new(config),
            ledger,
            runtimes,
            identity,
            metrics,
            shutdown,
        })
    }

    /// Runtime of `id`
    pub fn runtime(&self, id: LedgerId) -> Result<Arc<dyn LedgerRuntime>> {
        self.runtimes
            .get(&id)
            .cloned()
            .ok_or_else(|| Error::Config(format!("no runtime for ledger {}", id)))
    }

    /// Shutdown requested
    pub fn is_shutting_down(&self) -> bool {
        *self.shutdown.borrow()
    }
}

//! Ledger observer
//!
//! Follows one ledger's finalized blocks (head minus the configured
//! confirmations) and records every lock/burn it finds as a pending transfer.
//! The checkpoint advances only after the whole range is recorded, and a
//! restart re-reads `replay_window` blocks behind it; recording is keyed by
//! source transaction, so re-reads never duplicate a transfer.

use crate::chain::{ChainEvent, LedgerRuntime, TransferEvent};
use crate::config::LedgerConfig;
use crate::context::RelayContext;
use crate::retry::RetryPolicy;
use crate::{Error, Result};
use bridge_core::{Transfer, TransferKind};
use std::sync::Arc;
use tokio::sync::broadcast::error::RecvError;
use tracing::{debug, info, warn};

/// Observer of one ledger
#[derive(Debug)]
pub struct Observer {
    ctx: RelayContext,
    cfg: LedgerConfig,
    runtime: Arc<dyn LedgerRuntime>,
    retry: RetryPolicy,
    next_block: u64,
}

impl Observer {
    /// Create an observer resuming from the stored checkpoint
    pub fn new(ctx: RelayContext, cfg: LedgerConfig) -> Result<Self> {
        let runtime = ctx.runtime(cfg.id)?;
        let retry = RetryPolicy::new(ctx.config.retry.clone());

        let next_block = match ctx.ledger.checkpoint(cfg.id)? {
            Some(checkpoint) => (checkpoint + 1).saturating_sub(cfg.replay_window),
            None => 0,
        };

        Ok(Self {
            ctx,
            cfg,
            runtime,
            retry,
            next_block,
        })
    }

    /// First block the next poll will read
    pub fn next_block(&self) -> u64 {
        self.next_block
    }

    /// Read newly finalized blocks once; returns the number of new transfers
    pub async fn poll_once(&mut self) -> Result<usize> {
        let head = self.retry.timed("head", self.runtime.head()).await?;

        let safe = match head.checked_sub(self.cfg.confirmations) {
            Some(safe) if safe >= self.next_block => safe,
            _ => return Ok(0),
        };

        let events = self
            .retry
            .timed("events", self.runtime.events(self.next_block, safe))
            .await?;

        let mut recorded = 0;
        for event in &events {
            if let Some((kind, payload)) = event.initiating() {
                if self.observe(event, kind, payload).await? {
                    recorded += 1;
                }
            }
        }

        self.ctx.ledger.set_checkpoint(self.cfg.id, safe).await?;
        debug!(
            ledger = %self.cfg.id,
            from = self.next_block,
            to = safe,
            events = events.len(),
            recorded,
            "Observed blocks"
        );
        self.next_block = safe + 1;

        Ok(recorded)
    }

    async fn observe(
        &self,
        event: &ChainEvent,
        kind: TransferKind,
        payload: &TransferEvent,
    ) -> Result<bool> {
        if let Err(e) = self.check(payload) {
            warn!(
                ledger = %self.cfg.id,
                source_tx = %event.tx_hash,
                nonce = payload.fields.nonce,
                error = %e,
                "Skipping invalid source event"
            );
            self.ctx.metrics.record_rejected_event();
            return Ok(false);
        }

        let transfer = Transfer::observed(event.tx_hash, event.block, kind, payload.fields);
        let inserted = self.ctx.ledger.record_observed(transfer).await?;

        if inserted {
            self.ctx.metrics.record_observed();
            info!(
                ledger = %self.cfg.id,
                source_tx = %event.tx_hash,
                kind = %kind,
                nonce = payload.fields.nonce,
                amount = %payload.fields.amount,
                dest = %payload.fields.dest_ledger,
                "Transfer observed"
            );
        }

        Ok(inserted)
    }

    /// Observation-time checks of an initiating event
    fn check(&self, payload: &TransferEvent) -> Result<()> {
        let fields = &payload.fields;

        if fields.source_ledger != self.cfg.id {
            return Err(Error::InvalidEvent(format!(
                "source ledger {} on ledger {}",
                fields.source_ledger, self.cfg.id
            )));
        }

        if fields.dest_ledger != self.cfg.counterpart {
            return Err(Error::InvalidEvent(format!(
                "destination {} is not counterpart {}",
                fields.dest_ledger, self.cfg.counterpart
            )));
        }

        if fields.digest() != payload.leaf_digest {
            return Err(Error::InvalidEvent(format!(
                "leaf digest mismatch: event {}, computed {}",
                payload.leaf_digest,
                fields.digest()
            )));
        }

        if fields.recipient.is_zero() {
            return Err(Error::InvalidEvent("zero recipient".to_string()));
        }

        let units = fields.amount.to_units();
        let limits = &self.ctx.config.validation;
        if fields.amount.is_zero() || units < limits.min_amount || units > limits.max_amount {
            return Err(Error::InvalidEvent(format!(
                "amount {} outside [{}, {}]",
                fields.amount, limits.min_amount, limits.max_amount
            )));
        }

        Ok(())
    }

    /// Poll until shutdown, waking early on new heads
    pub async fn run(mut self) {
        let mut heads = self.runtime.subscribe();
        let mut heads_open = true;
        let mut shutdown = self.ctx.shutdown.clone();

        info!(
            ledger = %self.cfg.id,
            name = %self.cfg.name,
            from = self.next_block,
            confirmations = self.cfg.confirmations,
            "Observer started"
        );

        while !*shutdown.borrow() {
            if let Err(e) = self.poll_once().await {
                warn!(ledger = %self.cfg.id, error = %e, "Observation failed");
            }

            tokio::select! {
                head = heads.recv(), if heads_open => match head {
                    Ok(_) | Err(RecvError::Lagged(_)) => {}
                    Err(RecvError::Closed) => heads_open = false,
                },
                _ = tokio::time::sleep(self.cfg.poll_interval()) => {}
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
            }
        }

        info!(ledger = %self.cfg.id, checkpoint = self.next_block.saturating_sub(1), "Observer stopped");
    }
}

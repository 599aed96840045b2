//! Status queries and periodic snapshots

use crate::Result;
use bridge_core::{StatusCounts, Transfer, TransferLedger, TransferStatus};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Transfers listed per status in a snapshot
const SNAPSHOT_LIMIT: usize = 50;

/// Point-in-time view of the relay
#[derive(Debug, Clone, Default, Serialize)]
pub struct StatusSnapshot {
    /// Counts by status
    pub counts: StatusCounts,
    /// Oldest pending transfers
    pub pending: Vec<Transfer>,
    /// Transfers between proof construction and settlement
    pub processing: Vec<Transfer>,
    /// Snapshot time
    pub generated_at: DateTime<Utc>,
}

impl StatusSnapshot {
    /// Serialize for operators
    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string_pretty(self)
            .map_err(|e| crate::Error::Config(format!("status serialization: {}", e)))
    }
}

/// Read-only queries over the transfer record
#[derive(Debug, Clone)]
pub struct RelayStatus {
    ledger: Arc<TransferLedger>,
}

impl RelayStatus {
    /// Create over a transfer ledger
    pub fn new(ledger: Arc<TransferLedger>) -> Self {
        Self { ledger }
    }

    /// Transfer by id
    pub fn transfer(&self, id: &Uuid) -> Result<Option<Transfer>> {
        Ok(self.ledger.get_by_id(id)?)
    }

    /// Pending transfers
    pub fn pending(&self, limit: usize) -> Result<Vec<Transfer>> {
        Ok(self.ledger.list_by_status(TransferStatus::Pending, limit)?)
    }

    /// Transfers in proof construction or awaiting settlement
    pub fn processing(&self, limit: usize) -> Result<Vec<Transfer>> {
        Ok(self
            .ledger
            .list_by_status(TransferStatus::ProofBuilding, limit)?)
    }

    /// Failed transfers, for operator follow-up
    pub fn failed(&self, limit: usize) -> Result<Vec<Transfer>> {
        Ok(self.ledger.list_by_status(TransferStatus::Failed, limit)?)
    }

    /// Counts by status
    pub fn counts(&self) -> Result<StatusCounts> {
        Ok(self.ledger.counts()?)
    }

    /// Build a snapshot
    pub fn snapshot(&self) -> Result<StatusSnapshot> {
        Ok(StatusSnapshot {
            counts: self.counts()?,
            pending: self.pending(SNAPSHOT_LIMIT)?,
            processing: self.processing(SNAPSHOT_LIMIT)?,
            generated_at: Utc::now(),
        })
    }
}

/// Publishes a snapshot on a watch channel at a fixed interval
#[derive(Debug)]
pub struct StatusPublisher {
    status: RelayStatus,
    interval: Duration,
    sender: watch::Sender<StatusSnapshot>,
}

impl StatusPublisher {
    /// Create a publisher and the receiver its snapshots land on
    pub fn new(status: RelayStatus, interval: Duration) -> (Self, watch::Receiver<StatusSnapshot>) {
        let (sender, receiver) = watch::channel(StatusSnapshot::default());
        (
            Self {
                status,
                interval,
                sender,
            },
            receiver,
        )
    }

    /// Publish one snapshot now
    pub fn publish(&self) -> Result<StatusCounts> {
        let snapshot = self.status.snapshot()?;
        let counts = snapshot.counts;
        self.sender.send_replace(snapshot);
        Ok(counts)
    }

    /// Publish until shutdown
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(self.interval);
        let mut last_failed = 0;

        while !*shutdown.borrow() {
            tokio::select! {
                _ = ticker.tick() => {}
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    continue;
                }
            }

            match self.publish() {
                Ok(counts) => {
                    debug!(
                        total = counts.total,
                        pending = counts.pending,
                        processing = counts.processing,
                        completed = counts.completed,
                        failed = counts.failed,
                        "Relay status"
                    );
                    if counts.failed > last_failed {
                        warn!(
                            failed = counts.failed,
                            new = counts.failed - last_failed,
                            "Transfers need operator attention"
                        );
                    }
                    last_failed = counts.failed;
                }
                Err(e) => warn!(error = %e, "Status snapshot failed"),
            }
        }

        info!("Status publisher stopped");
    }
}

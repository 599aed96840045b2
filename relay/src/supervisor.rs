//! Relay service: one observer per ledger, the driver and the status publisher

use crate::context::RelayContext;
use crate::driver::Driver;
use crate::observer::Observer;
use crate::status::{RelayStatus, StatusPublisher, StatusSnapshot};
use crate::Result;
use tokio::sync::watch;
use tokio::task::JoinSet;
use tracing::{error, info};

/// Running relay
#[derive(Debug)]
pub struct RelayService {
    tasks: JoinSet<()>,
    status: watch::Receiver<StatusSnapshot>,
}

impl RelayService {
    /// Spawn every relay task
    ///
    /// Tasks stop when the context's shutdown signal flips; await
    /// [`RelayService::join`] afterwards, then shut the transfer ledger down.
    pub fn start(ctx: RelayContext) -> Result<Self> {
        let mut tasks = JoinSet::new();

        for ledger in &ctx.config.ledgers {
            let observer = Observer::new(ctx.clone(), ledger.clone())?;
            tasks.spawn(observer.run());
        }

        tasks.spawn(Driver::new(ctx.clone()).run());

        let (publisher, status) = StatusPublisher::new(
            RelayStatus::new(ctx.ledger.clone()),
            ctx.config.status_interval(),
        );
        tasks.spawn(publisher.run(ctx.shutdown.clone()));

        info!(
            service = %ctx.config.service_name,
            ledgers = ctx.config.ledgers.len(),
            "Relay started"
        );

        Ok(Self { tasks, status })
    }

    /// Latest status snapshot channel
    pub fn status(&self) -> watch::Receiver<StatusSnapshot> {
        self.status.clone()
    }

    /// Wait for every task to finish
    pub async fn join(mut self) {
        while let Some(joined) = self.tasks.join_next().await {
            if let Err(e) = joined {
                error!(error = %e, "Relay task failed");
            }
        }
        info!("Relay stopped");
    }
}

//! Bridge relay binary
//!
//! Usage: `bridge-relay [--config <file>] [--simulate]`
//!
//! Without `--config` the configuration comes from `BRIDGE_*` environment
//! variables. `--simulate` runs both ledgers in-process with a block producer
//! and one demo lock.

use anyhow::bail;
use clap::Parser;
use bridge_core::{Address, Amount, KeyPair, TransferLedger};
use bridge_relay::{Config, LedgerRuntime, RelayContext, RelayService, SimulatedLedger};
use rust_decimal::Decimal;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

/// Two-ledger bridge relay
#[derive(Debug, Parser)]
#[command(name = "bridge-relay", version)]
struct Args {
    /// TOML configuration file; `BRIDGE_*` environment variables otherwise
    #[arg(long)]
    config: Option<PathBuf>,

    /// Run both ledgers in-process with a block producer and a demo lock
    #[arg(long)]
    simulate: bool,
}

fn init_tracing() {
    let filter =
        EnvFilter::from_default_env().add_directive(tracing::Level::INFO.into());

    if std::env::var("BRIDGE_LOG_JSON").map(|v| v == "1").unwrap_or(false) {
        tracing_subscriber::fmt().json().with_env_filter(filter).init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }
}

/// Both ledgers in-process, a block every second and one demo lock
fn simulated_runtimes(
    config: &Config,
    identity: &KeyPair,
) -> anyhow::Result<Vec<Arc<dyn LedgerRuntime>>> {
    let source = config.ledgers[0].clone();
    let dest = config.ledgers[1].clone();

    let source_ledger = Arc::new(SimulatedLedger::new(source.id, identity.verifying_key()));
    let dest_ledger = Arc::new(SimulatedLedger::new(dest.id, identity.verifying_key()));

    let user = Address::repeat_byte(0xaa);
    let amount = Amount::from_units(Decimal::ONE)?;
    source_ledger.fund(user, Amount::from_units(Decimal::from(10))?)?;
    let (tx, nonce) = source_ledger.lock(user, user, amount, dest.id)?;
    info!(source_tx = %tx, nonce, amount = %amount, "Demo lock submitted");

    for ledger in [source_ledger.clone(), dest_ledger.clone()] {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(Duration::from_secs(1));
            loop {
                ticker.tick().await;
                ledger.mine(1);
            }
        });
    }

    Ok(vec![
        source_ledger as Arc<dyn LedgerRuntime>,
        dest_ledger as Arc<dyn LedgerRuntime>,
    ])
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing();

    let args = Args::parse();

    // Load configuration
    let config = match &args.config {
        Some(path) => Config::from_file(path)?,
        None => Config::from_env()?,
    };
    config.validate()?;

    info!(
        service = %config.service_name,
        data_dir = %config.store.data_dir.display(),
        strategy = ?config.driver.strategy,
        "Bridge relay starting"
    );

    let identity = match &config.relay_key_seed {
        Some(seed) => KeyPair::from_hex_seed(seed)?,
        None => {
            warn!("No relay key configured, using an ephemeral identity");
            KeyPair::generate()
        }
    };
    let identity = Arc::new(identity);

    let runtimes = if args.simulate {
        simulated_runtimes(&config, &identity)?
    } else {
        bail!("no ledger runtime configured; run with --simulate for the in-process ledgers");
    };

    let ledger = Arc::new(TransferLedger::open(config.store.clone())?);
    info!("Transfer store opened");

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let ctx = RelayContext::new(config, ledger.clone(), runtimes, identity, shutdown_rx)?;
    let service = RelayService::start(ctx)?;

    tokio::signal::ctrl_c().await?;
    info!("Shutting down bridge relay");

    shutdown_tx.send_replace(true);
    service.join().await;
    ledger.shutdown().await?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_args_parse_config_and_simulate() {
        let args =
            Args::try_parse_from(["bridge-relay", "--config", "relay.toml", "--simulate"]).unwrap();
        assert_eq!(args.config, Some(PathBuf::from("relay.toml")));
        assert!(args.simulate);
    }

    #[test]
    fn test_args_defaults() {
        let args = Args::try_parse_from(["bridge-relay"]).unwrap();
        assert!(args.config.is_none());
        assert!(!args.simulate);
    }

    #[test]
    fn test_args_reject_unknown_flag() {
        assert!(Args::try_parse_from(["bridge-relay", "--bogus"]).is_err());
        assert!(Args::try_parse_from(["bridge-relay", "--config"]).is_err());
    }
}

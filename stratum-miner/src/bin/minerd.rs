//! Main entry point for the stratum-miner daemon.

use anyhow::Context;
use stratum_miner::{config::MinerConfig, daemon::Daemon, tracing};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing::init_journald_or_stdout();

    let config = MinerConfig::from_env().context("configuration")?;
    Daemon::new(config).run().await
}

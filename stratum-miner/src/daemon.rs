//! Daemon lifecycle management for stratum-miner.
//!
//! Wires the pool client to the scheduler, waits for a signal or for the
//! client to give up, and shuts everything down in order.

use anyhow::Context;
use tokio::signal::unix::{self, SignalKind};
use tokio::sync::mpsc;
use tokio_util::{sync::CancellationToken, task::TaskTracker};

use crate::config::MinerConfig;
use crate::scheduler::Scheduler;
use crate::stratum_v1::{StratumV1Client, parse_pool_url};
use crate::tracing::prelude::*;

const EVENT_CHANNEL_CAPACITY: usize = 100;
const COMMAND_CHANNEL_CAPACITY: usize = 100;

/// The main daemon that coordinates all mining operations.
pub struct Daemon {
    config: MinerConfig,
    shutdown: CancellationToken,
    tracker: TaskTracker,
}

impl Daemon {
    pub fn new(config: MinerConfig) -> Self {
        Self {
            config,
            shutdown: CancellationToken::new(),
            tracker: TaskTracker::new(),
        }
    }

    /// Run until SIGINT/SIGTERM, or until the pool client stops on its own.
    ///
    /// Returns an error when the client faulted (rejected credentials or
    /// reconnects exhausted) so a supervisor can restart the process.
    pub async fn run(self) -> anyhow::Result<()> {
        let target = parse_pool_url(&self.config.pool.url)
            .with_context(|| format!("invalid pool URL {:?}", self.config.pool.url))?;

        let (event_tx, event_rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        let (command_tx, command_rx) = mpsc::channel(COMMAND_CHANNEL_CAPACITY);

        let mut scheduler = Scheduler::new(self.config.cpu_threads, event_rx, command_tx)
            .context("failed to start hash threads")?;
        let client = StratumV1Client::new(
            self.config.pool.clone(),
            self.config.connection.clone(),
            event_tx,
            command_rx,
            self.shutdown.clone(),
        );

        let mut client_task = self.tracker.spawn(client.run());
        self.tracker.spawn({
            let shutdown = self.shutdown.clone();
            async move { scheduler.run(shutdown).await }
        });
        self.tracker.close();

        info!(
            pool = %target,
            worker = %self.config.pool.username,
            threads = self.config.cpu_threads,
            "Started."
        );

        let mut sigint = unix::signal(SignalKind::interrupt())?;
        let mut sigterm = unix::signal(SignalKind::terminate())?;

        let outcome = tokio::select! {
            _ = sigint.recv() => {
                info!("Received SIGINT");
                Ok(())
            }
            _ = sigterm.recv() => {
                info!("Received SIGTERM");
                Ok(())
            }
            result = &mut client_task => match result {
                Ok(Ok(())) => Ok(()),
                Ok(Err(e)) => {
                    error!(error = %e, "Pool client stopped");
                    Err(anyhow::Error::new(e).context("pool session faulted"))
                }
                Err(e) => Err(anyhow::Error::new(e).context("pool client task panicked")),
            },
        };

        trace!("Shutting down.");
        self.shutdown.cancel();
        self.tracker.wait().await;
        info!("Exiting.");

        outcome
    }
}

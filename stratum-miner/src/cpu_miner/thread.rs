//! Handle to one CPU search thread.
//!
//! Uses the actor pattern with a dedicated `std::thread` for hashing.

use std::sync::{
    Arc,
    atomic::{AtomicBool, Ordering},
    mpsc,
};
use std::thread::JoinHandle;

use super::HashThreadError;
use super::hasher::{self, SearchCommand, SearchContext};
use crate::job::ActiveJob;

/// One hashing thread, driven by commands.
pub struct CpuHashThread {
    /// Human-readable name for logging.
    name: String,

    /// Channel for sending commands to the search thread.
    command_tx: mpsc::Sender<SearchCommand>,

    /// Shutdown flag shared with the search thread.
    shutdown: Arc<AtomicBool>,

    _thread_handle: Option<JoinHandle<()>>,
}

impl CpuHashThread {
    /// Spawn the search thread.
    pub fn spawn(ctx: SearchContext) -> Result<Self, HashThreadError> {
        let (command_tx, command_rx) = mpsc::channel();
        let name = ctx.name.clone();
        let shutdown = Arc::clone(&ctx.shutdown);

        let handle = std::thread::Builder::new()
            .name(format!("cpu-miner-{}", name))
            .spawn(move || hasher::run_search_loop(ctx, command_rx))?;

        Ok(Self {
            name,
            command_tx,
            shutdown,
            _thread_handle: Some(handle),
        })
    }

    /// Drop the current search and start on `job`.
    pub fn mine(&self, job: Arc<ActiveJob>) -> Result<(), HashThreadError> {
        self.send(SearchCommand::Mine(job))
    }

    pub fn idle(&self) -> Result<(), HashThreadError> {
        self.send(SearchCommand::Idle)
    }

    fn send(&self, command: SearchCommand) -> Result<(), HashThreadError> {
        self.command_tx
            .send(command)
            .map_err(|_| HashThreadError::ChannelClosed(self.name.clone()))
    }

    /// Signal the search thread to stop.
    pub fn shutdown(&self) {
        self.shutdown.store(true, Ordering::Relaxed);
        let _ = self.command_tx.send(SearchCommand::Shutdown);
    }
}

impl Drop for CpuHashThread {
    fn drop(&mut self) {
        self.shutdown();
    }
}

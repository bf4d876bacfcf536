//! CPU hash engine.
//!
//! Spawns one `std::thread` per configured core. Every thread mines the same
//! job on its own slice of the extranonce2 space and sends share candidates
//! back over a Tokio channel.
//!
//! Threads stop a search on their own once the job generation moves on, so
//! the scheduler only has to tell them what to mine next.

mod hasher;
mod thread;

use std::sync::{
    Arc,
    atomic::{AtomicBool, AtomicU64, Ordering},
};

use thiserror::Error;
use tokio::sync::mpsc;

pub use hasher::{BATCH_SIZE, Search, SearchContext, ShareCandidate};
pub use thread::CpuHashThread;

use crate::{
    job::{ActiveJob, GenerationWatch},
    types::DifficultyTracker,
};

#[derive(Error, Debug)]
pub enum HashThreadError {
    #[error("Command channel to thread {0} closed")]
    ChannelClosed(String),

    #[error("Failed to spawn hash thread: {0}")]
    SpawnFailed(#[from] std::io::Error),
}

/// All search threads of this process.
pub struct CpuMiner {
    threads: Vec<CpuHashThread>,
    shutdown: Arc<AtomicBool>,
    hashes: Arc<AtomicU64>,
}

impl CpuMiner {
    /// Start `thread_count` idle threads.
    pub fn spawn(
        thread_count: usize,
        share_tx: mpsc::Sender<ShareCandidate>,
        difficulty: DifficultyTracker,
        generation: GenerationWatch,
    ) -> Result<Self, HashThreadError> {
        let count = thread_count.max(1) as u32;
        let shutdown = Arc::new(AtomicBool::new(false));
        let hashes = Arc::new(AtomicU64::new(0));

        let threads = (0..count)
            .map(|index| {
                CpuHashThread::spawn(SearchContext {
                    name: index.to_string(),
                    index,
                    count,
                    share_tx: share_tx.clone(),
                    difficulty: difficulty.clone(),
                    generation: generation.clone(),
                    shutdown: Arc::clone(&shutdown),
                    hashes: Arc::clone(&hashes),
                })
            })
            .collect::<Result<Vec<_>, _>>()?;

        Ok(Self {
            threads,
            shutdown,
            hashes,
        })
    }

    pub fn thread_count(&self) -> usize {
        self.threads.len()
    }

    /// Point every thread at `job`.
    pub fn mine(&self, job: &Arc<ActiveJob>) -> Result<(), HashThreadError> {
        for thread in &self.threads {
            thread.mine(Arc::clone(job))?;
        }
        Ok(())
    }

    pub fn idle(&self) -> Result<(), HashThreadError> {
        for thread in &self.threads {
            thread.idle()?;
        }
        Ok(())
    }

    /// Hashes computed by all threads since start.
    pub fn total_hashes(&self) -> u64 {
        self.hashes.load(Ordering::Relaxed)
    }

    pub fn shutdown(&self) {
        self.shutdown.store(true, Ordering::Relaxed);
        for thread in &self.threads {
            thread.shutdown();
        }
    }
}

impl Drop for CpuMiner {
    fn drop(&mut self) {
        self.shutdown();
    }
}

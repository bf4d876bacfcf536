//! CPU share search loop.
//!
//! Runs in a dedicated `std::thread` to avoid blocking the Tokio runtime.
//! Each hash is a plain double SHA-256 over the serialized header; only the
//! nonce bytes change between hashes, and extranonce2 is rolled whenever the
//! nonce space of the current merkle root is used up.

use std::sync::{
    Arc,
    atomic::{AtomicBool, AtomicU64, Ordering},
    mpsc::{self, RecvTimeoutError, TryRecvError},
};
use std::time::{Duration, Instant};

use bitcoin::hashes::Hash;
use tokio::sync::mpsc as tokio_mpsc;

use crate::{
    job::{ActiveJob, GenerationWatch, HeaderTemplate, MerkleRootTemplate},
    tracing::prelude::*,
    types::{BlockHash, DifficultyTracker, Extranonce2, Extranonce2Error, HashRate},
    u256::U256,
};

/// Nonces hashed between checks for cancellation.
pub const BATCH_SIZE: u32 = 4096;

const IDLE_POLL: Duration = Duration::from_millis(100);
const HASHRATE_LOG_INTERVAL: Duration = Duration::from_secs(5);

/// Commands sent to the search thread.
#[derive(Debug)]
pub enum SearchCommand {
    /// Abandon whatever is being searched and start on this job.
    Mine(Arc<ActiveJob>),

    /// Stop hashing until the next `Mine`.
    Idle,

    Shutdown,
}

/// A header hash that met the share target at the time it was compared.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShareCandidate {
    pub session_id: u64,
    pub job_id: String,
    pub generation: u64,
    pub extranonce2: Extranonce2,
    pub ntime: u32,
    pub nonce: u32,
    pub hash: BlockHash,
}

/// Share target derived from the tracker, recomputed only when the stored
/// difficulty changes.
#[derive(Debug)]
struct TargetCache {
    raw: Option<u64>,
    target: U256,
}

impl TargetCache {
    fn new() -> Self {
        Self {
            raw: None,
            target: U256::ZERO,
        }
    }

    fn get(&mut self, tracker: &DifficultyTracker) -> U256 {
        let raw = tracker.raw();
        if self.raw != Some(raw) {
            self.raw = Some(raw);
            self.target = tracker.get().to_target_u256();
        }
        self.target
    }
}

/// Search state for one job on one thread.
///
/// Thread `index` of `count` starts at extranonce2 `index` and steps by
/// `count`, so threads never hash the same header.
#[derive(Debug)]
pub struct Search {
    job: Arc<ActiveJob>,
    merkle: MerkleRootTemplate,
    header: HeaderTemplate,
    extranonce2: Extranonce2,
    stride: u64,
    nonce: u32,
    target: TargetCache,
}

impl Search {
    pub fn new(job: Arc<ActiveJob>, index: u32, count: u32) -> Result<Self, Extranonce2Error> {
        let mut extranonce2 = Extranonce2::new(0, job.extranonce2_size)?;
        extranonce2.advance(index as u64);

        let merkle = job.merkle_template();
        let header = job.header_template(&merkle.compute_merkle_root(&extranonce2));

        Ok(Self {
            job,
            merkle,
            header,
            extranonce2,
            stride: count.max(1) as u64,
            nonce: 0,
            target: TargetCache::new(),
        })
    }

    pub fn job(&self) -> &Arc<ActiveJob> {
        &self.job
    }

    pub fn extranonce2(&self) -> Extranonce2 {
        self.extranonce2
    }

    /// Hash the next [`BATCH_SIZE`] nonces, appending hits to `found`.
    ///
    /// Difficulty is read before every comparison, so a change applies to
    /// the very next nonce but never to one already compared.
    pub fn hash_batch(&mut self, difficulty: &DifficultyTracker, found: &mut Vec<ShareCandidate>) {
        for _ in 0..BATCH_SIZE {
            let nonce = self.nonce;
            self.header.set_nonce(nonce);
            let hash = self.header.hash_bytes();

            if U256::from_le_bytes(hash) <= self.target.get(difficulty) {
                found.push(ShareCandidate {
                    session_id: self.job.session_id,
                    job_id: self.job.job_id().to_string(),
                    generation: self.job.generation,
                    extranonce2: self.extranonce2,
                    ntime: self.job.job.ntime,
                    nonce,
                    hash: BlockHash::from_byte_array(hash),
                });
            }

            if nonce == u32::MAX {
                self.roll_extranonce2();
            } else {
                self.nonce = nonce + 1;
            }
        }
    }

    fn roll_extranonce2(&mut self) {
        if !self.extranonce2.advance(self.stride) {
            debug!(
                job_id = %self.job.job_id(),
                "Extranonce2 space exhausted, wrapping"
            );
        }
        self.nonce = 0;
        self.header = self
            .job
            .header_template(&self.merkle.compute_merkle_root(&self.extranonce2));
    }
}

/// Everything the search loop needs besides its command channel.
pub struct SearchContext {
    pub name: String,
    pub index: u32,
    pub count: u32,
    pub share_tx: tokio_mpsc::Sender<ShareCandidate>,
    pub difficulty: DifficultyTracker,
    pub generation: GenerationWatch,
    pub shutdown: Arc<AtomicBool>,
    pub hashes: Arc<AtomicU64>,
}

/// Forward shares until one turns out stale.
///
/// Returns `false` if the receiving side is gone.
pub fn forward_shares(
    found: &mut Vec<ShareCandidate>,
    generation: &GenerationWatch,
    share_tx: &tokio_mpsc::Sender<ShareCandidate>,
) -> bool {
    for share in found.drain(..) {
        if !generation.is_current(share.generation) {
            trace!(job_id = %share.job_id, nonce = share.nonce, "Dropping share from superseded job");
            break;
        }
        if share_tx.blocking_send(share).is_err() {
            return false;
        }
    }
    true
}

/// Run the search loop until shutdown.
pub fn run_search_loop(ctx: SearchContext, cmd_rx: mpsc::Receiver<SearchCommand>) {
    let mut search: Option<Search> = None;
    let mut found = Vec::new();
    let mut hashes_computed: u64 = 0;
    let mut shares_found: u64 = 0;
    let mut last_hashrate_update = Instant::now();

    loop {
        if ctx.shutdown.load(Ordering::Relaxed) {
            break;
        }

        let command = if search.is_some() {
            match cmd_rx.try_recv() {
                Ok(cmd) => Some(cmd),
                Err(TryRecvError::Empty) => None,
                Err(TryRecvError::Disconnected) => return,
            }
        } else {
            match cmd_rx.recv_timeout(IDLE_POLL) {
                Ok(cmd) => Some(cmd),
                Err(RecvTimeoutError::Timeout) => continue,
                Err(RecvTimeoutError::Disconnected) => return,
            }
        };

        match command {
            Some(SearchCommand::Mine(job)) => {
                if !ctx.generation.is_current(job.generation) {
                    trace!(thread = %ctx.name, job_id = %job.job_id(), "Skipping superseded job");
                    search = None;
                    continue;
                }
                match Search::new(job, ctx.index, ctx.count) {
                    Ok(s) => {
                        debug!(
                            thread = %ctx.name,
                            job_id = %s.job().job_id(),
                            extranonce2 = %s.extranonce2(),
                            "Starting search"
                        );
                        search = Some(s);
                    }
                    Err(e) => {
                        warn!(thread = %ctx.name, error = %e, "Cannot mine job");
                        search = None;
                    }
                }
            }
            Some(SearchCommand::Idle) => {
                search = None;
                continue;
            }
            Some(SearchCommand::Shutdown) => return,
            None => {}
        }

        let Some(s) = search.as_mut() else {
            continue;
        };

        if !ctx.generation.is_current(s.job().generation) {
            trace!(thread = %ctx.name, job_id = %s.job().job_id(), "Job superseded");
            search = None;
            continue;
        }

        s.hash_batch(&ctx.difficulty, &mut found);
        hashes_computed += BATCH_SIZE as u64;
        ctx.hashes.fetch_add(BATCH_SIZE as u64, Ordering::Relaxed);
        shares_found += found.len() as u64;

        if !forward_shares(&mut found, &ctx.generation, &ctx.share_tx) {
            debug!(thread = %ctx.name, "Share channel closed, stopping");
            return;
        }

        let elapsed = last_hashrate_update.elapsed();
        if elapsed >= HASHRATE_LOG_INTERVAL {
            trace!(
                thread = %ctx.name,
                hashrate = %HashRate::measured(hashes_computed, elapsed),
                shares = shares_found,
                "CPU miner stats"
            );
            hashes_computed = 0;
            last_hashrate_update = Instant::now();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::JobStore;
    use crate::job::fixtures::{job, session};
    use crate::types::Difficulty;

    /// Difficulty so small every hash qualifies.
    fn accept_all() -> DifficultyTracker {
        DifficultyTracker::new(Difficulty::new(1e-30).unwrap())
    }

    #[test]
    fn test_batch_with_trivial_target_finds_every_nonce() {
        let mut store = JobStore::new();
        let active = store.insert(job("a", true), &session(4));
        let mut search = Search::new(Arc::clone(&active), 0, 1).unwrap();

        let mut found = Vec::new();
        search.hash_batch(&accept_all(), &mut found);

        assert_eq!(found.len(), BATCH_SIZE as usize);
        assert_eq!(found[0].nonce, 0);
        assert_eq!(found[BATCH_SIZE as usize - 1].nonce, BATCH_SIZE - 1);
        assert!(found.iter().all(|s| s.job_id == "a"
            && s.session_id == 4
            && s.generation == active.generation
            && s.ntime == active.job.ntime));
    }

    #[test]
    fn test_found_hash_matches_rebuilt_header() {
        let mut store = JobStore::new();
        let active = store.insert(job("a", true), &session(1));
        let mut search = Search::new(Arc::clone(&active), 2, 3).unwrap();

        let mut found = Vec::new();
        search.hash_batch(&accept_all(), &mut found);
        let share = &found[17];

        let template = active.merkle_template();
        let mut header = active.header_template(&template.compute_merkle_root(&share.extranonce2));
        header.set_nonce(share.nonce);

        assert_eq!(share.extranonce2.value(), 2);
        assert_eq!(header.hash(), share.hash);
    }

    #[test]
    fn test_default_difficulty_finds_nothing_quickly() {
        let mut store = JobStore::new();
        let active = store.insert(job("a", true), &session(1));
        let mut search = Search::new(active, 0, 1).unwrap();

        let mut found = Vec::new();
        search.hash_batch(&DifficultyTracker::default(), &mut found);

        // Probability of a difficulty-1 share in 4096 hashes is about 1e-6
        assert!(found.is_empty());
    }

    #[test]
    fn test_difficulty_change_applies_to_next_comparison() {
        let mut store = JobStore::new();
        let active = store.insert(job("a", true), &session(1));
        let mut search = Search::new(active, 0, 1).unwrap();
        let tracker = accept_all();

        let mut found = Vec::new();
        search.hash_batch(&tracker, &mut found);
        assert_eq!(found.len(), BATCH_SIZE as usize);

        tracker.set(Difficulty::new(1e12).unwrap());
        found.clear();
        search.hash_batch(&tracker, &mut found);
        assert!(found.is_empty());
    }

    #[test]
    fn test_nonce_wrap_rolls_extranonce2_by_stride() {
        let mut store = JobStore::new();
        let active = store.insert(job("a", true), &session(1));
        let mut search = Search::new(active, 1, 4).unwrap();
        search.nonce = u32::MAX - 1;

        let mut found = Vec::new();
        search.hash_batch(&accept_all(), &mut found);

        assert_eq!(found[0].nonce, u32::MAX - 1);
        assert_eq!(found[0].extranonce2.value(), 1);
        assert_eq!(found[1].nonce, u32::MAX);
        assert_eq!(found[2].nonce, 0);
        assert_eq!(found[2].extranonce2.value(), 5);
        assert_ne!(found[0].hash, found[2].hash);
    }

    #[test]
    fn test_forward_stops_at_superseded_generation() {
        let mut store = JobStore::new();
        let watch = store.watch();
        let active = store.insert(job("a", true), &session(1));
        let mut search = Search::new(active, 0, 1).unwrap();

        let mut found = Vec::new();
        search.hash_batch(&accept_all(), &mut found);

        // Clean job arrives between hashing and sending
        store.insert(job("b", true), &session(1));

        let (tx, mut rx) = tokio_mpsc::channel(BATCH_SIZE as usize);
        assert!(forward_shares(&mut found, &watch, &tx));
        assert!(found.is_empty());
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_forward_sends_current_shares() {
        let mut store = JobStore::new();
        let watch = store.watch();
        let active = store.insert(job("a", true), &session(1));
        let mut search = Search::new(active, 0, 1).unwrap();

        let mut found = Vec::new();
        search.hash_batch(&accept_all(), &mut found);

        let (tx, mut rx) = tokio_mpsc::channel(BATCH_SIZE as usize);
        assert!(forward_shares(&mut found, &watch, &tx));
        let mut received = 0;
        while rx.try_recv().is_ok() {
            received += 1;
        }
        assert_eq!(received, BATCH_SIZE);
    }

    #[test]
    fn test_forward_reports_closed_channel() {
        let mut store = JobStore::new();
        let watch = store.watch();
        let active = store.insert(job("a", true), &session(1));
        let mut search = Search::new(active, 0, 1).unwrap();
        let mut found = Vec::new();
        search.hash_batch(&accept_all(), &mut found);

        let (tx, rx) = tokio_mpsc::channel(1);
        drop(rx);
        assert!(!forward_shares(&mut found, &watch, &tx));
    }
}

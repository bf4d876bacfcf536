//! Jobs the miner is allowed to work on and submit against.
//!
//! The store keeps the jobs of the current session, newest last, and stamps
//! each one with a generation number. The generation also lives in a shared
//! atomic that hash threads poll, so a new job or a dropped session stops
//! in-flight searches without any locking.
//!
//! `clean_jobs = true` invalidates everything retained. Otherwise up to
//! [`MAX_RETAINED_JOBS`] older jobs remain valid submission targets, but the
//! engine always mines only the newest.

mod header;
mod merkle;

use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

pub use header::{HEADER_LEN, HeaderTemplate};
pub use merkle::MerkleRootTemplate;

use crate::stratum_v1::{JobNotification, SessionInfo};
use crate::types::TxMerkleNode;

/// Jobs kept alive for late shares when the pool does not set `clean_jobs`.
pub const MAX_RETAINED_JOBS: usize = 8;

/// A job as received, pinned to the session state it arrived under.
///
/// Immutable once created. Parameters of different jobs are never merged;
/// hash threads receive the whole thing behind an `Arc`.
#[derive(Debug, PartialEq)]
pub struct ActiveJob {
    pub job: JobNotification,
    pub generation: u64,
    pub session_id: u64,
    pub extranonce1: Vec<u8>,
    pub extranonce2_size: usize,
}

impl ActiveJob {
    pub fn job_id(&self) -> &str {
        &self.job.job_id
    }

    pub fn merkle_template(&self) -> MerkleRootTemplate {
        MerkleRootTemplate {
            coinbase1: self.job.coinbase1.clone(),
            extranonce1: self.extranonce1.clone(),
            coinbase2: self.job.coinbase2.clone(),
            merkle_branches: self.job.merkle_branches.clone(),
        }
    }

    /// Header for this job with the given merkle root and a zero nonce.
    pub fn header_template(&self, merkle_root: &TxMerkleNode) -> HeaderTemplate {
        HeaderTemplate::new(
            self.job.version,
            &self.job.prev_hash,
            merkle_root,
            self.job.ntime,
            self.job.nbits,
        )
    }
}

/// Read side of the job generation counter, handed to hash threads.
#[derive(Debug, Clone)]
pub struct GenerationWatch(Arc<AtomicU64>);

impl GenerationWatch {
    pub fn current(&self) -> u64 {
        self.0.load(Ordering::Acquire)
    }

    pub fn is_current(&self, generation: u64) -> bool {
        self.current() == generation
    }
}

/// Current and retained jobs for one session.
#[derive(Debug, Default)]
pub struct JobStore {
    /// Oldest first
    jobs: VecDeque<Arc<ActiveJob>>,
    generation: Arc<AtomicU64>,
}

impl JobStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn watch(&self) -> GenerationWatch {
        GenerationWatch(Arc::clone(&self.generation))
    }

    fn bump_generation(&self) -> u64 {
        self.generation.fetch_add(1, Ordering::AcqRel) + 1
    }

    /// Make `job` the newest job and return it with its generation.
    pub fn insert(&mut self, job: JobNotification, session: &SessionInfo) -> Arc<ActiveJob> {
        let generation = self.bump_generation();

        if job.clean_jobs {
            self.jobs.clear();
        } else {
            // A resent job id replaces the earlier copy
            self.jobs.retain(|j| j.job.job_id != job.job_id);
        }

        let active = Arc::new(ActiveJob {
            job,
            generation,
            session_id: session.session_id,
            extranonce1: session.extranonce1.clone(),
            extranonce2_size: session.extranonce2_size,
        });
        self.jobs.push_back(Arc::clone(&active));

        while self.jobs.len() > MAX_RETAINED_JOBS {
            self.jobs.pop_front();
        }

        active
    }

    /// Forget every job and stop in-flight searches.
    pub fn clear(&mut self) {
        self.jobs.clear();
        self.bump_generation();
    }

    /// The job the engine should be mining.
    pub fn current(&self) -> Option<&Arc<ActiveJob>> {
        self.jobs.back()
    }

    pub fn get(&self, job_id: &str) -> Option<&Arc<ActiveJob>> {
        self.jobs.iter().rev().find(|j| j.job.job_id == job_id)
    }

    /// Whether a share found on `job_id` at `generation` may still be submitted.
    pub fn is_live(&self, job_id: &str, generation: u64) -> bool {
        self.get(job_id).is_some_and(|j| j.generation == generation)
    }

    pub fn len(&self) -> usize {
        self.jobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.jobs.is_empty()
    }
}

/// Job fixtures shared by tests across the crate.
#[cfg(test)]
pub(crate) mod fixtures {
    use bitcoin::block::Version;
    use bitcoin::hashes::Hash;
    use bitcoin::pow::CompactTarget;

    use crate::stratum_v1::{JobNotification, SessionInfo};
    use crate::types::{BlockHash, TxMerkleNode};

    pub fn job(job_id: &str, clean_jobs: bool) -> JobNotification {
        JobNotification {
            job_id: job_id.to_string(),
            prev_hash: BlockHash::from_byte_array([0x33; 32]),
            coinbase1: vec![0x01, 0x00, 0x00, 0x00],
            coinbase2: vec![0xff, 0xff, 0xff, 0xff],
            merkle_branches: vec![TxMerkleNode::from_byte_array([0x44; 32])],
            version: Version::from_consensus(0x2000_0000),
            nbits: CompactTarget::from_consensus(0x1d00_ffff),
            ntime: 0x6500_0000,
            clean_jobs,
        }
    }

    pub fn session(session_id: u64) -> SessionInfo {
        SessionInfo {
            session_id,
            subscription_id: Some("sub".to_string()),
            extranonce1: vec![0xf0, 0x0d],
            extranonce2_size: 4,
            authorized: true,
            has_job: false,
        }
    }
}

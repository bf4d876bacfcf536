//! The scheduler connects the pool client to the hash engine.
//!
//! It consumes [`ClientEvent`]s, keeps the job store and share difficulty up
//! to date, points the CPU threads at the newest job, and turns share
//! candidates back into [`ClientCommand::SubmitShare`].
//!
//! # Share Filtering
//!
//! Threads already stop sending once the job generation moves on, but a
//! candidate can still be sitting in the channel when a clean job or a
//! reconnect lands. Before forwarding, the scheduler checks that the
//! candidate's session is the current one and that its job is still live at
//! the generation it was found under. Anything else is counted as stale and
//! dropped.

use std::time::{Duration, Instant};

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::cpu_miner::{CpuMiner, HashThreadError, ShareCandidate};
use crate::job::JobStore;
use crate::stratum_v1::{ClientCommand, ClientEvent, SessionInfo, ShareSubmission};
use crate::tracing::prelude::*;
use crate::types::{Difficulty, DifficultyTracker, HashRate};

const SUMMARY_INTERVAL: Duration = Duration::from_secs(30);

/// Capacity of the channel between hash threads and the scheduler.
const SHARE_CHANNEL_CAPACITY: usize = 256;

/// Owns the mining side of the daemon.
pub struct Scheduler {
    event_rx: mpsc::Receiver<ClientEvent>,
    command_tx: mpsc::Sender<ClientCommand>,
    share_rx: mpsc::Receiver<ShareCandidate>,
    miner: CpuMiner,
    jobs: JobStore,
    difficulty: DifficultyTracker,
    session: SessionInfo,
    stats: MiningStats,
}

impl Scheduler {
    /// Spawn `threads` idle hash threads and wire them to the client channels.
    pub fn new(
        threads: usize,
        event_rx: mpsc::Receiver<ClientEvent>,
        command_tx: mpsc::Sender<ClientCommand>,
    ) -> Result<Self, HashThreadError> {
        let (share_tx, share_rx) = mpsc::channel(SHARE_CHANNEL_CAPACITY);
        let jobs = JobStore::new();
        let difficulty = DifficultyTracker::default();
        let miner = CpuMiner::spawn(threads, share_tx, difficulty.clone(), jobs.watch())?;

        Ok(Self {
            event_rx,
            command_tx,
            share_rx,
            miner,
            jobs,
            difficulty,
            session: SessionInfo::default(),
            stats: MiningStats::default(),
        })
    }

    pub fn stats(&self) -> &MiningStats {
        &self.stats
    }

    /// Run until cancelled or until the client goes away.
    pub async fn run(&mut self, running: CancellationToken) {
        info!(threads = self.miner.thread_count(), "Scheduler started");
        let mut summary = tokio::time::interval(SUMMARY_INTERVAL);
        summary.tick().await;

        loop {
            tokio::select! {
                event = self.event_rx.recv() => {
                    match event {
                        Some(event) => self.handle_event(event),
                        None => {
                            debug!("Client event channel closed");
                            break;
                        }
                    }
                }

                Some(share) = self.share_rx.recv() => {
                    self.handle_share(share).await;
                }

                _ = summary.tick() => {
                    self.stats.log_summary(self.miner.total_hashes(), self.difficulty.get());
                }

                _ = running.cancelled() => {
                    debug!("Scheduler shutdown requested");
                    break;
                }
            }
        }

        self.miner.shutdown();
        self.stats.log_summary(self.miner.total_hashes(), self.difficulty.get());
        debug!("Scheduler shutdown complete");
    }

    fn handle_event(&mut self, event: ClientEvent) {
        match event {
            ClientEvent::Connected { session_id } => {
                debug!(session_id, "Pool connected");
                self.session = SessionInfo {
                    session_id,
                    ..Default::default()
                };
                self.stop_mining();
            }

            ClientEvent::Subscribed {
                session_id,
                extranonce1,
                extranonce2_size,
            } => {
                if !self.is_current_session(session_id) {
                    return;
                }
                info!(
                    session_id,
                    extranonce1 = %hex::encode(&extranonce1),
                    extranonce2_size,
                    "Subscribed"
                );
                self.session.extranonce1 = extranonce1;
                self.session.extranonce2_size = extranonce2_size;
            }

            ClientEvent::Authorized { session_id } => {
                if self.is_current_session(session_id) {
                    info!(session_id, "Authorized");
                    self.session.authorized = true;
                }
            }

            ClientEvent::NewJob { session_id, job } => {
                if !self.is_current_session(session_id) {
                    return;
                }
                let job_id = job.job_id.clone();
                let clean = job.clean_jobs;
                let active = self.jobs.insert(job, &self.session);
                info!(
                    job_id = %job_id,
                    clean_jobs = clean,
                    generation = active.generation,
                    retained = self.jobs.len(),
                    "New job"
                );
                if let Err(e) = self.miner.mine(&active) {
                    error!(error = %e, "Failed to dispatch job");
                }
            }

            ClientEvent::DifficultyChanged(difficulty) => {
                info!(difficulty = %difficulty, "Share difficulty changed");
                self.difficulty.set(difficulty);
            }

            ClientEvent::ExtranonceChanged {
                session_id,
                extranonce1,
                extranonce2_size,
            } => {
                if !self.is_current_session(session_id) {
                    return;
                }
                // Takes effect with the next job
                info!(
                    extranonce1 = %hex::encode(&extranonce1),
                    extranonce2_size,
                    "Extranonce changed"
                );
                self.session.extranonce1 = extranonce1;
                self.session.extranonce2_size = extranonce2_size;
            }

            ClientEvent::ShareAccepted {
                job_id,
                nonce,
                latency,
            } => {
                self.stats.accepted += 1;
                info!(
                    job_id = %job_id,
                    nonce = format!("{:#010x}", nonce),
                    latency_ms = latency.as_millis() as u64,
                    "Share accepted"
                );
            }

            ClientEvent::ShareRejected { job_id, reason } => {
                self.stats.rejected += 1;
                warn!(job_id = %job_id, reason = %reason, "Share rejected");
            }

            ClientEvent::Disconnected { session_id, reason } => {
                warn!(session_id, reason = %reason, "Pool disconnected");
                if self.is_current_session(session_id) {
                    self.session.authorized = false;
                }
                self.stop_mining();
            }

            ClientEvent::Fatal(reason) => {
                error!(reason = %reason, "Pool client gave up");
                self.session.authorized = false;
                self.stop_mining();
            }
        }
    }

    fn is_current_session(&self, session_id: u64) -> bool {
        if session_id == self.session.session_id {
            true
        } else {
            debug!(
                session_id,
                current = self.session.session_id,
                "Ignoring event from old session"
            );
            false
        }
    }

    fn stop_mining(&mut self) {
        self.jobs.clear();
        if let Err(e) = self.miner.idle() {
            error!(error = %e, "Failed to idle hash threads");
        }
    }

    async fn handle_share(&mut self, share: ShareCandidate) {
        self.stats.found += 1;

        if share.session_id != self.session.session_id
            || !self.jobs.is_live(&share.job_id, share.generation)
        {
            self.stats.stale += 1;
            debug!(
                job_id = %share.job_id,
                session_id = share.session_id,
                generation = share.generation,
                "Dropping stale share"
            );
            return;
        }

        debug!(
            job_id = %share.job_id,
            nonce = format!("{:#010x}", share.nonce),
            extranonce2 = %share.extranonce2,
            hash = %share.hash,
            share_difficulty = %Difficulty::from_hash(&share.hash),
            "Share found"
        );

        let submission = ShareSubmission {
            session_id: share.session_id,
            job_id: share.job_id,
            extranonce2: share.extranonce2,
            ntime: share.ntime,
            nonce: share.nonce,
        };
        if self
            .command_tx
            .send(ClientCommand::SubmitShare(submission))
            .await
            .is_err()
        {
            debug!("Client command channel closed, share lost");
            return;
        }
        self.stats.submitted += 1;
    }
}

/// Running share counters.
#[derive(Debug)]
pub struct MiningStats {
    pub found: u64,
    pub submitted: u64,
    pub stale: u64,
    pub accepted: u64,
    pub rejected: u64,
    start_time: Instant,
    last_sample: Instant,
    last_hashes: u64,
}

impl Default for MiningStats {
    fn default() -> Self {
        let now = Instant::now();
        Self {
            found: 0,
            submitted: 0,
            stale: 0,
            accepted: 0,
            rejected: 0,
            start_time: now,
            last_sample: now,
            last_hashes: 0,
        }
    }
}

impl MiningStats {
    fn log_summary(&mut self, total_hashes: u64, difficulty: Difficulty) {
        let now = Instant::now();
        let hashrate = HashRate::measured(
            total_hashes.saturating_sub(self.last_hashes),
            now.duration_since(self.last_sample),
        );
        self.last_hashes = total_hashes;
        self.last_sample = now;

        info!(
            uptime_s = self.start_time.elapsed().as_secs(),
            hashrate = %hashrate,
            difficulty = %difficulty,
            found = self.found,
            submitted = self.submitted,
            accepted = self.accepted,
            rejected = self.rejected,
            stale = self.stale,
            "Mining statistics"
        );

        if let Some(interval) = hashrate.expected_share_interval(difficulty.as_f64()) {
            debug!(
                expected_share_interval_s = interval.as_secs(),
                "Expected time between shares"
            );
        }
    }
}

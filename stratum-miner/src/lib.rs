//! Stratum v1 pool client with a CPU SHA-256d share search.
//!
//! The [`stratum_v1`] client keeps a session with the pool alive and turns
//! the protocol into events. The [`scheduler`] feeds those jobs to the
//! [`cpu_miner`] threads and hands the shares they find back to the client
//! for submission.

pub mod config;
pub mod cpu_miner;
pub mod daemon;
pub mod job;
pub mod scheduler;
pub mod stratum_v1;
pub mod tracing;
pub mod types;
pub mod u256;

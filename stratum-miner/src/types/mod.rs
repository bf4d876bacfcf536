//! Core types for stratum-miner.
//!
//! Mining-specific value types plus re-exports of the rust-bitcoin types the
//! rest of the crate works with.

mod difficulty;
mod extranonce2;
mod hash_rate;

pub use bitcoin::{BlockHash, Target, TxMerkleNode};
pub use difficulty::{Difficulty, DifficultyTracker};
pub use extranonce2::{Extranonce2, Extranonce2Error};
pub use hash_rate::HashRate;

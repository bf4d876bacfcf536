//! Coinbase assembly and merkle root computation.

use bitcoin::hash_types::TxMerkleNode;
use bitcoin::hashes::{Hash, sha256d};

use crate::types::Extranonce2;

/// Everything needed to turn an extranonce2 into a merkle root.
///
/// The pool splits the coinbase transaction around the extranonces, so the
/// miner can vary extranonce2 to get a fresh merkle root (and with it a fresh
/// 2^32 nonce space) without knowing anything about the transaction format.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MerkleRootTemplate {
    /// Coinbase bytes before the extranonces.
    pub coinbase1: Vec<u8>,

    /// Extranonce1 assigned by the pool for this session.
    pub extranonce1: Vec<u8>,

    /// Coinbase bytes after the extranonces.
    pub coinbase2: Vec<u8>,

    /// Sibling hashes from the coinbase up to the root, in folding order.
    pub merkle_branches: Vec<TxMerkleNode>,
}

impl MerkleRootTemplate {
    /// Serialized coinbase: `coinbase1 ‖ extranonce1 ‖ extranonce2 ‖ coinbase2`.
    pub fn coinbase(&self, extranonce2: &Extranonce2) -> Vec<u8> {
        let mut coinbase = Vec::with_capacity(
            self.coinbase1.len() + self.extranonce1.len() + extranonce2.size() + self.coinbase2.len(),
        );
        coinbase.extend_from_slice(&self.coinbase1);
        coinbase.extend_from_slice(&self.extranonce1);
        extranonce2.extend_vec(&mut coinbase);
        coinbase.extend_from_slice(&self.coinbase2);
        coinbase
    }

    /// Merkle root for a specific extranonce2.
    ///
    /// The coinbase is hashed as raw bytes rather than parsed as a
    /// transaction, so pools that hand out non-standard coinbases still
    /// work. Each step of the climb is `sha256d(running ‖ branch)`.
    pub fn compute_merkle_root(&self, extranonce2: &Extranonce2) -> TxMerkleNode {
        let mut current = sha256d::Hash::hash(&self.coinbase(extranonce2)).to_byte_array();

        let mut pair = [0u8; 64];
        for branch in &self.merkle_branches {
            pair[..32].copy_from_slice(&current);
            pair[32..].copy_from_slice(branch.as_byte_array());
            current = sha256d::Hash::hash(&pair).to_byte_array();
        }

        TxMerkleNode::from_byte_array(current)
    }
}

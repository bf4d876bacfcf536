//! Serialized 80-byte block header with a mutable nonce.

use bitcoin::block::Version;
use bitcoin::hashes::{Hash, sha256d};
use bitcoin::pow::CompactTarget;
use bitcoin::{BlockHash, TxMerkleNode};

/// Length of a serialized block header.
pub const HEADER_LEN: usize = 80;

const NONCE_OFFSET: usize = 76;

/// Block header bytes ready for hashing.
///
/// Layout, all integers little-endian and hashes in internal byte order:
///
/// ```text
/// 0..4    version
/// 4..36   previous block hash
/// 36..68  merkle root
/// 68..72  ntime
/// 72..76  nbits
/// 76..80  nonce
/// ```
///
/// The hot loop only ever rewrites the nonce, so the header is kept
/// serialized instead of going through [`bitcoin::block::Header`] per hash.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HeaderTemplate {
    bytes: [u8; HEADER_LEN],
}

impl HeaderTemplate {
    pub fn new(
        version: Version,
        prev_hash: &BlockHash,
        merkle_root: &TxMerkleNode,
        ntime: u32,
        nbits: CompactTarget,
    ) -> Self {
        let mut bytes = [0u8; HEADER_LEN];
        bytes[0..4].copy_from_slice(&version.to_consensus().to_le_bytes());
        bytes[4..36].copy_from_slice(prev_hash.as_byte_array());
        bytes[36..68].copy_from_slice(merkle_root.as_byte_array());
        bytes[68..72].copy_from_slice(&ntime.to_le_bytes());
        bytes[72..76].copy_from_slice(&nbits.to_consensus().to_le_bytes());
        Self { bytes }
    }

    /// Overwrite the nonce field, leaving bytes 0..76 untouched.
    pub fn set_nonce(&mut self, nonce: u32) {
        self.bytes[NONCE_OFFSET..].copy_from_slice(&nonce.to_le_bytes());
    }

    pub fn bytes(&self) -> &[u8; HEADER_LEN] {
        &self.bytes
    }

    /// Raw double SHA-256 of the header, internal byte order.
    pub fn hash_bytes(&self) -> [u8; 32] {
        sha256d::Hash::hash(&self.bytes).to_byte_array()
    }

    pub fn hash(&self) -> BlockHash {
        BlockHash::from_byte_array(self.hash_bytes())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bitcoin::Network;
    use bitcoin::block::Header;
    use bitcoin::blockdata::constants::genesis_block;
    use bitcoin::consensus::serialize;

    fn from_header(header: &Header) -> HeaderTemplate {
        let mut template = HeaderTemplate::new(
            header.version,
            &header.prev_blockhash,
            &header.merkle_root,
            header.time,
            header.bits,
        );
        template.set_nonce(header.nonce);
        template
    }

    #[test]
    fn test_genesis_header() {
        let genesis = genesis_block(Network::Bitcoin);
        let template = from_header(&genesis.header);

        assert_eq!(template.bytes().len(), HEADER_LEN);
        assert_eq!(template.bytes().to_vec(), serialize(&genesis.header));
        assert_eq!(template.hash(), genesis.block_hash());
        assert_eq!(
            template.hash().to_string(),
            "000000000019d6689c085ae165831e934ff763ae46a2a6c172b3f1b60a8ce26f"
        );
    }

    #[test]
    fn test_matches_consensus_encoding() {
        let header = Header {
            version: Version::from_consensus(0x2000_0004),
            prev_blockhash: BlockHash::from_byte_array([0x11; 32]),
            merkle_root: TxMerkleNode::from_byte_array([0x22; 32]),
            time: 0x6543_2100,
            bits: CompactTarget::from_consensus(0x1703_4219),
            nonce: 0xcafe_f00d,
        };

        let template = from_header(&header);
        assert_eq!(template.bytes().to_vec(), serialize(&header));
        assert_eq!(template.hash(), header.block_hash());
        assert_eq!(template.bytes()[NONCE_OFFSET..], 0xcafe_f00d_u32.to_le_bytes());
    }

    #[test]
    fn test_set_nonce_touches_only_nonce() {
        let genesis = genesis_block(Network::Bitcoin);
        let mut template = from_header(&genesis.header);
        let before = *template.bytes();

        template.set_nonce(0x0403_0201);

        assert_eq!(template.bytes()[..NONCE_OFFSET], before[..NONCE_OFFSET]);
        assert_eq!(template.bytes()[NONCE_OFFSET..], [0x01, 0x02, 0x03, 0x04]);
        assert_ne!(template.hash(), genesis.block_hash());
    }
}

//! Extranonce2: the miner-chosen segment of the coinbase transaction.
//!
//! The pool fixes extranonce2's width in the subscribe response (typically
//! 4 to 8 bytes). Each value yields a different coinbase, therefore a
//! different merkle root and a fresh 2^32 nonce space. Hash threads roll it
//! every time the header nonce wraps.

use std::fmt;

use thiserror::Error;

/// Extranonce2 counter serialized as `size` little-endian bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Extranonce2 {
    value: u64,
    size: u8,
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum Extranonce2Error {
    #[error("Invalid extranonce2 size: {0} (must be 1-8 bytes)")]
    InvalidSize(usize),

    #[error("Extranonce2 value {value:#x} does not fit in {size} bytes")]
    ValueTooLarge { value: u64, size: u8 },
}

impl Extranonce2 {
    /// Widest extranonce2 a 64-bit counter can cover.
    pub const MAX_SIZE: usize = 8;

    /// Create an extranonce2 of `size_bytes` holding `value`.
    pub fn new(value: u64, size_bytes: usize) -> Result<Self, Extranonce2Error> {
        if size_bytes == 0 || size_bytes > Self::MAX_SIZE {
            return Err(Extranonce2Error::InvalidSize(size_bytes));
        }
        let ext = Self {
            value: 0,
            size: size_bytes as u8,
        };
        if value > ext.max_value() {
            return Err(Extranonce2Error::ValueTooLarge {
                value,
                size: ext.size,
            });
        }
        Ok(Self { value, ..ext })
    }

    pub fn value(&self) -> u64 {
        self.value
    }

    /// Width in bytes.
    pub fn size(&self) -> usize {
        self.size as usize
    }

    /// Advance by `step`, wrapping modulo the search space.
    ///
    /// Returns `false` when the value wrapped past its maximum, meaning this
    /// thread has covered its whole slice of the extranonce2 space.
    pub fn advance(&mut self, step: u64) -> bool {
        let max = self.max_value();
        let room = max - self.value;
        if step <= room {
            self.value += step;
            true
        } else {
            // (value + step) mod (max + 1), without overflowing u64
            self.value = step - room - 1;
            if self.size < 8 {
                self.value %= max + 1;
            }
            false
        }
    }

    pub fn max_value(&self) -> u64 {
        if self.size >= 8 {
            u64::MAX
        } else {
            (1u64 << (self.size * 8)) - 1
        }
    }

    /// Append the little-endian serialization used inside the coinbase.
    pub fn extend_vec(&self, vec: &mut Vec<u8>) {
        vec.extend_from_slice(&self.value.to_le_bytes()[..self.size as usize]);
    }

    /// Hex string as sent in `mining.submit` (coinbase byte order).
    pub fn to_hex(&self) -> String {
        hex::encode(Vec::from(*self))
    }
}

impl From<Extranonce2> for Vec<u8> {
    fn from(ext: Extranonce2) -> Vec<u8> {
        ext.value.to_le_bytes()[..ext.size as usize].to_vec()
    }
}

impl fmt::Display for Extranonce2 {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

//! Share difficulty and the tracker that publishes it to hash threads.

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use bitcoin::hash_types::BlockHash;
use bitcoin::hashes::Hash;
use bitcoin::pow::Target;

use crate::u256::U256;

/// Below this the target no longer fits in 256 bits.
const MIN_BOUNDED_DIFFICULTY: f64 = 1.0 / (1u64 << 33) as f64;

/// Pool share difficulty.
///
/// Pools send difficulty as a JSON number, which may be fractional (NiceHash
/// and most altcoin pools routinely go below 1). A hash is a valid share if,
/// read as a little-endian 256-bit integer, it does not exceed:
///
/// ```text
/// target = MAX_TARGET / difficulty
/// MAX_TARGET = 0x00000000ffff0000000000000000000000000000000000000000000000000000
/// ```
///
/// Higher difficulty gives a smaller target, so fewer hashes qualify.
#[derive(Debug, Clone, Copy, PartialEq, PartialOrd)]
pub struct Difficulty(f64);

impl Difficulty {
    /// Difficulty 1, whose target is `MAX_TARGET`.
    pub const ONE: Self = Self(1.0);

    /// Create a difficulty, rejecting zero, negative, and non-finite values.
    pub fn new(value: f64) -> Option<Self> {
        (value.is_finite() && value > 0.0).then_some(Self(value))
    }

    pub fn as_f64(self) -> f64 {
        self.0
    }

    /// Share target as a 256-bit integer: the exact floor of
    /// `MAX_TARGET / difficulty`.
    ///
    /// The difficulty is split into `mantissa * 2^exponent`, so the division
    /// is by an integer followed by a shift. Targets wider than 256 bits
    /// saturate to [`U256::MAX`], accepting every hash.
    pub fn to_target_u256(self) -> U256 {
        if self.0 < MIN_BOUNDED_DIFFICULTY {
            return U256::MAX;
        }

        let (mantissa, exponent) = split_f64(self.0);
        let (quotient, remainder) = U256::from(Target::MAX).div_rem_u64(mantissa);

        if exponent >= 0 {
            return quotient >> exponent as u32;
        }

        // MAX_TARGET * 2^shift / mantissa, carrying the remainder's share
        let shift = exponent.unsigned_abs();
        let fraction = (U256::from(remainder) << shift).div_u64(mantissa);
        quotient.saturating_shl(shift).saturating_add(fraction)
    }

    /// Difficulty actually achieved by a block hash (`MAX_TARGET / hash`).
    ///
    /// Used for logging how lucky a share was.
    pub fn from_hash(hash: &BlockHash) -> Self {
        let hash = u256_to_f64(U256::from_le_bytes(hash.to_byte_array()));
        if hash == 0.0 {
            return Self(f64::MAX);
        }
        Self(u256_to_f64(U256::from(Target::MAX)) / hash)
    }
}

impl Default for Difficulty {
    fn default() -> Self {
        Self::ONE
    }
}

/// Split a positive normal float into an odd mantissa and a binary exponent.
fn split_f64(value: f64) -> (u64, i32) {
    let bits = value.to_bits();
    let exponent = ((bits >> 52) & 0x7ff) as i32 - 1075;
    let mantissa = (bits & ((1u64 << 52) - 1)) | (1u64 << 52);
    let zeros = mantissa.trailing_zeros();
    (mantissa >> zeros, exponent + zeros as i32)
}

fn u256_to_f64(value: U256) -> f64 {
    value.high as f64 * 2f64.powi(128) + value.low as f64
}

impl fmt::Display for Difficulty {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let value = self.0;

        if value < 1.0 {
            return write!(f, "{}", value);
        }

        let (scaled, suffix) = if value >= 1e15 {
            (value / 1e15, "P")
        } else if value >= 1e12 {
            (value / 1e12, "T")
        } else if value >= 1e9 {
            (value / 1e9, "G")
        } else if value >= 1e6 {
            (value / 1e6, "M")
        } else if value >= 1e3 {
            (value / 1e3, "K")
        } else {
            (value, "")
        };

        if scaled >= 100.0 {
            write!(f, "{:.0}{}", scaled, suffix)
        } else if scaled >= 10.0 {
            write!(f, "{:.1}{}", scaled, suffix)
        } else {
            write!(f, "{:.2}{}", scaled, suffix)
        }
    }
}

/// Current share difficulty, shared between the scheduler and hash threads.
///
/// The scheduler writes it on `mining.set_difficulty`; hash threads read it
/// before every comparison. Updates only affect comparisons made after the
/// store, never ones already evaluated.
#[derive(Debug, Clone)]
pub struct DifficultyTracker {
    bits: Arc<AtomicU64>,
}

impl DifficultyTracker {
    pub fn new(initial: Difficulty) -> Self {
        Self {
            bits: Arc::new(AtomicU64::new(initial.0.to_bits())),
        }
    }

    /// Replace the stored difficulty.
    pub fn set(&self, difficulty: Difficulty) {
        self.bits.store(difficulty.0.to_bits(), Ordering::Release);
    }

    pub fn get(&self) -> Difficulty {
        Difficulty(f64::from_bits(self.raw()))
    }

    /// Raw bit pattern of the stored value, for cheap change detection.
    pub fn raw(&self) -> u64 {
        self.bits.load(Ordering::Acquire)
    }
}

impl Default for DifficultyTracker {
    fn default() -> Self {
        Self::new(Difficulty::ONE)
    }
}

//! 256-bit unsigned integer for share target arithmetic.
//!
//! Covers exactly what the difficulty-to-target conversion and the hash
//! comparison need: byte conversion, ordering, shifts, saturating addition,
//! and long division by a 64-bit divisor.

use std::cmp::Ordering;
use std::fmt;
use std::ops::{Div, Shl, Shr};

use bitcoin::pow::Target;

/// A 256-bit unsigned integer stored as two 128-bit limbs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct U256 {
    /// Low 128 bits
    pub low: u128,
    /// High 128 bits
    pub high: u128,
}

impl U256 {
    pub const ZERO: Self = Self { low: 0, high: 0 };
    pub const MAX: Self = Self {
        low: u128::MAX,
        high: u128::MAX,
    };

    /// Create from little-endian bytes.
    ///
    /// Block hashes come out of SHA-256d in this order, so a hash can be
    /// compared against a target without reversing anything.
    pub fn from_le_bytes(bytes: [u8; 32]) -> Self {
        let mut low = [0u8; 16];
        let mut high = [0u8; 16];
        low.copy_from_slice(&bytes[0..16]);
        high.copy_from_slice(&bytes[16..32]);
        Self {
            low: u128::from_le_bytes(low),
            high: u128::from_le_bytes(high),
        }
    }

    /// Convert to little-endian bytes.
    pub fn to_le_bytes(self) -> [u8; 32] {
        let mut bytes = [0u8; 32];
        bytes[0..16].copy_from_slice(&self.low.to_le_bytes());
        bytes[16..32].copy_from_slice(&self.high.to_le_bytes());
        bytes
    }

    /// Number of significant bits.
    pub fn bits(&self) -> u32 {
        if self.high != 0 {
            256 - self.high.leading_zeros()
        } else {
            128 - self.low.leading_zeros()
        }
    }

    /// Divide by a u64 value.
    ///
    /// Long division over four 64-bit limbs, most significant first.
    ///
    /// # Panics
    ///
    /// Panics if `divisor` is zero.
    pub fn div_u64(self, divisor: u64) -> Self {
        self.div_rem_u64(divisor).0
    }

    /// Quotient and remainder of division by a u64 value.
    ///
    /// # Panics
    ///
    /// Panics if `divisor` is zero.
    pub fn div_rem_u64(self, divisor: u64) -> (Self, u64) {
        assert!(divisor != 0, "U256 division by zero");

        if divisor == 1 {
            return (self, 0);
        }

        if self.high == 0 {
            let quotient = Self {
                low: self.low / divisor as u128,
                high: 0,
            };
            return (quotient, (self.low % divisor as u128) as u64);
        }

        let divisor = divisor as u128;
        let limbs = [
            (self.high >> 64) as u64,
            self.high as u64,
            (self.low >> 64) as u64,
            self.low as u64,
        ];

        let mut remainder: u128 = 0;
        let mut result = [0u64; 4];
        for (i, &limb) in limbs.iter().enumerate() {
            remainder = (remainder << 64) | limb as u128;
            result[i] = (remainder / divisor) as u64;
            remainder %= divisor;
        }

        let quotient = Self {
            high: ((result[0] as u128) << 64) | result[1] as u128,
            low: ((result[2] as u128) << 64) | result[3] as u128,
        };
        (quotient, remainder as u64)
    }

    /// Add, saturating to [`U256::MAX`] on overflow.
    pub fn saturating_add(self, rhs: Self) -> Self {
        let (low, carry) = self.low.overflowing_add(rhs.low);
        let high = self
            .high
            .checked_add(rhs.high)
            .and_then(|high| high.checked_add(carry as u128));
        match high {
            Some(high) => Self { low, high },
            None => Self::MAX,
        }
    }

    /// Shift left, saturating to [`U256::MAX`] if any set bit would be lost.
    pub fn saturating_shl(self, shift: u32) -> Self {
        if shift == 0 || self == Self::ZERO {
            return self;
        }
        if self.bits() + shift > 256 {
            return Self::MAX;
        }
        self << shift
    }
}

impl Ord for U256 {
    fn cmp(&self, other: &Self) -> Ordering {
        self.high
            .cmp(&other.high)
            .then_with(|| self.low.cmp(&other.low))
    }
}

impl PartialOrd for U256 {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Div<u64> for U256 {
    type Output = Self;

    fn div(self, rhs: u64) -> Self::Output {
        self.div_u64(rhs)
    }
}

impl Shl<u32> for U256 {
    type Output = Self;

    /// Logical shift left; bits shifted past bit 255 are discarded.
    fn shl(self, shift: u32) -> Self::Output {
        match shift {
            0 => self,
            1..=127 => Self {
                high: (self.high << shift) | (self.low >> (128 - shift)),
                low: self.low << shift,
            },
            128..=255 => Self {
                high: self.low << (shift - 128),
                low: 0,
            },
            _ => Self::ZERO,
        }
    }
}

impl Shr<u32> for U256 {
    type Output = Self;

    /// Logical shift right.
    fn shr(self, shift: u32) -> Self::Output {
        match shift {
            0 => self,
            1..=127 => Self {
                high: self.high >> shift,
                low: (self.low >> shift) | (self.high << (128 - shift)),
            },
            128..=255 => Self {
                high: 0,
                low: self.high >> (shift - 128),
            },
            _ => Self::ZERO,
        }
    }
}

impl From<u64> for U256 {
    fn from(value: u64) -> Self {
        Self {
            low: value as u128,
            high: 0,
        }
    }
}

impl From<Target> for U256 {
    fn from(target: Target) -> Self {
        Self::from_le_bytes(target.to_le_bytes())
    }
}

impl From<U256> for Target {
    fn from(value: U256) -> Self {
        Target::from_le_bytes(value.to_le_bytes())
    }
}

impl fmt::LowerHex for U256 {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:032x}{:032x}", self.high, self.low)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_to_bytes() {
        let mut bytes = [0u8; 32];
        for (i, b) in bytes.iter_mut().enumerate() {
            *b = i as u8;
        }
        let u = U256::from_le_bytes(bytes);
        assert_eq!(u.to_le_bytes(), bytes);
        assert_eq!(u.high >> 120, 31);
    }

    #[test]
    fn test_div_simple() {
        let u = U256 { low: 100, high: 0 };
        assert_eq!(u / 10, U256 { low: 10, high: 0 });
    }

    #[test]
    fn test_div_with_high_bits() {
        let u = U256 { low: 0, high: 100 };
        assert_eq!(u / 10, U256 { low: 0, high: 10 });

        // Remainder from the high limb carries into the low limb
        let u = U256 { low: 0, high: 1 };
        assert_eq!(
            u / 2,
            U256 {
                low: 1u128 << 127,
                high: 0
            }
        );
    }

    #[test]
    fn test_div_by_one() {
        let u = U256 {
            low: 12345,
            high: 67890,
        };
        assert_eq!(u / 1, u);
    }

    #[test]
    fn test_shl_across_limbs() {
        let u = U256::from(1u64);
        assert_eq!(u << 128, U256 { low: 0, high: 1 });
        assert_eq!(
            U256 {
                low: u128::MAX,
                high: 0
            } << 4,
            U256 {
                low: u128::MAX << 4,
                high: 0xf
            }
        );
        assert_eq!(u << 256, U256::ZERO);
    }

    #[test]
    fn test_saturating_shl() {
        let u = U256 { low: 0, high: 1 << 100 };
        assert_eq!(u.saturating_shl(27), u << 27);
        assert_eq!(u.saturating_shl(28), U256::MAX);
        assert_eq!(U256::ZERO.saturating_shl(300), U256::ZERO);
    }

    #[test]
    fn test_div_rem_remainder() {
        let u = U256 {
            low: 7,
            high: 1,
        };
        // 2^128 is 1 mod 3, so 2^128 + 7 is 2 mod 3
        let (_, r) = u.div_rem_u64(3);
        assert_eq!(r, 2);

        let (q, r) = U256::from(100).div_rem_u64(7);
        assert_eq!((q, r), (U256::from(14), 2));
    }

    #[test]
    fn test_shr_across_limbs() {
        let u = U256 { low: 0, high: 1 };
        assert_eq!(u >> 1, U256 { low: 1 << 127, high: 0 });
        assert_eq!(u >> 128, U256::from(1));
        assert_eq!(u >> 129, U256::ZERO);
        assert_eq!(U256::MAX >> 256, U256::ZERO);
    }

    #[test]
    fn test_saturating_add_carries_and_saturates() {
        let a = U256 {
            low: u128::MAX,
            high: 0,
        };
        assert_eq!(a.saturating_add(U256::from(1)), U256 { low: 0, high: 1 });
        assert_eq!(U256::MAX.saturating_add(U256::from(1)), U256::MAX);
    }

    #[test]
    fn test_ordering_compares_high_limb_first() {
        let small = U256 {
            low: u128::MAX,
            high: 0,
        };
        let large = U256 { low: 0, high: 1 };
        assert!(small < large);
        assert!(U256::MAX > large);
    }

    #[test]
    fn test_target_conversion() {
        let max = U256::from(Target::MAX);
        assert_eq!(max, U256 { low: 0, high: 0xffffu128 << 80 });
        assert_eq!(Target::from(max), Target::MAX);
    }
}

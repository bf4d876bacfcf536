//! Hashrate measurement type.

use std::fmt;
use std::time::Duration;

/// Hashes per second.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default)]
pub struct HashRate(pub u64);

impl HashRate {
    /// Rate observed for `hashes` computed over `elapsed`.
    pub fn measured(hashes: u64, elapsed: Duration) -> Self {
        let secs = elapsed.as_secs_f64();
        if secs <= 0.0 {
            return Self(0);
        }
        Self((hashes as f64 / secs) as u64)
    }

    /// Expected seconds to find one share at `difficulty` (`diff * 2^32 / rate`).
    pub fn expected_share_interval(&self, difficulty: f64) -> Option<Duration> {
        if self.0 == 0 {
            return None;
        }
        let hashes_per_share = difficulty * (u32::MAX as f64 + 1.0);
        Duration::try_from_secs_f64(hashes_per_share / self.0 as f64).ok()
    }
}

impl std::ops::Add for HashRate {
    type Output = Self;

    fn add(self, rhs: Self) -> Self {
        Self(self.0.saturating_add(rhs.0))
    }
}

impl fmt::Display for HashRate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let rate = self.0 as f64;
        if rate >= 1e9 {
            write!(f, "{:.2} GH/s", rate / 1e9)
        } else if rate >= 1e6 {
            write!(f, "{:.2} MH/s", rate / 1e6)
        } else if rate >= 1e3 {
            write!(f, "{:.2} KH/s", rate / 1e3)
        } else {
            write!(f, "{} H/s", self.0)
        }
    }
}

//! Virtual time for the simulation kernel.
//!
//! Simulated seconds stored as an `f64`. Time only moves when maestro
//! advances the clock to the next instant reported by the resource model
//! or by a kernel timer; nothing here ever looks at the wall clock.

use std::cmp::Ordering;

/// A point on the simulated timeline, in seconds.
///
/// Construction rejects `NaN`, so the total order used by the timeline
/// heap and by `Ord` agrees with the numeric order.
#[derive(Debug, Clone, Copy, PartialEq, PartialOrd, Default)]
#[cfg_attr(feature = "serialize", derive(serde::Serialize, serde::Deserialize))]
pub struct VirtualTime(f64);

impl VirtualTime {
    /// The zero-point of simulation time.
    pub const ZERO: VirtualTime = VirtualTime(0.0);

    /// Create a new `VirtualTime` from a number of simulated seconds.
    ///
    /// # Panics
    /// Panics if `secs` is `NaN`.
    #[inline]
    pub fn new(secs: f64) -> Self {
        assert!(!secs.is_nan(), "virtual time cannot be NaN");
        VirtualTime(secs)
    }

    /// Return the raw number of seconds.
    #[inline]
    pub fn secs(self) -> f64 {
        self.0
    }

    /// Advance time by `delta` seconds.
    /// Returns `None` when `delta` is negative, `NaN` or infinite.
    #[inline]
    pub fn advance(self, delta: f64) -> Option<VirtualTime> {
        if delta.is_finite() && delta >= 0.0 {
            Some(VirtualTime(self.0 + delta))
        } else {
            None
        }
    }

    /// Alias for `advance`, reads better where a deadline is computed.
    #[inline]
    pub fn plus(self, delay: f64) -> Option<VirtualTime> {
        self.advance(delay)
    }

    /// Returns `true` if `self` is strictly before `other`.
    #[inline]
    pub fn is_before(self, other: VirtualTime) -> bool {
        self.0 < other.0
    }

    /// Seconds elapsed between `earlier` and `self`.
    /// Returns `None` if `earlier` is after `self`.
    #[inline]
    pub fn duration_since(self, earlier: VirtualTime) -> Option<f64> {
        if earlier.0 <= self.0 {
            Some(self.0 - earlier.0)
        } else {
            None
        }
    }

    /// The earlier of two instants.
    #[inline]
    pub fn min(self, other: VirtualTime) -> VirtualTime {
        if other.0 < self.0 {
            other
        } else {
            self
        }
    }

    /// Bit pattern used when hashing a change log.
    #[inline]
    pub fn to_bits(self) -> u64 {
        self.0.to_bits()
    }
}

impl Eq for VirtualTime {}

impl Ord for VirtualTime {
    fn cmp(&self, other: &Self) -> Ordering {
        self.0.total_cmp(&other.0)
    }
}

impl std::fmt::Display for VirtualTime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "T={}", self.0)
    }
}

//! Seeded randomness for model perturbations.

/// SplitMix64 deterministic PRNG.
///
/// Produces identical sequences for a given seed across all platforms,
/// so a jittered model stays reproducible run after run.
#[derive(Debug, Clone)]
pub struct DeterministicRng {
    state: u64,
}

impl DeterministicRng {
    pub fn new(seed: u64) -> Self {
        DeterministicRng { state: seed }
    }

    pub fn next_u64(&mut self) -> u64 {
        self.state = self.state.wrapping_add(0x9e3779b97f4a7c15);
        let mut z = self.state;
        z = (z ^ (z >> 30)).wrapping_mul(0xbf58476d1ce4e5b9);
        z = (z ^ (z >> 27)).wrapping_mul(0x94d049bb133111eb);
        z ^ (z >> 31)
    }

    /// Uniform f64 in [0.0, 1.0).
    pub fn next_f64(&mut self) -> f64 {
        (self.next_u64() >> 11) as f64 / (1u64 << 53) as f64
    }

    /// Uniform f64 in [0.0, max). Returns 0 for a non-positive `max`.
    pub fn next_below(&mut self, max: f64) -> f64 {
        if max > 0.0 {
            self.next_f64() * max
        } else {
            0.0
        }
    }

    /// Current internal state.
    pub fn state(&self) -> u64 {
        self.state
    }
}

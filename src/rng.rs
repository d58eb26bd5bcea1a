//! Deterministic `RomuDuoJr` generator backing the guest's `rdrand`
//!
//! Reference: <https://www.romu-random.org/code.c>
//!
//! The state is always derived from the configured seed through Lehmer64 so that a
//! testcase replayed after a restore sees the exact same `rdrand` stream.

/// `RomuDuoJr` pseudo random number generator
#[derive(Debug, Clone)]
pub struct Rng {
    /// Internal x state
    xstate: u64,

    /// Internal y state
    ystate: u64,
}

impl Rng {
    /// Create an [`Rng`] seeded with the given seed value
    #[must_use]
    pub fn from_seed(seed: u64) -> Rng {
        let mut lehmer64 = Lehmer64::from_seed(u128::from(seed));

        // Lehmer64 stays at zero forever from a zero seed
        if seed == 0 {
            lehmer64.value = 0x5eed_u128;
        }

        let mut res = Rng {
            xstate: lehmer64.rand_u64(),
            ystate: lehmer64.rand_u64(),
        };

        // Cycle through to create some chaos
        for _ in 0..92 {
            let _ = res.next();
        }

        res
    }

    /// Rewind the generator to the state `from_seed(seed)` would produce
    pub fn reseed(&mut self, seed: u64) {
        *self = Rng::from_seed(seed);
    }

    /// Get the next random number
    #[allow(clippy::should_implement_trait)]
    pub fn next(&mut self) -> u64 {
        let xp = self.xstate;
        self.xstate = 15_241_094_284_759_029_579_u64.wrapping_mul(self.ystate);
        self.ystate = self.ystate.wrapping_sub(xp);
        self.ystate = self.ystate.rotate_left(27);
        xp
    }
}

/// Lehmer64 generator only used to expand a seed into the [`Rng`] state
struct Lehmer64 {
    /// Internal state
    value: u128,
}

impl Lehmer64 {
    /// Create a [`Lehmer64`] seeded with the given seed value
    fn from_seed(seed: u128) -> Lehmer64 {
        Lehmer64 { value: seed }
    }

    /// Get the next random number
    #[allow(clippy::cast_possible_truncation)]
    fn rand_u64(&mut self) -> u64 {
        self.value = self.value.wrapping_mul(0xda94_2042_e4dd_58b5);
        (self.value >> 64) as u64
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn same_seed_same_stream() {
        let mut a = Rng::from_seed(0x1337);
        let mut b = Rng::from_seed(0x1337);
        for _ in 0..64 {
            assert_eq!(a.next(), b.next());
        }
    }

    #[test]
    fn reseed_rewinds() {
        let mut rng = Rng::from_seed(7);
        let first: Vec<u64> = (0..8).map(|_| rng.next()).collect();
        rng.reseed(7);
        let second: Vec<u64> = (0..8).map(|_| rng.next()).collect();
        assert_eq!(first, second);
    }

    #[test]
    fn zero_seed_is_not_degenerate() {
        let mut rng = Rng::from_seed(0);
        let vals: Vec<u64> = (0..4).map(|_| rng.next()).collect();
        assert!(vals.iter().any(|v| *v != 0));
        assert_ne!(vals[0], vals[1]);
    }

    #[test]
    fn different_seeds_diverge() {
        let mut a = Rng::from_seed(1);
        let mut b = Rng::from_seed(2);
        assert_ne!(a.next(), b.next());
    }
}

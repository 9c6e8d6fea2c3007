//! Randomized election deadlines
//!
//! Each node owns an independently seeded RNG so that runs with a fixed
//! seed are reproducible and nodes never share random state.

use std::time::{Duration, Instant};

use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};

use super::NodeId;

/// Produces election deadlines in `[base, base + jitter)`
#[derive(Debug)]
pub struct ElectionTimer {
    base: Duration,
    jitter: Duration,
    rng: SmallRng,
}

impl ElectionTimer {
    /// Create a timer for `node`
    ///
    /// With a seed, the node's stream is derived from (seed, node) so nodes
    /// in the same cluster still draw different timeouts.
    pub fn new(node: NodeId, base: Duration, jitter: Duration, seed: Option<u64>) -> Self {
        let rng = match seed {
            Some(seed) => SmallRng::seed_from_u64(
                seed ^ (node as u64 + 1).wrapping_mul(0x9E37_79B9_7F4A_7C15),
            ),
            None => SmallRng::from_entropy(),
        };
        Self { base, jitter, rng }
    }

    /// Draw a fresh timeout
    pub fn next_timeout(&mut self) -> Duration {
        let jitter_ms = self.jitter.as_millis() as u64;
        let extra = if jitter_ms == 0 {
            0
        } else {
            self.rng.gen_range(0..jitter_ms)
        };
        self.base + Duration::from_millis(extra)
    }

    /// Deadline measured from `now`
    pub fn next_deadline(&mut self, now: Instant) -> Instant {
        now + self.next_timeout()
    }
}

//! Injectable fault behavior.

use rand::{rngs::StdRng, Rng, SeedableRng};
use simbft_transport::NodeId;

/// Decides whether a replica misbehaves for a given message.
///
/// Injected into the replica so tests can pin behavior; implementations must
/// be seeded for reproducibility.
pub trait DropPolicy: Send + 'static {
    /// Whether `replica` should drop a message of the given kind.
    fn should_drop(&mut self, replica: NodeId, kind: &'static str) -> bool;
}

/// A correct replica: never drops anything.
#[derive(Clone, Debug, Default)]
pub struct Reliable;

impl DropPolicy for Reliable {
    fn should_drop(&mut self, _: NodeId, _: &'static str) -> bool {
        false
    }
}

/// A passively faulty replica: independently drops each inbound message (and
/// each of its own block proposals) with fixed probability, simulating
/// partial network failure without altering protocol logic elsewhere.
#[derive(Clone, Debug)]
pub struct PassiveFault {
    probability: f64,
    rng: StdRng,
}

impl PassiveFault {
    pub fn new(probability: f64, seed: u64) -> Self {
        assert!(
            (0.0..=1.0).contains(&probability),
            "drop probability must be in [0, 1]"
        );
        Self {
            probability,
            rng: StdRng::seed_from_u64(seed),
        }
    }
}

impl DropPolicy for PassiveFault {
    fn should_drop(&mut self, _: NodeId, _: &'static str) -> bool {
        self.rng.gen_bool(self.probability)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reliable_never_drops() {
        let mut policy = Reliable;
        for _ in 0..100 {
            assert!(!policy.should_drop(NodeId(0), "commit"));
        }
    }

    #[test]
    fn test_passive_fault_extremes() {
        let mut always = PassiveFault::new(1.0, 0);
        let mut never = PassiveFault::new(0.0, 0);
        for _ in 0..100 {
            assert!(always.should_drop(NodeId(0), "prepare"));
            assert!(!never.should_drop(NodeId(0), "prepare"));
        }
    }

    #[test]
    fn test_passive_fault_seeded() {
        let draws = |seed| {
            let mut policy = PassiveFault::new(0.5, seed);
            (0..64)
                .map(|_| policy.should_drop(NodeId(0), "commit"))
                .collect::<Vec<_>>()
        };
        assert_eq!(draws(7), draws(7));
        assert_ne!(draws(7), draws(8));
    }
}

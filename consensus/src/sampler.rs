//! Configured delay distributions.
//!
//! Every stochastic knob in the simulation (inter-block interval, validation
//! cost, transactions per block) is described by one of these samplers so a
//! configuration file can choose the shape.

use rand::Rng;
use rand_distr::{Distribution, Exp, Normal, Uniform};
use serde::{Deserialize, Serialize};

/// A non-negative random value source.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "distribution", rename_all = "snake_case")]
pub enum Sampler {
    Fixed { value: f64 },
    Uniform { low: f64, high: f64 },
    Normal { mean: f64, std_dev: f64 },
    Exponential { mean: f64 },
}

impl Sampler {
    /// Draw a value (clamped to be non-negative).
    pub fn sample<R: Rng>(&self, rng: &mut R) -> f64 {
        let value = match self {
            Self::Fixed { value } => *value,
            Self::Uniform { low, high } => Uniform::new_inclusive(low, high).sample(rng),
            Self::Normal { mean, std_dev } => {
                Normal::new(*mean, *std_dev).expect("invalid normal").sample(rng)
            }
            Self::Exponential { mean } => {
                Exp::new(1.0 / mean).expect("invalid exponential").sample(rng)
            }
        };
        value.max(0.0)
    }

    /// Whether this sampler can ever produce a non-zero value.
    pub fn is_zero(&self) -> bool {
        matches!(self, Self::Fixed { value } if *value == 0.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::{rngs::StdRng, SeedableRng};

    #[test]
    fn test_fixed() {
        let mut rng = StdRng::seed_from_u64(0);
        let sampler = Sampler::Fixed { value: 2.5 };
        assert_eq!(sampler.sample(&mut rng), 2.5);
        assert!(!sampler.is_zero());
        assert!(Sampler::Fixed { value: 0.0 }.is_zero());
    }

    #[test]
    fn test_uniform_bounds() {
        let mut rng = StdRng::seed_from_u64(1);
        let sampler = Sampler::Uniform { low: 1.0, high: 3.0 };
        for _ in 0..100 {
            let value = sampler.sample(&mut rng);
            assert!((1.0..=3.0).contains(&value));
        }
    }

    #[test]
    fn test_never_negative() {
        let mut rng = StdRng::seed_from_u64(2);
        let sampler = Sampler::Normal {
            mean: 0.0,
            std_dev: 10.0,
        };
        for _ in 0..100 {
            assert!(sampler.sample(&mut rng) >= 0.0);
        }
    }

    #[test]
    fn test_deserialize() {
        let sampler: Sampler =
            serde_json::from_str(r#"{"distribution":"normal","mean":13.0,"std_dev":2.0}"#).unwrap();
        assert_eq!(
            sampler,
            Sampler::Normal {
                mean: 13.0,
                std_dev: 2.0
            }
        );
    }
}

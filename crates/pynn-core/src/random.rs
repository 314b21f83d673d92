//! Seeded random streams.
//!
//! Every node builds the same stream from the same seed and consumes it in
//! the same order, so anything drawn "for the whole population" comes out
//! identical regardless of how many processes share the run.

use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use rand_distr::{Distribution as _, Exp, Normal, Uniform};
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::{PynnError, Result};

/// Deterministic generator shared (by seed) between all nodes
#[derive(Debug, Clone)]
pub struct SeededRng {
    seed: u64,
    rng: ChaCha8Rng,
}

impl SeededRng {
    pub fn new(seed: u64) -> Self {
        Self {
            seed,
            rng: ChaCha8Rng::seed_from_u64(seed),
        }
    }

    pub fn seed(&self) -> u64 {
        self.seed
    }

    /// `n` draws from U[0, 1)
    pub fn uniform(&mut self, n: usize) -> Vec<f64> {
        (0..n).map(|_| self.rng.gen::<f64>()).collect()
    }

    pub fn permutation<T: Clone>(&mut self, items: &[T]) -> Vec<T> {
        let mut out = items.to_vec();
        out.shuffle(&mut self.rng);
        out
    }

    /// Independent stream seeded from the next draw of this one
    pub fn spawn(&mut self) -> SeededRng {
        SeededRng::new(self.rng.gen::<u64>())
    }

    pub(crate) fn inner(&mut self) -> &mut ChaCha8Rng {
        &mut self.rng
    }
}

/// Supported distributions
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "name", rename_all = "snake_case")]
pub enum Distribution {
    Uniform { low: f64, high: f64 },
    Normal { mean: f64, std: f64 },
    Exponential { beta: f64 },
}

impl fmt::Display for Distribution {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Uniform { low, high } => write!(f, "uniform({}, {})", low, high),
            Self::Normal { mean, std } => write!(f, "normal({}, {})", mean, std),
            Self::Exponential { beta } => write!(f, "exponential({})", beta),
        }
    }
}

enum Sampler {
    Uniform(Uniform<f64>),
    Normal(Normal<f64>),
    Exponential(Exp<f64>),
}

/// A distribution bound to its own seeded stream
pub struct RandomDistribution {
    distribution: Distribution,
    sampler: Sampler,
    rng: SeededRng,
}

impl RandomDistribution {
    pub fn new(distribution: Distribution, rng: SeededRng) -> Result<Self> {
        let sampler = match distribution {
            Distribution::Uniform { low, high } => {
                if !(low < high) {
                    return Err(PynnError::InvalidArgument(format!(
                        "uniform distribution needs low < high, got {} and {}",
                        low, high
                    )));
                }
                Sampler::Uniform(Uniform::new(low, high))
            }
            Distribution::Normal { mean, std } => Sampler::Normal(
                Normal::new(mean, std).map_err(|e| PynnError::InvalidArgument(e.to_string()))?,
            ),
            Distribution::Exponential { beta } => {
                if beta <= 0.0 {
                    return Err(PynnError::InvalidArgument(format!(
                        "exponential distribution needs beta > 0, got {}",
                        beta
                    )));
                }
                Sampler::Exponential(
                    Exp::new(1.0 / beta).map_err(|e| PynnError::InvalidArgument(e.to_string()))?,
                )
            }
        };
        Ok(Self {
            distribution,
            sampler,
            rng,
        })
    }

    pub fn with_seed(distribution: Distribution, seed: u64) -> Result<Self> {
        Self::new(distribution, SeededRng::new(seed))
    }

    pub fn distribution(&self) -> &Distribution {
        &self.distribution
    }

    pub fn next(&mut self) -> f64 {
        let rng = self.rng.inner();
        match &self.sampler {
            Sampler::Uniform(d) => d.sample(rng),
            Sampler::Normal(d) => d.sample(rng),
            Sampler::Exponential(d) => d.sample(rng),
        }
    }

    pub fn next_n(&mut self, n: usize) -> Vec<f64> {
        (0..n).map(|_| self.next()).collect()
    }
}

impl fmt::Debug for RandomDistribution {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RandomDistribution")
            .field("distribution", &self.distribution)
            .field("seed", &self.rng.seed())
            .finish()
    }
}

impl fmt::Display for RandomDistribution {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} (seed {})", self.distribution, self.rng.seed())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_same_seed_same_stream() {
        let mut a = RandomDistribution::with_seed(Distribution::Normal { mean: 0.0, std: 1.0 }, 42).unwrap();
        let mut b = RandomDistribution::with_seed(Distribution::Normal { mean: 0.0, std: 1.0 }, 42).unwrap();
        assert_eq!(a.next_n(10), b.next_n(10));
    }

    #[test]
    fn test_uniform_bounds() {
        let mut d = RandomDistribution::with_seed(Distribution::Uniform { low: 1.0, high: 2.0 }, 7).unwrap();
        assert!(d.next_n(100).iter().all(|&x| (1.0..2.0).contains(&x)));
    }

    #[test]
    fn test_invalid_parameters() {
        assert!(RandomDistribution::with_seed(Distribution::Uniform { low: 2.0, high: 1.0 }, 0).is_err());
        assert!(RandomDistribution::with_seed(Distribution::Exponential { beta: 0.0 }, 0).is_err());
    }

    #[test]
    fn test_permutation_keeps_elements() {
        let mut rng = SeededRng::new(3);
        let mut p = rng.permutation(&[1, 2, 3, 4, 5]);
        p.sort();
        assert_eq!(p, vec![1, 2, 3, 4, 5]);
    }

    #[test]
    fn test_spawned_streams_differ_but_repeat() {
        let mut a = SeededRng::new(9);
        let mut b = SeededRng::new(9);
        let (mut a1, mut a2) = (a.spawn(), a.spawn());
        assert_ne!(a1.uniform(5), a2.uniform(5));
        assert_eq!(b.spawn().uniform(5), SeededRng::new(a1.seed()).uniform(5));
    }
}

//! Minibatch selection from the replay memory.
use crate::{config::MiniBatchStrategy, error::VracerError, replay::ReplayMemory};
use rand::Rng;
use rand_chacha::ChaCha12Rng;
use serde::{Deserialize, Serialize};

/// One sampled experience: its logical index and the importance-sampling
/// correction factor to apply to its gradient contribution.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct MiniBatchEntry {
    /// Logical index into the replay memory.
    pub index: u64,

    /// `(N * p_i)^(-beta)` for rank sampling, one for uniform sampling.
    pub weight: f32,
}

/// Selects experience indices for a policy update.
///
/// `Uniform` draws without replacement over all stored rows. `Rank` draws
/// proportionally to rank-based priorities of the TD error through a sorted
/// view that is refreshed once per generation; the importance-sampling
/// exponent is annealed toward one per policy update.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct MiniBatchSampler {
    strategy: MiniBatchStrategy,
    alpha: f32,
    beta: f32,
    annealing_rate: f32,
    rng: ChaCha12Rng,

    /// Rank view: indices sorted by descending |TD error|, refreshed per
    /// generation. Not persisted; rebuilt on the first sample after restore.
    #[serde(skip)]
    sorted: Vec<u64>,

    /// Cumulative probabilities aligned with `sorted`.
    #[serde(skip)]
    cumulative: Vec<f32>,
}

impl MiniBatchSampler {
    /// Creates a sampler.
    pub fn new(
        strategy: MiniBatchStrategy,
        alpha: f32,
        beta: f32,
        annealing_rate: f32,
        rng: ChaCha12Rng,
    ) -> Self {
        Self {
            strategy,
            alpha,
            beta,
            annealing_rate,
            rng,
            sorted: Vec::new(),
            cumulative: Vec::new(),
        }
    }

    /// Current importance-sampling exponent.
    pub fn importance_sampling_exponent(&self) -> f32 {
        self.beta
    }

    /// Anneals the importance-sampling exponent toward one. Called once per
    /// policy update.
    pub fn anneal(&mut self) {
        self.beta += (1.0 - self.beta) * self.annealing_rate;
    }

    /// Rebuilds the sorted priority view and writes priorities and
    /// probabilities back into the replay columns.
    pub fn refresh(&mut self, replay: &mut ReplayMemory) -> Result<(), VracerError> {
        if self.strategy != MiniBatchStrategy::Rank {
            return Ok(());
        }

        let mut by_td: Vec<(u64, f32)> = replay
            .indices()
            .map(|i| {
                let td = (replay.retrace_value(i).unwrap() - replay.state_value(i).unwrap()).abs();
                (i, td)
            })
            .collect();
        by_td.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));

        let priorities: Vec<f32> = (0..by_td.len())
            .map(|rank| (1.0 / (rank + 1) as f32).powf(self.alpha))
            .collect();
        let total: f32 = priorities.iter().sum();

        self.sorted.clear();
        self.cumulative.clear();
        let mut acc = 0.0;
        for ((index, _), priority) in by_td.iter().zip(&priorities) {
            let probability = priority / total;
            replay.set_priority(*index, *priority)?;
            replay.set_probability(*index, probability)?;
            acc += probability;
            self.sorted.push(*index);
            self.cumulative.push(acc);
        }
        Ok(())
    }

    /// Draws a minibatch of `size` experience indices, oldest first.
    pub fn sample(
        &mut self,
        replay: &mut ReplayMemory,
        size: usize,
    ) -> Result<Vec<MiniBatchEntry>, VracerError> {
        if size > replay.len() {
            return Err(VracerError::InsufficientSamples {
                requested: size,
                size: replay.len(),
            });
        }

        let mut entries = match self.strategy {
            MiniBatchStrategy::Uniform => {
                let n = replay.len();
                let oldest = replay.oldest().unwrap();
                rand::seq::index::sample(&mut self.rng, n, size)
                    .into_iter()
                    .map(|offset| MiniBatchEntry {
                        index: oldest + offset as u64,
                        weight: 1.0,
                    })
                    .collect::<Vec<_>>()
            }
            MiniBatchStrategy::Rank => {
                // The sorted view goes stale whenever rows were appended or
                // evicted since the last refresh.
                if self.sorted.len() != replay.len()
                    || self.sorted.iter().any(|i| !replay.contains(*i))
                {
                    self.refresh(replay)?;
                }
                let n = replay.len() as f32;
                (0..size)
                    .map(|_| {
                        let u: f32 = self.rng.gen();
                        let pos = self
                            .cumulative
                            .partition_point(|&c| c < u)
                            .min(self.sorted.len() - 1);
                        let index = self.sorted[pos];
                        let p = replay.probability(index).unwrap();
                        MiniBatchEntry {
                            index,
                            weight: (n * p).powf(-self.beta),
                        }
                    })
                    .collect()
            }
        };

        entries.sort_by_key(|e| e.index);
        Ok(entries)
    }
}

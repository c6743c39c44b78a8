//! State whitening and reward shaping around the replay memory.
//!
//! Reward rescaling is continuous and lives in the replay memory itself
//! (the running per-environment sigma). State rescaling is one-shot: once
//! the replay first reaches its start size, per-component statistics are
//! fixed and every state entering the policy evaluator is shifted and
//! scaled by them. Stored states stay raw.
use crate::{error::VracerError, replay::ReplayMemory};
use serde::{Deserialize, Serialize};

/// One-shot whitening of states entering the policy evaluator.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct StateRescaler {
    enabled: bool,
    applied: bool,
    means: Vec<f32>,
    sigmas: Vec<f32>,
}

impl StateRescaler {
    /// Creates an identity rescaler for the given state dimension.
    pub fn new(enabled: bool, state_dim: usize) -> Self {
        Self {
            enabled,
            applied: false,
            means: vec![0.0; state_dim],
            sigmas: vec![1.0; state_dim],
        }
    }

    /// Reconstructs a rescaler from persisted statistics.
    pub fn from_parts(enabled: bool, applied: bool, means: Vec<f32>, sigmas: Vec<f32>) -> Self {
        Self {
            enabled,
            applied,
            means,
            sigmas,
        }
    }

    /// Whether statistics have been fixed.
    pub fn is_applied(&self) -> bool {
        self.applied
    }

    /// Per-component means.
    pub fn means(&self) -> &[f32] {
        &self.means
    }

    /// Per-component standard deviations.
    pub fn sigmas(&self) -> &[f32] {
        &self.sigmas
    }

    /// Computes per-component statistics over the replay buffer.
    ///
    /// Runs at most once; later calls are no-ops, so re-triggering the
    /// rescaling pass on an already-rescaled buffer leaves it untouched.
    /// Returns true if statistics were fixed by this call.
    pub fn fit_once(&mut self, replay: &ReplayMemory) -> Result<bool, VracerError> {
        if !self.enabled || self.applied || replay.is_empty() {
            return Ok(false);
        }

        let n = replay.len() as f32;
        let dim = self.means.len();
        let mut sums = vec![0.0f64; dim];
        let mut squares = vec![0.0f64; dim];
        for state in replay.states_iter() {
            for (d, s) in state.iter().enumerate() {
                sums[d] += *s as f64;
                squares[d] += (*s as f64) * (*s as f64);
            }
        }

        for d in 0..dim {
            let mean = (sums[d] / n as f64) as f32;
            let var = (squares[d] / n as f64 - (sums[d] / n as f64).powi(2)).max(0.0) as f32;
            let sigma = var.sqrt();
            if !mean.is_finite() || !sigma.is_finite() {
                return Err(VracerError::NumericFailure(format!(
                    "state component {} has mean {} and sigma {}",
                    d, mean, sigma
                )));
            }
            self.means[d] = mean;
            self.sigmas[d] = if sigma > 0.0 { sigma } else { 1.0 };
        }
        self.applied = true;
        Ok(true)
    }

    /// Shifts and scales a single state.
    pub fn apply(&self, state: &[f32]) -> Vec<f32> {
        if !self.applied {
            return state.to_vec();
        }
        state
            .iter()
            .zip(self.means.iter().zip(&self.sigmas))
            .map(|(s, (m, sd))| (s - m) / sd)
            .collect()
    }

    /// Shifts and scales every state of a time sequence.
    pub fn apply_sequence(&self, sequence: &[Vec<f32>]) -> Vec<Vec<f32>> {
        sequence.iter().map(|s| self.apply(s)).collect()
    }
}

/// Returns true if any action component lies outside its bounds.
pub fn action_out_of_bounds(action: &[f32], lower: &[f32], upper: &[f32]) -> bool {
    action
        .iter()
        .zip(lower.iter().zip(upper))
        .any(|(a, (lo, hi))| a < lo || a > hi)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::experience::{Experience, PolicyRecord, Termination};

    fn replay_with_states(states: &[Vec<f32>]) -> ReplayMemory {
        let mut replay = ReplayMemory::new(states.len(), 1, false).unwrap();
        for (i, s) in states.iter().enumerate() {
            replay.append(Experience {
                state: s.clone(),
                action: vec![0.0],
                reward: 0.0,
                episode_id: 0,
                episode_pos: i,
                environment_id: 0,
                termination: Termination::NonTerminal,
                truncated_state: None,
                exp_policy: PolicyRecord::default(),
            });
        }
        replay
    }

    #[test]
    fn fit_whitens_states() {
        let replay = replay_with_states(&[vec![1.0, 10.0], vec![3.0, 10.0]]);
        let mut rescaler = StateRescaler::new(true, 2);
        assert!(rescaler.fit_once(&replay).unwrap());

        let scaled = rescaler.apply(&[1.0, 10.0]);
        assert!((scaled[0] + 1.0).abs() < 1e-6);
        // Zero-variance components fall back to sigma one.
        assert!((scaled[1] - 0.0).abs() < 1e-6);
    }

    #[test]
    fn second_fit_is_a_no_op() {
        let replay = replay_with_states(&[vec![1.0], vec![3.0]]);
        let mut rescaler = StateRescaler::new(true, 1);
        assert!(rescaler.fit_once(&replay).unwrap());
        let means = rescaler.means().to_vec();

        let other = replay_with_states(&[vec![100.0], vec![200.0]]);
        assert!(!rescaler.fit_once(&other).unwrap());
        assert_eq!(rescaler.means(), &means[..]);
    }

    #[test]
    fn disabled_rescaler_is_identity() {
        let replay = replay_with_states(&[vec![1.0], vec![3.0]]);
        let mut rescaler = StateRescaler::new(false, 1);
        assert!(!rescaler.fit_once(&replay).unwrap());
        assert_eq!(rescaler.apply(&[5.0]), vec![5.0]);
    }

    #[test]
    fn out_of_bounds_detection() {
        let lower = [0.0, 0.0];
        let upper = [1.0, 1.0];
        assert!(action_out_of_bounds(&[1.5, 0.5], &lower, &upper));
        assert!(action_out_of_bounds(&[0.5, -0.1], &lower, &upper));
        assert!(!action_out_of_bounds(&[0.5, 1.0], &lower, &upper));
    }
}

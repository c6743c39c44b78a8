//! Off-policiness controller.
use serde::{Deserialize, Serialize};
use vracer_core::AgentConfig;

/// Feedback controller tracking a target off-policy ratio.
///
/// After every policy update the controller compares the replay's
/// off-policy ratio `r` against the target `D` and anneals three scalars at
/// rate `A`:
///
/// * `r > D`: cutoff and learning rate shrink by `1 - A`; the penalty
///   coefficient beta moves toward one.
/// * `r <= D`: cutoff and learning rate grow by `1 / (1 - A)`; beta moves
///   toward zero.
///
/// The cutoff is clamped to `[1, inf)`, beta to `[0, 1]` and the learning
/// rate above its configured minimum.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ReferController {
    target: f32,
    annealing_rate: f32,
    learning_rate_min: f32,
    cutoff: f32,
    learning_rate: f32,
    beta: f32,
}

impl ReferController {
    /// Creates a controller from the configuration.
    pub fn new(config: &AgentConfig) -> Self {
        Self {
            target: config.experience_replay_off_policy_target,
            annealing_rate: config.experience_replay_off_policy_annealing_rate,
            learning_rate_min: config.learning_rate_min,
            cutoff: config.experience_replay_off_policy_cutoff_scale,
            learning_rate: config.learning_rate,
            beta: config.experience_replay_off_policy_refer_beta,
        }
    }

    /// Current cutoff classifying experiences as on- or off-policy.
    pub fn cutoff(&self) -> f32 {
        self.cutoff
    }

    /// Current learning rate.
    pub fn learning_rate(&self) -> f32 {
        self.learning_rate
    }

    /// Current penalty coefficient propagated to the training loss.
    pub fn beta(&self) -> f32 {
        self.beta
    }

    /// Applies one annealing step for the observed off-policy ratio.
    pub fn update(&mut self, off_policy_ratio: f32) {
        let a = self.annealing_rate;
        if off_policy_ratio > self.target {
            self.cutoff *= 1.0 - a;
            self.learning_rate *= 1.0 - a;
            self.beta += (1.0 - self.beta) * a;
        } else {
            self.cutoff /= 1.0 - a;
            self.learning_rate /= 1.0 - a;
            self.beta -= self.beta * a;
        }
        self.cutoff = self.cutoff.max(1.0);
        self.beta = self.beta.clamp(0.0, 1.0);
        self.learning_rate = self.learning_rate.max(self.learning_rate_min);
    }
}

//! Capability set of a policy variant.
use rand_chacha::ChaCha12Rng;
use vracer_core::{PolicyRecord, VracerError};

/// The operations an action distribution must provide to the agent.
///
/// Two variants exist: [`ContinuousPolicy`](crate::ContinuousPolicy)
/// (squashed normal) and [`DiscretePolicy`](crate::DiscretePolicy)
/// (categorical). Everything the learner does with a distribution —
/// evaluating network heads into policy records, sampling rollout actions,
/// recomputing importance weights, assembling loss gradients — goes through
/// this trait, so the retrace engine and the training step are shared
/// between the variants.
pub trait PolicyModel: Clone + Send {
    /// Number of network head values per sample: one state value plus the
    /// distribution parameters.
    fn output_dim(&self) -> usize;

    /// Dimension of actions handed to the environment.
    fn action_dim(&self) -> usize;

    /// Interprets raw network outputs as a policy record.
    fn policy_record(&self, outputs: &[f32]) -> Result<PolicyRecord, VracerError>;

    /// Samples an exploratory action. The returned record is the input
    /// record completed with the sampling information needed to recompute
    /// log-probabilities exactly later.
    fn sample_action(&self, record: &PolicyRecord, rng: &mut ChaCha12Rng)
        -> (Vec<f32>, PolicyRecord);

    /// Deterministic action for evaluation.
    fn exploit_action(&self, record: &PolicyRecord) -> (Vec<f32>, PolicyRecord);

    /// Importance weight `pi_cur(a|s) / pi_exp(a|s)` of the stored action
    /// under the two policy records. May be infinite when the experience
    /// policy's density is numerically zero; the caller caps it.
    fn importance_weight(&self, action: &[f32], cur: &PolicyRecord, exp: &PolicyRecord) -> f32;

    /// Gradient of `log pi_cur(a|s)` with respect to the current
    /// distribution parameters.
    fn log_prob_gradient(&self, action: &[f32], cur: &PolicyRecord, exp: &PolicyRecord)
        -> Vec<f32>;

    /// Gradient of `KL(pi_exp || pi_cur)` with respect to the current
    /// distribution parameters.
    fn kl_gradient(&self, cur: &PolicyRecord, exp: &PolicyRecord) -> Vec<f32>;

    /// Maps gradients with respect to the state value and the distribution
    /// parameters back onto the raw network heads, applying the chain rule
    /// of any parameter transforms.
    fn output_gradient(
        &self,
        cur: &PolicyRecord,
        value_gradient: f32,
        dist_gradient: &[f32],
    ) -> Vec<f32>;
}

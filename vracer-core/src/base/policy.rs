//! Policy snapshots and the rollout-side policy.
use crate::experience::PolicyRecord;
use anyhow::Result;
use serde::{Deserialize, Serialize};

/// An immutable copy of the learner's policy published to the rollouts.
///
/// Rollouts only ever read snapshots; the learner's parameter mutations
/// during a generation are invisible to them until the next publication.
/// The snapshot carries the state whitening statistics so queries are
/// preprocessed exactly like training batches.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PolicySnapshot {
    /// Flattened network parameters.
    pub params: Vec<f32>,

    /// Number of policy updates baked into `params`.
    pub policy_update_count: usize,

    /// Generation at which the snapshot was taken. Also seeds the
    /// rollout-side action noise, keeping collection reproducible.
    pub generation: usize,

    /// State whitening means, identity until rescaling ran.
    pub state_means: Vec<f32>,

    /// State whitening standard deviations.
    pub state_sigmas: Vec<f32>,

    /// Whether the whitening statistics have been fixed.
    pub state_rescaling_applied: bool,

    /// If true, rollouts act deterministically (testing mode).
    pub exploit: bool,
}

/// The policy as seen by the rollout coordinator.
///
/// Implementations hold their own copy of the network and synchronize it
/// from published snapshots, so answering action queries never touches the
/// learner's mutable state.
pub trait RolloutPolicy {
    /// Adopts a published snapshot.
    fn sync(&mut self, snapshot: &PolicySnapshot);

    /// Samples an action for the given raw state sequence and returns it
    /// together with the policy record that produced it.
    fn sample_action(&mut self, state_seq: &[Vec<f32>]) -> Result<(Vec<f32>, PolicyRecord)>;
}

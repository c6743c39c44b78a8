//! Seams between the generation driver, the learner and the rollouts.
use crate::{base::PolicySnapshot, experience::CollectedEpisode, record::Record};
use anyhow::Result;
use std::path::Path;

/// A trainable policy owner, driven by the trainer once per generation.
///
/// The learner owns the replay memory, the network parameters and the
/// off-policiness controller. It is only ever touched from the trainer's
/// thread.
pub trait Learner {
    /// Ingests a completed episode into the replay memory.
    fn process_episode(&mut self, episode: CollectedEpisode) -> Result<()>;

    /// True once the replay memory has reached its start size.
    fn ready_to_train(&self) -> bool;

    /// Performs a single policy update and reports its metrics.
    fn train_policy(&mut self) -> Result<Record>;

    /// Takes an immutable snapshot of the current policy.
    fn policy_snapshot(&self, generation: usize, exploit: bool) -> PolicySnapshot;

    /// Lifetime number of episodes ingested.
    fn episode_count(&self) -> usize;

    /// Lifetime number of experiences ingested.
    fn experience_count(&self) -> usize;

    /// Lifetime number of policy updates performed.
    fn policy_update_count(&self) -> usize;

    /// Trailing average of episode returns.
    fn average_training_reward(&self) -> f32;

    /// Best episode return seen so far.
    fn best_training_reward(&self) -> f32;

    /// Serializes the replay memory and learner state into the directory.
    fn serialize_replay(&self, dir: &Path) -> Result<()>;
}

/// Supplies completed episodes to the trainer.
///
/// Implementations drive one or more environment workers and answer their
/// action queries from the most recently published snapshot.
pub trait EpisodeSource {
    /// Publishes a policy snapshot to the workers.
    fn publish(&mut self, snapshot: &PolicySnapshot) -> Result<()>;

    /// Blocks until the given number of episodes completed and returns
    /// them, in completion order.
    fn collect(&mut self, n_episodes: usize) -> Result<Vec<CollectedEpisode>>;

    /// Stops the workers, discarding partial trajectories.
    fn shutdown(&mut self) -> Result<()>;
}

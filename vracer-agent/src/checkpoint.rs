//! Checkpointing of the learner state.
//!
//! The checkpoint is one self-describing JSON record holding the
//! configuration, every replay column, the controller and sampler state
//! (including their RNGs and optimizer moments), counters, rescaling
//! statistics, the best policy snapshot and the reward history. Saving,
//! restoring and saving again produces byte-identical output, and a
//! restored run continues bit-for-bit given the same worker seeds.
use crate::{base::Vracer, policy::PolicyModel, refer::ReferController};
use anyhow::Result;
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use std::{
    fs::File,
    io::{BufReader, Write},
    path::Path,
};
use vracer_core::{
    AgentConfig, MiniBatchSampler, ReplayMemory, StateRescaler, TensorEngine,
};

/// Serialized learner state.
#[derive(Serialize, Deserialize)]
pub struct Checkpoint<P, T> {
    /// Configuration the agent was built with.
    pub config: AgentConfig,

    /// Replay columns and statistics.
    pub replay: ReplayMemory,

    /// Sampler state, including its RNG.
    pub sampler: MiniBatchSampler,

    /// State whitening statistics.
    pub rescaler: StateRescaler,

    /// Controller scalars.
    pub controller: ReferController,

    /// Policy variant.
    pub model: P,

    /// Network engine, parameters and optimizer state.
    pub engine: T,

    /// Lifetime episode count.
    pub episode_count: usize,

    /// Lifetime experience count.
    pub experience_count: usize,

    /// Lifetime policy update count.
    pub policy_update_count: usize,

    /// Lifetime count of penalized out-of-bound actions.
    pub out_of_bound_count: usize,

    /// Per-episode returns.
    pub reward_history: Vec<f32>,

    /// Per-episode experience counts.
    pub experience_history: Vec<usize>,

    /// Per-episode environment ids.
    pub environment_id_history: Vec<usize>,

    /// Best episode return seen so far.
    pub best_reward: f32,

    /// Episode that achieved the best return.
    pub best_episode_id: Option<u64>,

    /// Parameters at the time of the best episode.
    pub best_params: Vec<f32>,
}

impl<P, T> Vracer<P, T>
where
    P: PolicyModel + Serialize + DeserializeOwned,
    T: TensorEngine + Clone + Serialize + DeserializeOwned,
{
    /// Serializes the learner into a JSON checkpoint file.
    pub fn save_checkpoint(&self, path: &Path) -> Result<()> {
        let checkpoint = Checkpoint {
            config: self.config.clone(),
            replay: self.replay.clone(),
            sampler: self.sampler.clone(),
            rescaler: self.rescaler.clone(),
            controller: self.controller.clone(),
            model: self.model.clone(),
            engine: self.engine.clone(),
            episode_count: self.episode_count,
            experience_count: self.experience_count,
            policy_update_count: self.policy_update_count,
            out_of_bound_count: self.out_of_bound_count,
            reward_history: self.reward_history.clone(),
            experience_history: self.experience_history.clone(),
            environment_id_history: self.environment_id_history.clone(),
            best_reward: self.best_reward,
            best_episode_id: self.best_episode_id,
            best_params: self.best_params.clone(),
        };
        let mut file = File::create(path)?;
        file.write_all(serde_json::to_string(&checkpoint)?.as_bytes())?;
        Ok(())
    }

    /// Restores a learner from a JSON checkpoint file.
    pub fn restore_checkpoint(path: &Path) -> Result<Self> {
        let file = File::open(path)?;
        let checkpoint: Checkpoint<P, T> = serde_json::from_reader(BufReader::new(file))?;
        let mut agent = Vracer::build(checkpoint.config, checkpoint.model, checkpoint.engine)?;
        agent.replay = checkpoint.replay;
        agent.sampler = checkpoint.sampler;
        agent.rescaler = checkpoint.rescaler;
        agent.controller = checkpoint.controller;
        agent.episode_count = checkpoint.episode_count;
        agent.experience_count = checkpoint.experience_count;
        agent.policy_update_count = checkpoint.policy_update_count;
        agent.out_of_bound_count = checkpoint.out_of_bound_count;
        agent.reward_history = checkpoint.reward_history;
        agent.experience_history = checkpoint.experience_history;
        agent.environment_id_history = checkpoint.environment_id_history;
        agent.best_reward = checkpoint.best_reward;
        agent.best_episode_id = checkpoint.best_episode_id;
        agent.best_params = checkpoint.best_params;
        Ok(agent)
    }
}

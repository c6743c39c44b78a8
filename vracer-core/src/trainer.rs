//! Generation-wise training loop.
use crate::{
    base::{EpisodeSource, Learner},
    config::{AgentConfig, PolicyPublish},
    record::Record,
};
use anyhow::Result;
use log::info;
use std::path::PathBuf;

/// Why a training run stopped.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TerminationReason {
    /// The configured number of episodes was reached.
    MaxEpisodes,

    /// The configured number of experiences was reached.
    MaxExperiences,

    /// The configured number of policy updates was reached.
    MaxPolicyUpdates,

    /// The trailing average reward reached the configured threshold.
    RewardThreshold,
}

/// Manages the per-generation training loop.
///
/// Each generation the trainer publishes a policy snapshot, pulls completed
/// episodes from the [`EpisodeSource`], feeds them to the [`Learner`], and
/// runs as many policy updates as the experience budget allows. Training
/// does not start until the learner's replay memory reached its start size;
/// the first update happens in the first generation after that threshold.
pub struct Trainer {
    episodes_per_generation: usize,
    experiences_between_policy_updates: f32,
    max_episodes: usize,
    max_experiences: usize,
    max_policy_updates: usize,
    training_reward_threshold: Option<f32>,
    serialize_replay: bool,
    policy_publish: PolicyPublish,
    model_dir: Option<PathBuf>,

    /// Completed generations.
    generation: usize,

    /// Fractional carry of pending policy updates.
    update_credit: f32,
}

impl Trainer {
    /// Constructs a trainer.
    ///
    /// `model_dir` is where replay checkpoints are written when
    /// serialization is enabled.
    pub fn build(config: &AgentConfig, model_dir: Option<PathBuf>) -> Self {
        Self {
            episodes_per_generation: config.episodes_per_generation,
            experiences_between_policy_updates: config.experiences_between_policy_updates,
            max_episodes: config.max_episodes,
            max_experiences: config.max_experiences,
            max_policy_updates: config.max_policy_updates,
            training_reward_threshold: config.training_reward_threshold,
            serialize_replay: config.experience_replay_serialize,
            policy_publish: config.policy_publish,
            model_dir,
            generation: 0,
            update_credit: 0.0,
        }
    }

    /// Completed generations.
    pub fn generation(&self) -> usize {
        self.generation
    }

    /// Runs generations until a termination criterion fires.
    pub fn train<L, S>(&mut self, learner: &mut L, source: &mut S) -> Result<TerminationReason>
    where
        L: Learner,
        S: EpisodeSource,
    {
        loop {
            if let Some(reason) = self.generation_step(learner, source)? {
                info!("training stopped: {:?}", reason);
                source.shutdown()?;
                return Ok(reason);
            }
        }
    }

    /// Runs a single generation. Returns the termination reason once any
    /// criterion fires.
    pub fn generation_step<L, S>(
        &mut self,
        learner: &mut L,
        source: &mut S,
    ) -> Result<Option<TerminationReason>>
    where
        L: Learner,
        S: EpisodeSource,
    {
        self.generation += 1;
        source.publish(&learner.policy_snapshot(self.generation, false))?;

        let episodes = source.collect(self.episodes_per_generation)?;
        let experiences_before = learner.experience_count();
        for episode in episodes {
            learner.process_episode(episode)?;
        }

        if learner.ready_to_train() {
            let new_experiences = learner.experience_count() - experiences_before;
            self.update_credit +=
                new_experiences as f32 / self.experiences_between_policy_updates;
            let updates_this_generation = self.update_credit.floor() as usize;
            self.update_credit -= updates_this_generation as f32;

            for _ in 0..updates_this_generation {
                let record = learner.train_policy()?;
                self.log_update(learner, &record);
                if self.policy_publish == PolicyPublish::PerUpdate {
                    source.publish(&learner.policy_snapshot(self.generation, false))?;
                }
                if self.max_policy_updates > 0
                    && learner.policy_update_count() >= self.max_policy_updates
                {
                    break;
                }
            }
        }

        if self.serialize_replay {
            if let Some(dir) = &self.model_dir {
                learner.serialize_replay(dir)?;
            }
        }

        Ok(self.check_termination(learner))
    }

    /// Runs episodes with the deterministic policy and returns their
    /// cumulative rewards. Used in testing mode; the replay is untouched.
    pub fn evaluate<L, S>(
        &mut self,
        learner: &mut L,
        source: &mut S,
        n_episodes: usize,
    ) -> Result<Vec<f32>>
    where
        L: Learner,
        S: EpisodeSource,
    {
        source.publish(&learner.policy_snapshot(self.generation, true))?;
        let episodes = source.collect(n_episodes)?;
        Ok(episodes.iter().map(|e| e.cumulative_reward()).collect())
    }

    fn log_update<L: Learner>(&self, learner: &L, record: &Record) {
        let scalar = |k: &str| record.get_scalar(k).unwrap_or(f32::NAN);
        info!(
            "gen {} update {}: off-policy ratio {:.4}, cutoff {:.3}, beta {:.3}, avg reward {:.3}, best reward {:.3}, avg retrace {:.3}",
            self.generation,
            learner.policy_update_count(),
            scalar("off_policy_ratio"),
            scalar("cutoff"),
            scalar("beta"),
            learner.average_training_reward(),
            learner.best_training_reward(),
            scalar("avg_retrace"),
        );
    }

    fn check_termination<L: Learner>(&self, learner: &L) -> Option<TerminationReason> {
        if self.max_episodes > 0 && learner.episode_count() >= self.max_episodes {
            return Some(TerminationReason::MaxEpisodes);
        }
        if self.max_experiences > 0 && learner.experience_count() >= self.max_experiences {
            return Some(TerminationReason::MaxExperiences);
        }
        if self.max_policy_updates > 0 && learner.policy_update_count() >= self.max_policy_updates
        {
            return Some(TerminationReason::MaxPolicyUpdates);
        }
        if let Some(threshold) = self.training_reward_threshold {
            if learner.episode_count() > 0 && learner.average_training_reward() >= threshold {
                return Some(TerminationReason::RewardThreshold);
            }
        }
        None
    }
}

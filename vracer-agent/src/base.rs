//! The off-policy actor-critic agent.
use crate::{
    policy::PolicyModel,
    refer::ReferController,
    retrace::{refresh_minibatch, state_sequence, sweep_episode, truncated_sequence},
};
use anyhow::Result;
use log::{info, warn};
use rand::SeedableRng;
use rand_chacha::ChaCha12Rng;
use serde::{de::DeserializeOwned, Serialize};
use std::path::Path;
use vracer_core::{
    action_out_of_bounds, AgentConfig, CollectedEpisode, Learner, MiniBatchEntry,
    MiniBatchSampler, Mode, PolicySnapshot, Record, RecordValue::Scalar, ReplayMemory,
    StateRescaler, TensorEngine, Termination, VracerError,
};

/// Replay-memory-backed actor-critic learner.
///
/// The agent owns the replay memory, the network engine, the minibatch
/// sampler and the off-policiness controller; it is only ever driven from
/// the trainer's thread. A policy update samples a minibatch, refreshes its
/// metadata and the affected episodes' retrace targets, assembles the loss
/// gradient with respect to the network heads, and lets the engine take an
/// optimization step.
pub struct Vracer<P, T>
where
    P: PolicyModel,
    T: TensorEngine,
{
    pub(crate) config: AgentConfig,
    pub(crate) replay: ReplayMemory,
    pub(crate) sampler: MiniBatchSampler,
    pub(crate) rescaler: StateRescaler,
    pub(crate) controller: ReferController,
    pub(crate) model: P,
    pub(crate) engine: T,

    pub(crate) episode_count: usize,
    pub(crate) experience_count: usize,
    pub(crate) policy_update_count: usize,
    pub(crate) out_of_bound_count: usize,

    pub(crate) reward_history: Vec<f32>,
    pub(crate) experience_history: Vec<usize>,
    pub(crate) environment_id_history: Vec<usize>,

    pub(crate) best_reward: f32,
    pub(crate) best_episode_id: Option<u64>,
    pub(crate) best_params: Vec<f32>,

    /// Counters relative to this process, excluded from checkpoints so a
    /// restarted run reports its own progress.
    session_episode_count: usize,
    session_experience_count: usize,
    session_policy_update_count: usize,

    action_lower: Vec<f32>,
    action_upper: Vec<f32>,
}

impl<P, T> Vracer<P, T>
where
    P: PolicyModel,
    T: TensorEngine,
{
    /// Builds an agent from a validated configuration.
    pub fn build(config: AgentConfig, model: P, engine: T) -> Result<Self> {
        config.validate()?;
        if engine.output_dim() != model.output_dim() {
            return Err(VracerError::Config(format!(
                "engine emits {} head values, policy expects {}",
                engine.output_dim(),
                model.output_dim()
            ))
            .into());
        }
        if model.action_dim() != config.action_dim() {
            return Err(VracerError::Config(format!(
                "policy emits {}-dimensional actions, configuration declares {}",
                model.action_dim(),
                config.action_dim()
            ))
            .into());
        }

        let replay = ReplayMemory::new(
            config.experience_replay_maximum_size,
            config.concurrent_environments,
            config.reward_rescaling_enabled,
        )?;
        let sampler = MiniBatchSampler::new(
            config.mini_batch_strategy,
            config.rank_priority_exponent,
            config.importance_sampling_exponent,
            config.importance_weight_annealing_rate,
            ChaCha12Rng::seed_from_u64(config.seed),
        );
        let rescaler = StateRescaler::new(config.state_rescaling_enabled, config.state_dim());
        let controller = ReferController::new(&config);
        let action_lower = config.action_lower_bounds();
        let action_upper = config.action_upper_bounds();

        Ok(Self {
            replay,
            sampler,
            rescaler,
            controller,
            model,
            engine,
            episode_count: 0,
            experience_count: 0,
            policy_update_count: 0,
            out_of_bound_count: 0,
            reward_history: vec![],
            experience_history: vec![],
            environment_id_history: vec![],
            best_reward: f32::MIN,
            best_episode_id: None,
            best_params: vec![],
            session_episode_count: 0,
            session_experience_count: 0,
            session_policy_update_count: 0,
            action_lower,
            action_upper,
            config,
        })
    }

    /// The agent's configuration.
    pub fn config(&self) -> &AgentConfig {
        &self.config
    }

    /// The replay memory.
    pub fn replay(&self) -> &ReplayMemory {
        &self.replay
    }

    /// The off-policiness controller.
    pub fn controller(&self) -> &ReferController {
        &self.controller
    }

    /// The policy variant.
    pub fn model(&self) -> &P {
        &self.model
    }

    /// Parameters of the best policy seen so far, if any episode completed.
    pub fn best_params(&self) -> Option<&[f32]> {
        self.best_episode_id.map(|_| self.best_params.as_slice())
    }

    /// Number of experiences whose action left its bounds.
    pub fn out_of_bound_count(&self) -> usize {
        self.out_of_bound_count
    }

    /// Episodes ingested by this process, ignoring restored history.
    pub fn session_episode_count(&self) -> usize {
        self.session_episode_count
    }

    /// Trailing average of episode returns over the configured depth.
    pub fn average_training_reward(&self) -> f32 {
        let depth = self.config.training_average_depth.min(self.reward_history.len());
        if depth == 0 {
            return 0.0;
        }
        let tail = &self.reward_history[self.reward_history.len() - depth..];
        tail.iter().sum::<f32>() / depth as f32
    }

    /// Best episode return seen so far.
    pub fn best_training_reward(&self) -> f32 {
        self.best_reward
    }

    fn backend<E: std::fmt::Display>(e: E) -> VracerError {
        VracerError::Backend(e.to_string())
    }

    /// Refreshes minibatch metadata and performs the gradient step.
    fn update_step(&mut self, entries: &[MiniBatchEntry]) -> Result<()> {
        let indices: Vec<u64> = entries.iter().map(|e| e.index).collect();
        refresh_minibatch(
            &mut self.replay,
            &self.rescaler,
            &self.model,
            &mut self.engine,
            &indices,
            self.config.time_sequence_length,
            self.config.importance_weight_truncation_level,
            self.controller.cutoff(),
            self.config.discount_factor,
        )?;

        let beta = self.controller.beta();
        let mut batch = Vec::with_capacity(entries.len());
        for e in entries {
            batch.push(state_sequence(
                &self.replay,
                &self.rescaler,
                e.index,
                self.config.time_sequence_length,
            )?);
        }
        self.engine.forward(&batch).map_err(Self::backend)?;

        let mut gradients = Vec::with_capacity(entries.len());
        for e in entries {
            let cur = self.replay.cur_policy(e.index)?.clone();
            let exp = self.replay.exp_policy(e.index)?.clone();
            let action = self.replay.action(e.index)?.clone();
            let value = self.replay.state_value(e.index)?;
            let retrace = self.replay.retrace_value(e.index)?;

            // Critic head: descend 1/2 (V - Vret)^2.
            let value_gradient = (value - retrace) * e.weight;

            // Policy head: off-policy policy gradient on the on-policy set,
            // KL(exp || cur) penalty weighted by beta everywhere.
            let mut dist = vec![0.0; cur.distribution_params.len()];
            if self.replay.is_on_policy(e.index)? {
                let advantage = retrace - value;
                let rho = self.replay.trunc_importance_weight(e.index)?;
                let logp = self.model.log_prob_gradient(&action, &cur, &exp);
                for (d, g) in dist.iter_mut().zip(&logp) {
                    *d -= (1.0 - beta) * rho * advantage * g;
                }
            }
            let kl = self.model.kl_gradient(&cur, &exp);
            for (d, g) in dist.iter_mut().zip(&kl) {
                *d += beta * g;
            }
            if e.weight != 1.0 {
                dist.iter_mut().for_each(|d| *d *= e.weight);
            }

            gradients.push(self.model.output_gradient(&cur, value_gradient, &dist));
        }

        self.engine.backward(&gradients).map_err(Self::backend)?;
        let l2 = if self.config.l2_regularization_enabled {
            self.config.l2_regularization_importance
        } else {
            0.0
        };
        self.engine
            .step(self.controller.learning_rate(), l2)
            .map_err(Self::backend)?;
        Ok(())
    }

    fn update_record(&self, entries: &[MiniBatchEntry]) -> Record {
        let avg_retrace = entries
            .iter()
            .filter_map(|e| self.replay.retrace_value(e.index).ok())
            .sum::<f32>()
            / entries.len().max(1) as f32;
        Record::from_slice(&[
            ("off_policy_ratio", Scalar(self.replay.off_policy_ratio())),
            ("cutoff", Scalar(self.controller.cutoff())),
            ("beta", Scalar(self.controller.beta())),
            ("learning_rate", Scalar(self.controller.learning_rate())),
            ("avg_retrace", Scalar(avg_retrace)),
            ("avg_reward", Scalar(self.average_training_reward())),
            ("best_reward", Scalar(self.best_training_reward())),
            ("occupancy", Scalar(self.replay.occupancy())),
            (
                "out_of_bound_actions",
                Scalar(self.out_of_bound_count as f32),
            ),
        ])
    }
}

impl<P, T> Learner for Vracer<P, T>
where
    P: PolicyModel + Serialize + DeserializeOwned,
    T: TensorEngine + Clone + Serialize + DeserializeOwned,
{
    fn process_episode(&mut self, episode: CollectedEpisode) -> Result<()> {
        if episode.experiences.is_empty() {
            warn!("discarding empty episode from environment {}", episode.environment_id);
            return Ok(());
        }
        if self.config.mode == Mode::Testing {
            return Ok(());
        }

        let episode_id = self.episode_count as u64;
        let environment_id = episode.environment_id;
        let raw_return: f32 = episode.experiences.iter().map(|e| e.reward).sum();
        let n_experiences = episode.experiences.len();

        for (pos, mut experience) in episode.experiences.into_iter().enumerate() {
            experience.episode_id = episode_id;
            experience.episode_pos = pos;
            experience.environment_id = environment_id;
            // The penalty precedes reward rescaling, so the running sigma
            // reflects the penalized distribution.
            if self.config.reward_outbound_penalization_enabled
                && action_out_of_bounds(&experience.action, &self.action_lower, &self.action_upper)
            {
                experience.reward *= self.config.reward_outbound_penalization_factor;
                self.out_of_bound_count += 1;
            }
            self.replay.append(experience);
            self.experience_count += 1;
            self.session_experience_count += 1;
        }

        let last = self.replay.newest().unwrap();
        if self.replay.termination(last)? == Termination::Truncated {
            let sequence = truncated_sequence(
                &self.replay,
                &self.rescaler,
                last,
                self.config.time_sequence_length,
            )?;
            let outputs = self.engine.forward(&[sequence]).map_err(Self::backend)?;
            let record = self.model.policy_record(&outputs[0])?;
            self.replay.set_truncated_state_value(last, record.state_value)?;
        }

        // Fresh rows carry unit truncated importance weights, so this sweep
        // is the plain on-policy n-step backup.
        let first = self.replay.episode_first(last)?;
        sweep_episode(&mut self.replay, first, last, self.config.discount_factor)?;

        self.reward_history.push(raw_return);
        self.experience_history.push(n_experiences);
        self.environment_id_history.push(environment_id);
        if raw_return > self.best_reward {
            self.best_reward = raw_return;
            self.best_episode_id = Some(episode_id);
            self.best_params = self.engine.params();
        }
        self.episode_count += 1;
        self.session_episode_count += 1;

        if self.replay.len() >= self.config.experience_replay_start_size
            && self.rescaler.fit_once(&self.replay)?
        {
            info!(
                "state rescaling statistics fixed over {} experiences",
                self.replay.len()
            );
        }
        Ok(())
    }

    fn ready_to_train(&self) -> bool {
        self.config.mode == Mode::Training
            && self.replay.len() >= self.config.experience_replay_start_size
    }

    fn train_policy(&mut self) -> Result<Record> {
        let entries = match self.sampler.sample(&mut self.replay, self.config.mini_batch_size) {
            Ok(entries) => entries,
            Err(VracerError::InsufficientSamples { requested, size }) => {
                warn!("skipping update: {} samples requested, {} stored", requested, size);
                return Ok(Record::empty());
            }
            Err(e) => return Err(e.into()),
        };

        if let Err(e) = self.update_step(&entries) {
            // Backend failures abort the update, not the run.
            if let Some(VracerError::Backend(msg)) = e.downcast_ref::<VracerError>() {
                warn!("policy update aborted by backend: {}", msg);
                return Ok(self.update_record(&entries));
            }
            return Err(e);
        }

        self.controller.update(self.replay.off_policy_ratio());
        self.sampler.anneal();
        self.policy_update_count += 1;
        self.session_policy_update_count += 1;

        Ok(self.update_record(&entries))
    }

    fn policy_snapshot(&self, generation: usize, exploit: bool) -> PolicySnapshot {
        PolicySnapshot {
            params: self.engine.params(),
            policy_update_count: self.policy_update_count,
            generation,
            state_means: self.rescaler.means().to_vec(),
            state_sigmas: self.rescaler.sigmas().to_vec(),
            state_rescaling_applied: self.rescaler.is_applied(),
            exploit,
        }
    }

    fn episode_count(&self) -> usize {
        self.episode_count
    }

    fn experience_count(&self) -> usize {
        self.experience_count
    }

    fn policy_update_count(&self) -> usize {
        self.policy_update_count
    }

    fn average_training_reward(&self) -> f32 {
        Vracer::average_training_reward(self)
    }

    fn best_training_reward(&self) -> f32 {
        Vracer::best_training_reward(self)
    }

    fn serialize_replay(&self, dir: &Path) -> Result<()> {
        self.save_checkpoint(&dir.join("checkpoint.json"))
    }
}

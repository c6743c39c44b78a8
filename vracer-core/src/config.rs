//! Configuration of the learner and the replay memory.
//!
//! The configuration is a closed, strongly-typed record: unknown keys in a
//! YAML file are rejected at load time and inconsistent values are rejected
//! by [`AgentConfig::validate`] before anything is built from them.
use crate::error::VracerError;
use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::{
    fs::File,
    io::{BufReader, Write},
    path::Path,
};

/// Operation mode of the agent.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Mode {
    /// Collect experiences and update the policy.
    Training,

    /// Run the current policy deterministically and report returns.
    Testing,
}

/// How experiences are selected for mini batch creation.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum MiniBatchStrategy {
    /// Sample uniformly without replacement.
    Uniform,

    /// Sample proportionally to rank-based priorities of the TD error.
    Rank,
}

/// When the learner publishes its parameters to the rollouts.
///
/// Per-generation publication gives bounded staleness and reproducible
/// collection; per-update publication trades that for fresher rollouts.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum PolicyPublish {
    /// Snapshot once at the start of each generation.
    PerGeneration,

    /// Snapshot after every policy update.
    PerUpdate,
}

/// Kind of a problem variable.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum VariableKind {
    /// A component of the observation.
    State,

    /// A component of the action.
    Action,
}

/// Configuration of a single problem variable.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct VariableConfig {
    /// Name of the variable.
    pub name: String,

    /// Whether the variable belongs to the state or the action.
    pub kind: VariableKind,

    /// Lower bound. Only used for action variables.
    #[serde(default = "default_lower_bound")]
    pub lower_bound: f32,

    /// Upper bound. Only used for action variables.
    #[serde(default = "default_upper_bound")]
    pub upper_bound: f32,

    /// Initial standard deviation of the exploration noise. Only used for
    /// action variables.
    #[serde(default = "default_exploration_noise")]
    pub initial_exploration_noise: f32,
}

fn default_lower_bound() -> f32 {
    -1.0
}

fn default_upper_bound() -> f32 {
    1.0
}

fn default_exploration_noise() -> f32 {
    1.0
}

impl VariableConfig {
    /// Creates a state variable.
    pub fn state(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            kind: VariableKind::State,
            lower_bound: default_lower_bound(),
            upper_bound: default_upper_bound(),
            initial_exploration_noise: default_exploration_noise(),
        }
    }

    /// Creates an action variable with the given bounds.
    pub fn action(name: impl Into<String>, lower_bound: f32, upper_bound: f32) -> Self {
        Self {
            name: name.into(),
            kind: VariableKind::Action,
            lower_bound,
            upper_bound,
            initial_exploration_noise: default_exploration_noise(),
        }
    }

    /// Sets the initial exploration noise.
    pub fn initial_exploration_noise(mut self, sigma: f32) -> Self {
        self.initial_exploration_noise = sigma;
        self
    }
}

/// Configuration of the off-policy actor-critic learner.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AgentConfig {
    /// Operation mode.
    pub mode: Mode,

    /// Number of concurrent environments collecting experiences.
    pub concurrent_environments: usize,

    /// Episodes to complete per generation.
    pub episodes_per_generation: usize,

    /// Number of experiences per policy update minibatch.
    pub mini_batch_size: usize,

    /// How minibatch experiences are selected from the replay memory.
    pub mini_batch_strategy: MiniBatchStrategy,

    /// Number of contiguous experiences passed to the NN per sample. Values
    /// above one are only useful for recurrent critics.
    pub time_sequence_length: usize,

    /// Initial learning rate.
    pub learning_rate: f32,

    /// Lower clamp for the annealed learning rate.
    pub learning_rate_min: f32,

    /// Whether l2 regularization is applied to the network parameters.
    pub l2_regularization_enabled: bool,

    /// Coefficient of the l2 regularization.
    pub l2_regularization_importance: f32,

    /// Discount factor weighting future rewards.
    pub discount_factor: f32,

    /// Truncation level C for importance weights.
    pub importance_weight_truncation_level: f32,

    /// Hidden layer sizes, forwarded opaquely to the NN backend.
    pub neural_network_hidden_layers: Vec<usize>,

    /// Optimizer used by the NN backend.
    pub neural_network_optimizer: String,

    /// NN backend selector, forwarded opaquely.
    pub neural_network_engine: String,

    /// Minimum number of experiences before training starts.
    pub experience_replay_start_size: usize,

    /// Capacity of the replay memory.
    pub experience_replay_maximum_size: usize,

    /// Initial cutoff for classifying experiences as on- or off-policy.
    pub experience_replay_off_policy_cutoff_scale: f32,

    /// Target fraction D of off-policy experiences in the replay memory.
    pub experience_replay_off_policy_target: f32,

    /// Annealing rate A for cutoff, learning rate and beta, applied per
    /// policy update.
    pub experience_replay_off_policy_annealing_rate: f32,

    /// Initial penalty coefficient beta for off-policiness.
    pub experience_replay_off_policy_refer_beta: f32,

    /// Whether the replay memory is serialized after each generation.
    pub experience_replay_serialize: bool,

    /// Experiences to receive per policy update. Values below one perform
    /// more than one update per experience.
    pub experiences_between_policy_updates: f32,

    /// Whether states are whitened once the replay reaches its start size.
    pub state_rescaling_enabled: bool,

    /// Whether rewards are divided by their per-environment running sigma.
    pub reward_rescaling_enabled: bool,

    /// Whether rewards of experiences with out-of-bound actions are scaled
    /// down before rescaling.
    pub reward_outbound_penalization_enabled: bool,

    /// Factor applied to the reward of an out-of-bound action.
    pub reward_outbound_penalization_factor: f32,

    /// Stop after this many episodes. Zero disables the criterion.
    pub max_episodes: usize,

    /// Stop after this many experiences. Zero disables the criterion.
    pub max_experiences: usize,

    /// Stop after this many policy updates. Zero disables the criterion.
    pub max_policy_updates: usize,

    /// Depth of the trailing average of episode rewards.
    pub training_average_depth: usize,

    /// Stop once the trailing average reward reaches this value.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub training_reward_threshold: Option<f32>,

    /// Per-update annealing rate of the rank sampler's importance sampling
    /// exponent toward one.
    pub importance_weight_annealing_rate: f32,

    /// Exponent alpha of the rank-based priorities.
    pub rank_priority_exponent: f32,

    /// Initial importance sampling exponent of the rank sampler.
    pub importance_sampling_exponent: f32,

    /// Steps after which an episode is truncated. Zero disables the cap.
    pub episode_step_cap: usize,

    /// When the learner publishes parameters to the rollouts.
    pub policy_publish: PolicyPublish,

    /// Seed of all random number generators.
    pub seed: u64,

    /// Problem variables, states and actions.
    pub variables: Vec<VariableConfig>,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            mode: Mode::Training,
            concurrent_environments: 1,
            episodes_per_generation: 1,
            mini_batch_size: 128,
            mini_batch_strategy: MiniBatchStrategy::Uniform,
            time_sequence_length: 1,
            learning_rate: 1e-4,
            learning_rate_min: 1e-7,
            l2_regularization_enabled: false,
            l2_regularization_importance: 1e-4,
            discount_factor: 0.995,
            importance_weight_truncation_level: 4.0,
            neural_network_hidden_layers: vec![128, 128],
            neural_network_optimizer: "Adam".into(),
            neural_network_engine: "Mlp".into(),
            experience_replay_start_size: 512,
            experience_replay_maximum_size: 32768,
            experience_replay_off_policy_cutoff_scale: 4.0,
            experience_replay_off_policy_target: 0.1,
            experience_replay_off_policy_annealing_rate: 5e-7,
            experience_replay_off_policy_refer_beta: 0.3,
            experience_replay_serialize: false,
            experiences_between_policy_updates: 1.0,
            state_rescaling_enabled: false,
            reward_rescaling_enabled: false,
            reward_outbound_penalization_enabled: false,
            reward_outbound_penalization_factor: 0.5,
            max_episodes: 0,
            max_experiences: 0,
            max_policy_updates: 0,
            training_average_depth: 100,
            training_reward_threshold: None,
            importance_weight_annealing_rate: 0.0,
            rank_priority_exponent: 0.7,
            importance_sampling_exponent: 0.5,
            episode_step_cap: 0,
            policy_publish: PolicyPublish::PerGeneration,
            seed: 42,
            variables: vec![],
        }
    }
}

impl AgentConfig {
    /// Sets the operation mode.
    pub fn mode(mut self, mode: Mode) -> Self {
        self.mode = mode;
        self
    }

    /// Sets the number of concurrent environments.
    pub fn concurrent_environments(mut self, n: usize) -> Self {
        self.concurrent_environments = n;
        self
    }

    /// Sets the number of episodes per generation.
    pub fn episodes_per_generation(mut self, n: usize) -> Self {
        self.episodes_per_generation = n;
        self
    }

    /// Sets the minibatch size.
    pub fn mini_batch_size(mut self, n: usize) -> Self {
        self.mini_batch_size = n;
        self
    }

    /// Sets the minibatch selection strategy.
    pub fn mini_batch_strategy(mut self, strategy: MiniBatchStrategy) -> Self {
        self.mini_batch_strategy = strategy;
        self
    }

    /// Sets the time sequence length.
    pub fn time_sequence_length(mut self, len: usize) -> Self {
        self.time_sequence_length = len;
        self
    }

    /// Sets the initial learning rate.
    pub fn learning_rate(mut self, lr: f32) -> Self {
        self.learning_rate = lr;
        self
    }

    /// Sets the discount factor.
    pub fn discount_factor(mut self, gamma: f32) -> Self {
        self.discount_factor = gamma;
        self
    }

    /// Sets the importance weight truncation level.
    pub fn importance_weight_truncation_level(mut self, c: f32) -> Self {
        self.importance_weight_truncation_level = c;
        self
    }

    /// Sets the hidden layer sizes of the NN backend.
    pub fn neural_network_hidden_layers(mut self, layers: Vec<usize>) -> Self {
        self.neural_network_hidden_layers = layers;
        self
    }

    /// Sets the replay start size.
    pub fn experience_replay_start_size(mut self, n: usize) -> Self {
        self.experience_replay_start_size = n;
        self
    }

    /// Sets the replay capacity.
    pub fn experience_replay_maximum_size(mut self, n: usize) -> Self {
        self.experience_replay_maximum_size = n;
        self
    }

    /// Sets the initial off-policy cutoff.
    pub fn experience_replay_off_policy_cutoff_scale(mut self, c: f32) -> Self {
        self.experience_replay_off_policy_cutoff_scale = c;
        self
    }

    /// Sets the target off-policy fraction.
    pub fn experience_replay_off_policy_target(mut self, d: f32) -> Self {
        self.experience_replay_off_policy_target = d;
        self
    }

    /// Sets the annealing rate of the off-policiness controller.
    pub fn experience_replay_off_policy_annealing_rate(mut self, a: f32) -> Self {
        self.experience_replay_off_policy_annealing_rate = a;
        self
    }

    /// Sets the initial penalty coefficient beta.
    pub fn experience_replay_off_policy_refer_beta(mut self, beta: f32) -> Self {
        self.experience_replay_off_policy_refer_beta = beta;
        self
    }

    /// Enables or disables replay serialization per generation.
    pub fn experience_replay_serialize(mut self, enabled: bool) -> Self {
        self.experience_replay_serialize = enabled;
        self
    }

    /// Sets the number of experiences per policy update.
    pub fn experiences_between_policy_updates(mut self, n: f32) -> Self {
        self.experiences_between_policy_updates = n;
        self
    }

    /// Enables or disables one-shot state whitening.
    pub fn state_rescaling_enabled(mut self, enabled: bool) -> Self {
        self.state_rescaling_enabled = enabled;
        self
    }

    /// Enables or disables reward rescaling.
    pub fn reward_rescaling_enabled(mut self, enabled: bool) -> Self {
        self.reward_rescaling_enabled = enabled;
        self
    }

    /// Enables or disables the out-of-bound action penalty.
    pub fn reward_outbound_penalization_enabled(mut self, enabled: bool) -> Self {
        self.reward_outbound_penalization_enabled = enabled;
        self
    }

    /// Sets the out-of-bound penalty factor.
    pub fn reward_outbound_penalization_factor(mut self, f: f32) -> Self {
        self.reward_outbound_penalization_factor = f;
        self
    }

    /// Sets the episode termination criterion.
    pub fn max_episodes(mut self, n: usize) -> Self {
        self.max_episodes = n;
        self
    }

    /// Sets the experience termination criterion.
    pub fn max_experiences(mut self, n: usize) -> Self {
        self.max_experiences = n;
        self
    }

    /// Sets the policy update termination criterion.
    pub fn max_policy_updates(mut self, n: usize) -> Self {
        self.max_policy_updates = n;
        self
    }

    /// Sets the trailing average depth.
    pub fn training_average_depth(mut self, n: usize) -> Self {
        self.training_average_depth = n;
        self
    }

    /// Sets the trailing average reward threshold.
    pub fn training_reward_threshold(mut self, threshold: Option<f32>) -> Self {
        self.training_reward_threshold = threshold;
        self
    }

    /// Sets the per-episode step cap.
    pub fn episode_step_cap(mut self, n: usize) -> Self {
        self.episode_step_cap = n;
        self
    }

    /// Sets the snapshot publication cadence.
    pub fn policy_publish(mut self, publish: PolicyPublish) -> Self {
        self.policy_publish = publish;
        self
    }

    /// Sets the seed of all random number generators.
    pub fn seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self
    }

    /// Sets the problem variables.
    pub fn variables(mut self, variables: Vec<VariableConfig>) -> Self {
        self.variables = variables;
        self
    }

    /// Number of state components.
    pub fn state_dim(&self) -> usize {
        self.variables
            .iter()
            .filter(|v| v.kind == VariableKind::State)
            .count()
    }

    /// Number of action components.
    pub fn action_dim(&self) -> usize {
        self.variables
            .iter()
            .filter(|v| v.kind == VariableKind::Action)
            .count()
    }

    /// Lower bounds of the action components, in declaration order.
    pub fn action_lower_bounds(&self) -> Vec<f32> {
        self.action_vars().map(|v| v.lower_bound).collect()
    }

    /// Upper bounds of the action components, in declaration order.
    pub fn action_upper_bounds(&self) -> Vec<f32> {
        self.action_vars().map(|v| v.upper_bound).collect()
    }

    /// Initial exploration noise of the action components.
    pub fn exploration_noise(&self) -> Vec<f32> {
        self.action_vars()
            .map(|v| v.initial_exploration_noise)
            .collect()
    }

    fn action_vars(&self) -> impl Iterator<Item = &VariableConfig> {
        self.variables
            .iter()
            .filter(|v| v.kind == VariableKind::Action)
    }

    /// Checks the configuration for consistency.
    pub fn validate(&self) -> Result<(), VracerError> {
        let err = |msg: String| Err(VracerError::Config(msg));

        if self.experience_replay_maximum_size == 0 {
            return Err(VracerError::CapacityZero);
        }
        if self.experience_replay_start_size > self.experience_replay_maximum_size {
            return err(format!(
                "replay start size {} exceeds maximum size {}",
                self.experience_replay_start_size, self.experience_replay_maximum_size
            ));
        }
        if self.mini_batch_size == 0 || self.mini_batch_size > self.experience_replay_start_size {
            return err(format!(
                "minibatch size {} must be in 1..={}",
                self.mini_batch_size, self.experience_replay_start_size
            ));
        }
        if self.time_sequence_length == 0 {
            return err("time sequence length must be positive".into());
        }
        if !(self.discount_factor > 0.0 && self.discount_factor <= 1.0) {
            return err(format!("discount factor {} not in (0, 1]", self.discount_factor));
        }
        if self.importance_weight_truncation_level < 1.0 {
            return err(format!(
                "importance weight truncation level {} must be at least 1",
                self.importance_weight_truncation_level
            ));
        }
        if self.experience_replay_off_policy_cutoff_scale < 1.0 {
            return err(format!(
                "off-policy cutoff scale {} must be at least 1",
                self.experience_replay_off_policy_cutoff_scale
            ));
        }
        if !(self.experience_replay_off_policy_target > 0.0
            && self.experience_replay_off_policy_target < 1.0)
        {
            return err(format!(
                "off-policy target {} not in (0, 1)",
                self.experience_replay_off_policy_target
            ));
        }
        if !(self.experience_replay_off_policy_annealing_rate >= 0.0
            && self.experience_replay_off_policy_annealing_rate < 1.0)
        {
            return err(format!(
                "off-policy annealing rate {} not in [0, 1)",
                self.experience_replay_off_policy_annealing_rate
            ));
        }
        if !(self.experience_replay_off_policy_refer_beta >= 0.0
            && self.experience_replay_off_policy_refer_beta <= 1.0)
        {
            return err(format!(
                "initial beta {} not in [0, 1]",
                self.experience_replay_off_policy_refer_beta
            ));
        }
        if !(self.learning_rate > 0.0) {
            return err(format!("learning rate {} must be positive", self.learning_rate));
        }
        if !(self.learning_rate_min > 0.0 && self.learning_rate_min <= self.learning_rate) {
            return err(format!(
                "minimum learning rate {} not in (0, {}]",
                self.learning_rate_min, self.learning_rate
            ));
        }
        if self.concurrent_environments == 0 {
            return err("at least one concurrent environment is required".into());
        }
        if self.episodes_per_generation == 0 {
            return err("at least one episode per generation is required".into());
        }
        if !(self.experiences_between_policy_updates > 0.0) {
            return err(format!(
                "experiences between policy updates {} must be positive",
                self.experiences_between_policy_updates
            ));
        }
        if !(self.importance_weight_annealing_rate >= 0.0
            && self.importance_weight_annealing_rate < 1.0)
        {
            return err(format!(
                "importance weight annealing rate {} not in [0, 1)",
                self.importance_weight_annealing_rate
            ));
        }
        if !(self.rank_priority_exponent > 0.0) {
            return err("rank priority exponent must be positive".into());
        }
        if !(self.importance_sampling_exponent >= 0.0 && self.importance_sampling_exponent <= 1.0)
        {
            return err("importance sampling exponent not in [0, 1]".into());
        }
        if self.training_average_depth == 0 {
            return err("training average depth must be positive".into());
        }
        if self.state_dim() == 0 {
            return err("at least one state variable is required".into());
        }
        if self.action_dim() == 0 {
            return err("at least one action variable is required".into());
        }
        for v in self.action_vars() {
            if !(v.lower_bound < v.upper_bound) {
                return err(format!(
                    "action variable {} has bounds [{}, {}]",
                    v.name, v.lower_bound, v.upper_bound
                ));
            }
            if !(v.initial_exploration_noise > 0.0) {
                return err(format!(
                    "action variable {} has non-positive exploration noise",
                    v.name
                ));
            }
        }
        Ok(())
    }

    /// Loads the configuration from a YAML file. Unknown keys are rejected.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let file = File::open(path)?;
        let rdr = BufReader::new(file);
        let config: Self = serde_yaml::from_reader(rdr)?;
        config.validate()?;
        Ok(config)
    }

    /// Saves the configuration to a YAML file.
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let mut file = File::create(path)?;
        file.write_all(serde_yaml::to_string(&self)?.as_bytes())?;
        Ok(())
    }
}

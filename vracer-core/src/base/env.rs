//! Environment.
use anyhow::Result;

/// Result of a single environment step.
#[derive(Clone, Debug)]
pub struct EnvStep {
    /// Observation after the action.
    pub obs: Vec<f32>,

    /// Reward received for the action.
    pub reward: f32,

    /// True if the episode ended in a terminal state of the MDP.
    pub is_terminal: bool,
}

/// Represents an environment, typically an MDP.
///
/// Environments are built per worker with a seed, so a rollout is
/// reproducible given the same seed. An error returned by [`Env::step`]
/// truncates the episode being collected; it does not stop training.
pub trait Env {
    /// Configurations.
    type Config: Clone + Send;

    /// Builds an environment.
    fn build(config: &Self::Config, seed: u64) -> Result<Self>
    where
        Self: Sized;

    /// Resets the environment, returning the initial observation.
    fn reset(&mut self) -> Result<Vec<f32>>;

    /// Performs an environment step.
    fn step(&mut self, action: &[f32]) -> Result<EnvStep>;
}

//! Errors in the library.
use thiserror::Error;

/// Errors raised by the replay memory, the learner and the rollout pipeline.
///
/// Configuration and numeric failures are fatal: the learner stops and
/// reports. Stale indices and undersized replays are recovered by skipping
/// the affected minibatch row or step. Backend errors abort the current
/// policy update only, and rollout errors truncate the offending episode.
#[derive(Error, Debug)]
pub enum VracerError {
    /// Invalid configuration, caught at initialization.
    #[error("Configuration error: {0}")]
    Config(String),

    /// A non-finite value appeared in rescaling, importance weights or
    /// retrace targets.
    #[error("Numeric failure: {0}")]
    NumericFailure(String),

    /// A circular buffer cannot be built with zero capacity.
    #[error("Replay memory capacity must be positive")]
    CapacityZero,

    /// More samples were requested than the replay memory holds.
    #[error("Requested {requested} samples from a replay memory of size {size}")]
    InsufficientSamples {
        /// Number of samples requested.
        requested: usize,
        /// Current size of the replay memory.
        size: usize,
    },

    /// A logical index referred to a row that has already been evicted.
    #[error("Experience {0} has been evicted from the replay memory")]
    StaleIndex(u64),

    /// The NN backend failed. The message is forwarded verbatim.
    #[error("Backend error: {0}")]
    Backend(String),

    /// An environment reported an error during rollout.
    #[error("Rollout error in environment {env_id}: {msg}")]
    Rollout {
        /// Id of the environment that failed.
        env_id: usize,
        /// Error reported by the environment.
        msg: String,
    },
}

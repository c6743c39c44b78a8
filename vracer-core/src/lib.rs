#![warn(missing_docs)]
//! Core components for off-policy actor-critic learning.
//!
//! # Replay memory
//!
//! [`ReplayMemory`] is a bounded, column-oriented store of experiences. Each
//! field of an [`Experience`] lives in its own [`CircularBuffer`] and all
//! columns share one logical index space, so row `i` is consistent across
//! columns. Collection-time fields are frozen at insertion; derived
//! metadata (the current policy record, importance weights, retrace values)
//! is refreshed whenever a row appears in a minibatch.
//!
//! # Sampling and rescaling
//!
//! [`MiniBatchSampler`] selects experience indices either uniformly without
//! replacement or by rank-based priorities of the TD error.
//! [`StateRescaler`] whitens states entering the policy evaluator once the
//! replay reached its start size; reward rescaling is continuous and lives
//! in the replay memory as a per-environment running sigma.
//!
//! # Seams
//!
//! The learner and the rollouts are connected through traits: [`Learner`]
//! owns replay and parameters and performs policy updates; [`EpisodeSource`]
//! supplies completed episodes and distributes [`PolicySnapshot`]s;
//! [`TensorEngine`] is the black-box bridge to the NN backend; [`Env`] is
//! implemented by environment simulations.
//!
//! # Trainer
//!
//! [`Trainer`] drives the per-generation loop: publish a snapshot, collect
//! episodes, ingest them, run as many policy updates as the experience
//! budget allows, and stop once a termination criterion fires.
pub mod cbuffer;
pub mod config;
pub mod error;
pub mod experience;
pub mod record;
pub mod replay;
pub mod rescaling;
pub mod sampler;

mod base;
pub use base::{Env, EnvStep, EpisodeSource, Learner, PolicySnapshot, RolloutPolicy, TensorEngine};

mod trainer;
pub use cbuffer::CircularBuffer;
pub use config::{AgentConfig, MiniBatchStrategy, Mode, PolicyPublish, VariableConfig, VariableKind};
pub use error::VracerError;
pub use experience::{CollectedEpisode, Experience, PolicyRecord, Termination};
pub use record::{Record, RecordValue};
pub use replay::{MetadataUpdate, ReplayMemory};
pub use rescaling::{action_out_of_bounds, StateRescaler};
pub use sampler::{MiniBatchEntry, MiniBatchSampler};
pub use trainer::{TerminationReason, Trainer};

#![warn(missing_docs)]
//! Concurrent environment rollouts feeding an off-policy learner.
//!
//! Two implementations of [`EpisodeSource`](vracer_core::EpisodeSource)
//! live here. [`SerialRollout`] runs every episode on the calling thread
//! and is fully deterministic. [`RolloutCoordinator`] spawns one worker
//! thread per environment; workers send an [`ActionRequest`] per step and
//! the coordinator answers each from the most recently published snapshot,
//! so collection is always on-policy with respect to the learner's view.
//!
//! Both sources execute episodes through [`SampleDispatcher`], the
//! abstraction hiding whether tasks run in-process, on a thread pool, or on
//! remote ranks.
mod coordinator;
mod dispatcher;
mod episode;
mod messages;

pub use coordinator::{RolloutCoordinator, RolloutConfig, SerialRollout};
pub use dispatcher::{SampleDispatcher, SerialDispatcher, TaskFuture, ThreadPoolDispatcher};
pub use episode::{run_episode, ChannelClient, PolicyClient, SharedPolicy};
pub use messages::{ActionReply, ActionRequest};

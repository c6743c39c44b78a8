#![warn(missing_docs)]
//! Off-policy actor-critic agent with retrace value targets.
//!
//! [`Vracer`] implements [`Learner`](vracer_core::Learner): it owns the
//! replay memory and, per policy update, samples a minibatch, refreshes its
//! metadata under the latest network, recomputes retrace targets backward
//! through the affected episodes, and descends a loss combining the critic
//! regression, a truncated importance-weighted policy gradient over the
//! on-policy experiences, and a KL penalty toward the experience policies
//! weighted by the controller's beta.
//!
//! The action distribution is pluggable through [`PolicyModel`]:
//! [`ContinuousPolicy`] is a squashed normal over box-bounded actions,
//! [`DiscretePolicy`] a categorical over a fixed action set. The network is
//! behind [`TensorEngine`](vracer_core::TensorEngine); [`MlpEngine`] is the
//! backend-free reference implementation.
//!
//! [`SnapshotPolicy`] is the rollout-side counterpart, answering action
//! queries from published parameter snapshots. [`Checkpoint`] persists the
//! whole learner as one self-describing record.
mod base;
mod checkpoint;
mod continuous;
mod discrete;
mod mlp;
mod policy;
mod refer;
pub mod retrace;
mod rollout;

pub use base::Vracer;
pub use checkpoint::Checkpoint;
pub use continuous::ContinuousPolicy;
pub use discrete::DiscretePolicy;
pub use mlp::MlpEngine;
pub use policy::PolicyModel;
pub use refer::ReferController;
pub use rollout::SnapshotPolicy;

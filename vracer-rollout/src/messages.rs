//! Messages between workers and the coordinator.
use crossbeam_channel::Sender;
use vracer_core::PolicyRecord;

/// A worker's request for one action.
///
/// The reply channel travels with the request, so the coordinator answers
/// whichever worker asked without tracking routing state.
pub struct ActionRequest {
    /// Worker that asked.
    pub worker_id: usize,

    /// Raw state sequence the action should be computed from.
    pub state_seq: Vec<Vec<f32>>,

    /// Where the reply is sent.
    pub reply: Sender<ActionReply>,
}

/// The coordinator's answer to an [`ActionRequest`].
pub struct ActionReply {
    /// Action to apply to the environment.
    pub action: Vec<f32>,

    /// Policy record that generated the action, stored with the experience.
    pub exp_policy: PolicyRecord,
}

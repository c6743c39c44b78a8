//! Data model of experiences stored in the replay memory.
use serde::{Deserialize, Serialize};

/// Termination status of an experience.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Termination {
    /// The episode continues after this experience.
    NonTerminal,

    /// The terminal experience of a normally ended episode. The MDP ends
    /// here, so value backups do not bootstrap past it.
    Terminal,

    /// The terminal experience of an episode cut short for time-budget
    /// reasons. Backups bootstrap from the saved truncated state.
    Truncated,
}

/// Parameters of the policy distribution at a single state.
///
/// For continuous squashed-normal policies, `unbounded_action` keeps the
/// pre-tanh sample so that log-probabilities can be recomputed exactly when
/// the experience is revisited under a newer policy. The discrete fields are
/// used by categorical policies only.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct PolicyRecord {
    /// State value estimated by the critic head.
    pub state_value: f32,

    /// Parameters defining the policy distribution. For continuous policies
    /// these are the distribution moments; for discrete policies the action
    /// values fed to the softmax.
    pub distribution_params: Vec<f32>,

    /// \[Discrete\] Index of the selected action.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub action_index: Option<usize>,

    /// \[Discrete\] Probabilities of the categorical distribution.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub action_probabilities: Option<Vec<f32>>,

    /// \[Continuous\] Pre-tanh sample of the squashed normal distribution.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub unbounded_action: Option<Vec<f32>>,
}

/// A single agent-environment interaction as produced by a rollout.
///
/// These are the collection-time fields of a replay row. Derived metadata
/// (current policy, importance weights, retrace values) lives in the replay
/// memory columns and is refreshed as the policy drifts; the fields here are
/// frozen once the experience is appended.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Experience {
    /// Observation at the time the action was taken.
    pub state: Vec<f32>,

    /// Action taken by the agent.
    pub action: Vec<f32>,

    /// Scalar reward received after taking the action.
    pub reward: f32,

    /// Episode this experience belongs to. Assigned by the learner on
    /// ingestion; rollouts leave it at zero.
    pub episode_id: u64,

    /// Position within the episode, starting at zero.
    pub episode_pos: usize,

    /// Environment that produced the experience.
    pub environment_id: usize,

    /// Whether the experience ends its episode, and how.
    pub termination: Termination,

    /// Observation after a truncated terminal experience. Present iff
    /// `termination == Truncated`.
    pub truncated_state: Option<Vec<f32>>,

    /// The policy that generated the action, frozen at collection time.
    pub exp_policy: PolicyRecord,
}

impl Experience {
    /// Returns true if this experience ends its episode.
    pub fn is_terminal(&self) -> bool {
        self.termination != Termination::NonTerminal
    }
}

/// A completed episode flushed from a rollout to the learner.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CollectedEpisode {
    /// Environment the episode was collected from.
    pub environment_id: usize,

    /// Experiences in the order they were produced. The last one has a
    /// termination other than `NonTerminal`.
    pub experiences: Vec<Experience>,
}

impl CollectedEpisode {
    /// Sum of rewards over the episode.
    pub fn cumulative_reward(&self) -> f32 {
        self.experiences.iter().map(|e| e.reward).sum()
    }
}

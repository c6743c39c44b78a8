//! Column-oriented replay memory.
use crate::{
    cbuffer::CircularBuffer,
    error::VracerError,
    experience::{Experience, PolicyRecord, Termination},
};
use serde::{Deserialize, Serialize};

/// Derived metadata of a row, written back by a whole-minibatch refresh.
#[derive(Clone, Debug)]
pub struct MetadataUpdate {
    /// Policy record re-evaluated under the latest network.
    pub cur_policy: PolicyRecord,

    /// State value from the current critic head.
    pub state_value: f32,

    /// Importance weight of the stored action under current vs experience
    /// policy.
    pub importance_weight: f32,

    /// Importance weight truncated at the configured level.
    pub trunc_importance_weight: f32,

    /// Whether the importance weight lies within the current cutoff band.
    pub is_on_policy: bool,

    /// State value of the truncated state, for truncated terminals.
    pub truncated_state_value: Option<f32>,
}

/// Bounded store of experiences plus derived metadata.
///
/// Each field of an experience lives in its own circular buffer; all columns
/// share a single head and size so a logical index addresses a consistent
/// row across columns. Logical indices grow monotonically; once a row is
/// evicted its index stays invalid forever and resolves to
/// [`VracerError::StaleIndex`].
///
/// `exp_policy` and the other collection-time columns are frozen at
/// insertion. The derived columns are refreshed for any row used in a
/// minibatch, and the off-policy count is maintained incrementally across
/// updates and evictions.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ReplayMemory {
    states: CircularBuffer<Vec<f32>>,
    actions: CircularBuffer<Vec<f32>>,
    rewards: CircularBuffer<f32>,
    episode_ids: CircularBuffer<u64>,
    episode_positions: CircularBuffer<usize>,
    environment_ids: CircularBuffer<usize>,
    terminations: CircularBuffer<Termination>,
    truncated_states: CircularBuffer<Option<Vec<f32>>>,
    exp_policies: CircularBuffer<PolicyRecord>,

    cur_policies: CircularBuffer<PolicyRecord>,
    importance_weights: CircularBuffer<f32>,
    trunc_importance_weights: CircularBuffer<f32>,
    state_values: CircularBuffer<f32>,
    retrace_values: CircularBuffer<f32>,
    truncated_state_values: CircularBuffer<f32>,
    on_policy_flags: CircularBuffer<bool>,
    priorities: CircularBuffer<f32>,
    probabilities: CircularBuffer<f32>,

    /// Logical index of the row at offset zero.
    oldest: u64,
    off_policy_count: usize,
    experience_count_per_env: Vec<usize>,
    sum_squared_rewards: Vec<f32>,
    reward_rescaling_enabled: bool,
}

impl ReplayMemory {
    /// Creates an empty replay memory.
    pub fn new(
        capacity: usize,
        n_environments: usize,
        reward_rescaling_enabled: bool,
    ) -> Result<Self, VracerError> {
        Ok(Self {
            states: CircularBuffer::new(capacity)?,
            actions: CircularBuffer::new(capacity)?,
            rewards: CircularBuffer::new(capacity)?,
            episode_ids: CircularBuffer::new(capacity)?,
            episode_positions: CircularBuffer::new(capacity)?,
            environment_ids: CircularBuffer::new(capacity)?,
            terminations: CircularBuffer::new(capacity)?,
            truncated_states: CircularBuffer::new(capacity)?,
            exp_policies: CircularBuffer::new(capacity)?,
            cur_policies: CircularBuffer::new(capacity)?,
            importance_weights: CircularBuffer::new(capacity)?,
            trunc_importance_weights: CircularBuffer::new(capacity)?,
            state_values: CircularBuffer::new(capacity)?,
            retrace_values: CircularBuffer::new(capacity)?,
            truncated_state_values: CircularBuffer::new(capacity)?,
            on_policy_flags: CircularBuffer::new(capacity)?,
            priorities: CircularBuffer::new(capacity)?,
            probabilities: CircularBuffer::new(capacity)?,
            oldest: 0,
            off_policy_count: 0,
            experience_count_per_env: vec![0; n_environments],
            sum_squared_rewards: vec![0.0; n_environments],
            reward_rescaling_enabled,
        })
    }

    /// Number of rows currently stored.
    pub fn len(&self) -> usize {
        self.states.len()
    }

    /// Returns true if no rows are stored.
    pub fn is_empty(&self) -> bool {
        self.states.is_empty()
    }

    /// Maximum number of rows.
    pub fn capacity(&self) -> usize {
        self.states.capacity()
    }

    /// Fill fraction, `size / MaxSize`.
    pub fn occupancy(&self) -> f32 {
        self.len() as f32 / self.capacity() as f32
    }

    /// Logical index of the oldest stored row.
    pub fn oldest(&self) -> Option<u64> {
        (!self.is_empty()).then(|| self.oldest)
    }

    /// Logical index of the newest stored row.
    pub fn newest(&self) -> Option<u64> {
        (!self.is_empty()).then(|| self.oldest + self.len() as u64 - 1)
    }

    /// All currently valid logical indices, oldest first.
    pub fn indices(&self) -> std::ops::Range<u64> {
        self.oldest..self.oldest + self.len() as u64
    }

    /// Returns true if the logical index still resolves to a stored row.
    pub fn contains(&self, index: u64) -> bool {
        self.indices().contains(&index)
    }

    /// Appends an experience, evicting the oldest row when full.
    ///
    /// The derived columns are seeded from the experience policy: at
    /// insertion time the experience is exactly on-policy, so its importance
    /// weight is one and its state value is the collector's estimate. The
    /// retrace column starts at the state value until the owning episode's
    /// backward sweep overwrites it.
    pub fn append(&mut self, experience: Experience) -> u64 {
        let Experience {
            state,
            action,
            reward,
            episode_id,
            episode_pos,
            environment_id,
            termination,
            truncated_state,
            exp_policy,
        } = experience;

        let state_value = exp_policy.state_value;
        let evicted_env = self.environment_ids.push(environment_id);
        let evicted_reward = self.rewards.push(reward);
        let evicted_on_policy = self.on_policy_flags.push(true);

        self.states.push(state);
        self.actions.push(action);
        self.episode_ids.push(episode_id);
        self.episode_positions.push(episode_pos);
        self.terminations.push(termination);
        self.truncated_states.push(truncated_state);
        self.cur_policies.push(exp_policy.clone());
        self.exp_policies.push(exp_policy);
        self.importance_weights.push(1.0);
        self.trunc_importance_weights.push(1.0);
        self.state_values.push(state_value);
        self.retrace_values.push(state_value);
        self.truncated_state_values.push(0.0);
        self.priorities.push(1.0);
        self.probabilities.push(0.0);

        if let Some(env) = evicted_env {
            self.oldest += 1;
            self.experience_count_per_env[env] -= 1;
            let r = evicted_reward.unwrap_or(0.0);
            self.sum_squared_rewards[env] = (self.sum_squared_rewards[env] - r * r).max(0.0);
            if evicted_on_policy == Some(false) {
                self.off_policy_count -= 1;
            }
        }

        self.experience_count_per_env[environment_id] += 1;
        self.sum_squared_rewards[environment_id] += reward * reward;

        self.oldest + self.len() as u64 - 1
    }

    fn offset(&self, index: u64) -> Result<usize, VracerError> {
        if self.contains(index) {
            Ok((index - self.oldest) as usize)
        } else {
            Err(VracerError::StaleIndex(index))
        }
    }

    /// Observation of the given row.
    pub fn state(&self, index: u64) -> Result<&Vec<f32>, VracerError> {
        Ok(self.states.get(self.offset(index)?).unwrap())
    }

    /// Action of the given row.
    pub fn action(&self, index: u64) -> Result<&Vec<f32>, VracerError> {
        Ok(self.actions.get(self.offset(index)?).unwrap())
    }

    /// Stored (penalized, unscaled) reward of the given row.
    pub fn reward(&self, index: u64) -> Result<f32, VracerError> {
        Ok(*self.rewards.get(self.offset(index)?).unwrap())
    }

    /// Episode the row belongs to.
    pub fn episode_id(&self, index: u64) -> Result<u64, VracerError> {
        Ok(*self.episode_ids.get(self.offset(index)?).unwrap())
    }

    /// Position of the row within its episode.
    pub fn episode_pos(&self, index: u64) -> Result<usize, VracerError> {
        Ok(*self.episode_positions.get(self.offset(index)?).unwrap())
    }

    /// Environment the row was collected from.
    pub fn environment_id(&self, index: u64) -> Result<usize, VracerError> {
        Ok(*self.environment_ids.get(self.offset(index)?).unwrap())
    }

    /// Termination status of the row.
    pub fn termination(&self, index: u64) -> Result<Termination, VracerError> {
        Ok(*self.terminations.get(self.offset(index)?).unwrap())
    }

    /// Truncated state of the row, present for truncated terminals.
    pub fn truncated_state(&self, index: u64) -> Result<Option<&Vec<f32>>, VracerError> {
        Ok(self.truncated_states.get(self.offset(index)?).unwrap().as_ref())
    }

    /// Policy that generated the action, frozen at collection time.
    pub fn exp_policy(&self, index: u64) -> Result<&PolicyRecord, VracerError> {
        Ok(self.exp_policies.get(self.offset(index)?).unwrap())
    }

    /// Policy record re-evaluated under the latest network.
    pub fn cur_policy(&self, index: u64) -> Result<&PolicyRecord, VracerError> {
        Ok(self.cur_policies.get(self.offset(index)?).unwrap())
    }

    /// Latest importance weight of the row.
    pub fn importance_weight(&self, index: u64) -> Result<f32, VracerError> {
        Ok(*self.importance_weights.get(self.offset(index)?).unwrap())
    }

    /// Latest truncated importance weight of the row.
    pub fn trunc_importance_weight(&self, index: u64) -> Result<f32, VracerError> {
        Ok(*self.trunc_importance_weights.get(self.offset(index)?).unwrap())
    }

    /// Latest state value of the row.
    pub fn state_value(&self, index: u64) -> Result<f32, VracerError> {
        Ok(*self.state_values.get(self.offset(index)?).unwrap())
    }

    /// Latest retrace value of the row.
    pub fn retrace_value(&self, index: u64) -> Result<f32, VracerError> {
        Ok(*self.retrace_values.get(self.offset(index)?).unwrap())
    }

    /// Latest state value of the truncated state.
    pub fn truncated_state_value(&self, index: u64) -> Result<f32, VracerError> {
        Ok(*self.truncated_state_values.get(self.offset(index)?).unwrap())
    }

    /// Whether the row is classified on-policy.
    pub fn is_on_policy(&self, index: u64) -> Result<bool, VracerError> {
        Ok(*self.on_policy_flags.get(self.offset(index)?).unwrap())
    }

    /// Sampling priority of the row.
    pub fn priority(&self, index: u64) -> Result<f32, VracerError> {
        Ok(*self.priorities.get(self.offset(index)?).unwrap())
    }

    /// Sampling probability of the row.
    pub fn probability(&self, index: u64) -> Result<f32, VracerError> {
        Ok(*self.probabilities.get(self.offset(index)?).unwrap())
    }

    /// Writes back refreshed metadata, maintaining the off-policy count.
    pub fn update_metadata(
        &mut self,
        index: u64,
        update: MetadataUpdate,
    ) -> Result<(), VracerError> {
        let offset = self.offset(index)?;

        let was_on_policy = *self.on_policy_flags.get(offset).unwrap();
        match (was_on_policy, update.is_on_policy) {
            (true, false) => self.off_policy_count += 1,
            (false, true) => self.off_policy_count -= 1,
            _ => {}
        }

        *self.cur_policies.get_mut(offset).unwrap() = update.cur_policy;
        *self.state_values.get_mut(offset).unwrap() = update.state_value;
        *self.importance_weights.get_mut(offset).unwrap() = update.importance_weight;
        *self.trunc_importance_weights.get_mut(offset).unwrap() = update.trunc_importance_weight;
        *self.on_policy_flags.get_mut(offset).unwrap() = update.is_on_policy;
        if let Some(v) = update.truncated_state_value {
            *self.truncated_state_values.get_mut(offset).unwrap() = v;
        }
        Ok(())
    }

    /// Overwrites the retrace value of a row.
    pub fn set_retrace_value(&mut self, index: u64, value: f32) -> Result<(), VracerError> {
        let offset = self.offset(index)?;
        *self.retrace_values.get_mut(offset).unwrap() = value;
        Ok(())
    }

    /// Overwrites the state value of a truncated terminal's saved state.
    pub fn set_truncated_state_value(&mut self, index: u64, value: f32) -> Result<(), VracerError> {
        let offset = self.offset(index)?;
        *self.truncated_state_values.get_mut(offset).unwrap() = value;
        Ok(())
    }

    /// Overwrites the sampling priority of a row.
    pub fn set_priority(&mut self, index: u64, priority: f32) -> Result<(), VracerError> {
        let offset = self.offset(index)?;
        *self.priorities.get_mut(offset).unwrap() = priority;
        Ok(())
    }

    /// Overwrites the sampling probability of a row.
    pub fn set_probability(&mut self, index: u64, probability: f32) -> Result<(), VracerError> {
        let offset = self.offset(index)?;
        *self.probabilities.get_mut(offset).unwrap() = probability;
        Ok(())
    }

    /// Number of rows currently classified off-policy.
    pub fn off_policy_count(&self) -> usize {
        self.off_policy_count
    }

    /// Fraction of rows currently classified off-policy.
    pub fn off_policy_ratio(&self) -> f32 {
        if self.is_empty() {
            0.0
        } else {
            self.off_policy_count as f32 / self.len() as f32
        }
    }

    /// Number of stored rows collected from the given environment.
    pub fn experience_count(&self, environment_id: usize) -> usize {
        self.experience_count_per_env[environment_id]
    }

    /// Running standard deviation of rewards in the given environment.
    ///
    /// One when rescaling is disabled, the environment is empty, or the
    /// rewards are all zero.
    pub fn reward_sigma(&self, environment_id: usize) -> f32 {
        if !self.reward_rescaling_enabled {
            return 1.0;
        }
        let count = self.experience_count_per_env[environment_id];
        if count == 0 {
            return 1.0;
        }
        let sigma = (self.sum_squared_rewards[environment_id] / count as f32).sqrt();
        if sigma > 0.0 && sigma.is_finite() {
            sigma
        } else {
            1.0
        }
    }

    /// Reward of the row divided by its environment's running sigma.
    pub fn scaled_reward(&self, index: u64) -> Result<f32, VracerError> {
        let reward = self.reward(index)?;
        let env = self.environment_id(index)?;
        let scaled = reward / self.reward_sigma(env);
        if !scaled.is_finite() {
            return Err(VracerError::NumericFailure(format!(
                "scaled reward of experience {} in environment {} is {}",
                index, env, scaled
            )));
        }
        Ok(scaled)
    }

    /// Earliest stored row of the episode owning `index`.
    ///
    /// Clamped at the oldest row when eviction has cut the episode's start.
    pub fn episode_first(&self, index: u64) -> Result<u64, VracerError> {
        let episode = self.episode_id(index)?;
        let mut first = index;
        while first > self.oldest && self.episode_id(first - 1)? == episode {
            first -= 1;
        }
        Ok(first)
    }

    /// Latest stored row of the episode owning `index`.
    pub fn episode_last(&self, index: u64) -> Result<u64, VracerError> {
        let episode = self.episode_id(index)?;
        let newest = self.newest().unwrap();
        let mut last = index;
        while last < newest && self.episode_id(last + 1)? == episode {
            last += 1;
        }
        Ok(last)
    }

    /// Iterates over the stored states, oldest first.
    pub fn states_iter(&self) -> impl Iterator<Item = &Vec<f32>> {
        self.states.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::experience::Termination::{NonTerminal, Terminal};

    fn experience(episode_id: u64, episode_pos: usize, reward: f32) -> Experience {
        Experience {
            state: vec![episode_pos as f32],
            action: vec![0.0],
            reward,
            episode_id,
            episode_pos,
            environment_id: 0,
            termination: NonTerminal,
            truncated_state: None,
            exp_policy: PolicyRecord {
                state_value: 0.5,
                distribution_params: vec![0.0, 1.0],
                ..Default::default()
            },
        }
    }

    fn off_policy_update(on: bool) -> MetadataUpdate {
        MetadataUpdate {
            cur_policy: PolicyRecord::default(),
            state_value: 0.0,
            importance_weight: if on { 1.0 } else { 10.0 },
            trunc_importance_weight: 1.0,
            is_on_policy: on,
            truncated_state_value: None,
        }
    }

    #[test]
    fn size_tracks_min_of_seen_and_capacity() {
        let mut replay = ReplayMemory::new(4, 1, false).unwrap();
        for i in 0..6 {
            replay.append(experience(0, i, 0.0));
        }
        assert_eq!(replay.len(), 4);
        assert_eq!(replay.oldest(), Some(2));
        assert_eq!(replay.newest(), Some(5));
        assert!((replay.occupancy() - 1.0).abs() < f32::EPSILON);
    }

    #[test]
    fn evicted_rows_become_stale() {
        let mut replay = ReplayMemory::new(2, 1, false).unwrap();
        replay.append(experience(0, 0, 0.0));
        replay.append(experience(0, 1, 0.0));
        replay.append(experience(0, 2, 0.0));
        assert!(matches!(replay.reward(0), Err(VracerError::StaleIndex(0))));
        assert!(replay.reward(1).is_ok());
    }

    #[test]
    fn off_policy_count_follows_updates_and_eviction() {
        let mut replay = ReplayMemory::new(2, 1, false).unwrap();
        let a = replay.append(experience(0, 0, 0.0));
        let b = replay.append(experience(0, 1, 0.0));
        replay.update_metadata(a, off_policy_update(false)).unwrap();
        replay.update_metadata(b, off_policy_update(false)).unwrap();
        assert_eq!(replay.off_policy_count(), 2);

        // Re-classifying on-policy decrements.
        replay.update_metadata(b, off_policy_update(true)).unwrap();
        assert_eq!(replay.off_policy_count(), 1);

        // Evicting the off-policy row decrements.
        replay.append(experience(1, 0, 0.0));
        assert_eq!(replay.off_policy_count(), 0);
        assert_eq!(replay.off_policy_ratio(), 0.0);
    }

    #[test]
    fn reward_sigma_tracks_running_sum_of_squares() {
        let mut replay = ReplayMemory::new(4, 1, true).unwrap();
        for i in 0..4 {
            replay.append(experience(0, i, 2.0));
        }
        assert!((replay.reward_sigma(0) - 2.0).abs() < 1e-6);

        // Eviction subtracts the evicted reward's square.
        replay.append(experience(1, 0, 0.0));
        let expected = (12.0f32 / 4.0).sqrt();
        assert!((replay.reward_sigma(0) - expected).abs() < 1e-6);
    }

    #[test]
    fn sigma_of_zero_rewards_falls_back_to_one() {
        let mut replay = ReplayMemory::new(4, 1, true).unwrap();
        replay.append(experience(0, 0, 0.0));
        assert_eq!(replay.reward_sigma(0), 1.0);
    }

    #[test]
    fn episode_bounds_walk_contiguous_ids() {
        let mut replay = ReplayMemory::new(8, 1, false).unwrap();
        for i in 0..3 {
            let mut e = experience(0, i, 0.0);
            if i == 2 {
                e.termination = Terminal;
            }
            replay.append(e);
        }
        for i in 0..2 {
            replay.append(experience(1, i, 0.0));
        }
        assert_eq!(replay.episode_first(1).unwrap(), 0);
        assert_eq!(replay.episode_last(1).unwrap(), 2);
        assert_eq!(replay.episode_first(4).unwrap(), 3);
        assert_eq!(replay.episode_last(3).unwrap(), 4);
    }

    #[test]
    fn episode_start_clamps_at_eviction_boundary() {
        let mut replay = ReplayMemory::new(2, 1, false).unwrap();
        for i in 0..3 {
            replay.append(experience(0, i, 0.0));
        }
        assert_eq!(replay.episode_first(2).unwrap(), 1);
    }
}

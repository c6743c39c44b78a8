//! Importance weights and retrace value backups.
//!
//! Given a minibatch of experience indices, this module re-evaluates the
//! rows under the latest network (one concatenated forward pass), rewrites
//! their derived metadata, and recomputes retrace targets backward through
//! every episode that owns a refreshed row. The backward sweep works on a
//! scratch copy of the episode's columns, so the recursion never reads rows
//! it has just written.
use crate::policy::PolicyModel;
use anyhow::Result;
use vracer_core::{
    MetadataUpdate, ReplayMemory, StateRescaler, TensorEngine, Termination, VracerError,
};

/// Pads a sequence at the front, by repeating its first element, to the
/// given length.
pub(crate) fn pad_sequence(mut sequence: Vec<Vec<f32>>, len: usize) -> Vec<Vec<f32>> {
    while sequence.len() < len {
        sequence.insert(0, sequence[0].clone());
    }
    sequence
}

/// Whitened state sequence of `len` steps ending at `index`, clamped at the
/// episode's start (or the oldest stored row, whichever is later).
pub(crate) fn state_sequence(
    replay: &ReplayMemory,
    rescaler: &StateRescaler,
    index: u64,
    len: usize,
) -> Result<Vec<Vec<f32>>, VracerError> {
    let first = replay.episode_first(index)?.max(index + 1 - (len as u64).min(index + 1));
    let sequence: Vec<Vec<f32>> = (first..=index)
        .map(|i| Ok(rescaler.apply(replay.state(i)?)))
        .collect::<Result<_, VracerError>>()?;
    Ok(pad_sequence(sequence, len))
}

/// Whitened sequence ending at the truncated state saved on `index`.
pub(crate) fn truncated_sequence(
    replay: &ReplayMemory,
    rescaler: &StateRescaler,
    index: u64,
    len: usize,
) -> Result<Vec<Vec<f32>>, VracerError> {
    let truncated = replay
        .truncated_state(index)?
        .ok_or_else(|| {
            VracerError::NumericFailure(format!(
                "experience {} is truncated but has no saved state",
                index
            ))
        })?
        .clone();
    let mut sequence = state_sequence(replay, rescaler, index, len)?;
    sequence.remove(0);
    sequence.push(rescaler.apply(&truncated));
    Ok(sequence)
}

/// Refreshes the derived metadata of the given rows and recomputes retrace
/// targets for every episode owning at least one of them.
///
/// `indices` may contain duplicates; each distinct row is evaluated once.
/// Importance weights are capped at the truncation level when the
/// experience policy's density is numerically zero; any other non-finite
/// value is a numeric failure that aborts the generation.
pub fn refresh_minibatch<P, T>(
    replay: &mut ReplayMemory,
    rescaler: &StateRescaler,
    model: &P,
    engine: &mut T,
    indices: &[u64],
    time_sequence_length: usize,
    truncation_level: f32,
    cutoff: f32,
    discount_factor: f32,
) -> Result<()>
where
    P: PolicyModel,
    T: TensorEngine,
{
    let mut unique: Vec<u64> = indices.to_vec();
    unique.sort_unstable();
    unique.dedup();

    // Episodes owning refreshed rows, keyed by their earliest stored row.
    let mut episodes: Vec<(u64, u64)> = unique
        .iter()
        .map(|&i| Ok((replay.episode_first(i)?, replay.episode_last(i)?)))
        .collect::<Result<_, VracerError>>()?;
    episodes.sort_unstable();
    episodes.dedup();

    // Truncated terminals whose saved state must be re-evaluated.
    let truncated_terminals: Vec<u64> = episodes
        .iter()
        .filter(|(_, last)| replay.termination(*last).unwrap() == Termination::Truncated)
        .map(|(_, last)| *last)
        .collect();

    // One concatenated evaluator call for the whole refresh.
    let mut batch = Vec::with_capacity(unique.len() + truncated_terminals.len());
    for &i in &unique {
        batch.push(state_sequence(replay, rescaler, i, time_sequence_length)?);
    }
    for &i in &truncated_terminals {
        batch.push(truncated_sequence(replay, rescaler, i, time_sequence_length)?);
    }
    let outputs = engine.forward(&batch).map_err(|e| VracerError::Backend(e.to_string()))?;

    for (&index, output) in unique.iter().zip(&outputs) {
        let cur_policy = model.policy_record(output)?;
        let exp_policy = replay.exp_policy(index)?.clone();
        let action = replay.action(index)?.clone();

        let rho = model.importance_weight(&action, &cur_policy, &exp_policy);
        let rho = if rho.is_nan() {
            return Err(VracerError::NumericFailure(format!(
                "importance weight of experience {} is NaN",
                index
            ))
            .into());
        } else if rho.is_infinite() {
            truncation_level
        } else {
            rho
        };

        replay.update_metadata(
            index,
            MetadataUpdate {
                state_value: cur_policy.state_value,
                importance_weight: rho,
                trunc_importance_weight: rho.min(truncation_level),
                is_on_policy: rho >= 1.0 / cutoff && rho <= cutoff,
                truncated_state_value: None,
                cur_policy,
            },
        )?;
    }

    for (&index, output) in truncated_terminals.iter().zip(&outputs[unique.len()..]) {
        let record = model.policy_record(output)?;
        replay.set_truncated_state_value(index, record.state_value)?;
    }

    for &(first, last) in &episodes {
        sweep_episode(replay, first, last, discount_factor)?;
    }
    Ok(())
}

/// Recomputes retrace values backward from `last` to `first`.
///
/// The recursion, with scaled reward `r`, state value `V` and truncated
/// importance weight `c`, is
///
/// ```text
/// delta_i = r_i + gamma * V_{i+1} - V_i
/// Vret_i  = V_i + c_i * (delta_i + gamma * (Vret_{i+1} - V_{i+1}))
/// ```
///
/// bootstrapping from zero at a terminal, from the saved truncated state
/// value at a truncated terminal, and from the row's own state value when
/// the episode's tail lies outside the buffer.
pub fn sweep_episode(
    replay: &mut ReplayMemory,
    first: u64,
    last: u64,
    discount_factor: f32,
) -> Result<(), VracerError> {
    struct Row {
        reward: f32,
        state_value: f32,
        trunc_importance_weight: f32,
    }

    // Scratch copy of the episode slice; computed values are written back
    // only after each step completes.
    let rows: Vec<Row> = (first..=last)
        .map(|i| {
            Ok(Row {
                reward: replay.scaled_reward(i)?,
                state_value: replay.state_value(i)?,
                trunc_importance_weight: replay.trunc_importance_weight(i)?,
            })
        })
        .collect::<Result<_, VracerError>>()?;

    let (mut next_value, mut next_retrace) = match replay.termination(last)? {
        Termination::Terminal => (0.0, 0.0),
        Termination::Truncated => {
            let v = replay.truncated_state_value(last)?;
            (v, v)
        }
        Termination::NonTerminal => {
            let v = replay.state_value(last)?;
            (v, v)
        }
    };

    for (offset, row) in rows.iter().enumerate().rev() {
        let delta = row.reward + discount_factor * next_value - row.state_value;
        let retrace = row.state_value
            + row.trunc_importance_weight * (delta + discount_factor * (next_retrace - next_value));
        if !retrace.is_finite() {
            return Err(VracerError::NumericFailure(format!(
                "retrace value of experience {} is {}",
                first + offset as u64,
                retrace
            )));
        }
        replay.set_retrace_value(first + offset as u64, retrace)?;
        next_value = row.state_value;
        next_retrace = retrace;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{continuous::ContinuousPolicy, mlp::MlpEngine, policy::PolicyModel};
    use rand::SeedableRng;
    use rand_chacha::ChaCha12Rng;
    use vracer_core::{Experience, PolicyRecord, Termination};

    fn experience(episode_id: u64, pos: usize, reward: f32, value: f32) -> Experience {
        Experience {
            state: vec![pos as f32],
            action: vec![0.0],
            reward,
            episode_id,
            episode_pos: pos,
            environment_id: 0,
            termination: Termination::NonTerminal,
            truncated_state: None,
            exp_policy: PolicyRecord {
                state_value: value,
                distribution_params: vec![0.0, 1.0],
                ..Default::default()
            },
        }
    }

    #[test]
    fn padding_repeats_the_first_state() {
        let padded = pad_sequence(vec![vec![1.0], vec![2.0]], 4);
        assert_eq!(padded, vec![vec![1.0], vec![1.0], vec![1.0], vec![2.0]]);
    }

    #[test]
    fn sequences_clamp_at_episode_start() {
        let mut replay = ReplayMemory::new(8, 1, false).unwrap();
        for pos in 0..3 {
            replay.append(experience(0, pos, 0.0, 0.0));
        }
        for pos in 0..2 {
            replay.append(experience(1, pos, 0.0, 0.0));
        }
        let rescaler = StateRescaler::new(false, 1);

        // Row 4 is the second step of episode 1: its sequence must not
        // reach into episode 0.
        let seq = state_sequence(&replay, &rescaler, 4, 3).unwrap();
        assert_eq!(seq, vec![vec![0.0], vec![0.0], vec![1.0]]);
    }

    #[test]
    fn terminal_sweep_matches_the_recursion_by_hand() {
        let gamma = 0.9f32;
        let mut replay = ReplayMemory::new(8, 1, false).unwrap();
        let values = [0.5f32, -0.2, 0.1];
        let rewards = [1.0f32, 0.0, -1.0];
        for pos in 0..3 {
            let mut e = experience(0, pos, rewards[pos], values[pos]);
            if pos == 2 {
                e.termination = Termination::Terminal;
            }
            replay.append(e);
        }

        sweep_episode(&mut replay, 0, 2, gamma).unwrap();

        // Backward by hand with unit truncated importance weights.
        let vret2 = rewards[2];
        let vret1 = rewards[1] + gamma * vret2;
        let vret0 = rewards[0] + gamma * vret1;
        assert!((replay.retrace_value(2).unwrap() - vret2).abs() < 1e-6);
        assert!((replay.retrace_value(1).unwrap() - vret1).abs() < 1e-6);
        assert!((replay.retrace_value(0).unwrap() - vret0).abs() < 1e-6);
    }

    #[test]
    fn truncated_sweep_bootstraps_from_the_saved_state_value() {
        let gamma = 0.99f32;
        let mut replay = ReplayMemory::new(8, 1, false).unwrap();
        let mut e = experience(0, 0, 2.0, 0.0);
        e.termination = Termination::Truncated;
        e.truncated_state = Some(vec![9.0]);
        let index = replay.append(e);
        replay.set_truncated_state_value(index, 1.5).unwrap();

        sweep_episode(&mut replay, index, index, gamma).unwrap();
        let expected = 2.0 + gamma * 1.5;
        assert!((replay.retrace_value(index).unwrap() - expected).abs() < 1e-6);
    }

    #[test]
    fn refreshing_the_same_minibatch_twice_changes_nothing() {
        let model = ContinuousPolicy::new(vec![-1.0], vec![1.0], vec![0.5]);
        let mut engine = MlpEngine::build(1, &[6], model.output_dim(), "SGD", 21).unwrap();
        let mut rng = ChaCha12Rng::seed_from_u64(4);
        let rescaler = StateRescaler::new(false, 1);

        // An episode whose actions were genuinely sampled from the engine's
        // own policy records.
        let mut replay = ReplayMemory::new(16, 1, false).unwrap();
        for pos in 0..5 {
            let state = vec![pos as f32 * 0.1];
            let outputs = engine.forward(&[vec![state.clone()]]).unwrap();
            let record = model.policy_record(&outputs[0]).unwrap();
            let (action, exp_policy) = model.sample_action(&record, &mut rng);
            replay.append(Experience {
                state,
                action,
                reward: 0.3,
                episode_id: 0,
                episode_pos: pos,
                environment_id: 0,
                termination: if pos == 4 {
                    Termination::Terminal
                } else {
                    Termination::NonTerminal
                },
                truncated_state: None,
                exp_policy,
            });
        }

        let indices = [0u64, 2, 4];
        let refresh = |replay: &mut ReplayMemory, engine: &mut MlpEngine| {
            refresh_minibatch(replay, &rescaler, &model, engine, &indices, 1, 4.0, 4.0, 0.99)
                .unwrap()
        };
        refresh(&mut replay, &mut engine);

        let snapshot: Vec<_> = replay
            .indices()
            .map(|i| {
                (
                    replay.importance_weight(i).unwrap(),
                    replay.trunc_importance_weight(i).unwrap(),
                    replay.state_value(i).unwrap(),
                    replay.retrace_value(i).unwrap(),
                    replay.is_on_policy(i).unwrap(),
                    replay.cur_policy(i).unwrap().clone(),
                )
            })
            .collect();
        let off_policy_count = replay.off_policy_count();

        refresh(&mut replay, &mut engine);

        let again: Vec<_> = replay
            .indices()
            .map(|i| {
                (
                    replay.importance_weight(i).unwrap(),
                    replay.trunc_importance_weight(i).unwrap(),
                    replay.state_value(i).unwrap(),
                    replay.retrace_value(i).unwrap(),
                    replay.is_on_policy(i).unwrap(),
                    replay.cur_policy(i).unwrap().clone(),
                )
            })
            .collect();
        assert_eq!(snapshot, again);
        assert_eq!(off_policy_count, replay.off_policy_count());
    }

    #[test]
    fn truncated_weights_damp_the_correction() {
        let gamma = 1.0f32;
        let mut replay = ReplayMemory::new(8, 1, false).unwrap();
        let values = [0.0f32, 1.0];
        for pos in 0..2 {
            let mut e = experience(0, pos, 0.0, values[pos]);
            if pos == 1 {
                e.termination = Termination::Terminal;
            }
            replay.append(e);
        }
        // Zero truncated weight on the first row freezes its retrace at V.
        replay
            .update_metadata(
                0,
                MetadataUpdate {
                    cur_policy: PolicyRecord::default(),
                    state_value: 0.0,
                    importance_weight: 0.0,
                    trunc_importance_weight: 0.0,
                    is_on_policy: false,
                    truncated_state_value: None,
                },
            )
            .unwrap();

        sweep_episode(&mut replay, 0, 1, gamma).unwrap();
        assert!((replay.retrace_value(0).unwrap() - 0.0).abs() < 1e-6);
    }
}

//! Rollout-side policy backed by published snapshots.
use crate::{policy::PolicyModel, retrace::pad_sequence};
use anyhow::Result;
use log::warn;
use rand::SeedableRng;
use rand_chacha::ChaCha12Rng;
use vracer_core::{PolicyRecord, PolicySnapshot, RolloutPolicy, StateRescaler, TensorEngine};

/// A policy serving action queries from the latest published snapshot.
///
/// Holds its own copy of the engine; [`RolloutPolicy::sync`] overwrites the
/// parameters and the whitening statistics and reseeds the action noise
/// from the snapshot's generation, so collection is reproducible for a
/// given base seed and publication cadence.
pub struct SnapshotPolicy<P, T>
where
    P: PolicyModel,
    T: TensorEngine,
{
    model: P,
    engine: T,
    rescaler: StateRescaler,
    time_sequence_length: usize,
    exploit: bool,
    seed: u64,
    rng: ChaCha12Rng,
}

impl<P, T> SnapshotPolicy<P, T>
where
    P: PolicyModel,
    T: TensorEngine,
{
    /// Creates a policy that acts with the engine's initial parameters
    /// until the first snapshot arrives.
    pub fn new(model: P, engine: T, time_sequence_length: usize, seed: u64) -> Self {
        Self {
            model,
            engine,
            rescaler: StateRescaler::new(false, 0),
            time_sequence_length,
            exploit: false,
            seed,
            rng: ChaCha12Rng::seed_from_u64(seed),
        }
    }
}

impl<P, T> RolloutPolicy for SnapshotPolicy<P, T>
where
    P: PolicyModel,
    T: TensorEngine,
{
    fn sync(&mut self, snapshot: &PolicySnapshot) {
        if let Err(e) = self.engine.set_params(&snapshot.params) {
            warn!("rejecting policy snapshot: {}", e);
            return;
        }
        self.rescaler = StateRescaler::from_parts(
            snapshot.state_rescaling_applied,
            snapshot.state_rescaling_applied,
            snapshot.state_means.clone(),
            snapshot.state_sigmas.clone(),
        );
        self.exploit = snapshot.exploit;
        self.rng = ChaCha12Rng::seed_from_u64(
            self.seed ^ (snapshot.generation as u64).wrapping_mul(0x9E37_79B9_7F4A_7C15),
        );
    }

    fn sample_action(&mut self, state_seq: &[Vec<f32>]) -> Result<(Vec<f32>, PolicyRecord)> {
        let tail = if state_seq.len() > self.time_sequence_length {
            &state_seq[state_seq.len() - self.time_sequence_length..]
        } else {
            state_seq
        };
        let sequence = pad_sequence(
            self.rescaler.apply_sequence(tail),
            self.time_sequence_length,
        );
        let outputs = self.engine.forward(&[sequence])?;
        let record = self.model.policy_record(&outputs[0])?;
        let (action, exp_policy) = if self.exploit {
            self.model.exploit_action(&record)
        } else {
            self.model.sample_action(&record, &mut self.rng)
        };
        Ok((action, exp_policy))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{continuous::ContinuousPolicy, mlp::MlpEngine};

    fn policy() -> SnapshotPolicy<ContinuousPolicy, MlpEngine> {
        let model = ContinuousPolicy::new(vec![-1.0], vec![1.0], vec![0.5]);
        let engine = MlpEngine::build(1, &[8], model.output_dim(), "SGD", 1).unwrap();
        SnapshotPolicy::new(model, engine, 1, 99)
    }

    fn snapshot(p: &SnapshotPolicy<ContinuousPolicy, MlpEngine>, generation: usize) -> PolicySnapshot {
        PolicySnapshot {
            params: p.engine.params(),
            policy_update_count: 0,
            generation,
            state_means: vec![0.0],
            state_sigmas: vec![1.0],
            state_rescaling_applied: false,
            exploit: false,
        }
    }

    #[test]
    fn same_generation_sync_replays_the_same_actions() {
        let mut a = policy();
        let snap = snapshot(&a, 3);
        a.sync(&snap);
        let (action1, _) = a.sample_action(&[vec![0.2]]).unwrap();
        a.sync(&snap);
        let (action2, _) = a.sample_action(&[vec![0.2]]).unwrap();
        assert_eq!(action1, action2);
    }

    #[test]
    fn exploit_snapshots_act_deterministically() {
        let mut p = policy();
        let mut snap = snapshot(&p, 1);
        snap.exploit = true;
        p.sync(&snap);
        let (a1, _) = p.sample_action(&[vec![0.4]]).unwrap();
        let (a2, _) = p.sample_action(&[vec![0.4]]).unwrap();
        assert_eq!(a1, a2);
    }

    #[test]
    fn long_histories_are_cut_to_the_sequence_length() {
        let mut p = policy();
        p.sync(&snapshot(&p, 0));
        let history = vec![vec![0.1], vec![0.2], vec![0.3]];
        assert!(p.sample_action(&history).is_ok());
    }
}

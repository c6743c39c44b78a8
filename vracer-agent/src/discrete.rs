//! Discrete actions with a categorical distribution.
use crate::policy::PolicyModel;
use rand::Rng;
use rand_chacha::ChaCha12Rng;
use serde::{Deserialize, Serialize};
use vracer_core::{PolicyRecord, VracerError};

fn softmax(logits: &[f32]) -> Vec<f32> {
    let max = logits.iter().cloned().fold(f32::MIN, f32::max);
    let exps: Vec<f32> = logits.iter().map(|l| (l - max).exp()).collect();
    let sum: f32 = exps.iter().sum();
    exps.iter().map(|e| e / sum).collect()
}

/// Categorical policy over a fixed number of actions.
///
/// The network emits one state value and one action value per action; the
/// distribution is the softmax of the action values. The replay's action
/// column stores the selected index as a single-component vector.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct DiscretePolicy {
    n_actions: usize,
}

impl DiscretePolicy {
    /// Creates a policy with the given number of actions.
    pub fn new(n_actions: usize) -> Self {
        assert!(n_actions > 0);
        Self { n_actions }
    }

    fn action_index(action: &[f32], record: &PolicyRecord) -> usize {
        record
            .action_index
            .unwrap_or_else(|| action.first().copied().unwrap_or(0.0) as usize)
    }
}

impl PolicyModel for DiscretePolicy {
    fn output_dim(&self) -> usize {
        1 + self.n_actions
    }

    fn action_dim(&self) -> usize {
        1
    }

    fn policy_record(&self, outputs: &[f32]) -> Result<PolicyRecord, VracerError> {
        if outputs.len() != self.output_dim() {
            return Err(VracerError::Backend(format!(
                "expected {} head values, got {}",
                self.output_dim(),
                outputs.len()
            )));
        }
        if !outputs.iter().all(|o| o.is_finite()) {
            return Err(VracerError::NumericFailure(
                "non-finite policy head values".into(),
            ));
        }
        let logits = outputs[1..].to_vec();
        let probabilities = softmax(&logits);
        Ok(PolicyRecord {
            state_value: outputs[0],
            distribution_params: logits,
            action_probabilities: Some(probabilities),
            ..Default::default()
        })
    }

    fn sample_action(
        &self,
        record: &PolicyRecord,
        rng: &mut ChaCha12Rng,
    ) -> (Vec<f32>, PolicyRecord) {
        let probabilities = record
            .action_probabilities
            .clone()
            .unwrap_or_else(|| softmax(&record.distribution_params));
        let u: f32 = rng.gen();
        let mut acc = 0.0;
        let mut index = probabilities.len() - 1;
        for (i, p) in probabilities.iter().enumerate() {
            acc += p;
            if u < acc {
                index = i;
                break;
            }
        }
        let mut record = record.clone();
        record.action_index = Some(index);
        record.action_probabilities = Some(probabilities);
        (vec![index as f32], record)
    }

    fn exploit_action(&self, record: &PolicyRecord) -> (Vec<f32>, PolicyRecord) {
        let probabilities = record
            .action_probabilities
            .clone()
            .unwrap_or_else(|| softmax(&record.distribution_params));
        let index = probabilities
            .iter()
            .enumerate()
            .max_by(|a, b| a.1.partial_cmp(b.1).unwrap_or(std::cmp::Ordering::Equal))
            .map(|(i, _)| i)
            .unwrap_or(0);
        let mut record = record.clone();
        record.action_index = Some(index);
        record.action_probabilities = Some(probabilities);
        (vec![index as f32], record)
    }

    fn importance_weight(&self, action: &[f32], cur: &PolicyRecord, exp: &PolicyRecord) -> f32 {
        let index = Self::action_index(action, exp);
        let p_cur = cur
            .action_probabilities
            .as_ref()
            .map(|p| p[index])
            .unwrap_or_else(|| softmax(&cur.distribution_params)[index]);
        let p_exp = exp
            .action_probabilities
            .as_ref()
            .map(|p| p[index])
            .unwrap_or_else(|| softmax(&exp.distribution_params)[index]);
        p_cur / p_exp
    }

    fn log_prob_gradient(
        &self,
        action: &[f32],
        cur: &PolicyRecord,
        exp: &PolicyRecord,
    ) -> Vec<f32> {
        let index = Self::action_index(action, exp);
        let p = cur
            .action_probabilities
            .clone()
            .unwrap_or_else(|| softmax(&cur.distribution_params));
        (0..self.n_actions)
            .map(|j| (if j == index { 1.0 } else { 0.0 }) - p[j])
            .collect()
    }

    fn kl_gradient(&self, cur: &PolicyRecord, exp: &PolicyRecord) -> Vec<f32> {
        let p_cur = cur
            .action_probabilities
            .clone()
            .unwrap_or_else(|| softmax(&cur.distribution_params));
        let p_exp = exp
            .action_probabilities
            .clone()
            .unwrap_or_else(|| softmax(&exp.distribution_params));
        p_cur.iter().zip(&p_exp).map(|(c, e)| c - e).collect()
    }

    fn output_gradient(
        &self,
        _cur: &PolicyRecord,
        value_gradient: f32,
        dist_gradient: &[f32],
    ) -> Vec<f32> {
        let mut out = Vec::with_capacity(self.output_dim());
        out.push(value_gradient);
        out.extend_from_slice(dist_gradient);
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;

    fn record(logits: &[f32]) -> PolicyRecord {
        DiscretePolicy::new(logits.len())
            .policy_record(&[0.0].iter().chain(logits).copied().collect::<Vec<_>>())
            .unwrap()
    }

    #[test]
    fn probabilities_sum_to_one() {
        let r = record(&[0.0, 1.0, 2.0]);
        let sum: f32 = r.action_probabilities.as_ref().unwrap().iter().sum();
        assert!((sum - 1.0).abs() < 1e-6);
    }

    #[test]
    fn exploit_picks_the_argmax() {
        let p = DiscretePolicy::new(3);
        let (a, rec) = p.exploit_action(&record(&[0.0, 3.0, 1.0]));
        assert_eq!(a, vec![1.0]);
        assert_eq!(rec.action_index, Some(1));
    }

    #[test]
    fn importance_weight_is_a_probability_ratio() {
        let p = DiscretePolicy::new(2);
        let mut rng = ChaCha12Rng::seed_from_u64(1);
        let (action, exp) = p.sample_action(&record(&[0.0, 0.0]), &mut rng);
        let cur = record(&[1.0, 0.0]);
        let index = exp.action_index.unwrap();
        let expected = cur.action_probabilities.as_ref().unwrap()[index]
            / exp.action_probabilities.as_ref().unwrap()[index];
        assert!((p.importance_weight(&action, &cur, &exp) - expected).abs() < 1e-6);
    }

    #[test]
    fn log_prob_gradient_is_one_hot_minus_probabilities() {
        let p = DiscretePolicy::new(3);
        let mut rng = ChaCha12Rng::seed_from_u64(2);
        let (action, exp) = p.sample_action(&record(&[0.5, 0.5, 0.5]), &mut rng);
        let cur = record(&[0.0, 1.0, -1.0]);
        let grad = p.log_prob_gradient(&action, &cur, &exp);
        let probs = cur.action_probabilities.as_ref().unwrap();
        let index = exp.action_index.unwrap();
        for j in 0..3 {
            let expected = (if j == index { 1.0 } else { 0.0 }) - probs[j];
            assert!((grad[j] - expected).abs() < 1e-6);
        }
        assert!(grad.iter().sum::<f32>().abs() < 1e-5);
    }
}

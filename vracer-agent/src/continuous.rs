//! Continuous actions with a squashed normal distribution.
use crate::policy::PolicyModel;
use rand::Rng;
use rand_chacha::ChaCha12Rng;
use rand_distr::{Distribution, Normal};
use serde::{Deserialize, Serialize};
use vracer_core::{PolicyRecord, VracerError};

/// Clamp for the raw log-sigma head, keeping `exp` well behaved.
const LOG_SIGMA_CLAMP: f32 = 8.0;

fn normal_logp(u: f32, mean: f32, sigma: f32) -> f32 {
    let z = (u - mean) / sigma;
    -0.5 * z * z - sigma.ln() - 0.5 * (2.0 * std::f32::consts::PI).ln()
}

/// Squashed-normal policy over box-bounded continuous actions.
///
/// The network emits one state value, one unbounded mean and one raw
/// log-sigma per action component. Sigmas are `noise_i * exp(raw_i)`, so a
/// zero-initialized head starts at the configured exploration noise.
/// Actions are squashed into `[lower, upper]` with a tanh; the pre-tanh
/// sample is kept in the policy record so that log-probability ratios are
/// recomputed exactly when the policy has drifted.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ContinuousPolicy {
    lower: Vec<f32>,
    upper: Vec<f32>,
    noise: Vec<f32>,
}

impl ContinuousPolicy {
    /// Creates a policy for actions bounded per component.
    pub fn new(lower: Vec<f32>, upper: Vec<f32>, noise: Vec<f32>) -> Self {
        assert_eq!(lower.len(), upper.len());
        assert_eq!(lower.len(), noise.len());
        Self {
            lower,
            upper,
            noise,
        }
    }

    fn squash(&self, u: &[f32]) -> Vec<f32> {
        u.iter()
            .zip(self.lower.iter().zip(&self.upper))
            .map(|(u, (lo, hi))| lo + 0.5 * (hi - lo) * (u.tanh() + 1.0))
            .collect()
    }

    /// Pre-tanh sample of an action. Falls back to inverting the squash
    /// when the record predates the stored sample.
    fn unbounded(&self, action: &[f32], record: &PolicyRecord) -> Vec<f32> {
        if let Some(u) = &record.unbounded_action {
            return u.clone();
        }
        action
            .iter()
            .zip(self.lower.iter().zip(&self.upper))
            .map(|(a, (lo, hi))| {
                let t = (2.0 * (a - lo) / (hi - lo) - 1.0).clamp(-1.0 + 1e-6, 1.0 - 1e-6);
                t.atanh()
            })
            .collect()
    }

    fn moments(record: &PolicyRecord) -> (&[f32], &[f32]) {
        let dim = record.distribution_params.len() / 2;
        (
            &record.distribution_params[..dim],
            &record.distribution_params[dim..],
        )
    }

    fn log_prob(&self, u: &[f32], record: &PolicyRecord) -> f32 {
        let (means, sigmas) = Self::moments(record);
        u.iter()
            .zip(means.iter().zip(sigmas))
            .map(|(u, (m, s))| normal_logp(*u, *m, *s))
            .sum()
    }
}

impl PolicyModel for ContinuousPolicy {
    fn output_dim(&self) -> usize {
        1 + 2 * self.lower.len()
    }

    fn action_dim(&self) -> usize {
        self.lower.len()
    }

    fn policy_record(&self, outputs: &[f32]) -> Result<PolicyRecord, VracerError> {
        let dim = self.lower.len();
        if outputs.len() != self.output_dim() {
            return Err(VracerError::Backend(format!(
                "expected {} head values, got {}",
                self.output_dim(),
                outputs.len()
            )));
        }
        let mut params = Vec::with_capacity(2 * dim);
        params.extend_from_slice(&outputs[1..1 + dim]);
        for (raw, noise) in outputs[1 + dim..].iter().zip(&self.noise) {
            params.push(noise * raw.clamp(-LOG_SIGMA_CLAMP, LOG_SIGMA_CLAMP).exp());
        }
        if outputs[0].is_finite() && params.iter().all(|p| p.is_finite()) {
            Ok(PolicyRecord {
                state_value: outputs[0],
                distribution_params: params,
                ..Default::default()
            })
        } else {
            Err(VracerError::NumericFailure(
                "non-finite policy head values".into(),
            ))
        }
    }

    fn sample_action(
        &self,
        record: &PolicyRecord,
        rng: &mut ChaCha12Rng,
    ) -> (Vec<f32>, PolicyRecord) {
        let (means, sigmas) = Self::moments(record);
        let u: Vec<f32> = means
            .iter()
            .zip(sigmas)
            .map(|(m, s)| Normal::new(*m, *s).map(|n| n.sample(rng)).unwrap_or(*m))
            .collect();
        let action = self.squash(&u);
        let mut record = record.clone();
        record.unbounded_action = Some(u);
        (action, record)
    }

    fn exploit_action(&self, record: &PolicyRecord) -> (Vec<f32>, PolicyRecord) {
        let (means, _) = Self::moments(record);
        let u = means.to_vec();
        let action = self.squash(&u);
        let mut record = record.clone();
        record.unbounded_action = Some(u);
        (action, record)
    }

    fn importance_weight(&self, action: &[f32], cur: &PolicyRecord, exp: &PolicyRecord) -> f32 {
        let u = self.unbounded(action, exp);
        // The tanh volume corrections cancel in the ratio: both densities
        // are evaluated at the same pre-tanh sample.
        (self.log_prob(&u, cur) - self.log_prob(&u, exp)).exp()
    }

    fn log_prob_gradient(
        &self,
        action: &[f32],
        cur: &PolicyRecord,
        exp: &PolicyRecord,
    ) -> Vec<f32> {
        let u = self.unbounded(action, exp);
        let (means, sigmas) = Self::moments(cur);
        let dim = means.len();
        let mut grad = vec![0.0; 2 * dim];
        for i in 0..dim {
            let d = u[i] - means[i];
            let s2 = sigmas[i] * sigmas[i];
            grad[i] = d / s2;
            grad[dim + i] = (d * d - s2) / (s2 * sigmas[i]);
        }
        grad
    }

    fn kl_gradient(&self, cur: &PolicyRecord, exp: &PolicyRecord) -> Vec<f32> {
        let (cur_means, cur_sigmas) = Self::moments(cur);
        let (exp_means, exp_sigmas) = Self::moments(exp);
        let dim = cur_means.len();
        let mut grad = vec![0.0; 2 * dim];
        for i in 0..dim {
            let d = cur_means[i] - exp_means[i];
            let sc2 = cur_sigmas[i] * cur_sigmas[i];
            grad[i] = d / sc2;
            grad[dim + i] =
                1.0 / cur_sigmas[i] - (exp_sigmas[i] * exp_sigmas[i] + d * d) / (sc2 * cur_sigmas[i]);
        }
        grad
    }

    fn output_gradient(
        &self,
        cur: &PolicyRecord,
        value_gradient: f32,
        dist_gradient: &[f32],
    ) -> Vec<f32> {
        let (_, sigmas) = Self::moments(cur);
        let dim = sigmas.len();
        let mut out = Vec::with_capacity(self.output_dim());
        out.push(value_gradient);
        out.extend_from_slice(&dist_gradient[..dim]);
        // Chain rule through sigma = noise * exp(raw): dL/draw = dL/dsigma * sigma.
        for i in 0..dim {
            out.push(dist_gradient[dim + i] * sigmas[i]);
        }
        out
    }
}

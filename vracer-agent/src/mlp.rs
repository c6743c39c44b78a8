//! Backend-free multilayer perceptron engine.
//!
//! The reference implementation of [`TensorEngine`]: ReLU hidden layers,
//! a linear output layer, and SGD or Adam updates. It exists so the agent
//! can run without an external tensor library; heavier backends plug in
//! behind the same trait.
use anyhow::{bail, Result};
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha12Rng;
use serde::{Deserialize, Serialize};
use vracer_core::TensorEngine;

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
enum Optimizer {
    Sgd,
    Adam {
        m: Vec<f32>,
        v: Vec<f32>,
        t: u64,
    },
}

const ADAM_BETA1: f32 = 0.9;
const ADAM_BETA2: f32 = 0.999;
const ADAM_EPS: f32 = 1e-8;

/// Multilayer perceptron with ReLU hidden activations.
///
/// Parameters are stored as one flattened vector, per layer the row-major
/// weight matrix followed by the bias. Forward passes cache activations for
/// the subsequent backward pass.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct MlpEngine {
    /// Layer widths, input first, output last.
    dims: Vec<usize>,
    params: Vec<f32>,
    optimizer: Optimizer,

    /// Accumulated parameter gradients since the last step.
    #[serde(skip)]
    grads: Vec<f32>,

    /// Samples accumulated into `grads`.
    #[serde(skip)]
    batch: usize,

    /// Per-sample activations of the most recent forward pass;
    /// `cache[sample][0]` is the input.
    #[serde(skip)]
    cache: Vec<Vec<Vec<f32>>>,
}

impl MlpEngine {
    /// Builds an engine with randomly initialized weights.
    pub fn build(
        input_dim: usize,
        hidden: &[usize],
        output_dim: usize,
        optimizer: &str,
        seed: u64,
    ) -> Result<Self> {
        if input_dim == 0 || output_dim == 0 || hidden.iter().any(|h| *h == 0) {
            bail!("layer widths must be positive");
        }
        let mut dims = Vec::with_capacity(hidden.len() + 2);
        dims.push(input_dim);
        dims.extend_from_slice(hidden);
        dims.push(output_dim);

        let n_params: usize = dims.windows(2).map(|w| w[1] * w[0] + w[1]).sum();
        let mut rng = ChaCha12Rng::seed_from_u64(seed);
        let mut params = Vec::with_capacity(n_params);
        for w in dims.windows(2) {
            let (fan_in, fan_out) = (w[0], w[1]);
            let limit = (6.0 / (fan_in + fan_out) as f32).sqrt();
            for _ in 0..fan_out * fan_in {
                params.push(rng.gen_range(-limit..limit));
            }
            // Biases start at zero.
            params.extend(std::iter::repeat(0.0).take(fan_out));
        }

        let optimizer = match optimizer {
            "SGD" => Optimizer::Sgd,
            "Adam" => Optimizer::Adam {
                m: vec![0.0; n_params],
                v: vec![0.0; n_params],
                t: 0,
            },
            other => bail!("unknown optimizer: {}", other),
        };

        Ok(Self {
            dims,
            params,
            optimizer,
            grads: vec![],
            batch: 0,
            cache: vec![],
        })
    }

    fn n_layers(&self) -> usize {
        self.dims.len() - 1
    }

    /// Offset of layer `l`'s weights in the parameter vector.
    fn layer_offset(&self, layer: usize) -> usize {
        self.dims
            .windows(2)
            .take(layer)
            .map(|w| w[1] * w[0] + w[1])
            .sum()
    }

    fn forward_sample(&self, input: &[f32]) -> Vec<Vec<f32>> {
        let mut acts = Vec::with_capacity(self.n_layers() + 1);
        acts.push(input.to_vec());
        for l in 0..self.n_layers() {
            let (n_in, n_out) = (self.dims[l], self.dims[l + 1]);
            let w = self.layer_offset(l);
            let b = w + n_out * n_in;
            let x = &acts[l];
            let mut y = vec![0.0; n_out];
            for o in 0..n_out {
                let row = &self.params[w + o * n_in..w + (o + 1) * n_in];
                let mut acc = self.params[b + o];
                for (xi, wi) in x.iter().zip(row) {
                    acc += xi * wi;
                }
                y[o] = if l + 1 < self.n_layers() {
                    acc.max(0.0)
                } else {
                    acc
                };
            }
            acts.push(y);
        }
        acts
    }

    fn backward_sample(&mut self, acts: &[Vec<f32>], output_gradient: &[f32]) {
        let mut delta = output_gradient.to_vec();
        for l in (0..self.n_layers()).rev() {
            let (n_in, n_out) = (self.dims[l], self.dims[l + 1]);
            let w = self.layer_offset(l);
            let b = w + n_out * n_in;
            let x = &acts[l];

            let mut prev_delta = vec![0.0; n_in];
            for o in 0..n_out {
                let d = delta[o];
                self.grads[b + o] += d;
                for i in 0..n_in {
                    self.grads[w + o * n_in + i] += d * x[i];
                    prev_delta[i] += d * self.params[w + o * n_in + i];
                }
            }
            if l > 0 {
                // ReLU mask of the layer below.
                for (pd, a) in prev_delta.iter_mut().zip(&acts[l]) {
                    if *a <= 0.0 {
                        *pd = 0.0;
                    }
                }
            }
            delta = prev_delta;
        }
    }
}

impl TensorEngine for MlpEngine {
    fn output_dim(&self) -> usize {
        *self.dims.last().unwrap()
    }

    fn forward(&mut self, batch: &[Vec<Vec<f32>>]) -> Result<Vec<Vec<f32>>> {
        self.cache.clear();
        let mut outputs = Vec::with_capacity(batch.len());
        for sequence in batch {
            let input: Vec<f32> = sequence.iter().flatten().copied().collect();
            if input.len() != self.dims[0] {
                bail!(
                    "input of {} values does not match input layer of width {}",
                    input.len(),
                    self.dims[0]
                );
            }
            let acts = self.forward_sample(&input);
            outputs.push(acts.last().unwrap().clone());
            self.cache.push(acts);
        }
        Ok(outputs)
    }

    fn backward(&mut self, output_gradients: &[Vec<f32>]) -> Result<()> {
        if output_gradients.len() != self.cache.len() {
            bail!(
                "{} output gradients for a forward batch of {}",
                output_gradients.len(),
                self.cache.len()
            );
        }
        if self.grads.len() != self.params.len() {
            self.grads = vec![0.0; self.params.len()];
        }
        let cache = std::mem::take(&mut self.cache);
        for (acts, grad) in cache.iter().zip(output_gradients) {
            self.backward_sample(acts, grad);
        }
        self.cache = cache;
        self.batch += output_gradients.len();
        Ok(())
    }

    fn step(&mut self, learning_rate: f32, l2_regularization: f32) -> Result<()> {
        if self.batch == 0 {
            return Ok(());
        }
        let scale = 1.0 / self.batch as f32;
        match &mut self.optimizer {
            Optimizer::Sgd => {
                for (p, g) in self.params.iter_mut().zip(&self.grads) {
                    let g = g * scale + l2_regularization * *p;
                    *p -= learning_rate * g;
                }
            }
            Optimizer::Adam { m, v, t } => {
                *t += 1;
                let b1 = 1.0 - ADAM_BETA1.powi(*t as i32);
                let b2 = 1.0 - ADAM_BETA2.powi(*t as i32);
                for i in 0..self.params.len() {
                    let g = self.grads[i] * scale + l2_regularization * self.params[i];
                    m[i] = ADAM_BETA1 * m[i] + (1.0 - ADAM_BETA1) * g;
                    v[i] = ADAM_BETA2 * v[i] + (1.0 - ADAM_BETA2) * g * g;
                    let m_hat = m[i] / b1;
                    let v_hat = v[i] / b2;
                    self.params[i] -= learning_rate * m_hat / (v_hat.sqrt() + ADAM_EPS);
                }
            }
        }
        self.grads.iter_mut().for_each(|g| *g = 0.0);
        self.batch = 0;
        Ok(())
    }

    fn params(&self) -> Vec<f32> {
        self.params.clone()
    }

    fn set_params(&mut self, params: &[f32]) -> Result<()> {
        if params.len() != self.params.len() {
            bail!(
                "{} parameters given, engine has {}",
                params.len(),
                self.params.len()
            );
        }
        self.params.copy_from_slice(params);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn engine() -> MlpEngine {
        MlpEngine::build(2, &[4], 3, "SGD", 11).unwrap()
    }

    #[test]
    fn forward_produces_one_output_row_per_sample() {
        let mut e = engine();
        let batch = vec![vec![vec![0.1, 0.2]], vec![vec![0.3, -0.4]]];
        let out = e.forward(&batch).unwrap();
        assert_eq!(out.len(), 2);
        assert!(out.iter().all(|o| o.len() == 3));
    }

    #[test]
    fn forward_is_deterministic_between_steps() {
        let mut e = engine();
        let batch = vec![vec![vec![0.5, -0.5]]];
        let a = e.forward(&batch).unwrap();
        let b = e.forward(&batch).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn mismatched_input_width_is_rejected() {
        let mut e = engine();
        assert!(e.forward(&[vec![vec![1.0, 2.0, 3.0]]]).is_err());
    }

    #[test]
    fn backward_matches_finite_differences() {
        let mut e = MlpEngine::build(2, &[3], 2, "SGD", 5).unwrap();
        let batch = vec![vec![vec![0.4, -0.7]]];
        // Loss: fixed linear combination of the outputs.
        let coefs = [0.3f32, -1.1];
        let loss = |e: &mut MlpEngine| -> f32 {
            let out = e.forward(&batch).unwrap();
            out[0].iter().zip(&coefs).map(|(o, c)| o * c).sum()
        };

        loss(&mut e);
        e.backward(&[coefs.to_vec()]).unwrap();
        let grads = e.grads.clone();

        let params = e.params();
        let eps = 1e-3;
        for i in 0..params.len() {
            let mut plus = params.clone();
            let mut minus = params.clone();
            plus[i] += eps;
            minus[i] -= eps;
            e.set_params(&plus).unwrap();
            let lp = loss(&mut e);
            e.set_params(&minus).unwrap();
            let lm = loss(&mut e);
            let numeric = (lp - lm) / (2.0 * eps);
            assert!(
                (grads[i] - numeric).abs() < 1e-2,
                "param {i}: {} vs {numeric}",
                grads[i]
            );
        }
    }

    #[test]
    fn sgd_step_descends_the_loss() {
        let mut e = MlpEngine::build(1, &[8], 1, "SGD", 3).unwrap();
        let batch = vec![vec![vec![1.0]]];
        // Drive the single output toward zero: loss = 0.5 * y^2.
        for _ in 0..500 {
            let y = e.forward(&batch).unwrap()[0][0];
            e.backward(&[vec![y]]).unwrap();
            e.step(0.05, 0.0).unwrap();
        }
        let y = e.forward(&batch).unwrap()[0][0];
        assert!(y.abs() < 1e-2, "output did not converge: {y}");
    }

    #[test]
    fn adam_state_advances_and_grads_clear() {
        let mut e = MlpEngine::build(1, &[2], 1, "Adam", 3).unwrap();
        let before = e.params();
        let y = e.forward(&[vec![vec![1.0]]]).unwrap()[0][0];
        e.backward(&[vec![y + 1.0]]).unwrap();
        e.step(1e-2, 0.0).unwrap();
        assert_ne!(before, e.params());
        assert!(e.grads.iter().all(|g| *g == 0.0));
        assert_eq!(e.batch, 0);
    }

    #[test]
    fn unknown_optimizer_is_rejected() {
        assert!(MlpEngine::build(1, &[2], 1, "Momentum", 0).is_err());
    }
}

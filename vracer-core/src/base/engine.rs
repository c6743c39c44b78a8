//! Black-box tensor engine.
use anyhow::Result;

/// The bridge to the neural-network backend.
///
/// The learner never differentiates through the network itself: it computes
/// the gradient of its loss with respect to the network *outputs* and hands
/// it to [`TensorEngine::backward`]. The engine owns parameters, gradients
/// and the optimizer state.
///
/// Inputs are batches of state time sequences, shape B×T×S; outputs are one
/// vector of head values per batch element. `forward` must be a pure
/// function of the parameters: identical inputs produce identical outputs
/// between two parameter updates.
pub trait TensorEngine {
    /// Number of output head values per sample.
    fn output_dim(&self) -> usize;

    /// Evaluates the network on a batch of state time sequences.
    fn forward(&mut self, batch: &[Vec<Vec<f32>>]) -> Result<Vec<Vec<f32>>>;

    /// Accumulates parameter gradients by backpropagating the given output
    /// gradients through the most recent `forward` batch.
    fn backward(&mut self, output_gradients: &[Vec<f32>]) -> Result<()>;

    /// Applies accumulated gradients and clears them.
    fn step(&mut self, learning_rate: f32, l2_regularization: f32) -> Result<()>;

    /// Flattened copy of the current parameters.
    fn params(&self) -> Vec<f32>;

    /// Overwrites the parameters from a flattened copy.
    fn set_params(&mut self, params: &[f32]) -> Result<()>;
}

//! Shared reverse-step reconstruction
//!
//! Both sampler variants end every step the same way: turn a noise estimate
//! into a prediction of the clean sample and move to the previous timestep.

use burn::prelude::*;
use burn::tensor::{Distribution, Int};
use serde::{Deserialize, Serialize};

use crate::schedule::{ScheduleTables, StepCoefficients};

/// Controls for the stochastic term of a step
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NoiseParams {
    /// Multiplier on the injected noise
    pub temperature: f32,
    /// Dropout probability applied to the injected noise
    pub noise_dropout: f32,
}

impl Default for NoiseParams {
    fn default() -> Self {
        Self {
            temperature: 1.0,
            noise_dropout: 0.0,
        }
    }
}

/// Output of one integrator step
pub struct StepResult<B: Backend> {
    /// Sample at the previous (less noisy) timestep
    pub x_prev: Tensor<B, 4>,
    /// Predicted clean sample
    pub pred_x0: Tensor<B, 4>,
    /// Raw noise estimate of this step, kept by multistep samplers
    pub eps: Option<Tensor<B, 4>>,
}

/// Everything a step needs besides the sample and the models
pub struct StepContext<'a, B: Backend> {
    pub tables: &'a ScheduleTables,
    /// Index the full-length tables instead of the fast ones
    pub use_original_steps: bool,
    pub noise: NoiseParams,
    pub device: &'a B::Device,
}

impl<B: Backend> StepContext<'_, B> {
    /// Reconstruct with the coefficients of table row `index`
    pub fn reconstruct(
        &self,
        x: &Tensor<B, 4>,
        eps: &Tensor<B, 4>,
        index: usize,
    ) -> (Tensor<B, 4>, Tensor<B, 4>) {
        let coefficients = self.tables.coefficients(index, self.use_original_steps);
        reconstruct(x, eps, coefficients, &self.noise, self.device)
    }
}

/// Timestep tensor with one entry per batch element
pub fn timestep_tensor<B: Backend>(
    batch_size: usize,
    timestep: usize,
    device: &B::Device,
) -> Tensor<B, 1, Int> {
    Tensor::full([batch_size], timestep as i64, device)
}

/// Gaussian noise of the given shape
pub fn noise_like<B: Backend>(dims: [usize; 4], device: &B::Device) -> Tensor<B, 4> {
    Tensor::random(dims, Distribution::Normal(0.0, 1.0), device)
}

/// Zero elements with probability `p` and rescale the rest by `1 / (1 - p)`
pub fn dropout<B: Backend>(tensor: Tensor<B, 4>, p: f32) -> Tensor<B, 4> {
    if p <= 0.0 {
        return tensor;
    }
    if p >= 1.0 {
        return tensor.zeros_like();
    }
    let keep = 1.0 - p as f64;
    let mask = Tensor::random(tensor.dims(), Distribution::Bernoulli(keep), &tensor.device());
    tensor * mask / keep
}

/// One reverse step from a noise estimate
///
/// ```text
/// pred_x0 = (x - sqrt(1 - ᾱₜ) * eps) / sqrt(ᾱₜ)
/// dir_xt  = sqrt(1 - ᾱ_prev - σₜ²) * eps
/// x_prev  = sqrt(ᾱ_prev) * pred_x0 + dir_xt + σₜ * noise * temperature
/// ```
///
/// Coefficients are broadcast as `[batch, 1, 1, 1]` tensors on `device`.
/// Returns `(x_prev, pred_x0)`.
pub fn reconstruct<B: Backend>(
    x: &Tensor<B, 4>,
    eps: &Tensor<B, 4>,
    coefficients: StepCoefficients,
    noise: &NoiseParams,
    device: &B::Device,
) -> (Tensor<B, 4>, Tensor<B, 4>) {
    let [b, _, _, _] = x.dims();
    let per_batch = |value: f64| Tensor::<B, 4>::full([b, 1, 1, 1], value as f32, device);

    let a_t = per_batch(coefficients.alpha);
    let a_prev = per_batch(coefficients.alpha_prev);
    let sigma_t = per_batch(coefficients.sigma);
    let sqrt_one_minus_at = per_batch(coefficients.sqrt_one_minus_alpha);

    // current prediction for x_0
    let pred_x0 = (x.clone() - sqrt_one_minus_at * eps.clone()) / a_t.sqrt();

    // direction pointing to x_t
    let dir_xt = (a_prev.clone().neg() + 1.0 - sigma_t.clone().powi_scalar(2)).sqrt() * eps.clone();

    let x_prev = a_prev.sqrt() * pred_x0.clone() + dir_xt;

    // σ = 0 leaves nothing to inject
    if coefficients.sigma == 0.0 {
        return (x_prev, pred_x0);
    }

    let noise_term = sigma_t * noise_like::<B>(x.dims(), device) * noise.temperature;
    let noise_term = dropout(noise_term, noise.noise_dropout);
    (x_prev + noise_term, pred_x0)
}

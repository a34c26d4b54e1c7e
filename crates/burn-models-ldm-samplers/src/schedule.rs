//! Noise schedules for latent diffusion sampling
//!
//! All tables are computed on the host in double precision, once per
//! sampling run, and only converted to `f32` tensors when a step needs them.

use burn::prelude::*;
use serde::{Deserialize, Serialize};

use crate::error::{Result, SamplerError};
use crate::timesteps::{Discretization, StepPlan};

/// Number of training timesteps of the latent diffusion models
pub const NUM_TRAIN_TIMESTEPS: usize = 1000;

// ============================================================================
// Schedule Parameters
// ============================================================================

/// Hyperparameters of a sampling schedule
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ScheduleParams {
    /// Number of training timesteps
    pub num_train_timesteps: usize,
    /// First beta of the linear schedule
    pub linear_start: f64,
    /// Last beta of the linear schedule
    pub linear_end: f64,
    /// How the fast steps are spread over the training timesteps
    pub discretization: Discretization,
    /// Number of fast (inference) steps
    pub steps: usize,
    /// Noise interpolation (0.0 = deterministic DDIM, 1.0 = DDPM-like)
    pub eta: f64,
}

impl Default for ScheduleParams {
    fn default() -> Self {
        Self {
            num_train_timesteps: NUM_TRAIN_TIMESTEPS,
            linear_start: 0.00085,
            linear_end: 0.012,
            discretization: Discretization::Uniform,
            steps: 50,
            eta: 0.0,
        }
    }
}

/// Linear beta schedule, interpolated in the square-root domain
///
/// `betas[i] = linspace(sqrt(start), sqrt(end), n)[i]^2`. The interpolation
/// fills the first half forwards from `start` and the second half backwards
/// from `end`, so both endpoints are exact.
pub fn linear_betas(num_steps: usize, linear_start: f64, linear_end: f64) -> Vec<f64> {
    let start = linear_start.sqrt();
    let end = linear_end.sqrt();
    if num_steps == 1 {
        return vec![start * start];
    }

    let step = (end - start) / (num_steps - 1) as f64;
    let halfway = num_steps / 2;
    (0..num_steps)
        .map(|i| {
            let v = if i < halfway {
                start + step * i as f64
            } else {
                end - step * (num_steps - i - 1) as f64
            };
            v * v
        })
        .collect()
}

// ============================================================================
// Schedule Tables
// ============================================================================

/// Coefficients used by one reverse step
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StepCoefficients {
    /// ᾱ at the current step
    pub alpha: f64,
    /// ᾱ at the previous (less noisy) step
    pub alpha_prev: f64,
    /// Standard deviation of the injected noise
    pub sigma: f64,
    /// sqrt(1 - ᾱ) at the current step
    pub sqrt_one_minus_alpha: f64,
}

/// Precomputed schedule for one sampling run
#[derive(Debug, Clone)]
pub struct ScheduleTables {
    pub betas: Vec<f64>,
    pub alphas: Vec<f64>,
    /// Cumulative product of alphas: ᾱₜ
    pub alphas_cumprod: Vec<f64>,
    /// ᾱₜ₋₁, with ᾱ₋₁ = 1
    pub alphas_cumprod_prev: Vec<f64>,
    pub sqrt_alphas_cumprod: Vec<f64>,
    pub sqrt_one_minus_alphas_cumprod: Vec<f64>,
    pub log_one_minus_alphas_cumprod: Vec<f64>,
    pub sqrt_recip_alphas_cumprod: Vec<f64>,
    pub sqrt_recipm1_alphas_cumprod: Vec<f64>,

    /// Fast-step noise levels, one entry per planned timestep
    pub ddim_sigmas: Vec<f64>,
    pub ddim_alphas: Vec<f64>,
    pub ddim_alphas_prev: Vec<f64>,
    pub ddim_sqrt_one_minus_alphas: Vec<f64>,
    /// eta-scaled sigmas for a run over every training timestep
    pub ddim_sigmas_for_original_num_steps: Vec<f64>,

    plan: StepPlan,
    eta: f64,
}

impl ScheduleTables {
    /// Build all tables from the linear beta schedule described by `params`
    pub fn build(params: &ScheduleParams) -> Result<Self> {
        let betas = linear_betas(
            params.num_train_timesteps,
            params.linear_start,
            params.linear_end,
        );
        Self::from_betas(betas, params)
    }

    /// Build all tables from an explicit beta sequence
    ///
    /// Fails when the sequence does not cover every training timestep.
    pub fn from_betas(betas: Vec<f64>, params: &ScheduleParams) -> Result<Self> {
        let alphas: Vec<f64> = betas.iter().map(|b| 1.0 - b).collect();

        // Left-to-right over the full sequence
        let mut alphas_cumprod = Vec::with_capacity(alphas.len());
        let mut cumprod = 1.0f64;
        for alpha in &alphas {
            cumprod *= alpha;
            alphas_cumprod.push(cumprod);
        }

        if alphas_cumprod.len() != params.num_train_timesteps {
            return Err(SamplerError::ScheduleLength {
                expected: params.num_train_timesteps,
                actual: alphas_cumprod.len(),
            });
        }

        let alphas_cumprod_prev: Vec<f64> = std::iter::once(1.0)
            .chain(alphas_cumprod[..alphas_cumprod.len() - 1].iter().copied())
            .collect();

        let map = |f: fn(f64) -> f64| alphas_cumprod.iter().map(|&a| f(a)).collect::<Vec<_>>();
        let sqrt_alphas_cumprod = map(f64::sqrt);
        let sqrt_one_minus_alphas_cumprod = map(|a| (1.0 - a).sqrt());
        let log_one_minus_alphas_cumprod = map(|a| (1.0 - a).ln());
        let sqrt_recip_alphas_cumprod = map(|a| (1.0 / a).sqrt());
        let sqrt_recipm1_alphas_cumprod = map(|a| (1.0 / a - 1.0).sqrt());

        let plan = StepPlan::new(
            params.steps,
            params.discretization,
            params.num_train_timesteps,
        )?;

        // Fast schedule: ᾱ at the planned timesteps and at their predecessors
        let last = alphas_cumprod.len() - 1;
        let ddim_alphas: Vec<f64> = plan
            .timesteps()
            .iter()
            .map(|&t| alphas_cumprod[t.min(last)])
            .collect();
        let ddim_alphas_prev: Vec<f64> = std::iter::once(alphas_cumprod[0])
            .chain(ddim_alphas[..ddim_alphas.len() - 1].iter().copied())
            .collect();
        let eta = params.eta;
        let ddim_sigmas: Vec<f64> = ddim_alphas
            .iter()
            .zip(&ddim_alphas_prev)
            .map(|(&a, &a_prev)| ddim_sigma(eta, a, a_prev))
            .collect();
        let ddim_sqrt_one_minus_alphas = ddim_alphas.iter().map(|a| (1.0 - a).sqrt()).collect();

        let ddim_sigmas_for_original_num_steps = alphas_cumprod
            .iter()
            .zip(&alphas_cumprod_prev)
            .map(|(&a, &a_prev)| ddim_sigma(eta, a, a_prev))
            .collect();

        Ok(Self {
            betas,
            alphas,
            alphas_cumprod,
            alphas_cumprod_prev,
            sqrt_alphas_cumprod,
            sqrt_one_minus_alphas_cumprod,
            log_one_minus_alphas_cumprod,
            sqrt_recip_alphas_cumprod,
            sqrt_recipm1_alphas_cumprod,
            ddim_sigmas,
            ddim_alphas,
            ddim_alphas_prev,
            ddim_sqrt_one_minus_alphas,
            ddim_sigmas_for_original_num_steps,
            plan,
            eta,
        })
    }

    /// Number of training timesteps covered by the tables
    pub fn num_train_timesteps(&self) -> usize {
        self.alphas_cumprod.len()
    }

    /// The fast-step plan the tables were derived for
    pub fn plan(&self) -> &StepPlan {
        &self.plan
    }

    pub fn eta(&self) -> f64 {
        self.eta
    }

    /// Table row for a timestep; the topmost uniform timestep maps onto the last row
    fn row(&self, timestep: usize) -> usize {
        timestep.min(self.alphas_cumprod.len() - 1)
    }

    /// Coefficients for the step at `index`
    ///
    /// `index` counts fast steps (or training timesteps when
    /// `use_original_steps` is set), 0 being the least noisy.
    pub fn coefficients(&self, index: usize, use_original_steps: bool) -> StepCoefficients {
        if use_original_steps {
            let i = self.row(index);
            StepCoefficients {
                alpha: self.alphas_cumprod[i],
                alpha_prev: self.alphas_cumprod_prev[i],
                sigma: self.ddim_sigmas_for_original_num_steps[i],
                sqrt_one_minus_alpha: self.sqrt_one_minus_alphas_cumprod[i],
            }
        } else {
            StepCoefficients {
                alpha: self.ddim_alphas[index],
                alpha_prev: self.ddim_alphas_prev[index],
                sigma: self.ddim_sigmas[index],
                sqrt_one_minus_alpha: self.ddim_sqrt_one_minus_alphas[index],
            }
        }
    }

    /// Forward-noise a clean sample to `timestep`
    ///
    /// q(x_t | x_0) = sqrt(ᾱₜ) * x_0 + sqrt(1 - ᾱₜ) * noise
    pub fn q_sample<B: Backend>(
        &self,
        x0: Tensor<B, 4>,
        timestep: usize,
        noise: Tensor<B, 4>,
    ) -> Tensor<B, 4> {
        let row = self.row(timestep);
        x0 * self.sqrt_alphas_cumprod[row] + noise * self.sqrt_one_minus_alphas_cumprod[row]
    }
}

/// σ = eta * sqrt((1 - ᾱ_prev) / (1 - ᾱ) * (1 - ᾱ / ᾱ_prev))
fn ddim_sigma(eta: f64, alpha: f64, alpha_prev: f64) -> f64 {
    eta * ((1.0 - alpha_prev) / (1.0 - alpha) * (1.0 - alpha / alpha_prev)).sqrt()
}

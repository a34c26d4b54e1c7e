//! PLMS (Pseudo Linear Multi-Step) step
//!
//! Reuses the noise estimates of previous steps to extrapolate a higher-order
//! estimate without extra model calls. The first step has no history and
//! instead looks one step ahead (pseudo improved Euler), costing a second
//! model evaluation.

use std::collections::VecDeque;

use burn::prelude::*;

use crate::conditioning::Conditioning;
use crate::error::Result;
use crate::guidance::GuidedDenoiser;
use crate::model::{ControlModel, DenoisingModel};
use crate::step::{timestep_tensor, StepContext, StepResult};
use crate::timesteps::PlannedStep;

/// Maximum number of past noise estimates kept
pub const MAX_HISTORY: usize = 3;

/// Adams-Bashforth weights and common divisor for a given order
///
/// Weights apply to the current estimate first, then to the history from
/// newest to oldest.
pub fn adams_bashforth_weights(order: usize) -> (Vec<f64>, f64) {
    match order {
        2 => (vec![3.0, -1.0], 2.0),
        3 => (vec![23.0, -16.0, 5.0], 12.0),
        4 => (vec![55.0, -59.0, 37.0, -9.0], 24.0),
        _ => (vec![1.0], 1.0),
    }
}

/// Rolling window of raw noise estimates, oldest first
#[derive(Debug, Clone)]
pub struct EpsHistory<B: Backend> {
    entries: VecDeque<Tensor<B, 4>>,
}

impl<B: Backend> Default for EpsHistory<B> {
    fn default() -> Self {
        Self::new()
    }
}

impl<B: Backend> EpsHistory<B> {
    pub fn new() -> Self {
        Self {
            entries: VecDeque::with_capacity(MAX_HISTORY + 1),
        }
    }

    /// Append an estimate, evicting the oldest beyond [`MAX_HISTORY`]
    pub fn push(&mut self, eps: Tensor<B, 4>) {
        self.entries.push_back(eps);
        if self.entries.len() > MAX_HISTORY {
            self.entries.pop_front();
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// The `n`-th most recent estimate, 0 being the newest
    pub fn recent(&self, n: usize) -> Option<&Tensor<B, 4>> {
        self.entries.len().checked_sub(n + 1).and_then(|i| self.entries.get(i))
    }

    /// Combine `eps` with the history using Adams-Bashforth of order `len + 1`
    ///
    /// Returns `None` when the history is empty.
    pub fn combine(&self, eps: &Tensor<B, 4>) -> Option<Tensor<B, 4>> {
        if self.entries.is_empty() {
            return None;
        }

        let (weights, divisor) = adams_bashforth_weights(self.entries.len() + 1);
        let mut combined = eps.clone() * weights[0];
        for (n, &weight) in weights.iter().enumerate().skip(1) {
            if let Some(past) = self.recent(n - 1) {
                combined = combined + past.clone() * weight;
            }
        }
        Some(combined / divisor)
    }
}

/// Perform one PLMS step
///
/// Returns the raw noise estimate of this step in [`StepResult::eps`]; the
/// caller pushes it onto `history` for later steps.
pub fn plms_step<B, M, C>(
    denoiser: &GuidedDenoiser<'_, B, M, C>,
    ctx: &StepContext<'_, B>,
    x: &Tensor<B, 4>,
    step: &PlannedStep,
    conditioning: &Conditioning<B>,
    history: &EpsHistory<B>,
) -> Result<StepResult<B>>
where
    B: Backend,
    M: DenoisingModel<B>,
    C: ControlModel<B>,
{
    let [b, _, _, _] = x.dims();
    let t = timestep_tensor::<B>(b, step.timestep, ctx.device);
    let eps = denoiser.evaluate(x, &t, conditioning)?;

    let eps_prime = match history.combine(&eps) {
        Some(combined) => combined,
        None => {
            // Pseudo improved Euler (2nd order)
            let (x_next, _) = ctx.reconstruct(x, &eps, step.index);
            let t_next = timestep_tensor::<B>(b, step.next_timestep, ctx.device);
            let eps_next = denoiser.evaluate(&x_next, &t_next, conditioning)?;
            (eps.clone() + eps_next) / 2.0
        }
    };

    let (x_prev, pred_x0) = ctx.reconstruct(x, &eps_prime, step.index);
    Ok(StepResult {
        x_prev,
        pred_x0,
        eps: Some(eps),
    })
}

//! DDIM (Denoising Diffusion Implicit Models) step
//!
//! One noise estimate per step, no history. With eta = 0 the update is
//! deterministic.

use burn::prelude::*;

use crate::conditioning::Conditioning;
use crate::error::Result;
use crate::guidance::GuidedDenoiser;
use crate::model::{ControlModel, DenoisingModel};
use crate::step::{timestep_tensor, StepContext, StepResult};
use crate::timesteps::PlannedStep;

/// Perform one DDIM step
///
/// # Arguments
/// * `denoiser` - Guided noise estimator
/// * `ctx` - Schedule tables, noise controls and device
/// * `x` - Current noisy sample [batch, channels, height, width]
/// * `step` - Planned timestep and table row
/// * `conditioning` - Conditional branch
pub fn ddim_step<B, M, C>(
    denoiser: &GuidedDenoiser<'_, B, M, C>,
    ctx: &StepContext<'_, B>,
    x: &Tensor<B, 4>,
    step: &PlannedStep,
    conditioning: &Conditioning<B>,
) -> Result<StepResult<B>>
where
    B: Backend,
    M: DenoisingModel<B>,
    C: ControlModel<B>,
{
    let [b, _, _, _] = x.dims();
    let t = timestep_tensor::<B>(b, step.timestep, ctx.device);

    let eps = denoiser.evaluate(x, &t, conditioning)?;
    let (x_prev, pred_x0) = ctx.reconstruct(x, &eps, step.index);

    Ok(StepResult {
        x_prev,
        pred_x0,
        eps: None,
    })
}

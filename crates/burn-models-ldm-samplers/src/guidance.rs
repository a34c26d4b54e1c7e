//! Classifier-free guidance and ControlNet composition
//!
//! [`GuidedDenoiser`] turns a noisy sample into a noise estimate: it runs the
//! control model when the conditioning carries a hint, feeds the control
//! residuals to the UNet, combines the guided and unguided branches and
//! finally applies the optional score corrector.

use burn::prelude::*;
use burn::tensor::Int;

use crate::conditioning::Conditioning;
use crate::error::{Result, SamplerError};
use crate::model::{
    control_name, ControlInputs, ControlModel, ControlOutputs, DenoisingModel, PredictionType,
    ScoreCorrector, UnetInputs,
};

/// Apply classifier-free guidance
///
/// Combines conditional and unconditional predictions:
/// `output = uncond + guidance_scale * (cond - uncond)`
pub fn apply_guidance<B: Backend>(
    noise_pred_uncond: Tensor<B, 4>,
    noise_pred_cond: Tensor<B, 4>,
    guidance_scale: f64,
) -> Tensor<B, 4> {
    noise_pred_uncond.clone() + (noise_pred_cond - noise_pred_uncond) * guidance_scale
}

/// Pull `control_0, control_1, ...` out of the control outputs
///
/// Stops at the first missing index; unrelated entries are dropped.
pub fn collect_controls<B: Backend>(mut outputs: ControlOutputs<B>) -> Vec<Tensor<B, 4>> {
    let mut controls = Vec::with_capacity(outputs.len());
    for i in 0..outputs.len() {
        match outputs.remove(&control_name(i)) {
            Some(control) => controls.push(control),
            None => break,
        }
    }
    controls
}

/// Multiply each control signal by the scale at the same position
pub fn scale_controls<B: Backend>(
    controls: Vec<Tensor<B, 4>>,
    scales: &[f32],
) -> Result<Vec<Tensor<B, 4>>> {
    if scales.len() != controls.len() {
        return Err(SamplerError::ControlScaleMismatch {
            scales: scales.len(),
            controls: controls.len(),
        });
    }
    Ok(controls
        .into_iter()
        .zip(scales)
        .map(|(control, &scale)| control * scale)
        .collect())
}

/// Noise estimator combining UNet, ControlNet and classifier-free guidance
pub struct GuidedDenoiser<'a, B: Backend, M, C> {
    model: &'a M,
    control_model: &'a C,
    unconditional: Option<&'a Conditioning<B>>,
    guidance_scale: f64,
    control_scales: Option<&'a [f32]>,
    corrector: Option<&'a dyn ScoreCorrector<B>>,
}

impl<'a, B, M, C> GuidedDenoiser<'a, B, M, C>
where
    B: Backend,
    M: DenoisingModel<B>,
    C: ControlModel<B>,
{
    /// Unguided denoiser without control scaling or correction
    pub fn new(model: &'a M, control_model: &'a C) -> Self {
        Self {
            model,
            control_model,
            unconditional: None,
            guidance_scale: 1.0,
            control_scales: None,
            corrector: None,
        }
    }

    /// Enable classifier-free guidance
    ///
    /// Guidance only kicks in when an unconditional branch is given and the
    /// scale differs from 1.0.
    pub fn with_guidance(
        mut self,
        unconditional: Option<&'a Conditioning<B>>,
        guidance_scale: f64,
    ) -> Self {
        self.unconditional = unconditional;
        self.guidance_scale = guidance_scale;
        self
    }

    /// Per-level multipliers for the control signals
    pub fn with_control_scales(mut self, control_scales: Option<&'a [f32]>) -> Self {
        self.control_scales = control_scales;
        self
    }

    /// Apply a score corrector to every estimate
    ///
    /// Only epsilon-parameterized models can be corrected.
    pub fn with_score_corrector(mut self, corrector: &'a dyn ScoreCorrector<B>) -> Result<Self> {
        let prediction_type = self.model.prediction_type();
        if prediction_type != PredictionType::Epsilon {
            return Err(SamplerError::ScoreCorrectorParameterization(prediction_type));
        }
        self.corrector = Some(corrector);
        Ok(self)
    }

    /// Whether each evaluation runs both guidance branches
    pub fn is_guided(&self) -> bool {
        self.unconditional.is_some() && self.guidance_scale != 1.0
    }

    /// Estimate the noise in `x` at `timesteps`
    pub fn evaluate(
        &self,
        x: &Tensor<B, 4>,
        timesteps: &Tensor<B, 1, Int>,
        conditioning: &Conditioning<B>,
    ) -> Result<Tensor<B, 4>> {
        let eps = match self.unconditional {
            Some(unconditional) if self.guidance_scale != 1.0 => {
                let eps_cond = self.apply_model(x, timesteps, conditioning)?;
                let eps_uncond = self.apply_model(x, timesteps, unconditional)?;
                apply_guidance(eps_uncond, eps_cond, self.guidance_scale)
            }
            _ => self.apply_model(x, timesteps, conditioning)?,
        };

        match self.corrector {
            Some(corrector) => corrector
                .modify_score(self.model, eps, x, timesteps, conditioning)
                .map_err(SamplerError::inference("score corrector")),
            None => Ok(eps),
        }
    }

    /// One UNet call, preceded by a ControlNet call when a hint is present
    pub fn apply_model(
        &self,
        x: &Tensor<B, 4>,
        timesteps: &Tensor<B, 1, Int>,
        conditioning: &Conditioning<B>,
    ) -> Result<Tensor<B, 4>> {
        let controls = match &conditioning.concat {
            None => Vec::new(),
            Some(hint) => {
                let outputs = self
                    .control_model
                    .infer(ControlInputs {
                        x: x.clone(),
                        timesteps: timesteps.clone(),
                        context: conditioning.crossattn.clone(),
                        hint: hint.clone(),
                    })
                    .map_err(SamplerError::inference("control model"))?;

                let controls = collect_controls(outputs);
                match self.control_scales {
                    Some(scales) => scale_controls(controls, scales)?,
                    None => controls,
                }
            }
        };

        self.model
            .infer(UnetInputs {
                x: x.clone(),
                timesteps: timesteps.clone(),
                context: conditioning.crossattn.clone(),
                controls,
            })
            .map_err(SamplerError::inference("denoising model"))
    }
}

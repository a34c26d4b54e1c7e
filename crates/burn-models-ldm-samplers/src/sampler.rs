//! Sampling loop for ControlNet latent diffusion
//!
//! [`LdmSampler`] owns the denoising and control models and runs the reverse
//! diffusion from pure noise (or a caller-supplied starting sample) down to a
//! clean latent, using either the DDIM or the PLMS update.
//!
//! # Example
//!
//! ```ignore
//! use burn_models_ldm_samplers::{
//!     Conditioning, LdmSampler, SampleCallbacks, SampleRequest, SamplerKind, SamplingConfig,
//! };
//!
//! let sampler = LdmSampler::new(unet, controlnet, SamplerKind::plms(), &device);
//! let cond = Conditioning::new(context).with_hint(canny_edges);
//! let uncond = Conditioning::new(empty_context).with_hint(canny_edges);
//!
//! let request = SampleRequest::new(&cond, 1, [4, 64, 64]).with_unconditional(&uncond);
//! let config = SamplingConfig { steps: 20, guidance_scale: 9.0, ..Default::default() };
//! let (latent, _) = sampler.sample(request, &config, &mut SampleCallbacks::default())?;
//! ```

use std::fmt;
use std::str::FromStr;

use burn::prelude::*;
use serde::{Deserialize, Serialize};

use crate::conditioning::Conditioning;
use crate::ddim::ddim_step;
use crate::error::{Result, SamplerError};
use crate::guidance::GuidedDenoiser;
use crate::model::{ControlModel, DenoisingModel, ScoreCorrector};
use crate::plms::{plms_step, EpsHistory};
use crate::schedule::{ScheduleParams, ScheduleTables};
use crate::step::{noise_like, NoiseParams, StepContext, StepResult};
use crate::timesteps::{Discretization, PlannedStep, StepPlan};

// ============================================================================
// Sampler Selection
// ============================================================================

/// Sampler algorithm names
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SamplerName {
    Ddim,
    Plms,
}

impl SamplerName {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Ddim => "DDIM",
            Self::Plms => "PLMS",
        }
    }
}

impl fmt::Display for SamplerName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SamplerName {
    type Err = SamplerError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "ddim" => Ok(Self::Ddim),
            "plms" => Ok(Self::Plms),
            _ => Err(SamplerError::UnknownSampler(s.to_string())),
        }
    }
}

/// Sampler algorithm with its parameters
///
/// PLMS only supports eta = 0, so it carries no eta at all.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum SamplerKind {
    /// Single-step implicit update
    Ddim {
        /// Noise interpolation (0.0 = deterministic)
        #[serde(default)]
        eta: f64,
    },
    /// Multistep linear predictor with a history of noise estimates
    Plms,
}

impl Default for SamplerKind {
    fn default() -> Self {
        Self::Ddim { eta: 0.0 }
    }
}

impl SamplerKind {
    pub fn ddim(eta: f64) -> Self {
        Self::Ddim { eta }
    }

    pub fn plms() -> Self {
        Self::Plms
    }

    /// Validated construction from a sampler name and an eta
    pub fn from_parts(name: &str, eta: f64) -> Result<Self> {
        match name.parse::<SamplerName>()? {
            SamplerName::Ddim => Ok(Self::Ddim { eta }),
            SamplerName::Plms if eta != 0.0 => Err(SamplerError::EtaNotSupported {
                sampler: SamplerName::Plms.as_str(),
                eta,
            }),
            SamplerName::Plms => Ok(Self::Plms),
        }
    }

    pub fn name(&self) -> SamplerName {
        match self {
            Self::Ddim { .. } => SamplerName::Ddim,
            Self::Plms => SamplerName::Plms,
        }
    }

    pub fn eta(&self) -> f64 {
        match self {
            Self::Ddim { eta } => *eta,
            Self::Plms => 0.0,
        }
    }

    /// Discretization actually used; PLMS always plans uniformly
    pub fn discretization(&self, requested: Discretization) -> Discretization {
        match self {
            Self::Ddim { .. } => requested,
            Self::Plms => Discretization::Uniform,
        }
    }

    /// Advance `x` by one planned step
    pub fn integrate_step<B, M, C>(
        &self,
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
        match self {
            Self::Ddim { .. } => ddim_step(denoiser, ctx, x, step, conditioning),
            Self::Plms => plms_step(denoiser, ctx, x, step, conditioning, history),
        }
    }
}

// ============================================================================
// Configuration
// ============================================================================

/// Per-run sampling configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SamplingConfig {
    /// Number of fast steps
    pub steps: usize,
    /// Spacing of the fast steps (ignored by PLMS)
    pub discretization: Discretization,
    /// Classifier-free guidance scale (1.0 = no guidance)
    pub guidance_scale: f64,
    /// Per-level ControlNet multipliers, one per control output
    pub control_scales: Option<Vec<f32>>,
    /// Stochastic term controls
    #[serde(flatten)]
    pub noise: NoiseParams,
    /// Snapshot stride for [`Intermediates`]
    pub log_every_t: usize,
    /// Walk every training timestep instead of the fast plan
    pub use_original_steps: bool,
    /// Run only a proportional prefix of the plan
    pub timesteps: Option<usize>,
}

impl Default for SamplingConfig {
    fn default() -> Self {
        Self {
            steps: 50,
            discretization: Discretization::Uniform,
            guidance_scale: 1.0,
            control_scales: None,
            noise: NoiseParams::default(),
            log_every_t: 100,
            use_original_steps: false,
            timesteps: None,
        }
    }
}

/// Tensors and collaborators for one run
pub struct SampleRequest<'a, B: Backend> {
    pub conditioning: &'a Conditioning<B>,
    /// Unconditional branch for classifier-free guidance
    pub unconditional: Option<&'a Conditioning<B>>,
    pub batch_size: usize,
    /// Sample shape without the batch dimension [channels, height, width]
    pub shape: [usize; 3],
    /// Inpainting mask: 1 keeps the known pixels, 0 regenerates
    pub mask: Option<Tensor<B, 4>>,
    /// Known clean sample for the masked regions
    pub x0: Option<Tensor<B, 4>>,
    /// Starting sample; fresh Gaussian noise if absent
    pub x_t: Option<Tensor<B, 4>>,
    pub score_corrector: Option<&'a dyn ScoreCorrector<B>>,
}

impl<'a, B: Backend> SampleRequest<'a, B> {
    pub fn new(conditioning: &'a Conditioning<B>, batch_size: usize, shape: [usize; 3]) -> Self {
        Self {
            conditioning,
            unconditional: None,
            batch_size,
            shape,
            mask: None,
            x0: None,
            x_t: None,
            score_corrector: None,
        }
    }

    pub fn with_unconditional(mut self, unconditional: &'a Conditioning<B>) -> Self {
        self.unconditional = Some(unconditional);
        self
    }

    /// Keep the regions where `mask` is 1 on the forward-noised trajectory of `x0`
    pub fn with_mask(mut self, mask: Tensor<B, 4>, x0: Tensor<B, 4>) -> Self {
        self.mask = Some(mask);
        self.x0 = Some(x0);
        self
    }

    pub fn with_initial_noise(mut self, x_t: Tensor<B, 4>) -> Self {
        self.x_t = Some(x_t);
        self
    }

    pub fn with_score_corrector(mut self, corrector: &'a dyn ScoreCorrector<B>) -> Self {
        self.score_corrector = Some(corrector);
        self
    }
}

/// Observers invoked once per step
pub struct SampleCallbacks<'a, B: Backend> {
    /// Called with the step number
    pub progress: Option<Box<dyn FnMut(usize) + 'a>>,
    /// Called with the predicted clean sample and the step number
    pub image: Option<Box<dyn FnMut(&Tensor<B, 4>, usize) + 'a>>,
}

impl<B: Backend> Default for SampleCallbacks<'_, B> {
    fn default() -> Self {
        Self {
            progress: None,
            image: None,
        }
    }
}

/// Snapshots taken during a run, starting with the initial sample
#[derive(Debug, Clone)]
pub struct Intermediates<B: Backend> {
    pub x_inter: Vec<Tensor<B, 4>>,
    pub pred_x0: Vec<Tensor<B, 4>>,
}

impl<B: Backend> Intermediates<B> {
    fn new(initial: &Tensor<B, 4>) -> Self {
        Self {
            x_inter: vec![initial.clone()],
            pred_x0: vec![initial.clone()],
        }
    }

    pub fn len(&self) -> usize {
        self.x_inter.len()
    }

    pub fn is_empty(&self) -> bool {
        self.x_inter.is_empty()
    }
}

/// Blend known pixels into the sample: `known * mask + (1 - mask) * x`
pub fn blend_known<B: Backend>(
    x: Tensor<B, 4>,
    known: Tensor<B, 4>,
    mask: Tensor<B, 4>,
) -> Tensor<B, 4> {
    known * mask.clone() + (mask.neg() + 1.0) * x
}

// ============================================================================
// Sampler
// ============================================================================

/// DDIM / PLMS sampler driving a UNet and a ControlNet
pub struct LdmSampler<B: Backend, M, C> {
    model: M,
    control_model: C,
    kind: SamplerKind,
    schedule: ScheduleParams,
    device: B::Device,
}

impl<B, M, C> LdmSampler<B, M, C>
where
    B: Backend,
    M: DenoisingModel<B>,
    C: ControlModel<B>,
{
    /// Create a sampler with the SD 1.x linear schedule
    pub fn new(model: M, control_model: C, kind: SamplerKind, device: &B::Device) -> Self {
        Self {
            model,
            control_model,
            kind,
            schedule: ScheduleParams::default(),
            device: device.clone(),
        }
    }

    /// Override the beta schedule bounds and training timestep count
    pub fn with_schedule(mut self, schedule: ScheduleParams) -> Self {
        self.schedule = schedule;
        self
    }

    pub fn kind(&self) -> SamplerKind {
        self.kind
    }

    pub fn model(&self) -> &M {
        &self.model
    }

    pub fn control_model(&self) -> &C {
        &self.control_model
    }

    pub fn device(&self) -> &B::Device {
        &self.device
    }

    /// Build the schedule tables for a run of `steps` fast steps
    pub fn make_schedule(
        &self,
        steps: usize,
        discretization: Discretization,
    ) -> Result<ScheduleTables> {
        ScheduleTables::build(&ScheduleParams {
            steps,
            discretization: self.kind.discretization(discretization),
            eta: self.kind.eta(),
            ..self.schedule.clone()
        })
    }

    /// Run the full reverse diffusion
    ///
    /// Returns the final sample and the intermediate snapshots. All
    /// preconditions are checked before the first model call.
    pub fn sample(
        &self,
        request: SampleRequest<'_, B>,
        config: &SamplingConfig,
        callbacks: &mut SampleCallbacks<'_, B>,
    ) -> Result<(Tensor<B, 4>, Intermediates<B>)> {
        let conditioning_batch = request.conditioning.batch_size();
        if conditioning_batch != request.batch_size {
            log::warn!(
                "Got {} conditionings but batch-size is {}",
                conditioning_batch,
                request.batch_size
            );
        }

        let denoiser = GuidedDenoiser::new(&self.model, &self.control_model)
            .with_guidance(request.unconditional, config.guidance_scale)
            .with_control_scales(config.control_scales.as_deref());
        let denoiser = match request.score_corrector {
            Some(corrector) => denoiser.with_score_corrector(corrector)?,
            None => denoiser,
        };

        let known = match (request.mask, request.x0) {
            (Some(mask), Some(x0)) => Some((mask, x0)),
            (Some(_), None) => return Err(SamplerError::MissingKnownSample),
            (None, _) => None,
        };

        let tables = self.make_schedule(config.steps, config.discretization)?;

        let [c, h, w] = request.shape;
        let size = [request.batch_size, c, h, w];
        log::info!(
            "Data shape for {} sampling is {:?}, eta {}, {} discretization",
            self.kind.name(),
            size,
            tables.eta(),
            self.kind.discretization(config.discretization).as_str()
        );

        let plan = if config.use_original_steps {
            let total = tables.num_train_timesteps();
            StepPlan::original(config.timesteps.unwrap_or(total).min(total))
        } else {
            match config.timesteps {
                Some(timesteps) => tables.plan().truncated(timesteps),
                None => tables.plan().clone(),
            }
        };

        let x = request
            .x_t
            .unwrap_or_else(|| noise_like::<B>(size, &self.device));

        let ctx = StepContext {
            tables: &tables,
            use_original_steps: config.use_original_steps,
            noise: config.noise,
            device: &self.device,
        };

        self.sampling_loop(
            &denoiser,
            &ctx,
            &plan,
            x,
            request.conditioning,
            known,
            config.log_every_t,
            callbacks,
        )
    }

    #[allow(clippy::too_many_arguments)]
    fn sampling_loop(
        &self,
        denoiser: &GuidedDenoiser<'_, B, M, C>,
        ctx: &StepContext<'_, B>,
        plan: &StepPlan,
        mut img: Tensor<B, 4>,
        conditioning: &Conditioning<B>,
        known: Option<(Tensor<B, 4>, Tensor<B, 4>)>,
        log_every_t: usize,
        callbacks: &mut SampleCallbacks<'_, B>,
    ) -> Result<(Tensor<B, 4>, Intermediates<B>)> {
        let total_steps = plan.len();
        log::info!(
            "Running {} Sampling with {} timesteps",
            self.kind.name(),
            total_steps
        );

        let mut intermediates = Intermediates::new(&img);
        let mut history = EpsHistory::new();

        for step in plan.traversal() {
            log::debug!(
                "{} step {}/{}: t={}, index={}",
                self.kind.name(),
                step.step + 1,
                total_steps,
                step.timestep,
                step.index
            );

            if let Some((mask, x0)) = &known {
                let noise = noise_like::<B>(x0.dims(), ctx.device);
                let img_orig = ctx.tables.q_sample(x0.clone(), step.timestep, noise);
                img = blend_known(img, img_orig, mask.clone());
            }

            let out = self
                .kind
                .integrate_step(denoiser, ctx, &img, &step, conditioning, &history)?;
            img = out.x_prev;
            if let Some(eps) = out.eps {
                history.push(eps);
            }

            if let Some(progress) = callbacks.progress.as_mut() {
                progress(step.step);
            }
            if let Some(image) = callbacks.image.as_mut() {
                image(&out.pred_x0, step.step);
            }

            if step.index.checked_rem(log_every_t) == Some(0) || step.index == total_steps - 1 {
                intermediates.x_inter.push(img.clone());
                intermediates.pred_x0.push(out.pred_x0);
            }
        }

        Ok((img, intermediates))
    }
}

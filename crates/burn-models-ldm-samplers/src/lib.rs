//! DDIM and PLMS samplers for ControlNet-conditioned latent diffusion
//!
//! The samplers are generic over the burn backend and treat the denoising
//! UNet and the ControlNet as opaque inference services (see [`model`]).

pub mod conditioning;
pub mod ddim;
pub mod error;
pub mod guidance;
pub mod model;
pub mod plms;
pub mod sampler;
pub mod schedule;
pub mod step;
pub mod timesteps;

pub use conditioning::Conditioning;
pub use ddim::ddim_step;
pub use error::{InferenceError, Result, SamplerError};
pub use guidance::{apply_guidance, collect_controls, scale_controls, GuidedDenoiser};
pub use model::{
    control_name, ControlInputs, ControlModel, ControlOutputs, DenoisingModel, NoControl,
    PredictionType, ScoreCorrector, UnetInputs,
};
pub use plms::{adams_bashforth_weights, plms_step, EpsHistory, MAX_HISTORY};
pub use sampler::{
    blend_known, Intermediates, LdmSampler, SampleCallbacks, SampleRequest, SamplerKind,
    SamplerName, SamplingConfig,
};
pub use schedule::{
    linear_betas, ScheduleParams, ScheduleTables, StepCoefficients, NUM_TRAIN_TIMESTEPS,
};
pub use step::{NoiseParams, StepContext, StepResult};
pub use timesteps::{Discretization, PlannedStep, StepPlan};

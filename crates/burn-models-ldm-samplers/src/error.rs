//! Error types for latent diffusion sampling

use thiserror::Error;

/// Error returned by an inference service (denoising UNet, ControlNet, score corrector)
pub type InferenceError = Box<dyn std::error::Error + Send + Sync>;

/// Errors that can occur while configuring or running a sampler
///
/// Everything except [`SamplerError::Inference`] is a precondition violation
/// and is reported before the first model call of a run.
#[derive(Error, Debug)]
pub enum SamplerError {
    #[error("eta must be 0 for the {sampler} sampler, got {eta}")]
    EtaNotSupported { sampler: &'static str, eta: f64 },

    #[error("Unknown sampler: {0}")]
    UnknownSampler(String),

    #[error("alphas have to be defined for each timestep: expected {expected}, got {actual}")]
    ScheduleLength { expected: usize, actual: usize },

    #[error("Invalid step count {steps}: must be in 1..={max}")]
    InvalidStepCount { steps: usize, max: usize },

    #[error("Control scale mismatch: {scales} scales for {controls} control outputs")]
    ControlScaleMismatch { scales: usize, controls: usize },

    #[error("Score correction requires an epsilon-parameterized model, got {0:?}")]
    ScoreCorrectorParameterization(crate::model::PredictionType),

    #[error("An inpainting mask was supplied without known pixels (x0)")]
    MissingKnownSample,

    #[error("{service} inference failed: {source}")]
    Inference {
        service: &'static str,
        #[source]
        source: InferenceError,
    },
}

impl SamplerError {
    pub(crate) fn inference(service: &'static str) -> impl FnOnce(InferenceError) -> Self {
        move |source| Self::Inference { service, source }
    }
}

pub type Result<T> = std::result::Result<T, SamplerError>;

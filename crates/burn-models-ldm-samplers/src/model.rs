//! Inference service contracts
//!
//! The denoising UNet, the ControlNet and the optional score corrector are
//! opaque collaborators; the sampler only talks to them through these traits.

use std::collections::HashMap;

use burn::prelude::*;
use burn::tensor::Int;
use serde::{Deserialize, Serialize};

use crate::conditioning::Conditioning;
use crate::error::InferenceError;

/// Model prediction type
///
/// Different diffusion models are trained to predict different quantities:
/// - Epsilon (noise): SD 1.x, ControlNet checkpoints
/// - V-prediction (velocity): SD 2.x
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PredictionType {
    /// Model predicts the noise (epsilon) added to the sample
    #[default]
    Epsilon,
    /// Model predicts the velocity v = alpha_t * epsilon - sqrt(1-alpha_t) * x0
    VPrediction,
    /// Model predicts the original sample x0
    Sample,
}

/// Inputs of one denoising UNet call
pub struct UnetInputs<B: Backend> {
    /// Noisy sample [batch, channels, height, width]
    pub x: Tensor<B, 4>,
    /// Timestep per batch element [batch]
    pub timesteps: Tensor<B, 1, Int>,
    /// Cross-attention context [batch, seq_len, embed_dim]
    pub context: Tensor<B, 3>,
    /// Control residuals; entry `i` is the named input `control_{i}`
    pub controls: Vec<Tensor<B, 4>>,
}

impl<B: Backend> UnetInputs<B> {
    /// Control residuals paired with their input names
    pub fn named_controls(&self) -> impl Iterator<Item = (String, &Tensor<B, 4>)> + '_ {
        self.controls
            .iter()
            .enumerate()
            .map(|(i, c)| (control_name(i), c))
    }
}

/// Inputs of one ControlNet call
pub struct ControlInputs<B: Backend> {
    pub x: Tensor<B, 4>,
    pub timesteps: Tensor<B, 1, Int>,
    pub context: Tensor<B, 3>,
    /// Structural hint image (edges, pose, depth, ...)
    pub hint: Tensor<B, 4>,
}

/// Named outputs of a ControlNet call
///
/// Control signals live under `control_0`, `control_1`, ...; other entries
/// are ignored.
pub type ControlOutputs<B> = HashMap<String, Tensor<B, 4>>;

/// Name of the `i`-th control signal
pub fn control_name(i: usize) -> String {
    format!("control_{i}")
}

/// Noise-prediction network
pub trait DenoisingModel<B: Backend> {
    /// Predict the model output for a noisy sample
    fn infer(&self, inputs: UnetInputs<B>) -> Result<Tensor<B, 4>, InferenceError>;

    /// What the model output represents
    fn prediction_type(&self) -> PredictionType {
        PredictionType::Epsilon
    }
}

/// Structural conditioning network
pub trait ControlModel<B: Backend> {
    /// Compute per-level control signals for a hint
    fn infer(&self, inputs: ControlInputs<B>) -> Result<ControlOutputs<B>, InferenceError>;
}

/// Post-hoc correction applied to every noise prediction
pub trait ScoreCorrector<B: Backend> {
    fn modify_score(
        &self,
        model: &dyn DenoisingModel<B>,
        eps: Tensor<B, 4>,
        x: &Tensor<B, 4>,
        timesteps: &Tensor<B, 1, Int>,
        conditioning: &Conditioning<B>,
    ) -> Result<Tensor<B, 4>, InferenceError>;
}

/// Control model for pipelines without structural hints
///
/// Any conditioning that does carry a hint fails at the first step.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoControl;

impl<B: Backend> ControlModel<B> for NoControl {
    fn infer(&self, _inputs: ControlInputs<B>) -> Result<ControlOutputs<B>, InferenceError> {
        Err("conditioning carries a hint but no control model is configured".into())
    }
}

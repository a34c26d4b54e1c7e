//! ControlNet conditioning

use burn::prelude::*;

/// Conditioning for one guidance branch
///
/// `crossattn` feeds the UNet cross-attention layers. `concat` is the
/// optional structural hint that is routed through the control model.
#[derive(Debug, Clone)]
pub struct Conditioning<B: Backend> {
    /// Text context [batch, seq_len, embed_dim]
    pub crossattn: Tensor<B, 3>,
    /// Hint image [batch, channels, height, width]
    pub concat: Option<Tensor<B, 4>>,
}

impl<B: Backend> Conditioning<B> {
    /// Text-only conditioning
    pub fn new(crossattn: Tensor<B, 3>) -> Self {
        Self {
            crossattn,
            concat: None,
        }
    }

    /// Attach a structural hint
    pub fn with_hint(mut self, hint: Tensor<B, 4>) -> Self {
        self.concat = Some(hint);
        self
    }

    /// Batch size of the context
    pub fn batch_size(&self) -> usize {
        self.crossattn.dims()[0]
    }

    pub fn has_hint(&self) -> bool {
        self.concat.is_some()
    }
}

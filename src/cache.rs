//! Hidden-state cache for storing last-token activations

use anyhow::Result;
use candle_core::{DType, Device, Tensor};

/// Stores the last-token activation of every hidden state from a forward pass
///
/// Index 0 is the token embedding output, index `n` the output of decoder
/// layer `n` (the last one after the final norm). Each tensor has shape
/// `(d_model,)`.
#[derive(Debug)]
pub struct HiddenStateCache {
    activations: Vec<Tensor>,
}

impl HiddenStateCache {
    /// Create a new cache from collected activations
    pub fn new(activations: Vec<Tensor>) -> Self {
        Self { activations }
    }

    /// Create an empty cache with capacity for n_states
    pub fn with_capacity(n_states: usize) -> Self {
        Self {
            activations: Vec::with_capacity(n_states),
        }
    }

    /// Add a hidden state's last-token activation
    pub fn push(&mut self, tensor: Tensor) {
        self.activations.push(tensor);
    }

    /// Get activation for a specific hidden-state index
    pub fn get_layer(&self, layer: usize) -> Option<&Tensor> {
        self.activations.get(layer)
    }

    /// Number of cached hidden states (decoder depth + 1)
    pub fn n_states(&self) -> usize {
        self.activations.len()
    }

    /// Check if cache is empty
    pub fn is_empty(&self) -> bool {
        self.activations.is_empty()
    }

    /// Get all activations
    pub fn activations(&self) -> &[Tensor] {
        &self.activations
    }

    /// Stack into the `(d_model, n_states)` F32 matrix on the CPU
    pub fn to_embedding_matrix(&self) -> Result<Tensor> {
        anyhow::ensure!(!self.activations.is_empty(), "Hidden-state cache is empty");
        let columns = self
            .activations
            .iter()
            .map(|t| {
                t.flatten_all()?
                    .to_dtype(DType::F32)?
                    .to_device(&Device::Cpu)
            })
            .collect::<candle_core::Result<Vec<_>>>()?;
        Ok(Tensor::stack(&columns, 1)?)
    }
}

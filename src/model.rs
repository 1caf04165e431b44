//! TrajModel wrapper for hidden-state extraction
//!
//! Pairs a tokenizer with a decoder backend behind one interface.

use anyhow::{Context, Result};
use candle_core::{DType, Device, Tensor};
use hf_hub::{api::sync::Api, Repo, RepoType};
use tokenizers::Tokenizer;
use tracing::info;

use crate::cache::HiddenStateCache;
use crate::forward_llama::TrajLlama;
use crate::models::ModelArchitecture;
use crate::trajectory::EmbeddingSource;

/// Backend trait for decoder implementations.
///
/// Implementing this trait is the only requirement for adding a new model
/// family.
pub trait TrajBackend {
    /// Number of decoder layers
    fn n_layers(&self) -> usize;
    /// Hidden size
    fn d_model(&self) -> usize;
    /// Longest sequence the position embeddings cover
    fn max_position_embeddings(&self) -> usize;
    /// Forward pass returning the last-token state of every hidden state
    fn forward_hidden_states(&self, input_ids: &Tensor) -> Result<HiddenStateCache>;
}

/// Compute dtype for a device: F32 unless BF16 is requested on CUDA
pub fn select_dtype(device: &Device, bf16: bool) -> DType {
    if bf16 && device.is_cuda() {
        DType::BF16
    } else {
        DType::F32
    }
}

/// High-level model wrapper
pub struct TrajModel {
    model: Box<dyn TrajBackend>,
    tokenizer: Tokenizer,
    device: Device,
    architecture: ModelArchitecture,
    model_id: String,
}

impl TrajModel {
    /// Load a model from HuggingFace (tries CUDA, falls back to CPU)
    pub fn from_pretrained(model_id: &str) -> Result<Self> {
        Self::from_pretrained_with_device(model_id, false)
    }

    /// Load with explicit device choice, computing in F32
    pub fn from_pretrained_with_device(model_id: &str, force_cpu: bool) -> Result<Self> {
        Self::from_pretrained_with_options(model_id, force_cpu, false)
    }

    /// Load with explicit device and precision choice
    ///
    /// `bf16` only takes effect on CUDA; the CPU path always runs in F32.
    pub fn from_pretrained_with_options(
        model_id: &str,
        force_cpu: bool,
        bf16: bool,
    ) -> Result<Self> {
        let architecture = ModelArchitecture::from_model_id(model_id);

        let device = if force_cpu {
            info!("Forcing CPU mode");
            Device::Cpu
        } else {
            match Device::cuda_if_available(0) {
                Ok(dev) if dev.is_cuda() => {
                    info!("Using CUDA device");
                    dev
                }
                _ => {
                    info!("CUDA not available, using CPU");
                    Device::Cpu
                }
            }
        };
        let dtype = select_dtype(&device, bf16);

        info!("Loading model: {}", model_id);
        info!("Architecture: {:?}", architecture);
        info!("Device: {:?}", device);
        info!("Dtype: {:?}", dtype);

        let api = Api::new()?;
        let repo = api.repo(Repo::new(model_id.to_string(), RepoType::Model));
        let tokenizer_path = repo
            .get("tokenizer.json")
            .context("Failed to download tokenizer.json")?;
        let tokenizer = Tokenizer::from_file(&tokenizer_path)
            .map_err(|e| anyhow::anyhow!("Tokenizer error: {e}"))?;

        // Mistral shares the LLaMA weight layout; its sliding window comes from config.json
        let model: Box<dyn TrajBackend> = match architecture {
            ModelArchitecture::Llama | ModelArchitecture::Mistral => {
                Box::new(TrajLlama::load(model_id, &device, dtype)?)
            }
        };

        Ok(Self::new(model, tokenizer, device, architecture, model_id))
    }

    /// Assemble a model from already-built parts
    pub fn new(
        model: Box<dyn TrajBackend>,
        tokenizer: Tokenizer,
        device: Device,
        architecture: ModelArchitecture,
        model_id: &str,
    ) -> Self {
        Self {
            model,
            tokenizer,
            device,
            architecture,
            model_id: model_id.to_string(),
        }
    }

    /// Get the model architecture
    pub fn architecture(&self) -> ModelArchitecture {
        self.architecture
    }

    /// Get the model ID
    pub fn model_id(&self) -> &str {
        &self.model_id
    }

    /// Number of decoder layers
    pub fn n_layers(&self) -> usize {
        self.model.n_layers()
    }

    /// Hidden dimension of the model
    pub fn d_model(&self) -> usize {
        self.model.d_model()
    }

    /// Tokenize text, adding the tokenizer's special tokens
    pub fn encode(&self, text: &str) -> Result<Vec<u32>> {
        let encoding = self
            .tokenizer
            .encode(text, true)
            .map_err(|e| anyhow::anyhow!("Tokenization error: {e}"))?;
        Ok(encoding.get_ids().to_vec())
    }

    /// Decode token IDs back to text
    pub fn decode(&self, ids: &[u32]) -> Result<String> {
        self.tokenizer
            .decode(ids, false)
            .map_err(|e| anyhow::anyhow!("Decoding error: {e}"))
    }

    /// Get hidden states for a token sequence
    pub fn get_hidden_states(&self, ids: &[u32]) -> Result<HiddenStateCache> {
        let input_tensor = Tensor::new(ids, &self.device)?.unsqueeze(0)?;
        self.model.forward_hidden_states(&input_tensor)
    }
}

impl EmbeddingSource for TrajModel {
    fn hidden_size(&self) -> usize {
        self.d_model()
    }

    fn n_hidden_states(&self) -> usize {
        self.n_layers() + 1
    }

    fn max_positions(&self) -> usize {
        self.model.max_position_embeddings()
    }

    fn encode(&self, text: &str) -> Result<Vec<u32>> {
        TrajModel::encode(self, text)
    }

    fn decode(&self, ids: &[u32]) -> Result<String> {
        TrajModel::decode(self, ids)
    }

    fn last_token_embeddings(&self, chunk: &[u32]) -> Result<Tensor> {
        self.get_hidden_states(chunk)?.to_embedding_matrix()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use tokenizers::models::wordlevel::WordLevel;
    use tokenizers::pre_tokenizers::whitespace::Whitespace;

    /// Backend echoing each token id into every hidden dimension
    struct EchoBackend;

    impl TrajBackend for EchoBackend {
        fn n_layers(&self) -> usize {
            2
        }

        fn d_model(&self) -> usize {
            3
        }

        fn max_position_embeddings(&self) -> usize {
            16
        }

        fn forward_hidden_states(&self, input_ids: &Tensor) -> Result<HiddenStateCache> {
            let ids: Vec<u32> = input_ids.flatten_all()?.to_vec1()?;
            let last = *ids.last().unwrap_or(&0) as f32;
            let states = (0..3)
                .map(|layer| Tensor::new(&[last, last, last + layer as f32], &Device::Cpu))
                .collect::<candle_core::Result<Vec<_>>>()?;
            Ok(HiddenStateCache::new(states))
        }
    }

    fn word_tokenizer() -> Tokenizer {
        let vocab: HashMap<String, u32> = ["[UNK]", "walden", "pond", "woods"]
            .iter()
            .enumerate()
            .map(|(i, w)| (w.to_string(), i as u32))
            .collect();
        let model = WordLevel::builder()
            .vocab(vocab)
            .unk_token("[UNK]".to_string())
            .build()
            .unwrap();
        let mut tokenizer = Tokenizer::new(model);
        tokenizer.with_pre_tokenizer(Some(Whitespace::default()));
        tokenizer
    }

    fn echo_model() -> TrajModel {
        TrajModel::new(
            Box::new(EchoBackend),
            word_tokenizer(),
            Device::Cpu,
            ModelArchitecture::Llama,
            "meta-llama/Llama-3.2-1B",
        )
    }

    #[test]
    fn test_cpu_always_computes_in_f32() {
        assert_eq!(select_dtype(&Device::Cpu, false), DType::F32);
        assert_eq!(select_dtype(&Device::Cpu, true), DType::F32);
    }

    #[test]
    fn test_encode_decode() {
        let model = echo_model();
        let ids = model.encode("walden pond woods").unwrap();
        assert_eq!(ids, vec![1, 2, 3]);
        assert_eq!(model.decode(&ids).unwrap(), "walden pond woods");
    }

    #[test]
    fn test_last_token_embeddings_shape() {
        let model = echo_model();
        assert_eq!(model.n_hidden_states(), 3);
        assert_eq!(model.max_positions(), 16);

        let matrix = model.last_token_embeddings(&[1, 2, 3]).unwrap();
        assert_eq!(matrix.dims(), &[3, 3]);
        let rows: Vec<Vec<f32>> = matrix.to_vec2().unwrap();
        assert_eq!(rows[2], vec![3.0, 4.0, 5.0]);
    }
}

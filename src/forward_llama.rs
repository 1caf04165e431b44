//! LLaMA-family forward pass with hidden-state capture
//!
//! Runs the decoder layer by layer so the residual stream after every
//! layer can be read. Covers LLaMA 2, LLaMA 3.x (llama3 RoPE scaling) and
//! Mistral (sliding-window attention), which share the same weight layout:
//! - No bias on any projection (Q, K, V, O, MLP)
//! - Grouped query attention when num_key_value_heads < num_attention_heads
//! - RoPE in the half-rotation layout used by HF checkpoints
//!
//! The language-model head is never loaded: only hidden states are needed.

use anyhow::{Context, Result};
use candle_core::{DType, Device, IndexOp, Module, Tensor};
use candle_nn::{embedding, linear_no_bias, Embedding, Linear, RmsNorm, VarBuilder};
use hf_hub::{api::sync::Api, Repo, RepoType};
use tracing::{info, trace};

use crate::cache::HiddenStateCache;
use crate::masks::create_causal_mask;
use crate::model::TrajBackend;

/// Model configuration (matches HuggingFace config.json for LLaMA / Mistral)
#[derive(Debug, Clone, serde::Deserialize)]
pub struct LlamaConfig {
    pub hidden_size: usize,
    pub intermediate_size: usize,
    pub num_attention_heads: usize,
    #[serde(default)]
    pub num_key_value_heads: Option<usize>,
    #[serde(default)]
    pub head_dim: Option<usize>,
    pub num_hidden_layers: usize,
    pub vocab_size: usize,
    #[serde(default = "default_rope_theta")]
    pub rope_theta: f64,
    #[serde(default = "default_rms_norm_eps")]
    pub rms_norm_eps: f64,
    #[serde(default = "default_max_position_embeddings")]
    pub max_position_embeddings: usize,
    #[serde(default)]
    pub rope_scaling: Option<RopeScaling>,
    /// Mistral only
    #[serde(default)]
    pub sliding_window: Option<usize>,
}

/// `rope_scaling` block of LLaMA 3.x configs
#[derive(Debug, Clone, serde::Deserialize)]
pub struct RopeScaling {
    #[serde(default = "default_scaling_factor")]
    pub factor: f64,
    #[serde(default = "default_low_freq_factor")]
    pub low_freq_factor: f64,
    #[serde(default = "default_high_freq_factor")]
    pub high_freq_factor: f64,
    #[serde(default = "default_original_max_position_embeddings")]
    pub original_max_position_embeddings: usize,
    #[serde(default, alias = "type")]
    pub rope_type: Option<String>,
}

fn default_rope_theta() -> f64 {
    10_000.0
}

fn default_rms_norm_eps() -> f64 {
    1e-5
}

fn default_max_position_embeddings() -> usize {
    2048
}

fn default_scaling_factor() -> f64 {
    1.0
}

fn default_low_freq_factor() -> f64 {
    1.0
}

fn default_high_freq_factor() -> f64 {
    4.0
}

fn default_original_max_position_embeddings() -> usize {
    8192
}

impl LlamaConfig {
    pub fn num_kv_heads(&self) -> usize {
        self.num_key_value_heads.unwrap_or(self.num_attention_heads)
    }

    pub fn head_dim(&self) -> usize {
        self.head_dim
            .unwrap_or(self.hidden_size / self.num_attention_heads)
    }
}

/// Inverse RoPE frequencies, with llama3 frequency scaling when configured
pub fn rope_inv_freq(head_dim: usize, theta: f64, scaling: Option<&RopeScaling>) -> Vec<f64> {
    let inv_freq = (0..head_dim)
        .step_by(2)
        .map(|i| 1.0 / theta.powf(i as f64 / head_dim as f64));

    let Some(scaling) = scaling.filter(|s| s.rope_type.as_deref() == Some("llama3")) else {
        return inv_freq.collect();
    };

    let old_context = scaling.original_max_position_embeddings as f64;
    let low_freq_wavelen = old_context / scaling.low_freq_factor;
    let high_freq_wavelen = old_context / scaling.high_freq_factor;

    inv_freq
        .map(|freq| {
            let wavelen = 2.0 * std::f64::consts::PI / freq;
            if wavelen < high_freq_wavelen {
                freq
            } else if wavelen > low_freq_wavelen {
                freq / scaling.factor
            } else {
                let smooth = (old_context / wavelen - scaling.low_freq_factor)
                    / (scaling.high_freq_factor - scaling.low_freq_factor);
                (1.0 - smooth) * freq / scaling.factor + smooth * freq
            }
        })
        .collect()
}

/// Rotary Position Embeddings (RoPE)
struct RotaryEmbedding {
    cos: Tensor,
    sin: Tensor,
}

impl RotaryEmbedding {
    fn new(config: &LlamaConfig, device: &Device, dtype: DType) -> Result<Self> {
        let inv_freq: Vec<f32> = rope_inv_freq(
            config.head_dim(),
            config.rope_theta,
            config.rope_scaling.as_ref(),
        )
        .into_iter()
        .map(|f| f as f32)
        .collect();
        let n_freq = inv_freq.len();
        let inv_freq = Tensor::from_vec(inv_freq, (1, n_freq), device)?;

        let max_seq_len = config.max_position_embeddings;
        let positions: Vec<f32> = (0..max_seq_len).map(|i| i as f32).collect();
        let positions = Tensor::from_vec(positions, (max_seq_len, 1), device)?;

        // [seq_len, head_dim/2], computed in F32 before casting
        let freqs = positions.matmul(&inv_freq)?;
        let cos = freqs.cos()?.to_dtype(dtype)?;
        let sin = freqs.sin()?.to_dtype(dtype)?;

        Ok(Self { cos, sin })
    }

    fn apply(&self, q: &Tensor, k: &Tensor) -> Result<(Tensor, Tensor)> {
        let seq_len = q.dim(2)?;
        let cos = self.cos.i(..seq_len)?;
        let sin = self.sin.i(..seq_len)?;

        let q_embed = candle_nn::rotary_emb::rope(&q.contiguous()?, &cos, &sin)?;
        let k_embed = candle_nn::rotary_emb::rope(&k.contiguous()?, &cos, &sin)?;

        Ok((q_embed, k_embed))
    }
}

/// Multi-head attention (no bias on any projection)
struct Attention {
    q_proj: Linear,
    k_proj: Linear,
    v_proj: Linear,
    o_proj: Linear,
    num_heads: usize,
    num_kv_heads: usize,
    head_dim: usize,
}

impl Attention {
    fn load(vb: VarBuilder, config: &LlamaConfig) -> Result<Self> {
        let head_dim = config.head_dim();
        let num_kv_heads = config.num_kv_heads();
        let q_proj = linear_no_bias(
            config.hidden_size,
            config.num_attention_heads * head_dim,
            vb.pp("q_proj"),
        )?;
        let k_proj = linear_no_bias(config.hidden_size, num_kv_heads * head_dim, vb.pp("k_proj"))?;
        let v_proj = linear_no_bias(config.hidden_size, num_kv_heads * head_dim, vb.pp("v_proj"))?;
        let o_proj = linear_no_bias(
            config.num_attention_heads * head_dim,
            config.hidden_size,
            vb.pp("o_proj"),
        )?;

        Ok(Self {
            q_proj,
            k_proj,
            v_proj,
            o_proj,
            num_heads: config.num_attention_heads,
            num_kv_heads,
            head_dim,
        })
    }

    fn forward(&self, x: &Tensor, rotary: &RotaryEmbedding, mask: &Tensor) -> Result<Tensor> {
        let (b, seq_len, _) = x.dims3()?;

        let q = self.q_proj.forward(x)?;
        let k = self.k_proj.forward(x)?;
        let v = self.v_proj.forward(x)?;

        // Reshape for multi-head attention
        let q = q
            .reshape((b, seq_len, self.num_heads, self.head_dim))?
            .transpose(1, 2)?;
        let k = k
            .reshape((b, seq_len, self.num_kv_heads, self.head_dim))?
            .transpose(1, 2)?;
        let v = v
            .reshape((b, seq_len, self.num_kv_heads, self.head_dim))?
            .transpose(1, 2)?;

        let (q, k) = rotary.apply(&q, &k)?;

        // Expand KV heads for grouped query attention
        let k = repeat_kv(k, self.num_heads / self.num_kv_heads)?.contiguous()?;
        let v = repeat_kv(v, self.num_heads / self.num_kv_heads)?.contiguous()?;

        // Scaled dot-product attention
        let scale = 1.0 / (self.head_dim as f64).sqrt();
        let attn_weights = (q.matmul(&k.transpose(2, 3)?.contiguous()?)? * scale)?;
        let attn_weights = attn_weights.broadcast_add(mask)?;
        let attn_weights = candle_nn::ops::softmax_last_dim(&attn_weights)?;
        let attn_output = attn_weights.matmul(&v)?;

        let attn_output = attn_output.transpose(1, 2)?.reshape((b, seq_len, ()))?;
        Ok(self.o_proj.forward(&attn_output)?)
    }
}

fn repeat_kv(x: Tensor, n_rep: usize) -> Result<Tensor> {
    if n_rep == 1 {
        return Ok(x);
    }
    let (b, num_kv_heads, seq_len, head_dim) = x.dims4()?;
    let x = x.unsqueeze(2)?;
    let x = x.expand((b, num_kv_heads, n_rep, seq_len, head_dim))?;
    Ok(x.reshape((b, num_kv_heads * n_rep, seq_len, head_dim))?)
}

/// MLP block (SwiGLU, no bias)
#[allow(clippy::upper_case_acronyms)]
struct MLP {
    gate_proj: Linear,
    up_proj: Linear,
    down_proj: Linear,
}

impl MLP {
    fn load(vb: VarBuilder, config: &LlamaConfig) -> Result<Self> {
        let gate_proj = linear_no_bias(
            config.hidden_size,
            config.intermediate_size,
            vb.pp("gate_proj"),
        )?;
        let up_proj = linear_no_bias(
            config.hidden_size,
            config.intermediate_size,
            vb.pp("up_proj"),
        )?;
        let down_proj = linear_no_bias(
            config.intermediate_size,
            config.hidden_size,
            vb.pp("down_proj"),
        )?;

        Ok(Self {
            gate_proj,
            up_proj,
            down_proj,
        })
    }

    fn forward(&self, x: &Tensor) -> Result<Tensor> {
        // SwiGLU: down(silu(gate(x)) * up(x))
        let gate = candle_nn::ops::silu(&self.gate_proj.forward(x)?)?;
        let up = self.up_proj.forward(x)?;
        Ok(self.down_proj.forward(&(gate * up)?)?)
    }
}

/// Single decoder layer
struct DecoderLayer {
    self_attn: Attention,
    mlp: MLP,
    input_layernorm: RmsNorm,
    post_attention_layernorm: RmsNorm,
}

impl DecoderLayer {
    fn load(vb: VarBuilder, config: &LlamaConfig) -> Result<Self> {
        let self_attn = Attention::load(vb.pp("self_attn"), config)?;
        let mlp = MLP::load(vb.pp("mlp"), config)?;
        let input_layernorm = candle_nn::rms_norm(
            config.hidden_size,
            config.rms_norm_eps,
            vb.pp("input_layernorm"),
        )?;
        let post_attention_layernorm = candle_nn::rms_norm(
            config.hidden_size,
            config.rms_norm_eps,
            vb.pp("post_attention_layernorm"),
        )?;

        Ok(Self {
            self_attn,
            mlp,
            input_layernorm,
            post_attention_layernorm,
        })
    }

    fn forward(&self, x: &Tensor, rotary: &RotaryEmbedding, mask: &Tensor) -> Result<Tensor> {
        let residual = x;
        let x = self.input_layernorm.forward(x)?;
        let x = self.self_attn.forward(&x, rotary, mask)?;
        let x = (residual + x)?;

        let residual = &x;
        let x = self.post_attention_layernorm.forward(&x)?;
        let x = self.mlp.forward(&x)?;
        Ok((residual + x)?)
    }
}

/// Safetensors index for sharded models
#[derive(Debug, serde::Deserialize)]
struct SafetensorsIndex {
    weight_map: std::collections::HashMap<String, String>,
}

/// LLaMA-family decoder with per-layer hidden-state capture
pub struct TrajLlama {
    embed_tokens: Embedding,
    layers: Vec<DecoderLayer>,
    norm: RmsNorm,
    rotary: RotaryEmbedding,
    sliding_window: Option<usize>,
    n_layers: usize,
    hidden_size: usize,
    max_position_embeddings: usize,
}

impl TrajLlama {
    /// Load model from HuggingFace
    pub fn load(model_id: &str, device: &Device, dtype: DType) -> Result<Self> {
        info!("Loading LLaMA-family model from: {}", model_id);

        let api = Api::new()?;
        let repo = api.repo(Repo::new(model_id.to_string(), RepoType::Model));

        let config_path = repo
            .get("config.json")
            .context("Failed to download config.json")?;
        let config_str = std::fs::read_to_string(&config_path).context("Failed to read config")?;
        let config: LlamaConfig = serde_json::from_str(&config_str)?;

        info!(
            "Model config: {} layers, {} hidden, {} max positions",
            config.num_hidden_layers, config.hidden_size, config.max_position_embeddings
        );

        // Check for sharded vs single safetensors
        let weights_paths = if let Ok(index_path) = repo.get("model.safetensors.index.json") {
            info!("Model is sharded, loading index...");
            let index_str = std::fs::read_to_string(&index_path).context("Failed to read index")?;
            let index: SafetensorsIndex = serde_json::from_str(&index_str)?;

            let mut shard_names: Vec<String> = index.weight_map.values().cloned().collect();
            shard_names.sort();
            shard_names.dedup();

            info!("Downloading {} shard files...", shard_names.len());
            shard_names
                .iter()
                .map(|shard_name| {
                    repo.get(shard_name)
                        .with_context(|| format!("Failed to download {shard_name}"))
                })
                .collect::<Result<Vec<_>>>()?
        } else {
            let path = repo
                .get("model.safetensors")
                .context("Failed to download model.safetensors")?;
            vec![path]
        };

        info!("Loading weights from {} file(s)...", weights_paths.len());

        // SAFETY: the safetensors files are not modified while mapped
        let vb = unsafe { VarBuilder::from_mmaped_safetensors(&weights_paths, dtype, device)? };
        Self::from_config(&config, vb, device, dtype)
    }

    /// Build the decoder from a config and a weight source rooted above `model.`
    pub fn from_config(
        config: &LlamaConfig,
        vb: VarBuilder,
        device: &Device,
        dtype: DType,
    ) -> Result<Self> {
        let vb_model = vb.pp("model");

        let embed_tokens = embedding(
            config.vocab_size,
            config.hidden_size,
            vb_model.pp("embed_tokens"),
        )?;

        let mut layers = Vec::with_capacity(config.num_hidden_layers);
        for i in 0..config.num_hidden_layers {
            if (i + 1) % 10 == 0 || i == 0 {
                info!("Loading layer {}/{}", i + 1, config.num_hidden_layers);
            }
            layers.push(DecoderLayer::load(vb_model.pp(format!("layers.{i}")), config)?);
        }

        let norm =
            candle_nn::rms_norm(config.hidden_size, config.rms_norm_eps, vb_model.pp("norm"))?;
        let rotary = RotaryEmbedding::new(config, device, dtype)?;

        info!(
            "Model loaded successfully with {} layers",
            config.num_hidden_layers
        );

        Ok(Self {
            embed_tokens,
            layers,
            norm,
            rotary,
            sliding_window: config.sliding_window,
            n_layers: config.num_hidden_layers,
            hidden_size: config.hidden_size,
            max_position_embeddings: config.max_position_embeddings,
        })
    }

    /// Forward pass capturing the last-token state of every hidden state
    ///
    /// `input_ids` has shape `(1, seq_len)`. The cache holds `n_layers + 1`
    /// entries: the embedding output, then each decoder layer's output, the
    /// last one after the final norm.
    pub fn forward_hidden_states(&self, input_ids: &Tensor) -> Result<HiddenStateCache> {
        let seq_len = input_ids.dim(1)?;
        anyhow::ensure!(seq_len > 0, "Cannot run a forward pass on an empty sequence");
        anyhow::ensure!(
            seq_len <= self.max_position_embeddings,
            "Sequence of {seq_len} tokens exceeds max_position_embeddings ({})",
            self.max_position_embeddings
        );

        let mut cache = HiddenStateCache::with_capacity(self.n_layers + 1);

        let mut hidden = self.embed_tokens.forward(input_ids)?;
        cache.push(hidden.i((0, seq_len - 1))?);

        let mask = create_causal_mask(seq_len, self.sliding_window, hidden.device(), hidden.dtype())?;

        for (i, layer) in self.layers.iter().enumerate() {
            hidden = layer.forward(&hidden, &self.rotary, &mask)?;
            if i + 1 == self.n_layers {
                hidden = self.norm.forward(&hidden)?;
            }
            cache.push(hidden.i((0, seq_len - 1))?);
            trace!("Captured hidden state {}/{}", i + 1, self.n_layers);
        }

        Ok(cache)
    }

    pub fn n_layers(&self) -> usize {
        self.n_layers
    }

    pub fn d_model(&self) -> usize {
        self.hidden_size
    }

    pub fn max_position_embeddings(&self) -> usize {
        self.max_position_embeddings
    }
}

impl TrajBackend for TrajLlama {
    fn n_layers(&self) -> usize {
        self.n_layers
    }

    fn d_model(&self) -> usize {
        self.hidden_size
    }

    fn max_position_embeddings(&self) -> usize {
        self.max_position_embeddings
    }

    fn forward_hidden_states(&self, input_ids: &Tensor) -> Result<HiddenStateCache> {
        TrajLlama::forward_hidden_states(self, input_ids)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_nn::VarMap;
    use serial_test::serial;

    fn tiny_config() -> LlamaConfig {
        serde_json::from_str(
            r#"{
                "hidden_size": 16,
                "intermediate_size": 32,
                "num_attention_heads": 4,
                "num_key_value_heads": 2,
                "num_hidden_layers": 3,
                "vocab_size": 50,
                "max_position_embeddings": 12
            }"#,
        )
        .unwrap()
    }

    fn tiny_model(config: &LlamaConfig) -> (TrajLlama, VarMap) {
        let device = Device::Cpu;
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);
        let model = TrajLlama::from_config(config, vb, &device, DType::F32).unwrap();
        (model, varmap)
    }

    #[test]
    fn test_config_defaults() {
        let config = tiny_config();
        assert_eq!(config.num_kv_heads(), 2);
        assert_eq!(config.head_dim(), 4);
        assert_eq!(config.rope_theta, 10_000.0);
        assert!(config.rope_scaling.is_none());
        assert!(config.sliding_window.is_none());
    }

    #[test]
    fn test_config_llama3_fields() {
        let config: LlamaConfig = serde_json::from_str(
            r#"{
                "hidden_size": 2048, "intermediate_size": 8192,
                "num_attention_heads": 32, "num_key_value_heads": 8, "head_dim": 64,
                "num_hidden_layers": 16, "vocab_size": 128256,
                "rope_theta": 500000.0, "max_position_embeddings": 131072,
                "rope_scaling": {"factor": 32.0, "low_freq_factor": 1.0, "high_freq_factor": 4.0,
                                 "original_max_position_embeddings": 8192, "rope_type": "llama3"},
                "sliding_window": null
            }"#,
        )
        .unwrap();
        let scaling = config.rope_scaling.as_ref().unwrap();
        assert_eq!(scaling.rope_type.as_deref(), Some("llama3"));
        assert_eq!(config.head_dim(), 64);
        assert!(config.sliding_window.is_none());
    }

    #[test]
    fn test_llama3_scaling_bands() {
        let scaling = RopeScaling {
            factor: 32.0,
            low_freq_factor: 1.0,
            high_freq_factor: 4.0,
            original_max_position_embeddings: 8192,
            rope_type: Some("llama3".to_string()),
        };
        let plain = rope_inv_freq(64, 500_000.0, None);
        let scaled = rope_inv_freq(64, 500_000.0, Some(&scaling));
        assert_eq!(plain.len(), 32);

        // Highest frequency is untouched, lowest is divided by the factor
        assert_eq!(scaled[0], plain[0]);
        let last = plain.len() - 1;
        assert!((scaled[last] - plain[last] / 32.0).abs() < 1e-15);
        assert!(scaled.iter().zip(&plain).all(|(s, p)| s <= p));
    }

    #[test]
    fn test_non_llama3_scaling_ignored() {
        let scaling = RopeScaling {
            factor: 2.0,
            low_freq_factor: 1.0,
            high_freq_factor: 4.0,
            original_max_position_embeddings: 8192,
            rope_type: Some("linear".to_string()),
        };
        assert_eq!(
            rope_inv_freq(8, 10_000.0, Some(&scaling)),
            rope_inv_freq(8, 10_000.0, None)
        );
    }

    #[test]
    #[serial]
    fn test_hidden_state_count_and_shape() {
        let config = tiny_config();
        let (model, _varmap) = tiny_model(&config);

        let ids = Tensor::new(&[[3u32, 7, 11, 2]], &Device::Cpu).unwrap();
        let cache = model.forward_hidden_states(&ids).unwrap();

        assert_eq!(cache.n_states(), config.num_hidden_layers + 1);
        for state in cache.activations() {
            assert_eq!(state.dims(), &[16]);
        }
    }

    #[test]
    #[serial]
    fn test_first_state_is_last_token_embedding() {
        let config = tiny_config();
        let (model, _varmap) = tiny_model(&config);
        let device = Device::Cpu;

        let ids = Tensor::new(&[[3u32, 7, 11]], &device).unwrap();
        let cache = model.forward_hidden_states(&ids).unwrap();

        let single = Tensor::new(&[[11u32]], &device).unwrap();
        let expected = model.embed_tokens.forward(&single).unwrap().flatten_all().unwrap();
        let got: Vec<f32> = cache.get_layer(0).unwrap().to_vec1().unwrap();
        assert_eq!(got, expected.to_vec1::<f32>().unwrap());
    }

    #[test]
    #[serial]
    fn test_forward_is_deterministic() {
        let config = tiny_config();
        let (model, _varmap) = tiny_model(&config);

        let ids = Tensor::new(&[[1u32, 4, 9, 16, 25]], &Device::Cpu).unwrap();
        let a = model.forward_hidden_states(&ids).unwrap().to_embedding_matrix().unwrap();
        let b = model.forward_hidden_states(&ids).unwrap().to_embedding_matrix().unwrap();
        assert_eq!(a.to_vec2::<f32>().unwrap(), b.to_vec2::<f32>().unwrap());
    }

    #[test]
    fn test_rejects_sequences_past_position_limit() {
        let config = tiny_config();
        let (model, _varmap) = tiny_model(&config);

        let ids = Tensor::zeros((1, 13), DType::U32, &Device::Cpu).unwrap();
        assert!(model.forward_hidden_states(&ids).is_err());
    }
}

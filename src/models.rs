//! Model allow-list and architecture detection

use std::io::Write;

use crate::error::TrajError;

/// Models the extractor accepts, in display order
pub const AVAILABLE_MODELS: [&str; 4] = [
    "mistralai/Mistral-7B-v0.1",
    "meta-llama/Llama-2-7b-hf",
    "meta-llama/Llama-3.2-1B",
    "meta-llama/Llama-3.2-3B",
];

/// Supported model architectures
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModelArchitecture {
    /// LLaMA 2 / LLaMA 3.x (Meta)
    Llama,
    /// Mistral (sliding-window attention on a LLaMA layout)
    Mistral,
}

impl ModelArchitecture {
    /// Detect architecture from model ID
    pub fn from_model_id(model_id: &str) -> Self {
        let model_lower = model_id.to_lowercase();
        if model_lower.contains("mistral") {
            ModelArchitecture::Mistral
        } else {
            ModelArchitecture::Llama
        }
    }
}

/// Check a model identifier against the allow-list
pub fn validate_model(model_id: &str) -> Result<(), TrajError> {
    if AVAILABLE_MODELS.contains(&model_id) {
        Ok(())
    } else {
        Err(TrajError::UnknownModel(model_id.to_string()))
    }
}

/// Last path segment of a model identifier ("meta-llama/Llama-3.2-1B" -> "Llama-3.2-1B")
pub fn model_short_name(model_id: &str) -> &str {
    model_id.rsplit('/').next().unwrap_or(model_id)
}

/// Print the allow-list
pub fn list_models<W: Write>(out: &mut W) -> std::io::Result<()> {
    writeln!(out, "Available models:")?;
    for model_id in AVAILABLE_MODELS {
        writeln!(out, "- {model_id}")?;
    }
    Ok(())
}

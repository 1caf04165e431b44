// Pedantic clippy configuration for ML/math codebase
// These are acceptable in numerical/ML code:
#![allow(clippy::cast_precision_loss)] // usize→f64/f32 intentional in ML
#![allow(clippy::cast_possible_truncation)] // usize→u32 in tensor indexing
#![allow(clippy::cast_possible_wrap)] // usize→i64 in tensor ops
#![allow(clippy::module_name_repetitions)] // TrajModel in model.rs is fine
// Documentation pedantic - acceptable for research code:
#![allow(clippy::doc_markdown)] // backticks for every technical term is excessive
#![allow(clippy::missing_errors_doc)] // # Errors section for every Result fn
#![allow(clippy::missing_panics_doc)] // # Panics section for every panic
// Method style pedantic:
#![allow(clippy::must_use_candidate)] // #[must_use] on every pure fn is excessive
#![allow(clippy::needless_pass_by_value)] // value params for API flexibility
#![allow(clippy::cast_sign_loss)] // i32→usize when value is known positive

//! traj-rs: hidden-state trajectories of causal language models
//!
//! Splits a tokenized corpus into fixed-size pseudo-sentences and records,
//! for each one, the last-token activation of every layer of a pretrained
//! model. Also converts `.npy` arrays to MATLAB `.mat` files.
//!
//! ## Architecture
//!
//! - `models`: Model allow-list, architecture detection, short names
//! - `model`: High-level TrajModel wrapper (tokenizer + backend)
//! - `forward_llama`: LLaMA / Mistral forward pass with hidden-state capture
//! - `cache`: HiddenStateCache for last-token activations
//! - `masks`: Cached causal masks (optional sliding window)
//! - `corpus`: Text corpus loading and pseudo-sentence chunking
//! - `trajectory`: Extraction runner with partial and final saves
//! - `npy`: `.npy` header parsing and loading into named arrays
//! - `mat`: MATLAB Level 5 MAT-file writer and reader
//! - `convert`: `.npy` to `.mat` conversion
//! - `cli`: Single-dash long-flag compatibility
//! - `error`: Error taxonomy

pub mod cache;
pub mod cli;
pub mod convert;
pub mod corpus;
pub mod error;
pub mod forward_llama;
pub mod mat;
pub mod masks;
pub mod model;
pub mod models;
pub mod npy;
pub mod trajectory;

pub use cache::HiddenStateCache;
pub use convert::{convert_npy_to_mat, mat_output_path, run_conversion};
pub use corpus::{limit_chunks, split_into_chunks, TextCorpus, DEFAULT_CORPUS_PATH};
pub use error::TrajError;
pub use forward_llama::{LlamaConfig, TrajLlama};
pub use mat::{read_variables, write_mat, MatClass, MatVariable};
pub use masks::{clear_mask_caches, create_causal_mask};
pub use model::{TrajBackend, TrajModel};
pub use models::{
    list_models, model_short_name, validate_model, ModelArchitecture, AVAILABLE_MODELS,
};
pub use npy::{NamedArray, NpyDType};
pub use trajectory::{
    output_file_name, EmbeddingSource, ExtractorConfig, Reporter, TrajectoryExtractor,
    TrajectoryRun, Verbosity, PARTIAL_SAVE_INTERVAL,
};

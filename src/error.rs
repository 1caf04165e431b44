//! Error taxonomy for configuration and array conversion failures
//!
//! Runtime failures inside the extraction loop (tokenization, inference,
//! stacking) are not listed here: they travel as `anyhow::Error` and end the
//! process.

use std::path::PathBuf;

use thiserror::Error;

/// Typed errors surfaced to the CLIs
#[derive(Debug, Error)]
pub enum TrajError {
    /// Model identifier outside the allow-list
    #[error(
        "Model '{0}' is not in the list of available models. Use -list_models to see all options."
    )]
    UnknownModel(String),

    /// Chunk size of zero
    #[error("Chunk size must be a positive number of tokens")]
    InvalidChunkSize,

    /// The input array could not be read
    #[error("{source:#}")]
    Load {
        /// File that failed to load
        path: PathBuf,
        /// Underlying cause
        #[source]
        source: anyhow::Error,
    },

    /// The output container could not be written
    #[error("{source:#}")]
    Save {
        /// File that failed to save
        path: PathBuf,
        /// Underlying cause
        #[source]
        source: anyhow::Error,
    },

    /// Encoded array does not fit a 32-bit MAT element
    #[error("Array payload of {bytes} bytes exceeds the MAT-file element size limit")]
    ArrayTooLarge {
        /// Encoded payload size
        bytes: u64,
    },

    /// Dimension length that does not fit the signed 32-bit MAT field
    #[error("Dimension of length {dim} exceeds the MAT-file dimension limit")]
    DimensionTooLarge {
        /// Offending dimension length
        dim: usize,
    },

    /// MAT input the reader does not understand
    #[error("Unsupported MAT-file: {0}")]
    UnsupportedMat(String),

    /// Corpus produced no tokens
    #[error("Corpus {0} produced no tokens, nothing to extract")]
    EmptyCorpus(PathBuf),
}

impl TrajError {
    /// Path attached to a load or save failure
    pub fn path(&self) -> Option<&std::path::Path> {
        match self {
            TrajError::Load { path, .. } | TrajError::Save { path, .. } => Some(path),
            TrajError::EmptyCorpus(path) => Some(path),
            _ => None,
        }
    }
}

//! Text corpus loading and pseudo-sentence chunking

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};

/// Corpus read when no other path is given
pub const DEFAULT_CORPUS_PATH: &str = "../../txt/walden-thoreau-pg-clean.txt";

/// A single long text, newlines collapsed to spaces
#[derive(Debug, Clone)]
pub struct TextCorpus {
    path: PathBuf,
    text: String,
}

impl TextCorpus {
    /// Load corpus from a UTF-8 text file
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read corpus {}", path.display()))?;
        Ok(Self::from_text(path, &content))
    }

    /// Build a corpus from text already in memory
    pub fn from_text(path: impl Into<PathBuf>, content: &str) -> Self {
        Self {
            path: path.into(),
            text: content.replace('\n', " "),
        }
    }

    /// Cleaned text
    pub fn text(&self) -> &str {
        &self.text
    }

    /// Where the corpus came from
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Length in bytes of the cleaned text
    pub fn len(&self) -> usize {
        self.text.len()
    }

    /// Check if corpus is empty
    pub fn is_empty(&self) -> bool {
        self.text.is_empty()
    }
}

/// Split tokens into consecutive chunks of `chunksize`; the last may be shorter.
///
/// `chunksize` must be at least 1.
pub fn split_into_chunks(tokens: &[u32], chunksize: usize) -> Vec<&[u32]> {
    tokens.chunks(chunksize).collect()
}

/// Keep only the first `max` chunks when a limit is given
pub fn limit_chunks<'a>(mut chunks: Vec<&'a [u32]>, max: Option<usize>) -> Vec<&'a [u32]> {
    if let Some(max) = max {
        chunks.truncate(max);
    }
    chunks
}

/// Cut a chunk down to the model's position limit, keeping its start
pub fn truncate_to_positions(chunk: &[u32], max_positions: usize) -> &[u32] {
    &chunk[..chunk.len().min(max_positions)]
}

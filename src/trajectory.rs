//! Trajectory extraction runner
//!
//! Coordinates corpus loading, chunking, per-chunk hidden-state capture and
//! the partial/final `.npy` saves.

use std::io::Write;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use candle_core::Tensor;
use tracing::{debug, info};

use crate::corpus::{limit_chunks, split_into_chunks, truncate_to_positions, TextCorpus};
use crate::corpus::DEFAULT_CORPUS_PATH;
use crate::error::TrajError;
use crate::models::{model_short_name, validate_model};

/// Partial results are written every this many chunks
pub const PARTIAL_SAVE_INTERVAL: usize = 10;

/// Anything that can turn a chunk of tokens into a `(hidden, n_states)` matrix
pub trait EmbeddingSource {
    /// Hidden size of the model
    fn hidden_size(&self) -> usize;
    /// Number of hidden states per forward pass (decoder depth + 1)
    fn n_hidden_states(&self) -> usize;
    /// Longest chunk the model accepts
    fn max_positions(&self) -> usize;
    /// Tokenize the whole corpus
    fn encode(&self, text: &str) -> Result<Vec<u32>>;
    /// Decode a chunk back to text
    fn decode(&self, ids: &[u32]) -> Result<String>;
    /// Last-token state of every hidden state, shape `(hidden, n_states)`, F32
    fn last_token_embeddings(&self, chunk: &[u32]) -> Result<Tensor>;
}

/// How much the extractor reports while it runs
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default)]
pub enum Verbosity {
    /// Nothing
    Silent,
    /// Summary lines and a progress counter
    #[default]
    Minimal,
    /// Every pseudo-sentence's text and progress
    Detailed,
}

impl TryFrom<u8> for Verbosity {
    type Error = anyhow::Error;

    fn try_from(level: u8) -> Result<Self> {
        match level {
            0 => Ok(Verbosity::Silent),
            1 => Ok(Verbosity::Minimal),
            2 => Ok(Verbosity::Detailed),
            other => anyhow::bail!("Verbosity must be 0, 1 or 2, got {other}"),
        }
    }
}

/// Configuration for one extraction run
#[derive(Debug, Clone)]
pub struct ExtractorConfig {
    /// Tokens per pseudo-sentence
    pub chunksize: usize,
    /// Model identifier from the allow-list
    pub model: String,
    /// Write the partial file every `PARTIAL_SAVE_INTERVAL` chunks
    pub save_partial: bool,
    pub verbosity: Verbosity,
    /// Process at most this many chunks
    pub max_trajectories: Option<usize>,
    pub corpus_path: PathBuf,
    /// Directory receiving the `.npy` outputs
    pub output_dir: PathBuf,
    /// Skip CUDA even when available
    pub force_cpu: bool,
    /// Run the forward pass in BF16 on CUDA instead of F32
    pub bf16: bool,
}

impl Default for ExtractorConfig {
    fn default() -> Self {
        Self {
            chunksize: 50,
            model: "meta-llama/Llama-2-7b-hf".to_string(),
            save_partial: false,
            verbosity: Verbosity::Minimal,
            max_trajectories: None,
            corpus_path: PathBuf::from(DEFAULT_CORPUS_PATH),
            output_dir: PathBuf::from("."),
            force_cpu: false,
            bf16: false,
        }
    }
}

impl ExtractorConfig {
    /// Reject configurations that cannot run, before touching any file
    pub fn validate(&self) -> Result<(), TrajError> {
        validate_model(&self.model)?;
        if self.chunksize == 0 {
            return Err(TrajError::InvalidChunkSize);
        }
        Ok(())
    }

    /// Path of the final (or partial) result file
    pub fn output_path(&self, partial: bool) -> PathBuf {
        self.output_dir
            .join(output_file_name(&self.model, self.chunksize, partial))
    }
}

/// `final_embeddings_<short>_chunk<n>[_partial].npy`
pub fn output_file_name(model_id: &str, chunksize: usize, partial: bool) -> String {
    let suffix = if partial { "_partial" } else { "" };
    format!(
        "final_embeddings_{}_chunk{chunksize}{suffix}.npy",
        model_short_name(model_id)
    )
}

/// Stack per-chunk `(hidden, n_states)` matrices into `(hidden, n_states, n_chunks)`
pub fn stack_trajectories(matrices: &[Tensor]) -> Result<Tensor> {
    anyhow::ensure!(!matrices.is_empty(), "No embeddings to stack");
    Ok(Tensor::stack(matrices, 2)?)
}

/// User-facing report lines and the progress counter
///
/// Report lines go to `out`; the verbosity-1 counter goes to `progress`.
pub struct Reporter<'a> {
    verbosity: Verbosity,
    out: &'a mut dyn Write,
    progress: &'a mut dyn Write,
}

impl<'a> Reporter<'a> {
    pub fn new(verbosity: Verbosity, out: &'a mut dyn Write, progress: &'a mut dyn Write) -> Self {
        Self {
            verbosity,
            out,
            progress,
        }
    }

    pub fn verbosity(&self) -> Verbosity {
        self.verbosity
    }

    /// Line shown at verbosity 1 and 2
    fn summary(&mut self, line: &str) -> Result<()> {
        if self.verbosity > Verbosity::Silent {
            writeln!(self.out, "{line}")?;
        }
        Ok(())
    }

    /// Line shown at verbosity 2 only
    fn detail(&mut self, line: &str) -> Result<()> {
        if self.verbosity == Verbosity::Detailed {
            writeln!(self.out, "{line}")?;
        }
        Ok(())
    }

    fn tick(&mut self, done: usize, total: usize) -> Result<()> {
        if self.verbosity == Verbosity::Minimal {
            write!(self.progress, "\r  [{done}/{total}]")?;
            self.progress.flush()?;
        }
        Ok(())
    }

    fn finish_progress(&mut self) -> Result<()> {
        if self.verbosity == Verbosity::Minimal {
            writeln!(self.progress)?;
        }
        Ok(())
    }
}

/// Outcome of a completed run
#[derive(Debug, Clone)]
pub struct TrajectoryRun {
    /// Where the final tensor was written
    pub final_path: PathBuf,
    /// Last partial file written, if any
    pub partial_path: Option<PathBuf>,
    /// Chunks processed
    pub num_chunks: usize,
    /// `(hidden, n_states, num_chunks)`
    pub shape: Vec<usize>,
}

/// Main extraction runner
pub struct TrajectoryExtractor {
    config: ExtractorConfig,
}

impl TrajectoryExtractor {
    /// Create a runner; fails on an invalid configuration
    pub fn new(config: ExtractorConfig) -> Result<Self, TrajError> {
        config.validate()?;
        Ok(Self { config })
    }

    pub fn config(&self) -> &ExtractorConfig {
        &self.config
    }

    /// Read and tokenize the configured corpus, then extract
    pub fn run<S: EmbeddingSource>(
        &self,
        source: &S,
        reporter: &mut Reporter<'_>,
    ) -> Result<TrajectoryRun> {
        let corpus = TextCorpus::load(&self.config.corpus_path)?;
        info!("Loaded corpus: {} bytes", corpus.len());
        let tokens = source.encode(corpus.text())?;
        info!("Tokenized corpus: {} tokens", tokens.len());
        if tokens.is_empty() {
            return Err(TrajError::EmptyCorpus(corpus.path().to_path_buf()).into());
        }
        self.run_tokens(source, &tokens, reporter)
    }

    /// Extract trajectories from an already tokenized corpus
    pub fn run_tokens<S: EmbeddingSource>(
        &self,
        source: &S,
        tokens: &[u32],
        reporter: &mut Reporter<'_>,
    ) -> Result<TrajectoryRun> {
        let chunks = split_into_chunks(tokens, self.config.chunksize);
        reporter.summary(&format!(
            "Total number of pseudo-sentences (chunks): {}",
            chunks.len()
        ))?;

        let chunks = limit_chunks(chunks, self.config.max_trajectories);
        if self.config.max_trajectories.is_some() {
            reporter.summary(&format!(
                "Processing limited to the first {} pseudo-sentences.",
                chunks.len()
            ))?;
        }

        let total = chunks.len();
        anyhow::ensure!(total > 0, "No pseudo-sentences to process");

        let max_positions = source.max_positions();
        let mut all_embeddings: Vec<Tensor> = Vec::with_capacity(total);
        let mut partial_path = None;

        for (i, chunk) in chunks.iter().enumerate() {
            let done = i + 1;
            if reporter.verbosity() == Verbosity::Detailed {
                let pseudo_sentence = source.decode(chunk)?;
                reporter.detail(&format!("Processing pseudo-sentence {done}: {pseudo_sentence}"))?;
            }

            let chunk = truncate_to_positions(chunk, max_positions);
            let matrix = source
                .last_token_embeddings(chunk)
                .with_context(|| format!("Forward pass failed on pseudo-sentence {done}"))?;
            anyhow::ensure!(
                matrix.dims() == [source.hidden_size(), source.n_hidden_states()],
                "Pseudo-sentence {done} produced embeddings of shape {:?}, expected ({}, {})",
                matrix.dims(),
                source.hidden_size(),
                source.n_hidden_states()
            );
            debug!("Pseudo-sentence {done}: embeddings {:?}", matrix.dims());
            all_embeddings.push(matrix);

            reporter.detail(&format!("Processed sentence {done} / {total}"))?;
            reporter.tick(done, total)?;

            if self.config.save_partial && done.is_multiple_of(PARTIAL_SAVE_INTERVAL) {
                let path = self.config.output_path(true);
                self.save(&all_embeddings, &path)?;
                reporter.summary(&format!("Saved intermediate embeddings up to sentence {done}"))?;
                partial_path = Some(path);
            }
        }

        reporter.finish_progress()?;

        let final_path = self.config.output_path(false);
        let shape = self.save(&all_embeddings, &final_path)?;
        reporter.summary(&format!("All {total} pseudo-sentences processed and saved."))?;
        info!("Saved {:?} to {}", shape, final_path.display());

        Ok(TrajectoryRun {
            final_path,
            partial_path,
            num_chunks: total,
            shape,
        })
    }

    fn save(&self, embeddings: &[Tensor], path: &Path) -> Result<Vec<usize>> {
        let stacked = stack_trajectories(embeddings)?;
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create {}", parent.display()))?;
        }
        stacked
            .write_npy(path)
            .with_context(|| format!("Failed to write {}", path.display()))?;
        Ok(stacked.dims().to_vec())
    }
}

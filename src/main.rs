//! pull-traj: last-token hidden-state trajectories for pseudo-sentences

use anyhow::Result;
use clap::Parser;
use std::path::PathBuf;
use traj_rs::cli::{normalize_single_dash_flags, EXTRACTOR_FLAGS};
use traj_rs::{
    list_models, ExtractorConfig, Reporter, TrajModel, TrajectoryExtractor, Verbosity,
    DEFAULT_CORPUS_PATH,
};
use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;

#[derive(Parser)]
#[command(name = "pull-traj")]
#[command(about = "Extract embeddings for pseudo-sentences from LLMs")]
#[command(version)]
struct Cli {
    /// Size of each chunk (tokens per pseudo-sentence)
    #[arg(long = "chunksize", required_unless_present = "list_models",
          value_parser = clap::value_parser!(u64).range(1..))]
    chunksize: Option<u64>,

    /// Name of the model to use (see -list_models)
    #[arg(long = "model", required_unless_present = "list_models")]
    model: Option<String>,

    /// Save intermediate embeddings every 10 chunks
    #[arg(long = "save_partial")]
    save_partial: bool,

    /// List available models and exit
    #[arg(long = "list_models")]
    list_models: bool,

    /// Verbosity level: 0 (silent), 1 (progress counter), 2 (full details)
    #[arg(long = "verbose", default_value_t = 1,
          value_parser = clap::value_parser!(u8).range(0..=2))]
    verbose: u8,

    /// Maximum number of pseudo-sentences to process (default: all)
    #[arg(long = "maxtrajectories", value_parser = clap::value_parser!(u64).range(1..))]
    maxtrajectories: Option<u64>,

    /// Text corpus to read
    #[arg(long = "corpus", default_value = DEFAULT_CORPUS_PATH)]
    corpus: PathBuf,

    /// Directory for the .npy outputs
    #[arg(long = "output_dir", default_value = ".")]
    output_dir: PathBuf,

    /// Force CPU mode (slower but avoids CUDA issues); computes in F32
    #[arg(long = "cpu")]
    cpu: bool,

    /// On CUDA, run the forward pass in BF16 (faster, activations rounded to BF16)
    #[arg(long = "bf16")]
    bf16: bool,
}

/// What a parsed command line asks for
enum Action {
    ListModels,
    Extract(TrajectoryExtractor),
}

impl Cli {
    /// Resolve the command line; rejects unknown models before any file is touched
    fn into_action(self) -> Result<Action> {
        if self.list_models {
            return Ok(Action::ListModels);
        }

        let config = ExtractorConfig {
            chunksize: usize::try_from(self.chunksize.unwrap_or_default())?,
            model: self.model.unwrap_or_default(),
            save_partial: self.save_partial,
            verbosity: Verbosity::try_from(self.verbose)?,
            max_trajectories: self.maxtrajectories.map(usize::try_from).transpose()?,
            corpus_path: self.corpus,
            output_dir: self.output_dir,
            force_cpu: self.cpu,
            bf16: self.bf16,
        };
        Ok(Action::Extract(TrajectoryExtractor::new(config)?))
    }
}

fn main() -> Result<()> {
    let cli = Cli::parse_from(normalize_single_dash_flags(std::env::args_os(), &EXTRACTOR_FLAGS));

    let extractor = match cli.into_action()? {
        Action::ListModels => {
            list_models(&mut std::io::stdout().lock())?;
            return Ok(());
        }
        Action::Extract(extractor) => extractor,
    };
    let config = extractor.config();
    let verbosity = config.verbosity;

    // Initialize logging
    let level = match verbosity {
        Verbosity::Silent => Level::WARN,
        Verbosity::Minimal => Level::INFO,
        Verbosity::Detailed => Level::DEBUG,
    };
    let subscriber = FmtSubscriber::builder()
        .with_max_level(level)
        .with_target(false)
        .with_writer(std::io::stderr)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    info!("Loading model...");
    let model =
        TrajModel::from_pretrained_with_options(&config.model, config.force_cpu, config.bf16)?;
    info!(
        "Model: {} layers, {} hidden",
        model.n_layers(),
        model.d_model()
    );

    let mut stdout = std::io::stdout().lock();
    let mut stderr = std::io::stderr();
    let mut reporter = Reporter::new(verbosity, &mut stdout, &mut stderr);
    let run = extractor.run(&model, &mut reporter)?;

    info!(
        "Trajectory tensor {:?} written to {}",
        run.shape,
        run.final_path.display()
    );

    Ok(())
}

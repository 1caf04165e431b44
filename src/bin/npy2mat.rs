//! npy2mat: convert a .npy array into a single-variable .mat file
//!
//! Usage:
//!   npy2mat <npy_file> [output_dir]
//!   npy2mat example.npy output      (writes output/example.mat)

use anyhow::Result;
use clap::Parser;
use std::ffi::OsString;
use std::io::Write;
use std::path::PathBuf;
use std::process::ExitCode;
use traj_rs::run_conversion;
use tracing::{debug, Level};
use tracing_subscriber::FmtSubscriber;

#[derive(Parser)]
#[command(name = "npy2mat")]
#[command(about = "Convert a .npy file to a .mat file")]
#[command(version)]
struct Args {
    /// Path to the .npy file
    npy_file: Option<PathBuf>,

    /// Directory to save the .mat file (created if missing)
    output_dir: Option<PathBuf>,

    /// Anything after the output directory is ignored
    #[arg(hide = true, trailing_var_arg = true)]
    ignored: Vec<OsString>,

    /// Verbose output
    #[arg(short, long)]
    verbose: bool,
}

/// Check the arguments, convert, and return the process exit status
fn run<W: Write>(args: &Args, out: &mut W) -> std::io::Result<u8> {
    let Some(npy_file) = args.npy_file.as_deref() else {
        writeln!(out, "Usage: npy2mat <npy_file> [output_dir]")?;
        return Ok(1);
    };

    if !npy_file.is_file() {
        writeln!(
            out,
            "Error: {} does not exist or is not a file.",
            npy_file.display()
        )?;
        return Ok(1);
    }

    if !args.ignored.is_empty() {
        debug!("Ignoring extra arguments: {:?}", args.ignored);
    }

    // Conversion failures are reported on `out`; the exit status stays 0
    run_conversion(npy_file, args.output_dir.as_deref(), out)?;
    Ok(0)
}

fn main() -> Result<ExitCode> {
    let args = Args::parse();

    let level = if args.verbose { Level::DEBUG } else { Level::WARN };
    let subscriber = FmtSubscriber::builder()
        .with_max_level(level)
        .with_target(false)
        .with_writer(std::io::stderr)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    let status = run(&args, &mut std::io::stdout().lock())?;
    Ok(ExitCode::from(status))
}

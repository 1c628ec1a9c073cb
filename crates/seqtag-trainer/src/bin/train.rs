//! Train a sequence tagger from a TOML or JSON experiment configuration.

use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;
use seqtag_trainer::{RunOptions, run_training};
use tracing::{Level, error};

#[derive(Parser)]
#[command(name = "train")]
#[command(about = "Train a BIOUL CRF sequence tagger")]
#[command(version)]
struct Cli {
    /// Experiment configuration (.toml or .json)
    #[arg(short, long)]
    config: PathBuf,

    /// Checkpoint directory to resume from
    #[arg(short, long)]
    resume: Option<PathBuf>,

    /// Device override: cpu or gpu
    #[arg(short, long)]
    device: Option<String>,

    /// Log at debug level
    #[arg(short, long)]
    verbose: bool,
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    tracing_subscriber::fmt()
        .with_max_level(if cli.verbose { Level::DEBUG } else { Level::INFO })
        .init();

    let options = RunOptions {
        config: cli.config,
        resume: cli.resume,
        device: cli.device,
    };
    match run_training(&options) {
        Ok(_) => ExitCode::SUCCESS,
        Err(err) => {
            error!("{err:#}");
            eprintln!("Training failed: {err:#}");
            ExitCode::FAILURE
        }
    }
}

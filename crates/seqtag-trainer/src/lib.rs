//! # Seqtag Trainer
//!
//! Trains the taggers assembled by `seqtag-core` on CoNLL column data:
//! dataset loading and batching, optimizers with global-norm gradient
//! clipping, learning-rate schedules, the epoch loop with validation and
//! best-model tracking, verified checkpoints and an inference client over a
//! saved checkpoint.

pub mod checkpoint;
pub mod clip;
pub mod context;
pub mod dataset;
pub mod engine;
pub mod inference;
pub mod meter;
pub mod optimizer;
pub mod scheduler;

use std::path::PathBuf;

use anyhow::Context;
use seqtag_core::Config;
use tracing::info;

pub use checkpoint::{CheckpointManifest, CheckpointStore, CheckpointTag, LoadedCheckpoint};
pub use context::{TrainingContext, resolve_device};
pub use dataset::{CoNLLDatasetManager, Split, TaggedSentence, load_conll};
pub use engine::{Engine, EpochResult, TrainingSummary};
pub use inference::{EvaluatedSentence, Prediction, SequenceTaggerInference, SplitEvaluation};
pub use meter::LossMeter;
pub use optimizer::{Optimizer, build_optimizer};
pub use scheduler::{LrScheduler, build_scheduler};

/// Inputs of a training run beyond the configuration file itself.
#[derive(Debug, Clone, Default)]
pub struct RunOptions {
    pub config: PathBuf,
    /// Checkpoint directory to continue from.
    pub resume: Option<PathBuf>,
    /// Overrides `engine.device`.
    pub device: Option<String>,
}

/// Load the configuration, build the engine and train to completion.
pub fn run_training(options: &RunOptions) -> anyhow::Result<TrainingSummary> {
    let mut config = Config::from_path(&options.config)
        .with_context(|| format!("failed to load configuration {}", options.config.display()))?;
    if let Some(device) = &options.device {
        config.engine.device = device.clone();
    }

    let mut engine = Engine::new(config).context("failed to initialise the training engine")?;
    if let Some(dir) = &options.resume {
        engine
            .resume(dir)
            .with_context(|| format!("failed to resume from {}", dir.display()))?;
    }

    let summary = engine.run().context("training aborted")?;
    info!(
        experiment = %summary.experiment,
        epochs = summary.epochs_completed,
        steps = summary.optimizer_step,
        skipped = summary.skipped_batches,
        best = ?summary.best_score,
        latest = %summary.latest_checkpoint.display(),
        "training finished"
    );
    Ok(summary)
}

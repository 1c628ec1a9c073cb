//! # Training Engine
//!
//! Drives the epoch loop: per training batch it runs the forward pass,
//! backpropagates the CRF loss, clips the global gradient norm and steps
//! the optimizer, then logs running metrics and writes checkpoints at the
//! configured intervals. Every training epoch is followed by a validation
//! pass used for best-model tracking; a test pass closes the run.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use candle_core::DType;
use candle_nn::{VarBuilder, VarMap};
use seqtag_core::config::{Config, NonFinitePolicy, SaveUnit};
use seqtag_core::{
    AssemblyContext, Batch, ConfigError, ForwardMode, Metric, MetricReport, ModelAssembler,
    Result, SeqTagError, Tagger, TaggerOutput, build_metric,
};
use sha2::{Digest, Sha256};
use tracing::{debug, info, info_span, warn};

use crate::checkpoint::{CheckpointState, CheckpointStore, CheckpointTag, fingerprint_config};
use crate::clip::clip_grad_norm;
use crate::context::{TrainingContext, resolve_device};
use crate::dataset::{CoNLLDatasetManager, Split};
use crate::meter::LossMeter;
use crate::optimizer::{Optimizer, build_optimizer, trainable_vars};
use crate::scheduler::{LrScheduler, build_scheduler};

const LOSS_KEY: &str = "loss";

/// Average loss and metric values of one pass over a split.
#[derive(Debug, Clone, Default)]
pub struct EpochResult {
    pub loss: Option<f64>,
    pub metrics: MetricReport,
    pub batches: usize,
}

/// What a finished run reports back.
#[derive(Debug, Clone)]
pub struct TrainingSummary {
    pub experiment: String,
    pub epochs_completed: usize,
    pub global_step: usize,
    pub optimizer_step: usize,
    pub skipped_batches: usize,
    pub train_loss: Option<f64>,
    pub best_score: Option<f64>,
    pub test: EpochResult,
    pub latest_checkpoint: PathBuf,
}

pub struct Engine {
    config: Config,
    experiment: String,
    ctx: TrainingContext,
    data: CoNLLDatasetManager,
    varmap: VarMap,
    model: Box<dyn Tagger>,
    optimizer: Box<dyn Optimizer>,
    scheduler: Option<Box<dyn LrScheduler>>,
    metric: Box<dyn Metric>,
    store: CheckpointStore,
    best_score: Option<f64>,
    train_loss: Option<f64>,
    skipped_batches: usize,
}

impl Engine {
    /// Read the dataset named by the configuration and build the engine.
    pub fn new(config: Config) -> Result<Self> {
        config.validate()?;
        let data = CoNLLDatasetManager::from_config(&config)?;
        Self::with_dataset(config, data)
    }

    /// Build the model, optimizer, metric and checkpoint store around an
    /// already-loaded dataset. Device placement is fixed here for the run.
    pub fn with_dataset(config: Config, data: CoNLLDatasetManager) -> Result<Self> {
        config.validate()?;
        let device = resolve_device(&config.engine.device)?;
        let ctx = TrainingContext::new(device, config.engine.seed)?;

        let varmap = VarMap::new();
        let model = {
            let vb = VarBuilder::from_varmap(&varmap, DType::F32, ctx.device());
            let assembly = AssemblyContext::new(data.vocab(), data.labels(), vb);
            ModelAssembler::default().assemble(&config.model, &assembly)?
        };

        let frozen = model.frozen_prefixes();
        let trainable = trainable_vars(&varmap, &frozen)?;
        let optimizer = build_optimizer(&config.engine.optimizer, trainable)?;
        let metric = build_metric(&config.engine.metric, data.labels())?;

        let track = config.engine.track_for_best.as_str();
        if track != LOSS_KEY && !metric.compute().contains_key(track) {
            return Err(ConfigError::invalid(
                "engine.track_for_best",
                format!("`{track}` is neither `loss` nor reported by {}", metric.name()),
            )
            .into());
        }
        let scheduler = config
            .engine
            .lr_scheduler
            .as_ref()
            .map(|node| build_scheduler(node, track == LOSS_KEY))
            .transpose()?;

        let fingerprint = fingerprint_config(&config)?;
        let experiment = match config.experiment_name() {
            Some(name) => name.to_string(),
            None => generated_name(&fingerprint),
        };
        let store = CheckpointStore::new(
            &config.engine.save_dir,
            config.engine.checkpoint_retries,
            fingerprint,
        );

        let total_params: usize = trainable_vars(&varmap, &[])?
            .iter()
            .map(|(_, var)| var.as_tensor().elem_count())
            .sum();
        info!(
            experiment = %experiment,
            model = %config.model.class,
            labels = data.labels().len(),
            parameters = total_params,
            trainable_tensors = optimizer.parameters().len(),
            frozen = ?frozen,
            optimizer = optimizer.name(),
            scheduler = scheduler.as_ref().map(|s| s.name()),
            "engine ready"
        );

        Ok(Self {
            config,
            experiment,
            ctx,
            data,
            varmap,
            model,
            optimizer,
            scheduler,
            metric,
            store,
            best_score: None,
            train_loss: None,
            skipped_batches: 0,
        })
    }

    pub fn experiment_name(&self) -> &str {
        &self.experiment
    }

    pub fn context(&self) -> &TrainingContext {
        &self.ctx
    }

    pub fn model(&self) -> &dyn Tagger {
        self.model.as_ref()
    }

    pub fn varmap(&self) -> &VarMap {
        &self.varmap
    }

    pub fn dataset(&self) -> &CoNLLDatasetManager {
        &self.data
    }

    pub fn store(&self) -> &CheckpointStore {
        &self.store
    }

    pub fn best_score(&self) -> Option<f64> {
        self.best_score
    }

    pub fn skipped_batches(&self) -> usize {
        self.skipped_batches
    }

    pub fn learning_rate(&self) -> f64 {
        self.optimizer.learning_rate()
    }

    /// Restore parameters, optimizer moments and counters from `dir`; the
    /// next [`Engine::run`] continues with the following epoch.
    pub fn resume(&mut self, dir: impl AsRef<Path>) -> Result<()> {
        let dir = dir.as_ref();
        let loaded = CheckpointStore::load(dir, self.ctx.device())?;
        if &loaded.vocab != self.data.vocab() {
            return Err(SeqTagError::checkpoint(
                dir,
                "vocabulary differs from the one built from the training split",
            ));
        }
        let current = fingerprint_config(&self.config)?;
        if loaded.manifest.config_sha256 != current {
            warn!(
                path = %dir.display(),
                "resuming with a configuration that differs from the checkpoint's"
            );
        }

        loaded.apply_to(&mut self.varmap)?;
        let manifest = loaded.manifest;
        self.optimizer
            .load_state(loaded.optimizer_state, manifest.optimizer_step)?;
        self.ctx
            .restore(manifest.epoch, manifest.global_step, manifest.optimizer_step);
        self.best_score = manifest.best_score;
        self.train_loss = manifest.loss;
        if let Some(lr) = manifest.learning_rate {
            self.optimizer.set_learning_rate(lr);
        }
        if let Some(scheduler) = &mut self.scheduler {
            scheduler.restore(manifest.epoch);
        }

        info!(
            path = %dir.display(),
            epoch = manifest.epoch,
            step = manifest.global_step,
            "resumed from checkpoint"
        );
        Ok(())
    }

    /// Train until `engine.num_epochs` epochs are complete, write the
    /// `latest` checkpoint and evaluate on the test split.
    pub fn run(&mut self) -> Result<TrainingSummary> {
        let span = info_span!("experiment", name = %self.experiment);
        let _guard = span.enter();
        self.write_experiment_record()?;

        let num_epochs = self.config.engine.num_epochs;
        if self.ctx.epoch >= num_epochs {
            info!(epoch = self.ctx.epoch, num_epochs, "no epochs left to train");
        }

        while self.ctx.epoch < num_epochs {
            let epoch = self.ctx.epoch + 1;
            let train = self.train_epoch(epoch)?;
            let validation = self.evaluate(Split::Dev)?;

            self.ctx.epoch = epoch;
            self.train_loss = train.loss;
            info!(
                epoch,
                num_epochs,
                train_loss = ?train.loss,
                train_metrics = %format_report(&train.metrics),
                "training epoch complete"
            );
            if validation.batches > 0 {
                info!(
                    epoch,
                    validation_loss = ?validation.loss,
                    validation_metrics = %format_report(&validation.metrics),
                    "validation epoch complete"
                );
            }

            self.update_best(&validation)?;
            self.adjust_learning_rate(epoch, &validation);

            let engine = &self.config.engine;
            if engine.save_every_unit == SaveUnit::Epoch && epoch % engine.save_every == 0 {
                self.save(CheckpointTag::Epoch(epoch))?;
            }
        }

        let latest_checkpoint = self.save(CheckpointTag::Latest)?;
        let test = self.test_epoch()?;

        Ok(TrainingSummary {
            experiment: self.experiment.clone(),
            epochs_completed: self.ctx.epoch,
            global_step: self.ctx.global_step,
            optimizer_step: self.ctx.optimizer_step,
            skipped_batches: self.skipped_batches,
            train_loss: self.train_loss,
            best_score: self.best_score,
            test,
            latest_checkpoint,
        })
    }

    fn train_epoch(&mut self, epoch: usize) -> Result<EpochResult> {
        let shuffle = self.config.engine.shuffle;
        let batches = self.data.batches(Split::Train, &mut self.ctx, shuffle)?;
        let log_every = self.config.engine.log_train_metrics_every;
        let save_every = self.config.engine.save_every;
        let save_steps = self.config.engine.save_every_unit == SaveUnit::Step;

        let mut meter = LossMeter::new();
        self.metric.reset();

        for batch in &batches {
            self.ctx.global_step += 1;
            let Some((loss, output)) = self.train_step(batch)? else {
                continue;
            };
            meter.add(loss, batch.batch_size());
            if let Some(gold) = batch.gold()? {
                self.metric
                    .update(&output.predictions, &gold, &batch.mask_rows())?;
            }

            let step = self.ctx.optimizer_step;
            if step % log_every == 0 {
                info!(
                    epoch,
                    step,
                    loss = ?meter.average(),
                    metrics = %format_report(&self.metric.compute()),
                    "train"
                );
            }
            if save_steps && step % save_every == 0 {
                self.save(CheckpointTag::Step(step))?;
            }
        }

        Ok(EpochResult {
            loss: meter.average(),
            metrics: self.metric.compute(),
            batches: batches.len(),
        })
    }

    /// Forward, backward, clip and step on one batch. `None` when the batch
    /// was skipped under the `skip` non-finite policy.
    fn train_step(&mut self, batch: &Batch) -> Result<Option<(f64, TaggerOutput)>> {
        let output = self.model.forward(batch, ForwardMode::Train)?;
        let loss = output
            .loss
            .as_ref()
            .ok_or_else(|| SeqTagError::shape("training forward pass produced no loss"))?;
        let value = f64::from(loss.to_scalar::<f32>()?);
        if !value.is_finite() {
            self.non_finite(format!("loss is {value} at step {}", self.ctx.global_step))?;
            return Ok(None);
        }

        let mut grads = loss.backward()?;
        let clip = self.config.engine.gradient_norm_clip_value;
        let norm = clip_grad_norm(&mut grads, self.optimizer.parameters(), clip)?;
        if !norm.is_finite() {
            self.non_finite(format!(
                "gradient norm is {norm} at step {}",
                self.ctx.global_step
            ))?;
            return Ok(None);
        }

        self.optimizer.step(&mut grads)?;
        self.ctx.optimizer_step += 1;
        debug!(step = self.ctx.optimizer_step, loss = value, grad_norm = norm, "optimizer step");
        Ok(Some((value, output)))
    }

    fn non_finite(&mut self, message: String) -> Result<()> {
        match self.config.engine.on_non_finite {
            NonFinitePolicy::Abort => Err(SeqTagError::NumericalInstability(message)),
            NonFinitePolicy::Skip => {
                self.skipped_batches += 1;
                warn!(reason = %message, skipped = self.skipped_batches, "skipping batch");
                Ok(())
            }
        }
    }

    /// Average loss and metrics over `split` without dropout or updates.
    pub fn evaluate(&mut self, split: Split) -> Result<EpochResult> {
        let batches = self.data.batches(split, &mut self.ctx, false)?;
        let mut meter = LossMeter::new();
        self.metric.reset();

        for batch in &batches {
            let output = self.model.forward(batch, ForwardMode::Eval)?;
            if let Some(loss) = &output.loss {
                let value = f64::from(loss.to_scalar::<f32>()?);
                if value.is_finite() {
                    meter.add(value, batch.batch_size());
                } else {
                    warn!(
                        split = split.as_str(),
                        loss = value,
                        "non-finite evaluation loss ignored"
                    );
                }
            }
            if let Some(gold) = batch.gold()? {
                self.metric
                    .update(&output.predictions, &gold, &batch.mask_rows())?;
            }
        }

        Ok(EpochResult {
            loss: meter.average(),
            metrics: self.metric.compute(),
            batches: batches.len(),
        })
    }

    /// The validation value named by `track_for_best`, if there is one.
    fn tracked_value(&self, validation: &EpochResult) -> Option<f64> {
        if validation.batches == 0 {
            return None;
        }
        let key = self.config.engine.track_for_best.as_str();
        if key == LOSS_KEY {
            validation.loss
        } else {
            validation.metrics.get(key).copied()
        }
    }

    fn update_best(&mut self, validation: &EpochResult) -> Result<()> {
        let key = self.config.engine.track_for_best.as_str();
        let lower_is_better = key == LOSS_KEY;
        let Some(score) = self.tracked_value(validation) else {
            debug!(key, "no validation score, best model unchanged");
            return Ok(());
        };

        let improved = match self.best_score {
            None => true,
            Some(best) if lower_is_better => score < best,
            Some(best) => score > best,
        };
        if improved {
            info!(key, score, previous = ?self.best_score, "new best model");
            self.best_score = Some(score);
            self.save(CheckpointTag::Best)?;
        }
        Ok(())
    }

    fn adjust_learning_rate(&mut self, epoch: usize, validation: &EpochResult) {
        let tracked = self.tracked_value(validation);
        let Some(scheduler) = &mut self.scheduler else {
            return;
        };
        let current = self.optimizer.learning_rate();
        let next = scheduler.step(current, tracked);
        if next != current {
            info!(epoch, from = current, to = next, "learning rate adjusted");
            self.optimizer.set_learning_rate(next);
        }
    }

    /// Evaluate on the test split, with the best parameters when a best
    /// model was recorded.
    fn test_epoch(&mut self) -> Result<EpochResult> {
        if self.data.sentences(Split::Test).is_empty() {
            return Ok(EpochResult::default());
        }
        let best = self.store.path(CheckpointTag::Best);
        if self.best_score.is_some() && best.is_dir() {
            CheckpointStore::load(&best, self.ctx.device())?.apply_to(&mut self.varmap)?;
            debug!(path = %best.display(), "loaded best model for testing");
        }
        let test = self.evaluate(Split::Test)?;
        info!(
            test_loss = ?test.loss,
            test_metrics = %format_report(&test.metrics),
            "test epoch complete"
        );
        Ok(test)
    }

    fn save(&self, tag: CheckpointTag) -> Result<PathBuf> {
        self.store.save(
            tag,
            &CheckpointState {
                varmap: &self.varmap,
                optimizer: self.optimizer.as_ref(),
                vocab: self.data.vocab(),
                epoch: self.ctx.epoch,
                global_step: self.ctx.global_step,
                optimizer_step: self.ctx.optimizer_step,
                loss: self.train_loss,
                best_score: self.best_score,
            },
        )
    }

    /// Store the resolved configuration under `exp_dir/<experiment>`.
    fn write_experiment_record(&self) -> Result<()> {
        let dir = self.config.experiment.exp_dir.join(&self.experiment);
        fs::create_dir_all(&dir)?;
        fs::write(dir.join("config.json"), serde_json::to_vec_pretty(&self.config)?)?;
        Ok(())
    }
}

/// Short hash of the configuration fingerprint and the wall clock.
fn generated_name(fingerprint: &str) -> String {
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos())
        .unwrap_or_default();
    let digest = Sha256::digest(format!("{fingerprint}:{nanos}"));
    format!("exp_{}", &hex::encode(digest)[..8])
}

/// `key=value` pairs for log lines.
pub fn format_report(report: &MetricReport) -> String {
    report
        .iter()
        .map(|(key, value)| format!("{key}={value:.4}"))
        .collect::<Vec<_>>()
        .join(" ")
}

//! # Experiment Configuration
//!
//! The four top-level sections (`experiment`, `dataset`, `model`, `engine`)
//! of a training run. Files are TOML or JSON, chosen by extension.

pub mod component;

use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::error::{ConfigError, Result};
use crate::labels::{LabelSet, TaggingScheme};

pub use component::{ComponentConfig, Params};

/// A complete, validated experiment description.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub experiment: ExperimentConfig,
    pub dataset: DatasetConfig,
    pub model: ComponentConfig,
    pub engine: EngineConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExperimentConfig {
    #[serde(default)]
    pub exp_name: Option<String>,
    #[serde(default = "default_exp_dir")]
    pub exp_dir: PathBuf,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatasetConfig {
    pub class: String,
    pub train_filename: PathBuf,
    pub dev_filename: PathBuf,
    pub test_filename: PathBuf,
    /// Entity types; each contributes its scheme prefixes to the label set.
    pub column_names: Vec<String>,
    #[serde(default)]
    pub max_num_words: Option<usize>,
    #[serde(default = "default_min_count")]
    pub min_count: usize,
    /// Sentences longer than this many tokens are truncated.
    #[serde(default)]
    pub max_length: Option<usize>,
    /// Tokens longer than this many characters are truncated for the
    /// character embedder.
    #[serde(default)]
    pub max_char_length: Option<usize>,
}

/// When `save_every` fires.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum SaveUnit {
    #[default]
    Epoch,
    Step,
}

/// What to do with a batch whose loss or gradient is not finite.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum NonFinitePolicy {
    #[default]
    Abort,
    Skip,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    pub batch_size: usize,
    pub save_dir: PathBuf,
    pub num_epochs: usize,
    pub save_every: usize,
    #[serde(default)]
    pub save_every_unit: SaveUnit,
    /// Interval in optimizer steps.
    pub log_train_metrics_every: usize,
    #[serde(default = "default_device")]
    pub device: String,
    #[serde(default = "default_clip")]
    pub gradient_norm_clip_value: f64,
    pub metric: ComponentConfig,
    pub optimizer: ComponentConfig,
    /// Epoch-level learning-rate schedule; the rate stays fixed without one.
    #[serde(default)]
    pub lr_scheduler: Option<ComponentConfig>,
    #[serde(default)]
    pub on_non_finite: NonFinitePolicy,
    #[serde(default = "default_retries")]
    pub checkpoint_retries: usize,
    #[serde(default = "default_track")]
    pub track_for_best: String,
    #[serde(default = "default_seed")]
    pub seed: u64,
    #[serde(default = "default_shuffle")]
    pub shuffle: bool,
}

fn default_exp_dir() -> PathBuf {
    PathBuf::from("experiments")
}

fn default_min_count() -> usize {
    1
}

fn default_device() -> String {
    "cpu".to_string()
}

fn default_clip() -> f64 {
    5.0
}

fn default_retries() -> usize {
    3
}

fn default_track() -> String {
    "loss".to_string()
}

fn default_seed() -> u64 {
    1729
}

fn default_shuffle() -> bool {
    true
}

impl Config {
    pub fn from_path(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let contents = fs::read_to_string(path)?;
        let mut config = match path.extension().and_then(|ext| ext.to_str()) {
            Some("json") => Self::from_json_str(&contents)?,
            Some("toml") | None => Self::from_toml_str(&contents)?,
            Some(other) => {
                return Err(ConfigError::invalid(
                    "config",
                    format!("unsupported configuration extension `{other}`"),
                )
                .into());
            }
        };

        let base_dir = path.parent().unwrap_or_else(|| Path::new("."));
        config.apply_base_path(base_dir);
        config.validate()?;
        Ok(config)
    }

    pub fn from_toml_str(contents: &str) -> Result<Self> {
        Ok(toml::from_str(contents)?)
    }

    pub fn from_json_str(contents: &str) -> Result<Self> {
        Ok(serde_json::from_str(contents)?)
    }

    /// Resolve relative paths against the directory holding the config file.
    pub fn apply_base_path(&mut self, base: &Path) {
        for path in [
            &mut self.dataset.train_filename,
            &mut self.dataset.dev_filename,
            &mut self.dataset.test_filename,
            &mut self.engine.save_dir,
            &mut self.experiment.exp_dir,
        ] {
            if path.is_relative() {
                *path = base.join(&*path);
            }
        }
    }

    /// Check every range constraint, reporting the first offending field.
    pub fn validate(&self) -> std::result::Result<(), ConfigError> {
        let mut errors = Vec::new();
        let engine = &self.engine;

        if engine.batch_size == 0 {
            errors.push(ConfigError::invalid("engine.batch_size", "must be greater than 0"));
        }
        if engine.save_every == 0 {
            errors.push(ConfigError::invalid("engine.save_every", "must be greater than 0"));
        }
        if engine.log_train_metrics_every == 0 {
            errors.push(ConfigError::invalid(
                "engine.log_train_metrics_every",
                "must be greater than 0",
            ));
        }
        if !(engine.gradient_norm_clip_value > 0.0) {
            errors.push(ConfigError::invalid(
                "engine.gradient_norm_clip_value",
                "must be greater than 0",
            ));
        }
        if let Ok(Some(lr)) = engine.optimizer.at("engine.optimizer").optional::<f64>("lr") {
            if !(lr > 0.0) {
                errors.push(ConfigError::invalid("engine.optimizer.lr", "must be greater than 0"));
            }
        }
        for (field, limit) in [
            ("dataset.max_length", self.dataset.max_length),
            ("dataset.max_char_length", self.dataset.max_char_length),
        ] {
            if limit == Some(0) {
                errors.push(ConfigError::invalid(field, "must be greater than 0"));
            }
        }
        if self.dataset.column_names.is_empty() {
            errors.push(ConfigError::invalid(
                "dataset.column_names",
                "at least one entity type is required",
            ));
        }
        if let Err(err) = self.tagging_scheme() {
            errors.push(err);
        }
        if let Ok((encoder, path)) = self.model.at("model").component("rnn2seqencoder") {
            let params = encoder.at(path);
            if let Ok(Some(p)) = params.optional::<f64>("dropout_value") {
                if !(0.0..=1.0).contains(&p) {
                    errors.push(ConfigError::invalid(
                        params.field("dropout_value"),
                        "must lie in [0, 1]",
                    ));
                }
            }
            if let Ok(Some(0)) = params.optional::<usize>("num_layers") {
                errors.push(ConfigError::invalid(params.field("num_layers"), "must be at least 1"));
            }
        }

        for err in errors.iter().skip(1) {
            warn!(error = %err, "additional configuration problem");
        }
        match errors.into_iter().next() {
            Some(first) => Err(first),
            None => Ok(()),
        }
    }

    /// The tagging scheme declared by `model.tagging_type` (BIOUL if absent).
    pub fn tagging_scheme(&self) -> std::result::Result<TaggingScheme, ConfigError> {
        let raw: String = self.model.at("model").or("tagging_type", "BIOUL".to_string())?;
        raw.parse()
    }

    /// The label set derived from `dataset.column_names`.
    pub fn label_set(&self) -> Result<LabelSet> {
        LabelSet::new(self.tagging_scheme()?, &self.dataset.column_names)
    }

    pub fn experiment_name(&self) -> Option<&str> {
        self.experiment.exp_name.as_deref()
    }
}

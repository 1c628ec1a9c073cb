//! # Checkpoint Store
//!
//! A checkpoint is a directory holding `model.safetensors`,
//! `optimizer.safetensors` (omitted for stateless optimizers), `vocab.json`
//! and a `manifest.json` carrying counters and a sha256 per file. Every
//! checkpoint is written into a hidden sibling directory and renamed into
//! place once complete, so a crash never leaves a half-written checkpoint
//! under its final name.

use std::collections::HashMap;
use std::fs::{self, File};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use candle_core::{Device, Tensor};
use candle_nn::VarMap;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use seqtag_core::config::Config;
use seqtag_core::{Result, SeqTagError, Vocabularies};
use tracing::{debug, info, warn};

use crate::optimizer::Optimizer;

pub const CHECKPOINT_VERSION: u32 = 1;
pub const MODEL_FILENAME: &str = "model.safetensors";
pub const OPTIMIZER_FILENAME: &str = "optimizer.safetensors";
pub const VOCAB_FILENAME: &str = "vocab.json";
pub const MANIFEST_FILENAME: &str = "manifest.json";

/// Which checkpoint slot to write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CheckpointTag {
    Epoch(usize),
    Step(usize),
    Best,
    Latest,
}

impl CheckpointTag {
    pub fn dir_name(self) -> String {
        match self {
            Self::Epoch(epoch) => format!("epoch_{epoch:04}"),
            Self::Step(step) => format!("step_{step:08}"),
            Self::Best => "best_model".to_string(),
            Self::Latest => "latest".to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileRecord {
    pub filename: String,
    pub sha256: String,
    pub bytes: u64,
}

/// Counters and fingerprints stored beside the tensors.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckpointManifest {
    pub version: u32,
    pub created_unix_timestamp: u64,
    /// Completed epochs when the checkpoint was taken.
    pub epoch: usize,
    pub global_step: usize,
    pub optimizer_step: usize,
    /// Average training loss of the last completed epoch.
    pub loss: Option<f64>,
    /// Best value of `engine.track_for_best` seen so far.
    pub best_score: Option<f64>,
    /// Learning rate the next epoch starts with.
    #[serde(default)]
    pub learning_rate: Option<f64>,
    pub config_sha256: String,
    pub files: Vec<FileRecord>,
}

impl CheckpointManifest {
    pub fn file(&self, filename: &str) -> Option<&FileRecord> {
        self.files.iter().find(|record| record.filename == filename)
    }
}

/// Everything a checkpoint captures, borrowed from the engine.
pub struct CheckpointState<'a> {
    pub varmap: &'a VarMap,
    pub optimizer: &'a dyn Optimizer,
    pub vocab: &'a Vocabularies,
    pub epoch: usize,
    pub global_step: usize,
    pub optimizer_step: usize,
    pub loss: Option<f64>,
    pub best_score: Option<f64>,
}

/// A checkpoint read back from disk with its checksums verified.
#[derive(Debug)]
pub struct LoadedCheckpoint {
    pub directory: PathBuf,
    pub manifest: CheckpointManifest,
    pub model_path: PathBuf,
    pub optimizer_state: HashMap<String, Tensor>,
    pub vocab: Vocabularies,
}

impl LoadedCheckpoint {
    /// Copy the stored parameters into `varmap`'s existing variables.
    pub fn apply_to(&self, varmap: &mut VarMap) -> Result<()> {
        varmap
            .load(&self.model_path)
            .map_err(|err| SeqTagError::checkpoint(&self.model_path, err))
    }
}

/// Writes checkpoints under one `save_dir`.
#[derive(Debug, Clone)]
pub struct CheckpointStore {
    root: PathBuf,
    retries: usize,
    config_sha256: String,
}

impl CheckpointStore {
    pub fn new(root: impl Into<PathBuf>, retries: usize, config_sha256: impl Into<String>) -> Self {
        Self {
            root: root.into(),
            retries,
            config_sha256: config_sha256.into(),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn path(&self, tag: CheckpointTag) -> PathBuf {
        self.root.join(tag.dir_name())
    }

    /// Write a checkpoint, retrying failed attempts up to the configured
    /// bound before giving up with `CheckpointIo`.
    pub fn save(&self, tag: CheckpointTag, state: &CheckpointState<'_>) -> Result<PathBuf> {
        let target = self.path(tag);
        let mut attempt = 0;
        loop {
            attempt += 1;
            match self.write_once(&target, state) {
                Ok(manifest) => {
                    info!(
                        path = %target.display(),
                        epoch = manifest.epoch,
                        step = manifest.global_step,
                        "checkpoint saved"
                    );
                    return Ok(target);
                }
                Err(err) if attempt <= self.retries => {
                    warn!(
                        path = %target.display(),
                        attempt,
                        error = %err,
                        "checkpoint write failed, retrying"
                    );
                }
                Err(err) => {
                    return Err(SeqTagError::checkpoint(
                        &target,
                        format!("giving up after {attempt} attempts: {err}"),
                    ));
                }
            }
        }
    }

    fn write_once(&self, target: &Path, state: &CheckpointState<'_>) -> Result<CheckpointManifest> {
        fs::create_dir_all(&self.root)?;
        let name = target
            .file_name()
            .and_then(|name| name.to_str())
            .ok_or_else(|| SeqTagError::checkpoint(target, "checkpoint path has no name"))?;
        let staging = self.root.join(format!(".{name}.tmp"));
        if staging.exists() {
            fs::remove_dir_all(&staging)?;
        }
        fs::create_dir(&staging)?;

        let mut files = Vec::new();

        let model_path = staging.join(MODEL_FILENAME);
        state.varmap.save(&model_path)?;
        files.push(file_record(&model_path)?);

        let optimizer_state = state.optimizer.state();
        if !optimizer_state.is_empty() {
            let optimizer_path = staging.join(OPTIMIZER_FILENAME);
            candle_core::safetensors::save(&optimizer_state, &optimizer_path)?;
            files.push(file_record(&optimizer_path)?);
        }

        let vocab_path = staging.join(VOCAB_FILENAME);
        state.vocab.save(&vocab_path)?;
        files.push(file_record(&vocab_path)?);

        let manifest = CheckpointManifest {
            version: CHECKPOINT_VERSION,
            created_unix_timestamp: unix_timestamp(),
            epoch: state.epoch,
            global_step: state.global_step,
            optimizer_step: state.optimizer_step,
            loss: state.loss,
            best_score: state.best_score,
            learning_rate: Some(state.optimizer.learning_rate()),
            config_sha256: self.config_sha256.clone(),
            files,
        };
        write_json(&staging.join(MANIFEST_FILENAME), &manifest)?;

        // The previous slot stays on disk until the new one is in place.
        let retired = retired_path(target)?;
        if retired.exists() {
            fs::remove_dir_all(&retired)?;
        }
        if target.exists() {
            fs::rename(target, &retired)?;
        }
        fs::rename(&staging, target)?;
        if retired.exists() {
            fs::remove_dir_all(&retired)?;
        }
        Ok(manifest)
    }

    /// Read and verify the checkpoint in `directory`. A slot interrupted
    /// mid-replacement is read from its retired copy.
    pub fn load(directory: impl AsRef<Path>, device: &Device) -> Result<LoadedCheckpoint> {
        let requested = directory.as_ref();
        let retired = retired_path(requested)?;
        let directory = if !requested.exists() && retired.join(MANIFEST_FILENAME).is_file() {
            warn!(
                path = %requested.display(),
                "checkpoint slot missing, reading the copy it was replacing"
            );
            retired.as_path()
        } else {
            requested
        };
        let manifest_path = directory.join(MANIFEST_FILENAME);
        if !manifest_path.is_file() {
            return Err(SeqTagError::checkpoint(&manifest_path, "manifest not found"));
        }
        let manifest: CheckpointManifest = serde_json::from_slice(&fs::read(&manifest_path)?)?;
        if manifest.version != CHECKPOINT_VERSION {
            return Err(SeqTagError::checkpoint(
                &manifest_path,
                format!(
                    "unsupported checkpoint version {} (expected {CHECKPOINT_VERSION})",
                    manifest.version
                ),
            ));
        }
        for record in &manifest.files {
            validate_file(&directory.join(&record.filename), &record.sha256)?;
        }

        let model_path = directory.join(MODEL_FILENAME);
        if manifest.file(MODEL_FILENAME).is_none() {
            return Err(SeqTagError::checkpoint(&model_path, "not listed in manifest"));
        }
        let vocab_path = directory.join(VOCAB_FILENAME);
        if manifest.file(VOCAB_FILENAME).is_none() {
            return Err(SeqTagError::checkpoint(&vocab_path, "not listed in manifest"));
        }
        let vocab = Vocabularies::load(&vocab_path)?;

        let optimizer_state = if manifest.file(OPTIMIZER_FILENAME).is_some() {
            candle_core::safetensors::load(directory.join(OPTIMIZER_FILENAME), device)?
        } else {
            HashMap::new()
        };

        debug!(path = %directory.display(), epoch = manifest.epoch, "checkpoint verified");
        Ok(LoadedCheckpoint {
            directory: directory.to_path_buf(),
            manifest,
            model_path,
            optimizer_state,
            vocab,
        })
    }
}

/// sha256 of the serialized configuration, recorded in every manifest.
pub fn fingerprint_config(config: &Config) -> Result<String> {
    let json = serde_json::to_vec(config)?;
    Ok(hex::encode(Sha256::digest(json)))
}

/// `root/.{name}.old`, where a slot waits while its replacement is renamed in.
fn retired_path(target: &Path) -> Result<PathBuf> {
    let name = target
        .file_name()
        .and_then(|name| name.to_str())
        .ok_or_else(|| SeqTagError::checkpoint(target, "checkpoint path has no name"))?;
    Ok(target.with_file_name(format!(".{name}.old")))
}

fn unix_timestamp() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

fn file_record(path: &Path) -> Result<FileRecord> {
    File::open(path)?.sync_all()?;
    let filename = path
        .file_name()
        .and_then(|name| name.to_str())
        .ok_or_else(|| SeqTagError::checkpoint(path, "file name is not valid UTF-8"))?
        .to_string();
    Ok(FileRecord {
        filename,
        sha256: sha256_file(path)?,
        bytes: path.metadata()?.len(),
    })
}

fn validate_file(path: &Path, expected_sha: &str) -> Result<()> {
    if !path.is_file() {
        return Err(SeqTagError::checkpoint(path, "file listed in manifest is missing"));
    }
    if sha256_file(path)? != expected_sha {
        return Err(SeqTagError::checkpoint(path, "checksum mismatch"));
    }
    Ok(())
}

fn sha256_file(path: &Path) -> Result<String> {
    let mut file = File::open(path)?;
    let mut hasher = Sha256::new();
    let mut buffer = [0u8; 64 * 1024];
    loop {
        let read = file.read(&mut buffer)?;
        if read == 0 {
            break;
        }
        hasher.update(&buffer[..read]);
    }
    Ok(hex::encode(hasher.finalize()))
}

fn write_json<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    let mut file = File::create(path)?;
    file.write_all(&serde_json::to_vec_pretty(value)?)?;
    file.write_all(b"\n")?;
    file.sync_all()?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::optimizer::{Adam, OptimizerConfig};
    use candle_core::{DType, Var};
    use candle_nn::{Init, VarBuilder};

    fn adam_config() -> OptimizerConfig {
        OptimizerConfig {
            lr: 0.01,
            beta1: 0.9,
            beta2: 0.999,
            eps: 1e-8,
            weight_decay: 0.0,
        }
    }

    fn fixture() -> (VarMap, Vec<(String, Var)>, Vocabularies) {
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
        vb.pp("crf")
            .get_with_hints((3, 3), "transitions", Init::Randn { mean: 0.0, stdev: 1.0 })
            .unwrap();
        let vars = crate::optimizer::trainable_vars(&varmap, &[]).unwrap();
        let vocab = Vocabularies::build(&[vec!["Cu", "is", "a", "metal"]], None, 1);
        (varmap, vars, vocab)
    }

    fn state<'a>(
        varmap: &'a VarMap,
        optimizer: &'a dyn Optimizer,
        vocab: &'a Vocabularies,
    ) -> CheckpointState<'a> {
        CheckpointState {
            varmap,
            optimizer,
            vocab,
            epoch: 2,
            global_step: 17,
            optimizer_step: 16,
            loss: Some(0.75),
            best_score: Some(0.5),
        }
    }

    #[test]
    fn test_roundtrip_restores_parameters_and_counters() {
        let dir = tempfile::tempdir().unwrap();
        let (varmap, vars, vocab) = fixture();
        let mut optimizer = Adam::new(vars.clone(), adam_config(), false).unwrap();
        let loss = vars[0].1.as_tensor().sqr().unwrap().sum_all().unwrap();
        optimizer.step(&mut loss.backward().unwrap()).unwrap();

        let store = CheckpointStore::new(dir.path(), 0, "abc");
        let path = store
            .save(CheckpointTag::Epoch(2), &state(&varmap, &optimizer, &vocab))
            .unwrap();
        assert!(path.ends_with("epoch_0002"));
        assert!(!dir.path().join(".epoch_0002.tmp").exists());

        let saved: Vec<f32> = vars[0].1.as_tensor().flatten_all().unwrap().to_vec1().unwrap();

        let (mut restored, _, _) = fixture();
        let loaded = CheckpointStore::load(&path, &Device::Cpu).unwrap();
        loaded.apply_to(&mut restored).unwrap();
        let restored_vars = crate::optimizer::trainable_vars(&restored, &[]).unwrap();
        let values: Vec<f32> = restored_vars[0]
            .1
            .as_tensor()
            .flatten_all()
            .unwrap()
            .to_vec1()
            .unwrap();
        assert_eq!(values, saved);

        assert_eq!(loaded.manifest.epoch, 2);
        assert_eq!(loaded.manifest.global_step, 17);
        assert_eq!(loaded.manifest.optimizer_step, 16);
        assert_eq!(loaded.manifest.best_score, Some(0.5));
        assert_eq!(loaded.vocab, vocab);
        assert_eq!(loaded.optimizer_state.len(), 2);
    }

    #[test]
    fn test_interrupted_replacement_keeps_previous_slot_readable() {
        let dir = tempfile::tempdir().unwrap();
        let (varmap, vars, vocab) = fixture();
        let optimizer = Adam::new(vars, adam_config(), false).unwrap();
        let store = CheckpointStore::new(dir.path(), 0, "abc");
        let path = store
            .save(CheckpointTag::Latest, &state(&varmap, &optimizer, &vocab))
            .unwrap();

        // A crash after retiring the old slot but before the new one lands.
        let retired = dir.path().join(".latest.old");
        fs::rename(&path, &retired).unwrap();
        let loaded = CheckpointStore::load(&path, &Device::Cpu).unwrap();
        assert_eq!(loaded.manifest.epoch, 2);
        assert_eq!(loaded.directory, retired);

        let path = store
            .save(CheckpointTag::Latest, &state(&varmap, &optimizer, &vocab))
            .unwrap();
        assert!(path.join(MANIFEST_FILENAME).is_file());
        assert!(!retired.exists());
        assert_eq!(
            CheckpointStore::load(&path, &Device::Cpu).unwrap().manifest.learning_rate,
            Some(0.01)
        );
    }

    #[test]
    fn test_overwrite_named_slot() {
        let dir = tempfile::tempdir().unwrap();
        let (varmap, vars, vocab) = fixture();
        let optimizer = Adam::new(vars, adam_config(), false).unwrap();
        let store = CheckpointStore::new(dir.path(), 0, "abc");
        let mut s = state(&varmap, &optimizer, &vocab);
        store.save(CheckpointTag::Best, &s).unwrap();
        s.epoch = 5;
        let path = store.save(CheckpointTag::Best, &s).unwrap();
        assert_eq!(CheckpointStore::load(&path, &Device::Cpu).unwrap().manifest.epoch, 5);
    }

    #[test]
    fn test_corrupted_file_fails_checksum() {
        let dir = tempfile::tempdir().unwrap();
        let (varmap, vars, vocab) = fixture();
        let optimizer = Adam::new(vars, adam_config(), false).unwrap();
        let store = CheckpointStore::new(dir.path(), 0, "abc");
        let path = store
            .save(CheckpointTag::Latest, &state(&varmap, &optimizer, &vocab))
            .unwrap();

        fs::write(path.join(VOCAB_FILENAME), b"{}").unwrap();
        let err = CheckpointStore::load(&path, &Device::Cpu).unwrap_err();
        assert!(matches!(err, SeqTagError::CheckpointIo { .. }));
        assert!(err.to_string().contains("checksum"));
    }

    #[test]
    fn test_missing_manifest() {
        let dir = tempfile::tempdir().unwrap();
        let err = CheckpointStore::load(dir.path(), &Device::Cpu).unwrap_err();
        assert!(matches!(err, SeqTagError::CheckpointIo { .. }));
    }

    #[test]
    fn test_unwritable_root_gives_up_after_retries() {
        let dir = tempfile::tempdir().unwrap();
        let blocker = dir.path().join("not_a_dir");
        fs::write(&blocker, b"").unwrap();
        let (varmap, vars, vocab) = fixture();
        let optimizer = Adam::new(vars, adam_config(), false).unwrap();

        let store = CheckpointStore::new(&blocker, 2, "abc");
        let err = store
            .save(CheckpointTag::Epoch(1), &state(&varmap, &optimizer, &vocab))
            .unwrap_err();
        assert!(err.to_string().contains("3 attempts"));
    }

    #[test]
    fn test_tag_names() {
        assert_eq!(CheckpointTag::Epoch(1).dir_name(), "epoch_0001");
        assert_eq!(CheckpointTag::Step(250).dir_name(), "step_00000250");
        assert_eq!(CheckpointTag::Best.dir_name(), "best_model");
        assert_eq!(CheckpointTag::Latest.dir_name(), "latest");
    }
}

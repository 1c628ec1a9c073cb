//! # Seqtag
//!
//! Umbrella crate: the model components from `seqtag-core` and the
//! training engine from `seqtag-trainer` under one dependency.
//!
//! ```rust
//! use seqtag::core::LabelSet;
//!
//! let labels = LabelSet::bioul(&["MATERIAL".to_string()]).unwrap();
//! assert_eq!(labels.index_of("O"), Some(0));
//! ```

pub use seqtag_core as core;
pub use seqtag_trainer as trainer;

pub use seqtag_core::{
    Config, ConfigError, LabelSet, ModelAssembler, Result, SeqTagError, Span, Tagger,
};
pub use seqtag_trainer::{
    Engine, Prediction, RunOptions, SequenceTaggerInference, TrainingSummary, run_training,
};

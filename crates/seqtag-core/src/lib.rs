//! # Seqtag Core
//!
//! Configuration-assembled neural sequence taggers: word and character
//! embedders, a recurrent sequence encoder and a linear-chain CRF over
//! BIOUL label sets, plus the metrics used to evaluate them.
//!
//! ## Quick Start
//!
//! ```rust
//! use seqtag_core::labels::LabelSet;
//!
//! let labels = LabelSet::bioul(&["MATERIAL".to_string()]).unwrap();
//! assert_eq!(labels.len(), 5);
//!
//! let ids: Vec<usize> = labels
//!     .encode(&["B-MATERIAL", "L-MATERIAL", "O", "U-MATERIAL"])
//!     .unwrap()
//!     .into_iter()
//!     .map(|id| id as usize)
//!     .collect();
//! assert!(labels.is_valid_sequence(&ids));
//! assert_eq!(labels.spans(&ids).len(), 2);
//! ```
pub mod assembler;
pub mod config;
pub mod crf;
pub mod data;
pub mod error;
pub mod labels;
pub mod metrics;
pub mod model;
pub mod tokenizer;
pub mod vocab;

// Re-export primary API
pub use assembler::{AssemblyContext, ModelAssembler, Registry};
pub use config::{
    ComponentConfig, Config, DatasetConfig, EngineConfig, ExperimentConfig, NonFinitePolicy,
    Params, SaveUnit,
};
pub use crf::{ConditionalRandomField, ViterbiDecoder};
pub use data::{Batch, Sentence, Token};
pub use error::{ConfigError, Result, SeqTagError};
pub use labels::{BioulTag, LabelSet, Span, TagPrefix, TaggingScheme, bio_to_bioul};
pub use metrics::{
    ConfusionMatrix, Metric, MetricReport, PrecisionRecallFMeasure, TokenClassificationAccuracy,
    TypeScores, build_metric,
};
pub use model::{Embedder, ForwardMode, SeqEncoder, Tagger, TaggerOutput};
pub use tokenizer::{TextToken, WordTokenizer};
pub use vocab::{Vocabularies, Vocabulary};

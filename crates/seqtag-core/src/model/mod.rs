//! # Tagging Model Components
//!
//! Each role in the model tree (embedder, sequence encoder, tagger) is a
//! trait; concrete variants are built from configuration by the
//! [`ModelAssembler`](crate::assembler::ModelAssembler).

pub mod embedder;
pub mod encoder;
pub mod tagger;

use candle_core::Tensor;

use crate::crf::ConditionalRandomField;
use crate::data::Batch;
use crate::error::Result;
use crate::labels::LabelSet;

pub use embedder::{
    CharEmbedder, CharEmbedderConfig, Embedder, EmbedderConfig, EmbedderStack, WordEmbedder,
    WordEmbedderConfig,
};
pub use encoder::{CombineStrategy, Lstm2SeqEncoder, Lstm2SeqEncoderConfig, SeqEncoder};
pub use tagger::{RnnSeqCrfTagger, RnnSeqCrfTaggerConfig};

/// How a forward pass is used.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ForwardMode {
    /// Dropout active, loss required.
    Train,
    /// Dropout off, loss computed when gold labels are present.
    Eval,
    /// Dropout off, decoding only.
    Predict,
}

impl ForwardMode {
    pub fn is_train(self) -> bool {
        self == Self::Train
    }
}

/// Result of a tagger forward pass.
#[derive(Debug)]
pub struct TaggerOutput {
    /// Mean negative log-likelihood, a scalar tensor attached to the graph.
    pub loss: Option<Tensor>,
    /// Best label ids per sentence, truncated to each sentence length.
    pub predictions: Vec<Vec<usize>>,
    /// Viterbi score of each predicted path.
    pub path_scores: Vec<f32>,
}

/// A complete sequence tagger: encoded batch in, loss and label paths out.
pub trait Tagger {
    fn forward(&self, batch: &Batch, mode: ForwardMode) -> Result<TaggerOutput>;

    /// Per-token label scores, shape `[batch, seq_len, num_labels]`.
    fn emissions(&self, batch: &Batch, train: bool) -> Result<Tensor>;

    fn label_set(&self) -> &LabelSet;

    fn crf(&self) -> &ConditionalRandomField;

    fn num_labels(&self) -> usize {
        self.label_set().len()
    }

    /// Variable-name prefixes the optimizer must leave untouched.
    fn frozen_prefixes(&self) -> Vec<String> {
        Vec::new()
    }
}

/// Reverse every row of `xs` (`[batch, seq_len, dim]`) within its own length,
/// leaving padded positions in place. Applying it twice is the identity.
pub(crate) fn reverse_padded(xs: &Tensor, lengths: &[usize]) -> Result<Tensor> {
    let (batch, seq_len, dim) = xs.dims3()?;
    let index: Vec<u32> = lengths
        .iter()
        .enumerate()
        .flat_map(|(b, &len)| {
            (0..seq_len).map(move |t| {
                let src = if t < len { len - 1 - t } else { t };
                (b * seq_len + src) as u32
            })
        })
        .collect();
    let index = Tensor::from_vec(index, batch * seq_len, xs.device())?;
    Ok(xs
        .reshape((batch * seq_len, dim))?
        .index_select(&index, 0)?
        .reshape((batch, seq_len, dim))?)
}

/// Dropout that is a no-op outside training.
pub(crate) fn dropout(xs: &Tensor, p: f32, train: bool) -> Result<Tensor> {
    if !train || p <= 0.0 {
        return Ok(xs.clone());
    }
    if p >= 1.0 {
        return Ok(xs.zeros_like()?);
    }
    Ok(candle_nn::ops::dropout(xs, p)?)
}

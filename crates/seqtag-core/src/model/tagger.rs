//! BiLSTM-CRF tagger.

use candle_core::{Module, Tensor};
use candle_nn::Linear;

use crate::assembler::AssemblyContext;
use crate::config::Params;
use crate::crf::ConditionalRandomField;
use crate::data::Batch;
use crate::error::{ConfigError, Result, SeqTagError};
use crate::labels::LabelSet;
use crate::model::encoder::SeqEncoder;
use crate::model::{ForwardMode, Tagger, TaggerOutput};

/// Parsed parameters of a `RnnSeqCrfTagger` node.
#[derive(Debug, Clone, PartialEq)]
pub struct RnnSeqCrfTaggerConfig {
    /// Must equal the encoder output width.
    pub encoding_dim: usize,
    pub constrain_decoding: bool,
}

impl RnnSeqCrfTaggerConfig {
    pub fn from_params(params: &Params<'_>) -> std::result::Result<Self, ConfigError> {
        Ok(Self {
            encoding_dim: params.required("encoding_dim")?,
            constrain_decoding: params.or("constrain_decoding", true)?,
        })
    }
}

/// Encoder, linear emission projection and CRF.
pub struct RnnSeqCrfTagger {
    encoder: Box<dyn SeqEncoder>,
    projection: Linear,
    crf: ConditionalRandomField,
    labels: LabelSet,
}

impl RnnSeqCrfTagger {
    pub fn new(
        config: &RnnSeqCrfTaggerConfig,
        encoder: Box<dyn SeqEncoder>,
        ctx: &AssemblyContext<'_>,
    ) -> Result<Self> {
        if encoder.output_dim() != config.encoding_dim {
            return Err(SeqTagError::shape(format!(
                "model.encoding_dim is {} but the encoder produces {}-dimensional outputs",
                config.encoding_dim,
                encoder.output_dim()
            )));
        }

        let labels = ctx.labels().clone();
        let projection =
            candle_nn::linear(config.encoding_dim, labels.len(), ctx.vb().pp("emission"))?;
        let crf =
            ConditionalRandomField::new(&labels, config.constrain_decoding, ctx.vb().pp("crf"))?;

        Ok(Self {
            encoder,
            projection,
            crf,
            labels,
        })
    }
}

impl Tagger for RnnSeqCrfTagger {
    fn emissions(&self, batch: &Batch, train: bool) -> Result<Tensor> {
        let encoded = self.encoder.encode(batch, train)?;
        Ok(self.projection.forward(&encoded)?)
    }

    fn forward(&self, batch: &Batch, mode: ForwardMode) -> Result<TaggerOutput> {
        let emissions = self.emissions(batch, mode.is_train())?;

        let loss = match (&batch.labels, mode) {
            (Some(gold), ForwardMode::Train | ForwardMode::Eval) => Some(
                self.crf
                    .neg_log_likelihood(&emissions, gold, &batch.mask, &batch.lengths)?,
            ),
            (None, ForwardMode::Train) => {
                return Err(SeqTagError::shape("training batch carries no gold labels"));
            }
            _ => None,
        };

        let (predictions, path_scores) = self
            .crf
            .decode(&emissions, &batch.lengths)?
            .into_iter()
            .unzip();

        Ok(TaggerOutput {
            loss,
            predictions,
            path_scores,
        })
    }

    fn label_set(&self) -> &LabelSet {
        &self.labels
    }

    fn crf(&self) -> &ConditionalRandomField {
        &self.crf
    }

    fn frozen_prefixes(&self) -> Vec<String> {
        self.encoder.frozen_prefixes()
    }
}

//! # Recurrent Sequence Encoder
//!
//! Runs a (bi)LSTM stack over the embedded tokens of a batch. The backward
//! direction reverses every sentence inside its own length, so padding is
//! always read after the real tokens and never leaks into them.

use std::fmt;
use std::str::FromStr;

use candle_core::Tensor;
use candle_nn::{LSTM, LSTMConfig, RNN};
use serde::{Deserialize, Serialize};

use crate::assembler::AssemblyContext;
use crate::config::Params;
use crate::data::Batch;
use crate::error::{ConfigError, Result};
use crate::model::embedder::{Embedder, EmbedderStack};
use crate::model::{dropout, reverse_padded};

/// Contextual encoder of an embedded batch.
pub trait SeqEncoder {
    /// Encoded tokens of shape `[batch, seq_len, output_dim]`, zero on padding.
    fn encode(&self, batch: &Batch, train: bool) -> Result<Tensor>;

    fn output_dim(&self) -> usize;

    fn frozen_prefixes(&self) -> Vec<String> {
        Vec::new()
    }
}

/// How the forward and backward outputs are merged.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CombineStrategy {
    Concat,
    Sum,
}

impl FromStr for CombineStrategy {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "concat" => Ok(Self::Concat),
            "sum" => Ok(Self::Sum),
            other => Err(format!("expected `concat` or `sum`, got `{other}`")),
        }
    }
}

impl fmt::Display for CombineStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Concat => write!(f, "concat"),
            Self::Sum => write!(f, "sum"),
        }
    }
}

/// Parsed parameters of an `Lstm2SeqEncoder` node (embedders excluded).
#[derive(Debug, Clone, PartialEq)]
pub struct Lstm2SeqEncoderConfig {
    pub hidden_dim: usize,
    pub num_layers: usize,
    pub bidirectional: bool,
    pub combine_strategy: CombineStrategy,
    pub rnn_bias: bool,
    pub dropout_value: f32,
}

impl Lstm2SeqEncoderConfig {
    pub fn from_params(params: &Params<'_>) -> std::result::Result<Self, ConfigError> {
        let hidden_dim: usize = params.required("hidden_dim")?;
        if hidden_dim == 0 {
            return Err(ConfigError::invalid(params.field("hidden_dim"), "must be greater than 0"));
        }
        let num_layers: usize = params.or("num_layers", 1)?;
        if num_layers == 0 {
            return Err(ConfigError::invalid(params.field("num_layers"), "must be at least 1"));
        }
        let dropout_value: f32 = params.or("dropout_value", 0.0)?;
        if !(0.0..=1.0).contains(&dropout_value) {
            return Err(ConfigError::invalid(
                params.field("dropout_value"),
                "must lie in [0, 1]",
            ));
        }
        let combine: String = params.or("combine_strategy", "concat".to_string())?;
        let combine_strategy = combine
            .parse::<CombineStrategy>()
            .map_err(|reason| ConfigError::invalid(params.field("combine_strategy"), reason))?;

        Ok(Self {
            hidden_dim,
            num_layers,
            bidirectional: params.or("bidirectional", false)?,
            combine_strategy,
            rnn_bias: params.or("rnn_bias", true)?,
            dropout_value,
        })
    }

    /// Width of one layer's merged output.
    pub fn output_dim(&self) -> usize {
        match (self.bidirectional, self.combine_strategy) {
            (true, CombineStrategy::Concat) => 2 * self.hidden_dim,
            _ => self.hidden_dim,
        }
    }
}

#[derive(Debug, Clone)]
struct RecurrentLayer {
    forward: LSTM,
    backward: Option<LSTM>,
}

/// Embedder stack followed by stacked (bi)LSTM layers.
pub struct Lstm2SeqEncoder {
    embedder: EmbedderStack,
    layers: Vec<RecurrentLayer>,
    config: Lstm2SeqEncoderConfig,
}

impl Lstm2SeqEncoder {
    pub fn new(
        config: Lstm2SeqEncoderConfig,
        embedder: EmbedderStack,
        ctx: &AssemblyContext<'_>,
    ) -> Result<Self> {
        let lstm_config = || {
            if config.rnn_bias {
                LSTMConfig::default()
            } else {
                LSTMConfig::default_no_bias()
            }
        };

        let mut layers = Vec::with_capacity(config.num_layers);
        let mut input_dim = embedder.output_dim();
        for layer in 0..config.num_layers {
            let vb = ctx.vb().pp(format!("layer_{layer}"));
            let forward =
                candle_nn::lstm(input_dim, config.hidden_dim, lstm_config(), vb.pp("forward"))?;
            let backward = if config.bidirectional {
                Some(candle_nn::lstm(
                    input_dim,
                    config.hidden_dim,
                    lstm_config(),
                    vb.pp("backward"),
                )?)
            } else {
                None
            };
            layers.push(RecurrentLayer { forward, backward });
            input_dim = config.output_dim();
        }

        Ok(Self {
            embedder,
            layers,
            config,
        })
    }

    pub fn config(&self) -> &Lstm2SeqEncoderConfig {
        &self.config
    }

    pub fn embedder(&self) -> &EmbedderStack {
        &self.embedder
    }

    fn run_layer(&self, layer: &RecurrentLayer, xs: &Tensor, lengths: &[usize]) -> Result<Tensor> {
        let forward = layer.forward.states_to_tensor(&layer.forward.seq(xs)?)?;
        let Some(backward) = &layer.backward else {
            return Ok(forward);
        };

        let reversed = reverse_padded(xs, lengths)?;
        let backward = backward.states_to_tensor(&backward.seq(&reversed)?)?;
        let backward = reverse_padded(&backward, lengths)?;

        Ok(match self.config.combine_strategy {
            CombineStrategy::Concat => Tensor::cat(&[&forward, &backward], 2)?,
            CombineStrategy::Sum => forward.add(&backward)?,
        })
    }
}

impl SeqEncoder for Lstm2SeqEncoder {
    fn encode(&self, batch: &Batch, train: bool) -> Result<Tensor> {
        let mask = batch.mask.unsqueeze(2)?;
        let p = self.config.dropout_value;

        let mut hidden = self.embedder.embed(batch, train)?.broadcast_mul(&mask)?;
        for layer in &self.layers {
            hidden = dropout(&hidden, p, train)?;
            hidden = self.run_layer(layer, &hidden, &batch.lengths)?;
        }
        hidden = dropout(&hidden, p, train)?;

        Ok(hidden.broadcast_mul(&mask)?)
    }

    fn output_dim(&self) -> usize {
        self.config.output_dim()
    }

    fn frozen_prefixes(&self) -> Vec<String> {
        self.embedder.frozen_prefixes()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ComponentConfig;
    use crate::data::Sentence;
    use crate::labels::LabelSet;
    use crate::model::embedder::{EmbedderConfig, WordEmbedderConfig};
    use crate::vocab::Vocabularies;
    use candle_core::{DType, Device};
    use candle_nn::{VarBuilder, VarMap};

    fn config(
        bidirectional: bool,
        combine: CombineStrategy,
        layers: usize,
    ) -> Lstm2SeqEncoderConfig {
        Lstm2SeqEncoderConfig {
            hidden_dim: 5,
            num_layers: layers,
            bidirectional,
            combine_strategy: combine,
            rnn_bias: true,
            dropout_value: 0.5,
        }
    }

    fn encode(config: Lstm2SeqEncoderConfig, sentences: &[Vec<&str>]) -> Tensor {
        let vocab = Vocabularies::build(sentences, None, 1);
        let labels = LabelSet::bioul(&["MATERIAL".to_string()]).unwrap();
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
        let ctx = AssemblyContext::new(&vocab, &labels, vb);

        let word = EmbedderConfig::Word(WordEmbedderConfig {
            embedding_type: None,
            embedding_dim: 3,
            trainable: true,
        });
        let stack = EmbedderStack::new(vec![word.build(&ctx.pp("embedder_0")).unwrap()]);
        let encoder = Lstm2SeqEncoder::new(config, stack, &ctx).unwrap();

        let parsed: Vec<Sentence> = sentences
            .iter()
            .map(|s| Sentence::new(s, None, &vocab).unwrap())
            .collect();
        let refs: Vec<&Sentence> = parsed.iter().collect();
        let batch = Batch::from_sentences(&refs, &labels, &Device::Cpu).unwrap();
        encoder.encode(&batch, false).unwrap()
    }

    #[test]
    fn test_output_dims_follow_combine_strategy() {
        let corpus = vec![vec!["Cu", "is", "a", "metal"]];
        assert_eq!(encode(config(false, CombineStrategy::Concat, 1), &corpus).dims(), &[1, 4, 5]);
        assert_eq!(encode(config(true, CombineStrategy::Concat, 2), &corpus).dims(), &[1, 4, 10]);
        assert_eq!(encode(config(true, CombineStrategy::Sum, 2), &corpus).dims(), &[1, 4, 5]);
    }

    #[test]
    fn test_padding_does_not_leak() {
        // The short sentence must encode identically alone and when padded.
        let alone = encode(
            config(true, CombineStrategy::Concat, 1),
            &[vec!["Fe", "rusts"], vec!["Cu", "is", "a", "metal"]],
        );
        let rows: Vec<Vec<Vec<f32>>> = alone.to_vec3().unwrap();
        assert!(rows[0][2].iter().chain(&rows[0][3]).all(|&v| v == 0.0));
        assert!(rows[0][0].iter().any(|&v| v != 0.0));
    }

    #[test]
    fn test_reversal_matches_unpadded_run() {
        let vocab_src = vec![vec!["Fe", "rusts"], vec!["Cu", "is", "a", "metal"]];
        let vocab = Vocabularies::build(&vocab_src, None, 1);
        let labels = LabelSet::bioul(&["MATERIAL".to_string()]).unwrap();
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
        let ctx = AssemblyContext::new(&vocab, &labels, vb);
        let word = EmbedderConfig::Word(WordEmbedderConfig {
            embedding_type: None,
            embedding_dim: 3,
            trainable: true,
        });
        let stack = EmbedderStack::new(vec![word.build(&ctx.pp("embedder_0")).unwrap()]);
        let encoder =
            Lstm2SeqEncoder::new(config(true, CombineStrategy::Concat, 1), stack, &ctx).unwrap();

        let short = Sentence::new(&vocab_src[0], None, &vocab).unwrap();
        let long = Sentence::new(&vocab_src[1], None, &vocab).unwrap();
        let padded = Batch::from_sentences(&[&short, &long], &labels, &Device::Cpu).unwrap();
        let single = Batch::from_sentences(&[&short], &labels, &Device::Cpu).unwrap();

        let padded: Vec<Vec<Vec<f32>>> = encoder.encode(&padded, false).unwrap().to_vec3().unwrap();
        let single: Vec<Vec<Vec<f32>>> = encoder.encode(&single, false).unwrap().to_vec3().unwrap();
        for t in 0..2 {
            for (a, b) in padded[0][t].iter().zip(&single[0][t]) {
                assert!((a - b).abs() < 1e-5);
            }
        }
    }

    #[test]
    fn test_config_validation() {
        let node = ComponentConfig::new("Lstm2SeqEncoder")
            .with("hidden_dim", 4)
            .with("combine_strategy", "mean");
        let err = Lstm2SeqEncoderConfig::from_params(&node.at("model.rnn2seqencoder")).unwrap_err();
        assert!(matches!(
            err,
            ConfigError::InvalidParameter { ref field, .. }
                if field == "model.rnn2seqencoder.combine_strategy"
        ));

        let node = ComponentConfig::new("Lstm2SeqEncoder")
            .with("hidden_dim", 4)
            .with("dropout_value", 1.5);
        assert!(Lstm2SeqEncoderConfig::from_params(&node.at("m")).is_err());

        let node = ComponentConfig::new("Lstm2SeqEncoder")
            .with("hidden_dim", 4)
            .with("num_layers", 0);
        assert!(Lstm2SeqEncoderConfig::from_params(&node.at("m")).is_err());
    }
}

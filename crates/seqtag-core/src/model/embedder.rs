//! # Token Embedders
//!
//! Word-level lookup tables and a character-level recurrent embedder,
//! combined by [`EmbedderStack`] through concatenation on the feature axis.

use candle_core::{Module, Tensor};
use candle_nn::{Embedding, LSTM, LSTMConfig, RNN};

use crate::assembler::AssemblyContext;
use crate::config::Params;
use crate::data::Batch;
use crate::error::{ConfigError, Result};
use crate::model::reverse_padded;

/// Per-token embedding provider.
pub trait Embedder {
    /// Embeddings of shape `[batch, seq_len, output_dim]`.
    fn embed(&self, batch: &Batch, train: bool) -> Result<Tensor>;

    fn output_dim(&self) -> usize;

    fn name(&self) -> &'static str;

    /// Variable prefix of a frozen table, if this embedder is not trainable.
    fn frozen_prefix(&self) -> Option<&str> {
        None
    }
}

/// Parsed parameters of a `WordEmbedder` node.
#[derive(Debug, Clone, PartialEq)]
pub struct WordEmbedderConfig {
    /// Name of the pretrained table, e.g. `glove_6B_100`.
    pub embedding_type: Option<String>,
    pub embedding_dim: usize,
    pub trainable: bool,
}

impl WordEmbedderConfig {
    /// `embedding_dim` may be omitted when `embedding_type` ends in the
    /// table width (`glove_6B_100` is 100-dimensional).
    pub fn from_params(params: &Params<'_>) -> std::result::Result<Self, ConfigError> {
        let embedding_type: Option<String> = params.optional("embedding_type")?;
        let explicit: Option<usize> = params.optional("embedding_dim")?;
        let inferred = embedding_type.as_deref().and_then(dim_from_embedding_type);

        let embedding_dim = match (explicit, inferred) {
            (Some(dim), Some(from_type)) if dim != from_type => {
                return Err(ConfigError::invalid(
                    params.field("embedding_dim"),
                    format!(
                        "{dim} conflicts with the {from_type}-dimensional `{}` table",
                        embedding_type.unwrap_or_default()
                    ),
                ));
            }
            (Some(dim), _) | (None, Some(dim)) => dim,
            (None, None) => return Err(ConfigError::missing(params.field("embedding_dim"))),
        };
        if embedding_dim == 0 {
            return Err(ConfigError::invalid(
                params.field("embedding_dim"),
                "must be greater than 0",
            ));
        }

        Ok(Self {
            embedding_type,
            embedding_dim,
            trainable: params.or("trainable", true)?,
        })
    }
}

fn dim_from_embedding_type(name: &str) -> Option<usize> {
    name.trim_end_matches('d')
        .rsplit(|c: char| !c.is_ascii_digit())
        .next()?
        .parse()
        .ok()
}

/// Parsed parameters of a `CharEmbedder` node.
#[derive(Debug, Clone, PartialEq)]
pub struct CharEmbedderConfig {
    pub char_embedding_dimension: usize,
    pub hidden_dimension: usize,
    pub bidirectional: bool,
}

impl CharEmbedderConfig {
    pub fn from_params(params: &Params<'_>) -> std::result::Result<Self, ConfigError> {
        let char_embedding_dimension: usize = params.required("char_embedding_dimension")?;
        let hidden_dimension: usize = params.required("hidden_dimension")?;
        for (key, value) in [
            ("char_embedding_dimension", char_embedding_dimension),
            ("hidden_dimension", hidden_dimension),
        ] {
            if value == 0 {
                return Err(ConfigError::invalid(params.field(key), "must be greater than 0"));
            }
        }
        Ok(Self {
            char_embedding_dimension,
            hidden_dimension,
            bidirectional: params.or("bidirectional", true)?,
        })
    }

    pub fn output_dim(&self) -> usize {
        if self.bidirectional {
            2 * self.hidden_dimension
        } else {
            self.hidden_dimension
        }
    }
}

/// The embedder variants a model tree may declare.
#[derive(Debug, Clone, PartialEq)]
pub enum EmbedderConfig {
    Word(WordEmbedderConfig),
    Char(CharEmbedderConfig),
}

impl EmbedderConfig {
    pub fn output_dim(&self) -> usize {
        match self {
            Self::Word(config) => config.embedding_dim,
            Self::Char(config) => config.output_dim(),
        }
    }

    pub fn build(&self, ctx: &AssemblyContext<'_>) -> Result<Box<dyn Embedder>> {
        Ok(match self {
            Self::Word(config) => Box::new(WordEmbedder::new(config, ctx)?),
            Self::Char(config) => Box::new(CharEmbedder::new(config, ctx)?),
        })
    }
}

/// Lookup table over the word vocabulary; unknown words share the `<UNK>` row.
#[derive(Debug, Clone)]
pub struct WordEmbedder {
    embedding: Embedding,
    dim: usize,
    frozen: Option<String>,
}

impl WordEmbedder {
    pub fn new(config: &WordEmbedderConfig, ctx: &AssemblyContext<'_>) -> Result<Self> {
        let embedding =
            candle_nn::embedding(ctx.vocab().words.len(), config.embedding_dim, ctx.vb())?;
        Ok(Self {
            embedding,
            dim: config.embedding_dim,
            frozen: (!config.trainable).then(|| ctx.prefix().to_string()),
        })
    }
}

impl Embedder for WordEmbedder {
    fn embed(&self, batch: &Batch, _train: bool) -> Result<Tensor> {
        Ok(self.embedding.forward(&batch.word_ids)?)
    }

    fn output_dim(&self) -> usize {
        self.dim
    }

    fn name(&self) -> &'static str {
        "WordEmbedder"
    }

    fn frozen_prefix(&self) -> Option<&str> {
        self.frozen.as_deref()
    }
}

/// Character embeddings summarised per token by a small LSTM.
///
/// The token vector is the final forward state, concatenated with the final
/// backward state when bidirectional.
#[derive(Debug, Clone)]
pub struct CharEmbedder {
    embedding: Embedding,
    forward: LSTM,
    backward: Option<LSTM>,
    output_dim: usize,
}

impl CharEmbedder {
    pub fn new(config: &CharEmbedderConfig, ctx: &AssemblyContext<'_>) -> Result<Self> {
        let vb = ctx.vb();
        let embedding = candle_nn::embedding(
            ctx.vocab().chars.len(),
            config.char_embedding_dimension,
            vb.pp("char_embedding"),
        )?;
        let forward = candle_nn::lstm(
            config.char_embedding_dimension,
            config.hidden_dimension,
            LSTMConfig::default(),
            vb.pp("forward"),
        )?;
        let backward = if config.bidirectional {
            Some(candle_nn::lstm(
                config.char_embedding_dimension,
                config.hidden_dimension,
                LSTMConfig::default(),
                vb.pp("backward"),
            )?)
        } else {
            None
        };

        Ok(Self {
            embedding,
            forward,
            backward,
            output_dim: config.output_dim(),
        })
    }
}

impl Embedder for CharEmbedder {
    fn embed(&self, batch: &Batch, _train: bool) -> Result<Tensor> {
        let (batch_size, seq_len, max_chars) = batch.char_ids.dims3()?;
        let words = batch_size * seq_len;
        let chars = self
            .embedding
            .forward(&batch.char_ids.reshape((words, max_chars))?)?;
        // Padding tokens have no characters; read their first state.
        let lengths: Vec<usize> = batch
            .char_lengths
            .flatten_all()?
            .to_vec1::<u32>()?
            .into_iter()
            .map(|len| (len as usize).max(1))
            .collect();

        let mut summary = final_states(&self.forward, &chars, &lengths)?;
        if let Some(backward) = &self.backward {
            let reversed = reverse_padded(&chars, &lengths)?;
            let back = final_states(backward, &reversed, &lengths)?;
            summary = Tensor::cat(&[&summary, &back], 1)?;
        }
        Ok(summary.reshape((batch_size, seq_len, self.output_dim))?)
    }

    fn output_dim(&self) -> usize {
        self.output_dim
    }

    fn name(&self) -> &'static str {
        "CharEmbedder"
    }
}

/// Hidden state at position `len - 1` of every row, shape `[rows, hidden]`.
fn final_states(lstm: &LSTM, xs: &Tensor, lengths: &[usize]) -> Result<Tensor> {
    let states = lstm.seq(xs)?;
    let hidden = lstm.states_to_tensor(&states)?;
    let (rows, _, dim) = hidden.dims3()?;
    let last: Vec<u32> = lengths.iter().map(|&len| (len - 1) as u32).collect();
    let index = Tensor::from_vec(last, (rows, 1, 1), xs.device())?
        .broadcast_as((rows, 1, dim))?
        .contiguous()?;
    Ok(hidden.gather(&index, 1)?.squeeze(1)?)
}

/// Ordered composition of embedders; output is their concatenation.
pub struct EmbedderStack {
    embedders: Vec<Box<dyn Embedder>>,
}

impl EmbedderStack {
    pub fn new(embedders: Vec<Box<dyn Embedder>>) -> Self {
        Self { embedders }
    }

    pub fn len(&self) -> usize {
        self.embedders.len()
    }

    pub fn is_empty(&self) -> bool {
        self.embedders.is_empty()
    }

    /// Constituent names in concatenation order.
    pub fn names(&self) -> Vec<&'static str> {
        self.embedders.iter().map(|e| e.name()).collect()
    }

    pub fn frozen_prefixes(&self) -> Vec<String> {
        self.embedders
            .iter()
            .filter_map(|e| e.frozen_prefix().map(str::to_string))
            .collect()
    }
}

impl Embedder for EmbedderStack {
    fn embed(&self, batch: &Batch, train: bool) -> Result<Tensor> {
        let parts = self
            .embedders
            .iter()
            .map(|e| e.embed(batch, train))
            .collect::<Result<Vec<_>>>()?;
        Ok(Tensor::cat(&parts, 2)?)
    }

    fn output_dim(&self) -> usize {
        self.embedders.iter().map(|e| e.output_dim()).sum()
    }

    fn name(&self) -> &'static str {
        "EmbedderStack"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ComponentConfig;
    use crate::data::Sentence;
    use crate::labels::LabelSet;
    use crate::vocab::Vocabularies;
    use candle_core::{DType, Device};
    use candle_nn::{VarBuilder, VarMap};

    fn fixture() -> (Vocabularies, LabelSet, Batch) {
        let corpus = vec![vec!["Cu", "is", "a", "metal"], vec!["Fe", "rusts"]];
        let vocab = Vocabularies::build(&corpus, None, 1);
        let labels = LabelSet::bioul(&["MATERIAL".to_string()]).unwrap();
        let a = Sentence::new(&corpus[0], None, &vocab).unwrap();
        let b = Sentence::new(&corpus[1], None, &vocab).unwrap();
        let batch = Batch::from_sentences(&[&a, &b], &labels, &Device::Cpu).unwrap();
        (vocab, labels, batch)
    }

    fn word(dim: usize) -> EmbedderConfig {
        EmbedderConfig::Word(WordEmbedderConfig {
            embedding_type: None,
            embedding_dim: dim,
            trainable: true,
        })
    }

    fn chars(hidden: usize) -> EmbedderConfig {
        EmbedderConfig::Char(CharEmbedderConfig {
            char_embedding_dimension: 4,
            hidden_dimension: hidden,
            bidirectional: true,
        })
    }

    #[test]
    fn test_embedding_type_infers_dimension() {
        let node = ComponentConfig::new("WordEmbedder").with("embedding_type", "glove_6B_100");
        let config = WordEmbedderConfig::from_params(&node.at("e")).unwrap();
        assert_eq!(config.embedding_dim, 100);

        let node = ComponentConfig::new("WordEmbedder").with("embedding_type", "random");
        let err = WordEmbedderConfig::from_params(&node.at("e")).unwrap_err();
        assert!(matches!(
            err,
            ConfigError::MissingParameter { ref field } if field == "e.embedding_dim"
        ));

        let node = node.with("embedding_type", "glove_6B_50").with("embedding_dim", 100);
        assert!(WordEmbedderConfig::from_params(&node.at("e")).is_err());
    }

    #[test]
    fn test_stack_dimension_is_sum_in_any_order() {
        let (vocab, labels, batch) = fixture();
        for order in [vec![word(6), chars(3)], vec![chars(3), word(6)]] {
            let varmap = VarMap::new();
            let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
            let ctx = AssemblyContext::new(&vocab, &labels, vb);
            let embedders = order
                .iter()
                .enumerate()
                .map(|(i, c)| c.build(&ctx.pp(format!("embedder_{i}"))))
                .collect::<Result<Vec<_>>>()
                .unwrap();
            let stack = EmbedderStack::new(embedders);

            assert_eq!(stack.output_dim(), 12);
            let out = stack.embed(&batch, false).unwrap();
            assert_eq!(out.dims(), &[2, 4, 12]);
        }
    }

    #[test]
    fn test_frozen_word_table_reports_prefix() {
        let (vocab, labels, _) = fixture();
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
        let ctx = AssemblyContext::new(&vocab, &labels, vb);
        let frozen = WordEmbedderConfig {
            embedding_type: None,
            embedding_dim: 4,
            trainable: false,
        };
        let stack = EmbedderStack::new(vec![
            EmbedderConfig::Word(frozen).build(&ctx.pp("embedder_0")).unwrap(),
            chars(2).build(&ctx.pp("embedder_1")).unwrap(),
        ]);
        assert_eq!(stack.frozen_prefixes(), vec!["embedder_0".to_string()]);
        assert_eq!(stack.names(), vec!["WordEmbedder", "CharEmbedder"]);
    }
}

//! # Model Assembler
//!
//! Turns a `{class, params}` configuration tree into live components.
//! Every role has a [`Registry`] from class name to factory function, so a
//! node is resolved purely by its declared class and nested shape.

use std::collections::BTreeMap;

use candle_core::Device;
use candle_nn::VarBuilder;
use tracing::debug;

use crate::config::{ComponentConfig, Params};
use crate::error::{ConfigError, Result};
use crate::labels::LabelSet;
use crate::model::{
    CharEmbedderConfig, Embedder, EmbedderConfig, EmbedderStack, Lstm2SeqEncoder,
    Lstm2SeqEncoderConfig, RnnSeqCrfTagger, RnnSeqCrfTaggerConfig, SeqEncoder, Tagger,
    WordEmbedderConfig,
};
use crate::vocab::Vocabularies;

/// Class-name keyed table of factories for one component role.
#[derive(Debug, Clone)]
pub struct Registry<F> {
    role: &'static str,
    entries: BTreeMap<String, F>,
}

impl<F: Copy> Registry<F> {
    pub fn new(role: &'static str) -> Self {
        Self {
            role,
            entries: BTreeMap::new(),
        }
    }

    /// Register (or replace) the factory for `class`.
    pub fn register(&mut self, class: impl Into<String>, factory: F) -> &mut Self {
        self.entries.insert(class.into(), factory);
        self
    }

    pub fn resolve(&self, class: &str) -> std::result::Result<F, ConfigError> {
        self.entries
            .get(class)
            .copied()
            .ok_or_else(|| ConfigError::UnknownComponent {
                role: self.role,
                class: class.to_string(),
            })
    }

    pub fn role(&self) -> &'static str {
        self.role
    }

    pub fn classes(&self) -> impl Iterator<Item = &str> {
        self.entries.keys().map(String::as_str)
    }
}

/// Shared inputs of every constructor: vocabularies, label set and the
/// variable builder scoped to the component being built.
#[derive(Clone)]
pub struct AssemblyContext<'a> {
    vocab: &'a Vocabularies,
    labels: &'a LabelSet,
    vb: VarBuilder<'a>,
    prefix: String,
}

impl<'a> AssemblyContext<'a> {
    pub fn new(vocab: &'a Vocabularies, labels: &'a LabelSet, vb: VarBuilder<'a>) -> Self {
        Self {
            vocab,
            labels,
            vb,
            prefix: String::new(),
        }
    }

    /// Context for a child component, variables named under `name`.
    pub fn pp(&self, name: impl ToString) -> Self {
        let name = name.to_string();
        let prefix = if self.prefix.is_empty() {
            name.clone()
        } else {
            format!("{}.{}", self.prefix, name)
        };
        Self {
            vocab: self.vocab,
            labels: self.labels,
            vb: self.vb.pp(name),
            prefix,
        }
    }

    pub fn vocab(&self) -> &'a Vocabularies {
        self.vocab
    }

    pub fn labels(&self) -> &'a LabelSet {
        self.labels
    }

    pub fn vb(&self) -> VarBuilder<'a> {
        self.vb.clone()
    }

    /// Dotted variable prefix of this context.
    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    pub fn device(&self) -> &Device {
        self.vb.device()
    }
}

pub type EmbedderFactory = fn(&Params<'_>) -> std::result::Result<EmbedderConfig, ConfigError>;
pub type EncoderFactory =
    fn(&Params<'_>, &ModelAssembler, &AssemblyContext<'_>) -> Result<Box<dyn SeqEncoder>>;
pub type TaggerFactory =
    fn(&Params<'_>, &ModelAssembler, &AssemblyContext<'_>) -> Result<Box<dyn Tagger>>;

/// Registries for the embedder, encoder and tagger roles.
#[derive(Debug, Clone)]
pub struct ModelAssembler {
    pub embedders: Registry<EmbedderFactory>,
    pub encoders: Registry<EncoderFactory>,
    pub taggers: Registry<TaggerFactory>,
}

impl Default for ModelAssembler {
    fn default() -> Self {
        let mut embedders = Registry::<EmbedderFactory>::new("embedder");
        embedders
            .register("WordEmbedder", |p| {
                WordEmbedderConfig::from_params(p).map(EmbedderConfig::Word)
            })
            .register("CharEmbedder", |p| {
                CharEmbedderConfig::from_params(p).map(EmbedderConfig::Char)
            });

        let mut encoders = Registry::<EncoderFactory>::new("encoder");
        encoders.register("Lstm2SeqEncoder", build_lstm2seq);

        let mut taggers = Registry::<TaggerFactory>::new("tagger");
        taggers.register("RnnSeqCrfTagger", build_rnn_seq_crf);

        Self {
            embedders,
            encoders,
            taggers,
        }
    }
}

impl ModelAssembler {
    /// Resolve one embedder node into its tagged configuration.
    pub fn embedder_config(
        &self,
        node: &ComponentConfig,
        path: &str,
    ) -> std::result::Result<EmbedderConfig, ConfigError> {
        let factory = self.embedders.resolve(&node.class)?;
        factory(&node.at(path))
    }

    /// Build the embedder list stored under `key`, in declared order.
    pub fn build_embedders(
        &self,
        params: &Params<'_>,
        key: &str,
        ctx: &AssemblyContext<'_>,
    ) -> Result<EmbedderStack> {
        let nodes = params.components(key)?;
        if nodes.is_empty() {
            return Err(
                ConfigError::invalid(params.field(key), "at least one embedder is required").into(),
            );
        }

        let mut embedders: Vec<Box<dyn Embedder>> = Vec::with_capacity(nodes.len());
        for (i, (node, path)) in nodes.iter().enumerate() {
            let config = self.embedder_config(node, path)?;
            debug!(class = %node.class, dim = config.output_dim(), "assembling embedder");
            embedders.push(config.build(&ctx.pp(format!("embedder_{i}")))?);
        }
        Ok(EmbedderStack::new(embedders))
    }

    pub fn build_encoder(
        &self,
        node: &ComponentConfig,
        path: &str,
        ctx: &AssemblyContext<'_>,
    ) -> Result<Box<dyn SeqEncoder>> {
        let factory = self.encoders.resolve(&node.class)?;
        debug!(class = %node.class, path, "assembling encoder");
        factory(&node.at(path), self, ctx)
    }

    /// Build the complete tagger described by the `model` section.
    pub fn assemble(
        &self,
        model: &ComponentConfig,
        ctx: &AssemblyContext<'_>,
    ) -> Result<Box<dyn Tagger>> {
        let factory = self.taggers.resolve(&model.class)?;
        let tagger = factory(&model.at("model"), self, ctx)?;
        debug!(
            class = %model.class,
            num_labels = tagger.num_labels(),
            "assembled tagger"
        );
        Ok(tagger)
    }
}

fn build_lstm2seq(
    params: &Params<'_>,
    assembler: &ModelAssembler,
    ctx: &AssemblyContext<'_>,
) -> Result<Box<dyn SeqEncoder>> {
    let config = Lstm2SeqEncoderConfig::from_params(params)?;
    let embedder = assembler.build_embedders(params, "embedder", ctx)?;
    Ok(Box::new(Lstm2SeqEncoder::new(config, embedder, ctx)?))
}

fn build_rnn_seq_crf(
    params: &Params<'_>,
    assembler: &ModelAssembler,
    ctx: &AssemblyContext<'_>,
) -> Result<Box<dyn Tagger>> {
    let config = RnnSeqCrfTaggerConfig::from_params(params)?;
    let (node, path) = params.component("rnn2seqencoder")?;
    let encoder = assembler.build_encoder(&node, &path, &ctx.pp("encoder"))?;
    Ok(Box::new(RnnSeqCrfTagger::new(&config, encoder, ctx)?))
}

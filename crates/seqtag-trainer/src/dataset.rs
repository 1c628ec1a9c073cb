//! CoNLL column data: a line reader and the dataset manager that turns the
//! three splits into padded batches.

use std::fs::File;
use std::io::{self, BufRead, BufReader};
use std::path::Path;

use candle_core::Device;
use seqtag_core::config::Config;
use seqtag_core::{
    Batch, ConfigError, LabelSet, Result, Sentence, TaggingScheme, Vocabularies, bio_to_bioul,
};
use tracing::{debug, info};

use crate::context::TrainingContext;

const DOCSTART: &str = "-DOCSTART-";

/// One annotated sentence as read from disk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaggedSentence {
    pub tokens: Vec<String>,
    pub tags: Vec<String>,
}

impl TaggedSentence {
    pub fn new<S: AsRef<str>>(tokens: &[S], tags: &[S]) -> Self {
        Self {
            tokens: tokens.iter().map(|t| t.as_ref().to_string()).collect(),
            tags: tags.iter().map(|t| t.as_ref().to_string()).collect(),
        }
    }
}

/// Load a CoNLL file: whitespace-separated columns, token first and tag
/// last. Blank lines and `-DOCSTART-` lines end a sentence.
pub fn load_conll<P: AsRef<Path>>(path: P) -> Result<Vec<TaggedSentence>> {
    let path = path.as_ref();
    let file = File::open(path).map_err(|err| {
        io::Error::new(err.kind(), format!("cannot open {}: {err}", path.display()))
    })?;
    let sentences = parse_conll(BufReader::new(file), &path.display().to_string())?;
    debug!(path = %path.display(), sentences = sentences.len(), "loaded CoNLL file");
    Ok(sentences)
}

/// Parse CoNLL lines from any reader. `source` only labels error messages.
pub fn parse_conll<R: BufRead>(reader: R, source: &str) -> Result<Vec<TaggedSentence>> {
    let mut sentences = Vec::new();
    let mut tokens = Vec::new();
    let mut tags = Vec::new();

    for (lineno, line) in reader.lines().enumerate() {
        let line = line?;
        let line = line.trim();

        if line.is_empty() || line.starts_with(DOCSTART) {
            if !tokens.is_empty() {
                sentences.push(TaggedSentence {
                    tokens: std::mem::take(&mut tokens),
                    tags: std::mem::take(&mut tags),
                });
            }
            continue;
        }

        let columns: Vec<&str> = line.split_whitespace().collect();
        if columns.len() < 2 {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!(
                    "{source}:{}: expected a token and a tag column, found `{line}`",
                    lineno + 1
                ),
            )
            .into());
        }
        tokens.push(columns[0].to_string());
        tags.push(columns[columns.len() - 1].to_string());
    }

    if !tokens.is_empty() {
        sentences.push(TaggedSentence { tokens, tags });
    }

    Ok(sentences)
}

/// Convert BIO-annotated sentences to BIOUL when the label set asks for it.
/// A split that already uses `U-`/`L-` tags is left as it is.
pub(crate) fn normalize_scheme(sentences: &mut [TaggedSentence], scheme: TaggingScheme) {
    if scheme != TaggingScheme::Bioul {
        return;
    }
    let already_bioul = sentences
        .iter()
        .flat_map(|s| &s.tags)
        .any(|tag| tag.starts_with("U-") || tag.starts_with("L-"));
    if already_bioul {
        return;
    }
    for sentence in sentences {
        sentence.tags = bio_to_bioul(&sentence.tags);
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Split {
    Train,
    Dev,
    Test,
}

impl Split {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Train => "train",
            Self::Dev => "dev",
            Self::Test => "test",
        }
    }
}

/// Owns the three splits, the vocabularies built from the training split
/// and the label set; hands out padded batches.
#[derive(Debug, Clone)]
pub struct CoNLLDatasetManager {
    labels: LabelSet,
    vocab: Vocabularies,
    batch_size: usize,
    train: Vec<Sentence>,
    dev: Vec<Sentence>,
    test: Vec<Sentence>,
}

impl CoNLLDatasetManager {
    pub const CLASS: &'static str = "CoNLLDatasetManager";

    /// Read the files named by `dataset` and build vocabularies.
    pub fn from_config(config: &Config) -> Result<Self> {
        let dataset = &config.dataset;
        if dataset.class != Self::CLASS {
            return Err(ConfigError::UnknownComponent {
                role: "dataset",
                class: dataset.class.clone(),
            }
            .into());
        }
        let manager = Self::from_splits(
            config.label_set()?,
            config.engine.batch_size,
            load_conll(&dataset.train_filename)?,
            load_conll(&dataset.dev_filename)?,
            load_conll(&dataset.test_filename)?,
            dataset.max_num_words,
            dataset.min_count,
        )?;
        Ok(manager.with_truncation(dataset.max_length, dataset.max_char_length))
    }

    /// Build from already-read splits. Vocabularies come from `train` only.
    pub fn from_splits(
        labels: LabelSet,
        batch_size: usize,
        mut train: Vec<TaggedSentence>,
        mut dev: Vec<TaggedSentence>,
        mut test: Vec<TaggedSentence>,
        max_num_words: Option<usize>,
        min_count: usize,
    ) -> Result<Self> {
        let token_lists: Vec<Vec<String>> = train.iter().map(|s| s.tokens.clone()).collect();
        let vocab = Vocabularies::build(&token_lists, max_num_words, min_count);
        Self::with_vocab(labels, vocab, batch_size, &mut train, &mut dev, &mut test)
    }

    /// Build around an existing vocabulary, e.g. one restored from a checkpoint.
    pub fn with_vocab(
        labels: LabelSet,
        vocab: Vocabularies,
        batch_size: usize,
        train: &mut [TaggedSentence],
        dev: &mut [TaggedSentence],
        test: &mut [TaggedSentence],
    ) -> Result<Self> {
        if batch_size == 0 {
            return Err(ConfigError::invalid("engine.batch_size", "must be greater than 0").into());
        }

        let convert = |split: &mut [TaggedSentence]| -> Result<Vec<Sentence>> {
            normalize_scheme(split, labels.scheme());
            split
                .iter()
                .map(|s| {
                    labels.encode(&s.tags)?;
                    Sentence::new(&s.tokens, Some(s.tags.clone()), &vocab)
                })
                .collect()
        };
        let train = convert(train)?;
        let dev = convert(dev)?;
        let test = convert(test)?;

        info!(
            train = train.len(),
            dev = dev.len(),
            test = test.len(),
            words = vocab.words.len(),
            chars = vocab.chars.len(),
            labels = labels.len(),
            "dataset ready"
        );
        Ok(Self {
            labels,
            vocab,
            batch_size,
            train,
            dev,
            test,
        })
    }

    /// Cut every sentence of every split to `max_length` tokens and every
    /// token to `max_chars` characters. Vocabularies are not rebuilt.
    pub fn with_truncation(mut self, max_length: Option<usize>, max_chars: Option<usize>) -> Self {
        if max_length.is_none() && max_chars.is_none() {
            return self;
        }
        for split in [Split::Train, Split::Dev, Split::Test] {
            let sentences = match split {
                Split::Train => &mut self.train,
                Split::Dev => &mut self.dev,
                Split::Test => &mut self.test,
            };
            let truncated = sentences
                .iter_mut()
                .map(|sentence| sentence.truncate(max_length, max_chars))
                .filter(|&changed| changed)
                .count();
            if truncated > 0 {
                info!(
                    split = split.as_str(),
                    truncated,
                    ?max_length,
                    ?max_chars,
                    "truncated sentences"
                );
            }
        }
        self
    }

    pub fn labels(&self) -> &LabelSet {
        &self.labels
    }

    pub fn vocab(&self) -> &Vocabularies {
        &self.vocab
    }

    pub fn batch_size(&self) -> usize {
        self.batch_size
    }

    pub fn sentences(&self, split: Split) -> &[Sentence] {
        match split {
            Split::Train => &self.train,
            Split::Dev => &self.dev,
            Split::Test => &self.test,
        }
    }

    /// Padded batches over `split`. The last batch may be smaller. When
    /// `shuffle` is set the sentence order is permuted with the context RNG.
    pub fn batches(
        &self,
        split: Split,
        ctx: &mut TrainingContext,
        shuffle: bool,
    ) -> Result<Vec<Batch>> {
        let sentences = self.sentences(split);
        let mut order: Vec<usize> = (0..sentences.len()).collect();
        if shuffle {
            ctx.shuffle(&mut order);
        }
        batch_in_order(sentences, &order, self.batch_size, &self.labels, ctx.device())
    }
}

fn batch_in_order(
    sentences: &[Sentence],
    order: &[usize],
    batch_size: usize,
    labels: &LabelSet,
    device: &Device,
) -> Result<Vec<Batch>> {
    order
        .chunks(batch_size)
        .map(|chunk| {
            let members: Vec<&Sentence> = chunk.iter().map(|&i| &sentences[i]).collect();
            Batch::from_sentences(&members, labels, device)
        })
        .collect()
}

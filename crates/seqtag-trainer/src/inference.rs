//! Tagging new text with a trained checkpoint, and scoring it against an
//! annotated split.

use std::path::{Path, PathBuf};

use candle_core::{DType, Device};
use candle_nn::{VarBuilder, VarMap};
use seqtag_core::config::Config;
use seqtag_core::{
    AssemblyContext, Batch, ConfusionMatrix, ForwardMode, LabelSet, Metric, MetricReport,
    ModelAssembler, PrecisionRecallFMeasure, Result, SeqTagError, Sentence, Span, Tagger,
    TokenClassificationAccuracy, TypeScores, Vocabularies, WordTokenizer,
};
use tracing::info;

use crate::checkpoint::CheckpointStore;
use crate::context::resolve_device;
use crate::dataset::{TaggedSentence, load_conll, normalize_scheme};

/// Labels and spans predicted for one sentence.
#[derive(Debug, Clone, PartialEq)]
pub struct Prediction {
    pub tokens: Vec<String>,
    pub labels: Vec<String>,
    pub spans: Vec<Span>,
    /// Viterbi score of the returned path.
    pub score: f32,
    /// Byte ranges of the tokens when the input was raw text.
    pub offsets: Option<Vec<(usize, usize)>>,
}

/// Gold and predicted labels of one annotated sentence.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EvaluatedSentence {
    pub tokens: Vec<String>,
    pub gold: Vec<String>,
    pub predicted: Vec<String>,
}

impl EvaluatedSentence {
    pub fn is_correct(&self) -> bool {
        self.gold == self.predicted
    }

    /// Whether some token tagged `gold` was predicted as `predicted`.
    pub fn confuses(&self, gold: &str, predicted: &str) -> bool {
        self.gold
            .iter()
            .zip(&self.predicted)
            .any(|(g, p)| g == gold && p == predicted)
    }
}

/// Outcome of tagging an annotated split.
#[derive(Debug, Clone)]
pub struct SplitEvaluation {
    pub sentences: Vec<EvaluatedSentence>,
    pub accuracy: f64,
    pub spans: PrecisionRecallFMeasure,
    pub confusion: ConfusionMatrix,
}

impl SplitEvaluation {
    pub fn true_labels(&self) -> Vec<&[String]> {
        self.sentences.iter().map(|s| s.gold.as_slice()).collect()
    }

    pub fn predicted_labels(&self) -> Vec<&[String]> {
        self.sentences.iter().map(|s| s.predicted.as_slice()).collect()
    }

    /// Span scores plus token `accuracy`, keyed like the training metrics.
    pub fn report(&self) -> MetricReport {
        let mut report = self.spans.compute();
        report.insert("accuracy".into(), self.accuracy);
        report
    }

    pub fn type_scores(&self) -> Vec<TypeScores> {
        self.spans.type_scores()
    }

    /// Sentences in which a token tagged `gold` was predicted as `predicted`.
    pub fn misclassified(&self, gold: &str, predicted: &str) -> Vec<&EvaluatedSentence> {
        self.sentences
            .iter()
            .filter(|s| s.confuses(gold, predicted))
            .collect()
    }
}

/// A tagger rebuilt from its configuration and checkpoint, in eval mode.
pub struct SequenceTaggerInference {
    model: Box<dyn Tagger>,
    vocab: Vocabularies,
    labels: LabelSet,
    device: Device,
    tokenizer: WordTokenizer,
    test_path: PathBuf,
    batch_size: usize,
    max_chars: Option<usize>,
    _varmap: VarMap,
}

impl SequenceTaggerInference {
    pub fn from_checkpoint(config: &Config, dir: impl AsRef<Path>) -> Result<Self> {
        let dir = dir.as_ref();
        let device = resolve_device(&config.engine.device)?;
        let labels = config.label_set()?;
        let loaded = CheckpointStore::load(dir, &device)?;
        let vocab = loaded.vocab.clone();

        let mut varmap = VarMap::new();
        let model = {
            let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);
            let ctx = AssemblyContext::new(&vocab, &labels, vb);
            ModelAssembler::default().assemble(&config.model, &ctx)?
        };
        loaded.apply_to(&mut varmap)?;

        info!(
            path = %dir.display(),
            epoch = loaded.manifest.epoch,
            labels = labels.len(),
            "loaded tagger for inference"
        );
        Ok(Self {
            model,
            vocab,
            labels,
            device,
            tokenizer: WordTokenizer::new()?,
            test_path: config.dataset.test_filename.clone(),
            batch_size: config.engine.batch_size,
            max_chars: config.dataset.max_char_length,
            _varmap: varmap,
        })
    }

    pub fn labels(&self) -> &LabelSet {
        &self.labels
    }

    /// Tag pre-tokenized input.
    pub fn predict_tokens<S: AsRef<str>>(&self, tokens: &[S]) -> Result<Prediction> {
        let mut predictions = self.predict_batch(&[tokens])?;
        predictions.pop().ok_or(SeqTagError::EmptyInput)
    }

    /// Tag several pre-tokenized sentences in one padded batch.
    pub fn predict_batch<S: AsRef<str>>(&self, sentences: &[&[S]]) -> Result<Vec<Prediction>> {
        if sentences.is_empty() || sentences.iter().any(|s| s.is_empty()) {
            return Err(SeqTagError::EmptyInput);
        }
        let sentences: Vec<Sentence> = sentences
            .iter()
            .map(|&tokens| self.sentence(tokens, None))
            .collect::<Result<_>>()?;
        let refs: Vec<&Sentence> = sentences.iter().collect();
        let batch = Batch::from_sentences(&refs, &self.labels, &self.device)?;
        let output = self.model.forward(&batch, ForwardMode::Predict)?;

        Ok(sentences
            .iter()
            .zip(output.predictions)
            .zip(output.path_scores)
            .map(|((sentence, ids), score)| Prediction {
                tokens: sentence.tokens.iter().map(|t| t.text().to_string()).collect(),
                labels: self.labels.decode(&ids),
                spans: self.labels.spans(&ids),
                score,
                offsets: None,
            })
            .collect())
    }

    /// Tokenize raw text with the word tokenizer and tag it.
    pub fn predict_text(&self, text: &str) -> Result<Prediction> {
        let tokens = self.tokenizer.tokenize(text);
        if tokens.is_empty() {
            return Err(SeqTagError::EmptyInput);
        }
        let words: Vec<&str> = tokens.iter().map(|t| t.text.as_str()).collect();
        let mut prediction = self.predict_tokens(&words)?;
        prediction.offsets = Some(tokens.iter().map(|t| (t.start, t.end)).collect());
        Ok(prediction)
    }

    /// Tag the configured test file and score it.
    pub fn evaluate_test_split(&self) -> Result<SplitEvaluation> {
        let sentences = load_conll(&self.test_path)?;
        self.evaluate(&sentences)
    }

    /// Tag annotated sentences in batches of `engine.batch_size` and compare
    /// every token with its gold tag. BIO tags are converted first when the
    /// label set is BIOUL.
    pub fn evaluate(&self, annotated: &[TaggedSentence]) -> Result<SplitEvaluation> {
        let mut annotated = annotated.to_vec();
        annotated.retain(|s| !s.tokens.is_empty());
        normalize_scheme(&mut annotated, self.labels.scheme());

        let mut accuracy = TokenClassificationAccuracy::new();
        let mut spans = PrecisionRecallFMeasure::new(self.labels.clone());
        let mut confusion = ConfusionMatrix::new(self.labels.clone());
        let mut evaluated = Vec::with_capacity(annotated.len());

        for chunk in annotated.chunks(self.batch_size.max(1)) {
            let sentences: Vec<Sentence> = chunk
                .iter()
                .map(|s| self.sentence(&s.tokens, Some(s.tags.clone())))
                .collect::<Result<_>>()?;
            let refs: Vec<&Sentence> = sentences.iter().collect();
            let batch = Batch::from_sentences(&refs, &self.labels, &self.device)?;
            let gold = batch
                .gold()?
                .ok_or_else(|| SeqTagError::shape("evaluation batch carries no gold labels"))?;
            let output = self.model.forward(&batch, ForwardMode::Predict)?;
            let mask = batch.mask_rows();

            accuracy.update(&output.predictions, &gold, &mask)?;
            spans.update(&output.predictions, &gold, &mask)?;
            confusion.update(&output.predictions, &gold, &mask)?;

            for ((source, predicted), gold) in chunk.iter().zip(&output.predictions).zip(&gold) {
                evaluated.push(EvaluatedSentence {
                    tokens: source.tokens.clone(),
                    gold: self.labels.decode(gold),
                    predicted: self.labels.decode(predicted),
                });
            }
        }

        let evaluation = SplitEvaluation {
            sentences: evaluated,
            accuracy: accuracy.accuracy(),
            spans,
            confusion,
        };
        let report = evaluation.report();
        info!(
            sentences = evaluation.sentences.len(),
            tokens = evaluation.confusion.total(),
            accuracy = evaluation.accuracy,
            macro_fscore = report.get("macro_fscore").copied().unwrap_or(0.0),
            "evaluated annotated split"
        );
        Ok(evaluation)
    }

    fn sentence<S: AsRef<str>>(
        &self,
        tokens: &[S],
        labels: Option<Vec<String>>,
    ) -> Result<Sentence> {
        let mut sentence = Sentence::new(tokens, labels, &self.vocab)?;
        sentence.truncate(None, self.max_chars);
        Ok(sentence)
    }
}

//! # Tagging Metrics
//!
//! Running statistics over predicted and gold label id sequences. Metrics
//! are built from `engine.metric` through their own [`Registry`].

use std::collections::{BTreeMap, HashSet};

use crate::assembler::Registry;
use crate::config::{ComponentConfig, Params};
use crate::error::{Result, SeqTagError};
use crate::labels::{LabelSet, Span};

/// Named scalar results of a metric, in stable key order.
pub type MetricReport = BTreeMap<String, f64>;

/// A running metric over batches of label sequences.
///
/// `mask[b][t]` marks the real tokens of sentence `b`; prediction and gold
/// rows must cover every masked position.
pub trait Metric {
    fn update(
        &mut self,
        predictions: &[Vec<usize>],
        gold: &[Vec<usize>],
        mask: &[Vec<bool>],
    ) -> Result<()>;

    fn compute(&self) -> MetricReport;

    fn reset(&mut self);

    fn name(&self) -> &'static str;
}

/// The (prediction, gold) labels at the masked positions of every row.
fn masked_rows(
    predictions: &[Vec<usize>],
    gold: &[Vec<usize>],
    mask: &[Vec<bool>],
) -> Result<Vec<(Vec<usize>, Vec<usize>)>> {
    if predictions.len() != gold.len() || gold.len() != mask.len() {
        return Err(SeqTagError::shape(format!(
            "metric batch sizes differ: {} predictions, {} gold, {} mask rows",
            predictions.len(),
            gold.len(),
            mask.len()
        )));
    }

    predictions
        .iter()
        .zip(gold)
        .zip(mask)
        .map(|((pred, gold), mask)| {
            mask.iter()
                .enumerate()
                .filter(|&(_, &real)| real)
                .map(|(t, _)| match (pred.get(t), gold.get(t)) {
                    (Some(&p), Some(&g)) => Ok((p, g)),
                    _ => Err(SeqTagError::shape(format!(
                        "masked position {t} lies beyond {} predictions or {} gold labels",
                        pred.len(),
                        gold.len()
                    ))),
                })
                .collect::<Result<(Vec<usize>, Vec<usize>)>>()
        })
        .collect()
}

/// Fraction of non-padded positions whose prediction equals the gold label.
#[derive(Debug, Clone, Default)]
pub struct TokenClassificationAccuracy {
    correct: usize,
    total: usize,
}

impl TokenClassificationAccuracy {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn accuracy(&self) -> f64 {
        if self.total == 0 {
            0.0
        } else {
            self.correct as f64 / self.total as f64
        }
    }
}

impl Metric for TokenClassificationAccuracy {
    fn update(
        &mut self,
        predictions: &[Vec<usize>],
        gold: &[Vec<usize>],
        mask: &[Vec<bool>],
    ) -> Result<()> {
        for (pred, gold) in masked_rows(predictions, gold, mask)? {
            self.correct += pred.iter().zip(&gold).filter(|(p, g)| p == g).count();
            self.total += gold.len();
        }
        Ok(())
    }

    fn compute(&self) -> MetricReport {
        MetricReport::from([("accuracy".to_string(), self.accuracy())])
    }

    fn reset(&mut self) {
        *self = Self::default();
    }

    fn name(&self) -> &'static str {
        "TokenClassificationAccuracy"
    }
}

#[derive(Debug, Clone, Copy, Default)]
struct Counts {
    tp: usize,
    fp: usize,
    fn_: usize,
}

impl Counts {
    fn precision(&self) -> f64 {
        ratio(self.tp, self.tp + self.fp)
    }

    fn recall(&self) -> f64 {
        ratio(self.tp, self.tp + self.fn_)
    }

    fn fscore(&self) -> f64 {
        let (p, r) = (self.precision(), self.recall());
        if p + r == 0.0 { 0.0 } else { 2.0 * p * r / (p + r) }
    }
}

fn ratio(num: usize, den: usize) -> f64 {
    if den == 0 { 0.0 } else { num as f64 / den as f64 }
}

/// Span scores of one entity type.
#[derive(Debug, Clone, PartialEq)]
pub struct TypeScores {
    pub entity: String,
    pub precision: f64,
    pub recall: f64,
    pub fscore: f64,
    /// Gold spans of this type.
    pub support: usize,
}

/// Exact-match span precision, recall and F1 over the label set's spans.
#[derive(Debug, Clone)]
pub struct PrecisionRecallFMeasure {
    labels: LabelSet,
    per_type: BTreeMap<String, Counts>,
}

impl PrecisionRecallFMeasure {
    pub fn new(labels: LabelSet) -> Self {
        let per_type = labels
            .entity_types()
            .iter()
            .map(|t| (t.clone(), Counts::default()))
            .collect();
        Self { labels, per_type }
    }

    /// Precision, recall, F1 and support of every entity type.
    pub fn type_scores(&self) -> Vec<TypeScores> {
        self.per_type
            .iter()
            .map(|(entity, counts)| TypeScores {
                entity: entity.clone(),
                precision: counts.precision(),
                recall: counts.recall(),
                fscore: counts.fscore(),
                support: counts.tp + counts.fn_,
            })
            .collect()
    }

    /// Fixed-width table of [`type_scores`](Self::type_scores) followed by
    /// the micro and macro averages.
    pub fn render_table(&self) -> String {
        let report = self.compute();
        let width = self
            .per_type
            .keys()
            .map(String::len)
            .chain([5])
            .max()
            .unwrap_or(5);
        let mut table = format!(
            "{:<width$} {:>9} {:>9} {:>9} {:>9}\n",
            "type", "precision", "recall", "fscore", "support"
        );
        for row in self.type_scores() {
            table.push_str(&format!(
                "{:<width$} {:>9.4} {:>9.4} {:>9.4} {:>9}\n",
                row.entity, row.precision, row.recall, row.fscore, row.support
            ));
        }
        let total = self.total();
        table.push_str(&format!(
            "{:<width$} {:>9.4} {:>9.4} {:>9.4} {:>9}\n",
            "micro",
            total.precision(),
            total.recall(),
            total.fscore(),
            total.tp + total.fn_
        ));
        table.push_str(&format!(
            "{:<width$} {:>9} {:>9} {:>9.4} {:>9}\n",
            "macro",
            "",
            "",
            report.get("macro_fscore").copied().unwrap_or(0.0),
            ""
        ));
        table
    }

    fn total(&self) -> Counts {
        self.per_type.values().fold(Counts::default(), |acc, c| Counts {
            tp: acc.tp + c.tp,
            fp: acc.fp + c.fp,
            fn_: acc.fn_ + c.fn_,
        })
    }
}

impl Metric for PrecisionRecallFMeasure {
    fn update(
        &mut self,
        predictions: &[Vec<usize>],
        gold: &[Vec<usize>],
        mask: &[Vec<bool>],
    ) -> Result<()> {
        for (pred, gold) in masked_rows(predictions, gold, mask)? {
            let predicted: HashSet<Span> = self.labels.spans(&pred).into_iter().collect();
            let expected: HashSet<Span> = self.labels.spans(&gold).into_iter().collect();

            for span in &predicted {
                let counts = self.per_type.entry(span.entity.clone()).or_default();
                if expected.contains(span) {
                    counts.tp += 1;
                } else {
                    counts.fp += 1;
                }
            }
            for span in expected.difference(&predicted) {
                self.per_type.entry(span.entity.clone()).or_default().fn_ += 1;
            }
        }
        Ok(())
    }

    fn compute(&self) -> MetricReport {
        let total = self.total();
        let mut report = MetricReport::new();
        report.insert("precision".into(), total.precision());
        report.insert("recall".into(), total.recall());
        report.insert("micro_fscore".into(), total.fscore());

        let macro_f = if self.per_type.is_empty() {
            0.0
        } else {
            self.per_type.values().map(Counts::fscore).sum::<f64>() / self.per_type.len() as f64
        };
        report.insert("macro_fscore".into(), macro_f);
        for (entity, counts) in &self.per_type {
            report.insert(format!("fscore_{entity}"), counts.fscore());
        }
        report
    }

    fn reset(&mut self) {
        for counts in self.per_type.values_mut() {
            *counts = Counts::default();
        }
    }

    fn name(&self) -> &'static str {
        "PrecisionRecallFMeasure"
    }
}

/// Token-level counts of (gold label, predicted label) pairs.
#[derive(Debug, Clone)]
pub struct ConfusionMatrix {
    labels: LabelSet,
    counts: Vec<Vec<usize>>,
}

impl ConfusionMatrix {
    pub fn new(labels: LabelSet) -> Self {
        let n = labels.len();
        Self {
            labels,
            counts: vec![vec![0; n]; n],
        }
    }

    /// Add the masked positions of a batch.
    pub fn update(
        &mut self,
        predictions: &[Vec<usize>],
        gold: &[Vec<usize>],
        mask: &[Vec<bool>],
    ) -> Result<()> {
        let n = self.counts.len();
        for (pred, gold) in masked_rows(predictions, gold, mask)? {
            for (&p, &g) in pred.iter().zip(&gold) {
                if p >= n || g >= n {
                    return Err(SeqTagError::shape(format!(
                        "label id {} outside the {n} known labels",
                        p.max(g)
                    )));
                }
                self.counts[g][p] += 1;
            }
        }
        Ok(())
    }

    /// How often `gold` was predicted as `predicted`. Unknown labels count zero.
    pub fn count(&self, gold: &str, predicted: &str) -> usize {
        match (self.labels.index_of(gold), self.labels.index_of(predicted)) {
            (Some(g), Some(p)) => self.counts[g][p],
            _ => 0,
        }
    }

    /// Total number of counted tokens.
    pub fn total(&self) -> usize {
        self.counts.iter().flatten().sum()
    }

    /// Gold labels down the rows, predictions across the columns.
    pub fn render_table(&self) -> String {
        let names = self.labels.decode(&(0..self.counts.len()).collect::<Vec<_>>());
        let width = names.iter().map(String::len).chain([9]).max().unwrap_or(9);

        let mut table = format!("{:<width$}", "gold\\pred");
        for name in &names {
            table.push_str(&format!(" {name:>width$}"));
        }
        table.push('\n');
        for (name, row) in names.iter().zip(&self.counts) {
            table.push_str(&format!("{name:<width$}"));
            for count in row {
                table.push_str(&format!(" {count:>width$}"));
            }
            table.push('\n');
        }
        table
    }

    pub fn reset(&mut self) {
        for row in &mut self.counts {
            row.fill(0);
        }
    }
}

pub type MetricFactory = fn(&Params<'_>, &LabelSet) -> Result<Box<dyn Metric>>;

/// The metric classes known to `engine.metric`.
pub fn metric_registry() -> Registry<MetricFactory> {
    let mut registry = Registry::<MetricFactory>::new("metric");
    registry
        .register("TokenClassificationAccuracy", |_, _| {
            Ok(Box::new(TokenClassificationAccuracy::new()))
        })
        .register("PrecisionRecallFMeasure", |_, labels| {
            Ok(Box::new(PrecisionRecallFMeasure::new(labels.clone())))
        });
    registry
}

/// Build the metric declared by an `engine.metric` node.
pub fn build_metric(node: &ComponentConfig, labels: &LabelSet) -> Result<Box<dyn Metric>> {
    let factory = metric_registry().resolve(&node.class)?;
    factory(&node.at("engine.metric"), labels)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ConfigError;

    fn material() -> LabelSet {
        LabelSet::bioul(&["MATERIAL".to_string(), "METHOD".to_string()]).unwrap()
    }

    fn ids(labels: &LabelSet, tags: &[&str]) -> Vec<usize> {
        labels
            .encode(tags)
            .unwrap()
            .into_iter()
            .map(|i| i as usize)
            .collect()
    }

    #[test]
    fn test_accuracy_perfect_and_zero() {
        let gold = vec![vec![1, 3, 0, 4], vec![4, 0]];
        let mask = vec![vec![true; 4], vec![true, true, false, false]];

        let mut metric = TokenClassificationAccuracy::new();
        metric.update(&gold, &gold, &mask).unwrap();
        assert_eq!(metric.compute()["accuracy"], 1.0);

        metric.reset();
        let wrong = vec![vec![2, 2, 2, 2], vec![2, 2]];
        metric.update(&wrong, &gold, &mask).unwrap();
        assert_eq!(metric.compute()["accuracy"], 0.0);
    }

    #[test]
    fn test_accuracy_ignores_padding() {
        // Padded predictions differ from padded gold but are masked out.
        let gold = vec![vec![0, 0, 7, 7]];
        let pred = vec![vec![0, 1, 3, 3]];
        let mask = vec![vec![true, true, false, false]];
        let mut metric = TokenClassificationAccuracy::new();
        metric.update(&pred, &gold, &mask).unwrap();
        assert_eq!(metric.compute()["accuracy"], 0.5);
    }

    #[test]
    fn test_accuracy_counts_every_masked_position() {
        let mut metric = TokenClassificationAccuracy::new();
        metric
            .update(&[vec![0, 2, 3]], &[vec![1, 2, 3]], &[vec![false, true, true]])
            .unwrap();
        assert_eq!(metric.compute()["accuracy"], 1.0);

        metric.reset();
        metric
            .update(&[vec![2, 9, 3, 4]], &[vec![2, 0, 3, 1]], &[vec![true, false, true, true]])
            .unwrap();
        assert!((metric.compute()["accuracy"] - 2.0 / 3.0).abs() < 1e-9);
    }

    #[test]
    fn test_span_fmeasure_skips_interior_padding() {
        let labels = material();
        let gold = ids(&labels, &["U-MATERIAL", "O", "U-METHOD"]);
        let mut pred = gold.clone();
        pred[1] = labels.index_of("B-METHOD").unwrap();

        let mut metric = PrecisionRecallFMeasure::new(labels);
        metric.update(&[pred], &[gold], &[vec![true, false, true]]).unwrap();
        assert_eq!(metric.compute()["micro_fscore"], 1.0);
    }

    #[test]
    fn test_accuracy_rejects_short_rows() {
        let mut metric = TokenClassificationAccuracy::new();
        let err = metric
            .update(&[vec![0]], &[vec![0, 0]], &[vec![true, true]])
            .unwrap_err();
        assert!(matches!(err, SeqTagError::ShapeMismatch(_)));
    }

    #[test]
    fn test_span_fmeasure() {
        let labels = material();
        let gold = ids(&labels, &["B-MATERIAL", "L-MATERIAL", "O", "U-METHOD"]);
        let pred = ids(&labels, &["B-MATERIAL", "L-MATERIAL", "O", "U-MATERIAL"]);
        let mask = vec![vec![true; 4]];

        let mut metric = PrecisionRecallFMeasure::new(labels);
        metric.update(&[pred], &[gold], &mask).unwrap();
        let report = metric.compute();
        assert_eq!(report["precision"], 0.5);
        assert_eq!(report["recall"], 0.5);
        assert_eq!(report["micro_fscore"], 0.5);
        // MATERIAL: p=0.5 r=1 -> 2/3; METHOD: 0.
        assert!((report["macro_fscore"] - 1.0 / 3.0).abs() < 1e-9);
    }

    #[test]
    fn test_type_scores_and_table() {
        let labels = material();
        let gold = ids(&labels, &["B-MATERIAL", "L-MATERIAL", "O", "U-METHOD"]);
        let pred = ids(&labels, &["B-MATERIAL", "L-MATERIAL", "O", "U-MATERIAL"]);

        let mut metric = PrecisionRecallFMeasure::new(labels);
        metric.update(&[pred], &[gold], &[vec![true; 4]]).unwrap();
        let scores = metric.type_scores();
        assert_eq!(scores.len(), 2);
        assert_eq!(scores[0].entity, "MATERIAL");
        assert_eq!((scores[0].precision, scores[0].recall), (0.5, 1.0));
        assert_eq!(scores[0].support, 1);
        assert_eq!(scores[1].entity, "METHOD");
        assert_eq!((scores[1].fscore, scores[1].support), (0.0, 1));

        let table = metric.render_table();
        assert_eq!(table.lines().count(), 5);
        assert!(table.lines().nth(1).unwrap().starts_with("MATERIAL"));
        assert!(table.contains("micro"));
    }

    #[test]
    fn test_confusion_matrix_counts_masked_tokens() {
        let labels = material();
        let gold = ids(&labels, &["U-MATERIAL", "O", "O", "U-METHOD"]);
        let pred = ids(&labels, &["U-METHOD", "O", "U-MATERIAL", "U-METHOD"]);

        let mut matrix = ConfusionMatrix::new(labels);
        matrix.update(&[pred], &[gold], &[vec![true, true, false, true]]).unwrap();
        assert_eq!(matrix.total(), 3);
        assert_eq!(matrix.count("U-MATERIAL", "U-METHOD"), 1);
        assert_eq!(matrix.count("O", "O"), 1);
        assert_eq!(matrix.count("O", "U-MATERIAL"), 0);
        assert_eq!(matrix.count("U-METHOD", "U-METHOD"), 1);
        assert_eq!(matrix.count("X-UNKNOWN", "O"), 0);

        let table = matrix.render_table();
        // Header plus one row per label.
        assert_eq!(table.lines().count(), 1 + 9);
        matrix.reset();
        assert_eq!(matrix.total(), 0);
    }

    #[test]
    fn test_registry_builds_and_rejects() {
        let labels = material();
        let node = ComponentConfig::new("PrecisionRecallFMeasure");
        let metric = build_metric(&node, &labels).unwrap();
        assert_eq!(metric.name(), "PrecisionRecallFMeasure");

        let err = build_metric(&ComponentConfig::new("BleuScore"), &labels).err().unwrap();
        assert!(matches!(
            err,
            SeqTagError::Config(ConfigError::UnknownComponent { role: "metric", .. })
        ));
    }
}

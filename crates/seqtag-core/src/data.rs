//! Tokens, sentences and padded batches.

use candle_core::{Device, Tensor};

use crate::error::{Result, SeqTagError};
use crate::labels::LabelSet;
use crate::vocab::{PAD_ID, Vocabularies};

/// A surface token with its derived ids.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Token {
    text: String,
    word_id: u32,
    char_ids: Vec<u32>,
}

impl Token {
    pub fn new(text: impl Into<String>, vocab: &Vocabularies) -> Self {
        let text = text.into();
        let word_id = vocab.words.id(&text);
        let char_ids = vocab.char_ids(&text);
        Self {
            text,
            word_id,
            char_ids,
        }
    }

    pub fn text(&self) -> &str {
        &self.text
    }

    pub fn word_id(&self) -> u32 {
        self.word_id
    }

    pub fn char_ids(&self) -> &[u32] {
        &self.char_ids
    }

    /// Keep only the first `max_chars` character ids. The word id is
    /// unaffected.
    pub fn truncate_chars(&mut self, max_chars: usize) -> bool {
        let longer = self.char_ids.len() > max_chars;
        self.char_ids.truncate(max_chars);
        longer
    }
}

/// Tokens plus, for training and evaluation, one gold tag per token.
#[derive(Debug, Clone)]
pub struct Sentence {
    pub tokens: Vec<Token>,
    pub labels: Option<Vec<String>>,
}

impl Sentence {
    pub fn new<S: AsRef<str>>(
        tokens: &[S],
        labels: Option<Vec<String>>,
        vocab: &Vocabularies,
    ) -> Result<Self> {
        if let Some(labels) = &labels {
            if labels.len() != tokens.len() {
                return Err(SeqTagError::shape(format!(
                    "sentence has {} tokens but {} labels",
                    tokens.len(),
                    labels.len()
                )));
            }
        }
        Ok(Self {
            tokens: tokens.iter().map(|t| Token::new(t.as_ref(), vocab)).collect(),
            labels,
        })
    }

    pub fn len(&self) -> usize {
        self.tokens.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tokens.is_empty()
    }

    /// Cut the sentence to `max_length` tokens (labels alike) and every
    /// token to `max_chars` characters. Returns whether anything changed.
    pub fn truncate(&mut self, max_length: Option<usize>, max_chars: Option<usize>) -> bool {
        let mut changed = false;
        if let Some(max_length) = max_length {
            changed |= self.tokens.len() > max_length;
            self.tokens.truncate(max_length);
            if let Some(labels) = &mut self.labels {
                labels.truncate(max_length);
            }
        }
        if let Some(max_chars) = max_chars {
            for token in &mut self.tokens {
                changed |= token.truncate_chars(max_chars);
            }
        }
        changed
    }
}

/// A padded mini-batch.
///
/// `word_ids` is `[batch, seq_len]`, `char_ids` is `[batch, seq_len,
/// max_chars]`, `mask` is `[batch, seq_len]` f32 with 1.0 on real tokens.
/// `labels` is present when every sentence carries gold tags.
#[derive(Debug, Clone)]
pub struct Batch {
    pub word_ids: Tensor,
    pub char_ids: Tensor,
    pub char_lengths: Tensor,
    pub mask: Tensor,
    pub labels: Option<Tensor>,
    pub lengths: Vec<usize>,
    pub max_chars: usize,
}

impl Batch {
    pub fn from_sentences(
        sentences: &[&Sentence],
        labels: &LabelSet,
        device: &Device,
    ) -> Result<Self> {
        if sentences.is_empty() {
            return Err(SeqTagError::EmptyInput);
        }
        if let Some(pos) = sentences.iter().position(|s| s.is_empty()) {
            return Err(SeqTagError::shape(format!(
                "sentence #{pos} in batch has length zero"
            )));
        }

        let batch_size = sentences.len();
        let lengths: Vec<usize> = sentences.iter().map(|s| s.len()).collect();
        let seq_len = lengths.iter().copied().max().unwrap_or(0);
        let max_chars = sentences
            .iter()
            .flat_map(|s| s.tokens.iter().map(|t| t.char_ids().len()))
            .max()
            .unwrap_or(0)
            .max(1);

        let mut word_ids = vec![PAD_ID; batch_size * seq_len];
        let mut char_ids = vec![PAD_ID; batch_size * seq_len * max_chars];
        let mut char_lengths = vec![0u32; batch_size * seq_len];
        let mut mask = vec![0f32; batch_size * seq_len];
        let with_labels = sentences.iter().all(|s| s.labels.is_some());
        let mut label_ids = vec![0u32; batch_size * seq_len];

        for (b, sentence) in sentences.iter().enumerate() {
            for (t, token) in sentence.tokens.iter().enumerate() {
                let pos = b * seq_len + t;
                word_ids[pos] = token.word_id();
                mask[pos] = 1.0;
                char_lengths[pos] = token.char_ids().len() as u32;
                let offset = pos * max_chars;
                char_ids[offset..offset + token.char_ids().len()]
                    .copy_from_slice(token.char_ids());
            }
            if with_labels {
                if let Some(gold) = &sentence.labels {
                    let encoded = labels.encode(gold)?;
                    let offset = b * seq_len;
                    label_ids[offset..offset + encoded.len()].copy_from_slice(&encoded);
                }
            }
        }

        Ok(Self {
            word_ids: Tensor::from_vec(word_ids, (batch_size, seq_len), device)?,
            char_ids: Tensor::from_vec(char_ids, (batch_size, seq_len, max_chars), device)?,
            char_lengths: Tensor::from_vec(char_lengths, (batch_size, seq_len), device)?,
            mask: Tensor::from_vec(mask, (batch_size, seq_len), device)?,
            labels: if with_labels {
                Some(Tensor::from_vec(label_ids, (batch_size, seq_len), device)?)
            } else {
                None
            },
            lengths,
            max_chars,
        })
    }

    pub fn batch_size(&self) -> usize {
        self.lengths.len()
    }

    pub fn seq_len(&self) -> usize {
        self.lengths.iter().copied().max().unwrap_or(0)
    }

    pub fn num_tokens(&self) -> usize {
        self.lengths.iter().sum()
    }

    pub fn device(&self) -> &Device {
        self.word_ids.device()
    }

    /// Gold label ids per sentence, truncated to each sentence length.
    pub fn gold(&self) -> Result<Option<Vec<Vec<usize>>>> {
        let Some(labels) = &self.labels else {
            return Ok(None);
        };
        let rows: Vec<Vec<u32>> = labels.to_vec2()?;
        Ok(Some(
            rows.into_iter()
                .zip(&self.lengths)
                .map(|(row, &len)| row[..len].iter().map(|&l| l as usize).collect())
                .collect(),
        ))
    }

    /// Boolean padding mask per sentence, `true` on real tokens.
    pub fn mask_rows(&self) -> Vec<Vec<bool>> {
        let seq_len = self.seq_len();
        self.lengths
            .iter()
            .map(|&len| (0..seq_len).map(|t| t < len).collect())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fixture() -> (Vocabularies, LabelSet) {
        let corpus = vec![vec!["Cu", "is", "a", "metal"], vec!["Fe", "rusts"]];
        (
            Vocabularies::build(&corpus, None, 1),
            LabelSet::bioul(&["MATERIAL".to_string()]).unwrap(),
        )
    }

    #[test]
    fn test_truncation_bounds_batch_shape() {
        let (vocab, labels) = fixture();
        let long_token = "Cu".repeat(100);
        let mut sentence = Sentence::new(
            &[long_token.as_str(), "is", "a", "metal"],
            Some(vec!["U-MATERIAL".into(), "O".into(), "O".into(), "O".into()]),
            &vocab,
        )
        .unwrap();
        assert_eq!(sentence.tokens[0].char_ids().len(), 200);

        assert!(sentence.truncate(Some(2), Some(8)));
        assert_eq!(sentence.len(), 2);
        assert_eq!(sentence.labels.as_ref().unwrap(), &vec!["U-MATERIAL", "O"]);
        assert_eq!(sentence.tokens[0].char_ids().len(), 8);
        assert_eq!(sentence.tokens[1].char_ids().len(), 2);
        assert!(!sentence.truncate(Some(2), Some(8)));

        let batch = Batch::from_sentences(&[&sentence], &labels, &Device::Cpu).unwrap();
        assert_eq!(batch.char_ids.dims(), &[1, 2, 8]);
        assert_eq!(batch.lengths, vec![2]);
    }

    #[test]
    fn test_batch_padding_and_mask() {
        let (vocab, labels) = fixture();
        let a = Sentence::new(
            &["Cu", "is", "a", "metal"],
            Some(vec!["U-MATERIAL".into(), "O".into(), "O".into(), "O".into()]),
            &vocab,
        )
        .unwrap();
        let b = Sentence::new(
            &["Fe", "rusts"],
            Some(vec!["U-MATERIAL".into(), "O".into()]),
            &vocab,
        )
        .unwrap();

        let batch = Batch::from_sentences(&[&a, &b], &labels, &Device::Cpu).unwrap();
        assert_eq!(batch.word_ids.dims(), &[2, 4]);
        assert_eq!(batch.char_ids.dims(), &[2, 4, 5]);
        let mask: Vec<Vec<f32>> = batch.mask.to_vec2().unwrap();
        assert_eq!(mask[1], vec![1.0, 1.0, 0.0, 0.0]);
        let words: Vec<Vec<u32>> = batch.word_ids.to_vec2().unwrap();
        assert_eq!(words[1][2], PAD_ID);
        assert_eq!(batch.num_tokens(), 6);

        let gold = batch.gold().unwrap().unwrap();
        assert_eq!(gold[1], vec![labels.index_of("U-MATERIAL").unwrap(), 0]);
    }

    #[test]
    fn test_empty_sentence_rejected() {
        let (vocab, labels) = fixture();
        let empty = Sentence::new::<&str>(&[], None, &vocab).unwrap();
        let err = Batch::from_sentences(&[&empty], &labels, &Device::Cpu).unwrap_err();
        assert!(matches!(err, SeqTagError::ShapeMismatch(_)));
    }

    #[test]
    fn test_label_count_mismatch() {
        let (vocab, _) = fixture();
        let err = Sentence::new(&["Cu"], Some(vec![]), &vocab).unwrap_err();
        assert!(matches!(err, SeqTagError::ShapeMismatch(_)));
    }
}

//! Word and character vocabularies.

use std::collections::HashMap;
use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::Result;

pub const PAD_TOKEN: &str = "<PAD>";
pub const UNK_TOKEN: &str = "<UNK>";
pub const PAD_ID: u32 = 0;
pub const UNK_ID: u32 = 1;

/// Bidirectional mapping between surface strings and integer ids.
///
/// Ids 0 and 1 are reserved for padding and unknown entries.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Vocabulary {
    idx_to_token: Vec<String>,
    #[serde(skip)]
    token_to_idx: HashMap<String, u32>,
}

impl Vocabulary {
    /// Build from token counts, keeping the `max_size` most frequent
    /// entries seen at least `min_count` times. Ties break lexicographically.
    pub fn from_counts(
        counts: HashMap<String, usize>,
        max_size: Option<usize>,
        min_count: usize,
    ) -> Self {
        let mut entries: Vec<(String, usize)> = counts
            .into_iter()
            .filter(|(token, count)| *count >= min_count.max(1) && !is_reserved(token))
            .collect();
        entries.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
        if let Some(max) = max_size {
            entries.truncate(max);
        }

        let mut idx_to_token = vec![PAD_TOKEN.to_string(), UNK_TOKEN.to_string()];
        idx_to_token.extend(entries.into_iter().map(|(token, _)| token));
        Self::from_tokens(idx_to_token)
    }

    /// Word vocabulary from tokenized sentences.
    pub fn words<'a, I, S>(sentences: I, max_size: Option<usize>, min_count: usize) -> Self
    where
        I: IntoIterator<Item = &'a [S]>,
        S: AsRef<str> + 'a,
    {
        let mut counts = HashMap::new();
        for sentence in sentences {
            for token in sentence {
                *counts.entry(token.as_ref().to_string()).or_insert(0) += 1;
            }
        }
        let vocab = Self::from_counts(counts, max_size, min_count);
        debug!(size = vocab.len(), "built word vocabulary");
        vocab
    }

    /// Character vocabulary from tokenized sentences.
    pub fn chars<'a, I, S>(sentences: I) -> Self
    where
        I: IntoIterator<Item = &'a [S]>,
        S: AsRef<str> + 'a,
    {
        let mut counts = HashMap::new();
        for sentence in sentences {
            for token in sentence {
                for c in token.as_ref().chars() {
                    *counts.entry(c.to_string()).or_insert(0) += 1;
                }
            }
        }
        let vocab = Self::from_counts(counts, None, 1);
        debug!(size = vocab.len(), "built character vocabulary");
        vocab
    }

    fn from_tokens(idx_to_token: Vec<String>) -> Self {
        let token_to_idx = idx_to_token
            .iter()
            .enumerate()
            .map(|(i, t)| (t.clone(), i as u32))
            .collect();
        Self {
            idx_to_token,
            token_to_idx,
        }
    }

    pub fn len(&self) -> usize {
        self.idx_to_token.len()
    }

    pub fn is_empty(&self) -> bool {
        self.idx_to_token.is_empty()
    }

    /// Id of `token`, or the unknown id.
    pub fn id(&self, token: &str) -> u32 {
        self.token_to_idx.get(token).copied().unwrap_or(UNK_ID)
    }

    pub fn token(&self, id: u32) -> Option<&str> {
        self.idx_to_token.get(id as usize).map(String::as_str)
    }

    pub fn contains(&self, token: &str) -> bool {
        self.token_to_idx.contains_key(token)
    }
}

fn is_reserved(token: &str) -> bool {
    token == PAD_TOKEN || token == UNK_TOKEN
}

/// The pair of vocabularies consumed by the embedders.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Vocabularies {
    pub words: Vocabulary,
    pub chars: Vocabulary,
}

impl Vocabularies {
    pub fn build<'a, S: AsRef<str> + 'a>(
        sentences: &'a [Vec<S>],
        max_num_words: Option<usize>,
        min_count: usize,
    ) -> Self {
        Self {
            words: Vocabulary::words(sentences.iter().map(Vec::as_slice), max_num_words, min_count),
            chars: Vocabulary::chars(sentences.iter().map(Vec::as_slice)),
        }
    }

    /// Char ids of a token, one per `char`.
    pub fn char_ids(&self, token: &str) -> Vec<u32> {
        let mut buf = [0u8; 4];
        token
            .chars()
            .map(|c| self.chars.id(c.encode_utf8(&mut buf)))
            .collect()
    }

    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let json = serde_json::to_string_pretty(self)?;
        std::fs::write(path, json)?;
        Ok(())
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let raw: Vocabularies = serde_json::from_str(&content)?;
        Ok(Self {
            words: Vocabulary::from_tokens(raw.words.idx_to_token),
            chars: Vocabulary::from_tokens(raw.chars.idx_to_token),
        })
    }
}

//! # Raw Text Tokenizer
//!
//! Splits free text into word and punctuation tokens for inference.
//! Training corpora arrive pre-tokenized and never pass through here.

use regex::Regex;

/// A token cut from raw text, with its byte range in the original string.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TextToken {
    /// The token text content
    pub text: String,
    /// Start byte offset in the original string
    pub start: usize,
    /// End byte offset (exclusive) in the original string
    pub end: usize,
}

/// Words (with inner hyphens, apostrophes and decimal points) and single
/// punctuation marks.
const WORD_PATTERN: &str = r"\w+(?:[-'.,]\w+)*|[^\w\s]";

/// Regex word tokenizer.
#[derive(Debug, Clone)]
pub struct WordTokenizer {
    pattern: Regex,
}

impl WordTokenizer {
    /// # Errors
    ///
    /// Returns `SeqTagError::Regex` if the pattern fails to compile.
    pub fn new() -> crate::Result<Self> {
        Ok(Self {
            pattern: Regex::new(WORD_PATTERN)?,
        })
    }

    /// Tokenize a string into tokens with byte offsets.
    ///
    /// # Examples
    /// ```
    /// use seqtag_core::tokenizer::WordTokenizer;
    ///
    /// let tokenizer = WordTokenizer::new().unwrap();
    /// let tokens = tokenizer.tokenize("Cu is a metal.");
    /// assert_eq!(tokens.len(), 5);
    /// ```
    pub fn tokenize(&self, input: &str) -> Vec<TextToken> {
        self.pattern
            .find_iter(input)
            .map(|m| TextToken {
                text: m.as_str().to_string(),
                start: m.start(),
                end: m.end(),
            })
            .collect()
    }

    /// Byte range covered by tokens `start_idx..=end_idx`.
    pub fn byte_span(
        &self,
        tokens: &[TextToken],
        start_idx: usize,
        end_idx: usize,
    ) -> Option<(usize, usize)> {
        if start_idx > end_idx || end_idx >= tokens.len() {
            return None;
        }
        Some((tokens[start_idx].start, tokens[end_idx].end))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tokenize_basic() {
        let tokenizer = WordTokenizer::new().unwrap();
        let tokens = tokenizer.tokenize("Cu is a metal.");

        let texts: Vec<&str> = tokens.iter().map(|t| t.text.as_str()).collect();
        assert_eq!(texts, vec!["Cu", "is", "a", "metal", "."]);
        assert_eq!((tokens[3].start, tokens[3].end), (8, 13));
    }

    #[test]
    fn test_tokenize_keeps_compounds() {
        let tokenizer = WordTokenizer::new().unwrap();
        let tokens = tokenizer.tokenize("Ti-6Al-4V at 3.5 GPa, isn't it?");
        let texts: Vec<&str> = tokens.iter().map(|t| t.text.as_str()).collect();
        assert_eq!(
            texts,
            vec!["Ti-6Al-4V", "at", "3.5", "GPa", ",", "isn't", "it", "?"]
        );
    }

    #[test]
    fn test_tokenize_empty() {
        let tokenizer = WordTokenizer::new().unwrap();
        assert!(tokenizer.tokenize("").is_empty());
        assert!(tokenizer.tokenize("   \t\n").is_empty());
    }

    #[test]
    fn test_byte_span() {
        let tokenizer = WordTokenizer::new().unwrap();
        let input = "pure copper wire";
        let tokens = tokenizer.tokenize(input);

        let (start, end) = tokenizer.byte_span(&tokens, 1, 2).unwrap();
        assert_eq!(&input[start..end], "copper wire");
        assert!(tokenizer.byte_span(&tokens, 2, 3).is_none());
    }
}

//! # Viterbi Decoding for CRF
//!
//! Finds the highest-scoring tag sequence given per-token emission scores
//! and an `(L + 2) x (L + 2)` transition matrix whose last two rows/columns
//! belong to the START and END pseudo-labels.

use crate::error::{Result, SeqTagError};
use crate::labels::LabelSet;

/// Viterbi decoder for CRF tag sequences.
#[derive(Debug, Clone)]
pub struct ViterbiDecoder {
    num_tags: usize,
    allowed: Option<Vec<Vec<bool>>>,
}

/// Best path score and backpointer for one lattice cell.
#[derive(Debug, Clone, Copy)]
struct PathState {
    score: f32,
    prev_tag: Option<usize>,
}

impl PathState {
    const UNREACHABLE: Self = Self {
        score: f32::NEG_INFINITY,
        prev_tag: None,
    };
}

impl ViterbiDecoder {
    /// Decoder that relies purely on the transition scores.
    pub fn new(num_tags: usize) -> Self {
        Self {
            num_tags,
            allowed: None,
        }
    }

    /// Decoder that never emits a transition the label scheme forbids,
    /// whatever its learned score.
    pub fn constrained(labels: &LabelSet) -> Self {
        Self {
            num_tags: labels.len(),
            allowed: Some(labels.allowed_transitions()),
        }
    }

    pub fn num_tags(&self) -> usize {
        self.num_tags
    }

    pub fn is_constrained(&self) -> bool {
        self.allowed.is_some()
    }

    fn is_allowed(&self, from: usize, to: usize) -> bool {
        self.allowed.as_ref().is_none_or(|allowed| allowed[from][to])
    }

    fn validate(&self, emission_scores: &[Vec<f32>], transition_matrix: &[Vec<f32>]) -> Result<()> {
        if emission_scores.is_empty() {
            return Err(SeqTagError::shape("cannot decode a sequence of length zero"));
        }
        if let Some(row) = emission_scores.iter().find(|row| row.len() != self.num_tags) {
            return Err(SeqTagError::shape(format!(
                "emission score dimension mismatch: expected {}, got {}",
                self.num_tags,
                row.len()
            )));
        }
        let expected = self.num_tags + 2;
        if transition_matrix.len() != expected
            || transition_matrix.iter().any(|row| row.len() != expected)
        {
            return Err(SeqTagError::shape(format!(
                "transition matrix must be {expected}x{expected}"
            )));
        }
        Ok(())
    }

    /// Decode the optimal tag sequence.
    ///
    /// # Arguments
    /// * `emission_scores` - Matrix of shape [seq_len, num_tags]
    /// * `transition_matrix` - Matrix of shape [num_tags + 2, num_tags + 2]
    ///
    /// # Returns
    /// The optimal tag indices and the score of that path.
    pub fn decode(
        &self,
        emission_scores: &[Vec<f32>],
        transition_matrix: &[Vec<f32>],
    ) -> Result<(Vec<usize>, f32)> {
        self.validate(emission_scores, transition_matrix)?;

        let seq_len = emission_scores.len();
        let (start, end) = (self.num_tags, self.num_tags + 1);
        let mut dp = vec![vec![PathState::UNREACHABLE; self.num_tags]; seq_len];

        for tag in 0..self.num_tags {
            if self.is_allowed(start, tag) {
                dp[0][tag].score = transition_matrix[start][tag] + emission_scores[0][tag];
            }
        }

        for pos in 1..seq_len {
            for curr_tag in 0..self.num_tags {
                let mut best = PathState::UNREACHABLE;

                for prev_tag in 0..self.num_tags {
                    if !self.is_allowed(prev_tag, curr_tag) {
                        continue;
                    }

                    let score = dp[pos - 1][prev_tag].score + transition_matrix[prev_tag][curr_tag];
                    if score > best.score {
                        best = PathState {
                            score,
                            prev_tag: Some(prev_tag),
                        };
                    }
                }

                dp[pos][curr_tag] = PathState {
                    score: best.score + emission_scores[pos][curr_tag],
                    prev_tag: best.prev_tag,
                };
            }
        }

        // Best final tag, including the transition into END.
        let mut best_final_tag = 0;
        let mut best_final_score = f32::NEG_INFINITY;
        for tag in 0..self.num_tags {
            if !self.is_allowed(tag, end) {
                continue;
            }
            let score = dp[seq_len - 1][tag].score + transition_matrix[tag][end];
            if score > best_final_score {
                best_final_score = score;
                best_final_tag = tag;
            }
        }

        let mut path = Vec::with_capacity(seq_len);
        path.push(best_final_tag);
        let mut curr_tag = best_final_tag;
        for pos in (1..seq_len).rev() {
            curr_tag = dp[pos][curr_tag].prev_tag.unwrap_or(0);
            path.push(curr_tag);
        }
        path.reverse();

        Ok((path, best_final_score))
    }
}

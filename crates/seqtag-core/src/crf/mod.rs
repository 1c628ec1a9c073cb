//! # Linear-Chain Conditional Random Field
//!
//! The trainable [`ConditionalRandomField`] scores whole label sequences on
//! top of per-token emissions; [`ViterbiDecoder`] recovers the best path.
//! Plain-slice scoring helpers live here for decoding-time confidence.

pub mod layer;
pub mod viterbi;

pub use layer::ConditionalRandomField;
pub use viterbi::ViterbiDecoder;

/// Unnormalized score of `tags` including START and END transitions.
///
/// `transitions` is `(L + 2) x (L + 2)` with START at `L` and END at `L + 1`.
pub fn score_sequence(emissions: &[Vec<f32>], transitions: &[Vec<f32>], tags: &[usize]) -> f32 {
    let Some((&first, &last)) = tags.first().zip(tags.last()) else {
        return 0.0;
    };
    let num_tags = transitions.len() - 2;
    let (start, end) = (num_tags, num_tags + 1);

    let emitted: f32 = tags.iter().zip(emissions).map(|(&tag, row)| row[tag]).sum();
    let moved: f32 = tags.windows(2).map(|w| transitions[w[0]][w[1]]).sum();
    emitted + moved + transitions[start][first] + transitions[last][end]
}

/// Log of the sum of `exp(score)` over every label sequence.
pub fn log_partition(emissions: &[Vec<f32>], transitions: &[Vec<f32>]) -> f32 {
    let num_tags = transitions.len() - 2;
    let (start, end) = (num_tags, num_tags + 1);
    let Some(first) = emissions.first() else {
        return 0.0;
    };

    let mut alpha: Vec<f32> = (0..num_tags)
        .map(|j| transitions[start][j] + first[j])
        .collect();
    for row in &emissions[1..] {
        alpha = (0..num_tags)
            .map(|j| {
                let scores: Vec<f32> = (0..num_tags)
                    .map(|i| alpha[i] + transitions[i][j])
                    .collect();
                log_sum_exp(&scores) + row[j]
            })
            .collect();
    }
    let closing: Vec<f32> = (0..num_tags).map(|j| alpha[j] + transitions[j][end]).collect();
    log_sum_exp(&closing)
}

fn log_sum_exp(values: &[f32]) -> f32 {
    let max = values.iter().copied().fold(f32::NEG_INFINITY, f32::max);
    if max == f32::NEG_INFINITY {
        return max;
    }
    max + values.iter().map(|v| (v - max).exp()).sum::<f32>().ln()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partition_bounds_every_path() {
        let emissions = vec![vec![0.5, -0.2], vec![0.1, 0.9], vec![-0.3, 0.4]];
        let transitions = vec![
            vec![0.2, -0.1, 0.0, 0.3],
            vec![0.4, 0.1, 0.0, -0.2],
            vec![0.1, 0.6, 0.0, 0.0],
            vec![0.0, 0.0, 0.0, 0.0],
        ];
        let log_z = log_partition(&emissions, &transitions);

        let mut total = 0.0f32;
        for a in 0..2 {
            for b in 0..2 {
                for c in 0..2 {
                    let s = score_sequence(&emissions, &transitions, &[a, b, c]);
                    assert!(s <= log_z);
                    total += s.exp();
                }
            }
        }
        assert!((total.ln() - log_z).abs() < 1e-4);
    }

    #[test]
    fn test_single_token_score() {
        let emissions = vec![vec![1.0, 2.0]];
        let mut transitions = vec![vec![0.0; 4]; 4];
        transitions[2][1] = 0.5;
        transitions[1][3] = 0.25;
        assert!((score_sequence(&emissions, &transitions, &[1]) - 2.75).abs() < 1e-6);
    }
}

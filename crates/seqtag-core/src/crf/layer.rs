//! Trainable CRF layer over candle tensors.

use candle_core::Tensor;
use candle_nn::VarBuilder;
use candle_nn::init::Init;

use crate::crf::viterbi::ViterbiDecoder;
use crate::error::{Result, SeqTagError};
use crate::labels::LabelSet;

/// Linear-chain CRF with learned START/END transitions.
///
/// `transitions[i][j]` scores moving from label `i` to label `j`; row `L`
/// holds the START scores and column `L + 1` the END scores. All scoring
/// methods take emissions of shape `[batch, seq_len, L]` and an f32 mask of
/// shape `[batch, seq_len]` whose ones form a prefix of each row.
#[derive(Debug, Clone)]
pub struct ConditionalRandomField {
    num_tags: usize,
    transitions: Tensor,
    decoder: ViterbiDecoder,
}

impl ConditionalRandomField {
    pub fn new(labels: &LabelSet, constrain_decoding: bool, vb: VarBuilder) -> Result<Self> {
        let num_tags = labels.len();
        let transitions = vb.get_with_hints(
            (num_tags + 2, num_tags + 2),
            "transitions",
            Init::Randn {
                mean: 0.0,
                stdev: 0.1,
            },
        )?;
        let decoder = if constrain_decoding {
            ViterbiDecoder::constrained(labels)
        } else {
            ViterbiDecoder::new(num_tags)
        };

        Ok(Self {
            num_tags,
            transitions,
            decoder,
        })
    }

    pub fn num_tags(&self) -> usize {
        self.num_tags
    }

    pub fn transitions(&self) -> &Tensor {
        &self.transitions
    }

    /// The full transition matrix copied to host memory.
    pub fn transition_matrix(&self) -> Result<Vec<Vec<f32>>> {
        Ok(self.transitions.to_vec2()?)
    }

    fn check_inputs(&self, emissions: &Tensor, mask: &Tensor) -> Result<(usize, usize)> {
        let (batch, seq_len, num_tags) = emissions.dims3()?;
        if seq_len == 0 {
            return Err(SeqTagError::shape("CRF input has sequence length zero"));
        }
        if num_tags != self.num_tags {
            return Err(SeqTagError::shape(format!(
                "emission dimension {num_tags} does not match label count {}",
                self.num_tags
            )));
        }
        if mask.dims() != [batch, seq_len] {
            return Err(SeqTagError::shape(format!(
                "mask shape {:?} does not match emissions [{batch}, {seq_len}]",
                mask.dims()
            )));
        }
        Ok((batch, seq_len))
    }

    fn parts(&self) -> Result<(Tensor, Tensor, Tensor)> {
        let n = self.num_tags;
        let trans = self.transitions.narrow(0, 0, n)?.narrow(1, 0, n)?;
        // Both are strided views; index_select needs contiguous storage.
        let start = self
            .transitions
            .narrow(0, n, 1)?
            .narrow(1, 0, n)?
            .squeeze(0)?
            .contiguous()?;
        let end = self
            .transitions
            .narrow(0, 0, n)?
            .narrow(1, n + 1, 1)?
            .squeeze(1)?
            .contiguous()?;
        Ok((trans, start, end))
    }

    /// Log normalizer over all label sequences, shape `[batch]`.
    pub fn log_partition(&self, emissions: &Tensor, mask: &Tensor) -> Result<Tensor> {
        let (_, seq_len) = self.check_inputs(emissions, mask)?;
        let (trans, start, end) = self.parts()?;
        let trans = trans.unsqueeze(0)?;

        let mut alpha = emissions
            .narrow(1, 0, 1)?
            .squeeze(1)?
            .broadcast_add(&start.unsqueeze(0)?)?;
        for t in 1..seq_len {
            let emit = emissions.narrow(1, t, 1)?;
            // scores[b, i, j] = alpha[b, i] + trans[i, j] + emit[b, j]
            let scores = alpha
                .unsqueeze(2)?
                .broadcast_add(&trans)?
                .broadcast_add(&emit)?;
            let next = log_sum_exp(&scores, 1)?;

            // Padded positions carry alpha forward untouched.
            let m = mask.narrow(1, t, 1)?;
            alpha = next
                .broadcast_mul(&m)?
                .add(&alpha.broadcast_mul(&m.affine(-1.0, 1.0)?)?)?;
        }

        log_sum_exp(&alpha.broadcast_add(&end.unsqueeze(0)?)?, 1)
    }

    /// Score of the gold label path of every sentence, shape `[batch]`.
    pub fn gold_score(
        &self,
        emissions: &Tensor,
        tags: &Tensor,
        mask: &Tensor,
        lengths: &[usize],
    ) -> Result<Tensor> {
        let (batch, seq_len) = self.check_inputs(emissions, mask)?;
        if tags.dims() != [batch, seq_len] || lengths.len() != batch {
            return Err(SeqTagError::shape(format!(
                "gold tags {:?} do not match emissions [{batch}, {seq_len}]",
                tags.dims()
            )));
        }
        if let Some(&bad) = lengths.iter().find(|&&len| len == 0 || len > seq_len) {
            return Err(SeqTagError::shape(format!(
                "sentence length {bad} outside 1..={seq_len}"
            )));
        }

        let device = emissions.device();
        let (trans, start, end) = self.parts()?;
        let host_tags: Vec<Vec<u32>> = tags.to_vec2()?;

        let emitted = emissions
            .gather(&tags.unsqueeze(2)?.contiguous()?, 2)?
            .squeeze(2)?
            .mul(mask)?
            .sum(1)?;

        let first = tags.narrow(1, 0, 1)?.squeeze(1)?.contiguous()?;
        let last: Vec<u32> = host_tags
            .iter()
            .zip(lengths)
            .map(|(row, &len)| row[len - 1])
            .collect();
        let last = Tensor::from_vec(last, batch, device)?;

        let mut score = emitted
            .add(&start.index_select(&first, 0)?)?
            .add(&end.index_select(&last, 0)?)?;

        if seq_len > 1 {
            let n = self.num_tags as u32;
            let pair_ids: Vec<u32> = host_tags
                .iter()
                .flat_map(|row| row.windows(2).map(move |w| w[0] * n + w[1]))
                .collect();
            let pair_ids = Tensor::from_vec(pair_ids, batch * (seq_len - 1), device)?;
            let moved = trans
                .contiguous()?
                .flatten_all()?
                .index_select(&pair_ids, 0)?
                .reshape((batch, seq_len - 1))?
                .mul(&mask.narrow(1, 1, seq_len - 1)?)?
                .sum(1)?;
            score = score.add(&moved)?;
        }

        Ok(score)
    }

    /// Per-sentence log-likelihood of the gold paths, shape `[batch]`.
    pub fn log_likelihood(
        &self,
        emissions: &Tensor,
        tags: &Tensor,
        mask: &Tensor,
        lengths: &[usize],
    ) -> Result<Tensor> {
        let gold = self.gold_score(emissions, tags, mask, lengths)?;
        let log_z = self.log_partition(emissions, mask)?;
        Ok(gold.sub(&log_z)?)
    }

    /// Mean negative log-likelihood over the batch, a scalar tensor.
    pub fn neg_log_likelihood(
        &self,
        emissions: &Tensor,
        tags: &Tensor,
        mask: &Tensor,
        lengths: &[usize],
    ) -> Result<Tensor> {
        Ok(self
            .log_likelihood(emissions, tags, mask, lengths)?
            .mean_all()?
            .neg()?)
    }

    /// Best path and its score for every sentence, truncated to its length.
    pub fn decode(&self, emissions: &Tensor, lengths: &[usize]) -> Result<Vec<(Vec<usize>, f32)>> {
        let (batch, seq_len, num_tags) = emissions.dims3()?;
        if num_tags != self.num_tags {
            return Err(SeqTagError::shape(format!(
                "emission dimension {num_tags} does not match label count {}",
                self.num_tags
            )));
        }
        if lengths.len() != batch || lengths.iter().any(|&len| len > seq_len) {
            return Err(SeqTagError::shape("decode lengths do not match emissions"));
        }

        let host: Vec<Vec<Vec<f32>>> = emissions.to_vec3()?;
        let transitions = self.transition_matrix()?;
        host.iter()
            .zip(lengths)
            .map(|(rows, &len)| self.decoder.decode(&rows[..len], &transitions))
            .collect()
    }

    pub fn decoder(&self) -> &ViterbiDecoder {
        &self.decoder
    }
}

/// Numerically stable `log(sum(exp(x)))` along `dim`, which is removed.
pub(crate) fn log_sum_exp(x: &Tensor, dim: usize) -> Result<Tensor> {
    let max = x.max_keepdim(dim)?;
    let summed = x.broadcast_sub(&max)?.exp()?.sum_keepdim(dim)?.log()?;
    Ok(max.add(&summed)?.squeeze(dim)?)
}

use std::sync::Arc;

use candle_core::{IndexOp, Tensor};
use rand::{rngs::StdRng, Rng};
use thiserror::Error;
use tracing::{error, info_span, instrument, trace, Span};

use crate::{
    sampling_params::{DecodingMode, SamplingParams},
    sequence::{SequenceData, SequenceGroupMetadata},
};

/// One sampled token with its log probability under the sampling
/// distribution.
#[derive(Clone, Debug, PartialEq)]
pub struct SequenceSample {
    /// The sampled token id
    pub token_id: u32,
    /// Log probability of the token
    pub logprob: f32,
}

/// Verification outcome for a sequence carrying speculative candidates.
#[derive(Clone, Debug)]
pub struct VerifiedSample {
    /// The accepted candidate tokens, in order, with the main model's log
    /// probabilities
    pub accepted: Vec<SequenceSample>,
    /// The bonus token: sampled from the main distribution at the first
    /// unverified position (the corrected token on rejection, the
    /// one-past-the-end token when every candidate was accepted)
    pub bonus: SequenceSample,
    /// Number of rejected candidate tokens
    pub num_removed: usize,
}

/// One beam chosen to live on for the next step.
#[derive(Clone, Debug)]
pub struct BeamSelection {
    /// The beam (sequence) this selection extends
    pub parent_sequence_id: u64,
    /// The chosen next token
    pub token_id: u32,
    /// `log_softmax` value of the token under the parent beam's logits
    pub logprob: f32,
}

/// Per-group sampling result, aligned with the scheduler's metadata order.
#[derive(Clone, Debug)]
pub enum SequenceGroupSamples {
    /// Non-final prefill chunk: nothing was sampled
    Empty,
    /// One token per running sequence (greedy or multinomial)
    Single {
        /// `(sequence_id, sample)` pairs in scheduling order
        samples: Vec<(u64, SequenceSample)>,
    },
    /// Speculative verification outcome per sequence
    Verified {
        /// `(sequence_id, verdict)` pairs in scheduling order
        samples: Vec<(u64, VerifiedSample)>,
    },
    /// Beam-search selections; the engine reconciles forks and drops
    Beam {
        /// Exactly `beam_width` selections, best first
        selections: Vec<BeamSelection>,
    },
}

/// `Sampler` - Turns executor logits into sampled tokens.
///
/// Consumes `logits[rows, vocab]` whose rows follow the scheduler's
/// flattened batch layout: for each scheduled group, for each of its
/// running sequences in metadata order, `token_chunk_size` rows when the
/// sequence carries speculative candidates, one row otherwise, and zero
/// rows for groups that do not sample this step.
pub struct Sampler {
    /// Tracing span
    span: Span,
}

impl Default for Sampler {
    fn default() -> Self {
        Self::new()
    }
}

impl Sampler {
    /// Constructor
    pub fn new() -> Self {
        Self {
            span: info_span!("sampler"),
        }
    }

    /// Number of logits rows a sequence contributes to the batch.
    pub fn num_rows_for_sequence(metadata: &SequenceGroupMetadata, data: &SequenceData) -> usize {
        if !metadata.do_sample {
            return 0;
        }
        let num_candidates = data.get_num_candidate_tokens();
        if num_candidates > 0 {
            // One row per candidate plus the bonus position
            num_candidates + 1
        } else {
            1
        }
    }

    /// Samples next tokens for every scheduled sequence group.
    ///
    /// # Arguments
    /// * `logits` - `[rows, vocab]` tensor aligned with the flattened
    ///   batch layout described above.
    /// * `sequence_groups_metadata` - metadata of the scheduled groups, in
    ///   scheduling order.
    ///
    /// # Returns
    /// One `SequenceGroupSamples` per group, in the same order.
    #[instrument(skip_all)]
    pub fn sample(
        &self,
        logits: &Tensor,
        sequence_groups_metadata: &[Arc<SequenceGroupMetadata>],
    ) -> Result<Vec<SequenceGroupSamples>, SamplerError> {
        let _enter = self.span.enter();

        let total_rows: usize = sequence_groups_metadata
            .iter()
            .map(|metadata| {
                metadata
                    .sequence_data
                    .iter()
                    .map(|(_, data)| Self::num_rows_for_sequence(metadata, data))
                    .sum::<usize>()
            })
            .sum();
        if logits.dims()[0] != total_rows {
            error!(
                "Invalid logits shape: got {} rows, expected {}",
                logits.dims()[0],
                total_rows
            );
            return Err(SamplerError::InvalidLogits(logits.dims()[0], total_rows));
        }

        let mut outputs = Vec::with_capacity(sequence_groups_metadata.len());
        let mut row_idx = 0;
        for metadata in sequence_groups_metadata {
            if !metadata.do_sample {
                outputs.push(SequenceGroupSamples::Empty);
                continue;
            }
            let group_samples = match &metadata.sampling_params.mode {
                DecodingMode::Greedy | DecodingMode::Multinomial { .. } => {
                    self.sample_single_or_verify(logits, metadata, &mut row_idx)?
                }
                DecodingMode::Beam {
                    num_groups,
                    group_size,
                    diversity_penalty,
                    ..
                } => self.sample_beam(
                    logits,
                    metadata,
                    *num_groups,
                    *group_size,
                    *diversity_penalty,
                    &mut row_idx,
                )?,
            };
            outputs.push(group_samples);
        }

        Ok(outputs)
    }

    /// Extracts one processed logits row: repetition penalty and
    /// no-repeat-ngram masking applied over the token history.
    fn processed_row(
        &self,
        logits: &Tensor,
        row_idx: usize,
        params: &SamplingParams,
        token_ids: &[u32],
    ) -> Result<Vec<f32>, SamplerError> {
        let row = logits.i(row_idx)?;
        let row = if params.repetition_penalty == 1.0 {
            row
        } else {
            let start_at = token_ids.len().saturating_sub(params.repeat_last_n);
            candle_transformers::utils::apply_repeat_penalty(
                &row,
                params.repetition_penalty,
                &token_ids[start_at..],
            )?
        };
        let mut row = row.to_vec1::<f32>()?;
        if let Some(ngram_size) = params.no_repeat_ngram_size {
            apply_no_repeat_ngram(&mut row, token_ids, ngram_size);
        }
        Ok(row)
    }

    /// Greedy / multinomial sampling, or verification for sequences that
    /// carry speculative candidates.
    fn sample_single_or_verify(
        &self,
        logits: &Tensor,
        metadata: &SequenceGroupMetadata,
        row_idx: &mut usize,
    ) -> Result<SequenceGroupSamples, SamplerError> {
        let params = &metadata.sampling_params;
        let mut singles = Vec::new();
        let mut verified = Vec::new();
        let mut any_candidates = false;

        for (sequence_id, data) in metadata.sequence_data.iter() {
            let num_candidates = data.get_num_candidate_tokens();
            if num_candidates == 0 {
                let history = history_at(data, data.length());
                let row = self.processed_row(logits, *row_idx, params, &history)?;
                *row_idx += 1;
                let sample = self.sample_token(&row, params, metadata)?;
                singles.push((*sequence_id, sample));
            } else {
                any_candidates = true;
                let verdict =
                    self.verify_candidates(logits, metadata, data, num_candidates, row_idx)?;
                verified.push((*sequence_id, verdict));
            }
        }

        if any_candidates {
            if !singles.is_empty() {
                // Candidates are installed per request; a group mixes modes
                // only if the coordinator misbehaved
                return Err(SamplerError::MixedVerificationGroup(metadata.request_id));
            }
            Ok(SequenceGroupSamples::Verified { samples: verified })
        } else {
            Ok(SequenceGroupSamples::Single { samples: singles })
        }
    }

    /// Samples one token from a processed logits row.
    fn sample_token(
        &self,
        row: &[f32],
        params: &SamplingParams,
        metadata: &SequenceGroupMetadata,
    ) -> Result<SequenceSample, SamplerError> {
        match &params.mode {
            DecodingMode::Greedy => {
                let log_probs = log_softmax_vec(row);
                let token_id = argmax(row);
                Ok(SequenceSample {
                    token_id: token_id as u32,
                    logprob: log_probs[token_id],
                })
            }
            DecodingMode::Multinomial {
                temperature,
                top_k,
                top_p,
            } => {
                let mut rng = metadata
                    .rng
                    .write()
                    .map_err(|e| SamplerError::PoisonError(e.to_string()))?;
                let (token_id, prob) =
                    sample_multinomial(row, *temperature, *top_k, *top_p, &mut rng);
                Ok(SequenceSample {
                    token_id: token_id as u32,
                    logprob: prob.ln(),
                })
            }
            DecodingMode::Beam { .. } => {
                // Beam groups never reach the single-token path
                Err(SamplerError::MixedVerificationGroup(metadata.request_id))
            }
        }
    }

    /// Verifies speculative candidates against the main model's logits.
    ///
    /// Greedy: accept while the row argmax equals the candidate.
    /// Multinomial: accept while `u < min(1, p_main / p_draft)`; on
    /// rejection the corrected token is sampled from the re-normalised
    /// residual `max(0, p_main - p_draft)` at the candidate token.
    /// Either way one bonus token is sampled at the first unverified
    /// position.
    fn verify_candidates(
        &self,
        logits: &Tensor,
        metadata: &SequenceGroupMetadata,
        data: &SequenceData,
        num_candidates: usize,
        row_idx: &mut usize,
    ) -> Result<VerifiedSample, SamplerError> {
        let params = &metadata.sampling_params;
        let all_token_ids = data.get_token_ids();
        let committed_len = data.length() - num_candidates;
        let candidates = &all_token_ids[committed_len..];
        let candidate_logprobs = data.candidate_logprobs();

        let mut accepted = Vec::new();
        let mut bonus = None;

        for (position, candidate) in candidates.iter().enumerate() {
            let history = &all_token_ids[..committed_len + position];
            let row = self.processed_row(logits, *row_idx + position, params, history)?;
            let log_probs = log_softmax_vec(&row);

            let accept = match &params.mode {
                DecodingMode::Greedy => argmax(&row) == *candidate as usize,
                DecodingMode::Multinomial { temperature, .. } => {
                    let probs = softmax_vec(&scale_by_temperature(&row, *temperature));
                    let p_main = probs[*candidate as usize];
                    let p_draft = candidate_logprobs
                        .get(position)
                        .copied()
                        .unwrap_or(0.0)
                        .exp();
                    let mut rng = metadata
                        .rng
                        .write()
                        .map_err(|e| SamplerError::PoisonError(e.to_string()))?;
                    let u: f32 = rng.gen();
                    u < (p_main / p_draft).min(1.0)
                }
                DecodingMode::Beam { .. } => {
                    return Err(SamplerError::MixedVerificationGroup(metadata.request_id));
                }
            };

            if accept {
                accepted.push(SequenceSample {
                    token_id: *candidate,
                    logprob: log_probs[*candidate as usize],
                });
                continue;
            }

            // First unverified position: emit the corrected token
            let sample = match &params.mode {
                DecodingMode::Greedy => {
                    let token_id = argmax(&row);
                    SequenceSample {
                        token_id: token_id as u32,
                        logprob: log_probs[token_id],
                    }
                }
                DecodingMode::Multinomial { temperature, .. } => {
                    let mut probs = softmax_vec(&scale_by_temperature(&row, *temperature));
                    let p_draft = candidate_logprobs
                        .get(position)
                        .copied()
                        .unwrap_or(0.0)
                        .exp();
                    // Residual at the rejected token: the draft probability
                    // is only known at the candidate itself
                    probs[*candidate as usize] =
                        (probs[*candidate as usize] - p_draft).max(0.0);
                    normalize(&mut probs);
                    let mut rng = metadata
                        .rng
                        .write()
                        .map_err(|e| SamplerError::PoisonError(e.to_string()))?;
                    let token_id = draw_from(&probs, &mut rng);
                    SequenceSample {
                        token_id: token_id as u32,
                        logprob: probs[token_id].ln(),
                    }
                }
                // Checked above
                DecodingMode::Beam { .. } => unreachable!(),
            };
            bonus = Some(sample);
            break;
        }

        // Every candidate accepted: the bonus comes from the one-past-the-
        // end distribution
        let bonus = match bonus {
            Some(bonus) => bonus,
            None => {
                let history = &all_token_ids[..];
                let row =
                    self.processed_row(logits, *row_idx + num_candidates, params, history)?;
                self.sample_token(&row, params, metadata)?
            }
        };

        *row_idx += num_candidates + 1;
        let num_removed = num_candidates - accepted.len();
        trace!(
            "Verified {} of {} candidates for request {}",
            accepted.len(),
            num_candidates,
            metadata.request_id
        );
        Ok(VerifiedSample {
            accepted,
            bonus,
            num_removed,
        })
    }

    /// Beam-search expansion: joint `(beam, token)` top-`W` selection on
    /// the combined score `cum_log_prob + log_softmax(logit)`.
    ///
    /// With `num_groups > 1`, groups are expanded in order and a token
    /// already chosen by an earlier group costs `diversity_penalty` per
    /// occurrence, which pushes later groups towards different
    /// continuations.
    fn sample_beam(
        &self,
        logits: &Tensor,
        metadata: &SequenceGroupMetadata,
        num_groups: usize,
        group_size: usize,
        diversity_penalty: f32,
        row_idx: &mut usize,
    ) -> Result<SequenceGroupSamples, SamplerError> {
        let params = &metadata.sampling_params;
        let beam_width = num_groups * group_size;

        // Per-beam candidate pools: each live beam contributes its top
        // 2 * beam_width continuations
        struct BeamCandidates {
            sequence_id: u64,
            cumulative_logprob: f32,
            // (token, logprob), best first
            top: Vec<(usize, f32)>,
        }

        let mut beams = Vec::new();
        for (sequence_id, data) in metadata.sequence_data.iter() {
            let history = history_at(data, data.length());
            let row = self.processed_row(logits, *row_idx, params, &history)?;
            *row_idx += 1;
            let log_probs = log_softmax_vec(&row);
            let mut indexed: Vec<(usize, f32)> =
                log_probs.iter().copied().enumerate().collect();
            indexed.sort_by(|a, b| b.1.total_cmp(&a.1));
            indexed.truncate(2 * beam_width);
            beams.push(BeamCandidates {
                sequence_id: *sequence_id,
                cumulative_logprob: data.cumulative_logprob(),
                top: indexed,
            });
        }

        // Beams are ordered by ascending sequence id (scheduling order);
        // group g owns beams [g * group_size, (g + 1) * group_size). Right
        // after the first expansion fewer beams may be live, in which case
        // every group draws from the ones that exist.
        let mut selections = Vec::with_capacity(beam_width);
        let mut chosen_tokens: Vec<usize> = Vec::with_capacity(beam_width);
        for group in 0..num_groups {
            let group_beams: Vec<&BeamCandidates> = if beams.len() == beam_width {
                beams
                    .iter()
                    .skip(group * group_size)
                    .take(group_size)
                    .collect()
            } else {
                beams.iter().collect()
            };

            // Joint (beam, token) pool for this group
            let mut pool: Vec<(f32, u64, usize, f32)> = Vec::new();
            for beam in &group_beams {
                for (token, logprob) in &beam.top {
                    let mut score = beam.cumulative_logprob + logprob;
                    if diversity_penalty > 0.0 {
                        let occurrences =
                            chosen_tokens.iter().filter(|t| **t == *token).count();
                        score -= diversity_penalty * occurrences as f32;
                    }
                    pool.push((score, beam.sequence_id, *token, *logprob));
                }
            }
            pool.sort_by(|a, b| b.0.total_cmp(&a.0));

            let mut taken = 0;
            let mut used: Vec<(u64, usize)> = Vec::new();
            for (_, sequence_id, token, logprob) in pool {
                if taken == group_size {
                    break;
                }
                if used.contains(&(sequence_id, token)) {
                    continue;
                }
                used.push((sequence_id, token));
                chosen_tokens.push(token);
                selections.push(BeamSelection {
                    parent_sequence_id: sequence_id,
                    token_id: token as u32,
                    logprob,
                });
                taken += 1;
            }
        }

        Ok(SequenceGroupSamples::Beam { selections })
    }
}

/// Token history visible to the penalty pipeline at a given absolute
/// position.
fn history_at(data: &SequenceData, position: usize) -> Vec<u32> {
    let mut token_ids = data.get_token_ids();
    token_ids.truncate(position);
    token_ids
}

/// Bans every token that would complete an already-seen n-gram.
///
/// For each historical window of `ngram_size - 1` tokens equal to the
/// current suffix, the token that followed it is masked to -inf.
pub(crate) fn apply_no_repeat_ngram(logits: &mut [f32], token_ids: &[u32], ngram_size: usize) {
    if ngram_size == 0 || token_ids.len() + 1 < ngram_size {
        return;
    }
    let prefix_len = ngram_size - 1;
    let suffix = &token_ids[token_ids.len() - prefix_len..];
    for window_start in 0..=(token_ids.len() - prefix_len) {
        let window = &token_ids[window_start..window_start + prefix_len];
        if window == suffix {
            if let Some(&banned) = token_ids.get(window_start + prefix_len) {
                if let Some(logit) = logits.get_mut(banned as usize) {
                    *logit = f32::NEG_INFINITY;
                }
            }
        }
    }
}

/// Index of the largest logit.
pub(crate) fn argmax(row: &[f32]) -> usize {
    row.iter()
        .enumerate()
        .max_by(|a, b| a.1.total_cmp(b.1))
        .map(|(idx, _)| idx)
        .unwrap_or(0)
}

/// Numerically stable log-softmax over a logits row.
pub(crate) fn log_softmax_vec(row: &[f32]) -> Vec<f32> {
    let max = row.iter().copied().fold(f32::NEG_INFINITY, f32::max);
    let log_sum_exp = row.iter().map(|l| (l - max).exp()).sum::<f32>().ln() + max;
    row.iter().map(|l| l - log_sum_exp).collect()
}

/// Numerically stable softmax over a logits row.
pub(crate) fn softmax_vec(row: &[f32]) -> Vec<f32> {
    let max = row.iter().copied().fold(f32::NEG_INFINITY, f32::max);
    let mut probs: Vec<f32> = row.iter().map(|l| (l - max).exp()).collect();
    normalize(&mut probs);
    probs
}

fn scale_by_temperature(row: &[f32], temperature: f32) -> Vec<f32> {
    row.iter().map(|l| l / temperature).collect()
}

fn normalize(probs: &mut [f32]) {
    let sum: f32 = probs.iter().sum();
    if sum > 0.0 {
        for p in probs.iter_mut() {
            *p /= sum;
        }
    }
}

/// Draws an index from a normalised probability vector.
fn draw_from(probs: &[f32], rng: &mut StdRng) -> usize {
    let r: f32 = rng.gen();
    let mut cumsum = 0.0f32;
    for (idx, p) in probs.iter().enumerate() {
        cumsum += p;
        if r < cumsum {
            return idx;
        }
    }
    // Numerical edge case: fall back to the last positive entry
    probs
        .iter()
        .rposition(|p| *p > 0.0)
        .unwrap_or(probs.len() - 1)
}

/// Multinomial sampling pipeline: temperature scale, top-k truncation,
/// softmax, top-p truncation, draw.
///
/// # Returns
/// `(token_id, probability)` of the drawn token under the final, truncated
/// and re-normalised distribution.
pub(crate) fn sample_multinomial(
    row: &[f32],
    temperature: f32,
    top_k: Option<usize>,
    top_p: f32,
    rng: &mut StdRng,
) -> (usize, f32) {
    // (index, scaled logit) pairs, sorted descending
    let mut candidates: Vec<(usize, f32)> = row
        .iter()
        .enumerate()
        .map(|(idx, l)| (idx, l / temperature))
        .collect();
    candidates.sort_by(|a, b| b.1.total_cmp(&a.1));

    if let Some(top_k) = top_k {
        if top_k < candidates.len() {
            candidates.truncate(top_k);
        }
    }

    let max_logit = candidates[0].1;
    let mut probs: Vec<f32> = candidates.iter().map(|(_, l)| (l - max_logit).exp()).collect();
    normalize(&mut probs);

    if top_p < 1.0 {
        let mut cumsum = 0.0f32;
        let mut cutoff = probs.len();
        for (idx, p) in probs.iter().enumerate() {
            cumsum += p;
            if cumsum >= top_p {
                cutoff = idx + 1;
                break;
            }
        }
        candidates.truncate(cutoff);
        probs.truncate(cutoff);
        normalize(&mut probs);
    }

    let drawn = draw_from(&probs, rng);
    (candidates[drawn].0, probs[drawn])
}

#[derive(Debug, Error)]
pub enum SamplerError {
    #[error("Candle error: `{0}`")]
    CandleError(#[from] candle_core::Error),
    #[error("Invalid logits: got `{0}` rows, expected `{1}`")]
    InvalidLogits(usize, usize),
    #[error("Poison error: `{0}`")]
    PoisonError(String),
    #[error("Request `{0}` mixes speculative candidates with plain sequences")]
    MixedVerificationGroup(u64),
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sampling_params::{SamplingParams, StopCriteria};
    use candle_core::Device;
    use rand::SeedableRng;
    use std::collections::HashMap;
    use std::sync::RwLock;

    const VOCAB: usize = 8;

    fn metadata_for(
        params: SamplingParams,
        sequence_data: Vec<(u64, SequenceData)>,
        do_sample: bool,
    ) -> Arc<SequenceGroupMetadata> {
        let seed = params.seed();
        Arc::new(SequenceGroupMetadata {
            request_id: 0,
            is_prompt: false,
            sequence_data,
            block_tables: HashMap::new(),
            do_sample,
            token_chunk_size: 1,
            sampling_params: params,
            rng: Arc::new(RwLock::new(StdRng::seed_from_u64(seed))),
        })
    }

    fn logits_from_rows(rows: Vec<Vec<f32>>) -> Tensor {
        let num_rows = rows.len();
        let flat: Vec<f32> = rows.into_iter().flatten().collect();
        Tensor::new(flat, &Device::Cpu)
            .unwrap()
            .reshape((num_rows, VOCAB))
            .unwrap()
    }

    fn decode_data(prompt: Vec<u32>, output: Vec<u32>) -> SequenceData {
        let mut data = SequenceData::new(prompt);
        let prompt_len = data.get_prompt_len();
        data.update_num_computed_tokens(prompt_len).unwrap();
        for token in output {
            data.add_token_id(token, -0.5);
            data.update_num_computed_tokens(1).unwrap();
        }
        data
    }

    fn row_peaked_at(token: usize) -> Vec<f32> {
        let mut row = vec![0.0f32; VOCAB];
        row[token] = 8.0;
        row
    }

    #[test]
    fn test_greedy_picks_argmax() {
        let sampler = Sampler::new();
        let metadata = metadata_for(
            SamplingParams::greedy(),
            vec![(0, decode_data(vec![1, 2], vec![]))],
            true,
        );
        let logits = logits_from_rows(vec![row_peaked_at(5)]);

        let samples = sampler.sample(&logits, &[metadata]).unwrap();
        match &samples[0] {
            SequenceGroupSamples::Single { samples } => {
                assert_eq!(samples[0].1.token_id, 5);
                assert!(samples[0].1.logprob <= 0.0);
            }
            other => panic!("Expected single samples, got {other:?}"),
        }
    }

    #[test]
    fn test_multinomial_is_deterministic_under_seed() {
        let sampler = Sampler::new();
        let mut params = SamplingParams::multinomial();
        params.seed = Some(42);

        let sample_once = || {
            let metadata = metadata_for(
                params.clone(),
                vec![(0, decode_data(vec![1, 2], vec![]))],
                true,
            );
            let logits = logits_from_rows(vec![vec![0.5, 1.0, 0.2, 3.0, 0.1, 0.7, 2.0, 0.9]]);
            match &sampler.sample(&logits, &[metadata]).unwrap()[0] {
                SequenceGroupSamples::Single { samples } => samples[0].1.token_id,
                other => panic!("Expected single samples, got {other:?}"),
            }
        };

        assert_eq!(sample_once(), sample_once());
    }

    #[test]
    fn test_repetition_penalty_discourages_repeats() {
        let sampler = Sampler::new();
        let mut params = SamplingParams::greedy();
        params.repetition_penalty = 10.0;

        // Token 3 leads by a nose but was already generated
        let mut row = vec![0.0f32; VOCAB];
        row[3] = 1.0;
        row[4] = 0.9;
        let metadata = metadata_for(
            params,
            vec![(0, decode_data(vec![1], vec![3]))],
            true,
        );
        let logits = logits_from_rows(vec![row]);

        match &sampler.sample(&logits, &[metadata]).unwrap()[0] {
            SequenceGroupSamples::Single { samples } => {
                assert_eq!(samples[0].1.token_id, 4);
            }
            other => panic!("Expected single samples, got {other:?}"),
        }
    }

    #[test]
    fn test_no_repeat_ngram_masks_continuation() {
        // History ... 1 2 ... 1 2 -> token 3 followed (1, 2) before, ban it
        let mut logits = vec![0.0f32; VOCAB];
        logits[3] = 5.0;
        apply_no_repeat_ngram(&mut logits, &[1, 2, 3, 7, 1, 2], 3);
        assert_eq!(logits[3], f32::NEG_INFINITY);

        // Unrelated suffix stays untouched
        let mut logits = vec![0.0f32; VOCAB];
        logits[3] = 5.0;
        apply_no_repeat_ngram(&mut logits, &[1, 2, 3, 7, 2, 2], 3);
        assert_eq!(logits[3], 5.0);
    }

    #[test]
    fn test_greedy_verification_accepts_matching_prefix() {
        let sampler = Sampler::new();
        // Committed context [1 2 3 4], candidates [5 6 7]
        let mut data = decode_data(vec![1, 2, 3], vec![4]);
        data.append_candidate_tokens(&[5, 6, 7], &[-0.1, -0.1, -0.1]);
        let metadata = metadata_for(SamplingParams::greedy(), vec![(0, data)], true);

        // Rows verify candidates in order; the third disagrees (says 2)
        let logits = logits_from_rows(vec![
            row_peaked_at(5),
            row_peaked_at(6),
            row_peaked_at(2),
            row_peaked_at(0),
        ]);

        match &sampler.sample(&logits, &[metadata]).unwrap()[0] {
            SequenceGroupSamples::Verified { samples } => {
                let verdict = &samples[0].1;
                assert_eq!(verdict.accepted.len(), 2);
                assert_eq!(verdict.accepted[0].token_id, 5);
                assert_eq!(verdict.accepted[1].token_id, 6);
                assert_eq!(verdict.bonus.token_id, 2);
                assert_eq!(verdict.num_removed, 1);
            }
            other => panic!("Expected verified samples, got {other:?}"),
        }
    }

    #[test]
    fn test_greedy_verification_all_accepted_gets_bonus() {
        let sampler = Sampler::new();
        let mut data = decode_data(vec![1, 2, 3], vec![4]);
        data.append_candidate_tokens(&[5, 6], &[-0.1, -0.1]);
        let metadata = metadata_for(SamplingParams::greedy(), vec![(0, data)], true);

        let logits = logits_from_rows(vec![
            row_peaked_at(5),
            row_peaked_at(6),
            row_peaked_at(7),
        ]);

        match &sampler.sample(&logits, &[metadata]).unwrap()[0] {
            SequenceGroupSamples::Verified { samples } => {
                let verdict = &samples[0].1;
                assert_eq!(verdict.accepted.len(), 2);
                assert_eq!(verdict.bonus.token_id, 7);
                assert_eq!(verdict.num_removed, 0);
            }
            other => panic!("Expected verified samples, got {other:?}"),
        }
    }

    #[test]
    fn test_beam_expansion_from_single_parent() {
        let sampler = Sampler::new();
        let params = SamplingParams::beam_search();
        let metadata = metadata_for(
            params,
            vec![(0, decode_data(vec![7, 8], vec![]))],
            true,
        );
        let logits = logits_from_rows(vec![vec![0.1, 3.0, 2.0, 1.0, 0.5, 0.0, 0.0, 0.0]]);

        match &sampler.sample(&logits, &[metadata]).unwrap()[0] {
            SequenceGroupSamples::Beam { selections } => {
                assert_eq!(selections.len(), 4);
                assert!(selections.iter().all(|s| s.parent_sequence_id == 0));
                // Best continuation first
                assert_eq!(selections[0].token_id, 1);
                assert_eq!(selections[1].token_id, 2);
            }
            other => panic!("Expected beam selections, got {other:?}"),
        }
    }

    #[test]
    fn test_diverse_beam_groups_avoid_each_other() {
        let sampler = Sampler::new();
        let mut params = SamplingParams::beam_search();
        params.mode = crate::sampling_params::DecodingMode::Beam {
            num_groups: 2,
            group_size: 1,
            diversity_penalty: 100.0,
            stop_criteria: StopCriteria::Never,
            length_penalty: 1.0,
        };
        let metadata = metadata_for(
            params,
            vec![(0, decode_data(vec![7, 8], vec![]))],
            true,
        );
        let logits = logits_from_rows(vec![vec![0.1, 3.0, 2.9, 1.0, 0.5, 0.0, 0.0, 0.0]]);

        match &sampler.sample(&logits, &[metadata]).unwrap()[0] {
            SequenceGroupSamples::Beam { selections } => {
                assert_eq!(selections.len(), 2);
                // The huge penalty forces the second group off token 1
                assert_eq!(selections[0].token_id, 1);
                assert_eq!(selections[1].token_id, 2);
            }
            other => panic!("Expected beam selections, got {other:?}"),
        }
    }

    #[test]
    fn test_row_count_mismatch_is_rejected() {
        let sampler = Sampler::new();
        let metadata = metadata_for(
            SamplingParams::greedy(),
            vec![(0, decode_data(vec![1, 2], vec![]))],
            true,
        );
        let logits = logits_from_rows(vec![row_peaked_at(0), row_peaked_at(1)]);
        assert!(matches!(
            sampler.sample(&logits, &[metadata]),
            Err(SamplerError::InvalidLogits(2, 1))
        ));
    }
}

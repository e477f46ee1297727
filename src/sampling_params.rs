use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Default PRNG seed used when the request does not pin one.
pub const DEFAULT_RANDOM_SEED: u64 = 1_283_768_955;

/// Termination rule for a beam-search group.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Deserialize, Serialize)]
pub enum StopCriteria {
    /// Stop as soon as `beam_width` beams have finished
    Early,
    /// Stop once no running beam can exceed the best finished beam's
    /// length-penalised score
    Heuristic,
    /// Run every beam to `max_new_tokens`
    Never,
}

/// Decoding mode of a request.
///
/// Modeled as a tagged variant: the sampler dispatches on the mode, the
/// engine never needs to know more than which family it is in.
#[derive(Clone, Debug, PartialEq, Deserialize, Serialize)]
pub enum DecodingMode {
    /// Pick the argmax token at every step
    Greedy,
    /// Sample from the temperature-scaled, top-k / top-p filtered
    /// distribution
    Multinomial {
        /// Logits are divided by this before softmax
        temperature: f32,
        /// Keep only the `top_k` most likely tokens; `None` considers all
        top_k: Option<usize>,
        /// Nucleus mass; keep the smallest prefix of the sorted
        /// distribution whose probability sum reaches `top_p`
        top_p: f32,
    },
    /// Beam search over `num_groups * group_size` hypotheses
    Beam {
        /// Number of diverse groups
        num_groups: usize,
        /// Beams per group
        group_size: usize,
        /// Subtracted from a candidate's score once per earlier-group
        /// occurrence of the same token; 0.0 disables diversity
        diversity_penalty: f32,
        /// Termination rule
        stop_criteria: StopCriteria,
        /// Finished beams are ranked by `cum_log_prob / len^length_penalty`
        length_penalty: f32,
    },
}

/// `SamplingParams` - Per-request generation parameters.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct SamplingParams {
    /// Maximum number of tokens generated per sequence
    pub max_new_tokens: usize,
    /// Keep generating after the EOS token
    pub ignore_eos: bool,
    /// Decoding mode
    pub mode: DecodingMode,
    /// Penalty applied to the logits of already-generated tokens.
    /// 1.0 means no penalty.
    pub repetition_penalty: f32,
    /// Number of trailing tokens considered by the repetition penalty
    pub repeat_last_n: usize,
    /// Forbid repeating any n-gram of this size; `None` disables the mask
    pub no_repeat_ngram_size: Option<usize>,
    /// Number of sequences to return; `None` returns every beam
    pub num_return_sequences: Option<usize>,
    /// Generation stops when one of these tokens is produced
    pub stop_token_ids: Vec<u32>,
    /// PRNG seed for multinomial sampling and speculative verification
    pub seed: Option<u64>,
}

impl SamplingParams {
    /// Greedy decoding preset
    pub fn greedy() -> Self {
        Self {
            max_new_tokens: 30,
            ignore_eos: false,
            mode: DecodingMode::Greedy,
            repetition_penalty: 1.0,
            repeat_last_n: 64,
            no_repeat_ngram_size: None,
            num_return_sequences: None,
            stop_token_ids: vec![],
            seed: None,
        }
    }

    /// Multinomial sampling preset
    pub fn multinomial() -> Self {
        Self {
            mode: DecodingMode::Multinomial {
                temperature: 0.8,
                top_k: None,
                top_p: 1.0,
            },
            ..Self::greedy()
        }
    }

    /// Beam search preset
    pub fn beam_search() -> Self {
        Self {
            mode: DecodingMode::Beam {
                num_groups: 1,
                group_size: 4,
                diversity_penalty: 0.0,
                stop_criteria: StopCriteria::Heuristic,
                length_penalty: 1.0,
            },
            ..Self::greedy()
        }
    }

    /// Checks if this request uses beam search
    pub fn is_beam_search(&self) -> bool {
        matches!(self.mode, DecodingMode::Beam { .. })
    }

    /// Checks if this request uses greedy decoding
    pub fn is_greedy(&self) -> bool {
        matches!(self.mode, DecodingMode::Greedy)
    }

    /// Total number of concurrent hypotheses, `num_groups * group_size`
    /// for beam search and 1 otherwise
    pub fn beam_width(&self) -> usize {
        match self.mode {
            DecodingMode::Beam {
                num_groups,
                group_size,
                ..
            } => num_groups * group_size,
            _ => 1,
        }
    }

    /// The PRNG seed for this request
    pub fn seed(&self) -> u64 {
        self.seed.unwrap_or(DEFAULT_RANDOM_SEED)
    }

    /// Validates the parameters of a request.
    ///
    /// Malformed parameters are rejected before the request enters the
    /// waiting queue, so the scheduler and sampler only ever observe
    /// well-formed state.
    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.repetition_penalty <= 0.0 {
            return Err(ValidationError::RepetitionPenalty(self.repetition_penalty));
        }
        if let Some(ngram_size) = self.no_repeat_ngram_size {
            if ngram_size == 0 {
                return Err(ValidationError::NoRepeatNgramSize);
            }
        }
        if self.num_return_sequences == Some(0) {
            return Err(ValidationError::NumReturnSequences);
        }
        match self.mode {
            DecodingMode::Greedy => {}
            DecodingMode::Multinomial {
                temperature,
                top_k,
                top_p,
            } => {
                if temperature <= 0.0 {
                    return Err(ValidationError::Temperature(temperature));
                }
                if top_k == Some(0) {
                    return Err(ValidationError::TopK);
                }
                if !(top_p > 0.0 && top_p <= 1.0) {
                    return Err(ValidationError::TopP(top_p));
                }
            }
            DecodingMode::Beam {
                num_groups,
                group_size,
                diversity_penalty,
                ..
            } => {
                if num_groups < 1 {
                    return Err(ValidationError::NumGroups(num_groups));
                }
                if group_size < 1 {
                    return Err(ValidationError::GroupSize(group_size));
                }
                if diversity_penalty < 0.0 {
                    return Err(ValidationError::DiversityPenalty(diversity_penalty));
                }
                if let Some(n) = self.num_return_sequences {
                    if n > num_groups * group_size {
                        return Err(ValidationError::NumReturnSequences);
                    }
                }
            }
        }
        Ok(())
    }
}

/// Rejections raised by `add_request` before a request enters the queue.
#[derive(Debug, Error)]
pub enum ValidationError {
    #[error("`temperature` must be strictly positive, got `{0}`")]
    Temperature(f32),
    #[error("`top_k` must be strictly positive")]
    TopK,
    #[error("`top_p` must be in (0, 1], got `{0}`")]
    TopP(f32),
    #[error("`num_groups` must be at least 1, got `{0}`")]
    NumGroups(usize),
    #[error("`group_size` must be at least 1, got `{0}`")]
    GroupSize(usize),
    #[error("`diversity_penalty` must be non-negative, got `{0}`")]
    DiversityPenalty(f32),
    #[error("`repetition_penalty` must be strictly positive, got `{0}`")]
    RepetitionPenalty(f32),
    #[error("`no_repeat_ngram_size` must be strictly positive")]
    NoRepeatNgramSize,
    #[error("`num_return_sequences` must be in 1..=beam_width")]
    NumReturnSequences,
    #[error("Prompt must not be empty")]
    EmptyPrompt,
    #[error("Prompt length `{0}` exceeds the per-step token budget `{1}` and chunked prefill is disabled")]
    PromptTooLong(usize, usize),
    #[error("Prompt length `{0}` exceeds `max_model_len` `{1}`")]
    PromptExceedsModelLen(usize, usize),
    #[error("No tokenizer was configured, string prompts cannot be encoded")]
    MissingTokenizer,
    #[error("Tokenizer error: `{0}`")]
    TokenizerError(String),
    #[error("Streaming requires batch size 1 and a non-beam decoding mode")]
    InvalidStreamer,
    #[error("Beam search is not supported with speculative decoding")]
    BeamSearchWithSpeculative,
    #[error("Batch size mismatch: `{0}` prompts but `{1}` sampling parameter sets")]
    BatchSizeMismatch(usize, usize),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_presets_are_valid() {
        assert!(SamplingParams::greedy().validate().is_ok());
        assert!(SamplingParams::multinomial().validate().is_ok());
        assert!(SamplingParams::beam_search().validate().is_ok());
    }

    #[test]
    fn test_invalid_top_p_is_rejected() {
        let mut params = SamplingParams::multinomial();
        params.mode = DecodingMode::Multinomial {
            temperature: 1.0,
            top_k: None,
            top_p: 0.0,
        };
        assert!(matches!(params.validate(), Err(ValidationError::TopP(_))));

        params.mode = DecodingMode::Multinomial {
            temperature: 1.0,
            top_k: None,
            top_p: 1.5,
        };
        assert!(matches!(params.validate(), Err(ValidationError::TopP(_))));
    }

    #[test]
    fn test_invalid_beam_width_is_rejected() {
        let mut params = SamplingParams::beam_search();
        params.mode = DecodingMode::Beam {
            num_groups: 1,
            group_size: 0,
            diversity_penalty: 0.0,
            stop_criteria: StopCriteria::Heuristic,
            length_penalty: 1.0,
        };
        assert!(matches!(
            params.validate(),
            Err(ValidationError::GroupSize(0))
        ));
    }

    #[test]
    fn test_beam_width() {
        let params = SamplingParams::beam_search();
        assert_eq!(params.beam_width(), 4);
        assert_eq!(SamplingParams::greedy().beam_width(), 1);
    }
}

use thiserror::Error;

/// Configuration for the paged KV cache.
///
/// Args:
///   block_size: Size of a cache block in number of tokens.
///   num_blocks: Total number of physical blocks in the pool.
///   enable_prefix_caching: Share fully-populated blocks between requests
///       with identical leading tokens.
///   use_cache_eviction: Reclaim low-importance blocks from the middle of
///       long sequences when the pool runs low.
#[derive(Clone, Debug)]
pub struct CacheConfig {
    /// Block size, in tokens
    block_size: usize,
    /// Total number of physical blocks
    num_blocks: usize,
    /// Enable automatic prefix caching
    enable_prefix_caching: bool,
    /// Enable importance-based cache eviction
    use_cache_eviction: bool,
}

impl CacheConfig {
    /// Constructor
    pub fn new(
        block_size: usize,
        num_blocks: usize,
        enable_prefix_caching: bool,
        use_cache_eviction: bool,
    ) -> Result<Self, CacheConfigError> {
        let this = Self {
            block_size,
            num_blocks,
            enable_prefix_caching,
            use_cache_eviction,
        };
        this.verify_args()?;
        Ok(this)
    }

    /// Verify `CacheConfig` arguments
    fn verify_args(&self) -> Result<(), CacheConfigError> {
        if self.block_size == 0 {
            return Err(CacheConfigError::InvalidBlockSize(self.block_size));
        }
        if self.num_blocks == 0 {
            return Err(CacheConfigError::InvalidNumBlocks(self.num_blocks));
        }
        Ok(())
    }

    /// Getter for `block_size`
    pub fn block_size(&self) -> usize {
        self.block_size
    }

    /// Getter for `num_blocks`
    pub fn num_blocks(&self) -> usize {
        self.num_blocks
    }

    /// Getter for `enable_prefix_caching`
    pub fn enable_prefix_caching(&self) -> bool {
        self.enable_prefix_caching
    }

    /// Getter for `use_cache_eviction`
    pub fn use_cache_eviction(&self) -> bool {
        self.use_cache_eviction
    }
}

#[derive(Debug, Error)]
pub enum CacheConfigError {
    #[error("Invalid block size: `{0}`")]
    InvalidBlockSize(usize),
    #[error("Invalid number of blocks: `{0}`")]
    InvalidNumBlocks(usize),
}

/// Scheduler configuration.
///
/// Args:
///   max_num_batched_tokens: Maximum number of tokens to be processed in
///      a single iteration.
///   max_num_sequences: Maximum number of sequences to be processed in a
///      single iteration.
///   max_model_len: Maximum length of a sequence (including prompt and
///      generated text).
///   enable_chunked_prefill: If true, prefill requests can be chunked based
///      on the remaining `max_num_batched_tokens` so that decodes are not
///      starved by long prompts.
///   preempt_by_swapping: If true, preempted groups park in the swapped
///      queue with their token ids intact; otherwise they are re-queued at
///      the front of the waiting queue for recomputation.
#[derive(Clone, Debug)]
pub struct SchedulerConfig {
    /// Maximum number of batched tokens
    max_num_batched_tokens: usize,
    /// Maximum number of sequences
    max_num_sequences: usize,
    /// Maximum length of a sequence (including prompt and generated text)
    max_model_len: usize,
    /// Enable chunked prefill
    enable_chunked_prefill: bool,
    /// Preempt by swapping out instead of recomputation
    preempt_by_swapping: bool,
}

impl SchedulerConfig {
    /// Constructor
    pub fn new(
        max_num_batched_tokens: usize,
        max_num_sequences: usize,
        max_model_len: usize,
        enable_chunked_prefill: bool,
        preempt_by_swapping: bool,
    ) -> Result<Self, SchedulerConfigError> {
        let this = Self {
            max_num_batched_tokens,
            max_num_sequences,
            max_model_len,
            enable_chunked_prefill,
            preempt_by_swapping,
        };
        this.verify_args()?;
        Ok(this)
    }

    fn verify_args(&self) -> Result<(), SchedulerConfigError> {
        if self.max_num_batched_tokens < self.max_model_len && !self.enable_chunked_prefill {
            return Err(SchedulerConfigError::FailedVerifySchedulerConfig(format!(
                "`max_num_batched_tokens` ({}) is smaller than `max_model_len` ({}). This effectively limits the maximum sequence length to `max_num_batched_tokens` and makes the scheduler reject longer sequences. Please increase `max_num_batched_tokens`, decrease `max_model_len` or enable chunked prefill.",
                self.max_num_batched_tokens, self.max_model_len
            )));
        }

        if self.max_num_batched_tokens < self.max_num_sequences {
            return Err(SchedulerConfigError::FailedVerifySchedulerConfig(format!(
                "max_num_batched_tokens ({}) must be greater than or equal to max_num_sequences ({}).",
                self.max_num_batched_tokens, self.max_num_sequences
            )));
        }

        Ok(())
    }

    /// Getter for `enable_chunked_prefill`
    pub fn enable_chunked_prefill(&self) -> bool {
        self.enable_chunked_prefill
    }

    /// Getter for `max_model_len`
    pub fn max_model_len(&self) -> usize {
        self.max_model_len
    }

    /// Getter for `max_num_batched_tokens`
    pub fn max_num_batched_tokens(&self) -> usize {
        self.max_num_batched_tokens
    }

    /// Getter for `max_num_sequences`
    pub fn max_num_sequences(&self) -> usize {
        self.max_num_sequences
    }

    /// Getter for `preempt_by_swapping`
    pub fn preempt_by_swapping(&self) -> bool {
        self.preempt_by_swapping
    }
}

#[derive(Debug, Error)]
pub enum SchedulerConfigError {
    #[error("Failed to verify scheduler config: `{0}`")]
    FailedVerifySchedulerConfig(String),
}

/// Configuration of the speculative-decoding coordinator.
#[derive(Clone, Debug)]
pub struct SpeculativeConfig {
    /// Number of candidate tokens the draft engine proposes per
    /// coordinator step
    num_speculative_tokens: usize,
    /// Hidden size of the main model, used for the cache split
    main_hidden_size: usize,
    /// Hidden size of the draft model, used for the cache split
    draft_hidden_size: usize,
}

impl SpeculativeConfig {
    /// Constructor
    pub fn new(
        num_speculative_tokens: usize,
        main_hidden_size: usize,
        draft_hidden_size: usize,
    ) -> Result<Self, SpeculativeConfigError> {
        if num_speculative_tokens == 0 {
            return Err(SpeculativeConfigError::InvalidNumSpeculativeTokens);
        }
        if main_hidden_size == 0 || draft_hidden_size == 0 {
            return Err(SpeculativeConfigError::InvalidHiddenSize);
        }
        Ok(Self {
            num_speculative_tokens,
            main_hidden_size,
            draft_hidden_size,
        })
    }

    /// Getter for `num_speculative_tokens`
    pub fn num_speculative_tokens(&self) -> usize {
        self.num_speculative_tokens
    }

    /// Splits a shared block budget between the main and the draft cache,
    /// proportionally to the models' hidden sizes. The draft cache always
    /// receives at least one block.
    pub fn split_cache(&self, num_blocks: usize) -> (usize, usize) {
        let k = self.draft_hidden_size as f32
            / (self.main_hidden_size + self.draft_hidden_size) as f32;
        let mut main_blocks = (num_blocks as f32 * (1.0 - k)).ceil() as usize;
        let mut draft_blocks = num_blocks.saturating_sub(main_blocks);
        if draft_blocks == 0 && main_blocks > 1 {
            main_blocks -= 1;
            draft_blocks = 1;
        }
        (main_blocks, draft_blocks)
    }
}

#[derive(Debug, Error)]
pub enum SpeculativeConfigError {
    #[error("Number of speculative tokens must be positive")]
    InvalidNumSpeculativeTokens,
    #[error("Model hidden sizes must be positive")]
    InvalidHiddenSize,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scheduler_config_rejects_small_token_budget() {
        assert!(SchedulerConfig::new(16, 4, 512, false, false).is_err());
        assert!(SchedulerConfig::new(16, 4, 512, true, false).is_ok());
        assert!(SchedulerConfig::new(2, 4, 2, false, false).is_err());
    }

    #[test]
    fn test_cache_split_favors_main_model() {
        let config = SpeculativeConfig::new(4, 4096, 1024).unwrap();
        let (main, draft) = config.split_cache(100);
        assert_eq!(main + draft, 100);
        assert!(main > draft);
        assert!(draft >= 1);

        // Tiny budgets still leave the draft model one block
        let (main, draft) = config.split_cache(2);
        assert!(main >= 1 && draft >= 1);
    }
}

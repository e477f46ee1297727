use std::{
    collections::HashMap,
    sync::Mutex,
    time::Instant,
};

use candle_core::Device;
use thiserror::Error;
use tracing::{info, info_span, instrument, trace, Span};

use crate::{
    config::{
        CacheConfig, CacheConfigError, SchedulerConfig, SpeculativeConfig,
        SpeculativeConfigError,
    },
    engine::{ContinuousBatchingEngine, EngineError, Pipeline, PipelineMetrics, PromptInput, Streamer},
    model_executor::ModelExecutor,
    sampling_params::{SamplingParams, ValidationError},
    stream::GenerationHandle,
    tokenizer::{are_tokenizers_equal, Tokenizer},
    types::GenerationResult,
};

/// Aggregated statistics of a speculative-decoding run.
#[derive(Clone, Debug, Default)]
pub struct SpeculativeDecodingMetrics {
    /// Seconds spent inside the draft engine's multisteps
    pub draft_duration: f32,
    /// Seconds spent inside the main engine's steps
    pub main_duration: f32,
    /// Per-request acceptance rates (percent), one entry per verification
    acceptance_rate: HashMap<u64, Vec<f32>>,
    /// Per-request count of draft tokens the main model ratified
    draft_accepted_tokens: HashMap<u64, usize>,
}

impl SpeculativeDecodingMetrics {
    /// Records one verification's acceptance rate for a request.
    pub fn update_acceptance_rate(&mut self, request_id: u64, acceptance_rate: f32) {
        self.acceptance_rate
            .entry(request_id)
            .or_default()
            .push(acceptance_rate);
        metrics::histogram!("speculative-acceptance-rate").record(acceptance_rate as f64);
    }

    /// Records accepted draft tokens for a request.
    pub fn update_draft_accepted_tokens(&mut self, request_id: u64, num_accepted: usize) {
        *self.draft_accepted_tokens.entry(request_id).or_default() += num_accepted;
    }

    /// Mean acceptance rate of a request, in percent.
    pub fn avg_acceptance_rate(&self, request_id: u64) -> Option<f32> {
        let rates = self.acceptance_rate.get(&request_id)?;
        if rates.is_empty() {
            return None;
        }
        Some(rates.iter().sum::<f32>() / rates.len() as f32)
    }

    /// Total draft tokens the main model ratified for a request.
    pub fn draft_accepted_tokens(&self, request_id: u64) -> usize {
        self.draft_accepted_tokens
            .get(&request_id)
            .copied()
            .unwrap_or(0)
    }
}

/// `SpeculativeCoordinator` - Lock-step coordination of a main (large,
/// accurate) and a draft (small, fast) engine.
///
/// Per step, under one mutex that also blocks `add_request`: both engines
/// drain their awaiting queues, the draft engine proposes
/// `num_speculative_tokens` candidates per active sequence, the candidates
/// are installed uncommitted on the main engine's sequences, one main step
/// verifies them in bulk, and the draft engine is rolled back to the main
/// engine's verified state.
///
/// Both engines must agree on tokenization; construction refuses
/// mismatched tokenizers because accepted draft tokens would otherwise
/// mean different text on each side.
pub struct SpeculativeCoordinator<M: ModelExecutor, D: ModelExecutor> {
    /// The main engine, source of truth for generated text
    pub(crate) main: ContinuousBatchingEngine<M>,
    /// The draft engine, proposing candidates
    pub(crate) draft: ContinuousBatchingEngine<D>,
    /// Number of candidates proposed per coordinator step
    num_speculative_tokens: usize,
    /// Draft-side handles, kept alive so dropping them does not cancel the
    /// draft requests
    draft_generations: Mutex<HashMap<u64, GenerationHandle>>,
    /// Guards the lock-step invariant between both engines
    generations_mutex: Mutex<()>,
    /// Run statistics
    sd_metrics: SpeculativeDecodingMetrics,
    /// Tracing span
    span: Span,
}

impl<M: ModelExecutor, D: ModelExecutor> SpeculativeCoordinator<M, D> {
    /// Constructor.
    ///
    /// When the caller supplies no dedicated draft cache budget, the block
    /// pool of `cache_config` is split between the engines proportionally
    /// to the models' hidden sizes; the draft side always receives at
    /// least one block.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        main_executor: M,
        draft_executor: D,
        main_tokenizer: Option<Tokenizer>,
        draft_tokenizer: Option<Tokenizer>,
        cache_config: CacheConfig,
        scheduler_config: SchedulerConfig,
        num_speculative_tokens: usize,
        device: Device,
    ) -> Result<Self, SpeculativeError> {
        // Main and draft must tokenize identically
        match (&main_tokenizer, &draft_tokenizer) {
            (None, None) => {}
            (Some(main), Some(draft)) => {
                if !are_tokenizers_equal(main, draft)
                    .map_err(|_| SpeculativeError::TokenizerMismatch)?
                {
                    return Err(SpeculativeError::TokenizerMismatch);
                }
            }
            _ => return Err(SpeculativeError::TokenizerMismatch),
        }

        let speculative_config = SpeculativeConfig::new(
            num_speculative_tokens,
            main_executor.hidden_size(),
            draft_executor.hidden_size(),
        )?;
        let (main_blocks, draft_blocks) =
            speculative_config.split_cache(cache_config.num_blocks());
        info!(
            "Splitting {} cache blocks: {} for the main model, {} for the draft model",
            cache_config.num_blocks(),
            main_blocks,
            draft_blocks
        );

        let main_cache_config = CacheConfig::new(
            cache_config.block_size(),
            main_blocks,
            cache_config.enable_prefix_caching(),
            cache_config.use_cache_eviction(),
        )?;
        let draft_cache_config = CacheConfig::new(
            cache_config.block_size(),
            draft_blocks.max(1),
            cache_config.enable_prefix_caching(),
            cache_config.use_cache_eviction(),
        )?;

        let main = ContinuousBatchingEngine::new(
            main_executor,
            main_tokenizer,
            main_cache_config,
            scheduler_config.clone(),
            device.clone(),
        )?;
        let draft = ContinuousBatchingEngine::new(
            draft_executor,
            draft_tokenizer,
            draft_cache_config,
            scheduler_config,
            device,
        )?;

        Ok(Self {
            main,
            draft,
            num_speculative_tokens: speculative_config.num_speculative_tokens(),
            draft_generations: Mutex::new(HashMap::new()),
            generations_mutex: Mutex::new(()),
            sd_metrics: SpeculativeDecodingMetrics::default(),
            span: info_span!("speculative-coordinator"),
        })
    }

    /// Getter for the accumulated speculative-decoding metrics.
    pub fn get_speculative_metrics(&self) -> SpeculativeDecodingMetrics {
        self.sd_metrics.clone()
    }
}

impl<M: ModelExecutor, D: ModelExecutor> Pipeline for SpeculativeCoordinator<M, D> {
    /// Registers a request with both engines.
    ///
    /// The draft copy runs with `ignore_eos` so it keeps proposing
    /// candidates past an EOS the main model may still reject; a draft
    /// request is terminated explicitly when its main counterpart
    /// finishes.
    #[instrument(skip(self, input, sampling_params))]
    fn add_request(
        &self,
        request_id: u64,
        input: PromptInput,
        sampling_params: SamplingParams,
    ) -> Result<GenerationHandle, EngineError> {
        if sampling_params.is_beam_search() {
            return Err(ValidationError::BeamSearchWithSpeculative.into());
        }
        let _lock = self.generations_mutex.lock().unwrap();

        let mut draft_sampling_params = sampling_params.clone();
        draft_sampling_params.ignore_eos = true;
        let draft_handle =
            self.draft
                .add_request(request_id, input.clone(), draft_sampling_params)?;
        self.draft_generations
            .lock()
            .unwrap()
            .insert(request_id, draft_handle);

        self.main.add_request(request_id, input, sampling_params)
    }

    /// One coordinated speculative step.
    #[instrument(skip_all)]
    fn step(&mut self) -> Result<(), EngineError> {
        let span = self.span.clone();
        let _enter = span.enter();
        // Blocks `add_request` for the whole step; requests must not land
        // in only one of the two engines mid-cycle
        let _lock = self.generations_mutex.lock().unwrap();

        // 1. Both engines observe the same set of requests
        self.draft.pull_awaiting_requests();
        self.main.pull_awaiting_requests();

        // 2. The draft engine proposes candidates
        let draft_start = Instant::now();
        self.draft.multistep(self.num_speculative_tokens)?;
        self.sd_metrics.draft_duration += draft_start.elapsed().as_secs_f32();

        // 3. Draft tokens beyond the main engine's committed output become
        //    uncommitted candidates on the main side
        let draft_generated = self.draft.get_generated_requests()?;
        let main_generated = self.main.get_generated_requests()?;
        let mut inserted_counts: HashMap<u64, usize> = HashMap::new();
        for (request_id, draft_tokens) in &draft_generated {
            let main_len = main_generated
                .get(request_id)
                .map(|g| g.token_ids.len())
                .unwrap_or(0);
            if draft_tokens.token_ids.len() <= main_len {
                continue;
            }
            let inserted = self.main.install_candidates(
                *request_id,
                &draft_tokens.token_ids[main_len..],
                &draft_tokens.logprobs[main_len..],
            )?;
            if inserted > 0 {
                inserted_counts.insert(*request_id, inserted);
            }
        }

        // 4. One main step verifies the candidates in bulk
        let main_start = Instant::now();
        self.main.step()?;
        self.sd_metrics.main_duration += main_start.elapsed().as_secs_f32();

        // 5. The draft engine rolls back to the verified state
        let main_generated = self.main.get_generated_requests()?;
        for (request_id, generated) in &main_generated {
            let update_result = self.draft.sync_with_verified(
                *request_id,
                &generated.token_ids,
                &generated.logprobs,
            )?;
            let Some(inserted) = inserted_counts.get(request_id).copied() else {
                // Nothing was proposed (e.g. several prompt phases)
                continue;
            };
            let removed = update_result.removed_tokens_cnt.min(inserted);
            let acceptance_rate = 1.0 - removed as f32 / inserted as f32;
            self.sd_metrics
                .update_acceptance_rate(*request_id, acceptance_rate * 100.0);
            self.sd_metrics
                .update_draft_accepted_tokens(*request_id, inserted - removed);
        }

        // 6. Draft requests whose main counterpart finished are terminated
        for request_id in draft_generated.keys() {
            if !main_generated.contains_key(request_id) {
                trace!("Finishing draft request {request_id}, main counterpart is done");
                self.draft.finish_request(*request_id)?;
                self.draft_generations.lock().unwrap().remove(request_id);
            }
        }

        Ok(())
    }

    fn has_non_finished_requests(&self) -> bool {
        self.main.has_non_finished_requests()
    }

    /// Batch convenience loop over both engines.
    #[instrument(skip_all)]
    fn generate(
        &mut self,
        inputs: Vec<PromptInput>,
        sampling_params: Vec<SamplingParams>,
        streamer: Streamer,
    ) -> Result<Vec<GenerationResult>, EngineError> {
        if self.has_non_finished_requests() {
            return Err(EngineError::Busy);
        }
        if inputs.len() != sampling_params.len() {
            return Err(
                ValidationError::BatchSizeMismatch(inputs.len(), sampling_params.len()).into(),
            );
        }
        if !matches!(streamer, Streamer::None)
            && (inputs.len() != 1 || sampling_params[0].is_beam_search())
        {
            return Err(ValidationError::InvalidStreamer.into());
        }

        let num_requests = inputs.len();
        let mut handles = Vec::with_capacity(num_requests);
        for (request_id, (input, params)) in
            inputs.into_iter().zip(sampling_params.iter()).enumerate()
        {
            handles.push(self.add_request(request_id as u64, input, params.clone())?);
        }

        let mut streamer = match streamer {
            Streamer::None => None,
            Streamer::Object(object) => Some(object),
            Streamer::Callback(callback) => Some(Box::new(crate::engine::CallbackStreamer::new(
                callback,
            ))
                as Box<dyn crate::engine::StreamerBase>),
        };

        let mut collected = Vec::new();
        let mut cancelled = false;
        while self.has_non_finished_requests() && !cancelled {
            self.step()?;
            if let Some(streamer) = streamer.as_mut() {
                while let Some(iteration) = handles[0].try_read() {
                    'outer: for output in iteration.values() {
                        for token_id in &output.token_ids {
                            if !streamer.put(*token_id) {
                                cancelled = true;
                                break 'outer;
                            }
                        }
                    }
                    collected.push(iteration);
                }
            }
        }
        if cancelled {
            let _lock = self.generations_mutex.lock().unwrap();
            self.main.finish_request(0)?;
            self.draft.finish_request(0)?;
            self.draft_generations.lock().unwrap().remove(&0);
        }
        if let Some(streamer) = streamer.as_mut() {
            streamer.end();
        }

        let mut results = Vec::with_capacity(num_requests);
        for (request_id, mut handle) in handles.into_iter().enumerate() {
            let status = handle.status();
            let mut outputs = if request_id == 0 && streamer.is_some() {
                while let Some(iteration) = handle.try_read() {
                    collected.push(iteration);
                }
                crate::stream::stitch_iterations(std::mem::take(&mut collected))
            } else {
                handle.read_all()
            };
            outputs.sort_by(|a, b| b.score.total_cmp(&a.score));
            let num_outputs = sampling_params[request_id]
                .num_return_sequences
                .unwrap_or(outputs.len())
                .min(outputs.len());
            outputs.truncate(num_outputs);
            results.push(GenerationResult {
                request_id: request_id as u64,
                token_ids: outputs.iter().map(|o| o.token_ids.clone()).collect(),
                scores: outputs.iter().map(|o| o.score).collect(),
                status,
            });
        }
        Ok(results)
    }

    fn get_metrics(&self) -> PipelineMetrics {
        self.main.get_metrics()
    }
}

#[derive(Debug, Error)]
pub enum SpeculativeError {
    #[error("Tokenizers for draft and main models are different")]
    TokenizerMismatch,
    #[error("Cache config error: `{0}`")]
    CacheConfigError(#[from] CacheConfigError),
    #[error("Speculative config error: `{0}`")]
    SpeculativeConfigError(#[from] SpeculativeConfigError),
    #[error("Engine error: `{0}`")]
    EngineError(#[from] EngineError),
}

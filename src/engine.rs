use std::{
    collections::{HashMap, VecDeque},
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, Mutex, RwLock,
    },
    time::Instant,
};

use candle_core::Device;
use thiserror::Error;
use tracing::{error, info, info_span, instrument, trace, Span};

use crate::{
    block_manager::BlockSpaceManagerError,
    config::{CacheConfig, SchedulerConfig},
    model_executor::{ModelExecutor, ModelExecutorError, ModelInput},
    policy::FcfsPolicy,
    sampler::{BeamSelection, Sampler, SamplerError, SequenceGroupSamples},
    sampling_params::{DecodingMode, SamplingParams, StopCriteria, ValidationError},
    scheduler::{ScheduledSequenceGroup, Scheduler, SchedulerError},
    sequence::{Sequence, SequenceError, SequenceGroup, SequenceStatus, SyncSequence},
    stream::{stitch_iterations, GenerationHandle, GenerationStream},
    tokenizer::{Tokenizer, TokenizerError},
    types::{GenerationOutput, GenerationOutputs, GenerationResult, GenerationStatus},
};

/// A prompt handed to `add_request`: either raw text (requires a
/// tokenizer) or pre-tokenized ids.
#[derive(Clone, Debug)]
pub enum PromptInput {
    /// Raw text, encoded through the engine's tokenizer
    Text(String),
    /// Pre-tokenized prompt ids
    Tokens(Vec<u32>),
}

impl From<&str> for PromptInput {
    fn from(value: &str) -> Self {
        Self::Text(value.to_string())
    }
}

impl From<Vec<u32>> for PromptInput {
    fn from(value: Vec<u32>) -> Self {
        Self::Tokens(value)
    }
}

/// Receiver of per-token streaming callbacks during `generate`.
pub trait StreamerBase {
    /// Receives one token id; returning `false` cancels the generation.
    fn put(&mut self, token_id: u32) -> bool;
    /// Called exactly once when the stream closes.
    fn end(&mut self);
}

/// Streaming variant accepted by `generate`. Callbacks are wrapped into
/// the object form internally.
pub enum Streamer {
    /// No streaming
    None,
    /// A streamer object
    Object(Box<dyn StreamerBase>),
    /// A plain callback; return `false` to cancel
    Callback(Box<dyn FnMut(u32) -> bool>),
}

pub(crate) struct CallbackStreamer {
    callback: Box<dyn FnMut(u32) -> bool>,
}

impl CallbackStreamer {
    pub(crate) fn new(callback: Box<dyn FnMut(u32) -> bool>) -> Self {
        Self { callback }
    }
}

impl StreamerBase for CallbackStreamer {
    fn put(&mut self, token_id: u32) -> bool {
        (self.callback)(token_id)
    }

    fn end(&mut self) {}
}

/// Aggregate state counters of a pipeline.
#[derive(Clone, Debug, Default)]
pub struct PipelineMetrics {
    /// Requests waiting to be prefixed
    pub requests_waiting: usize,
    /// Requests currently running
    pub requests_running: usize,
    /// Requests swapped out of the cache
    pub requests_swapped: usize,
    /// Free blocks in the pool
    pub free_blocks: usize,
    /// Total blocks in the pool
    pub total_blocks: usize,
    /// Fraction of the pool in use
    pub cache_usage: f32,
}

/// Outcome of installing or reconciling speculative tokens on a request.
#[derive(Clone, Copy, Debug, Default)]
pub struct UpdateRequestResult {
    /// Number of tokens inserted into the request
    pub inserted_tokens_cnt: usize,
    /// Number of tokens removed from the request
    pub removed_tokens_cnt: usize,
}

/// Committed generated tokens of one request, as seen by the speculative
/// coordinator.
#[derive(Clone, Debug, Default)]
pub struct GeneratedTokens {
    /// Committed output token ids
    pub token_ids: Vec<u32>,
    /// Per-token log probabilities, aligned with `token_ids`
    pub logprobs: Vec<f32>,
}

/// Capability shared by the plain engine and the speculative coordinator.
pub trait Pipeline {
    /// Registers a new request; thread-safe.
    fn add_request(
        &self,
        request_id: u64,
        input: PromptInput,
        sampling_params: SamplingParams,
    ) -> Result<GenerationHandle, EngineError>;

    /// Runs one scheduler → executor → sampler cycle.
    fn step(&mut self) -> Result<(), EngineError>;

    /// Checks whether any request is still in flight.
    fn has_non_finished_requests(&self) -> bool;

    /// Convenience batch loop over `add_request` and `step`.
    fn generate(
        &mut self,
        inputs: Vec<PromptInput>,
        sampling_params: Vec<SamplingParams>,
        streamer: Streamer,
    ) -> Result<Vec<GenerationResult>, EngineError>;

    /// Aggregate state counters.
    fn get_metrics(&self) -> PipelineMetrics;
}

/// `ContinuousBatchingEngine` - Drives the step loop: awaiting requests
/// are drained, the scheduler plans the batch, the block manager backs
/// every scheduled token with a physical slot, the executor runs one
/// forward pass, and the sampler turns logits into tokens that are
/// published on the per-request generation streams.
///
/// The engine is logically single-threaded at step granularity: exactly
/// one thread calls `step`. Other threads may call `add_request`
/// concurrently; new requests enter the batch at the next step boundary.
pub struct ContinuousBatchingEngine<M: ModelExecutor> {
    /// The inference runtime executing forward passes
    executor: M,
    /// Device the input tensors are built on
    device: Device,
    /// The scheduler, first-come-first-served
    scheduler: Scheduler<FcfsPolicy>,
    /// The sampler
    sampler: Sampler,
    /// Tokenizer for text prompts, if configured
    tokenizer: Option<Tokenizer>,
    /// Cache configuration
    cache_config: CacheConfig,
    /// Scheduler configuration
    scheduler_config: SchedulerConfig,
    /// Requests added but not yet drained into the scheduler
    awaiting: Arc<Mutex<VecDeque<SequenceGroup>>>,
    /// Open output streams, keyed by request id
    streams: Arc<Mutex<HashMap<u64, GenerationStream>>>,
    /// Monotonic sequence id counter
    next_sequence_id: Arc<AtomicU64>,
    /// Tracing span
    span: Span,
}

impl<M: ModelExecutor> ContinuousBatchingEngine<M> {
    /// Constructor
    pub fn new(
        executor: M,
        tokenizer: Option<Tokenizer>,
        cache_config: CacheConfig,
        scheduler_config: SchedulerConfig,
        device: Device,
    ) -> Result<Self, EngineError> {
        let scheduler = Scheduler::new(cache_config.clone(), scheduler_config.clone())?;
        Ok(Self {
            executor,
            device,
            scheduler,
            sampler: Sampler::new(),
            tokenizer,
            cache_config,
            scheduler_config,
            awaiting: Arc::new(Mutex::new(VecDeque::new())),
            streams: Arc::new(Mutex::new(HashMap::new())),
            next_sequence_id: Arc::new(AtomicU64::new(0)),
            span: info_span!("llm-engine"),
        })
    }

    /// Getter for the tokenizer
    pub fn get_tokenizer(&self) -> Option<&Tokenizer> {
        self.tokenizer.as_ref()
    }

    /// Getter for the scheduler configuration
    pub fn get_scheduler_config(&self) -> &SchedulerConfig {
        &self.scheduler_config
    }

    /// Getter for the cache configuration
    pub fn get_cache_config(&self) -> &CacheConfig {
        &self.cache_config
    }

    /// Hidden size of the underlying model
    pub fn hidden_size(&self) -> usize {
        self.executor.hidden_size()
    }

    /// Moves every awaiting request into the scheduler's waiting queue.
    ///
    /// Called at the start of each step; the speculative coordinator calls
    /// it explicitly so both of its engines drain under one lock.
    #[instrument(skip_all)]
    pub fn pull_awaiting_requests(&mut self) {
        let mut awaiting = self.awaiting.lock().unwrap();
        while let Some(group) = awaiting.pop_front() {
            self.scheduler.add_sequence_group(group);
        }
    }

    /// Runs `num_steps` engine steps back to back; used by the draft
    /// engine to propose several speculative tokens per coordinator step.
    #[instrument(skip(self))]
    pub fn multistep(&mut self, num_steps: usize) -> Result<(), EngineError> {
        for _ in 0..num_steps {
            self.step()?;
        }
        Ok(())
    }

    /// Committed generated tokens of every request known to the
    /// scheduler, keyed by request id.
    pub fn get_generated_requests(&self) -> Result<HashMap<u64, GeneratedTokens>, EngineError> {
        let mut generated = HashMap::new();
        for group in self.scheduler.sequence_groups() {
            let Some(sequence) = first_live_sequence(group) else {
                continue;
            };
            let guard = sequence
                .read()
                .map_err(|e| EngineError::PoisonError(e.to_string()))?;
            let committed_len = guard.sequence_data.get_committed_output_len();
            let token_ids: Vec<u32> = guard
                .sequence_data
                .output_token_ids()
                .into_iter()
                .take(committed_len)
                .collect();
            let logprobs: Vec<f32> = guard
                .output_logprobs
                .iter()
                .take(committed_len)
                .map(|lp| lp.logprob())
                .collect();
            generated.insert(group.request_id, GeneratedTokens { token_ids, logprobs });
        }
        Ok(generated)
    }

    /// Installs draft-proposed candidate tokens on a request of this
    /// (main) engine. The candidates extend the sequence but stay
    /// uncommitted until the next step verifies them.
    ///
    /// # Returns
    /// The number of candidates actually installed. Requests still in the
    /// prefill phase receive none.
    #[instrument(skip(self, tokens, logprobs))]
    pub fn install_candidates(
        &mut self,
        request_id: u64,
        tokens: &[u32],
        logprobs: &[f32],
    ) -> Result<usize, EngineError> {
        let Some(group) = self.scheduler.get_sequence_group(request_id) else {
            return Ok(0);
        };
        let Some(sequence) = first_live_sequence(group) else {
            return Ok(0);
        };
        let mut guard = sequence
            .write()
            .map_err(|e| EngineError::PoisonError(e.to_string()))?;
        if guard.is_prefill() || tokens.is_empty() {
            return Ok(0);
        }
        guard.append_candidate_tokens(tokens, logprobs)?;
        Ok(tokens.len())
    }

    /// Reconciles a draft request with the main engine's verified tokens:
    /// rolls the sequence back to the common prefix and appends the
    /// remainder of `target_tokens` as committed output.
    #[instrument(skip(self, target_tokens, target_logprobs))]
    pub fn sync_with_verified(
        &mut self,
        request_id: u64,
        target_tokens: &[u32],
        target_logprobs: &[f32],
    ) -> Result<UpdateRequestResult, EngineError> {
        let Some(group) = self.scheduler.get_sequence_group(request_id) else {
            return Ok(UpdateRequestResult::default());
        };
        let Some(sequence) = first_live_sequence(group) else {
            return Ok(UpdateRequestResult::default());
        };
        let sequence = sequence.clone();
        let (sequence_id, keep_blocks, result) = {
            let mut guard = sequence
                .write()
                .map_err(|e| EngineError::PoisonError(e.to_string()))?;
            let current = guard.sequence_data.output_token_ids();
            let common = current
                .iter()
                .zip(target_tokens.iter())
                .take_while(|(a, b)| a == b)
                .count();
            let removed = current.len() - common;
            let inserted = target_tokens.len() - common;
            guard.truncate_output_tokens(removed);
            for (token_id, logprob) in target_tokens
                .iter()
                .skip(common)
                .zip(target_logprobs.iter().skip(common))
            {
                guard.add_token_id(*token_id, *logprob)?;
            }
            // An all-rejected rollback can leave zero uncomputed tokens,
            // which would starve the sequence forever
            guard.sequence_data.cap_num_computed_tokens();
            (
                guard.sequence_id(),
                guard.get_num_total_logical_token_blocks(),
                UpdateRequestResult {
                    inserted_tokens_cnt: inserted,
                    removed_tokens_cnt: removed,
                },
            )
        };
        self.scheduler
            .free_trailing_blocks(sequence_id, keep_blocks)?;
        Ok(result)
    }

    /// Terminates a request: blocks are freed, the status becomes
    /// `Dropped` and the stream closes.
    #[instrument(skip(self))]
    pub fn finish_request(&mut self, request_id: u64) -> Result<(), EngineError> {
        self.remove_awaiting(request_id)?;
        self.scheduler.abort_sequence_group(request_id)?;
        if let Some(stream) = self.streams.lock().unwrap().remove(&request_id) {
            stream.finish(GenerationStatus::Dropped);
        }
        Ok(())
    }

    /// Removes a request from the awaiting queue, if still there.
    fn remove_awaiting(&self, request_id: u64) -> Result<(), EngineError> {
        let mut awaiting = self.awaiting.lock().unwrap();
        if let Some(position) = awaiting.iter().position(|g| g.request_id == request_id) {
            // DON'T PANIC: position was just found
            let group = awaiting.remove(position).unwrap();
            for sequence in group.sequences.values() {
                sequence
                    .write()
                    .map_err(|e| EngineError::PoisonError(e.to_string()))?
                    .set_sequence_status(SequenceStatus::Dropped);
            }
        }
        Ok(())
    }

    /// Cancels every request whose handle was dropped since the last
    /// step.
    #[instrument(skip_all)]
    fn sweep_cancelled_requests(&mut self) -> Result<(), EngineError> {
        let dropped_ids: Vec<u64> = {
            let streams = self.streams.lock().unwrap();
            streams
                .iter()
                .filter(|(_, stream)| stream.is_dropped() && !stream.is_finished())
                .map(|(request_id, _)| *request_id)
                .collect()
        };
        for request_id in dropped_ids {
            trace!("Cancelling dropped request with id = {request_id}");
            self.finish_request(request_id)?;
            metrics::counter!("engine-cancelled-requests").increment(1);
        }
        Ok(())
    }

    /// Per-token stopping decision, shared by every decoding mode.
    fn check_stop(
        guard: &mut Sequence,
        params: &SamplingParams,
        eos_token_id: Option<u32>,
        max_model_len: usize,
    ) {
        let Some(last_token) = guard.get_last_token_id() else {
            return;
        };
        if !params.ignore_eos {
            if params.stop_token_ids.contains(&last_token) {
                guard.set_sequence_status(SequenceStatus::FinishedStopped);
                return;
            }
            if eos_token_id == Some(last_token) {
                guard.set_sequence_status(SequenceStatus::FinishedEos);
                return;
            }
        }
        if guard.get_output_len() >= params.max_new_tokens || guard.length() >= max_model_len {
            guard.set_sequence_status(SequenceStatus::FinishedLength);
        }
    }

    /// Applies single-token samples (greedy / multinomial) to a group.
    fn apply_single_samples(
        &self,
        group: &SequenceGroup,
        samples: &[(u64, crate::sampler::SequenceSample)],
        iteration: &mut GenerationOutputs,
    ) -> Result<(), EngineError> {
        let params = group.sampling_params();
        let eos_token_id = self.executor.eos_token_id();
        let max_model_len = self.scheduler_config.max_model_len();
        for (sequence_id, sample) in samples {
            let sequence = group
                .find(*sequence_id)
                .ok_or(EngineError::MissingSequence(*sequence_id))?;
            let mut guard = sequence
                .write()
                .map_err(|e| EngineError::PoisonError(e.to_string()))?;
            guard.add_token_id(sample.token_id, sample.logprob)?;
            Self::check_stop(&mut guard, &params, eos_token_id, max_model_len);
            iteration.insert(
                *sequence_id,
                GenerationOutput {
                    token_ids: vec![sample.token_id],
                    parent_sequence_id: None,
                    cumulative_logprob: guard.cumulative_logprob(),
                    score: guard.cumulative_logprob(),
                    is_finished: guard.is_finished(),
                },
            );
        }
        Ok(())
    }

    /// Applies speculative verification verdicts: accepted candidates are
    /// committed, rejected ones removed (together with their trailing
    /// blocks) and the bonus token appended.
    fn apply_verified_samples(
        &mut self,
        group: &SequenceGroup,
        samples: &[(u64, crate::sampler::VerifiedSample)],
        iteration: &mut GenerationOutputs,
    ) -> Result<(), EngineError> {
        let params = group.sampling_params();
        let eos_token_id = self.executor.eos_token_id();
        for (sequence_id, verdict) in samples {
            let sequence = group
                .find(*sequence_id)
                .ok_or(EngineError::MissingSequence(*sequence_id))?
                .clone();
            let (keep_blocks, emitted, cumulative_logprob, is_finished) = {
                let mut guard = sequence
                    .write()
                    .map_err(|e| EngineError::PoisonError(e.to_string()))?;
                let accepted_logprobs: Vec<f32> =
                    verdict.accepted.iter().map(|s| s.logprob).collect();
                guard.commit_candidate_tokens(&accepted_logprobs);
                guard.add_token_id(verdict.bonus.token_id, verdict.bonus.logprob)?;

                // Emitted this iteration: accepted candidates plus bonus.
                // A stop token inside the emitted window truncates the
                // tail behind it.
                let mut emitted: Vec<u32> = verdict
                    .accepted
                    .iter()
                    .map(|s| s.token_id)
                    .chain(std::iter::once(verdict.bonus.token_id))
                    .collect();
                let mut stop_at = None;
                for (position, token_id) in emitted.iter().enumerate() {
                    let is_stop = !params.ignore_eos
                        && (params.stop_token_ids.contains(token_id)
                            || eos_token_id == Some(*token_id));
                    if is_stop {
                        stop_at = Some(position);
                        break;
                    }
                }
                if let Some(position) = stop_at {
                    let excess = emitted.len() - 1 - position;
                    guard.truncate_output_tokens(excess);
                    emitted.truncate(position + 1);
                    // DON'T PANIC: `stop_at` indexes into `emitted`
                    let stop_token = emitted[position];
                    if params.stop_token_ids.contains(&stop_token) {
                        guard.set_sequence_status(SequenceStatus::FinishedStopped);
                    } else {
                        guard.set_sequence_status(SequenceStatus::FinishedEos);
                    }
                }
                // Multi-token appends must still respect `max_new_tokens`
                let output_len = guard.get_output_len();
                if output_len >= params.max_new_tokens {
                    let excess = output_len - params.max_new_tokens;
                    guard.truncate_output_tokens(excess);
                    emitted.truncate(emitted.len().saturating_sub(excess));
                    guard.set_sequence_status(SequenceStatus::FinishedLength);
                }
                if guard.length() >= self.scheduler_config.max_model_len() {
                    guard.set_sequence_status(SequenceStatus::FinishedLength);
                }

                (
                    guard.get_num_total_logical_token_blocks(),
                    emitted,
                    guard.cumulative_logprob(),
                    guard.is_finished(),
                )
            };
            self.scheduler
                .free_trailing_blocks(*sequence_id, keep_blocks)?;

            metrics::histogram!("engine-accepted-draft-tokens")
                .record(verdict.accepted.len() as f64);
            iteration.insert(
                *sequence_id,
                GenerationOutput {
                    token_ids: emitted,
                    parent_sequence_id: None,
                    cumulative_logprob,
                    score: cumulative_logprob,
                    is_finished,
                },
            );
        }
        Ok(())
    }

    /// Reconciles beam selections with the group: the first selection of
    /// each parent continues in place, further ones fork the parent, and
    /// parents without any selection are pruned. Afterwards the group's
    /// stop criteria decide whether the whole beam search terminates.
    fn apply_beam_samples(
        &mut self,
        scheduled: &ScheduledSequenceGroup,
        selections: &[BeamSelection],
        iteration: &mut GenerationOutputs,
    ) -> Result<(), EngineError> {
        let group = &scheduled.scheduled_group;
        let params = group.sampling_params();
        let eos_token_id = self.executor.eos_token_id();
        let max_model_len = self.scheduler_config.max_model_len();
        let DecodingMode::Beam {
            stop_criteria,
            length_penalty,
            ..
        } = params.mode
        else {
            return Err(EngineError::InvalidDecodingMode(group.request_id));
        };
        let beam_width = params.beam_width();

        // Group selections by parent, preserving score order
        let mut by_parent: Vec<(u64, Vec<&BeamSelection>)> = Vec::new();
        for selection in selections {
            match by_parent
                .iter_mut()
                .find(|(parent, _)| *parent == selection.parent_sequence_id)
            {
                Some((_, list)) => list.push(selection),
                None => by_parent.push((selection.parent_sequence_id, vec![selection])),
            }
        }

        let running_ids = group.get_sequences_ids(Some(SequenceStatus::Running));
        let mut new_children: Vec<SyncSequence> = Vec::new();

        for (parent_id, parent_selections) in by_parent {
            let parent = group
                .find(parent_id)
                .ok_or(EngineError::MissingSequence(parent_id))?;

            // Forks branch off the parent's pre-append state
            for selection in parent_selections.iter().skip(1) {
                let child_id = self.next_sequence_id.fetch_add(1, Ordering::SeqCst);
                let child = {
                    parent
                        .read()
                        .map_err(|e| EngineError::PoisonError(e.to_string()))?
                        .fork(child_id)
                };
                let child = self
                    .scheduler
                    .fork_sequence(group.request_id, parent_id, child)?;
                {
                    let mut guard = child
                        .write()
                        .map_err(|e| EngineError::PoisonError(e.to_string()))?;
                    guard.add_token_id(selection.token_id, selection.logprob)?;
                    Self::check_stop(&mut guard, &params, eos_token_id, max_model_len);
                    iteration.insert(
                        child_id,
                        GenerationOutput {
                            token_ids: vec![selection.token_id],
                            parent_sequence_id: Some(parent_id),
                            cumulative_logprob: guard.cumulative_logprob(),
                            score: guard.get_beam_search_score(length_penalty),
                            is_finished: guard.is_finished(),
                        },
                    );
                }
                new_children.push(child);
            }

            // The parent itself continues with its best selection
            {
                // DON'T PANIC: grouping never produces an empty list
                let selection = parent_selections.first().unwrap();
                let mut guard = parent
                    .write()
                    .map_err(|e| EngineError::PoisonError(e.to_string()))?;
                guard.add_token_id(selection.token_id, selection.logprob)?;
                Self::check_stop(&mut guard, &params, eos_token_id, max_model_len);
                iteration.insert(
                    parent_id,
                    GenerationOutput {
                        token_ids: vec![selection.token_id],
                        parent_sequence_id: None,
                        cumulative_logprob: guard.cumulative_logprob(),
                        score: guard.get_beam_search_score(length_penalty),
                        is_finished: guard.is_finished(),
                    },
                );
            }
        }

        // Parents that no selection extends are pruned
        for sequence_id in running_ids {
            let extended = iteration.contains_key(&sequence_id);
            if !extended {
                if let Some(sequence) = group.find(sequence_id) {
                    sequence
                        .write()
                        .map_err(|e| EngineError::PoisonError(e.to_string()))?
                        .set_sequence_status(SequenceStatus::Dropped);
                }
            }
        }

        // Beam termination considers every beam of the group, including
        // ones that finished on earlier steps. Children forked this step
        // live in the scheduler's copy of the group, so they are appended
        // explicitly.
        let mut all_beams: Vec<SyncSequence> = group.get_seqs(None);
        all_beams.extend(new_children);

        let finished_scores: Vec<f32> = all_beams
            .iter()
            .filter_map(|s| {
                let guard = s.read().ok()?;
                (guard.is_finished() && guard.get_sequence_status() != SequenceStatus::Dropped)
                    .then(|| guard.get_beam_search_score(length_penalty))
            })
            .collect();
        let num_finished = finished_scores.len();
        let stop_group = match stop_criteria {
            StopCriteria::Early => num_finished >= beam_width,
            StopCriteria::Heuristic => {
                if let Some(best_finished) = finished_scores.iter().copied().reduce(f32::max) {
                    let best_running = all_beams
                        .iter()
                        .filter_map(|s| {
                            let guard = s.read().ok()?;
                            (!guard.is_finished())
                                .then(|| guard.get_beam_search_score(length_penalty))
                        })
                        .reduce(f32::max);
                    match best_running {
                        Some(best_running) => best_running < best_finished,
                        None => true,
                    }
                } else {
                    false
                }
            }
            StopCriteria::Never => false,
        };
        if stop_group {
            trace!(
                "Beam group for request {} terminates with {} finished beams",
                group.request_id,
                num_finished
            );
            for sequence in all_beams {
                let mut guard = sequence
                    .write()
                    .map_err(|e| EngineError::PoisonError(e.to_string()))?;
                if !guard.is_finished() {
                    guard.set_sequence_status(SequenceStatus::Dropped);
                }
            }
        }
        Ok(())
    }

    /// Marks every scheduled sequence as stopped after an executor
    /// failure; other (unscheduled) requests continue on later steps.
    fn handle_executor_failure(
        &mut self,
        scheduled: &[ScheduledSequenceGroup],
        error: ModelExecutorError,
    ) -> Result<(), EngineError> {
        error!("Executor failed, aborting the scheduled batch: {error}");
        metrics::counter!("engine-executor-failures").increment(1);
        for scheduled_group in scheduled {
            for sequence in scheduled_group
                .scheduled_group
                .get_seqs(Some(SequenceStatus::Running))
            {
                sequence
                    .write()
                    .map_err(|e| EngineError::PoisonError(e.to_string()))?
                    .set_sequence_status(SequenceStatus::FinishedStopped);
            }
        }
        self.scheduler.free_finished_sequence_groups()?;
        self.finalize_streams()?;
        Ok(())
    }

    /// Closes the streams of requests the scheduler no longer knows.
    fn finalize_streams(&mut self) -> Result<(), EngineError> {
        let mut streams = self.streams.lock().unwrap();
        let awaiting = self.awaiting.lock().unwrap();
        let finished_ids: Vec<u64> = streams
            .keys()
            .filter(|request_id| {
                !self.scheduler.contains_request(**request_id)
                    && !awaiting.iter().any(|g| g.request_id == **request_id)
            })
            .copied()
            .collect();
        for request_id in finished_ids {
            // DON'T PANIC: ids were collected from the same map
            let stream = streams.remove(&request_id).unwrap();
            stream.finish(GenerationStatus::Finished);
            trace!("Closed stream for finished request {request_id}");
        }
        Ok(())
    }
}

impl<M: ModelExecutor> Pipeline for ContinuousBatchingEngine<M> {
    /// Registers a new request and returns its generation handle.
    ///
    /// Parameters are validated here; a malformed request never enters
    /// the waiting queue. `max_new_tokens == 0` finishes immediately with
    /// an empty generation.
    #[instrument(skip(self, input, sampling_params))]
    fn add_request(
        &self,
        request_id: u64,
        input: PromptInput,
        sampling_params: SamplingParams,
    ) -> Result<GenerationHandle, EngineError> {
        sampling_params.validate()?;

        let prompt_token_ids = match input {
            PromptInput::Tokens(token_ids) => token_ids,
            PromptInput::Text(text) => match &self.tokenizer {
                Some(tokenizer) => tokenizer.encode(&text)?,
                None => return Err(ValidationError::MissingTokenizer.into()),
            },
        };
        if prompt_token_ids.is_empty() {
            return Err(ValidationError::EmptyPrompt.into());
        }
        if !self.scheduler_config.enable_chunked_prefill()
            && prompt_token_ids.len() > self.scheduler_config.max_num_batched_tokens()
        {
            // Long prompts need chunked prefill to be served at all
            return Err(ValidationError::PromptTooLong(
                prompt_token_ids.len(),
                self.scheduler_config.max_num_batched_tokens(),
            )
            .into());
        }
        if prompt_token_ids.len() > self.scheduler_config.max_model_len() {
            return Err(ValidationError::PromptExceedsModelLen(
                prompt_token_ids.len(),
                self.scheduler_config.max_model_len(),
            )
            .into());
        }

        let (stream, handle) = GenerationStream::create();
        if sampling_params.max_new_tokens == 0 {
            // Nothing to generate; the request finishes on arrival
            stream.finish(GenerationStatus::Finished);
            return Ok(handle);
        }

        let sequence_id = self.next_sequence_id.fetch_add(1, Ordering::SeqCst);
        let sequence = Sequence::new(
            sequence_id,
            prompt_token_ids,
            self.cache_config.block_size(),
        )?;
        let group = SequenceGroup::new(
            request_id,
            vec![Arc::new(RwLock::new(sequence))],
            sampling_params,
        )?;

        self.streams.lock().unwrap().insert(request_id, stream);
        self.awaiting.lock().unwrap().push_back(group);
        metrics::counter!("engine-added-requests").increment(1);
        trace!("Added request with id = {request_id}");
        Ok(handle)
    }

    /// One scheduler → executor → sampler cycle. Never blocks on I/O.
    #[instrument(skip_all)]
    fn step(&mut self) -> Result<(), EngineError> {
        let span = self.span.clone();
        let _enter = span.enter();

        // 1. Cancellations observed at the step boundary
        self.sweep_cancelled_requests()?;

        // 2. Requests queued since the previous step enter the scheduler
        self.pull_awaiting_requests();

        // 3. Plan the batch
        let (sequence_groups_metadata, scheduler_outputs) = self.scheduler.schedule()?;

        // Requests the scheduler failed permanently surface through their
        // streams
        if !scheduler_outputs.ignored_seq_groups.is_empty() {
            self.finalize_streams()?;
        }
        if sequence_groups_metadata.is_empty() {
            return Ok(());
        }

        // 4. One forward pass over the flattened batch
        let model_input = ModelInput::from_scheduled(
            &sequence_groups_metadata,
            &scheduler_outputs,
            self.cache_config.block_size(),
            &self.device,
        )?;
        let forward_start = Instant::now();
        let logits = match self.executor.forward(&model_input) {
            Ok(logits) => logits,
            Err(e) => {
                return self
                    .handle_executor_failure(&scheduler_outputs.scheduled_sequence_groups, e);
            }
        };
        metrics::histogram!("engine-forward-seconds")
            .record(forward_start.elapsed().as_secs_f32() as f64);

        // 5. Logits become tokens
        let samples = self
            .sampler
            .sample(&logits, &sequence_groups_metadata)?;

        // 6. Update sequences, fork beams, publish outputs
        let now = Instant::now();
        for ((metadata, scheduled), group_samples) in sequence_groups_metadata
            .iter()
            .zip(scheduler_outputs.scheduled_sequence_groups.iter())
            .zip(samples.into_iter())
        {
            let group = &scheduled.scheduled_group;
            group.update_num_computed_tokens(scheduled.token_chunk_size)?;

            let mut iteration = GenerationOutputs::new();
            match &group_samples {
                SequenceGroupSamples::Empty => {}
                SequenceGroupSamples::Single { samples } => {
                    self.apply_single_samples(group, samples, &mut iteration)?;
                }
                SequenceGroupSamples::Verified { samples } => {
                    self.apply_verified_samples(group, samples, &mut iteration)?;
                }
                SequenceGroupSamples::Beam { selections } => {
                    self.apply_beam_samples(scheduled, selections, &mut iteration)?;
                }
            }

            if !iteration.is_empty() {
                group.maybe_set_first_token_time(now);
                if let Some(stream) = self.streams.lock().unwrap().get(&metadata.request_id) {
                    stream.push(iteration);
                }
            }
        }

        // 7. Finished sequences release their blocks; finished requests
        //    close their streams
        self.scheduler.free_finished_sequence_groups()?;
        self.finalize_streams()?;

        Ok(())
    }

    fn has_non_finished_requests(&self) -> bool {
        self.scheduler.has_unfinished_sequences() || !self.awaiting.lock().unwrap().is_empty()
    }

    /// Convenience loop: adds every prompt, steps until all finish and
    /// assembles the per-request results, best sequences first.
    ///
    /// Streaming is restricted to a single prompt with a non-beam mode;
    /// the streamer's `put` returning `false` cancels the request.
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

        let mut streamer = match streamer {
            Streamer::None => None,
            Streamer::Object(object) => Some(object),
            Streamer::Callback(callback) => {
                Some(Box::new(CallbackStreamer::new(callback)) as Box<dyn StreamerBase>)
            }
        };
        if streamer.is_some() && (inputs.len() != 1 || sampling_params[0].is_beam_search()) {
            return Err(ValidationError::InvalidStreamer.into());
        }

        let num_requests = inputs.len();
        let mut handles = Vec::with_capacity(num_requests);
        for (request_id, (input, params)) in
            inputs.into_iter().zip(sampling_params.iter()).enumerate()
        {
            handles.push(self.add_request(request_id as u64, input, params.clone())?);
        }

        // Streamed iterations are collected locally so the final results
        // can still be stitched together afterwards
        let mut collected: Vec<GenerationOutputs> = Vec::new();
        let mut cancelled = false;
        while self.has_non_finished_requests() && !cancelled {
            self.step()?;
            if let Some(streamer) = streamer.as_mut() {
                while let Some(iteration) = handles[0].try_read() {
                    'outer: for output in iteration.values() {
                        for token_id in &output.token_ids {
                            if !streamer.put(*token_id) {
                                info!("Streamer cancelled generation");
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
            self.finish_request(0)?;
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
                stitch_iterations(std::mem::take(&mut collected))
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
        let (waiting, running, swapped) = self.scheduler.queue_sizes();
        let free_blocks = self.scheduler.get_num_free_blocks();
        let total_blocks = self.scheduler.get_num_total_blocks();
        PipelineMetrics {
            requests_waiting: waiting + self.awaiting.lock().unwrap().len(),
            requests_running: running,
            requests_swapped: swapped,
            free_blocks,
            total_blocks,
            cache_usage: 1.0 - free_blocks as f32 / total_blocks.max(1) as f32,
        }
    }
}

/// First non-dropped sequence of a group, used by the speculative paths
/// which operate on single-sequence requests.
fn first_live_sequence(group: &SequenceGroup) -> Option<&SyncSequence> {
    group
        .sequences
        .values()
        .find(|s| {
            s.read()
                .map(|s| s.get_sequence_status() != SequenceStatus::Dropped)
                .unwrap_or(false)
        })
        .or_else(|| group.sequences.values().next())
}

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("Validation error: `{0}`")]
    ValidationError(#[from] ValidationError),
    #[error("Scheduler error: `{0}`")]
    SchedulerError(#[from] SchedulerError),
    #[error("Sampler error: `{0}`")]
    SamplerError(#[from] SamplerError),
    #[error("Model executor error: `{0}`")]
    ModelExecutorError(#[from] ModelExecutorError),
    #[error("Sequence error: `{0}`")]
    SequenceError(#[from] SequenceError),
    #[error("Block space manager error: `{0}`")]
    BlockSpaceManagerError(#[from] BlockSpaceManagerError),
    #[error("Tokenizer error: `{0}`")]
    TokenizerError(#[from] TokenizerError),
    #[error("Poison error: `{0}`")]
    PoisonError(String),
    #[error("Missing sequence with id = `{0}`")]
    MissingSequence(u64),
    #[error("Invalid decoding mode for request `{0}`")]
    InvalidDecodingMode(u64),
    #[error("`generate` cannot run while requests are in flight; use `add_request`")]
    Busy,
}

use std::{
    collections::HashMap,
    hash::{DefaultHasher, Hash, Hasher},
    sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard},
    time::{Duration, Instant},
};

use rand::{rngs::StdRng, SeedableRng};
use thiserror::Error;
use tracing::{error, instrument, trace};

use crate::{
    block::{BlockError, LogicalTokenBlock},
    sampling_params::SamplingParams,
    types::{ReadLock, WriteLock},
};

/// Log probability and rank of a generated token.
#[derive(Clone, Debug, PartialEq)]
pub struct LogProb {
    /// The log probability of the token
    logprob: f32,
    /// The rank of the token in the model's vocabulary, if available
    rank: Option<u32>,
}

impl LogProb {
    /// Constructor
    pub fn new(logprob: f32, rank: Option<u32>) -> Self {
        Self { logprob, rank }
    }

    /// Getter for `logprob`
    pub fn logprob(&self) -> f32 {
        self.logprob
    }

    /// Getter for `rank`
    pub fn rank(&self) -> Option<u32> {
        self.rank
    }
}

/// `SequenceStatus` represents the current status of a `Sequence` in the
/// generation process.
///
/// `Waiting`: the sequence has not been prefixed into the KV cache yet.
/// `Running`: the sequence advances on the current step.
/// `PausedForRecompute`: the sequence was preempted and its blocks were
///     released; its tokens will be re-prefixed before it resumes.
/// `FinishedEos`: generation produced the EOS token.
/// `FinishedLength`: generation reached `max_new_tokens`.
/// `FinishedStopped`: generation produced a stop token, or was aborted by
///     an executor failure.
/// `Dropped`: the request was cancelled, or the beam was pruned.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SequenceStatus {
    Waiting,
    Running,
    PausedForRecompute,
    FinishedEos,
    FinishedLength,
    FinishedStopped,
    Dropped,
}

impl SequenceStatus {
    /// Checks if the sequence has reached a terminal state.
    pub fn is_finished(&self) -> bool {
        match self {
            Self::FinishedEos | Self::FinishedLength | Self::FinishedStopped | Self::Dropped => {
                true
            }
            Self::Waiting | Self::Running | Self::PausedForRecompute => false,
        }
    }

    /// Returns the reason why the sequence finished, if applicable.
    pub fn finished_reason(&self) -> Option<String> {
        match self {
            Self::FinishedEos => Some("eos".into()),
            Self::FinishedLength => Some("length".into()),
            Self::FinishedStopped => Some("stopped".into()),
            Self::Dropped => Some("dropped".into()),
            Self::Waiting | Self::Running | Self::PausedForRecompute => None,
        }
    }
}

/// Represents the current stage of processing for a `Sequence`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SequenceStage {
    /// The prompt (or a re-prefixed context) is being processed,
    /// multiple tokens per step
    Prefill,
    /// New tokens are generated one at a time, using the cached attention
    /// of previous tokens
    Decode,
}

/// Metrics tracking various time points and durations for a request's
/// lifecycle.
#[derive(Clone, Debug)]
pub struct RequestMetrics {
    /// The time when the request was received
    pub arrival_time: Instant,
    /// The time when the most recent token was generated
    pub last_token_time: Instant,
    /// The time when the request was first scheduled, `None` until then
    pub first_scheduled_time: Option<Instant>,
    /// The time when the first token was generated, `None` until then
    pub first_token_time: Option<Instant>,
    /// The duration the request spent waiting in the queue
    pub time_in_queue: Option<Duration>,
    /// The time when generation completed, `None` while in progress
    pub finished_time: Option<Instant>,
}

/// `SequenceData` - Token-level state of a `Sequence`.
///
/// Holds the prompt and generated token ids, together with the bookkeeping
/// the scheduler needs: how many tokens already sit in the KV cache
/// (`num_computed_tokens`) and how many of the trailing output tokens are
/// uncommitted speculative candidates.
#[derive(Clone, Debug, PartialEq)]
pub struct SequenceData {
    /// The token IDs of the initial prompt
    prompt_token_ids: Vec<u32>,
    /// The token IDs of the generated output. The last
    /// `num_candidate_tokens` entries are speculative candidates awaiting
    /// verification.
    output_token_ids: Vec<u32>,
    /// Number of trailing output tokens that are unverified candidates
    num_candidate_tokens: usize,
    /// Draft-model log probabilities of the candidate tokens, aligned with
    /// the candidate tail of `output_token_ids`; used by the multinomial
    /// acceptance test
    candidate_logprobs: Vec<f32>,
    /// The cumulative log probability of the generated tokens
    cumulative_logprob: f32,
    /// The number of tokens whose KV entries have been computed so far
    num_computed_tokens: usize,
    /// The current processing stage of the sequence
    stage: SequenceStage,
}

impl SequenceData {
    /// Constructor
    pub fn new(prompt_token_ids: Vec<u32>) -> Self {
        Self {
            prompt_token_ids,
            output_token_ids: vec![],
            num_candidate_tokens: 0,
            candidate_logprobs: vec![],
            cumulative_logprob: 0.0,
            num_computed_tokens: 0,
            stage: SequenceStage::Prefill,
        }
    }

    /// Adds a newly sampled output token id.
    #[instrument(skip_all)]
    pub fn add_token_id(&mut self, token_id: u32, logprob: f32) {
        trace!("Adding token id to `SequenceData`..");
        self.output_token_ids.push(token_id);
        self.cumulative_logprob += logprob;
    }

    /// Appends unverified speculative candidate tokens with their
    /// draft-model log probabilities.
    pub fn append_candidate_tokens(&mut self, token_ids: &[u32], logprobs: &[f32]) {
        self.output_token_ids.extend_from_slice(token_ids);
        self.candidate_logprobs.extend_from_slice(logprobs);
        self.num_candidate_tokens += token_ids.len();
    }

    /// Getter for `candidate_logprobs`
    pub fn candidate_logprobs(&self) -> &[f32] {
        &self.candidate_logprobs
    }

    /// Commits the first `num_accepted` candidate tokens and discards the
    /// rest.
    ///
    /// # Returns
    /// The number of candidate tokens that were removed.
    pub fn commit_candidate_tokens(&mut self, num_accepted: usize, logprob_sum: f32) -> usize {
        let num_removed = self.num_candidate_tokens.saturating_sub(num_accepted);
        let keep = self.output_token_ids.len() - num_removed;
        self.output_token_ids.truncate(keep);
        self.num_candidate_tokens = 0;
        self.candidate_logprobs.clear();
        self.cumulative_logprob += logprob_sum;
        self.num_computed_tokens = self.num_computed_tokens.min(self.length());
        num_removed
    }

    /// Removes the last `num_tokens` output tokens.
    ///
    /// Speculative rollback on the draft side; the removed tokens never
    /// contributed to `cumulative_logprob` bookkeeping of committed text.
    pub fn truncate_output_tokens(&mut self, num_tokens: usize) {
        let keep = self.output_token_ids.len().saturating_sub(num_tokens);
        self.output_token_ids.truncate(keep);
        self.num_candidate_tokens = self.num_candidate_tokens.min(self.output_token_ids.len());
        self.candidate_logprobs.truncate(self.num_candidate_tokens);
        self.num_computed_tokens = self.num_computed_tokens.min(self.length());
    }

    /// Returns the total number of tokens in the sequence, candidates
    /// included.
    pub fn length(&self) -> usize {
        self.prompt_token_ids.len() + self.output_token_ids.len()
    }

    /// Returns the length of the prompt token ids.
    pub fn get_prompt_len(&self) -> usize {
        self.prompt_token_ids.len()
    }

    /// Returns the length of the output token ids, candidates included.
    pub fn get_output_len(&self) -> usize {
        self.output_token_ids.len()
    }

    /// Returns the number of committed output tokens (no candidates).
    pub fn get_committed_output_len(&self) -> usize {
        self.output_token_ids.len() - self.num_candidate_tokens
    }

    /// Getter for `num_candidate_tokens`
    pub fn get_num_candidate_tokens(&self) -> usize {
        self.num_candidate_tokens
    }

    /// Returns all token ids, prompt followed by output.
    pub fn get_token_ids(&self) -> Vec<u32> {
        let mut output = Vec::with_capacity(self.length());
        output.extend(&self.prompt_token_ids);
        output.extend(&self.output_token_ids);
        output
    }

    /// Getter for `cumulative_logprob`
    pub fn cumulative_logprob(&self) -> f32 {
        self.cumulative_logprob
    }

    /// Returns the number of tokens whose KV entries are computed.
    pub fn get_num_computed_tokens(&self) -> usize {
        self.num_computed_tokens
    }

    /// Computes the number of tokens that have not been processed yet.
    pub fn get_num_uncomputed_tokens(&self) -> usize {
        // NOTE: we use `length()` which includes `prompt_len + output_len`
        // instead of `prompt_len` here. This is because during recompute
        // we need to prefill for both prompt and output.
        self.length() - self.get_num_computed_tokens()
    }

    /// Updates the number of computed tokens after a scheduling step.
    ///
    /// Transitions the sequence from the `Prefill` stage to the `Decode`
    /// stage once every token (prompt and any previously generated output)
    /// has been computed.
    #[instrument(skip(self))]
    pub fn update_num_computed_tokens(
        &mut self,
        num_new_computed_tokens: usize,
    ) -> Result<(), SequenceError> {
        self.num_computed_tokens += num_new_computed_tokens;
        if self.num_computed_tokens <= self.length() {
            if self.get_num_uncomputed_tokens() == 0 {
                // The whole context is now resident in the KV cache
                self.stage = SequenceStage::Decode;
            }
            return Ok(());
        }
        error!(
            "Failed to update number of computed tokens: num_computed_tokens = {}, length() = {}",
            self.num_computed_tokens,
            self.length()
        );
        Err(SequenceError::InvalidNumberGeneratedTokens)
    }

    /// Resets the computed-token bookkeeping for recomputation.
    ///
    /// Called when the sequence is preempted: its blocks were released and
    /// both the prompt and the output produced so far must be re-prefixed.
    pub fn reset_state_for_recompute(&mut self) {
        self.num_computed_tokens = 0;
        self.stage = SequenceStage::Prefill;
    }

    /// Ensures the last token counts as uncomputed, so the next step has
    /// something to feed the model.
    ///
    /// A speculative rollback can leave every remaining token computed;
    /// the sequence would then never be schedulable again.
    pub fn cap_num_computed_tokens(&mut self) {
        if self.num_computed_tokens >= self.length() && self.length() > 0 {
            self.num_computed_tokens = self.length() - 1;
        }
    }

    /// Getter for last token id, output first
    pub fn get_last_token_id(&self) -> Option<u32> {
        if self.output_token_ids.is_empty() {
            self.prompt_token_ids.last().copied()
        } else {
            self.output_token_ids.last().copied()
        }
    }

    /// Getter for `prompt_token_ids`
    pub fn prompt_token_ids(&self) -> Vec<u32> {
        self.prompt_token_ids.clone()
    }

    /// Getter for `output_token_ids`
    pub fn output_token_ids(&self) -> Vec<u32> {
        self.output_token_ids.clone()
    }

    /// Getter for `stage`
    pub fn stage(&self) -> SequenceStage {
        self.stage
    }
}

/// `Sequence` - A single branch of generation within a request.
///
/// Next to the token-level `SequenceData`, a sequence maintains its logical
/// block layout (used by the block manager to mirror physical allocation),
/// its scheduling status and its per-step output log probabilities.
#[derive(Clone, Debug)]
pub struct Sequence {
    /// Unique identifier of this sequence
    sequence_id: u64,
    /// Token-level state
    pub sequence_data: SequenceData,
    /// Logical token blocks, mirroring the physical block table
    logical_token_blocks: Vec<LogicalTokenBlock>,
    /// Block size, in tokens
    block_size: usize,
    /// Scheduling status
    sequence_status: SequenceStatus,
    /// Per-step log probabilities of generated tokens
    pub output_logprobs: Vec<LogProb>,
    /// Set when the cache evictor removed blocks from the middle of this
    /// sequence; the sequence must be recomputed before its next forward
    pub kv_gapped: bool,
}

impl Sequence {
    /// Constructor
    pub fn new(
        sequence_id: u64,
        prompt_token_ids: Vec<u32>,
        block_size: usize,
    ) -> Result<Self, SequenceError> {
        if prompt_token_ids.is_empty() {
            return Err(SequenceError::EmptyPrompt);
        }
        let mut this = Self {
            sequence_id,
            sequence_data: SequenceData::new(prompt_token_ids.clone()),
            logical_token_blocks: vec![],
            block_size,
            sequence_status: SequenceStatus::Waiting,
            output_logprobs: vec![],
            kv_gapped: false,
        };
        this.append_tokens_to_blocks(&prompt_token_ids)?;
        Ok(this)
    }

    /// Getter for `sequence_id`
    pub fn sequence_id(&self) -> u64 {
        self.sequence_id
    }

    /// Getter for `block_size`
    pub fn block_size(&self) -> usize {
        self.block_size
    }

    /// Appends token ids to the tail of `logical_token_blocks`, growing it
    /// as needed.
    fn append_tokens_to_blocks(&mut self, token_ids: &[u32]) -> Result<(), SequenceError> {
        let mut cursor = 0;
        while cursor < token_ids.len() {
            match self.logical_token_blocks.last_mut() {
                Some(last_block) if !last_block.is_full() => {
                    let num_empty_slots = last_block.get_num_empty_slots();
                    let take = num_empty_slots.min(token_ids.len() - cursor);
                    last_block.append_tokens(&token_ids[cursor..cursor + take])?;
                    cursor += take;
                }
                _ => {
                    self.logical_token_blocks.push(LogicalTokenBlock::new(
                        self.logical_token_blocks.len(),
                        self.block_size,
                    ));
                }
            }
        }
        Ok(())
    }

    /// Removes the last `num_tokens` tokens from the logical blocks,
    /// dropping emptied blocks.
    fn truncate_tokens_from_blocks(&mut self, mut num_tokens: usize) {
        while num_tokens > 0 {
            match self.logical_token_blocks.last_mut() {
                Some(last_block) => {
                    let in_block = self.block_size - last_block.get_num_empty_slots();
                    let take = in_block.min(num_tokens);
                    last_block.truncate_tokens(take);
                    num_tokens -= take;
                    if last_block.is_empty() {
                        self.logical_token_blocks.pop();
                    }
                }
                None => break,
            }
        }
    }

    /// Adds a newly sampled token to the sequence.
    #[instrument(skip(self))]
    pub fn add_token_id(&mut self, token_id: u32, logprob: f32) -> Result<(), SequenceError> {
        self.append_tokens_to_blocks(&[token_id])?;
        self.sequence_data.add_token_id(token_id, logprob);
        self.output_logprobs.push(LogProb::new(logprob, None));
        Ok(())
    }

    /// Appends unverified speculative candidates to the sequence.
    #[instrument(skip(self))]
    pub fn append_candidate_tokens(
        &mut self,
        token_ids: &[u32],
        logprobs: &[f32],
    ) -> Result<(), SequenceError> {
        self.append_tokens_to_blocks(token_ids)?;
        self.sequence_data.append_candidate_tokens(token_ids, logprobs);
        Ok(())
    }

    /// Commits the accepted candidates, one log probability per accepted
    /// token, and discards the rest.
    ///
    /// # Returns
    /// The number of removed candidate tokens.
    pub fn commit_candidate_tokens(&mut self, accepted_logprobs: &[f32]) -> usize {
        let logprob_sum = accepted_logprobs.iter().sum();
        let num_removed = self
            .sequence_data
            .commit_candidate_tokens(accepted_logprobs.len(), logprob_sum);
        self.truncate_tokens_from_blocks(num_removed);
        // Accepted candidates become ordinary output tokens and need their
        // per-token log probabilities on record
        self.output_logprobs
            .extend(accepted_logprobs.iter().map(|lp| LogProb::new(*lp, None)));
        num_removed
    }

    /// Removes the last `num_tokens` output tokens (draft-side rollback).
    pub fn truncate_output_tokens(&mut self, num_tokens: usize) {
        self.sequence_data.truncate_output_tokens(num_tokens);
        self.truncate_tokens_from_blocks(num_tokens);
        self.output_logprobs
            .truncate(self.sequence_data.get_committed_output_len());
    }

    /// Number of logical blocks the sequence currently occupies.
    pub fn get_num_total_logical_token_blocks(&self) -> usize {
        self.logical_token_blocks.len()
    }

    /// Checks whether the logical block at `logical_idx` is fully
    /// populated.
    pub fn is_block_full(&self, logical_idx: usize) -> bool {
        self.logical_token_blocks
            .get(logical_idx)
            .map(|b| b.is_full())
            .unwrap_or(false)
    }

    /// Content hash of the logical block at `logical_idx`.
    ///
    /// The hash covers every token id from the start of the sequence up to
    /// the end of that block, so equal hashes imply equal prefixes and a
    /// block can be shared across requests.
    pub fn hash_of_block(&self, logical_idx: usize) -> u64 {
        let num_tokens = self.num_hashed_tokens_of_block(logical_idx);
        let all_token_ids = self.sequence_data.get_token_ids();
        let mut hasher = DefaultHasher::new();
        all_token_ids[..num_tokens].hash(&mut hasher);
        hasher.finish()
    }

    /// Number of tokens covered by the hash of block `logical_idx`.
    pub fn num_hashed_tokens_of_block(&self, logical_idx: usize) -> usize {
        (logical_idx + 1) * self.block_size
    }

    /// Resets the sequence state for recomputation after preemption.
    pub fn reset_state_for_recompute(&mut self) {
        self.sequence_data.reset_state_for_recompute();
        self.kv_gapped = false;
    }

    /// Total sequence length (prompt + output)
    pub fn length(&self) -> usize {
        self.sequence_data.length()
    }

    /// Prompt length
    pub fn get_prompt_len(&self) -> usize {
        self.sequence_data.get_prompt_len()
    }

    /// Output length, candidates included
    pub fn get_output_len(&self) -> usize {
        self.sequence_data.get_output_len()
    }

    /// All token ids, prompt followed by output
    pub fn get_token_ids(&self) -> Vec<u32> {
        self.sequence_data.get_token_ids()
    }

    /// Last token id of the sequence
    pub fn get_last_token_id(&self) -> Option<u32> {
        self.sequence_data.get_last_token_id()
    }

    /// Cumulative log probability of the generated output
    pub fn cumulative_logprob(&self) -> f32 {
        self.sequence_data.cumulative_logprob()
    }

    /// Getter for `sequence_status`
    pub fn get_sequence_status(&self) -> SequenceStatus {
        self.sequence_status
    }

    /// Sets the sequence status. Terminal states are sticky: a finished
    /// sequence never transitions again.
    pub fn set_sequence_status(&mut self, sequence_status: SequenceStatus) {
        if self.sequence_status.is_finished() {
            return;
        }
        self.sequence_status = sequence_status;
    }

    /// Checks if the sequence reached a terminal state
    pub fn is_finished(&self) -> bool {
        self.sequence_status.is_finished()
    }

    /// Length-penalised beam score of the sequence,
    /// `cumulative_logprob / output_len^length_penalty`.
    pub fn get_beam_search_score(&self, length_penalty: f32) -> f32 {
        let output_len = self.get_output_len().max(1);
        self.cumulative_logprob() / (output_len as f32).powf(length_penalty)
    }

    /// Creates a copy of this sequence under a new id, used for beam
    /// expansion. The physical block table is forked separately by the
    /// block manager.
    pub fn fork(&self, new_sequence_id: u64) -> Self {
        let mut new_sequence = self.clone();
        new_sequence.sequence_id = new_sequence_id;
        new_sequence
    }

    /// Number of tokens this sequence needs computed on its next step.
    ///
    /// One token for a plain decode; more during prefill, recompute or
    /// when speculative candidates are pending verification.
    pub fn get_num_new_tokens(&self) -> usize {
        self.sequence_data.get_num_uncomputed_tokens()
    }

    /// Checks if the sequence is in the prefill stage
    pub fn is_prefill(&self) -> bool {
        self.sequence_data.stage() == SequenceStage::Prefill
    }
}

/// A thread-safe, shared-ownership wrapper for `Sequence`.
pub type SyncSequence = Arc<RwLock<Sequence>>;

impl ReadLock for SyncSequence {
    type Error = SequenceError;
    type Inner = Sequence;

    fn read_lock(&self) -> Result<RwLockReadGuard<Self::Inner>, Self::Error> {
        self.read()
            .map_err(|e| SequenceError::PoisonError(e.to_string()))
    }
}

impl WriteLock for SyncSequence {
    type Error = SequenceError;
    type Inner = Sequence;

    fn write_lock(&self) -> Result<RwLockWriteGuard<Self::Inner>, Self::Error> {
        self.write()
            .map_err(|e| SequenceError::PoisonError(e.to_string()))
    }
}

/// `SequenceGroup` - One user request.
///
/// A group owns at least one sequence; beam search and parallel sampling
/// fork more after the first sampled token. All sequences share the prompt
/// and the sampling parameters. The group is the scheduling unit: it sits in
/// exactly one of the scheduler's queues at any time.
#[derive(Clone)]
pub struct SequenceGroup {
    /// The request id that created this group
    pub request_id: u64,
    /// The sequences of the group, keyed by sequence id
    pub sequences: HashMap<u64, SyncSequence>,
    /// Request-level sampling parameters
    sampling_params: SamplingParams,
    /// Lifecycle metrics
    pub metrics: Arc<RwLock<RequestMetrics>>,
    /// Seeded PRNG shared by the group's sampling state. Persisting the
    /// generator across steps makes identically-seeded runs identical.
    pub rng: Arc<RwLock<StdRng>>,
}

impl SequenceGroup {
    /// Constructor
    pub fn new(
        request_id: u64,
        sequences: Vec<SyncSequence>,
        sampling_params: SamplingParams,
    ) -> Result<Self, SequenceError> {
        if sequences.is_empty() {
            return Err(SequenceError::ConstructorError(
                "`SequenceGroup` requires at least one sequence".into(),
            ));
        }
        let now = Instant::now();
        let seed = sampling_params.seed();
        Ok(Self {
            request_id,
            sequences: sequences
                .into_iter()
                .map(|s| {
                    let id = s
                        .read()
                        .map(|s| s.sequence_id())
                        .map_err(|e| SequenceError::PoisonError(e.to_string()))?;
                    Ok((id, s))
                })
                .collect::<Result<HashMap<_, _>, SequenceError>>()?,
            sampling_params,
            metrics: Arc::new(RwLock::new(RequestMetrics {
                arrival_time: now,
                last_token_time: now,
                first_scheduled_time: None,
                first_token_time: None,
                time_in_queue: None,
                finished_time: None,
            })),
            rng: Arc::new(RwLock::new(StdRng::seed_from_u64(seed))),
        })
    }

    /// Getter for `sampling_params`
    pub fn sampling_params(&self) -> SamplingParams {
        self.sampling_params.clone()
    }

    /// Prompt token ids, shared by every sequence of the group.
    pub fn prompt_token_ids(&self) -> Vec<u32> {
        self.sequences
            .values()
            .next()
            .map(|s| s.read().unwrap().sequence_data.prompt_token_ids())
            .unwrap_or_default()
    }

    /// Arrival time of the request
    pub fn arrival_time(&self) -> Instant {
        self.metrics.read().unwrap().arrival_time
    }

    /// The maximum number of sequences running in parallel this group can
    /// reach in the remainder of its lifetime.
    pub fn get_max_num_running_seqs(&self) -> usize {
        if self.sampling_params.is_beam_search() {
            // Beam search can expand up to the beam width
            return self.sampling_params.beam_width();
        }
        self.num_unfinished_sequences().max(1)
    }

    /// Sequences of the group with the given status; all of them when
    /// `status` is `None`.
    pub fn get_seqs(&self, status: Option<SequenceStatus>) -> Vec<SyncSequence> {
        match status {
            Some(status) => self
                .sequences
                .values()
                .filter(|s| s.read().unwrap().get_sequence_status() == status)
                .cloned()
                .collect(),
            None => self.sequences.values().cloned().collect(),
        }
    }

    /// Ids of sequences with the given status.
    pub fn get_sequences_ids(&self, status: Option<SequenceStatus>) -> Vec<u64> {
        self.get_seqs(status)
            .iter()
            .map(|s| s.read().unwrap().sequence_id())
            .collect()
    }

    /// First sequence with the given status, if any.
    pub fn get_first_sequence(&self, status: Option<SequenceStatus>) -> Option<&SyncSequence> {
        self.sequences.values().find(|s| match status {
            Some(status) => s.read().unwrap().get_sequence_status() == status,
            None => true,
        })
    }

    /// Finds a sequence of the group by id.
    pub fn find(&self, sequence_id: u64) -> Option<SyncSequence> {
        self.sequences.get(&sequence_id).cloned()
    }

    /// Adds a new sequence to this group, no-op if the id already exists.
    pub fn add(&mut self, sequence: SyncSequence) {
        let sequence_id = { sequence.read().unwrap().sequence_id() };
        self.sequences.entry(sequence_id).or_insert(sequence);
    }

    /// Removes a sequence from this group, idempotent.
    pub fn remove(&mut self, sequence_id: u64) {
        self.sequences.remove(&sequence_id);
    }

    /// Unfinished sequences of the group.
    pub fn get_unfinished_sequences(&self) -> Vec<SyncSequence> {
        self.sequences
            .values()
            .filter(|s| !s.read().unwrap().is_finished())
            .cloned()
            .collect()
    }

    /// Finished sequences of the group.
    pub fn get_finished_sequences(&self) -> Vec<SyncSequence> {
        self.sequences
            .values()
            .filter(|s| s.read().unwrap().is_finished())
            .cloned()
            .collect()
    }

    /// Number of unfinished sequences
    pub fn num_unfinished_sequences(&self) -> usize {
        self.get_unfinished_sequences().len()
    }

    /// Updates the computed-token counters of every running sequence.
    pub fn update_num_computed_tokens(
        &self,
        token_chunk_size: usize,
    ) -> Result<(), SequenceError> {
        for sequence in self.sequences.values() {
            let mut guard = sequence.write_lock()?;
            if !guard.is_finished() && guard.get_sequence_status() == SequenceStatus::Running {
                guard
                    .sequence_data
                    .update_num_computed_tokens(token_chunk_size)?;
            }
        }
        Ok(())
    }

    /// Number of uncomputed tokens across unfinished sequences.
    pub fn get_num_uncomputed_tokens(&self) -> usize {
        self.get_unfinished_sequences()
            .iter()
            .map(|s| s.read().unwrap().sequence_data.get_num_uncomputed_tokens())
            .sum()
    }

    /// Number of sequences with the given status; all of them when `None`.
    pub fn get_num_sequences(&self, status: Option<SequenceStatus>) -> usize {
        self.get_seqs(status).len()
    }

    /// Number of logical blocks needed by the first sequence with `status`.
    ///
    /// # Note
    /// All sequences of a group share the same initial prompt, so checking
    /// the first matching sequence is sufficient for admission decisions.
    pub fn get_num_total_logical_token_blocks(&self, status: SequenceStatus) -> Option<usize> {
        self.sequences.values().find_map(|s| {
            let guard = s.read().unwrap();
            if guard.get_sequence_status() == status {
                Some(guard.get_num_total_logical_token_blocks())
            } else {
                None
            }
        })
    }

    /// Checks if the group is in the prefill phase.
    ///
    /// All sequences of a group advance through the same phase; only the
    /// first unfinished one is checked.
    pub fn is_prefill(&self) -> bool {
        self.get_unfinished_sequences()
            .first()
            .map(|s| s.read().unwrap().is_prefill())
            .unwrap_or(false)
    }

    /// Checks if generation is finished for all sequences of the group.
    pub fn is_finished(&self) -> bool {
        self.sequences
            .values()
            .all(|s| s.read().unwrap().is_finished())
    }

    /// Records the first time the group got scheduled.
    pub fn maybe_set_first_scheduled_time(&self, time: Instant) {
        let mut metrics = self.metrics.write().unwrap();
        if metrics.first_scheduled_time.is_none() {
            metrics.first_scheduled_time = Some(time);
            metrics.time_in_queue = Some(time - metrics.arrival_time);
        }
    }

    /// Records the first generated token time.
    pub fn maybe_set_first_token_time(&self, time: Instant) {
        let mut metrics = self.metrics.write().unwrap();
        if metrics.first_token_time.is_none() {
            metrics.first_token_time = Some(time);
        }
        metrics.last_token_time = time;
    }

    /// Records the completion time.
    pub fn set_finished_time(&self, time: Instant) {
        self.metrics.write().unwrap().finished_time = Some(time);
    }
}

impl std::fmt::Debug for SequenceGroup {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SequenceGroup")
            .field("request_id", &self.request_id)
            .field("sequences", &self.sequences)
            .field("sampling_params", &self.sampling_params)
            .finish()
    }
}

/// Metadata snapshot of a scheduled sequence group, handed to the executor
/// and the sampler.
pub struct SequenceGroupMetadata {
    /// The request id of the group
    pub request_id: u64,
    /// Whether the current step processes prompt tokens
    pub is_prompt: bool,
    /// Per-sequence token state, keyed by sequence id, in scheduling order
    pub sequence_data: Vec<(u64, SequenceData)>,
    /// Mapping of sequence ids to their physical block numbers
    pub block_tables: HashMap<u64, Vec<u32>>,
    /// Whether sampling happens this step. `false` for non-final prefill
    /// chunks.
    pub do_sample: bool,
    /// Number of tokens scheduled per sequence in this step
    pub token_chunk_size: usize,
    /// Request-level sampling parameters
    pub sampling_params: SamplingParams,
    /// The group's persistent PRNG
    pub rng: Arc<RwLock<StdRng>>,
}

impl std::fmt::Debug for SequenceGroupMetadata {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SequenceGroupMetadata")
            .field("request_id", &self.request_id)
            .field("is_prompt", &self.is_prompt)
            .field("do_sample", &self.do_sample)
            .field("token_chunk_size", &self.token_chunk_size)
            .field("sequence_data", &self.sequence_data)
            .finish()
    }
}

#[derive(Debug, Error)]
pub enum SequenceError {
    #[error("Poison error: `{0}`")]
    PoisonError(String),
    #[error("Constructor error: `{0}`")]
    ConstructorError(String),
    #[error("Block error: `{0}`")]
    BlockError(#[from] BlockError),
    #[error("Invalid number of newly generated tokens")]
    InvalidNumberGeneratedTokens,
    #[error("Prompt must not be empty")]
    EmptyPrompt,
    #[error("Missing sequence with id = `{0}`")]
    MissingSequence(u64),
}

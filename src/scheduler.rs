use std::{
    collections::{HashSet, VecDeque},
    fmt::Debug,
    marker::PhantomData,
    sync::Arc,
    time::Instant,
};

use thiserror::Error;
use tracing::{error, info, info_span, instrument, trace, warn, Span};

use crate::{
    block_manager::{AllocationStatus, BlockSpaceManager, BlockSpaceManagerError},
    cache_eviction::CacheEvictor,
    config::{CacheConfig, SchedulerConfig},
    policy::Policy,
    sequence::{
        Sequence, SequenceError, SequenceGroup, SequenceGroupMetadata, SequenceStatus,
    },
    types::{ReadLock, WriteLock},
};

/// Pool fraction below which the cache evictor starts nominating victims
const CACHE_EVICTION_WATERMARK: f32 = 0.1;

/// Preemption modes.
///
/// 1. `SwapOut`: Release the blocks of the preempted sequences but retain
///     their token ids; the group parks in the swapped queue and is later
///     re-prefixed.
/// 2. `Recomputation`: Release the blocks and move the group back to the
///     front of the waiting queue, treating its sequences as new prompts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PreemptionMode {
    SwapOut,
    Recomputation,
}

/// `SchedulingBudget` - The available token and sequence slots of one
/// scheduling step.
///
/// The budget is request-id aware: accounting for the same request twice is
/// a no-op, which keeps the running-queue pre-accounting and the per-queue
/// scheduling passes from double counting.
#[derive(Debug)]
struct SchedulingBudget {
    /// Maximum number of tokens that can be scheduled
    pub token_budget: usize,
    /// Maximum number of sequences that can be scheduled
    pub max_num_sequences: usize,
    /// Request ids that have contributed to `num_batched_tokens`
    request_ids_num_batched_tokens: HashSet<u64>,
    /// Request ids that have contributed to `num_curr_seqs`
    request_ids_num_curr_seqs: HashSet<u64>,
    /// Number of batched tokens currently planned
    num_batched_tokens: usize,
    /// Number of currently planned sequences
    num_curr_seqs: usize,
}

impl SchedulingBudget {
    /// Creates a new `SchedulingBudget` with the specified token budget and
    /// maximum number of sequences.
    pub fn new(token_budget: usize, max_num_sequences: usize) -> Self {
        Self {
            token_budget,
            max_num_sequences,
            request_ids_num_batched_tokens: HashSet::new(),
            request_ids_num_curr_seqs: HashSet::new(),
            num_batched_tokens: 0,
            num_curr_seqs: 0,
        }
    }

    /// Checks whether `num_new_tokens` tokens and `num_new_sequences`
    /// sequences still fit.
    pub fn can_schedule(
        &self,
        num_new_tokens: usize,
        num_new_sequences: usize,
    ) -> Result<bool, SchedulerError> {
        if num_new_sequences == 0 || num_new_tokens == 0 {
            error!("Empty scheduling, either `num_new_sequences` == 0 or `num_new_tokens` == 0");
            return Err(SchedulerError::EmptyScheduling);
        }

        Ok((self.num_batched_tokens + num_new_tokens <= self.token_budget)
            && (self.num_curr_seqs + num_new_sequences <= self.max_num_sequences))
    }

    /// Computes the remaining number of budget tokens
    pub fn remaining_token_budget(&self) -> usize {
        self.token_budget - self.num_batched_tokens
    }

    /// Adds number of batched tokens
    pub fn add_num_batched_tokens(&mut self, request_id: u64, num_batched_tokens: usize) {
        // If the request has already been accounted for, simply return
        if self.request_ids_num_batched_tokens.contains(&request_id) {
            return;
        }
        self.request_ids_num_batched_tokens.insert(request_id);
        self.num_batched_tokens += num_batched_tokens;
    }

    /// Subtracts number of batched tokens
    pub fn subtract_num_batched_tokens(&mut self, request_id: u64, num_batched_tokens: usize) {
        if self.request_ids_num_batched_tokens.contains(&request_id) {
            self.request_ids_num_batched_tokens.remove(&request_id);
            self.num_batched_tokens -= num_batched_tokens;
        }
    }

    /// Adds number of sequences
    pub fn add_num_sequences(&mut self, request_id: u64, num_current_sequences: usize) {
        if self.request_ids_num_curr_seqs.contains(&request_id) {
            return;
        }
        self.request_ids_num_curr_seqs.insert(request_id);
        self.num_curr_seqs += num_current_sequences;
    }

    /// Subtracts number of sequences
    pub fn subtract_num_sequences(&mut self, request_id: u64, num_current_sequences: usize) {
        if self.request_ids_num_curr_seqs.contains(&request_id) {
            self.request_ids_num_curr_seqs.remove(&request_id);
            self.num_curr_seqs -= num_current_sequences;
        }
    }

    /// Number of batched tokens
    pub fn num_batched_tokens(&self) -> usize {
        self.num_batched_tokens
    }

    /// Number of current sequences
    pub fn num_current_sequences(&self) -> usize {
        self.num_curr_seqs
    }
}

/// A sequence group scheduled for the next step, together with the number
/// of tokens it advances.
#[derive(Clone, Debug)]
pub struct ScheduledSequenceGroup {
    /// The scheduled group
    pub scheduled_group: SequenceGroup,
    /// The total chunk size (number of tokens) to process per sequence.
    /// 1 for decodes; the prompt length (or a chunk of it) for prefills.
    pub token_chunk_size: usize,
}

/// The requests scheduled from the running queue.
///
/// Could contain prefills (chunked) or decodes. If there's not enough
/// memory, tail groups are preempted for recomputation or swapped out.
struct SchedulerRunningOutputs {
    /// Running sequence groups in a decoding phase
    decode_seq_groups: Vec<ScheduledSequenceGroup>,
    /// Running sequence groups in a prefill phase, i.e. chunked prefills
    prefill_seq_groups: Vec<ScheduledSequenceGroup>,
    /// Preempted groups (recomputation mode)
    preempted: Vec<SequenceGroup>,
    /// Swapped-out groups
    swapped_out: Vec<SequenceGroup>,
    /// Copy-on-write source/destination block pairs
    blocks_to_copy: Vec<(u32, u32)>,
}

impl SchedulerRunningOutputs {
    fn create_empty() -> Self {
        Self {
            decode_seq_groups: vec![],
            prefill_seq_groups: vec![],
            preempted: vec![],
            swapped_out: vec![],
            blocks_to_copy: vec![],
        }
    }
}

/// The requests re-admitted from the swapped queue.
///
/// Swapped groups hold no blocks; re-admission allocates a fresh table and
/// re-prefixes prompt plus previously generated tokens.
struct SchedulerSwappedInOutputs {
    /// Re-admitted groups, all in a (re-)prefill phase
    prefill_seq_groups: Vec<ScheduledSequenceGroup>,
    /// Groups that can never fit and are failed
    infeasible_seq_groups: Vec<SequenceGroup>,
}

impl SchedulerSwappedInOutputs {
    fn create_empty() -> Self {
        Self {
            prefill_seq_groups: vec![],
            infeasible_seq_groups: vec![],
        }
    }
}

/// The requests admitted from the waiting queue.
#[derive(Debug)]
struct SchedulerPrefillOutputs {
    /// Admitted groups
    sequence_groups: Vec<ScheduledSequenceGroup>,
    /// Groups that can never be served and are failed
    ignored_sequence_groups: Vec<SequenceGroup>,
}

impl SchedulerPrefillOutputs {
    fn create_empty() -> Self {
        Self {
            sequence_groups: vec![],
            ignored_sequence_groups: vec![],
        }
    }
}

/// `SchedulerOutputs` - The scheduling decision made from a scheduler.
#[derive(Clone, Debug)]
pub struct SchedulerOutputs {
    /// Scheduled sequence groups, prefills ordered before decodes
    pub scheduled_sequence_groups: Vec<ScheduledSequenceGroup>,
    /// Number of prefill groups scheduled
    pub number_prefill_groups: usize,
    /// Total number of batched tokens
    pub num_batched_tokens: usize,
    /// Copy-on-write source/destination block pairs the executor must
    /// apply before the forward pass
    pub blocks_to_copy: Vec<(u32, u32)>,
    /// Groups that can never be served (prompt exceeds pool capacity)
    pub ignored_seq_groups: Vec<SequenceGroup>,
    /// The number of requests in the running queue after scheduling
    pub running_queue_size: usize,
    /// Number of preempted sequence groups
    pub preempted: usize,
}

impl SchedulerOutputs {
    /// Creates a new empty instance
    pub fn create_empty() -> Self {
        Self {
            scheduled_sequence_groups: vec![],
            number_prefill_groups: 0,
            num_batched_tokens: 0,
            blocks_to_copy: vec![],
            ignored_seq_groups: vec![],
            running_queue_size: 0,
            preempted: 0,
        }
    }

    /// Checks if the current instance is empty
    pub fn is_empty(&self) -> bool {
        self.scheduled_sequence_groups.is_empty() && self.blocks_to_copy.is_empty()
    }
}

/// `Scheduler` - Decides which sequence groups advance on each step and how
/// the physical block pool is divided among them.
///
/// The scheduler keeps three queues: `waiting` (FIFO by arrival), `running`
/// and `swapped` (preempted groups whose token ids were retained). On each
/// step it first keeps running groups running (reserving one slot per
/// sequence), preempts from the tail of the running queue when the pool is
/// exhausted, and admits waiting groups while the token and sequence
/// budgets allow.
#[derive(Debug)]
pub struct Scheduler<P> {
    /// Cache configuration
    pub(crate) cache_config: CacheConfig,
    /// `Scheduler` configuration
    pub(crate) scheduler_config: SchedulerConfig,
    /// `BlockSpaceManager` to handle block resources efficiently
    block_manager: BlockSpaceManager,
    /// Importance-based cache evictor, when enabled
    cache_evictor: Option<CacheEvictor>,
    /// Queue of groups waiting to be (re-)prefixed
    waiting: VecDeque<SequenceGroup>,
    /// Queue of groups currently running
    running: VecDeque<SequenceGroup>,
    /// Queue of groups swapped out of the cache
    swapped: VecDeque<SequenceGroup>,
    /// Total number of preemptions, for logging and metrics
    num_cumulative_preemption: usize,
    /// Generic parameter for the scheduling policy
    _phantom: PhantomData<P>,
    /// Tracing span
    span: Span,
}

impl<P> Scheduler<P> {
    /// Constructor
    pub fn new(
        cache_config: CacheConfig,
        scheduler_config: SchedulerConfig,
    ) -> Result<Self, SchedulerError> {
        let cache_evictor = cache_config
            .use_cache_eviction()
            .then(|| CacheEvictor::new(CACHE_EVICTION_WATERMARK));
        Ok(Self {
            block_manager: BlockSpaceManager::new(&cache_config),
            cache_config,
            scheduler_config,
            cache_evictor,
            waiting: VecDeque::new(),
            running: VecDeque::new(),
            swapped: VecDeque::new(),
            num_cumulative_preemption: 0,
            _phantom: PhantomData,
            span: info_span!("scheduler"),
        })
    }

    /// Adds a new `SequenceGroup` to the back of the waiting queue.
    #[instrument(skip_all)]
    pub fn add_sequence_group(&mut self, sequence_group: SequenceGroup) {
        trace!(
            "Adding sequence group with request_id = {}",
            sequence_group.request_id
        );
        self.waiting.push_back(sequence_group);
    }

    /// Checks if there are unfinished sequence groups in any queue.
    pub fn has_unfinished_sequences(&self) -> bool {
        !self.waiting.is_empty() || !self.running.is_empty() || !self.swapped.is_empty()
    }

    /// Total number of unfinished sequence groups.
    pub fn num_unfinished_sequence_groups(&self) -> usize {
        self.waiting.len() + self.running.len() + self.swapped.len()
    }

    /// Number of free blocks in the pool.
    pub fn get_num_free_blocks(&self) -> usize {
        self.block_manager.get_num_free_blocks()
    }

    /// Total number of blocks in the pool.
    pub fn get_num_total_blocks(&self) -> usize {
        self.block_manager.get_num_total_blocks()
    }

    /// Aborts a sequence group: every unfinished sequence is marked
    /// `Dropped` and its blocks are returned to the pool.
    ///
    /// # Returns
    /// `true` if a group with this request id was found in any queue.
    #[instrument(skip(self))]
    pub fn abort_sequence_group(&mut self, request_id: u64) -> Result<bool, SchedulerError> {
        let mut found = false;
        for queue in [&mut self.waiting, &mut self.running, &mut self.swapped] {
            if let Some(position) = queue.iter().position(|g| g.request_id == request_id) {
                // DON'T PANIC: position was just found
                let group = queue.remove(position).unwrap();
                for sequence in group.sequences.values() {
                    let sequence_id = {
                        let mut guard = sequence.write_lock()?;
                        guard.set_sequence_status(SequenceStatus::Dropped);
                        guard.sequence_id()
                    };
                    self.block_manager.free_sequence(sequence_id)?;
                    if let Some(evictor) = self.cache_evictor.as_mut() {
                        evictor.forget_sequence(sequence_id);
                    }
                }
                info!("Aborted sequence group with request_id = {request_id}");
                found = true;
                break;
            }
        }
        Ok(found)
    }

    /// Registers a forked child sequence with its group and shares the
    /// parent's block table.
    ///
    /// The child's table is a shallow copy; divergence is handled by
    /// copy-on-write on the next write to a shared block.
    ///
    /// # Returns
    /// The registered child, so the caller can keep mutating it.
    #[instrument(skip(self, child))]
    pub fn fork_sequence(
        &mut self,
        request_id: u64,
        parent_sequence_id: u64,
        child: Sequence,
    ) -> Result<crate::sequence::SyncSequence, SchedulerError> {
        let group = self
            .running
            .iter_mut()
            .find(|g| g.request_id == request_id)
            .ok_or(SchedulerError::MissingSequenceGroup(request_id))?;
        self.block_manager
            .fork(parent_sequence_id, child.sequence_id())?;
        let child = Arc::new(std::sync::RwLock::new(child));
        group.add(child.clone());
        Ok(child)
    }

    /// Finds a sequence group in any queue by request id.
    pub fn get_sequence_group(&self, request_id: u64) -> Option<&SequenceGroup> {
        self.sequence_groups()
            .find(|group| group.request_id == request_id)
    }

    /// Checks whether a request is still known to any queue.
    pub fn contains_request(&self, request_id: u64) -> bool {
        self.get_sequence_group(request_id).is_some()
    }

    /// Iterates over every sequence group in the scheduler's queues.
    pub fn sequence_groups(&self) -> impl Iterator<Item = &SequenceGroup> {
        self.running
            .iter()
            .chain(self.waiting.iter())
            .chain(self.swapped.iter())
    }

    /// Sizes of the (waiting, running, swapped) queues.
    pub fn queue_sizes(&self) -> (usize, usize, usize) {
        (self.waiting.len(), self.running.len(), self.swapped.len())
    }

    /// Frees the trailing physical blocks of a sequence beyond
    /// `num_blocks_to_keep`; tolerant of sequences without a table
    /// (speculative rollback can race a preemption).
    pub fn free_trailing_blocks(
        &mut self,
        sequence_id: u64,
        num_blocks_to_keep: usize,
    ) -> Result<(), SchedulerError> {
        match self
            .block_manager
            .free_trailing_blocks(sequence_id, num_blocks_to_keep)
        {
            Ok(()) => Ok(()),
            Err(BlockSpaceManagerError::MissingSequence(_)) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    /// Frees the blocks of every finished sequence and drops finished
    /// groups from the running queue.
    #[instrument(skip_all)]
    pub fn free_finished_sequence_groups(&mut self) -> Result<(), SchedulerError> {
        for group in self.running.iter() {
            for sequence in group.get_finished_sequences() {
                let sequence_id = { sequence.read_lock()?.sequence_id() };
                self.block_manager.free_sequence(sequence_id)?;
                if let Some(evictor) = self.cache_evictor.as_mut() {
                    evictor.forget_sequence(sequence_id);
                }
            }
        }
        self.running.retain(|group| !group.is_finished());
        Ok(())
    }

    /// The longest prompt the scheduler can admit in one piece.
    fn get_prompt_limit(&self) -> usize {
        if self.scheduler_config.enable_chunked_prefill() {
            self.scheduler_config.max_model_len()
        } else {
            self.scheduler_config
                .max_num_batched_tokens()
                .min(self.scheduler_config.max_model_len())
        }
    }

    /// Calculates the number of new tokens to compute for a sequence group,
    /// summed over its sequences with the given status.
    ///
    /// When chunking is enabled, a single-sequence prefill is capped to the
    /// remaining token budget; decodes and multi-sequence groups are never
    /// chunked.
    fn get_num_tokens(
        &self,
        sequence_group: &SequenceGroup,
        status: SequenceStatus,
        enable_chunking: bool,
        budget: &SchedulingBudget,
    ) -> Result<usize, SchedulerError> {
        let sequences = sequence_group.get_seqs(Some(status));
        let mut num_new_tokens = 0;
        let num_sequences = sequences.len();
        for sequence in sequences {
            num_new_tokens += sequence.read_lock()?.get_num_new_tokens();
        }
        if enable_chunking && num_sequences == 1 {
            num_new_tokens = num_new_tokens.min(budget.remaining_token_budget());
        }
        Ok(num_new_tokens)
    }
}

impl<P: Policy> Scheduler<P> {
    /// Preempts a sequence group, freeing every block it holds.
    ///
    /// The recovery mode is chosen by configuration: recomputation requeues
    /// the group at the front of the waiting queue; swap-out parks it in
    /// the swapped queue with token ids intact. Either way the KV entries
    /// are gone and the group is later re-prefixed over its full context.
    #[instrument(skip_all)]
    fn preempt(
        &mut self,
        sequence_group: &mut SequenceGroup,
    ) -> Result<PreemptionMode, SchedulerError> {
        let mode = if self.scheduler_config.preempt_by_swapping() {
            PreemptionMode::SwapOut
        } else {
            PreemptionMode::Recomputation
        };

        self.num_cumulative_preemption += 1;
        if self.num_cumulative_preemption % 50 == 1 {
            warn!(
                "Sequence group with request_id = {} is preempted by {:?} mode because there is not enough KV cache space. \
                 This can affect the end-to-end performance. Consider increasing the pool size. \
                 total_num_cumulative_preemption = {}",
                sequence_group.request_id, mode, self.num_cumulative_preemption
            );
        }
        metrics::counter!("scheduler-num-preemptions").increment(1);

        let target_status = match mode {
            PreemptionMode::Recomputation => SequenceStatus::Waiting,
            PreemptionMode::SwapOut => SequenceStatus::PausedForRecompute,
        };
        for sequence in sequence_group.get_seqs(Some(SequenceStatus::Running)) {
            let sequence_id = {
                let mut guard = sequence.write_lock()?;
                guard.set_sequence_status(target_status);
                guard.reset_state_for_recompute();
                guard.sequence_id()
            };
            self.block_manager.free_sequence(sequence_id)?;
            if let Some(evictor) = self.cache_evictor.as_mut() {
                evictor.forget_sequence(sequence_id);
            }
        }

        Ok(mode)
    }

    /// Schedules sequence groups that are currently running.
    ///
    /// Walks the priority-sorted running queue, reserving one slot per
    /// running sequence. When the pool cannot satisfy a group, victims are
    /// preempted from the tail of the queue until it fits. If the group is
    /// the only one left and still cannot be served, the cache is too small
    /// for a single sequence and the step fails with `CacheExhausted`.
    #[instrument(skip_all)]
    fn schedule_running(
        &mut self,
        running_queue: VecDeque<SequenceGroup>,
        budget: &mut SchedulingBudget,
        enable_chunking: bool,
    ) -> Result<(VecDeque<SequenceGroup>, SchedulerRunningOutputs), SchedulerError> {
        let span = self.span.clone();
        let _enter = span.enter();
        trace!("Schedule running..");

        let mut blocks_to_copy = Vec::new();
        let mut decode_seq_groups = Vec::new();
        let mut prefill_seq_groups = Vec::new();
        let mut preempted = Vec::new();
        let mut swapped_out = Vec::new();

        // Preemption happens only when there is no available slot to keep
        // all sequence groups in the `Running` state. In that case the
        // policy decides which groups to preempt next.
        let now = Instant::now();
        let mut running_queue = P::sort_by_priority(now, &running_queue);

        while let Some(sequence_group) = running_queue.pop_front() {
            let num_running_tokens = self.get_num_tokens(
                &sequence_group,
                SequenceStatus::Running,
                enable_chunking,
                budget,
            )?;

            if num_running_tokens == 0 {
                // Out of token budget; put the group back and stop
                running_queue.push_front(sequence_group);
                break;
            }

            loop {
                if !self.block_manager.can_append_slots(&sequence_group) {
                    budget
                        .subtract_num_batched_tokens(sequence_group.request_id, num_running_tokens);
                    let num_running_sequences = sequence_group.get_max_num_running_seqs();
                    budget.subtract_num_sequences(sequence_group.request_id, num_running_sequences);

                    if let Some(mut victim_sequence_group) = running_queue.pop_back() {
                        // Preempt the lowest-priority group first; the
                        // victim lies at the end of the sorted queue
                        let preempted_mode = self.preempt(&mut victim_sequence_group)?;
                        if preempted_mode == PreemptionMode::Recomputation {
                            preempted.push(victim_sequence_group);
                        } else {
                            swapped_out.push(victim_sequence_group);
                        }
                    } else {
                        // Even with every peer preempted this group cannot
                        // get a slot: the pool is too small for a single
                        // sequence. Fatal configuration error.
                        error!(
                            "Cannot allocate a slot for request_id = {} even after preempting all peers",
                            sequence_group.request_id
                        );
                        return Err(SchedulerError::CacheExhausted(sequence_group.request_id));
                    }
                } else {
                    for sequence in sequence_group.get_seqs(Some(SequenceStatus::Running)) {
                        let copies = self.block_manager.append_slots(sequence.read_lock()?)?;
                        blocks_to_copy.extend(copies);
                    }
                    let is_prefill = sequence_group.is_prefill();
                    if is_prefill {
                        // Chunked prefill continuation
                        prefill_seq_groups.push(ScheduledSequenceGroup {
                            scheduled_group: sequence_group.clone(),
                            token_chunk_size: num_running_tokens,
                        });
                    } else {
                        // Decode computation; the chunk may still exceed one
                        // token per sequence when speculative candidates
                        // await verification
                        let num_sequences = sequence_group
                            .get_num_sequences(Some(SequenceStatus::Running))
                            .max(1);
                        decode_seq_groups.push(ScheduledSequenceGroup {
                            scheduled_group: sequence_group.clone(),
                            token_chunk_size: (num_running_tokens / num_sequences).max(1),
                        });
                    }
                    budget.add_num_batched_tokens(sequence_group.request_id, num_running_tokens);

                    if enable_chunking {
                        let num_running_sequences = sequence_group.get_max_num_running_seqs();
                        budget.add_num_sequences(sequence_group.request_id, num_running_sequences);
                    }
                    break;
                }
            }
        }

        Ok((
            running_queue,
            SchedulerRunningOutputs {
                decode_seq_groups,
                prefill_seq_groups,
                preempted,
                swapped_out,
                blocks_to_copy,
            },
        ))
    }

    /// Re-admits sequence groups that were swapped out.
    ///
    /// Swapped groups hold no blocks, so re-admission follows the prefill
    /// path: allocate a fresh table and re-prefix prompt plus previously
    /// generated tokens.
    #[instrument(skip_all)]
    fn schedule_swapped(
        &mut self,
        swapped_queue: VecDeque<SequenceGroup>,
        budget: &mut SchedulingBudget,
        enable_chunking: bool,
    ) -> Result<(VecDeque<SequenceGroup>, SchedulerSwappedInOutputs), SchedulerError> {
        let _enter = self.span.enter();
        trace!("Schedule swapped..");

        let mut prefill_seq_groups = Vec::new();
        let mut infeasible_seq_groups = Vec::new();

        let now = Instant::now();
        let mut swapped_queue = P::sort_by_priority(now, &swapped_queue);

        while let Some(sequence_group) = swapped_queue.pop_front() {
            let allocation_status = self
                .block_manager
                .can_allocate_with_status(&sequence_group, SequenceStatus::PausedForRecompute);
            if allocation_status == AllocationStatus::Later {
                swapped_queue.push_front(sequence_group);
                break;
            } else if allocation_status == AllocationStatus::Never {
                warn!(
                    "Failing request {} because there are not enough KV cache blocks to ever run it",
                    sequence_group.request_id
                );
                for sequence in sequence_group.sequences.values() {
                    sequence
                        .write_lock()?
                        .set_sequence_status(SequenceStatus::FinishedStopped);
                }
                infeasible_seq_groups.push(sequence_group.clone());
                continue;
            }

            let num_new_sequences = sequence_group.get_max_num_running_seqs();
            let num_new_tokens = self.get_num_tokens(
                &sequence_group,
                SequenceStatus::PausedForRecompute,
                enable_chunking,
                budget,
            )?;

            // A re-prefill that can never fit the per-step budget would
            // pin the head of the queue forever
            if num_new_tokens > self.get_prompt_limit() {
                warn!(
                    "Failing request {}: its context ({} tokens) exceeds the re-prefill limit",
                    sequence_group.request_id, num_new_tokens
                );
                for sequence in sequence_group.sequences.values() {
                    sequence
                        .write_lock()?
                        .set_sequence_status(SequenceStatus::FinishedStopped);
                }
                infeasible_seq_groups.push(sequence_group.clone());
                continue;
            }

            if num_new_tokens == 0 || !budget.can_schedule(num_new_tokens, num_new_sequences)? {
                swapped_queue.push_front(sequence_group);
                break;
            }

            self.block_manager
                .allocate_with_status(&sequence_group, SequenceStatus::PausedForRecompute)?;
            for sequence in sequence_group.get_seqs(Some(SequenceStatus::PausedForRecompute)) {
                sequence
                    .write_lock()?
                    .set_sequence_status(SequenceStatus::Running);
            }

            prefill_seq_groups.push(ScheduledSequenceGroup {
                scheduled_group: sequence_group.clone(),
                token_chunk_size: num_new_tokens,
            });
            budget.add_num_batched_tokens(sequence_group.request_id, num_new_tokens);
            budget.add_num_sequences(sequence_group.request_id, num_new_sequences);
        }

        Ok((
            swapped_queue,
            SchedulerSwappedInOutputs {
                prefill_seq_groups,
                infeasible_seq_groups,
            },
        ))
    }

    /// Admits sequence groups from the waiting queue.
    ///
    /// The waiting queue contains fresh prompts and recompute-preempted
    /// groups; both are admitted through allocation plus (re-)prefill, in
    /// FIFO order.
    #[instrument(skip_all)]
    fn schedule_prefills(
        &mut self,
        mut waiting_queue: VecDeque<SequenceGroup>,
        budget: &mut SchedulingBudget,
        enable_chunking: bool,
    ) -> Result<(VecDeque<SequenceGroup>, SchedulerPrefillOutputs), SchedulerError> {
        let _enter = self.span.enter();
        trace!("Scheduling prefills..");

        let mut ignored_sequence_groups = Vec::new();
        let mut sequence_groups = Vec::new();

        // The waiting queue is assumed FIFO-sorted already.
        while let Some(sequence_group) = waiting_queue.pop_front() {
            let can_allocate = self
                .block_manager
                .can_allocate_with_status(&sequence_group, SequenceStatus::Waiting);
            let num_new_tokens = self.get_num_tokens(
                &sequence_group,
                SequenceStatus::Waiting,
                enable_chunking,
                budget,
            )?;

            if !enable_chunking {
                let num_uncomputed = sequence_group.get_num_uncomputed_tokens();
                if num_new_tokens != num_uncomputed {
                    error!(
                        "Invalid number of new tokens, got `{num_new_tokens}`, but it should be `{num_uncomputed}`"
                    );
                    return Err(SchedulerError::InvalidNumberOfNewTokens {
                        num_prompt_tokens: num_uncomputed,
                        num_new_tokens,
                    });
                }
            }

            let prompt_limit = self.get_prompt_limit();
            if num_new_tokens > prompt_limit {
                warn!(
                    "Input prompt ({} tokens) is too long and exceeds limit of {}",
                    num_new_tokens, prompt_limit
                );
                for sequence in sequence_group.sequences.values() {
                    sequence
                        .write_lock()?
                        .set_sequence_status(SequenceStatus::FinishedStopped);
                }
                ignored_sequence_groups.push(sequence_group.clone());
                continue;
            }

            if can_allocate == AllocationStatus::Later {
                waiting_queue.push_front(sequence_group);
                break;
            } else if can_allocate == AllocationStatus::Never {
                warn!(
                    "Input prompt ({num_new_tokens} tokens) exceeds the capacity of the block pool"
                );
                for sequence in sequence_group.sequences.values() {
                    sequence
                        .write_lock()?
                        .set_sequence_status(SequenceStatus::FinishedStopped);
                }
                ignored_sequence_groups.push(sequence_group.clone());
                continue;
            }

            let num_new_sequences = sequence_group.get_max_num_running_seqs();
            if num_new_tokens == 0 || !budget.can_schedule(num_new_tokens, num_new_sequences)? {
                waiting_queue.push_front(sequence_group);
                break;
            }

            self.block_manager
                .allocate_with_status(&sequence_group, SequenceStatus::Waiting)?;
            for sequence in sequence_group.get_seqs(Some(SequenceStatus::Waiting)) {
                sequence
                    .write_lock()?
                    .set_sequence_status(SequenceStatus::Running);
            }

            sequence_groups.push(ScheduledSequenceGroup {
                scheduled_group: sequence_group.clone(),
                token_chunk_size: num_new_tokens,
            });
            budget.add_num_batched_tokens(sequence_group.request_id, num_new_tokens);
            budget.add_num_sequences(sequence_group.request_id, num_new_sequences);
        }

        if !sequence_groups.is_empty() {
            metrics::counter!("scheduler-admitted-prefills")
                .increment(sequence_groups.len() as u64);
        }

        Ok((
            waiting_queue,
            SchedulerPrefillOutputs {
                sequence_groups,
                ignored_sequence_groups,
            },
        ))
    }

    /// Default scheduling policy: complete whole prefills first, then run
    /// decodes; re-admit swapped groups only when nothing was preempted.
    #[instrument(skip_all)]
    fn schedule_default(&mut self) -> Result<SchedulerOutputs, SchedulerError> {
        let mut budget = SchedulingBudget::new(
            self.scheduler_config.max_num_batched_tokens(),
            self.scheduler_config.max_num_sequences(),
        );

        // Account for running sequences before admitting prefills
        for sequence_group in self.running.iter() {
            budget.add_num_sequences(
                sequence_group.request_id,
                sequence_group.get_max_num_running_seqs(),
            );
        }

        let mut remaining_running = self.running.clone();
        let mut remaining_waiting = self.waiting.clone();
        let mut remaining_swapped = self.swapped.clone();

        let mut prefills = SchedulerPrefillOutputs::create_empty();
        let mut running_scheduled = SchedulerRunningOutputs::create_empty();
        let mut swapped_in = SchedulerSwappedInOutputs::create_empty();

        // If any requests are swapped, prioritize them over new prefills
        if self.swapped.is_empty() {
            (remaining_waiting, prefills) =
                self.schedule_prefills(remaining_waiting, &mut budget, false)?;
        }

        // Don't schedule decodes if prefills were scheduled this step.
        if prefills.sequence_groups.is_empty() {
            (remaining_running, running_scheduled) =
                self.schedule_running(remaining_running, &mut budget, false)?;

            // If a group was preempted there is no space for swap-ins either
            if running_scheduled.preempted.len() + running_scheduled.swapped_out.len() == 0 {
                (remaining_swapped, swapped_in) =
                    self.schedule_swapped(remaining_swapped, &mut budget, false)?;
            }
        }

        if budget.num_batched_tokens() > self.scheduler_config.max_num_batched_tokens() {
            error!("Scheduled tokens exceed the configured token budget");
            return Err(SchedulerError::ExceededTokenBudget);
        }
        if budget.num_current_sequences() > self.scheduler_config.max_num_sequences() {
            error!("Scheduled sequences exceed the configured sequence budget");
            return Err(SchedulerError::ExceededSequenceBudget);
        }

        let preempted = running_scheduled.preempted.len() + running_scheduled.swapped_out.len();

        // Update the waiting queue. Preempted groups are pushed to the
        // front, in reverse, so they keep priority over fresh requests.
        self.waiting = remaining_waiting;
        running_scheduled
            .preempted
            .iter()
            .rev()
            .for_each(|s| self.waiting.push_front(s.clone()));

        // Update the running queue: new prefills first, then decodes
        self.running = remaining_running;
        self.running.extend(
            prefills
                .sequence_groups
                .iter()
                .map(|s| s.scheduled_group.clone()),
        );
        self.running.extend(
            swapped_in
                .prefill_seq_groups
                .iter()
                .map(|s| s.scheduled_group.clone()),
        );
        self.running.extend(
            running_scheduled
                .decode_seq_groups
                .iter()
                .map(|s| s.scheduled_group.clone()),
        );

        // Update the swapped queue
        self.swapped = remaining_swapped;
        self.swapped.extend(running_scheduled.swapped_out);

        let number_prefill_groups =
            prefills.sequence_groups.len() + swapped_in.prefill_seq_groups.len();

        let scheduled_sequence_groups: Vec<ScheduledSequenceGroup> = prefills
            .sequence_groups
            .into_iter()
            .chain(swapped_in.prefill_seq_groups)
            .chain(running_scheduled.decode_seq_groups)
            .collect();

        let ignored_seq_groups = prefills
            .ignored_sequence_groups
            .into_iter()
            .chain(swapped_in.infeasible_seq_groups)
            .collect();

        Ok(SchedulerOutputs {
            scheduled_sequence_groups,
            num_batched_tokens: budget.num_batched_tokens(),
            number_prefill_groups,
            blocks_to_copy: running_scheduled.blocks_to_copy,
            ignored_seq_groups,
            running_queue_size: self.running.len(),
            preempted,
        })
    }

    /// Chunked-prefill scheduling: decodes first, then swapped re-admissions,
    /// then as many (possibly partial) prefill chunks as the budget allows.
    #[instrument(skip_all)]
    fn schedule_chunked_prefill(&mut self) -> Result<SchedulerOutputs, SchedulerError> {
        let mut budget = SchedulingBudget::new(
            self.scheduler_config.max_num_batched_tokens(),
            self.scheduler_config.max_num_sequences(),
        );

        let mut remaining_swapped = self.swapped.clone();
        let mut swapped_in = SchedulerSwappedInOutputs::create_empty();

        // Decodes are always scheduled first by FCFS
        let (remaining_running, running_scheduled) =
            self.schedule_running(self.running.clone(), &mut budget, true)?;

        // If preemption happened there is no space for swap-in
        if running_scheduled.preempted.len() + running_scheduled.swapped_out.len() == 0 {
            (remaining_swapped, swapped_in) =
                self.schedule_swapped(remaining_swapped, &mut budget, true)?;
        }

        // Schedule new prefills, chunked to the remaining budget
        let (remaining_waiting, prefills) =
            self.schedule_prefills(self.waiting.clone(), &mut budget, true)?;

        if budget.num_batched_tokens() > self.scheduler_config.max_num_batched_tokens() {
            error!("Scheduled tokens exceed the configured token budget");
            return Err(SchedulerError::ExceededTokenBudget);
        }
        if budget.num_current_sequences() > self.scheduler_config.max_num_sequences() {
            error!("Scheduled sequences exceed the configured sequence budget");
            return Err(SchedulerError::ExceededSequenceBudget);
        }

        let preempted = running_scheduled.preempted.len() + running_scheduled.swapped_out.len();

        self.waiting = remaining_waiting;
        running_scheduled
            .preempted
            .iter()
            .rev()
            .for_each(|s| self.waiting.push_front(s.clone()));

        self.running = remaining_running;
        self.running.extend(
            prefills
                .sequence_groups
                .iter()
                .map(|s| s.scheduled_group.clone()),
        );
        self.running.extend(
            running_scheduled
                .prefill_seq_groups
                .iter()
                .map(|s| s.scheduled_group.clone()),
        );
        self.running.extend(
            swapped_in
                .prefill_seq_groups
                .iter()
                .map(|s| s.scheduled_group.clone()),
        );
        self.running.extend(
            running_scheduled
                .decode_seq_groups
                .iter()
                .map(|s| s.scheduled_group.clone()),
        );

        self.swapped = remaining_swapped;
        self.swapped.extend(running_scheduled.swapped_out);

        let number_prefill_groups = prefills.sequence_groups.len()
            + running_scheduled.prefill_seq_groups.len()
            + swapped_in.prefill_seq_groups.len();

        let scheduled_sequence_groups: Vec<ScheduledSequenceGroup> = prefills
            .sequence_groups
            .into_iter()
            .chain(running_scheduled.prefill_seq_groups)
            .chain(swapped_in.prefill_seq_groups)
            .chain(running_scheduled.decode_seq_groups)
            .collect();

        Ok(SchedulerOutputs {
            scheduled_sequence_groups,
            num_batched_tokens: budget.num_batched_tokens(),
            number_prefill_groups,
            blocks_to_copy: running_scheduled.blocks_to_copy,
            ignored_seq_groups: prefills.ignored_sequence_groups,
            running_queue_size: self.running.len(),
            preempted,
        })
    }

    /// Importance-based cache eviction hook.
    ///
    /// Updates the per-block importance bookkeeping and, when the pool is
    /// below the watermark, nominates the lowest-importance middle blocks
    /// of long running sequences. The owning groups are marked gapped and
    /// recompute-preempted, which releases their blocks without killing the
    /// requests.
    #[instrument(skip_all)]
    fn run_cache_eviction(&mut self) -> Result<(), SchedulerError> {
        let Some(evictor) = self.cache_evictor.as_mut() else {
            return Ok(());
        };

        let block_size = self.cache_config.block_size();
        let mut eligible = Vec::new();
        for group in self.running.iter() {
            for sequence in group.get_seqs(Some(SequenceStatus::Running)) {
                let guard = sequence.read_lock()?;
                let num_blocks = guard.get_num_total_logical_token_blocks();
                let num_prompt_blocks = guard.get_prompt_len().div_ceil(block_size);
                evictor.record_access(guard.sequence_id(), num_blocks, None);
                eligible.push((guard.sequence_id(), num_prompt_blocks, num_blocks));
            }
        }

        let num_free = self.block_manager.get_num_free_blocks();
        let num_total = self.block_manager.get_num_total_blocks();
        let watermark_blocks = (evictor.watermark() * num_total as f32).ceil() as usize;
        if num_free >= watermark_blocks {
            return Ok(());
        }

        let victims = evictor.select_victims(&eligible, watermark_blocks - num_free);
        if victims.is_empty() {
            return Ok(());
        }

        let victim_sequences: HashSet<u64> = victims.iter().map(|(id, _)| *id).collect();
        info!(
            "Cache eviction reclaims blocks from {} sequence(s)",
            victim_sequences.len()
        );

        let mut gapped_groups = Vec::new();
        for (position, group) in self.running.iter().enumerate() {
            let mut owns_victim = false;
            for sequence in group.sequences.values() {
                let mut guard = sequence.write_lock()?;
                if victim_sequences.contains(&guard.sequence_id()) {
                    guard.kv_gapped = true;
                    owns_victim = true;
                }
            }
            if owns_victim {
                gapped_groups.push(position);
            }
        }

        // Recompute fallback: the executor contract has no gapped
        // attention, so gapped sequences are re-prefixed from scratch.
        for position in gapped_groups.into_iter().rev() {
            // DON'T PANIC: positions were collected from the same queue
            let mut group = self.running.remove(position).unwrap();
            self.preempt(&mut group)?;
            match self.scheduler_config.preempt_by_swapping() {
                true => self.swapped.push_back(group),
                false => self.waiting.push_front(group),
            }
            metrics::counter!("scheduler-cache-evictions").increment(1);
        }

        Ok(())
    }

    /// Schedule queued requests and prepare metadata for execution.
    ///
    /// # Returns
    ///
    /// - A vector of `Arc<SequenceGroupMetadata>`, one per scheduled group,
    ///   ready for model execution.
    /// - `SchedulerOutputs` with block-management information.
    #[instrument(skip_all)]
    pub fn schedule(
        &mut self,
    ) -> Result<(Vec<Arc<SequenceGroupMetadata>>, SchedulerOutputs), SchedulerError> {
        let span = self.span.clone();
        let _enter = span.enter();
        trace!("Scheduling..");

        self.run_cache_eviction()?;

        let scheduler_outputs = if self.scheduler_config.enable_chunked_prefill() {
            self.schedule_chunked_prefill()?
        } else {
            self.schedule_default()?
        };
        let now = Instant::now();

        let mut sequence_groups_metadata = Vec::new();
        for scheduled_sequence_group in scheduler_outputs.scheduled_sequence_groups.iter() {
            let sequence_group = &scheduled_sequence_group.scheduled_group;
            let token_chunk_size = scheduled_sequence_group.token_chunk_size;
            sequence_group.maybe_set_first_scheduled_time(now);

            // Per-sequence state snapshot, in ascending sequence id order so
            // the executor's flattened batch layout is deterministic
            let mut sequence_data = Vec::new();
            let mut block_tables = std::collections::HashMap::new();
            let mut sequence_ids = sequence_group.get_sequences_ids(Some(SequenceStatus::Running));
            sequence_ids.sort_unstable();

            for sequence_id in sequence_ids {
                // DON'T PANIC: ids were collected from the same group
                let sequence = sequence_group.find(sequence_id).unwrap();
                let guard = sequence.read_lock()?;
                sequence_data.push((sequence_id, guard.sequence_data.clone()));
                if let Some(table) = self.block_manager.get_block_table_ids(&sequence_id) {
                    block_tables.insert(sequence_id, table);
                    self.block_manager
                        .access_all_blocks_in_sequence(&sequence_id, now)?;
                } else {
                    error!("Missing block table for sequence with id = {sequence_id}");
                }
            }

            // A chunked prefill that does not reach the end of the prompt
            // produces no sampled token
            let mut do_sample = true;
            if sequence_group.is_prefill() {
                if let Some((_, data)) = sequence_data.first() {
                    if token_chunk_size + data.get_num_computed_tokens() < data.length() {
                        do_sample = false;
                    }
                }
            }

            let is_prompt = sequence_group.is_prefill();
            if is_prompt && self.cache_config.enable_prefix_caching() {
                // Fully populated prompt blocks become shareable
                for sequence in sequence_group.get_seqs(Some(SequenceStatus::Running)) {
                    self.block_manager
                        .mark_blocks_as_computed(sequence.read_lock()?)?;
                }
            }

            sequence_groups_metadata.push(Arc::new(SequenceGroupMetadata {
                request_id: sequence_group.request_id,
                is_prompt,
                sequence_data,
                block_tables,
                do_sample,
                token_chunk_size,
                sampling_params: sequence_group.sampling_params(),
                rng: sequence_group.rng.clone(),
            }));
        }

        metrics::gauge!("scheduler-running-queue-size").set(self.running.len() as f64);
        metrics::gauge!("scheduler-waiting-queue-size").set(self.waiting.len() as f64);
        metrics::gauge!("scheduler-swapped-queue-size").set(self.swapped.len() as f64);
        metrics::gauge!("scheduler-free-blocks").set(self.get_num_free_blocks() as f64);

        Ok((sequence_groups_metadata, scheduler_outputs))
    }
}

#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error("Block space manager error: `{0}`")]
    BlockSpaceManagerError(#[from] BlockSpaceManagerError),
    #[error("Sequence error: `{0}`")]
    SequenceError(#[from] SequenceError),
    #[error("Empty scheduling, no new tokens or sequences")]
    EmptyScheduling,
    #[error("KV cache exhausted: request `{0}` cannot be allocated a single slot even after preempting every peer")]
    CacheExhausted(u64),
    #[error("Scheduled tokens exceed the configured token budget")]
    ExceededTokenBudget,
    #[error("Scheduled sequences exceed the configured sequence budget")]
    ExceededSequenceBudget,
    #[error("Invalid number of new tokens (prompt tokens: {num_prompt_tokens}, new tokens: {num_new_tokens})")]
    InvalidNumberOfNewTokens {
        num_prompt_tokens: usize,
        num_new_tokens: usize,
    },
    #[error("Missing sequence group with request id = `{0}`")]
    MissingSequenceGroup(u64),
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::policy::FcfsPolicy;
    use crate::sampling_params::SamplingParams;
    use std::sync::RwLock;

    const BLOCK_SIZE: usize = 4;

    fn make_scheduler(
        num_blocks: usize,
        max_num_batched_tokens: usize,
        enable_chunked_prefill: bool,
    ) -> Scheduler<FcfsPolicy> {
        let cache_config = CacheConfig::new(BLOCK_SIZE, num_blocks, false, false).unwrap();
        // Chunked prefill decouples the per-step budget from the longest
        // admissible sequence
        let max_model_len = if enable_chunked_prefill {
            1024
        } else {
            max_num_batched_tokens
        };
        let scheduler_config = SchedulerConfig::new(
            max_num_batched_tokens,
            max_num_batched_tokens.min(8),
            max_model_len,
            enable_chunked_prefill,
            false,
        )
        .unwrap();
        Scheduler::new(cache_config, scheduler_config).unwrap()
    }

    fn make_group(request_id: u64, sequence_id: u64, prompt: Vec<u32>) -> SequenceGroup {
        let sequence = Sequence::new(sequence_id, prompt, BLOCK_SIZE).unwrap();
        SequenceGroup::new(
            request_id,
            vec![Arc::new(RwLock::new(sequence))],
            SamplingParams::greedy(),
        )
        .unwrap()
    }

    /// Advances every scheduled sequence by one sampled token, mimicking
    /// the engine's post-step bookkeeping.
    fn apply_decode_step(
        metadata: &[Arc<SequenceGroupMetadata>],
        outputs: &SchedulerOutputs,
        token: u32,
    ) {
        for (meta, scheduled) in metadata
            .iter()
            .zip(outputs.scheduled_sequence_groups.iter())
        {
            scheduled
                .scheduled_group
                .update_num_computed_tokens(scheduled.token_chunk_size)
                .unwrap();
            if meta.do_sample {
                for sequence in scheduled
                    .scheduled_group
                    .get_seqs(Some(SequenceStatus::Running))
                {
                    sequence.write().unwrap().add_token_id(token, 0.0).unwrap();
                }
            }
        }
    }

    #[test]
    fn test_prefill_then_decode_scheduling() {
        let mut scheduler = make_scheduler(8, 64, false);
        scheduler.add_sequence_group(make_group(0, 0, vec![1, 2, 3, 4, 5]));

        // First step is a whole-prompt prefill
        let (metadata, outputs) = scheduler.schedule().unwrap();
        assert_eq!(outputs.scheduled_sequence_groups.len(), 1);
        assert_eq!(outputs.number_prefill_groups, 1);
        assert_eq!(outputs.num_batched_tokens, 5);
        assert!(metadata[0].is_prompt);
        assert!(metadata[0].do_sample);

        apply_decode_step(&metadata, &outputs, 6);

        // Second step decodes exactly one token
        let (metadata, outputs) = scheduler.schedule().unwrap();
        assert_eq!(outputs.num_batched_tokens, 1);
        assert_eq!(outputs.number_prefill_groups, 0);
        assert!(!metadata[0].is_prompt);
    }

    #[test]
    fn test_chunked_prefill_splits_long_prompt() {
        let mut scheduler = make_scheduler(32, 8, true);
        scheduler.add_sequence_group(make_group(0, 0, (0..20).collect()));

        let (metadata, outputs) = scheduler.schedule().unwrap();
        assert_eq!(outputs.num_batched_tokens, 8);
        // Mid-prompt chunk: no sampling
        assert!(!metadata[0].do_sample);

        apply_decode_step(&metadata, &outputs, 99);

        let (metadata, outputs) = scheduler.schedule().unwrap();
        assert_eq!(outputs.num_batched_tokens, 8);
        assert!(!metadata[0].do_sample);

        apply_decode_step(&metadata, &outputs, 99);

        // Final chunk covers the remaining 4 tokens and samples
        let (metadata, outputs) = scheduler.schedule().unwrap();
        assert_eq!(outputs.num_batched_tokens, 4);
        assert!(metadata[0].do_sample);
    }

    #[test]
    fn test_preemption_under_cache_pressure() {
        // 4 blocks of 4 tokens; three prompts of 5 tokens need 2 blocks each
        let mut scheduler = make_scheduler(4, 64, false);
        for request_id in 0..3 {
            scheduler.add_sequence_group(make_group(
                request_id,
                request_id,
                vec![1, 2, 3, 4, 5],
            ));
        }

        // Only two groups fit
        let (metadata, outputs) = scheduler.schedule().unwrap();
        assert_eq!(outputs.scheduled_sequence_groups.len(), 2);
        apply_decode_step(&metadata, &outputs, 7);

        // Decoding fills the pool; at least one group gets preempted
        // eventually while the third keeps waiting
        let mut saw_preemption = false;
        for _ in 0..8 {
            let (metadata, outputs) = scheduler.schedule().unwrap();
            saw_preemption |= outputs.preempted > 0;
            apply_decode_step(&metadata, &outputs, 7);
        }
        assert!(saw_preemption);
        // Preempted groups keep their generated tokens
        assert!(scheduler.has_unfinished_sequences());
    }

    #[test]
    fn test_cache_exhausted_is_fatal() {
        // A single group that cannot fit one more slot even alone:
        // 2 blocks of 4 tokens, prompt of 8 tokens fills the pool
        let mut scheduler = make_scheduler(2, 64, false);
        scheduler.add_sequence_group(make_group(0, 0, (0..8).collect()));

        let (metadata, outputs) = scheduler.schedule().unwrap();
        assert_eq!(outputs.scheduled_sequence_groups.len(), 1);
        apply_decode_step(&metadata, &outputs, 9);

        // The next decode step needs a fresh block and has no peers to
        // preempt
        assert!(matches!(
            scheduler.schedule(),
            Err(SchedulerError::CacheExhausted(0))
        ));
    }

    #[test]
    fn test_abort_returns_blocks() {
        let mut scheduler = make_scheduler(8, 64, false);
        scheduler.add_sequence_group(make_group(42, 0, vec![1, 2, 3, 4, 5]));

        let (metadata, outputs) = scheduler.schedule().unwrap();
        apply_decode_step(&metadata, &outputs, 6);
        assert!(scheduler.get_num_free_blocks() < 8);

        assert!(scheduler.abort_sequence_group(42).unwrap());
        assert_eq!(scheduler.get_num_free_blocks(), 8);
        assert!(!scheduler.has_unfinished_sequences());
        // Unknown ids are not found
        assert!(!scheduler.abort_sequence_group(42).unwrap());
    }

    #[test]
    fn test_waiting_groups_respect_fifo() {
        let mut scheduler = make_scheduler(8, 8, false);
        scheduler.add_sequence_group(make_group(0, 0, vec![1, 2, 3, 4, 5]));
        std::thread::sleep(std::time::Duration::from_millis(2));
        scheduler.add_sequence_group(make_group(1, 1, vec![1, 2, 3, 4, 5]));

        // Both prompts need 2 blocks; both fit in the pool but the token
        // budget (8) only admits one 5-token prefill at a time
        let (_, outputs) = scheduler.schedule().unwrap();
        assert_eq!(outputs.scheduled_sequence_groups.len(), 1);
        assert_eq!(
            outputs.scheduled_sequence_groups[0]
                .scheduled_group
                .request_id,
            0
        );
    }
}

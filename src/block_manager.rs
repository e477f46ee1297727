use std::{collections::HashMap, sync::RwLockReadGuard, time::Instant};

use thiserror::Error;
use tracing::{error, info, info_span, instrument, trace, Span};

use crate::{
    block::{BlockError, BlockTable},
    block_allocator::{
        BlockAllocator, BlockAllocatorError, CachedBlockAllocator, UncachedBlockAllocator,
    },
    config::CacheConfig,
    sequence::{Sequence, SequenceError, SequenceGroup, SequenceStatus},
    types::{ReadLock, WriteLock},
};

/// Represents the status of a potential block allocation for a sequence group.
///
/// - `Ok`: The sequence group can be allocated immediately.
/// - `Later`: The sequence group cannot be allocated now, but may be allocated
///     later, once blocks currently in use have been returned.
/// - `Never`: The sequence group can never be allocated because it requires
///     more blocks than the pool's total capacity.
/// - `Nothing`: There are no sequences in the group awaiting allocation.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum AllocationStatus {
    Ok,
    Later,
    Never,
    Nothing,
}

/// `BlockSpaceManager` - Manages the mapping between logical and physical
/// token blocks.
///
/// It owns the physical block pool (through a `BlockAllocator`) and one
/// `BlockTable` per live sequence. Forked sequences share blocks through
/// reference counts; a shared block is duplicated lazily, right before the
/// first diverging write (copy-on-write).
#[derive(Debug)]
pub struct BlockSpaceManager {
    /// Block size
    pub(crate) block_size: usize,
    /// Block tables, mapping: `seq_id` -> `BlockTable`
    pub(crate) block_tables: HashMap<u64, BlockTable>,
    /// Physical block pool
    allocator: Box<dyn BlockAllocator>,
    /// Whether automatic prefix caching is enabled
    enable_caching: bool,
    /// Tracing span
    span: Span,
}

impl BlockSpaceManager {
    /// Constructor
    pub fn new(cache_config: &CacheConfig) -> Self {
        let allocator: Box<dyn BlockAllocator> = if cache_config.enable_prefix_caching() {
            info!("Automatic prefix caching is enabled");
            Box::new(CachedBlockAllocator::new(
                cache_config.block_size(),
                cache_config.num_blocks(),
            ))
        } else {
            Box::new(UncachedBlockAllocator::new(
                cache_config.block_size(),
                cache_config.num_blocks(),
            ))
        };

        Self {
            block_size: cache_config.block_size(),
            block_tables: HashMap::new(),
            allocator,
            enable_caching: cache_config.enable_prefix_caching(),
            span: info_span!("block-space-manager"),
        }
    }

    /// Get the number of free blocks in the pool
    pub fn get_num_free_blocks(&self) -> usize {
        self.allocator.get_num_free_blocks()
    }

    /// Get the total number of blocks in the pool
    pub fn get_num_total_blocks(&self) -> usize {
        self.allocator.get_num_total_blocks()
    }

    /// Checks if it's possible to allocate enough blocks for every
    /// sequence of the group carrying the given status.
    ///
    /// # Returns
    /// An `AllocationStatus` indicating the allocation possibility.
    #[instrument(skip_all)]
    pub fn can_allocate_with_status(
        &self,
        seq_group: &SequenceGroup,
        status: SequenceStatus,
    ) -> AllocationStatus {
        let sequences = seq_group.get_seqs(Some(status));
        if sequences.is_empty() {
            // No `Sequence` awaiting to be allocated in the group
            trace!("No `Sequence` awaiting to be allocated in `SequenceGroup`");
            return AllocationStatus::Nothing;
        }
        let num_required_blocks: usize = sequences
            .iter()
            .map(|s| {
                s.read()
                    .map(|s| s.get_num_total_logical_token_blocks())
                    .unwrap_or(0)
            })
            .sum();
        if num_required_blocks > self.allocator.get_num_total_blocks() {
            AllocationStatus::Never
        } else if self.allocator.can_allocate(num_required_blocks) {
            AllocationStatus::Ok
        } else {
            AllocationStatus::Later
        }
    }

    /// Checks allocation feasibility for a fresh (waiting) group.
    pub fn can_allocate(&self, seq_group: &SequenceGroup) -> AllocationStatus {
        self.can_allocate_with_status(seq_group, SequenceStatus::Waiting)
    }

    /// Allocates block tables for every sequence of the group carrying the
    /// given status.
    ///
    /// A fresh group carries exactly one waiting sequence (beam and
    /// parallel sampling fork after the first sampled token); a preempted
    /// group being re-admitted may carry several, each re-prefixed over its
    /// own context. With prefix caching enabled, fully populated blocks are
    /// looked up by content hash first; a hit shares the cached block and
    /// consumes no new memory.
    #[instrument(skip_all)]
    pub fn allocate_with_status(
        &mut self,
        seq_group: &SequenceGroup,
        status: SequenceStatus,
    ) -> Result<(), BlockSpaceManagerError> {
        for sequence in seq_group.get_seqs(Some(status)) {
            let sequence_guard = sequence.read_lock()?;
            let sequence_id = sequence_guard.sequence_id();
            let num_logical_blocks = sequence_guard.get_num_total_logical_token_blocks();

            let mut block_table: BlockTable = Vec::with_capacity(num_logical_blocks);
            for logical_idx in 0..num_logical_blocks {
                let block = if self.enable_caching && sequence_guard.is_block_full(logical_idx) {
                    let block_hash = sequence_guard.hash_of_block(logical_idx);
                    let num_hashed_tokens = sequence_guard.num_hashed_tokens_of_block(logical_idx);
                    self.allocator
                        .allocate(Some(block_hash), num_hashed_tokens)?
                } else {
                    self.allocator.allocate(None, 0)?
                };
                block_table.push(block);
            }

            self.block_tables.insert(sequence_id, block_table);
        }
        Ok(())
    }

    /// Allocates block tables for a fresh (waiting) group.
    pub fn allocate(&mut self, seq_group: &SequenceGroup) -> Result<(), BlockSpaceManagerError> {
        self.allocate_with_status(seq_group, SequenceStatus::Waiting)
    }

    /// Checks if new slots can be appended to the sequences in the given
    /// `SequenceGroup`.
    ///
    /// # Note
    /// This is a conservative heuristic (at least one free block for each
    /// running sequence) and does not guarantee that appending will succeed.
    pub fn can_append_slots(&self, seq_group: &SequenceGroup) -> bool {
        // HEURISTIC: if there is at least one free block
        // for each sequence, we can append
        let num_free_blocks = self.allocator.get_num_free_blocks();
        let num_seqs = seq_group.get_num_sequences(Some(SequenceStatus::Running));
        num_seqs <= num_free_blocks
    }

    /// Allocates physical slots for the uncomputed tokens of a sequence.
    ///
    /// Ensures the physical table covers every logical block of the
    /// sequence, allocating fresh blocks for logical blocks that spilled
    /// past the table. Shared blocks that are about to be written are
    /// duplicated first (copy-on-write) and the `(src, dst)` block number
    /// pairs are returned so the executor can copy the KV payload before
    /// the forward pass.
    ///
    /// # Returns
    /// * `Ok(Vec<(u32, u32)>)` - the copy-on-write pairs (usually empty).
    /// * `Err(BlockSpaceManagerError)` - if an error occurred.
    #[instrument(skip_all)]
    pub fn append_slots(
        &mut self,
        sequence: RwLockReadGuard<Sequence>,
    ) -> Result<Vec<(u32, u32)>, BlockSpaceManagerError> {
        let _enter = self.span.enter();
        let num_total_logical_token_blocks = sequence.get_num_total_logical_token_blocks();

        if num_total_logical_token_blocks == 0 {
            error!("Total number of logical token blocks is zero, sequences should not be empty");
            return Err(BlockSpaceManagerError::EmptySequence);
        }

        let sequence_id = sequence.sequence_id();
        // First logical block that will receive a write this step
        let first_written_block = sequence.sequence_data.get_num_computed_tokens() / self.block_size;

        let block_table = self
            .block_tables
            .get_mut(&sequence_id)
            .ok_or(BlockSpaceManagerError::MissingSequence(sequence_id))?;

        let mut blocks_to_copy = Vec::new();

        // Copy-on-write for already-allocated blocks that are shared and
        // about to be written
        for logical_idx in first_written_block..block_table.len() {
            let is_shared = {
                let guard = block_table[logical_idx].read_lock()?;
                guard.ref_count() > 1
            };
            if !is_shared {
                continue;
            }
            let new_block = self.allocator.allocate(None, 0)?;
            let old_block = std::mem::replace(&mut block_table[logical_idx], new_block);
            let (old_number, new_number) = {
                (
                    old_block.read_lock()?.block_number(),
                    block_table[logical_idx].read_lock()?.block_number(),
                )
            };
            self.allocator.free(old_block)?;
            blocks_to_copy.push((old_number, new_number));
        }

        // Allocate physical blocks for logical blocks that spilled past the
        // table. Decoding grows the table by at most one block per step;
        // speculative candidates may require several.
        while block_table.len() < num_total_logical_token_blocks {
            let new_block = self.allocator.allocate(None, 0)?;
            block_table.push(new_block);
        }

        Ok(blocks_to_copy)
    }

    /// Forks a `Sequence` by creating a new block table for the child
    /// sequence.
    ///
    /// The child's table is a shallow copy of the parent's: no physical
    /// block is allocated, every shared block's reference count is
    /// incremented. Divergence is handled later through copy-on-write in
    /// `append_slots`.
    #[instrument(skip_all)]
    pub fn fork(
        &mut self,
        parent_sequence_id: u64,
        child_sequence_id: u64,
    ) -> Result<(), BlockSpaceManagerError> {
        let _enter = self.span.enter();
        trace!("Forking block table of sequence with id = {parent_sequence_id}");
        let source_block_table = self
            .block_tables
            .get(&parent_sequence_id)
            .ok_or(BlockSpaceManagerError::MissingSequence(parent_sequence_id))?
            .clone();

        for block in source_block_table.iter() {
            self.allocator.fork(block)?;
        }
        self.block_tables
            .insert(child_sequence_id, source_block_table);
        Ok(())
    }

    /// Frees every block of a sequence and drops its table.
    ///
    /// Freeing is idempotent: a sequence without a registered table is
    /// ignored, so finished and already-freed sequences can be swept
    /// together.
    #[instrument(skip_all)]
    pub fn free_sequence(&mut self, sequence_id: u64) -> Result<(), BlockSpaceManagerError> {
        let _enter = self.span.enter();
        let block_table = match self.block_tables.remove(&sequence_id) {
            Some(block_table) => block_table,
            None => return Ok(()),
        };
        for block in block_table {
            self.allocator.free(block)?;
        }
        Ok(())
    }

    /// Frees the trailing blocks of a sequence so that only
    /// `num_blocks_to_keep` remain.
    ///
    /// Used when speculative candidates are rejected and the sequence rolls
    /// back below a block boundary.
    #[instrument(skip_all)]
    pub fn free_trailing_blocks(
        &mut self,
        sequence_id: u64,
        num_blocks_to_keep: usize,
    ) -> Result<(), BlockSpaceManagerError> {
        let block_table = self
            .block_tables
            .get_mut(&sequence_id)
            .ok_or(BlockSpaceManagerError::MissingSequence(sequence_id))?;
        let mut trailing = Vec::new();
        while block_table.len() > num_blocks_to_keep {
            // DON'T PANIC: loop condition guarantees non-emptiness
            trailing.push(block_table.pop().unwrap());
        }
        for block in trailing {
            self.allocator.free(block)?;
        }
        Ok(())
    }

    /// Returns the physical block numbers backing a sequence, in logical
    /// order.
    pub fn get_block_table_ids(&self, sequence_id: &u64) -> Option<Vec<u32>> {
        self.block_tables.get(sequence_id).map(|table| {
            table
                .iter()
                .map(|block| block.read().map(|guard| guard.block_number()).unwrap_or(0))
                .collect()
        })
    }

    /// Updates the last-accessed timestamp of every block of a sequence.
    #[instrument(skip_all)]
    pub fn access_all_blocks_in_sequence(
        &self,
        sequence_id: &u64,
        access_time: Instant,
    ) -> Result<(), BlockSpaceManagerError> {
        if let Some(block_table) = self.block_tables.get(sequence_id) {
            for block in block_table {
                block.write_lock()?.set_last_accessed(access_time);
            }
        }
        Ok(())
    }

    /// Registers the fully populated blocks of a sequence in the prefix
    /// cache.
    ///
    /// Eligibility follows the prefix-cache invariant: a block enters the
    /// content-hash table only once every slot is written and its hash is
    /// stable. Partially filled tails are skipped.
    #[instrument(skip_all)]
    pub fn mark_blocks_as_computed(
        &mut self,
        sequence: RwLockReadGuard<Sequence>,
    ) -> Result<(), BlockSpaceManagerError> {
        if !self.enable_caching {
            return Ok(());
        }
        let sequence_id = sequence.sequence_id();
        let block_table = match self.block_tables.get(&sequence_id) {
            Some(block_table) => block_table.clone(),
            None => return Ok(()),
        };

        for (logical_idx, block) in block_table.iter().enumerate() {
            if !sequence.is_block_full(logical_idx) {
                break;
            }
            let already_cached = { block.read_lock()?.block_hash().is_some() };
            if already_cached {
                continue;
            }
            let block_hash = sequence.hash_of_block(logical_idx);
            let num_hashed_tokens = sequence.num_hashed_tokens_of_block(logical_idx);
            self.allocator
                .cache_full_block(block_hash, num_hashed_tokens, block)?;
        }
        Ok(())
    }

    /// Checks whether a fully-populated block with this content hash is
    /// already cached.
    pub fn lookup_prefix(&self, block_hash: u64) -> bool {
        self.allocator.contains_block(block_hash)
    }
}

#[derive(Debug, Error)]
pub enum BlockSpaceManagerError {
    #[error("Block allocator error: `{0}`")]
    BlockAllocatorError(#[from] BlockAllocatorError),
    #[error("Block error: `{0}`")]
    BlockError(#[from] BlockError),
    #[error("Sequence error: `{0}`")]
    SequenceError(#[from] SequenceError),
    #[error("Empty sequence")]
    EmptySequence,
    #[error("Missing block table for sequence with id = `{0}`")]
    MissingSequence(u64),
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sampling_params::SamplingParams;
    use std::sync::Arc;

    const BLOCK_SIZE: usize = 4;
    const NUM_BLOCKS: usize = 8;

    fn cache_config(enable_prefix_caching: bool) -> CacheConfig {
        CacheConfig::new(BLOCK_SIZE, NUM_BLOCKS, enable_prefix_caching, false).unwrap()
    }

    fn group_with_prompt(request_id: u64, sequence_id: u64, prompt: Vec<u32>) -> SequenceGroup {
        let sequence = Sequence::new(sequence_id, prompt, BLOCK_SIZE).unwrap();
        SequenceGroup::new(
            request_id,
            vec![Arc::new(std::sync::RwLock::new(sequence))],
            SamplingParams::greedy(),
        )
        .unwrap()
    }

    #[test]
    fn test_allocate_covers_prompt_blocks() {
        let mut manager = BlockSpaceManager::new(&cache_config(false));
        let group = group_with_prompt(0, 0, vec![1, 2, 3, 4, 5]);

        assert_eq!(manager.can_allocate(&group), AllocationStatus::Ok);
        manager.allocate(&group).unwrap();

        // ceil(5 / 4) = 2 blocks
        assert_eq!(manager.get_block_table_ids(&0).unwrap().len(), 2);
        assert_eq!(manager.get_num_free_blocks(), NUM_BLOCKS - 2);
    }

    #[test]
    fn test_can_allocate_never_for_oversized_prompt() {
        let manager = BlockSpaceManager::new(&cache_config(false));
        let prompt = (0..((NUM_BLOCKS + 1) * BLOCK_SIZE) as u32).collect();
        let group = group_with_prompt(0, 0, prompt);
        assert_eq!(manager.can_allocate(&group), AllocationStatus::Never);
    }

    #[test]
    fn test_fork_then_write_is_copy_on_write() {
        let mut manager = BlockSpaceManager::new(&cache_config(false));
        let group = group_with_prompt(0, 0, vec![1, 2, 3]);
        manager.allocate(&group).unwrap();

        let parent = group.get_first_sequence(None).unwrap().clone();
        {
            let mut parent_guard = parent.write().unwrap();
            parent_guard.set_sequence_status(SequenceStatus::Running);
            // Prompt computed; about to write the next token slot
            parent_guard.sequence_data.update_num_computed_tokens(3).unwrap();
        }

        manager.fork(0, 1).unwrap();
        let free_after_fork = manager.get_num_free_blocks();
        // Forking allocates nothing
        assert_eq!(free_after_fork, NUM_BLOCKS - 1);

        {
            let mut parent_guard = parent.write().unwrap();
            parent_guard.add_token_id(4, 0.0).unwrap();
        }
        let copies = manager.append_slots(parent.read().unwrap()).unwrap();
        // The shared last block was duplicated before the write
        assert_eq!(copies.len(), 1);
        assert_eq!(manager.get_num_free_blocks(), NUM_BLOCKS - 2);

        let parent_blocks = manager.get_block_table_ids(&0).unwrap();
        let child_blocks = manager.get_block_table_ids(&1).unwrap();
        assert_ne!(parent_blocks[0], child_blocks[0]);
    }

    #[test]
    fn test_free_sequence_returns_all_blocks() {
        let mut manager = BlockSpaceManager::new(&cache_config(false));
        let group = group_with_prompt(0, 0, vec![1, 2, 3, 4, 5, 6, 7, 8, 9]);
        manager.allocate(&group).unwrap();
        assert_eq!(manager.get_num_free_blocks(), NUM_BLOCKS - 3);

        manager.free_sequence(0).unwrap();
        assert_eq!(manager.get_num_free_blocks(), NUM_BLOCKS);
        // Idempotent
        manager.free_sequence(0).unwrap();
        assert_eq!(manager.get_num_free_blocks(), NUM_BLOCKS);
    }

    #[test]
    fn test_prefix_caching_shares_full_prompt_blocks() {
        let mut manager = BlockSpaceManager::new(&cache_config(true));

        let first = group_with_prompt(0, 0, vec![10, 20, 30, 40]);
        manager.allocate(&first).unwrap();
        {
            let sequence = first.get_first_sequence(None).unwrap();
            manager
                .mark_blocks_as_computed(sequence.read().unwrap())
                .unwrap();
        }
        let free_after_first = manager.get_num_free_blocks();

        // Identical prompt: the single full block is shared
        let second = group_with_prompt(1, 1, vec![10, 20, 30, 40]);
        manager.allocate(&second).unwrap();
        assert_eq!(manager.get_num_free_blocks(), free_after_first);
        assert_eq!(
            manager.get_block_table_ids(&0).unwrap(),
            manager.get_block_table_ids(&1).unwrap()
        );
    }

    #[test]
    fn test_free_trailing_blocks() {
        let mut manager = BlockSpaceManager::new(&cache_config(false));
        let group = group_with_prompt(0, 0, vec![1; 10]);
        manager.allocate(&group).unwrap();
        assert_eq!(manager.get_block_table_ids(&0).unwrap().len(), 3);

        manager.free_trailing_blocks(0, 1).unwrap();
        assert_eq!(manager.get_block_table_ids(&0).unwrap().len(), 1);
        assert_eq!(manager.get_num_free_blocks(), NUM_BLOCKS - 1);
    }
}

use std::{
    sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard},
    time::Instant,
};

use thiserror::Error;
use tracing::{error, instrument};

use crate::types::{ReadLock, WriteLock};

/// A mapping between logical and physical KV (Key-Value) blocks for each request.
///
/// Each entry in the `BlockTable` represents the physical block backing one
/// logical block of a sequence.
pub type BlockTable = Vec<SyncPhysicalTokenBlock>;

/// Represents a contiguous chunk of tokens in the logical space.
///
/// `LogicalTokenBlock` is used to track the state of corresponding physical
/// blocks in the KV cache. It stores tokens sequentially from left to right.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LogicalTokenBlock {
    /// Index of this block within the owning sequence
    block_number: usize,
    /// Maximum number of tokens this block can hold
    block_size: usize,
    /// Sequence of token IDs, with a maximum length of `block_size`
    token_ids: Vec<u32>,
    /// Current number of tokens stored in this block
    num_tokens: usize,
}

impl LogicalTokenBlock {
    /// Constructor
    pub fn new(block_number: usize, block_size: usize) -> Self {
        Self {
            block_number,
            block_size,
            token_ids: Vec::with_capacity(block_size),
            num_tokens: 0,
        }
    }

    /// Getter for `block_number`
    pub fn block_number(&self) -> usize {
        self.block_number
    }

    /// Getter for `block_size`
    pub fn block_size(&self) -> usize {
        self.block_size
    }

    /// Checks if `token_ids` is empty
    pub fn is_empty(&self) -> bool {
        self.num_tokens == 0
    }

    /// Checks if `token_ids` is full
    pub fn is_full(&self) -> bool {
        self.num_tokens == self.block_size
    }

    /// Get the number of additional token ids that can be added to the
    /// current `LogicalTokenBlock`
    pub fn get_num_empty_slots(&self) -> usize {
        self.block_size - self.num_tokens
    }

    /// Appends a new set of token ids to the current `LogicalTokenBlock`.
    ///
    /// # Returns
    ///
    /// * `Ok(())` if the tokens were successfully appended.
    /// * `Err(BlockError::AllocationError)` if there isn't enough space in the block.
    #[instrument(skip_all)]
    pub fn append_tokens(&mut self, token_ids: &[u32]) -> Result<(), BlockError> {
        if token_ids.len() <= self.get_num_empty_slots() {
            self.token_ids.extend(token_ids);
            self.num_tokens += token_ids.len();
            return Ok(());
        }
        error!("Not enough space for allocation");
        Err(BlockError::AllocationError(
            "Not enough space for allocation".into(),
        ))
    }

    /// Removes the last `num_tokens` token ids from the block.
    ///
    /// Used when speculative candidates are rejected and the owning
    /// sequence rolls back.
    pub fn truncate_tokens(&mut self, num_tokens: usize) {
        let keep = self.num_tokens.saturating_sub(num_tokens);
        self.token_ids.truncate(keep);
        self.num_tokens = keep;
    }

    /// Getter for `token_ids`
    pub fn get_token_ids(&self) -> Vec<u32> {
        self.token_ids.clone()
    }

    /// Getter for last element in `token_ids`
    pub fn get_last_token_id(&self) -> Option<u32> {
        self.token_ids.last().cloned()
    }
}

/// Represents a contiguous memory region of the physical KV cache pool.
///
/// This structure is used to manage physical memory allocation and track the
/// state of each block in the KV cache. The engine never touches the actual
/// KV payload; the executor reads and writes it at the slots the engine
/// derives from the block number.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PhysicalTokenBlock {
    /// Unique identifier for this block
    block_number: u32,
    /// Maximum number of KV vectors this block can hold
    block_size: usize,
    /// Indicates whether the block's content has been computed, which makes
    /// it eligible for prefix sharing
    computed: bool,
    /// Timestamp of the most recent access to this block
    last_accessed: Option<Instant>,
    /// Number of tokens covered by this block's content hash
    num_hashed_tokens: usize,
    /// Content hash over the tokens of this block and its ancestors.
    /// `None` until the block is fully populated.
    block_hash: Option<u64>,
    /// Reference count for copy-on-write sharing between forked sequences
    ref_count: usize,
}

impl PhysicalTokenBlock {
    /// Constructor
    pub fn new(block_number: u32, block_size: usize) -> Self {
        Self {
            block_number,
            block_size,
            computed: false,
            last_accessed: None,
            num_hashed_tokens: 0,
            block_hash: None,
            ref_count: 0,
        }
    }

    /// Getter for `block_number`
    pub fn block_number(&self) -> u32 {
        self.block_number
    }

    /// Getter for `block_size`
    pub fn block_size(&self) -> usize {
        self.block_size
    }

    /// Getter for `computed`
    pub fn computed(&self) -> bool {
        self.computed
    }

    /// Set `computed`
    pub fn set_computed(&mut self, value: bool) {
        self.computed = value
    }

    /// Getter for `num_hashed_tokens`
    pub fn num_hashed_tokens(&self) -> usize {
        self.num_hashed_tokens
    }

    /// Getter for `last_accessed`
    pub fn last_accessed(&self) -> Option<Instant> {
        self.last_accessed
    }

    /// Sets `last_accessed`
    pub fn set_last_accessed(&mut self, instant: Instant) {
        self.last_accessed = Some(instant)
    }

    /// Getter for `block_hash`
    pub fn block_hash(&self) -> Option<u64> {
        self.block_hash
    }

    /// Sets the content hash together with the number of tokens it covers
    pub fn set_block_hash(&mut self, hash: u64, num_hashed_tokens: usize) {
        self.block_hash = Some(hash);
        self.num_hashed_tokens = num_hashed_tokens;
    }

    /// Clears the content hash and marks the block as not computed
    pub fn reset_hash(&mut self) {
        self.block_hash = None;
        self.num_hashed_tokens = 0;
        self.computed = false;
    }

    /// Getter for `ref_count`
    pub fn ref_count(&self) -> usize {
        self.ref_count
    }

    /// Increments the `ref_count` variable by +1
    pub fn increment_ref_count(&mut self) {
        self.ref_count += 1;
    }

    /// Sets the `ref_count` to `value`
    pub fn set_ref_count_by(&mut self, value: usize) {
        self.ref_count = value;
    }

    /// Decreases the reference count by 1.
    ///
    /// # Returns
    ///
    /// - `Ok(())` if the reference count was successfully decreased.
    /// - `Err(BlockError::ReferenceCountError)` if the reference count is already zero.
    pub fn decrease_ref_count(&mut self) -> Result<(), BlockError> {
        if self.ref_count > 0 {
            self.ref_count -= 1;
            Ok(())
        } else {
            error!(
                "Reference counter is already zero, trying to dereference once more which should not be possible.."
            );
            Err(BlockError::ReferenceCountError)
        }
    }
}

/// A thread-safe, shared-ownership wrapper for `PhysicalTokenBlock`.
///
/// This type provides synchronized read and write access to a
/// `PhysicalTokenBlock` across multiple threads. It combines `Arc` for shared
/// ownership and `RwLock` for interior mutability with multiple reader /
/// single writer access.
pub type SyncPhysicalTokenBlock = Arc<RwLock<PhysicalTokenBlock>>;

impl ReadLock for SyncPhysicalTokenBlock {
    type Error = BlockError;
    type Inner = PhysicalTokenBlock;

    fn read_lock(&self) -> Result<RwLockReadGuard<Self::Inner>, Self::Error> {
        self.read()
            .map_err(|e| Self::Error::PoisonError(e.to_string()))
    }
}

impl WriteLock for SyncPhysicalTokenBlock {
    type Error = BlockError;
    type Inner = PhysicalTokenBlock;

    fn write_lock(&self) -> Result<RwLockWriteGuard<Self::Inner>, Self::Error> {
        self.write()
            .map_err(|e| Self::Error::PoisonError(e.to_string()))
    }
}

#[derive(Debug, Error)]
pub enum BlockError {
    #[error("Poison error: `{0}`")]
    PoisonError(String),
    #[error("Allocation error: `{0}`")]
    AllocationError(String),
    #[error("Reference counter error, it cannot be negative")]
    ReferenceCountError,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_logical_block_append_and_truncate() {
        let mut block = LogicalTokenBlock::new(0, 4);
        assert!(block.is_empty());
        block.append_tokens(&[1, 2, 3]).unwrap();
        assert_eq!(block.get_num_empty_slots(), 1);
        assert!(block.append_tokens(&[4, 5]).is_err());
        block.append_tokens(&[4]).unwrap();
        assert!(block.is_full());

        block.truncate_tokens(2);
        assert_eq!(block.get_token_ids(), vec![1, 2]);
        assert_eq!(block.get_num_empty_slots(), 2);
    }

    #[test]
    fn test_physical_block_ref_counting() {
        let mut block = PhysicalTokenBlock::new(7, 16);
        assert_eq!(block.ref_count(), 0);
        block.increment_ref_count();
        block.increment_ref_count();
        assert_eq!(block.ref_count(), 2);
        block.decrease_ref_count().unwrap();
        block.decrease_ref_count().unwrap();
        assert!(block.decrease_ref_count().is_err());
    }
}

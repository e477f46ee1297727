use std::{
    collections::HashMap,
    sync::{Arc, RwLock},
};

use thiserror::Error;
use tracing::{error, info_span, instrument, trace, Span};

use crate::{
    block::{BlockError, BlockTable, PhysicalTokenBlock, SyncPhysicalTokenBlock},
    evictor::{Evictor, EvictorError, LRUEvictor},
    types::{ReadLock, WriteLock},
};

/// Interface of a physical block pool.
///
/// An allocator owns `num_blocks` uniformly-sized blocks. Allocation pops a
/// free block and sets its reference count to one; `fork` shares a block
/// between sequences by bumping the count; `free` decrements and returns the
/// block to the pool once the count reaches zero. Blocks never fragment
/// because they are all the same size.
pub trait BlockAllocator: std::fmt::Debug + Send + Sync {
    /// Allocates a block. When `block_hash` is provided and the allocator
    /// caches contents, a previously computed block with the same hash may
    /// be returned shared instead of consuming a fresh block.
    fn allocate(
        &mut self,
        block_hash: Option<u64>,
        num_hashed_tokens: usize,
    ) -> Result<SyncPhysicalTokenBlock, BlockAllocatorError>;

    /// Shares an allocated block by incrementing its reference count.
    fn fork(&mut self, block: &SyncPhysicalTokenBlock) -> Result<(), BlockAllocatorError>;

    /// Frees a previously allocated block.
    fn free(&mut self, block: SyncPhysicalTokenBlock) -> Result<(), BlockAllocatorError>;

    /// Number of blocks that can still be handed out.
    fn get_num_free_blocks(&self) -> usize;

    /// Total number of blocks in the pool.
    fn get_num_total_blocks(&self) -> usize;

    /// Checks whether `num_blocks` blocks can be allocated right now.
    fn can_allocate(&self, num_blocks: usize) -> bool {
        num_blocks <= self.get_num_free_blocks()
    }

    /// Checks whether a computed block with this content hash is available
    /// for sharing.
    fn contains_block(&self, block_hash: u64) -> bool;

    /// Registers a fully populated block under its content hash so later
    /// requests with the same prefix can share it. A no-op for allocators
    /// without caching support.
    fn cache_full_block(
        &mut self,
        block_hash: u64,
        num_hashed_tokens: usize,
        block: &SyncPhysicalTokenBlock,
    ) -> Result<(), BlockAllocatorError>;
}

/// `UncachedBlockAllocator` - Manages free physical token blocks, without
/// any prefix caching support.
///
/// The allocator maintains a list of free blocks and allocates a block when
/// requested. When a block is freed, its reference count is decremented. If
/// the reference count becomes zero, the block is added back to the free list.
#[derive(Debug)]
pub struct UncachedBlockAllocator {
    /// Number of blocks
    num_blocks: usize,
    /// Free blocks available
    pub(crate) free_blocks: BlockTable,
    /// Tracing span
    pub span: Span,
}

impl UncachedBlockAllocator {
    /// Constructor
    pub fn new(block_size: usize, num_blocks: usize) -> Self {
        let free_blocks = (0..(num_blocks as u32))
            .rev()
            .map(|i| Arc::new(RwLock::new(PhysicalTokenBlock::new(i, block_size))))
            .collect();

        Self {
            num_blocks,
            free_blocks,
            span: info_span!("uncached-block-allocator"),
        }
    }
}

impl BlockAllocator for UncachedBlockAllocator {
    /// Allocates a new physical block from the pool of free blocks.
    ///
    /// # Returns
    /// - `Ok(SyncPhysicalTokenBlock)`: A newly allocated block if one is available.
    /// - `Err(BlockAllocatorError::OutOfMemory)`: If there are no free blocks left.
    #[instrument(skip_all)]
    fn allocate(
        &mut self,
        _block_hash: Option<u64>,
        _num_hashed_tokens: usize,
    ) -> Result<SyncPhysicalTokenBlock, BlockAllocatorError> {
        if let Some(block) = self.free_blocks.pop() {
            block.write_lock()?.increment_ref_count();
            Ok(block)
        } else {
            error!("Out of memory, no available free blocks!");
            Err(BlockAllocatorError::OutOfMemory)
        }
    }

    #[instrument(skip_all)]
    fn fork(&mut self, block: &SyncPhysicalTokenBlock) -> Result<(), BlockAllocatorError> {
        let mut guard = block.write_lock()?;
        if guard.ref_count() == 0 {
            error!(
                "Cannot fork free block, with block_number = {}",
                guard.block_number()
            );
            return Err(BlockAllocatorError::CannotForkFreeBlock(
                guard.block_number(),
            ));
        }
        guard.increment_ref_count();
        Ok(())
    }

    /// Frees a given (already allocated) block.
    ///
    /// # Behavior
    /// 1. Checks if the block is already freed (ref count is 0)
    /// 2. Decreases the block's reference count
    /// 3. If the reference count becomes 0, adds the block back to the free list
    #[instrument(skip_all)]
    fn free(&mut self, block: SyncPhysicalTokenBlock) -> Result<(), BlockAllocatorError> {
        {
            let block_guard = block.read_lock()?;
            if block_guard.ref_count() == 0 {
                error!("Double free! {} is already freed.", block_guard.block_number());
                return Err(BlockAllocatorError::CannotDoubleFree(
                    block_guard.block_number(),
                ));
            }
        }

        let block_clone = block.clone();
        let mut block_write_guard = block_clone.write_lock()?;
        block_write_guard.decrease_ref_count()?;

        if block_write_guard.ref_count() == 0 {
            self.free_blocks.push(block);
        }

        Ok(())
    }

    fn get_num_free_blocks(&self) -> usize {
        self.free_blocks.len()
    }

    fn get_num_total_blocks(&self) -> usize {
        self.num_blocks
    }

    fn contains_block(&self, _block_hash: u64) -> bool {
        false
    }

    fn cache_full_block(
        &mut self,
        _block_hash: u64,
        _num_hashed_tokens: usize,
        _block: &SyncPhysicalTokenBlock,
    ) -> Result<(), BlockAllocatorError> {
        Ok(())
    }
}

/// `CachedBlockAllocator` - Block pool with automatic prefix caching.
///
/// Fully populated blocks are registered under a content hash (the rolling
/// hash of all token ids in the block and its ancestors). A later request
/// whose prompt shares the prefix is handed the same physical block with an
/// incremented reference count, consuming no new memory.
///
/// Blocks whose reference count drops to zero but which still carry a valid
/// hash are parked in an LRU evictor rather than destroyed; they are
/// resurrected on a hash hit or reclaimed when the pool has no other free
/// block left.
#[derive(Debug)]
pub struct CachedBlockAllocator {
    /// Block size, in tokens
    block_size: usize,
    /// Number of blocks
    num_blocks: usize,
    /// Monotonic counter of blocks ever created, bounded by `num_blocks`
    current_num_blocks: usize,
    /// Mapping from content hash to the (possibly shared) block holding it
    cached_blocks: HashMap<u64, SyncPhysicalTokenBlock>,
    /// Recycled blocks without reusable content
    free_blocks: BlockTable,
    /// Refcount-zero blocks that may still be re-shared
    evictor: LRUEvictor,
    /// Tracing span
    pub span: Span,
}

impl CachedBlockAllocator {
    /// Constructor
    pub fn new(block_size: usize, num_blocks: usize) -> Self {
        Self {
            block_size,
            num_blocks,
            current_num_blocks: 0,
            cached_blocks: HashMap::new(),
            free_blocks: Vec::new(),
            evictor: LRUEvictor::new(),
            span: info_span!("cached-block-allocator"),
        }
    }

    /// Hands out a block backed by recycled, fresh or evicted storage.
    fn allocate_block(&mut self) -> Result<SyncPhysicalTokenBlock, BlockAllocatorError> {
        if let Some(block) = self.free_blocks.pop() {
            return Ok(block);
        }
        if self.current_num_blocks < self.num_blocks {
            let block = PhysicalTokenBlock::new(self.current_num_blocks as u32, self.block_size);
            self.current_num_blocks += 1;
            return Ok(Arc::new(RwLock::new(block)));
        }

        // Reclaim the least recently used cached block
        let evicted = self.evictor.evict()?;
        if let Some(old_hash) = self.cached_blocks.iter().find_map(|(hash, block)| {
            // DON'T PANIC: read on a block owned by the allocator
            if block.read().unwrap().block_number() == evicted.block_number() {
                Some(*hash)
            } else {
                None
            }
        }) {
            self.cached_blocks.remove(&old_hash);
        }
        Ok(Arc::new(RwLock::new(evicted)))
    }
}

impl BlockAllocator for CachedBlockAllocator {
    /// Allocates a block, preferring a prefix-cache hit.
    ///
    /// # Behavior
    /// - On a hash hit, the cached block is returned with its reference
    ///   count incremented; no new block is consumed. Blocks parked in the
    ///   evictor are resurrected.
    /// - On a miss, a fresh block is handed out and registered under the
    ///   hash, if one was provided.
    #[instrument(skip_all)]
    fn allocate(
        &mut self,
        block_hash: Option<u64>,
        num_hashed_tokens: usize,
    ) -> Result<SyncPhysicalTokenBlock, BlockAllocatorError> {
        let span = self.span.clone();
        let _enter = span.enter();
        if let Some(hash) = block_hash {
            if let Some(block) = self.cached_blocks.get(&hash) {
                trace!("Prefix cache hit for block hash = {hash}");
                metrics::counter!("prefix-cache-hits").increment(1);
                let block = block.clone();
                {
                    let mut guard = block.write_lock()?;
                    if guard.ref_count() == 0 {
                        // The block was parked; bring it back from the evictor
                        self.evictor.remove(guard.block_number());
                    }
                    guard.increment_ref_count();
                }
                return Ok(block);
            }
        }

        metrics::counter!("prefix-cache-misses").increment(1);
        let block = self.allocate_block()?;
        {
            let mut guard = block.write_lock()?;
            guard.reset_hash();
            guard.increment_ref_count();
            if let Some(hash) = block_hash {
                guard.set_block_hash(hash, num_hashed_tokens);
            }
        }
        if let Some(hash) = block_hash {
            self.cached_blocks.insert(hash, block.clone());
        }
        Ok(block)
    }

    #[instrument(skip_all)]
    fn fork(&mut self, block: &SyncPhysicalTokenBlock) -> Result<(), BlockAllocatorError> {
        let mut guard = block.write_lock()?;
        if guard.ref_count() == 0 {
            error!(
                "Cannot fork free block, with block_number = {}",
                guard.block_number()
            );
            return Err(BlockAllocatorError::CannotForkFreeBlock(
                guard.block_number(),
            ));
        }
        guard.increment_ref_count();
        Ok(())
    }

    /// Frees a block. Hashed blocks are parked in the evictor so their
    /// contents remain available for prefix sharing; unhashed blocks simply
    /// return capacity to the pool.
    #[instrument(skip_all)]
    fn free(&mut self, block: SyncPhysicalTokenBlock) -> Result<(), BlockAllocatorError> {
        let mut guard = block.write_lock()?;
        if guard.ref_count() == 0 {
            error!("Double free! {} is already freed.", guard.block_number());
            return Err(BlockAllocatorError::CannotDoubleFree(guard.block_number()));
        }
        guard.decrease_ref_count()?;

        if guard.ref_count() == 0 {
            match guard.block_hash() {
                Some(_) => self.evictor.add(guard.clone()),
                None => {
                    drop(guard);
                    self.free_blocks.push(block);
                }
            }
        }

        Ok(())
    }

    fn get_num_free_blocks(&self) -> usize {
        self.num_blocks - self.current_num_blocks + self.free_blocks.len() + self.evictor.num_blocks()
    }

    fn get_num_total_blocks(&self) -> usize {
        self.num_blocks
    }

    fn contains_block(&self, block_hash: u64) -> bool {
        self.cached_blocks.contains_key(&block_hash)
    }

    /// Registers a fully populated block under its content hash.
    ///
    /// Only full blocks are eligible; partially filled blocks keep mutating
    /// and their hash would not be stable.
    #[instrument(skip_all)]
    fn cache_full_block(
        &mut self,
        block_hash: u64,
        num_hashed_tokens: usize,
        block: &SyncPhysicalTokenBlock,
    ) -> Result<(), BlockAllocatorError> {
        {
            let mut guard = block.write_lock()?;
            guard.set_block_hash(block_hash, num_hashed_tokens);
            guard.set_computed(true);
        }
        self.cached_blocks
            .entry(block_hash)
            .or_insert_with(|| block.clone());
        Ok(())
    }
}

#[derive(Debug, Error)]
pub enum BlockAllocatorError {
    #[error("Cannot fork a free block, with block_number = `{0}`")]
    CannotForkFreeBlock(u32),
    #[error("Cannot free unused block, with block_number = `{0}`")]
    CannotDoubleFree(u32),
    #[error("Failed to acquire lock: `{0}`")]
    PoisonError(String),
    #[error("Out of memory error")]
    OutOfMemory,
    #[error("Block error: `{0}`")]
    BlockError(#[from] BlockError),
    #[error("Evictor error: `{0}`")]
    EvictorError(#[from] EvictorError),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_uncached_allocate_until_oom() {
        const BLOCK_SIZE: usize = 4;
        const NUM_BLOCKS: usize = 4;

        let mut allocator = UncachedBlockAllocator::new(BLOCK_SIZE, NUM_BLOCKS);

        let mut num_free_blocks = NUM_BLOCKS;
        assert_eq!(allocator.get_num_free_blocks(), num_free_blocks);
        for _ in 0..NUM_BLOCKS {
            let block = allocator
                .allocate(None, 0)
                .expect("Failed to allocate block");
            num_free_blocks -= 1;

            let block_id = block.read_lock().unwrap().block_number();
            // Allocated block is not part of free blocks, anymore
            assert!(allocator
                .free_blocks
                .iter()
                .all(|block| block.read().unwrap().block_number() != block_id));
            assert_eq!(allocator.get_num_free_blocks(), num_free_blocks);
        }

        assert!(matches!(
            allocator.allocate(None, 0),
            Err(BlockAllocatorError::OutOfMemory)
        ));
    }

    #[test]
    fn test_uncached_free_and_double_free() {
        const BLOCK_SIZE: usize = 4;
        const NUM_BLOCKS: usize = 4;

        let mut allocator = UncachedBlockAllocator::new(BLOCK_SIZE, NUM_BLOCKS);

        let mut blocks = Vec::with_capacity(NUM_BLOCKS);
        for _ in 0..NUM_BLOCKS {
            blocks.push(allocator.allocate(None, 0).unwrap());
        }
        assert_eq!(allocator.get_num_free_blocks(), 0);

        let mut num_free_blocks = 0;
        for block in blocks {
            allocator.free(block.clone()).expect("Failed to free block");
            num_free_blocks += 1;
            assert_eq!(allocator.get_num_free_blocks(), num_free_blocks);

            // Trying to free the same block again should fail
            assert!(matches!(
                allocator.free(block),
                Err(BlockAllocatorError::CannotDoubleFree(_))
            ));
        }
    }

    #[test]
    fn test_uncached_fork_shares_storage() {
        let mut allocator = UncachedBlockAllocator::new(4, 2);
        let block = allocator.allocate(None, 0).unwrap();
        allocator.fork(&block).unwrap();
        assert_eq!(block.read_lock().unwrap().ref_count(), 2);

        // First free keeps the block allocated, second returns it
        allocator.free(block.clone()).unwrap();
        assert_eq!(allocator.get_num_free_blocks(), 1);
        allocator.free(block).unwrap();
        assert_eq!(allocator.get_num_free_blocks(), 2);
    }

    #[test]
    fn test_cached_allocator_prefix_hit_consumes_no_block() {
        const HASH: u64 = 0xfeed;
        let mut allocator = CachedBlockAllocator::new(4, 4);

        let first = allocator.allocate(Some(HASH), 4).unwrap();
        assert_eq!(allocator.get_num_free_blocks(), 3);

        let second = allocator.allocate(Some(HASH), 4).unwrap();
        // Same physical block, shared
        assert_eq!(
            first.read_lock().unwrap().block_number(),
            second.read_lock().unwrap().block_number()
        );
        assert_eq!(first.read_lock().unwrap().ref_count(), 2);
        assert_eq!(allocator.get_num_free_blocks(), 3);
    }

    #[test]
    fn test_cached_allocator_resurrects_parked_block() {
        const HASH: u64 = 0xabba;
        let mut allocator = CachedBlockAllocator::new(4, 2);

        let block = allocator.allocate(Some(HASH), 4).unwrap();
        let block_number = block.read_lock().unwrap().block_number();
        allocator.free(block).unwrap();
        // Parked, yet still counted as reclaimable capacity
        assert_eq!(allocator.get_num_free_blocks(), 2);

        let revived = allocator.allocate(Some(HASH), 4).unwrap();
        assert_eq!(revived.read_lock().unwrap().block_number(), block_number);
        assert_eq!(revived.read_lock().unwrap().ref_count(), 1);
    }

    #[test]
    fn test_cached_allocator_evicts_when_exhausted() {
        let mut allocator = CachedBlockAllocator::new(4, 1);

        let block = allocator.allocate(Some(1), 4).unwrap();
        allocator.free(block).unwrap();

        // Different hash: the parked block must be reclaimed
        let other = allocator.allocate(Some(2), 4).unwrap();
        assert_eq!(other.read_lock().unwrap().ref_count(), 1);
        assert!(!allocator.contains_block(1));
        assert!(allocator.contains_block(2));
    }
}

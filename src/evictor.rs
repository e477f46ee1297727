use indexmap::IndexMap;
use thiserror::Error;

use crate::block::PhysicalTokenBlock;

/// Eviction policy over refcount-zero blocks kept alive by the prefix cache.
///
/// Freed blocks whose content may still be re-shared are parked in an
/// evictor instead of returning straight to the free list; the allocator
/// reclaims them through `evict` once no plain free block remains.
pub trait Evictor {
    /// Checks if the evictor holds a block with the given block number.
    fn contains(&self, block_number: u32) -> bool;

    /// Evicts a block according to the eviction policy.
    ///
    /// # Returns
    ///
    /// `Ok(PhysicalTokenBlock)` if a block was evicted, or
    /// `Err(EvictorError::EmptyFreeTable)` if there is nothing to evict.
    fn evict(&mut self) -> Result<PhysicalTokenBlock, EvictorError>;

    /// Parks a freed block in the evictor.
    fn add(&mut self, block: PhysicalTokenBlock);

    /// Removes a block with the given block number, if present.
    ///
    /// Used when a cached block gets re-shared by a new request before it
    /// was evicted.
    fn remove(&mut self, block_number: u32) -> Option<PhysicalTokenBlock>;

    /// Number of blocks currently parked in the evictor.
    fn num_blocks(&self) -> usize;
}

/// Least-recently-used eviction.
///
/// The block with the oldest `last_accessed` timestamp is evicted first.
/// Among blocks of equal age, the one covering the most hashed tokens is
/// preferred, since longer prefixes are cheaper to recompute per block.
#[derive(Debug, Default)]
pub struct LRUEvictor {
    /// Parked blocks, keyed by block number. Insertion order approximates
    /// access order, which keeps the scan below short.
    pub free_table: IndexMap<u32, PhysicalTokenBlock>,
}

impl LRUEvictor {
    /// Constructor
    pub fn new() -> Self {
        Self {
            free_table: IndexMap::new(),
        }
    }
}

impl Evictor for LRUEvictor {
    fn contains(&self, block_number: u32) -> bool {
        self.free_table.contains_key(&block_number)
    }

    fn evict(&mut self) -> Result<PhysicalTokenBlock, EvictorError> {
        if self.free_table.is_empty() {
            return Err(EvictorError::EmptyFreeTable);
        }

        let mut evicted_block_key = None;
        let mut evicted_block: Option<&PhysicalTokenBlock> = None;

        // Blocks with the lowest `last_accessed` sit consecutively at the
        // start of `free_table`; among them pick the one with the most
        // hashed tokens.
        for (key, block) in &self.free_table {
            match evicted_block {
                Some(current) => {
                    if current.last_accessed() < block.last_accessed() {
                        break;
                    }
                    if current.num_hashed_tokens() < block.num_hashed_tokens() {
                        evicted_block = Some(block);
                        evicted_block_key = Some(*key);
                    }
                }
                None => {
                    evicted_block = Some(block);
                    evicted_block_key = Some(*key);
                }
            }
        }

        if let Some(key) = evicted_block_key {
            // DON'T PANIC: the key was read out of `free_table` above
            let mut evicted_block = self.free_table.shift_remove(&key).unwrap();
            evicted_block.reset_hash();
            return Ok(evicted_block);
        }

        Err(EvictorError::EmptyFreeTable)
    }

    fn add(&mut self, block: PhysicalTokenBlock) {
        self.free_table.insert(block.block_number(), block);
    }

    fn remove(&mut self, block_number: u32) -> Option<PhysicalTokenBlock> {
        self.free_table.shift_remove(&block_number)
    }

    fn num_blocks(&self) -> usize {
        self.free_table.len()
    }
}

#[derive(Debug, Error)]
pub enum EvictorError {
    #[error("Free table is empty")]
    EmptyFreeTable,
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Instant;

    fn block_with_access(number: u32, hashed: usize, accessed: Instant) -> PhysicalTokenBlock {
        let mut block = PhysicalTokenBlock::new(number, 16);
        block.set_block_hash(number as u64, hashed);
        block.set_last_accessed(accessed);
        block
    }

    #[test]
    fn test_lru_evicts_oldest_first() {
        let mut evictor = LRUEvictor::new();
        let old = Instant::now();
        std::thread::sleep(std::time::Duration::from_millis(5));
        let recent = Instant::now();

        evictor.add(block_with_access(0, 16, recent));
        evictor.add(block_with_access(1, 16, old));
        evictor.add(block_with_access(2, 16, recent));

        let evicted = evictor.evict().unwrap();
        assert_eq!(evicted.block_number(), 1);
        // Eviction invalidates the cached content
        assert!(evicted.block_hash().is_none());
        assert_eq!(evictor.num_blocks(), 2);
    }

    #[test]
    fn test_remove_reclaims_cached_block() {
        let mut evictor = LRUEvictor::new();
        evictor.add(block_with_access(3, 8, Instant::now()));
        assert!(evictor.contains(3));
        let block = evictor.remove(3).unwrap();
        assert_eq!(block.block_number(), 3);
        assert!(!evictor.contains(3));
        assert!(evictor.evict().is_err());
    }
}

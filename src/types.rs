use std::sync::{RwLockReadGuard, RwLockWriteGuard};

use serde::{Deserialize, Serialize};

pub trait ReadLock {
    type Error;
    type Inner;
    fn read_lock(&self) -> Result<RwLockReadGuard<Self::Inner>, Self::Error>;
}

pub trait WriteLock {
    type Error;
    type Inner;
    fn write_lock(&self) -> Result<RwLockWriteGuard<Self::Inner>, Self::Error>;
}

/// `GenerationOutput` - Tokens produced for one sequence during a single
/// engine iteration.
///
/// A decode step carries exactly one token id; a speculative verification
/// step may carry several (the accepted candidates plus the bonus token).
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct GenerationOutput {
    /// Token ids produced during this iteration
    pub token_ids: Vec<u32>,
    /// The id of the sequence this output was forked from, if the sequence
    /// was created during this iteration (beam expansion). `None` for
    /// sequences that already existed.
    pub parent_sequence_id: Option<u64>,
    /// The cumulative log-probability of the sequence after this iteration
    pub cumulative_logprob: f32,
    /// Length-penalised score of the sequence. Equals `cumulative_logprob`
    /// for non-beam decoding.
    pub score: f32,
    /// Whether the sequence reached a terminal state during this iteration
    pub is_finished: bool,
}

/// Mapping from sequence id to the output it produced this iteration.
///
/// A single request can carry multiple sequences (beam search, parallel
/// sampling), so stream consumers receive one entry per live sequence.
pub type GenerationOutputs = std::collections::HashMap<u64, GenerationOutput>;

/// Terminal status of a whole request.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Deserialize, Serialize)]
pub enum GenerationStatus {
    /// Tokens are still being produced
    Running,
    /// Every sequence of the request reached a terminal state
    Finished,
    /// The request was cancelled by the consumer before finishing
    Dropped,
}

/// `GenerationResult` - Final output of a request, as returned by
/// `generate`.
#[derive(Clone, Debug)]
pub struct GenerationResult {
    /// The request id that created the group
    pub request_id: u64,
    /// One generated token id sequence per returned sequence, best first
    pub token_ids: Vec<Vec<u32>>,
    /// Length-penalised score per returned sequence, aligned with `token_ids`
    pub scores: Vec<f32>,
    /// Terminal status of the request
    pub status: GenerationStatus,
}

use std::collections::HashMap;

use tracing::{info_span, instrument, trace, Span};

/// Importance decay applied at every recorded step, so old attention mass
/// fades out
const IMPORTANCE_DECAY: f32 = 0.9;

/// `CacheEvictor` - Importance-based reclamation of KV blocks from inside
/// long sequences.
///
/// Tracks a per-block importance score for every running sequence: an
/// exponential moving average of the attention mass the executor reports,
/// falling back to a recency proxy (recent blocks attract more attention)
/// when the executor reports nothing. When the pool runs below its
/// watermark, the evictor nominates the lowest-importance blocks from the
/// middle of long sequences (never the newest block, never a block backing
/// the prompt) and the owning sequences are marked gapped.
///
/// A gapped sequence needs its missing KV entries recomputed before its
/// next forward; since the executor contract does not include gapped
/// attention, the scheduler recompute-preempts gapped sequences, which
/// releases their blocks without killing the request.
#[derive(Debug)]
pub struct CacheEvictor {
    /// Fraction of the pool below which eviction kicks in
    watermark: f32,
    /// Importance scores per sequence, one entry per logical block
    scores: HashMap<u64, Vec<f32>>,
    /// Tracing span
    span: Span,
}

impl CacheEvictor {
    /// Constructor
    pub fn new(watermark: f32) -> Self {
        Self {
            watermark,
            scores: HashMap::new(),
            span: info_span!("cache-evictor"),
        }
    }

    /// Getter for `watermark`
    pub fn watermark(&self) -> f32 {
        self.watermark
    }

    /// Records one scheduling step for a sequence.
    ///
    /// # Arguments
    /// * `sequence_id` - the owner of the blocks.
    /// * `num_blocks` - current number of logical blocks of the sequence.
    /// * `attention_mass` - per-block attention mass reported by the
    ///   executor for the last forward, if available. Falls back to a
    ///   recency proxy otherwise.
    #[instrument(skip_all)]
    pub fn record_access(
        &mut self,
        sequence_id: u64,
        num_blocks: usize,
        attention_mass: Option<&[f32]>,
    ) {
        let scores = self.scores.entry(sequence_id).or_default();
        scores.resize(num_blocks, 0.0);
        for (logical_idx, score) in scores.iter_mut().enumerate() {
            let mass = match attention_mass {
                Some(mass) => mass.get(logical_idx).copied().unwrap_or(0.0),
                // Recency proxy: mass concentrates on the newest blocks
                None => 1.0 / (num_blocks - logical_idx) as f32,
            };
            *score = IMPORTANCE_DECAY * *score + mass;
        }
    }

    /// Drops the bookkeeping of a finished or preempted sequence.
    pub fn forget_sequence(&mut self, sequence_id: u64) {
        self.scores.remove(&sequence_id);
    }

    /// Nominates up to `num_blocks_needed` victim blocks.
    ///
    /// # Arguments
    /// * `eligible` - `(sequence_id, num_prompt_blocks, num_blocks)` for
    ///   every running sequence that may donate blocks.
    ///
    /// # Returns
    /// `(sequence_id, logical_block_index)` pairs, lowest importance
    /// first. Only full blocks strictly between the prompt and the newest
    /// block are considered, so short sequences donate nothing.
    #[instrument(skip_all)]
    pub fn select_victims(
        &self,
        eligible: &[(u64, usize, usize)],
        num_blocks_needed: usize,
    ) -> Vec<(u64, usize)> {
        let _enter = self.span.enter();
        let mut candidates: Vec<(f32, u64, usize)> = Vec::new();
        for (sequence_id, num_prompt_blocks, num_blocks) in eligible {
            let scores = match self.scores.get(sequence_id) {
                Some(scores) => scores,
                None => continue,
            };
            // Middle region only: the prompt is pinned and the newest
            // (possibly partial) block is always kept
            for logical_idx in *num_prompt_blocks..num_blocks.saturating_sub(1) {
                let score = scores.get(logical_idx).copied().unwrap_or(0.0);
                candidates.push((score, *sequence_id, logical_idx));
            }
        }
        candidates.sort_by(|a, b| a.0.total_cmp(&b.0));
        trace!(
            "Cache eviction: {} candidate blocks, {} needed",
            candidates.len(),
            num_blocks_needed
        );
        candidates
            .into_iter()
            .take(num_blocks_needed)
            .map(|(_, sequence_id, logical_idx)| (sequence_id, logical_idx))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_recency_proxy_prefers_old_middle_blocks() {
        let mut evictor = CacheEvictor::new(0.1);
        for _ in 0..4 {
            evictor.record_access(0, 6, None);
        }

        // Prompt occupies the first block; the last block is never evicted
        let victims = evictor.select_victims(&[(0, 1, 6)], 2);
        assert_eq!(victims.len(), 2);
        // Oldest non-prompt middle blocks score lowest under the proxy
        assert_eq!(victims[0], (0, 1));
        assert_eq!(victims[1], (0, 2));
    }

    #[test]
    fn test_reported_attention_mass_drives_selection() {
        let mut evictor = CacheEvictor::new(0.1);
        evictor.record_access(3, 5, Some(&[0.9, 0.01, 0.5, 0.02, 0.9]));

        let victims = evictor.select_victims(&[(3, 1, 5)], 1);
        // Block 1 carries the least attention mass
        assert_eq!(victims, vec![(3, 1)]);
    }

    #[test]
    fn test_short_sequences_donate_nothing() {
        let mut evictor = CacheEvictor::new(0.1);
        evictor.record_access(0, 2, None);
        // Prompt block + newest block leaves no middle
        assert!(evictor.select_victims(&[(0, 1, 2)], 4).is_empty());
    }

    #[test]
    fn test_forget_sequence() {
        let mut evictor = CacheEvictor::new(0.1);
        evictor.record_access(0, 6, None);
        evictor.forget_sequence(0);
        assert!(evictor.select_victims(&[(0, 1, 6)], 1).is_empty());
    }
}

use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, RwLock,
    },
};

use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tracing::instrument;

use crate::types::{GenerationOutput, GenerationOutputs, GenerationStatus};

/// `GenerationStream` - The engine-side end of a request's output channel.
///
/// The sampler pushes one `GenerationOutputs` map per iteration; pushes
/// never block. Dropping the consumer's handle raises the drop flag, which
/// the engine observes at the next step boundary to cancel the request.
#[derive(Debug)]
pub struct GenerationStream {
    /// Producer end of the output queue
    sender: UnboundedSender<GenerationOutputs>,
    /// Set once the request reached a terminal state
    finished: Arc<AtomicBool>,
    /// Set when the consumer dropped its handle
    dropped: Arc<AtomicBool>,
    /// Terminal status of the request
    status: Arc<RwLock<GenerationStatus>>,
}

impl GenerationStream {
    /// Creates a connected stream/handle pair.
    pub fn create() -> (Self, GenerationHandle) {
        let (sender, receiver) = mpsc::unbounded_channel();
        let finished = Arc::new(AtomicBool::new(false));
        let dropped = Arc::new(AtomicBool::new(false));
        let status = Arc::new(RwLock::new(GenerationStatus::Running));
        (
            Self {
                sender,
                finished: finished.clone(),
                dropped: dropped.clone(),
                status: status.clone(),
            },
            GenerationHandle {
                receiver,
                finished,
                dropped,
                status,
            },
        )
    }

    /// Publishes one iteration's outputs. Non-blocking; outputs pushed
    /// after the consumer went away are discarded.
    #[instrument(skip_all)]
    pub fn push(&self, outputs: GenerationOutputs) {
        let _ = self.sender.send(outputs);
    }

    /// Marks the request finished with the given terminal status.
    ///
    /// The channel itself closes when the engine drops the stream, which
    /// wakes blocked readers.
    pub fn finish(&self, status: GenerationStatus) {
        *self.status.write().unwrap() = status;
        self.finished.store(true, Ordering::SeqCst);
    }

    /// Checks whether the consumer cancelled the request.
    pub fn is_dropped(&self) -> bool {
        self.dropped.load(Ordering::SeqCst)
    }

    /// Checks whether the request already finished.
    pub fn is_finished(&self) -> bool {
        self.finished.load(Ordering::SeqCst)
    }
}

/// `GenerationHandle` - The consumer-side end of a request's output
/// channel.
///
/// Dropping the handle cancels the request: the engine finalises it at the
/// next step boundary, frees its blocks and closes the stream. Tokens
/// already read remain valid.
#[derive(Debug)]
pub struct GenerationHandle {
    /// Consumer end of the output queue
    receiver: UnboundedReceiver<GenerationOutputs>,
    /// Set once the request reached a terminal state
    finished: Arc<AtomicBool>,
    /// Raised by `Drop` to request cancellation
    dropped: Arc<AtomicBool>,
    /// Terminal status of the request
    status: Arc<RwLock<GenerationStatus>>,
}

impl GenerationHandle {
    /// Checks whether generation reached a terminal state.
    pub fn generation_finished(&self) -> bool {
        self.finished.load(Ordering::SeqCst)
    }

    /// Terminal status of the request; `Running` while in progress.
    pub fn status(&self) -> GenerationStatus {
        *self.status.read().unwrap()
    }

    /// Non-blocking readiness check.
    pub fn can_read(&self) -> bool {
        !self.receiver.is_empty()
    }

    /// Blocks until the next iteration's outputs arrive; `None` once the
    /// stream is closed and drained.
    pub fn read(&mut self) -> Option<GenerationOutputs> {
        self.receiver.blocking_recv()
    }

    /// Non-blocking read of the next iteration's outputs.
    pub fn try_read(&mut self) -> Option<GenerationOutputs> {
        self.receiver.try_recv().ok()
    }

    /// Consumes the handle, reading until the stream closes, and
    /// reconstructs the full per-sequence outputs by following the
    /// `parent_sequence_id` graph across beam forks.
    pub fn read_all(mut self) -> Vec<GenerationOutput> {
        let mut iterations = Vec::new();
        while let Some(iteration) = self.receiver.blocking_recv() {
            iterations.push(iteration);
        }
        stitch_iterations(iterations)
    }
}

impl Drop for GenerationHandle {
    fn drop(&mut self) {
        // Only an unfinished request needs cancelling
        if !self.finished.load(Ordering::SeqCst) {
            self.dropped.store(true, Ordering::SeqCst);
        }
    }
}

/// Reassembles full sequences from per-iteration outputs.
///
/// A sequence that first appears during iteration `t` with a parent id
/// inherits the parent's tokens accumulated through iteration `t - 1`
/// (beam fork). Within one iteration every new sequence is seeded before
/// any tokens are appended, so a fork and the parent's own continuation
/// cannot interleave.
pub fn stitch_iterations(iterations: Vec<GenerationOutputs>) -> Vec<GenerationOutput> {
    let mut accumulated: HashMap<u64, GenerationOutput> = HashMap::new();
    let mut insertion_order: Vec<u64> = Vec::new();

    for iteration in iterations {
        let mut sequence_ids: Vec<u64> = iteration.keys().copied().collect();
        sequence_ids.sort_unstable();

        // Seed new sequences from their parents' state before this
        // iteration's tokens land
        let mut seeded: HashMap<u64, GenerationOutput> = HashMap::new();
        for sequence_id in &sequence_ids {
            if accumulated.contains_key(sequence_id) {
                continue;
            }
            // DON'T PANIC: ids were collected from the same map
            let output = iteration.get(sequence_id).unwrap();
            let tokens = output
                .parent_sequence_id
                .and_then(|parent| accumulated.get(&parent))
                .map(|parent| parent.token_ids.clone())
                .unwrap_or_default();
            seeded.insert(
                *sequence_id,
                GenerationOutput {
                    token_ids: tokens,
                    parent_sequence_id: output.parent_sequence_id,
                    cumulative_logprob: 0.0,
                    score: 0.0,
                    is_finished: false,
                },
            );
            insertion_order.push(*sequence_id);
        }
        accumulated.extend(seeded);

        for sequence_id in &sequence_ids {
            // DON'T PANIC: every id was seeded above or existed before
            let entry = accumulated.get_mut(sequence_id).unwrap();
            let output = iteration.get(sequence_id).unwrap();
            entry.token_ids.extend_from_slice(&output.token_ids);
            entry.cumulative_logprob = output.cumulative_logprob;
            entry.score = output.score;
            entry.is_finished = output.is_finished;
        }
    }

    let results: Vec<GenerationOutput> = insertion_order
        .into_iter()
        .filter_map(|sequence_id| accumulated.remove(&sequence_id))
        .collect();

    // Beam search prunes hypotheses along the way; pruned sequences stop
    // being emitted without ever finishing. Once any sequence finished,
    // only finished ones are results. A cancelled request has none, and
    // its partial outputs all stay valid.
    if results.iter().any(|r| r.is_finished) {
        results.into_iter().filter(|r| r.is_finished).collect()
    } else {
        results
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn output(tokens: Vec<u32>, parent: Option<u64>) -> GenerationOutput {
        GenerationOutput {
            token_ids: tokens,
            parent_sequence_id: parent,
            cumulative_logprob: -1.0,
            score: -1.0,
            is_finished: false,
        }
    }

    #[test]
    fn test_push_read_and_close() {
        let (stream, mut handle) = GenerationStream::create();
        assert!(!handle.can_read());

        stream.push(HashMap::from_iter([(0, output(vec![5], None))]));
        assert!(handle.can_read());
        let iteration = handle.read().unwrap();
        assert_eq!(iteration.get(&0).unwrap().token_ids, vec![5]);

        stream.finish(GenerationStatus::Finished);
        assert!(handle.generation_finished());
        assert_eq!(handle.status(), GenerationStatus::Finished);

        drop(stream);
        assert!(handle.read().is_none());
    }

    #[test]
    fn test_dropping_handle_raises_cancel_flag() {
        let (stream, handle) = GenerationStream::create();
        assert!(!stream.is_dropped());
        drop(handle);
        assert!(stream.is_dropped());
    }

    #[test]
    fn test_dropping_finished_handle_does_not_cancel() {
        let (stream, handle) = GenerationStream::create();
        stream.finish(GenerationStatus::Finished);
        drop(handle);
        assert!(!stream.is_dropped());
    }

    #[test]
    fn test_stitching_follows_fork_graph() {
        // Iteration 1: sequence 0 produces token 10
        // Iteration 2: sequence 0 continues with 11, sequence 1 forks off 0
        //              with token 12
        let iterations = vec![
            HashMap::from_iter([(0, output(vec![10], None))]),
            HashMap::from_iter([
                (0, output(vec![11], None)),
                (1, output(vec![12], Some(0))),
            ]),
        ];
        let mut results = stitch_iterations(iterations);
        results.sort_by_key(|r| r.token_ids.clone());

        assert_eq!(results.len(), 2);
        assert_eq!(results[0].token_ids, vec![10, 11]);
        // The fork inherits the parent's prefix from before the fork
        assert_eq!(results[1].token_ids, vec![10, 12]);
    }

    #[test]
    fn test_stitching_multi_token_iterations() {
        // Speculative steps deliver several tokens at once
        let iterations = vec![
            HashMap::from_iter([(0, output(vec![1, 2, 3], None))]),
            HashMap::from_iter([(0, output(vec![4], None))]),
        ];
        let results = stitch_iterations(iterations);
        assert_eq!(results[0].token_ids, vec![1, 2, 3, 4]);
    }
}

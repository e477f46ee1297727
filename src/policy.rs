use std::{
    collections::VecDeque,
    fmt::Debug,
    time::{Duration, Instant},
};

use crate::sequence::SequenceGroup;

/// A trait for defining scheduling policies for sequence groups.
///
/// Implementors of this trait determine the priority of sequence groups
/// for processing in a scheduler.
pub trait Policy: Debug {
    /// Calculates the priority of a sequence group at a given time.
    /// Larger durations indicate higher priority.
    fn get_priority(now: Instant, sequence_group: &SequenceGroup) -> Duration;

    /// Sorts a collection of sequence groups by descending priority.
    ///
    /// Ties are broken by ascending request id, so two groups that arrived
    /// in the same instant keep a stable order.
    fn sort_by_priority(
        now: Instant,
        sequence_groups: &VecDeque<SequenceGroup>,
    ) -> VecDeque<SequenceGroup> {
        let mut output: Vec<SequenceGroup> = sequence_groups.iter().cloned().collect::<Vec<_>>();
        output.sort_by(|v1, v2| {
            Self::get_priority(now, v2)
                .cmp(&Self::get_priority(now, v1))
                .then(v1.request_id.cmp(&v2.request_id))
        });
        output.into()
    }
}

/// First-Come, First-Served (FCFS) scheduling policy.
///
/// This policy prioritizes sequence groups based on their arrival time,
/// giving higher priority to those that arrived earlier.
#[derive(Debug)]
pub struct FcfsPolicy {}

impl Policy for FcfsPolicy {
    fn get_priority(now: Instant, sequence_group: &SequenceGroup) -> Duration {
        now - sequence_group.arrival_time()
    }
}

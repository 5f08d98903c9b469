// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 stagelink developers

//! The writer-side timestep queue.
//!
//! Each queued step carries the cohort-wide aggregated metadata (for
//! announcement and late-joiner replay), this rank's data block, and the set
//! of reader cohorts currently holding a reference. A step leaves the queue
//! when its holder set empties after having been announced at least once;
//! steps queued before any reader joined have no holders and wait for the
//! first cohort to arrive.

use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;

use crate::control::msg::FormatBlock;

/// Cohort-wide view of one timestep, assembled by allgather at step close.
/// Indexed by writer rank.
pub struct StepAggregate {
    pub metadata: Vec<Vec<u8>>,
    pub dp_info: Vec<Vec<u8>>,
    /// Format blocks first announced at this step.
    pub formats: Vec<FormatBlock>,
}

struct QueuedStep {
    agg: Arc<StepAggregate>,
    data: Arc<Vec<u8>>,
    holders: HashSet<u64>,
    announced: bool,
}

/// What a release did to the step.
#[derive(Debug, PartialEq, Eq)]
pub enum ReleaseOutcome {
    /// Last holder gone; the step was removed from the queue.
    Emptied,
    StillHeld,
}

#[derive(Default)]
pub struct WriterQueue {
    steps: BTreeMap<u64, QueuedStep>,
}

impl WriterQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    /// Queue a step. `holders` is the set of established reader cohorts at
    /// enqueue time; empty when no reader has joined yet.
    pub fn insert(
        &mut self,
        timestep: u64,
        agg: Arc<StepAggregate>,
        data: Arc<Vec<u8>>,
        holders: HashSet<u64>,
    ) {
        let announced = !holders.is_empty();
        let prior = self.steps.insert(
            timestep,
            QueuedStep {
                agg,
                data,
                holders,
                announced,
            },
        );
        assert!(prior.is_none(), "timestep {} queued twice", timestep);
    }

    /// A reader cohort released its reference. Panics when the step is not
    /// queued or the cohort holds no reference; both mean the two sides
    /// disagree about protocol state and continuing would corrupt the queue.
    pub fn release(&mut self, timestep: u64, reader_id: u64) -> ReleaseOutcome {
        let step = self
            .steps
            .get_mut(&timestep)
            .unwrap_or_else(|| panic!("release of unqueued timestep {}", timestep));
        assert!(
            step.holders.remove(&reader_id),
            "reader {} released timestep {} it does not hold",
            reader_id,
            timestep
        );
        if step.holders.is_empty() && step.announced {
            self.steps.remove(&timestep);
            ReleaseOutcome::Emptied
        } else {
            ReleaseOutcome::StillHeld
        }
    }

    /// Record a late-joining cohort as holder of an already-queued step
    /// (replay path).
    pub fn add_holder(&mut self, timestep: u64, reader_id: u64) {
        let step = self
            .steps
            .get_mut(&timestep)
            .unwrap_or_else(|| panic!("add_holder on unqueued timestep {}", timestep));
        step.holders.insert(reader_id);
        step.announced = true;
    }

    /// Drop every reference a cohort holds (close or failure). Returns the
    /// steps that emptied and were removed.
    pub fn drop_reader(&mut self, reader_id: u64) -> Vec<u64> {
        let emptied: Vec<u64> = self
            .steps
            .iter_mut()
            .filter_map(|(&ts, step)| {
                step.holders.remove(&reader_id);
                (step.holders.is_empty() && step.announced).then_some(ts)
            })
            .collect();
        for ts in &emptied {
            self.steps.remove(ts);
        }
        emptied
    }

    /// Oldest step no cohort holds, if any. Used by the discard policy to
    /// make room; only never-announced steps qualify, announced ones leave
    /// via release.
    pub fn evict_oldest_unheld(&mut self) -> Option<u64> {
        let ts = self
            .steps
            .iter()
            .find(|(_, step)| step.holders.is_empty())
            .map(|(&ts, _)| ts)?;
        self.steps.remove(&ts);
        Some(ts)
    }

    /// Steps currently holding at least one reader reference.
    pub fn held_count(&self) -> usize {
        self.steps
            .values()
            .filter(|s| !s.holders.is_empty())
            .count()
    }

    /// Drop everything still queued, yielding the timesteps removed.
    pub fn clear(&mut self) -> Vec<u64> {
        let steps = self.timesteps();
        self.steps.clear();
        steps
    }

    /// Oldest queued timestep.
    pub fn oldest(&self) -> Option<u64> {
        self.steps.keys().next().copied()
    }

    /// Steps at or after `from`, oldest first, for late-joiner replay.
    pub fn steps_from(&self, from: u64) -> impl Iterator<Item = (u64, Arc<StepAggregate>)> + '_ {
        self.steps
            .range(from..)
            .map(|(&ts, step)| (ts, Arc::clone(&step.agg)))
    }

    /// Queued timesteps, oldest first.
    pub fn timesteps(&self) -> Vec<u64> {
        self.steps.keys().copied().collect()
    }

    /// This rank's data block for a queued step.
    pub fn data(&self, timestep: u64) -> Option<Arc<Vec<u8>>> {
        self.steps.get(&timestep).map(|s| Arc::clone(&s.data))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn agg() -> Arc<StepAggregate> {
        Arc::new(StepAggregate {
            metadata: vec![vec![0]],
            dp_info: vec![vec![0]],
            formats: Vec::new(),
        })
    }

    fn holders(ids: &[u64]) -> HashSet<u64> {
        ids.iter().copied().collect()
    }

    #[test]
    fn step_leaves_when_last_holder_releases() {
        let mut q = WriterQueue::new();
        q.insert(0, agg(), Arc::new(vec![]), holders(&[1, 2]));
        assert_eq!(q.release(0, 1), ReleaseOutcome::StillHeld);
        assert_eq!(q.len(), 1);
        assert_eq!(q.release(0, 2), ReleaseOutcome::Emptied);
        assert!(q.is_empty());
    }

    #[test]
    #[should_panic(expected = "release of unqueued timestep")]
    fn releasing_unknown_step_panics() {
        let mut q = WriterQueue::new();
        q.release(7, 1);
    }

    #[test]
    #[should_panic(expected = "does not hold")]
    fn double_release_panics() {
        let mut q = WriterQueue::new();
        q.insert(0, agg(), Arc::new(vec![]), holders(&[1, 2]));
        q.release(0, 1);
        q.release(0, 1);
    }

    #[test]
    fn unannounced_steps_survive_until_a_reader_takes_them() {
        let mut q = WriterQueue::new();
        // Queued before any reader joined.
        q.insert(3, agg(), Arc::new(vec![]), HashSet::new());
        assert_eq!(q.len(), 1);

        // Late joiner replays and becomes holder.
        q.add_holder(3, 9);
        assert_eq!(q.release(3, 9), ReleaseOutcome::Emptied);
    }

    #[test]
    fn drop_reader_empties_its_steps() {
        let mut q = WriterQueue::new();
        q.insert(0, agg(), Arc::new(vec![]), holders(&[1]));
        q.insert(1, agg(), Arc::new(vec![]), holders(&[1, 2]));
        let emptied = q.drop_reader(1);
        assert_eq!(emptied, vec![0]);
        assert_eq!(q.timesteps(), vec![1]);
    }

    #[test]
    fn eviction_takes_oldest_unheld_only() {
        let mut q = WriterQueue::new();
        q.insert(0, agg(), Arc::new(vec![]), holders(&[1]));
        q.insert(1, agg(), Arc::new(vec![]), HashSet::new());
        q.insert(2, agg(), Arc::new(vec![]), HashSet::new());
        assert_eq!(q.evict_oldest_unheld(), Some(1));
        assert_eq!(q.timesteps(), vec![0, 2]);
    }

    #[test]
    fn replay_iterates_from_starting_step() {
        let mut q = WriterQueue::new();
        for ts in [2u64, 5, 9] {
            q.insert(ts, agg(), Arc::new(vec![]), HashSet::new());
        }
        let replayed: Vec<u64> = q.steps_from(5).map(|(ts, _)| ts).collect();
        assert_eq!(replayed, vec![5, 9]);
    }
}

// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 stagelink developers

//! Collective communication within one cohort of parallel ranks.
//!
//! The control plane needs a handful of MPI-style collectives: allgather,
//! broadcast, all-reduce-max and a barrier. They are abstracted behind the
//! [`Cohort`] trait so the same protocol code runs over a real MPI binding or
//! over the in-process reference implementation used by tests and
//! single-process deployments.
//!
//! # Ordering contract
//!
//! As with MPI, every rank of a cohort must invoke collectives in the same
//! program order. The reference implementation detects a rank contributing
//! twice to the same round only in debug builds; diverging call order across
//! ranks is a protocol bug, not a recoverable error.

use std::sync::Arc;

use parking_lot::{Condvar, Mutex};

/// Collective operations over one cohort of ranks.
///
/// Payloads are opaque byte vectors; callers serialize with the control-plane
/// wire codec. Operations are infallible: a collective that cannot complete
/// means a lost rank, which is fatal for the cohort (MPI semantics).
pub trait Cohort: Send + Sync {
    /// This rank's index within the cohort.
    fn rank(&self) -> usize;
    /// Number of ranks in the cohort.
    fn size(&self) -> usize;
    /// Gather every rank's contribution; every rank receives the full vector
    /// indexed by rank.
    fn allgather(&self, data: Vec<u8>) -> Vec<Vec<u8>>;
    /// Distribute `data` from `root` to every rank. Non-root ranks pass
    /// `None`.
    fn broadcast(&self, root: usize, data: Option<Vec<u8>>) -> Vec<u8>;
    /// Maximum of every rank's value.
    fn allreduce_max(&self, value: u64) -> u64;
    /// Block until every rank has arrived.
    fn barrier(&self);
}

// ============================================================================
// In-process reference implementation
// ============================================================================

struct RoundState {
    /// Completed-round generation counter.
    gen: u64,
    /// Per-rank contributions for the in-flight round.
    contrib: Vec<Option<Vec<u8>>>,
    arrived: usize,
    /// Result of the most recently completed round.
    result: Arc<Vec<Vec<u8>>>,
}

struct GroupShared {
    size: usize,
    state: Mutex<RoundState>,
    cv: Condvar,
}

/// One rank's handle onto an in-process cohort.
///
/// All ranks live in the same process (typically one thread per rank); the
/// collectives rendezvous through shared state under a single mutex.
pub struct LocalCohort {
    rank: usize,
    shared: Arc<GroupShared>,
}

impl LocalCohort {
    /// Create a cohort of `size` ranks, returning one handle per rank.
    pub fn group(size: usize) -> Vec<LocalCohort> {
        assert!(size >= 1, "cohort size must be >= 1");
        let shared = Arc::new(GroupShared {
            size,
            state: Mutex::new(RoundState {
                gen: 0,
                contrib: vec![None; size],
                arrived: 0,
                result: Arc::new(Vec::new()),
            }),
            cv: Condvar::new(),
        });
        (0..size)
            .map(|rank| LocalCohort {
                rank,
                shared: Arc::clone(&shared),
            })
            .collect()
    }
}

impl Cohort for LocalCohort {
    fn rank(&self) -> usize {
        self.rank
    }

    fn size(&self) -> usize {
        self.shared.size
    }

    fn allgather(&self, data: Vec<u8>) -> Vec<Vec<u8>> {
        let mut state = self.shared.state.lock();
        let my_gen = state.gen;
        debug_assert!(
            state.contrib[self.rank].is_none(),
            "rank {} contributed twice to the same collective round",
            self.rank
        );
        state.contrib[self.rank] = Some(data);
        state.arrived += 1;

        if state.arrived == self.shared.size {
            // Last arriver completes the round and publishes the result.
            let gathered: Vec<Vec<u8>> = state
                .contrib
                .iter_mut()
                .map(|c| c.take().unwrap_or_default())
                .collect();
            state.result = Arc::new(gathered);
            state.arrived = 0;
            state.gen = state.gen.wrapping_add(1);
            self.shared.cv.notify_all();
            return state.result.as_ref().clone();
        }

        // A waiter cannot miss its result: the next round can only complete
        // after every rank (including this one) has entered it.
        while state.gen == my_gen {
            self.shared.cv.wait(&mut state);
        }
        state.result.as_ref().clone()
    }

    fn broadcast(&self, root: usize, data: Option<Vec<u8>>) -> Vec<u8> {
        let contribution = if self.rank == root {
            data.unwrap_or_default()
        } else {
            Vec::new()
        };
        let mut gathered = self.allgather(contribution);
        std::mem::take(&mut gathered[root])
    }

    fn allreduce_max(&self, value: u64) -> u64 {
        self.allgather(value.to_le_bytes().to_vec())
            .iter()
            .map(|bytes| {
                let mut raw = [0u8; 8];
                raw.copy_from_slice(&bytes[..8]);
                u64::from_le_bytes(raw)
            })
            .max()
            .unwrap_or(value)
    }

    fn barrier(&self) {
        let _ = self.allgather(Vec::new());
    }
}

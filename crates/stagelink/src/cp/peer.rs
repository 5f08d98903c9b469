// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 stagelink developers

//! Peer partitioning between unequal cohorts.
//!
//! Each local rank owns a contiguous slice of the remote cohort; the first
//! `remote % local` ranks take one extra peer. Together the slices cover the
//! remote cohort exactly once, so a message sent to one's slice reaches
//! every remote rank exactly once across the local cohort.

use std::ops::Range;

/// Remote ranks owned by `my_rank` of a `my_size` cohort facing a
/// `peer_size` cohort.
pub fn peer_slice(my_rank: usize, my_size: usize, peer_size: usize) -> Range<usize> {
    debug_assert!(my_rank < my_size);
    let base = peer_size / my_size;
    let extra = peer_size % my_size;
    let start = my_rank * base + my_rank.min(extra);
    let len = base + usize::from(my_rank < extra);
    start..start + len
}

/// Inverse of [`peer_slice`]: the local rank whose slice contains
/// `peer_rank`.
pub fn owner_of(peer_rank: usize, my_size: usize, peer_size: usize) -> usize {
    debug_assert!(peer_rank < peer_size);
    let base = peer_size / my_size;
    let extra = peer_size % my_size;
    // The first `extra` owners hold `base + 1` peers each.
    let wide = extra * (base + 1);
    if peer_rank < wide {
        peer_rank / (base + 1)
    } else {
        extra + (peer_rank - wide) / base.max(1)
    }
}

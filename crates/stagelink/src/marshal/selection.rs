// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 stagelink developers

//! Box selections over row-major global arrays: overlap testing and
//! extraction of the overlapping region from a rank's contiguous block into
//! the caller's selection-shaped buffer.

/// A hyperslab request: `start`/`count` per dimension of the global array.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Selection {
    pub start: Vec<u64>,
    pub count: Vec<u64>,
}

impl Selection {
    pub fn new(start: Vec<u64>, count: Vec<u64>) -> Self {
        debug_assert_eq!(start.len(), count.len());
        Self { start, count }
    }

    pub fn ndims(&self) -> usize {
        self.start.len()
    }

    pub fn n_elems(&self) -> u64 {
        self.count.iter().product()
    }

    pub fn is_empty(&self) -> bool {
        self.count.iter().any(|&c| c == 0)
    }
}

/// Axis-wise overlap test between a selection and one rank's block. Disjoint
/// on any axis means disjoint overall; a zero-size slab on either side never
/// overlaps anything, even with its start inside the other range.
pub fn overlaps(sel: &Selection, blk_start: &[u64], blk_count: &[u64]) -> bool {
    debug_assert_eq!(sel.ndims(), blk_start.len());
    for d in 0..sel.ndims() {
        if sel.count[d] == 0 || blk_count[d] == 0 {
            return false;
        }
        let sel_end = sel.start[d] + sel.count[d];
        let blk_end = blk_start[d] + blk_count[d];
        if sel.start[d] >= blk_end || blk_start[d] >= sel_end {
            return false;
        }
    }
    true
}

/// Copy the intersection of `sel` and the block into `dest`.
///
/// `block` holds the rank's contribution, row-major with dims `blk_count`.
/// `dest` is the caller's buffer, row-major with dims `sel.count`; only the
/// intersecting region is written, so a selection spanning several ranks is
/// assembled by calling this once per overlapping block.
///
/// Contiguous runs are found by scanning dimensions from the last: every
/// trailing dimension fully covered in BOTH layouts extends the memcpy run,
/// and the remaining leading dimensions are walked with an odometer.
pub fn extract_into(
    dest: &mut [u8],
    elem_size: usize,
    sel: &Selection,
    blk_start: &[u64],
    blk_count: &[u64],
    block: &[u8],
) {
    let n = sel.ndims();
    debug_assert!(n > 0);
    debug_assert_eq!(dest.len() as u64, sel.n_elems() * elem_size as u64);

    // Per-dimension intersection.
    let mut is = vec![0u64; n];
    let mut icount = vec![0u64; n];
    for d in 0..n {
        let lo = sel.start[d].max(blk_start[d]);
        let hi = (sel.start[d] + sel.count[d]).min(blk_start[d] + blk_count[d]);
        if hi <= lo {
            return;
        }
        is[d] = lo;
        icount[d] = hi - lo;
    }

    // Element strides of each layout.
    let mut blk_stride = vec![1u64; n];
    let mut sel_stride = vec![1u64; n];
    for d in (0..n.saturating_sub(1)).rev() {
        blk_stride[d] = blk_stride[d + 1] * blk_count[d + 1];
        sel_stride[d] = sel_stride[d + 1] * sel.count[d + 1];
    }

    // Smallest `split` with every dimension after it fully covered in both
    // layouts; the run along `split` and everything after it is contiguous
    // in both buffers.
    let full = |d: usize| icount[d] == blk_count[d] && icount[d] == sel.count[d];
    let mut split = n - 1;
    while split > 0 && full(split) {
        split -= 1;
    }
    let run_elems: u64 = icount[split..].iter().product();
    let run_bytes = run_elems as usize * elem_size;

    let mut idx = vec![0u64; split];
    loop {
        let mut src_elem = (is[split] - blk_start[split]) * blk_stride[split];
        let mut dst_elem = (is[split] - sel.start[split]) * sel_stride[split];
        for d in 0..split {
            src_elem += (is[d] - blk_start[d] + idx[d]) * blk_stride[d];
            dst_elem += (is[d] - sel.start[d] + idx[d]) * sel_stride[d];
        }
        let src = src_elem as usize * elem_size;
        let dst = dst_elem as usize * elem_size;
        dest[dst..dst + run_bytes].copy_from_slice(&block[src..src + run_bytes]);

        // Odometer over the leading dimensions.
        let mut d = split;
        loop {
            if d == 0 {
                return;
            }
            d -= 1;
            idx[d] += 1;
            if idx[d] < icount[d] {
                break;
            }
            idx[d] = 0;
        }
    }
}

// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 stagelink developers

//! Data transport plane: the pluggable bulk-transfer path.
//!
//! Distinct from the always-present control connection layer. A plane moves
//! a byte range of one writer rank's timestep data block to a requesting
//! reader rank; everything else (what the bytes mean, when they may be
//! reclaimed) is the control plane's business.
//!
//! # Contract
//!
//! - Writer side: `provide_timestep` is called synchronously under the
//!   stream lock BEFORE the timestep's metadata is announced, because a
//!   reader may race to request data the moment metadata arrives. It must
//!   not block indefinitely. `release_timestep` drops the plane's claim on
//!   the block.
//! - Reader side: `read_remote_memory` issues an asynchronous read and
//!   returns a [`ReadHandle`]; the matching completion is fulfilled by the
//!   background dispatcher thread. `ReadHandle::wait` is safe to call from
//!   application threads.
//! - A plane owns its internal concurrency; the control plane never calls
//!   into it from more than one thread at a time per hook.

pub mod inline;
pub mod registry;

pub use inline::InlineDpFactory;
pub use registry::DpRegistry;

use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Condvar, Mutex};

use crate::control::ControlNet;
use crate::error::{Error, Result};

/// Factory for one compiled-in data plane implementation.
pub trait DpFactory: Send + Sync {
    /// Name used for explicit selection via the `DataPlane` parameter.
    fn name(&self) -> &'static str;
    /// Selection priority; the registry picks the highest among usable
    /// planes when none is named explicitly.
    fn priority(&self) -> i32;
    /// Writer-side instantiation.
    fn make_writer(&self, net: &Arc<dyn ControlNet>) -> Result<Arc<dyn DpWriter>>;
    /// Reader-side instantiation.
    fn make_reader(&self, net: &Arc<dyn ControlNet>) -> Result<Arc<dyn DpReader>>;
}

/// Writer-rank side of a data plane.
pub trait DpWriter: Send + Sync {
    /// Per-reader-cohort setup hook; most planes need none.
    fn init_per_reader(&self, _reader_id: u64) {}
    /// Register one timestep's data block; returns the opaque per-timestep
    /// contact info distributed to readers alongside the metadata.
    fn provide_timestep(&self, timestep: u64, data: Arc<Vec<u8>>) -> Result<Vec<u8>>;
    /// Drop the plane's claim on a timestep's block.
    fn release_timestep(&self, timestep: u64);
    /// Teardown hook.
    fn shutdown(&self) {}
}

/// Reader-rank side of a data plane.
pub trait DpReader: Send + Sync {
    /// Issue an asynchronous read of `[offset, offset+length)` from
    /// `writer_rank`'s block for `timestep`. `per_ts_info` is that rank's
    /// opaque contact info from the timestep metadata.
    fn read_remote_memory(
        &self,
        writer_rank: usize,
        timestep: u64,
        offset: u64,
        length: u64,
        per_ts_info: &[u8],
    ) -> Result<ReadHandle>;
    /// A writer rank's connection dropped; outstanding reads against it must
    /// fail rather than hang.
    fn notify_conn_failure(&self, writer_rank: usize);
    /// Teardown hook.
    fn shutdown(&self) {}
}

// ============================================================================
// Read completion plumbing
// ============================================================================

struct ReadShared {
    result: Mutex<Option<std::result::Result<Vec<u8>, String>>>,
    cv: Condvar,
}

/// Application-thread side of one outstanding read.
pub struct ReadHandle {
    shared: Arc<ReadShared>,
}

/// Dispatcher-thread side: fulfills the read exactly once.
pub struct ReadCompletion {
    shared: Arc<ReadShared>,
}

/// Create a linked handle/completion pair.
pub fn read_pair() -> (ReadHandle, ReadCompletion) {
    let shared = Arc::new(ReadShared {
        result: Mutex::new(None),
        cv: Condvar::new(),
    });
    (
        ReadHandle {
            shared: Arc::clone(&shared),
        },
        ReadCompletion { shared },
    )
}

impl ReadHandle {
    /// Block until the read completes or the timeout expires.
    pub fn wait(&self, timeout: Option<Duration>) -> Result<Vec<u8>> {
        let mut result = self.shared.result.lock();
        while result.is_none() {
            match timeout {
                Some(t) => {
                    if self.shared.cv.wait_for(&mut result, t).timed_out() && result.is_none() {
                        return Err(Error::Timeout);
                    }
                }
                None => self.shared.cv.wait(&mut result),
            }
        }
        match result.take() {
            Some(Ok(data)) => Ok(data),
            Some(Err(reason)) => Err(Error::ReadFailed(reason)),
            None => unreachable!("checked above"),
        }
    }
}

impl ReadCompletion {
    pub fn fulfill(&self, outcome: std::result::Result<Vec<u8>, String>) {
        let mut result = self.shared.result.lock();
        debug_assert!(result.is_none(), "read fulfilled twice");
        *result = Some(outcome);
        self.shared.cv.notify_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn wait_returns_fulfilled_data() {
        let (handle, completion) = read_pair();
        let t = thread::spawn(move || {
            thread::sleep(Duration::from_millis(10));
            completion.fulfill(Ok(vec![1, 2, 3]));
        });
        assert_eq!(handle.wait(None).expect("read ok"), vec![1, 2, 3]);
        t.join().unwrap();
    }

    #[test]
    fn wait_surfaces_failure() {
        let (handle, completion) = read_pair();
        completion.fulfill(Err("peer gone".into()));
        assert!(matches!(handle.wait(None), Err(Error::ReadFailed(_))));
    }

    #[test]
    fn wait_times_out() {
        let (handle, _completion) = read_pair();
        assert!(matches!(
            handle.wait(Some(Duration::from_millis(20))),
            Err(Error::Timeout)
        ));
    }
}

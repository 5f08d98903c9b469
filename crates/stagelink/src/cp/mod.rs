// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 stagelink developers

//! Control plane core: the writer and reader stream state machines.
//!
//! A stream connects one writer cohort to any number of reader cohorts. The
//! writer queues reference-counted timesteps; readers advance through them
//! in order and release them when done. All cross-cohort traffic rides the
//! control connection layer; all intra-cohort agreement rides the cohort
//! collectives. Bulk data moves through the data plane on reader demand.

pub mod peer;
pub mod queue;
pub mod reader;
pub mod writer;

pub use reader::{GetResult, GetToken, ReaderStream};
pub use writer::WriterStream;

/// Lifecycle of a stream, as seen from either side.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StreamStatus {
    /// Constructed but the opening handshake has not completed.
    NotOpen,
    /// Handshake complete; both sides connected.
    Established,
    /// The remote side closed in an orderly fashion. Already-received
    /// timesteps remain consumable.
    PeerClosed,
    /// The remote side vanished without closing.
    PeerFailed,
    /// This side has closed.
    Closed,
}

/// Outcome of [`ReaderStream::advance_step`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StepStatus {
    /// A new timestep is installed and readable.
    Success,
    /// Orderly end: the writer closed and every announced step has been
    /// consumed.
    EndOfStream,
    /// The writer failed; no further steps will ever arrive.
    FatalError,
    /// No step arrived within the caller's timeout. Retryable.
    Timeout,
}

/// Which timestep [`ReaderStream::advance_step`] should deliver.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum StepMode {
    /// The oldest not-yet-consumed timestep, in order.
    #[default]
    NextAvailable,
    /// The newest available timestep; older pending ones are released
    /// unseen.
    LatestAvailable,
}

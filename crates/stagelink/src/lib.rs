// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 stagelink developers

//! # stagelink - Staged Data Transport for Parallel Cohorts
//!
//! A control plane for moving timestepped scientific data from a parallel
//! writer cohort (a running simulation) to loosely coupled parallel reader
//! cohorts (analysis, visualization), without a file system in the middle.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use stagelink::{Context, LocalCohort, Result, StreamParams, VarType};
//!
//! fn main() -> Result<()> {
//!     let ctx = Context::in_process();
//!     let cohort: Arc<dyn stagelink::Cohort> = Arc::new(LocalCohort::group(1).remove(0));
//!
//!     let mut writer = ctx.open_writer(cohort, "heat", StreamParams::default())?;
//!     let field = vec![0u8; 10 * 8];
//!     writer.put_array("u", VarType::F64, &[10], &[0], &[10], &field)?;
//!     writer.close_timestep()?;
//!     writer.close()?;
//!     Ok(())
//! }
//! ```
//!
//! ## Architecture
//!
//! ```text
//! +--------------------------------------------------------------------+
//! |                        Application Layer                           |
//! |     Context -> WriterStream / ReaderStream   (put / get calls)     |
//! +--------------------------------------------------------------------+
//! |                       Control Plane Core                           |
//! |  rendezvous | cohort admission | timestep queue | reference counts |
//! +--------------------------------------------------------------------+
//! |   Marshaling          |  Cohort Collectives  |   Data Plane        |
//! |   formats, metadata,  |  allgather/broadcast |   pluggable bulk    |
//! |   selections          |  allreduce/barrier   |   transfer          |
//! +--------------------------------------------------------------------+
//! |                    Control Connection Layer                        |
//! |        in-process net | TCP net  (single dispatcher thread)        |
//! +--------------------------------------------------------------------+
//! ```
//!
//! ## Key Types
//!
//! | Type | Description |
//! |------|-------------|
//! | [`Context`] | Per-process entry point, factory for streams |
//! | [`WriterStream`] | One writer rank's half of a stream |
//! | [`ReaderStream`] | One reader rank's half of a stream |
//! | [`StreamParams`] | Open-time parameters (queue policy, rendezvous) |
//! | [`Selection`] | Hyperslab request over a global array |
//!
//! ## Semantics in Brief
//!
//! - The writer queues each closed timestep until every established reader
//!   cohort releases it; queue-full behavior is configurable (block or
//!   discard).
//! - Reader cohorts may join mid-stream; they start at the oldest timestep
//!   every writer rank still holds and receive the full format history.
//! - Metadata travels eagerly over the control net; bulk data moves lazily
//!   through the data plane when a reader performs its gets.

/// MPI-style collectives within one cohort of parallel ranks.
pub mod cohort;
/// Stream parameters, parsed and validated at open time.
pub mod config;
/// Per-process context: control net plus data plane registry.
pub mod context;
/// Control connection layer (in-process and TCP nets, wire codec).
pub mod control;
/// Control plane core (writer/reader stream state machines).
pub mod cp;
/// Pluggable bulk-transfer data planes.
pub mod dp;
/// Crate-wide error type.
pub mod error;
/// Variable marshaling (formats, metadata blocks, selections).
pub mod marshal;
/// Writer contact publication and lookup.
pub mod rendezvous;
/// Per-stream transfer statistics.
pub mod stats;

pub use cohort::{Cohort, LocalCohort};
pub use config::{QueueFullPolicy, RegistrationMethod, StreamParams};
pub use context::Context;
pub use cp::{
    GetResult, GetToken, ReaderStream, StepMode, StepStatus, StreamStatus, WriterStream,
};
pub use error::{Error, Result};
pub use marshal::{Selection, VarType};
pub use stats::StreamStats;

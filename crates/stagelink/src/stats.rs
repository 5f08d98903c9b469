// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 stagelink developers

//! Per-stream transfer statistics, filled in at close.

use std::time::Duration;

/// Statistics for one stream, valid after `close` returns.
#[derive(Clone, Debug, Default)]
pub struct StreamStats {
    /// Wall time spent inside `open` (rendezvous included).
    pub open_duration: Duration,
    /// Wall time between open returning and close being called.
    pub valid_duration: Duration,
    /// Wall time spent inside `close` (drain included).
    pub close_duration: Duration,
    /// Payload bytes this rank provided (writer) or fetched (reader).
    pub bytes_transferred: u64,
    /// Timesteps this rank provided (writer) or consumed (reader).
    pub timesteps: u64,
    /// Timesteps dropped by the discard queue-full policy (writer only).
    pub timesteps_discarded: u64,
}

// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 stagelink developers

//! Stream parameters, parsed and validated at open time.
//!
//! Unknown parameter names or unparsable values are rejected with
//! [`Error::InvalidParam`] before any network activity, so a misconfigured
//! open never leaves half-established connections behind.

use std::path::PathBuf;
use std::time::Duration;

use crate::error::{Error, Result};

/// Behavior when the writer's timestep queue reaches its configured limit.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum QueueFullPolicy {
    /// `provide_timestep` blocks until the queue drains below the limit.
    #[default]
    Block,
    /// Evict a timestep synchronously: the incoming one if any reader is
    /// established (already-announced metadata cannot be recalled), otherwise
    /// the oldest zero-reference queued entry.
    Discard,
}

/// How the writer publishes (and the reader locates) contact information.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum RegistrationMethod {
    /// `<name>.sst` contact file, written atomically, polled by readers.
    #[default]
    File,
    /// Print the contact line to stdout / read it from stdin (manual wiring
    /// for environments without a shared filesystem).
    Screen,
}

/// Parameters governing one stream open.
#[derive(Clone, Debug)]
pub struct StreamParams {
    /// Maximum queued (unreleased) timesteps on each writer rank.
    /// `0` means unlimited.
    pub queue_limit: usize,
    /// What to do when the queue limit is hit.
    pub queue_full_policy: QueueFullPolicy,
    /// Number of reader cohorts the writer open blocks for before returning.
    /// `0` starts streaming immediately; late joiners attach mid-stream.
    pub rendezvous_reader_count: usize,
    /// Contact publication mechanism.
    pub registration_method: RegistrationMethod,
    /// Directory holding contact files for the `File` registration method.
    pub registration_dir: PathBuf,
    /// Data plane implementation selected by name; `None` picks the highest
    /// priority registered plane.
    pub data_plane: Option<String>,
    /// Reader-side bound on the rendezvous poll loop and response wait.
    pub open_timeout: Duration,
    /// Bound on the writer close drain (waiting for readers to release all
    /// queued timesteps). `None` keeps the reference behavior: wait forever.
    pub close_timeout: Option<Duration>,
}

impl Default for StreamParams {
    fn default() -> Self {
        Self {
            queue_limit: 0,
            queue_full_policy: QueueFullPolicy::default(),
            rendezvous_reader_count: 1,
            registration_method: RegistrationMethod::default(),
            registration_dir: PathBuf::from("."),
            data_plane: None,
            open_timeout: Duration::from_secs(60),
            close_timeout: None,
        }
    }
}

impl StreamParams {
    /// Parse engine-style `key=value` pairs. Keys are case-insensitive.
    pub fn from_pairs<'a, I>(pairs: I) -> Result<Self>
    where
        I: IntoIterator<Item = (&'a str, &'a str)>,
    {
        let mut params = Self::default();
        for (key, value) in pairs {
            params.apply(key, value)?;
        }
        Ok(params)
    }

    fn apply(&mut self, key: &str, value: &str) -> Result<()> {
        match key.to_ascii_lowercase().as_str() {
            "queuelimit" => {
                self.queue_limit = value
                    .parse()
                    .map_err(|_| Error::InvalidParam(format!("QueueLimit={}", value)))?;
            }
            "queuefullpolicy" => {
                self.queue_full_policy = match value.to_ascii_lowercase().as_str() {
                    "block" => QueueFullPolicy::Block,
                    "discard" => QueueFullPolicy::Discard,
                    _ => return Err(Error::InvalidParam(format!("QueueFullPolicy={}", value))),
                };
            }
            "rendezvousreadercount" => {
                self.rendezvous_reader_count = value
                    .parse()
                    .map_err(|_| Error::InvalidParam(format!("RendezvousReaderCount={}", value)))?;
            }
            "registrationmethod" => {
                self.registration_method = match value.to_ascii_lowercase().as_str() {
                    "file" => RegistrationMethod::File,
                    "screen" => RegistrationMethod::Screen,
                    _ => return Err(Error::InvalidParam(format!("RegistrationMethod={}", value))),
                };
            }
            "registrationdir" => {
                self.registration_dir = PathBuf::from(value);
            }
            "dataplane" | "datatransport" => {
                self.data_plane = Some(value.to_string());
            }
            "opentimeoutsecs" => {
                let secs: u64 = value
                    .parse()
                    .map_err(|_| Error::InvalidParam(format!("OpenTimeoutSecs={}", value)))?;
                self.open_timeout = Duration::from_secs(secs);
            }
            "closetimeoutsecs" => {
                let secs: u64 = value
                    .parse()
                    .map_err(|_| Error::InvalidParam(format!("CloseTimeoutSecs={}", value)))?;
                self.close_timeout = Some(Duration::from_secs(secs));
            }
            other => {
                return Err(Error::InvalidParam(format!("unknown parameter: {}", other)));
            }
        }
        Ok(())
    }
}

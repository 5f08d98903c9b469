// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 stagelink developers

//! Out-of-band rendezvous: how a reader cohort locates writer rank 0.
//!
//! The writer publishes a single contact line, `<token>:<contact>`, and the
//! reader polls for it. The file method writes `<stream>.sst` atomically
//! (temp file + rename) in a shared directory; the screen method prints the
//! line and prompts for it, for environments without a shared filesystem.

use std::fs;
use std::io::{BufRead, Write};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use log::debug;

use crate::config::{RegistrationMethod, StreamParams};
use crate::control::ContactInfo;
use crate::error::{Error, Result};

/// Poll interval while waiting for a contact file to appear.
const POLL_INTERVAL: Duration = Duration::from_millis(100);

/// One published contact line.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ContactLine {
    /// Opaque stream token, echoed back in `ReaderRegister` so a stale file
    /// from a previous run cannot attach a reader to the wrong stream.
    pub token: u64,
    /// Writer rank 0's serialized control endpoint address.
    pub contact: ContactInfo,
}

impl ContactLine {
    fn render(&self) -> String {
        format!("{:x}:{}", self.token, self.contact.0)
    }

    fn parse(line: &str) -> Result<Self> {
        let trimmed = line.trim();
        let (token, contact) = trimmed
            .split_once(':')
            .ok_or_else(|| Error::RendezvousFailed(format!("malformed contact line: {}", trimmed)))?;
        let token = u64::from_str_radix(token, 16)
            .map_err(|_| Error::RendezvousFailed(format!("bad stream token: {}", token)))?;
        Ok(Self {
            token,
            contact: ContactInfo(contact.to_string()),
        })
    }
}

/// Publication/lookup mechanism selected by [`StreamParams`].
pub enum Rendezvous {
    File { path: PathBuf },
    Screen,
}

impl Rendezvous {
    /// Build the mechanism for `stream_name` from the open parameters.
    pub fn from_params(stream_name: &str, params: &StreamParams) -> Self {
        match params.registration_method {
            RegistrationMethod::File => Rendezvous::File {
                path: contact_file_path(&params.registration_dir, stream_name),
            },
            RegistrationMethod::Screen => Rendezvous::Screen,
        }
    }

    /// Publish the contact line (writer rank 0 only).
    pub fn publish(&self, line: &ContactLine) -> Result<()> {
        match self {
            Rendezvous::File { path } => {
                // Write-to-temp-then-rename so a concurrent poller never
                // observes a partially written file.
                let tmp = path.with_extension("sst.tmp");
                let mut file = fs::File::create(&tmp)?;
                writeln!(file, "{}", line.render())?;
                file.sync_all()?;
                fs::rename(&tmp, path)?;
                debug!("[Rendezvous::publish] wrote {}", path.display());
                Ok(())
            }
            Rendezvous::Screen => {
                println!("Stream open. Reader contact line: {}", line.render());
                Ok(())
            }
        }
    }

    /// Locate the writer's contact line (reader rank 0 only).
    ///
    /// The file method polls until the file exists AND is non-empty: the
    /// publisher renames atomically, but a stale zero-length file from an
    /// interrupted previous run must not be parsed.
    pub fn lookup(&self, timeout: Duration) -> Result<ContactLine> {
        match self {
            Rendezvous::File { path } => {
                let deadline = Instant::now() + timeout;
                loop {
                    match fs::read_to_string(path) {
                        Ok(contents) if !contents.trim().is_empty() => {
                            return ContactLine::parse(&contents);
                        }
                        Ok(_) | Err(_) => {}
                    }
                    if Instant::now() >= deadline {
                        return Err(Error::RendezvousFailed(format!(
                            "no writer contact at {} after {:?}",
                            path.display(),
                            timeout
                        )));
                    }
                    std::thread::sleep(POLL_INTERVAL);
                }
            }
            Rendezvous::Screen => {
                print!("Enter writer contact line: ");
                std::io::stdout().flush()?;
                let mut line = String::new();
                std::io::stdin().lock().read_line(&mut line)?;
                ContactLine::parse(&line)
            }
        }
    }

    /// Remove the published contact (writer close).
    pub fn unpublish(&self) {
        if let Rendezvous::File { path } = self {
            if let Err(e) = fs::remove_file(path) {
                debug!("[Rendezvous::unpublish] {}: {}", path.display(), e);
            }
        }
    }
}

fn contact_file_path(dir: &Path, stream_name: &str) -> PathBuf {
    dir.join(format!("{}.sst", stream_name))
}

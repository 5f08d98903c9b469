// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 stagelink developers

//! Crate-wide error type.
//!
//! One enum covers every failure a public entry point can report, grouped by
//! origin. Protocol invariant violations (cohorts diverging in lock-step
//! assumptions) are deliberately NOT represented here -- those are hard
//! panics, because no local recovery is possible once cohorts disagree.

/// Errors returned by stagelink operations.
#[derive(Debug)]
pub enum Error {
    // ========================================================================
    // Configuration errors (reported at open/parse time, before any network
    // activity)
    // ========================================================================
    /// Unknown parameter name or unparsable parameter value.
    InvalidParam(String),
    /// Operation not valid for the stream's current state.
    InvalidState(String),

    // ========================================================================
    // Rendezvous / connection errors
    // ========================================================================
    /// No writer found at the expected rendezvous location.
    RendezvousFailed(String),
    /// Failed to connect to a peer endpoint.
    ConnectFailed(String),
    /// Failed to send a control message to a peer.
    SendFailed(String),
    /// A blocking wait exceeded its configured timeout.
    Timeout,

    // ========================================================================
    // Data / marshaling errors
    // ========================================================================
    /// Wire-format encode/decode failure.
    Codec(String),
    /// Variable name not present in the current timestep's metadata.
    UnknownVariable(String),
    /// Selection geometry does not match the variable (wrong dimensionality,
    /// selection outside the global shape).
    SelectionMismatch(String),
    /// A remote read failed (surfaced through the data plane's completion).
    ReadFailed(String),

    // ========================================================================
    // Other
    // ========================================================================
    /// I/O error with underlying cause (rendezvous file access, sockets).
    IoError(std::io::Error),
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Error::InvalidParam(msg) => write!(f, "Invalid parameter: {}", msg),
            Error::InvalidState(msg) => write!(f, "Invalid state: {}", msg),
            Error::RendezvousFailed(msg) => write!(f, "Rendezvous failed: {}", msg),
            Error::ConnectFailed(msg) => write!(f, "Connect failed: {}", msg),
            Error::SendFailed(msg) => write!(f, "Send failed: {}", msg),
            Error::Timeout => write!(f, "Operation timed out"),
            Error::Codec(msg) => write!(f, "Codec error: {}", msg),
            Error::UnknownVariable(name) => write!(f, "Unknown variable: {}", name),
            Error::SelectionMismatch(msg) => write!(f, "Selection mismatch: {}", msg),
            Error::ReadFailed(msg) => write!(f, "Remote read failed: {}", msg),
            Error::IoError(e) => write!(f, "I/O error: {}", e),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::IoError(e) => Some(e),
            _ => None,
        }
    }
}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        Error::IoError(e)
    }
}

/// Result alias used throughout the crate.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_variants() {
        assert_eq!(
            format!("{}", Error::InvalidParam("QueueLimit=abc".into())),
            "Invalid parameter: QueueLimit=abc"
        );
        assert_eq!(format!("{}", Error::Timeout), "Operation timed out");
        assert_eq!(
            format!("{}", Error::UnknownVariable("density".into())),
            "Unknown variable: density"
        );
    }

    #[test]
    fn io_error_source_preserved() {
        let err: Error = std::io::Error::new(std::io::ErrorKind::NotFound, "gone").into();
        assert!(std::error::Error::source(&err).is_some());
    }
}

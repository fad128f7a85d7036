//! Error taxonomy shared by the handler, the dispatcher and the transformers.

use std::fmt;
use std::io;
use thiserror::Error;

/// Bad request content.
///
/// Raised by transformers when a documented precondition is violated, and by
/// the framing layer when a request is malformed or too large. The handler
/// answers these with a `CLIENT_ERROR` line instead of dropping the client.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum InvalidInput {
    #[error("input is not valid UTF-8 at byte {0}")]
    Encoding(usize),

    #[error("request exceeds {limit} bytes")]
    TooLarge { limit: usize },

    #[error("invalid length header")]
    InvalidLength,

    #[error("{0}")]
    Rejected(String),
}

/// The I/O phase an error happened in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Read,
    Write,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Phase::Read => f.write_str("read"),
            Phase::Write => f.write_str("write"),
        }
    }
}

/// Why a connection handler ended in the `Error` state.
#[derive(Debug, Error)]
pub enum HandlerError {
    #[error("invalid input: {0}")]
    InvalidInput(#[from] InvalidInput),

    #[error("{phase} timed out after {timeout_ms}ms")]
    Timeout { phase: Phase, timeout_ms: u64 },

    #[error("transport error during {phase}: {source}")]
    Transport {
        phase: Phase,
        #[source]
        source: io::Error,
    },

    #[error("cancelled by shutdown")]
    Cancelled,
}

impl HandlerError {
    pub(crate) fn transport(phase: Phase, source: io::Error) -> Self {
        HandlerError::Transport { phase, source }
    }
}

/// A resource failed to release cleanly.
///
/// Only ever logged; it never replaces the outcome of the scope that owned
/// the resource.
#[derive(Debug, Error)]
#[error("failed to release {resource}: {source}")]
pub struct ReleaseError {
    pub resource: String,
    #[source]
    pub source: io::Error,
}

impl ReleaseError {
    pub fn new(resource: impl Into<String>, source: io::Error) -> Self {
        Self {
            resource: resource.into(),
            source,
        }
    }
}

/// Fatal listener errors, surfaced to the caller at startup.
#[derive(Debug, Error)]
pub enum ServeError {
    #[error("invalid bind address '{address}': {reason}")]
    Address { address: String, reason: String },

    #[error("failed to bind {address}: {source}")]
    Bind {
        address: String,
        #[source]
        source: io::Error,
    },

    #[error("unknown transformer '{0}'")]
    UnknownTransformer(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_messages() {
        let err = HandlerError::Timeout {
            phase: Phase::Read,
            timeout_ms: 250,
        };
        assert_eq!(err.to_string(), "read timed out after 250ms");

        let err: HandlerError = InvalidInput::TooLarge { limit: 16 }.into();
        assert_eq!(err.to_string(), "invalid input: request exceeds 16 bytes");

        let err = ReleaseError::new("conn-7", io::Error::other("boom"));
        assert_eq!(err.to_string(), "failed to release conn-7: boom");
    }
}

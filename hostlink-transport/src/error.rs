//! Error types for the connection layer.
//!
//! Errors fall in three propagation classes:
//! - **caller-local**: `Timeout`, `Interrupted`, `Codec`, `CorrelationIdsExhausted`
//!   affect one request only
//! - **connection-wide**: `Io` tears the connection down; every other waiter
//!   then sees `ConnectionLost`
//! - **open-time**: `Connect`, `Authentication` end one open attempt, which may
//!   be retried with fresh parameters

use std::io;
use std::time::Duration;

use hostlink_core::{CodecError, ConfigurationError};
use thiserror::Error;

use crate::wire::WireError;

/// Errors surfaced by [`ServiceConnection`](crate::ServiceConnection) operations.
#[derive(Debug, Error)]
pub enum ServerError {
    /// Unknown service, wire code or conflicting prototype.
    #[error("configuration error: {0}")]
    Configuration(#[from] ConfigurationError),

    /// The transport could not be opened or the handshake did not complete.
    #[error("connection failed: {message}")]
    Connect {
        /// Details about the failure.
        message: String,
    },

    /// The host rejected the sign-on.
    #[error("authentication rejected (return code {return_code:#x}): {message}")]
    Authentication {
        /// Return code reported by the host.
        return_code: u32,
        /// Details reported by the handshake.
        message: String,
    },

    /// Reading from or writing to the transport failed mid-session.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// An inbound envelope could not be understood.
    #[error("protocol error: {message}")]
    Protocol {
        /// Details about the malformed envelope.
        message: String,
    },

    /// A request body could not be encoded.
    #[error("request encoding failed: {0}")]
    Codec(#[from] CodecError),

    /// No reply arrived before the deadline.
    #[error("no reply for correlation id {correlation_id} within {after:?}")]
    Timeout {
        /// Correlation id of the abandoned request.
        correlation_id: u32,
        /// The deadline that expired.
        after: Duration,
    },

    /// The caller interrupted the wait.
    #[error("wait for correlation id {correlation_id} interrupted")]
    Interrupted {
        /// Correlation id of the abandoned request.
        correlation_id: u32,
    },

    /// The connection was torn down while the request was pending.
    #[error("connection lost")]
    ConnectionLost,

    /// The connection is already closed.
    #[error("connection closed")]
    ConnectionClosed,

    /// Every correlation id in the configured space is outstanding.
    #[error("all {limit} correlation ids are outstanding")]
    CorrelationIdsExhausted {
        /// Size of the correlation id space.
        limit: u32,
    },
}

impl From<WireError> for ServerError {
    fn from(err: WireError) -> Self {
        ServerError::Protocol {
            message: err.to_string(),
        }
    }
}

impl ServerError {
    /// Whether this error is confined to the request that observed it.
    pub fn is_caller_local(&self) -> bool {
        matches!(
            self,
            ServerError::Timeout { .. }
                | ServerError::Interrupted { .. }
                | ServerError::Codec(_)
                | ServerError::CorrelationIdsExhausted { .. }
                | ServerError::Protocol { .. }
        )
    }
}

/// Result type for connection operations.
pub type ServerResult<T> = Result<T, ServerError>;

//! # Hostlink Transport Layer
//!
//! Connection layer for the service jobs of a remote host.
//!
//! This crate provides:
//! - **Wire format**: the 20-byte envelope header and frame splitting
//! - **ServiceConnection**: one shared stream per service, reference counted
//!   through leases, with correlation-id request/reply matching
//! - **ReplyRegistry**: discriminator → reply prototype tables
//! - **Handshake**: hooks for the attribute exchange and server start

#![deny(missing_docs)]
#![deny(clippy::unwrap_used)]

// Re-export core types for convenience
pub use hostlink_core::{
    CodecError, ConfigurationError, Credentials, HostAddress, HostAddressParseError,
    SecureChannelOptions, ServiceId, TokioTransportProvider, TransportProvider, TransportStream,
};

// =============================================================================
// Modules
// =============================================================================

/// Error types for connection operations.
pub mod error;

/// Envelope framing.
pub mod wire;

/// Message trait and decoded replies.
pub mod message;

/// Reply prototype registry.
pub mod registry;

/// Multiplexed service connections.
pub mod connection;

// =============================================================================
// Public API Re-exports
// =============================================================================

// Error exports
pub use error::{ServerError, ServerResult};

// Wire format exports
pub use wire::{
    encode_frame, try_split_frame, EnvelopeHeader, WireError, DEFAULT_MAX_FRAME_SIZE, HEADER_SIZE,
};

// Message exports
pub use message::{AsAny, DecodeReply, Message, Reply};

// Registry exports
pub use registry::{ReplyPrototype, ReplyRegistry, ReplyRegistryBuilder};

// Connection exports
pub use connection::{
    ConnectionBuilder, ConnectionConfig, ConnectionLease, ConnectionMetrics, ConnectionState,
    Handshake, HandshakeError, Interrupter, PendingReply, ServiceConnection,
};

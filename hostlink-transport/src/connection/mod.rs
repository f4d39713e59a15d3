//! Multiplexed service connections.
//!
//! A [`ServiceConnection`] is one physical stream to one service job, shared
//! by every caller that attached to it.
//!
//! # Request path
//!
//! ```text
//! caller ──register id──► PendingTable ◄──take id── dispatcher
//!   │                                                   ▲
//!   └──write frame (async mutex)──► stream ──read──────┘
//! ```
//!
//! The writer lock is held for one frame only; callers wait on a oneshot
//! after it is released. Exactly one dispatcher task reads the stream.
//!
//! # Lifecycle
//!
//! ```text
//! ┌──────┐  last detach / force_disconnect / I/O error  ┌─────────┐        ┌────────┐
//! │ Open ├─────────────────────────────────────────────►│ Closing ├───────►│ Closed │
//! └──────┘                                              └─────────┘        └────────┘
//! ```
//!
//! While `Closing`, every pending wait fails with `ConnectionLost`. Nothing
//! leaves `Closed`.

/// Opening a connection with a handshake
pub mod builder;

/// Configuration structures for connection behavior
pub mod config;

/// Service connection and its state
pub mod core;

mod dispatcher;

/// Handshake hooks
pub mod handshake;

/// Scoped attach token
pub mod lease;

/// Metrics collection
pub mod metrics;

mod pending;

/// Caller-side reply handles
pub mod reply;

pub use builder::ConnectionBuilder;
pub use config::ConnectionConfig;
pub use self::core::{ConnectionState, ServiceConnection};
pub use handshake::{Handshake, HandshakeError};
pub use lease::ConnectionLease;
pub use metrics::ConnectionMetrics;
pub use reply::{Interrupter, PendingReply};

//! # Hostlink
//!
//! Multiplexed connections to the service jobs of a remote host.
//!
//! Many independent operations, from any number of tasks, share one physical
//! connection per service. Replies are matched to requests by correlation id,
//! rebuilt through per-service reply prototypes, and handed to the caller that
//! is waiting for them.
//!
//! ## Crate Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │              hostlink (this crate)                          │
//! │   Re-exports both crates + prelude                          │
//! ├─────────────────────────────────────────────────────────────┤
//! │              hostlink-transport                             │
//! │  • Envelope wire format                                     │
//! │  • ServiceConnection, leases, dispatcher                    │
//! │  • Reply prototype registry, handshake hooks                │
//! ├─────────────────────────────────────────────────────────────┤
//! │              hostlink-core                                  │
//! │  Service directory, transport provider, address types       │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```ignore
//! use hostlink::prelude::*;
//!
//! let lease = ConnectionBuilder::new(ServiceId::DataQueue)
//!     .address(HostAddress::for_service("sys1", ServiceId::DataQueue, false))
//!     .credentials(Credentials::new("QUSER", "secret"))
//!     .open(&TokioTransportProvider::new(), &MyHandshake)
//!     .await?;
//!
//! let reply = lease.send_and_receive(&mut request).await?;
//! let read = reply.downcast_ref::<ReadReply>();
//! ```
//!
//! See `examples/loopback.rs` for a runnable client and scripted host.

#![deny(missing_docs)]

// Re-export all public items from sub-crates
pub use hostlink_core::*;
pub use hostlink_transport::*;

/// The types most programs need.
pub mod prelude {
    pub use hostlink_core::{
        Credentials, HostAddress, SecureChannelOptions, ServiceId, TokioTransportProvider,
        TransportProvider,
    };
    pub use hostlink_transport::{
        registry::global, ConnectionBuilder, ConnectionConfig, ConnectionLease, DecodeReply,
        EnvelopeHeader, Handshake, HandshakeError, Message, PendingReply, Reply, ReplyPrototype,
        ReplyRegistry, ReplyRegistryBuilder, ServerError, ServerResult, ServiceConnection,
    };
}

//! # hostlink-core
//!
//! Core abstractions shared by every hostlink crate.
//!
//! - **Service directory**: the total, injective mapping between service names,
//!   [`ServiceId`] values and the numeric server ids carried on the wire
//! - **Transport provider**: how a duplex byte stream to a service job is obtained
//! - **Core types**: [`HostAddress`], [`Credentials`], [`SecureChannelOptions`]
//! - **Codec errors**: what hand-written message body codecs report
//!
//! ## Service Directory
//!
//! ```
//! use hostlink_core::{ServiceId, service_id_for, wire_code_for};
//!
//! let id = service_id_for("as-database").expect("known service");
//! assert_eq!(id, ServiceId::Database);
//! assert_eq!(wire_code_for(id), 0xE004);
//! ```
//!
//! Unknown names and codes are always a [`ConfigurationError`]: a silent default
//! would route traffic to an unrelated service job.

#![deny(missing_docs)]
#![deny(clippy::unwrap_used)]

mod codec;
mod directory;
mod error;
mod transport;
mod types;

// Codec exports
pub use codec::CodecError;

// Directory exports
pub use directory::{
    ServiceId, name_for, service_id_for, service_id_for_index, service_id_for_wire_code,
    wire_code_for,
};

// Error exports
pub use error::ConfigurationError;

// Transport provider exports
pub use transport::{TokioTransportProvider, TransportProvider, TransportStream};

// Core type exports
pub use types::{Credentials, HostAddress, HostAddressParseError, SecureChannelOptions};

//! Service directory: names, identifiers and wire codes of host service jobs.
//!
//! Every service job on the host is reachable under three spellings:
//!
//! | service | name | server id | index | port | TLS port |
//! |---------|------|-----------|-------|------|----------|
//! | [`ServiceId::File`] | `as-file` | `0xE002` | 0 | 8473 | 9473 |
//! | [`ServiceId::Print`] | `as-netprt` | `0xE003` | 1 | 8474 | 9474 |
//! | [`ServiceId::Command`] | `as-rmtcmd` | `0xE008` | 2 | 8475 | 9475 |
//! | [`ServiceId::DataQueue`] | `as-dtaq` | `0xE007` | 3 | 8472 | 9472 |
//! | [`ServiceId::Database`] | `as-database` | `0xE004` | 4 | 8471 | 9471 |
//! | [`ServiceId::RecordAccess`] | `as-ddm` | `0xD000` | 5 | 446 | 448 |
//! | [`ServiceId::Central`] | `as-central` | `0xE000` | 6 | 8470 | 9470 |
//! | [`ServiceId::SignOn`] | `as-signon` | `0xE009` | 7 | 8476 | 9476 |
//! | [`ServiceId::HostConnection`] | `as-hostcnn` | `0xE00B` | 8 | 8480 | 9480 |
//!
//! The mapping is total and injective in every direction. The database job
//! additionally answers under `0xE005` and `0xE006`; those codes are accepted on
//! inbound envelopes (see [`ServiceId::accepts_wire_code`]) but never appear
//! in the inverse lookup.

use std::fmt;
use std::str::FromStr;

use crate::ConfigurationError;

/// Identifier of a logical service job on the host.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ServiceId {
    /// Central server: licensing, code page tables.
    Central,
    /// Integrated file system server.
    File,
    /// Network print server.
    Print,
    /// Database server (SQL, native database, catalog).
    Database,
    /// Data queue server.
    DataQueue,
    /// Remote command and program call server.
    Command,
    /// Sign-on server: authentication and profile tokens.
    SignOn,
    /// Host connection server.
    HostConnection,
    /// Record level access (DDM) server.
    RecordAccess,
}

/// Auxiliary server ids of the database job: native database and catalog.
const DATABASE_AUXILIARY_CODES: [u16; 2] = [0xE005, 0xE006];

impl ServiceId {
    /// Every service, ordered by service index.
    pub const ALL: [ServiceId; 9] = [
        ServiceId::File,
        ServiceId::Print,
        ServiceId::Command,
        ServiceId::DataQueue,
        ServiceId::Database,
        ServiceId::RecordAccess,
        ServiceId::Central,
        ServiceId::SignOn,
        ServiceId::HostConnection,
    ];

    /// Symbolic service name, as used in port mapping.
    pub const fn name(self) -> &'static str {
        match self {
            ServiceId::Central => "as-central",
            ServiceId::File => "as-file",
            ServiceId::Print => "as-netprt",
            ServiceId::Database => "as-database",
            ServiceId::DataQueue => "as-dtaq",
            ServiceId::Command => "as-rmtcmd",
            ServiceId::SignOn => "as-signon",
            ServiceId::HostConnection => "as-hostcnn",
            ServiceId::RecordAccess => "as-ddm",
        }
    }

    /// Primary server id carried in every envelope header.
    pub const fn wire_code(self) -> u16 {
        match self {
            ServiceId::Central => 0xE000,
            ServiceId::File => 0xE002,
            ServiceId::Print => 0xE003,
            ServiceId::Database => 0xE004,
            ServiceId::DataQueue => 0xE007,
            ServiceId::Command => 0xE008,
            ServiceId::SignOn => 0xE009,
            ServiceId::HostConnection => 0xE00B,
            ServiceId::RecordAccess => 0xD000,
        }
    }

    /// Service constant, the position in [`ServiceId::ALL`].
    pub const fn index(self) -> u8 {
        match self {
            ServiceId::File => 0,
            ServiceId::Print => 1,
            ServiceId::Command => 2,
            ServiceId::DataQueue => 3,
            ServiceId::Database => 4,
            ServiceId::RecordAccess => 5,
            ServiceId::Central => 6,
            ServiceId::SignOn => 7,
            ServiceId::HostConnection => 8,
        }
    }

    /// Default port of the plain-text listener.
    pub const fn default_port(self) -> u16 {
        match self {
            ServiceId::File => 8473,
            ServiceId::Print => 8474,
            ServiceId::Command => 8475,
            ServiceId::DataQueue => 8472,
            ServiceId::Database => 8471,
            ServiceId::RecordAccess => 446,
            ServiceId::Central => 8470,
            ServiceId::SignOn => 8476,
            ServiceId::HostConnection => 8480,
        }
    }

    /// Default port of the TLS listener.
    pub const fn default_tls_port(self) -> u16 {
        match self {
            ServiceId::File => 9473,
            ServiceId::Print => 9474,
            ServiceId::Command => 9475,
            ServiceId::DataQueue => 9472,
            ServiceId::Database => 9471,
            ServiceId::RecordAccess => 448,
            ServiceId::Central => 9470,
            ServiceId::SignOn => 9476,
            ServiceId::HostConnection => 9480,
        }
    }

    /// Whether an inbound envelope with this server id belongs to this service.
    pub fn accepts_wire_code(self, code: u16) -> bool {
        code == self.wire_code()
            || (self == ServiceId::Database && DATABASE_AUXILIARY_CODES.contains(&code))
    }
}

impl fmt::Display for ServiceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for ServiceId {
    type Err = ConfigurationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        service_id_for(s)
    }
}

/// Look up a service by its symbolic name.
///
/// # Errors
///
/// Returns [`ConfigurationError::UnknownServiceName`] for any other name.
pub fn service_id_for(name: &str) -> Result<ServiceId, ConfigurationError> {
    ServiceId::ALL
        .into_iter()
        .find(|id| id.name() == name)
        .ok_or_else(|| ConfigurationError::UnknownServiceName {
            name: name.to_string(),
        })
}

/// Symbolic name of a service.
pub fn name_for(id: ServiceId) -> &'static str {
    id.name()
}

/// Primary wire code of a service.
pub fn wire_code_for(id: ServiceId) -> u16 {
    id.wire_code()
}

/// Look up a service by its primary wire code.
///
/// # Errors
///
/// Returns [`ConfigurationError::UnknownWireCode`] for any other code,
/// including the database auxiliary codes.
pub fn service_id_for_wire_code(code: u16) -> Result<ServiceId, ConfigurationError> {
    ServiceId::ALL
        .into_iter()
        .find(|id| id.wire_code() == code)
        .ok_or(ConfigurationError::UnknownWireCode { code })
}

/// Look up a service by its service constant.
///
/// # Errors
///
/// Returns [`ConfigurationError::UnknownServiceIndex`] when `index` is out of range.
pub fn service_id_for_index(index: u8) -> Result<ServiceId, ConfigurationError> {
    ServiceId::ALL
        .get(usize::from(index))
        .copied()
        .ok_or(ConfigurationError::UnknownServiceIndex { index })
}

//! Core types for reaching a service job.
//!
//! - [`HostAddress`]: host name or IP literal + port
//! - [`Credentials`]: user profile and password presented at sign-on
//! - [`SecureChannelOptions`]: opaque parameters handed to a secure transport

use std::fmt;
use std::net::IpAddr;

use serde::{Deserialize, Serialize};

use crate::ServiceId;

/// Address of a service job listener.
///
/// # Examples
///
/// ```
/// use hostlink_core::{HostAddress, ServiceId};
///
/// let addr = HostAddress::for_service("sys1.example.com", ServiceId::SignOn, false);
/// assert_eq!(addr.to_string(), "sys1.example.com:8476");
///
/// let addr = HostAddress::parse("[::1]:9471").expect("ipv6 literal");
/// assert_eq!(addr.port, 9471);
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct HostAddress {
    /// Host name or IP literal, without brackets.
    pub host: String,
    /// Port number.
    pub port: u16,
}

impl HostAddress {
    /// Create a new address.
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }

    /// Address of a service's default listener on `host`.
    pub fn for_service(host: impl Into<String>, service: ServiceId, tls: bool) -> Self {
        let port = if tls {
            service.default_tls_port()
        } else {
            service.default_port()
        };
        Self::new(host, port)
    }

    /// Parse from `host:port`, accepting `[v6]:port` for IPv6 literals.
    ///
    /// # Errors
    ///
    /// Returns error if the host is empty or the port cannot be parsed.
    pub fn parse(s: &str) -> Result<Self, HostAddressParseError> {
        if let Some(rest) = s.strip_prefix('[') {
            let (ip_str, tail) = rest
                .split_once(']')
                .ok_or(HostAddressParseError::InvalidHost)?;
            ip_str
                .parse::<IpAddr>()
                .map_err(|_| HostAddressParseError::InvalidHost)?;
            let port_str = tail
                .strip_prefix(':')
                .ok_or(HostAddressParseError::MissingPort)?;
            let port = port_str
                .parse()
                .map_err(|_| HostAddressParseError::InvalidPort)?;
            return Ok(Self::new(ip_str, port));
        }

        let (host, port_str) = s
            .rsplit_once(':')
            .ok_or(HostAddressParseError::MissingPort)?;
        if host.is_empty() || host.contains(':') {
            return Err(HostAddressParseError::InvalidHost);
        }
        let port = port_str
            .parse()
            .map_err(|_| HostAddressParseError::InvalidPort)?;
        Ok(Self::new(host, port))
    }
}

impl fmt::Display for HostAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.host.contains(':') {
            write!(f, "[{}]:{}", self.host, self.port)
        } else {
            write!(f, "{}:{}", self.host, self.port)
        }
    }
}

/// Error parsing a host address from string.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum HostAddressParseError {
    /// The host part is empty or malformed.
    #[error("invalid host")]
    InvalidHost,
    /// The port could not be parsed.
    #[error("invalid port")]
    InvalidPort,
    /// No `:port` suffix.
    #[error("missing port")]
    MissingPort,
}

/// User profile and password presented during the handshake.
#[derive(Clone, PartialEq, Eq)]
pub struct Credentials {
    /// User profile name.
    pub user: String,
    password: String,
}

impl Credentials {
    /// Create credentials.
    pub fn new(user: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            user: user.into(),
            password: password.into(),
        }
    }

    /// Password in clear; only handshakes should read it.
    pub fn password(&self) -> &str {
        &self.password
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("user", &self.user)
            .field("password", &"<redacted>")
            .finish()
    }
}

/// Parameters of a secure channel, passed through to the transport provider.
///
/// The connection layer never inspects these; a TLS-capable provider decides
/// what each field means.
#[derive(Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SecureChannelOptions {
    /// Name to verify the server certificate against, if not the host name.
    pub server_name: Option<String>,
    /// Name of the key ring holding trusted certificates.
    pub key_ring_name: Option<String>,
    /// Password of the key ring.
    pub key_ring_password: Option<String>,
    /// Inline key ring contents.
    pub key_ring_data: Option<String>,
}

impl fmt::Debug for SecureChannelOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SecureChannelOptions")
            .field("server_name", &self.server_name)
            .field("key_ring_name", &self.key_ring_name)
            .field(
                "key_ring_password",
                &self.key_ring_password.as_ref().map(|_| "<redacted>"),
            )
            .field("key_ring_data", &self.key_ring_data.as_ref().map(String::len))
            .finish()
    }
}

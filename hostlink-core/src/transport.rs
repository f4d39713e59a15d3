//! Transport provider abstraction.
//!
//! A service connection only needs a duplex byte stream. How that stream is
//! produced (plain TCP, TLS, an in-process pipe) is the provider's business;
//! secure-channel negotiation happens entirely inside [`TransportProvider::connect`].

use std::io;
use std::net::SocketAddr;

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncWrite};

use crate::{HostAddress, SecureChannelOptions};

/// Byte stream a connection can split into a reader and a writer.
pub trait TransportStream: AsyncRead + AsyncWrite + Send + Unpin + 'static {}

impl<T> TransportStream for T where T: AsyncRead + AsyncWrite + Send + Unpin + 'static {}

/// Provider trait for opening duplex streams to service jobs.
///
/// Clone allows one provider to be shared by every connection of a host.
#[async_trait]
pub trait TransportProvider: Clone + Send + Sync + 'static {
    /// The stream type this provider produces.
    type Stream: TransportStream;

    /// Open a stream to `address`.
    ///
    /// When `secure` is set, the returned stream must already be encrypted.
    async fn connect(
        &self,
        address: &HostAddress,
        secure: Option<&SecureChannelOptions>,
    ) -> io::Result<Self::Stream>;

    /// Local socket address of an opened stream, when the stream has one.
    fn local_address(&self, _stream: &Self::Stream) -> Option<SocketAddr> {
        None
    }
}

/// Plain TCP provider using Tokio.
#[derive(Debug, Clone, Default)]
pub struct TokioTransportProvider {
    nodelay: bool,
}

impl TokioTransportProvider {
    /// Create a new Tokio transport provider with Nagle enabled.
    pub fn new() -> Self {
        Self::default()
    }

    /// Disable Nagle's algorithm on every stream.
    pub fn with_nodelay(mut self, nodelay: bool) -> Self {
        self.nodelay = nodelay;
        self
    }
}

#[async_trait]
impl TransportProvider for TokioTransportProvider {
    type Stream = tokio::net::TcpStream;

    async fn connect(
        &self,
        address: &HostAddress,
        secure: Option<&SecureChannelOptions>,
    ) -> io::Result<Self::Stream> {
        if secure.is_some() {
            return Err(io::Error::new(
                io::ErrorKind::Unsupported,
                "plain TCP provider cannot negotiate a secure channel",
            ));
        }
        let stream = tokio::net::TcpStream::connect((address.host.as_str(), address.port)).await?;
        stream.set_nodelay(self.nodelay)?;
        Ok(stream)
    }

    fn local_address(&self, stream: &Self::Stream) -> Option<SocketAddr> {
        stream.local_addr().ok()
    }
}

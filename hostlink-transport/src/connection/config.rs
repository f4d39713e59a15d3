//! Configuration structures for connection behavior.

use std::time::Duration;

use crate::wire::DEFAULT_MAX_FRAME_SIZE;

/// Configuration for one service connection.
#[derive(Clone, Debug)]
pub struct ConnectionConfig {
    /// Timeout for opening the transport and completing the handshake
    pub connect_timeout: Duration,

    /// Default deadline for a reply.
    ///
    /// None waits until the reply arrives or the connection goes down.
    pub reply_timeout: Option<Duration>,

    /// Largest frame accepted or produced, header included.
    ///
    /// An inbound length field above this is treated as a corrupted stream.
    pub max_frame_size: usize,

    /// Bytes requested from the transport per read
    pub read_buffer_size: usize,

    /// Highest correlation id handed out before the counter wraps to 1
    pub correlation_id_limit: u32,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(30),
            reply_timeout: None,
            max_frame_size: DEFAULT_MAX_FRAME_SIZE,
            read_buffer_size: 8 * 1024,
            correlation_id_limit: u32::MAX,
        }
    }
}

impl ConnectionConfig {
    /// Create a new configuration with specified parameters.
    pub fn new(
        connect_timeout: Duration,
        reply_timeout: Option<Duration>,
        max_frame_size: usize,
    ) -> Self {
        Self {
            connect_timeout,
            reply_timeout,
            max_frame_size,
            ..Self::default()
        }
    }

    /// Set the connect timeout.
    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// Set the default reply deadline.
    pub fn with_reply_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.reply_timeout = timeout;
        self
    }

    /// Set the frame size bound.
    pub fn with_max_frame_size(mut self, max_frame_size: usize) -> Self {
        self.max_frame_size = max_frame_size;
        self
    }

    /// Set the read buffer size.
    pub fn with_read_buffer_size(mut self, read_buffer_size: usize) -> Self {
        self.read_buffer_size = read_buffer_size.max(1);
        self
    }

    /// Bound the correlation id space to `1..=limit`.
    ///
    /// A limit of zero is raised to one.
    pub fn with_correlation_id_limit(mut self, limit: u32) -> Self {
        self.correlation_id_limit = limit.max(1);
        self
    }

    /// Create a configuration for low-latency local networking.
    pub fn local_network() -> Self {
        Self {
            connect_timeout: Duration::from_secs(2),
            reply_timeout: Some(Duration::from_secs(30)),
            ..Self::default()
        }
    }

    /// Create a configuration for high-latency WAN networking.
    pub fn wan_network() -> Self {
        Self {
            connect_timeout: Duration::from_secs(60),
            reply_timeout: None,
            read_buffer_size: 64 * 1024,
            ..Self::default()
        }
    }
}

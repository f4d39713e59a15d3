//! Shared fixtures: a small request/reply protocol and a scripted host.

#![allow(dead_code)]

use std::time::Duration;

use hostlink_transport::{
    encode_frame, try_split_frame, CodecError, ConnectionConfig, ConnectionLease, DecodeReply,
    EnvelopeHeader, Message, ReplyRegistry, ReplyRegistryBuilder, ServiceConnection, ServiceId,
    DEFAULT_MAX_FRAME_SIZE, HEADER_SIZE,
};
use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream};

pub const SERVICE: ServiceId = ServiceId::Command;
pub const PING: u16 = 0x1001;
pub const PONG: u16 = 0x8001;
pub const UNREGISTERED: u16 = 0x80FF;

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "warn".into()),
        )
        .with_test_writer()
        .try_init();
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Ping {
    pub correlation_id: u32,
    pub value: u32,
}

impl Ping {
    pub fn new(value: u32) -> Self {
        Self {
            correlation_id: 0,
            value,
        }
    }
}

impl Message for Ping {
    fn request_reply_id(&self) -> u16 {
        PING
    }

    fn template_length(&self) -> u16 {
        4
    }

    fn correlation_id(&self) -> u32 {
        self.correlation_id
    }

    fn set_correlation_id(&mut self, correlation_id: u32) {
        self.correlation_id = correlation_id;
    }

    fn encode_body(&self, out: &mut Vec<u8>) -> Result<(), CodecError> {
        out.extend_from_slice(&self.value.to_be_bytes());
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Pong {
    pub correlation_id: u32,
    pub value: u32,
}

impl Message for Pong {
    fn request_reply_id(&self) -> u16 {
        PONG
    }

    fn correlation_id(&self) -> u32 {
        self.correlation_id
    }

    fn set_correlation_id(&mut self, correlation_id: u32) {
        self.correlation_id = correlation_id;
    }

    fn encode_body(&self, out: &mut Vec<u8>) -> Result<(), CodecError> {
        out.extend_from_slice(&self.value.to_be_bytes());
        Ok(())
    }
}

impl DecodeReply for Pong {
    fn decode(header: &EnvelopeHeader, body: &[u8]) -> Result<Self, CodecError> {
        CodecError::require(body, 4)?;
        Ok(Self {
            correlation_id: header.correlation_id,
            value: u32::from_be_bytes([body[0], body[1], body[2], body[3]]),
        })
    }
}

pub fn registry() -> ReplyRegistry {
    let mut builder = ReplyRegistryBuilder::new();
    builder
        .register_type::<Pong>(SERVICE, PONG)
        .expect("register pong");
    builder.build()
}

/// A request as the host saw it.
#[derive(Debug, Clone)]
pub struct Received {
    pub header: EnvelopeHeader,
    pub body: Vec<u8>,
}

impl Received {
    pub fn value(&self) -> u32 {
        u32::from_be_bytes([self.body[0], self.body[1], self.body[2], self.body[3]])
    }
}

/// Host end of the duplex stream.
pub struct FakeHost {
    stream: DuplexStream,
    buffer: Vec<u8>,
}

impl FakeHost {
    pub fn new(stream: DuplexStream) -> Self {
        Self {
            stream,
            buffer: Vec::new(),
        }
    }

    /// Next request frame, or None at end of stream.
    pub async fn next_request(&mut self) -> Option<Received> {
        loop {
            if let Some((header, consumed)) =
                try_split_frame(&self.buffer, DEFAULT_MAX_FRAME_SIZE).expect("valid frame")
            {
                let body = self.buffer[HEADER_SIZE..consumed].to_vec();
                self.buffer.drain(..consumed);
                return Some(Received { header, body });
            }
            let mut chunk = [0u8; 1024];
            let n = self.stream.read(&mut chunk).await.ok()?;
            if n == 0 {
                return None;
            }
            self.buffer.extend_from_slice(&chunk[..n]);
        }
    }

    pub async fn expect_request(&mut self) -> Received {
        tokio::time::timeout(Duration::from_secs(5), self.next_request())
            .await
            .expect("request within 5s")
            .expect("stream open")
    }

    /// Whether the client closed its end within a second.
    pub async fn sees_end_of_stream(&mut self) -> bool {
        matches!(
            tokio::time::timeout(Duration::from_secs(1), self.next_request()).await,
            Ok(None)
        )
    }

    pub async fn send_frame(&mut self, header: EnvelopeHeader, body: &[u8]) {
        let frame = encode_frame(header, body, DEFAULT_MAX_FRAME_SIZE).expect("encode frame");
        self.send_raw(&frame).await;
    }

    pub async fn send_raw(&mut self, bytes: &[u8]) {
        self.stream.write_all(bytes).await.expect("host write");
        self.stream.flush().await.expect("host flush");
    }

    pub async fn pong(&mut self, correlation_id: u32, value: u32) {
        self.send_frame(pong_header(correlation_id), &value.to_be_bytes()).await;
    }
}

pub fn pong_header(correlation_id: u32) -> EnvelopeHeader {
    EnvelopeHeader {
        server_id: SERVICE.wire_code(),
        correlation_id,
        request_reply_id: PONG,
        ..Default::default()
    }
}

pub fn open_with(config: ConnectionConfig) -> (ConnectionLease, FakeHost) {
    init_tracing();
    let (client, host) = tokio::io::duplex(64 * 1024);
    let lease = ServiceConnection::from_stream(SERVICE, client, registry(), config);
    (lease, FakeHost::new(host))
}

pub fn open() -> (ConnectionLease, FakeHost) {
    open_with(ConnectionConfig::default())
}

/// Poll `condition` until it holds or a second passes.
pub async fn eventually(mut condition: impl FnMut() -> bool) -> bool {
    for _ in 0..100 {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    condition()
}

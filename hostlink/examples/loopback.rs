//! Loopback Example: one shared connection, many concurrent callers.
//!
//! Starts a scripted data queue host on a local TCP port, opens a handshaken
//! connection to it, and issues requests from several tasks at once. The host
//! answers in reverse order; every caller still gets its own reply.
//!
//! ```bash
//! RUST_LOG=debug cargo run --example loopback
//! ```

use std::time::Duration;

use hostlink::prelude::*;
use hostlink::{encode_frame, try_split_frame, CodecError, DEFAULT_MAX_FRAME_SIZE, HEADER_SIZE};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

// ============================================================================
// Message Types
// ============================================================================

const EXCHANGE_ATTRIBUTES: u16 = 0x7003;
const EXCHANGE_ATTRIBUTES_REPLY: u16 = 0xF003;
const START_SERVER: u16 = 0x7002;
const START_SERVER_REPLY: u16 = 0xF002;
const ECHO: u16 = 0x1001;
const ECHO_REPLY: u16 = 0x8001;

fn put_string(out: &mut Vec<u8>, value: &str) {
    out.extend_from_slice(&(value.len() as u32).to_be_bytes());
    out.extend_from_slice(value.as_bytes());
}

fn get_string(body: &[u8], at: usize) -> Result<String, CodecError> {
    CodecError::require(body, at + 4)?;
    let len = u32::from_be_bytes([body[at], body[at + 1], body[at + 2], body[at + 3]]) as usize;
    CodecError::require(body, at + 4 + len)?;
    String::from_utf8(body[at + 4..at + 4 + len].to_vec())
        .map_err(|err| CodecError::malformed(err.to_string()))
}

#[derive(Debug, Default)]
struct ExchangeAttributes {
    correlation_id: u32,
}

impl Message for ExchangeAttributes {
    fn request_reply_id(&self) -> u16 {
        EXCHANGE_ATTRIBUTES
    }

    fn correlation_id(&self) -> u32 {
        self.correlation_id
    }

    fn set_correlation_id(&mut self, correlation_id: u32) {
        self.correlation_id = correlation_id;
    }

    fn encode_body(&self, out: &mut Vec<u8>) -> Result<(), CodecError> {
        // client datastream level
        out.extend_from_slice(&1u16.to_be_bytes());
        Ok(())
    }
}

#[derive(Debug)]
struct AttributesReply {
    correlation_id: u32,
    server_level: u16,
}

impl Message for AttributesReply {
    fn request_reply_id(&self) -> u16 {
        EXCHANGE_ATTRIBUTES_REPLY
    }

    fn correlation_id(&self) -> u32 {
        self.correlation_id
    }

    fn set_correlation_id(&mut self, correlation_id: u32) {
        self.correlation_id = correlation_id;
    }

    fn encode_body(&self, out: &mut Vec<u8>) -> Result<(), CodecError> {
        out.extend_from_slice(&self.server_level.to_be_bytes());
        Ok(())
    }
}

impl DecodeReply for AttributesReply {
    fn decode(header: &EnvelopeHeader, body: &[u8]) -> Result<Self, CodecError> {
        CodecError::require(body, 2)?;
        Ok(Self {
            correlation_id: header.correlation_id,
            server_level: u16::from_be_bytes([body[0], body[1]]),
        })
    }
}

#[derive(Debug)]
struct StartServer {
    correlation_id: u32,
    user: String,
}

impl Message for StartServer {
    fn request_reply_id(&self) -> u16 {
        START_SERVER
    }

    fn correlation_id(&self) -> u32 {
        self.correlation_id
    }

    fn set_correlation_id(&mut self, correlation_id: u32) {
        self.correlation_id = correlation_id;
    }

    fn encode_body(&self, out: &mut Vec<u8>) -> Result<(), CodecError> {
        put_string(out, &self.user);
        Ok(())
    }
}

#[derive(Debug)]
struct StartServerReply {
    correlation_id: u32,
    return_code: u32,
    job: String,
}

impl Message for StartServerReply {
    fn request_reply_id(&self) -> u16 {
        START_SERVER_REPLY
    }

    fn correlation_id(&self) -> u32 {
        self.correlation_id
    }

    fn set_correlation_id(&mut self, correlation_id: u32) {
        self.correlation_id = correlation_id;
    }

    fn encode_body(&self, out: &mut Vec<u8>) -> Result<(), CodecError> {
        out.extend_from_slice(&self.return_code.to_be_bytes());
        put_string(out, &self.job);
        Ok(())
    }
}

impl DecodeReply for StartServerReply {
    fn decode(header: &EnvelopeHeader, body: &[u8]) -> Result<Self, CodecError> {
        CodecError::require(body, 4)?;
        Ok(Self {
            correlation_id: header.correlation_id,
            return_code: u32::from_be_bytes([body[0], body[1], body[2], body[3]]),
            job: get_string(body, 4)?,
        })
    }
}

#[derive(Debug)]
struct Echo {
    correlation_id: u32,
    text: String,
}

impl Message for Echo {
    fn request_reply_id(&self) -> u16 {
        ECHO
    }

    fn correlation_id(&self) -> u32 {
        self.correlation_id
    }

    fn set_correlation_id(&mut self, correlation_id: u32) {
        self.correlation_id = correlation_id;
    }

    fn encode_body(&self, out: &mut Vec<u8>) -> Result<(), CodecError> {
        put_string(out, &self.text);
        Ok(())
    }
}

#[derive(Debug)]
struct EchoReply {
    correlation_id: u32,
    text: String,
}

impl Message for EchoReply {
    fn request_reply_id(&self) -> u16 {
        ECHO_REPLY
    }

    fn correlation_id(&self) -> u32 {
        self.correlation_id
    }

    fn set_correlation_id(&mut self, correlation_id: u32) {
        self.correlation_id = correlation_id;
    }

    fn encode_body(&self, out: &mut Vec<u8>) -> Result<(), CodecError> {
        put_string(out, &self.text);
        Ok(())
    }
}

impl DecodeReply for EchoReply {
    fn decode(header: &EnvelopeHeader, body: &[u8]) -> Result<Self, CodecError> {
        Ok(Self {
            correlation_id: header.correlation_id,
            text: get_string(body, 0)?,
        })
    }
}

// ============================================================================
// Handshake
// ============================================================================

struct DemoHandshake;

impl Handshake for DemoHandshake {
    fn reply_prototypes(&self) -> Vec<(u16, ReplyPrototype)> {
        vec![
            (EXCHANGE_ATTRIBUTES_REPLY, ReplyPrototype::of::<AttributesReply>()),
            (START_SERVER_REPLY, ReplyPrototype::of::<StartServerReply>()),
        ]
    }

    fn exchange_attributes(&self) -> Box<dyn Message> {
        Box::new(ExchangeAttributes::default())
    }

    fn check_attributes(&self, reply: &Reply) -> Result<(), HandshakeError> {
        match reply.downcast_ref::<AttributesReply>() {
            Some(attributes) if attributes.server_level >= 1 => Ok(()),
            Some(attributes) => Err(HandshakeError::Negotiation {
                message: format!("server level {} too old", attributes.server_level),
            }),
            None => Err(HandshakeError::Negotiation {
                message: "unexpected exchange attributes reply".to_string(),
            }),
        }
    }

    fn start_server(&self, credentials: &Credentials) -> Option<Box<dyn Message>> {
        Some(Box::new(StartServer {
            correlation_id: 0,
            user: credentials.user.clone(),
        }))
    }

    fn check_start_server(&self, reply: &Reply) -> Result<Option<String>, HandshakeError> {
        let Some(reply) = reply.downcast_ref::<StartServerReply>() else {
            return Err(HandshakeError::Negotiation {
                message: "unexpected start server reply".to_string(),
            });
        };
        if reply.return_code != 0 {
            return Err(HandshakeError::Rejected {
                return_code: reply.return_code,
                message: "start server refused".to_string(),
            });
        }
        Ok(Some(reply.job.clone()))
    }
}

// ============================================================================
// Scripted host
// ============================================================================

fn reply_frame(service: ServiceId, correlation_id: u32, reply: &dyn Message) -> Vec<u8> {
    let mut body = Vec::new();
    let _ = reply.encode_body(&mut body);
    let header = EnvelopeHeader {
        server_id: service.wire_code(),
        correlation_id,
        request_reply_id: reply.request_reply_id(),
        ..Default::default()
    };
    encode_frame(header, &body, DEFAULT_MAX_FRAME_SIZE).unwrap_or_default()
}

async fn run_host(listener: TcpListener) -> std::io::Result<()> {
    let (stream, peer) = listener.accept().await?;
    tracing::info!(peer = %peer, "host accepted connection");
    let (mut reader, mut writer) = stream.into_split();

    let (tx, mut rx) = mpsc::unbounded_channel::<Vec<u8>>();
    tokio::spawn(async move {
        while let Some(frame) = rx.recv().await {
            if writer.write_all(&frame).await.is_err() {
                break;
            }
        }
    });

    let service = ServiceId::DataQueue;
    let mut buffer = Vec::new();
    let mut chunk = [0u8; 4096];
    let mut echoes = 0u64;
    loop {
        let n = reader.read(&mut chunk).await?;
        if n == 0 {
            tracing::info!("host saw end of stream");
            return Ok(());
        }
        buffer.extend_from_slice(&chunk[..n]);

        while let Ok(Some((header, consumed))) = try_split_frame(&buffer, DEFAULT_MAX_FRAME_SIZE) {
            let body = buffer[HEADER_SIZE..consumed].to_vec();
            buffer.drain(..consumed);
            let id = header.correlation_id;

            match header.request_reply_id {
                EXCHANGE_ATTRIBUTES => {
                    let reply = AttributesReply {
                        correlation_id: id,
                        server_level: 2,
                    };
                    let _ = tx.send(reply_frame(service, id, &reply));
                }
                START_SERVER => {
                    let reply = StartServerReply {
                        correlation_id: id,
                        return_code: 0,
                        job: "123456/QUSER/QZHQSSRV".to_string(),
                    };
                    let _ = tx.send(reply_frame(service, id, &reply));
                }
                ECHO => {
                    // later requests are answered sooner
                    echoes += 1;
                    let delay = Duration::from_millis(200u64.saturating_sub(echoes * 20));
                    let text: String = get_string(&body, 0)
                        .unwrap_or_default()
                        .chars()
                        .rev()
                        .collect();
                    let tx = tx.clone();
                    tokio::spawn(async move {
                        tokio::time::sleep(delay).await;
                        let reply = EchoReply {
                            correlation_id: id,
                            text,
                        };
                        let _ = tx.send(reply_frame(service, id, &reply));
                    });
                }
                other => tracing::warn!(discriminator = other, "host ignored request"),
            }
        }
    }
}

// ============================================================================
// Main
// ============================================================================

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,hostlink_transport=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_target(false))
        .init();

    let listener = TcpListener::bind("127.0.0.1:0").await?;
    let port = listener.local_addr()?.port();
    let host = tokio::spawn(run_host(listener));

    let mut registry = ReplyRegistryBuilder::new();
    registry.register(ServiceId::DataQueue, ECHO_REPLY, ReplyPrototype::of::<EchoReply>())?;

    let lease = ConnectionBuilder::new(ServiceId::DataQueue)
        .address(HostAddress::new("127.0.0.1", port))
        .credentials(Credentials::new("QUSER", "secret"))
        .registry(registry.build())
        .config(ConnectionConfig::local_network())
        .open(&TokioTransportProvider::new().with_nodelay(true), &DemoHandshake)
        .await?;

    tracing::info!(
        connection_id = lease.connection_id(),
        job = %lease.job(),
        "connection open"
    );

    let mut callers = Vec::new();
    for i in 0..8 {
        let session = lease.attach()?;
        callers.push(tokio::spawn(async move {
            let mut request = Echo {
                correlation_id: 0,
                text: format!("request-{i}"),
            };
            let reply = session.send_and_receive(&mut request).await?;
            let text = reply
                .downcast_ref::<EchoReply>()
                .map(|echo| echo.text.clone())
                .unwrap_or_default();
            Ok::<_, ServerError>((i, request.correlation_id, text))
        }));
    }

    for caller in callers {
        let (i, correlation_id, text) = caller.await??;
        tracing::info!(caller = i, correlation_id, reply = %text, "caller got its reply");
    }

    let metrics = lease.metrics();
    tracing::info!(
        sent = metrics.requests_sent,
        delivered = metrics.replies_delivered,
        discarded = metrics.replies_discarded,
        "done"
    );

    lease.detach();
    host.await??;
    Ok(())
}

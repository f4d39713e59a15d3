//! Correlation dispatcher: the single reader of a connection.
//!
//! Reads the inbound stream into a buffer, splits complete frames, and routes
//! each reply to the caller that registered its correlation id. A frame that
//! cannot be routed is skipped and fails only the caller waiting on its
//! correlation id; the length prefix keeps the stream in sync.
//! Only an unusable length field, end of stream or a read error tear the
//! connection down.

use std::sync::Weak;

use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::sync::watch;

use super::core::{CloseReason, ConnectionInner};
use super::pending::Slot;
use crate::error::ServerError;
use crate::wire::{try_split_frame, EnvelopeHeader, WireError, HEADER_SIZE};

/// Dispatcher task body. Exits on shutdown or when the connection is gone.
pub(crate) async fn run<R>(
    connection: Weak<ConnectionInner>,
    mut reader: R,
    mut shutdown: watch::Receiver<bool>,
    read_buffer_size: usize,
) where
    R: AsyncRead + Unpin,
{
    let mut buffer = Vec::with_capacity(read_buffer_size);
    let mut chunk = vec![0u8; read_buffer_size.max(1)];

    loop {
        let read = tokio::select! {
            biased;
            _ = shutdown.wait_for(|closed| *closed) => break,
            read = reader.read(&mut chunk) => read,
        };
        let Some(inner) = connection.upgrade() else {
            break;
        };

        match read {
            Ok(0) => {
                tracing::debug!("end of stream");
                inner.close(CloseReason::EndOfStream);
                break;
            }
            Ok(n) => {
                inner.metrics.record_read(n);
                buffer.extend_from_slice(&chunk[..n]);
                if let Err(err) = drain_frames(&inner, &mut buffer) {
                    tracing::warn!(error = %err, "unrecoverable framing error");
                    inner.metrics.record_protocol_error();
                    inner.close(CloseReason::Corrupted);
                    break;
                }
            }
            Err(err) => {
                tracing::warn!(error = %err, "read failed");
                inner.close(CloseReason::ReadFailed);
                break;
            }
        }
    }
    if let Some(inner) = connection.upgrade() {
        inner.release_writer().await;
    }
    tracing::debug!("dispatcher stopped");
}

/// Route every complete frame in `buffer`, keeping any partial tail.
fn drain_frames(inner: &ConnectionInner, buffer: &mut Vec<u8>) -> Result<(), WireError> {
    let max_frame_size = inner.config.max_frame_size;
    let mut offset = 0;

    while let Some((header, consumed)) = try_split_frame(&buffer[offset..], max_frame_size)? {
        let body = &buffer[offset + HEADER_SIZE..offset + consumed];
        route(inner, &header, body);
        offset += consumed;
    }

    buffer.drain(..offset);
    Ok(())
}

fn route(inner: &ConnectionInner, header: &EnvelopeHeader, body: &[u8]) {
    let correlation_id = header.correlation_id;
    let discriminator = header.request_reply_id;

    if !inner.service.accepts_wire_code(header.server_id) {
        inner.metrics.record_protocol_error();
        tracing::warn!(
            correlation_id,
            server_id = header.server_id,
            "frame for another service skipped"
        );
        fail_waiter(
            inner,
            correlation_id,
            format!(
                "reply carries server id {:#06x}, expected {:#06x}",
                header.server_id,
                inner.service.wire_code()
            ),
        );
        return;
    }

    let Some(prototype) = inner.prototype_for(discriminator) else {
        inner.metrics.record_protocol_error();
        tracing::warn!(
            correlation_id,
            discriminator,
            "no reply prototype registered, frame skipped"
        );
        fail_waiter(
            inner,
            correlation_id,
            format!("no reply prototype for discriminator {discriminator:#06x}"),
        );
        return;
    };

    let tx = match inner.pending.take(correlation_id) {
        Some(Slot::Waiting { tx, .. }) => tx,
        Some(Slot::Discard { .. }) => {
            inner.metrics.record_discarded();
            tracing::debug!(correlation_id, discriminator, "reply discarded on arrival");
            return;
        }
        None => {
            inner.metrics.record_discarded();
            tracing::debug!(
                correlation_id,
                discriminator,
                "no pending request, reply discarded"
            );
            return;
        }
    };

    let result = match prototype.decode(header, body) {
        Ok(mut reply) => {
            reply.set_correlation_id(correlation_id);
            Ok(reply)
        }
        Err(err) => {
            inner.metrics.record_protocol_error();
            tracing::warn!(correlation_id, discriminator, error = %err, "reply decode failed");
            Err(ServerError::Protocol {
                message: format!(
                    "cannot decode {} for discriminator {:#06x}: {}",
                    prototype.type_name(),
                    discriminator,
                    err
                ),
            })
        }
    };

    let delivered = result.is_ok();
    if tx.send(result).is_err() {
        inner.metrics.record_discarded();
        tracing::debug!(correlation_id, "caller gone, reply discarded");
    } else if delivered {
        inner.metrics.record_delivered();
        tracing::debug!(correlation_id, discriminator, "reply delivered");
    }
}

/// Fail the caller waiting on `correlation_id`, if any, with a protocol error.
fn fail_waiter(inner: &ConnectionInner, correlation_id: u32, message: String) {
    match inner.pending.take(correlation_id) {
        Some(Slot::Waiting { tx, .. }) => {
            let _ = tx.send(Err(ServerError::Protocol { message }));
        }
        Some(Slot::Discard { .. }) => inner.metrics.record_discarded(),
        None => {}
    }
}

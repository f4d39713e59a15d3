//! Core service connection implementation.
//!
//! One [`ServiceConnection`] owns one duplex stream to one service job. The
//! stream is split: the read half belongs to the dispatcher task, the write
//! half sits behind an async mutex and carries one frame at a time. Replies
//! are matched to callers by correlation id through the pending table.

use std::collections::HashMap;
use std::fmt;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::atomic::{AtomicU32, AtomicU8, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use hostlink_core::{HostAddress, ServiceId, TransportStream};
use parking_lot::{Mutex, RwLock};
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::{watch, Mutex as AsyncMutex, MutexGuard as AsyncMutexGuard};
use tracing::Instrument;

use super::config::ConnectionConfig;
use super::dispatcher;
use super::lease::ConnectionLease;
use super::metrics::{ConnectionMetrics, MetricsRecorder};
use super::pending::{PendingTable, Registration};
use super::reply::PendingReply;
use crate::error::{ServerError, ServerResult};
use crate::message::{encode_message, Message, Reply};
use crate::registry::{ReplyPrototype, ReplyRegistry};

static NEXT_CONNECTION_ID: AtomicU32 = AtomicU32::new(1);

type BoxedWriter = Pin<Box<dyn AsyncWrite + Send>>;

/// Lifecycle of a connection. No transition leaves `Closed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// Requests may be issued.
    Open,
    /// Teardown in progress; pending waits are being failed.
    Closing,
    /// The transport is gone.
    Closed,
}

impl ConnectionState {
    const fn as_u8(self) -> u8 {
        match self {
            ConnectionState::Open => 0,
            ConnectionState::Closing => 1,
            ConnectionState::Closed => 2,
        }
    }

    const fn from_u8(value: u8) -> Self {
        match value {
            0 => ConnectionState::Open,
            1 => ConnectionState::Closing,
            _ => ConnectionState::Closed,
        }
    }
}

/// Why a connection is being torn down.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum CloseReason {
    /// The last lease was released.
    Released,
    /// `force_disconnect` was called.
    Forced,
    /// The host closed the stream.
    EndOfStream,
    /// Reading from the transport failed.
    ReadFailed,
    /// Writing to the transport failed.
    WriteFailed,
    /// A write was dropped with part of a frame on the wire.
    WriteAbandoned,
    /// An inbound length field cannot be trusted.
    Corrupted,
}

impl CloseReason {
    fn as_str(self) -> &'static str {
        match self {
            CloseReason::Released => "last lease released",
            CloseReason::Forced => "forced disconnect",
            CloseReason::EndOfStream => "end of stream",
            CloseReason::ReadFailed => "read failed",
            CloseReason::WriteFailed => "write failed",
            CloseReason::WriteAbandoned => "write abandoned mid-frame",
            CloseReason::Corrupted => "corrupted frame length",
        }
    }
}

/// Addresses known for a connection.
#[derive(Debug, Clone, Default)]
pub(crate) struct Endpoints {
    pub(crate) local: Option<SocketAddr>,
    pub(crate) peer: Option<HostAddress>,
}

pub(crate) struct ConnectionInner {
    pub(crate) connection_id: u32,
    pub(crate) service: ServiceId,
    pub(crate) config: ConnectionConfig,
    pub(crate) pending: PendingTable,
    pub(crate) metrics: MetricsRecorder,
    registry: ReplyRegistry,
    instance_prototypes: RwLock<HashMap<u16, ReplyPrototype>>,
    writer: AsyncMutex<Option<BoxedWriter>>,
    state: AtomicU8,
    references: AtomicUsize,
    job: RwLock<String>,
    exchange_attributes: Mutex<Option<Arc<Reply>>>,
    reply_timeout: Mutex<Option<Duration>>,
    shutdown: watch::Sender<bool>,
    endpoints: Endpoints,
}

impl ConnectionInner {
    pub(crate) fn state(&self) -> ConnectionState {
        ConnectionState::from_u8(self.state.load(Ordering::Acquire))
    }

    /// Instance prototypes first, then the shared registry.
    pub(crate) fn prototype_for(&self, discriminator: u16) -> Option<ReplyPrototype> {
        if let Some(prototype) = self.instance_prototypes.read().get(&discriminator) {
            return Some(*prototype);
        }
        self.registry.lookup(self.service, discriminator)
    }

    /// Tear the connection down once. Later calls return false.
    ///
    /// Never awaits the writer lock. A write holding it drops the writer when
    /// it lets go, and the dispatcher releases whatever is left on exit.
    pub(crate) fn close(&self, reason: CloseReason) -> bool {
        if self
            .state
            .compare_exchange(
                ConnectionState::Open.as_u8(),
                ConnectionState::Closing.as_u8(),
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_err()
        {
            return false;
        }

        let waiters = self.pending.close();
        if reason == CloseReason::Released {
            tracing::debug!(
                service = %self.service,
                connection_id = self.connection_id,
                pending = waiters.len(),
                reason = reason.as_str(),
                "closing connection"
            );
        } else {
            tracing::warn!(
                service = %self.service,
                connection_id = self.connection_id,
                pending = waiters.len(),
                reason = reason.as_str(),
                "disconnecting"
            );
        }
        for tx in waiters {
            let _ = tx.send(Err(ServerError::ConnectionLost));
        }

        self.shutdown.send_replace(true);
        if let Ok(mut writer) = self.writer.try_lock() {
            writer.take();
        }

        self.metrics.record_close();
        self.state
            .store(ConnectionState::Closed.as_u8(), Ordering::Release);
        true
    }

    /// Whether teardown has started.
    fn is_shutting_down(&self) -> bool {
        *self.shutdown.borrow() || self.state() != ConnectionState::Open
    }

    /// Drop the write half once any write holding it lets go.
    ///
    /// Called by the dispatcher on exit; with the read half gone too, the
    /// transport is closed.
    pub(crate) async fn release_writer(&self) {
        self.writer.lock().await.take();
    }
}

/// Holds the writer for one frame; tears the connection down if dropped
/// before the frame is complete.
struct InFlightWrite<'a> {
    writer: AsyncMutexGuard<'a, Option<BoxedWriter>>,
    inner: &'a ConnectionInner,
    finished: bool,
}

impl Drop for InFlightWrite<'_> {
    fn drop(&mut self) {
        if !self.finished {
            self.writer.take();
            self.inner.close(CloseReason::WriteAbandoned);
        } else if self.inner.is_shutting_down() {
            // teardown ran while this write held the lock
            self.writer.take();
        }
    }
}

async fn write_all_and_flush(writer: &mut BoxedWriter, frame: &[u8]) -> std::io::Result<()> {
    writer.write_all(frame).await?;
    writer.flush().await
}

/// A shared, multiplexed connection to one service job.
///
/// Cloning is cheap and does not change the reference count; only
/// [`attach`](Self::attach) does. Any number of tasks may issue requests
/// concurrently.
#[derive(Clone)]
pub struct ServiceConnection {
    pub(crate) inner: Arc<ConnectionInner>,
}

impl ServiceConnection {
    /// Wrap a pre-established duplex stream and start its dispatcher.
    ///
    /// No handshake is performed. The returned lease holds the first
    /// reference.
    ///
    /// # Panics
    ///
    /// Panics if called outside a Tokio runtime.
    pub fn from_stream<S: TransportStream>(
        service: ServiceId,
        stream: S,
        registry: ReplyRegistry,
        config: ConnectionConfig,
    ) -> ConnectionLease {
        Self::spawn(service, stream, registry, config, Endpoints::default())
    }

    pub(crate) fn spawn<S: TransportStream>(
        service: ServiceId,
        stream: S,
        registry: ReplyRegistry,
        config: ConnectionConfig,
        endpoints: Endpoints,
    ) -> ConnectionLease {
        let (reader, writer) = tokio::io::split(stream);
        let (shutdown, shutdown_rx) = watch::channel(false);
        let connection_id = NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed);
        let read_buffer_size = config.read_buffer_size;

        let inner = Arc::new(ConnectionInner {
            connection_id,
            service,
            pending: PendingTable::new(config.correlation_id_limit),
            metrics: MetricsRecorder::default(),
            registry,
            instance_prototypes: RwLock::new(HashMap::new()),
            writer: AsyncMutex::new(Some(Box::pin(writer))),
            state: AtomicU8::new(ConnectionState::Open.as_u8()),
            references: AtomicUsize::new(1),
            job: RwLock::new(String::new()),
            exchange_attributes: Mutex::new(None),
            reply_timeout: Mutex::new(config.reply_timeout),
            shutdown,
            endpoints,
            config,
        });

        tracing::debug!(
            service = %service,
            connection_id,
            peer = ?inner.endpoints.peer,
            "connection established"
        );

        let span = tracing::debug_span!("dispatcher", service = %service, connection_id);
        tokio::spawn(
            dispatcher::run(Arc::downgrade(&inner), reader, shutdown_rx, read_buffer_size)
                .instrument(span),
        );

        ConnectionLease::adopt(ServiceConnection { inner })
    }

    /// Take another reference to the connection.
    ///
    /// # Errors
    ///
    /// Returns [`ServerError::ConnectionClosed`] once the count has reached
    /// zero or the connection has left `Open`.
    pub fn attach(&self) -> ServerResult<ConnectionLease> {
        let references = &self.inner.references;
        let mut current = references.load(Ordering::Acquire);
        loop {
            if current == 0 || self.state() != ConnectionState::Open {
                return Err(ServerError::ConnectionClosed);
            }
            match references.compare_exchange_weak(
                current,
                current + 1,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => break,
                Err(actual) => current = actual,
            }
        }
        tracing::debug!(
            service = %self.inner.service,
            connection_id = self.inner.connection_id,
            references = current + 1,
            "attached"
        );
        Ok(ConnectionLease::adopt(self.clone()))
    }

    /// Drop one reference; the last one closes the connection.
    pub(crate) fn release(&self) {
        let previous = self.inner.references.fetch_sub(1, Ordering::AcqRel);
        tracing::debug!(
            service = %self.inner.service,
            connection_id = self.inner.connection_id,
            references = previous.saturating_sub(1),
            "detached"
        );
        if previous == 1 {
            self.inner.close(CloseReason::Released);
        }
    }

    /// Send a request and wait for its reply, using the default reply timeout.
    ///
    /// A fresh correlation id is stamped on `request`.
    ///
    /// # Errors
    ///
    /// - [`ServerError::Io`] if the write fails; the connection is then torn down
    /// - [`ServerError::Timeout`] if the default deadline expires
    /// - [`ServerError::ConnectionLost`] if the connection goes down while waiting
    /// - [`ServerError::ConnectionClosed`] if it was already closed
    pub async fn send_and_receive(&self, request: &mut dyn Message) -> ServerResult<Reply> {
        let timeout = self.reply_timeout();
        self.send_request(request).await?.wait(timeout).await
    }

    /// Send a request and wait at most `timeout` for its reply.
    pub async fn send_and_receive_within(
        &self,
        request: &mut dyn Message,
        timeout: Duration,
    ) -> ServerResult<Reply> {
        self.send_request(request).await?.wait(Some(timeout)).await
    }

    /// Send a request and return a handle on its pending reply.
    ///
    /// Dropping the handle withdraws the request; a late reply is discarded.
    pub async fn send_request(&self, request: &mut dyn Message) -> ServerResult<PendingReply> {
        self.ensure_open()?;
        let (registration, rx) = self.inner.pending.register_waiting()?;
        let pending = PendingReply::new(Arc::downgrade(&self.inner), registration, rx);

        request.set_correlation_id(registration.correlation_id);
        let frame = encode_message(
            self.inner.service.wire_code(),
            request,
            self.inner.config.max_frame_size,
        )?;

        tracing::debug!(
            service = %self.inner.service,
            connection_id = self.inner.connection_id,
            correlation_id = registration.correlation_id,
            discriminator = request.request_reply_id(),
            "sending request"
        );
        self.write_frame(&frame, Some(registration)).await?;
        Ok(pending)
    }

    /// Send a request the host does not answer.
    ///
    /// Returns the correlation id stamped on `request`. The id is not reserved:
    /// once the id space wraps it may be handed to a later request, so a reply
    /// to this one could reach that request's caller. Use
    /// [`send_discarding_reply`](Self::send_discarding_reply) when the host
    /// may still reply.
    pub async fn send(&self, request: &mut dyn Message) -> ServerResult<u32> {
        self.ensure_open()?;
        let correlation_id = self.inner.pending.allocate()?;
        self.send_with_correlation_id(request, correlation_id).await?;
        Ok(correlation_id)
    }

    /// Send a request under a caller-chosen correlation id, without waiting.
    pub async fn send_with_correlation_id(
        &self,
        request: &mut dyn Message,
        correlation_id: u32,
    ) -> ServerResult<()> {
        self.ensure_open()?;
        request.set_correlation_id(correlation_id);
        let frame = encode_message(
            self.inner.service.wire_code(),
            request,
            self.inner.config.max_frame_size,
        )?;
        self.write_frame(&frame, None).await
    }

    /// Send a request whose reply is dropped on arrival.
    ///
    /// The correlation id stays reserved until that reply arrives.
    pub async fn send_discarding_reply(&self, request: &mut dyn Message) -> ServerResult<u32> {
        self.ensure_open()?;
        let registration = self.inner.pending.register_discard()?;
        request.set_correlation_id(registration.correlation_id);

        let frame = match encode_message(
            self.inner.service.wire_code(),
            request,
            self.inner.config.max_frame_size,
        ) {
            Ok(frame) => frame,
            Err(err) => {
                self.inner.pending.cancel(registration);
                return Err(err);
            }
        };
        self.write_frame(&frame, Some(registration)).await?;
        Ok(registration.correlation_id)
    }

    /// Tear the connection down and fail every pending wait with
    /// [`ServerError::ConnectionLost`].
    ///
    /// Safe to call any number of times, from any task.
    pub fn force_disconnect(&self) {
        self.inner.close(CloseReason::Forced);
    }

    /// Next correlation id not currently outstanding.
    ///
    /// # Errors
    ///
    /// Returns [`ServerError::CorrelationIdsExhausted`] if every id is pending.
    pub fn new_correlation_id(&self) -> ServerResult<u32> {
        self.inner.pending.allocate()
    }

    async fn write_frame(
        &self,
        frame: &[u8],
        registration: Option<Registration>,
    ) -> ServerResult<()> {
        let inner = &*self.inner;
        let mut shutdown = inner.shutdown.subscribe();
        let mut in_flight = InFlightWrite {
            writer: inner.writer.lock().await,
            inner,
            finished: false,
        };

        // a registered request was pending when the teardown drained it
        let closed_error = || match registration {
            Some(_) => ServerError::ConnectionLost,
            None => ServerError::ConnectionClosed,
        };
        if inner.state() != ConnectionState::Open {
            in_flight.finished = true;
            in_flight.writer.take();
            return Err(closed_error());
        }
        let Some(writer) = in_flight.writer.as_mut() else {
            in_flight.finished = true;
            return Err(closed_error());
        };

        let outcome = tokio::select! {
            biased;
            _ = shutdown.wait_for(|closed| *closed) => None,
            result = write_all_and_flush(writer, frame) => Some(result),
        };
        in_flight.finished = true;

        match outcome {
            Some(Ok(())) => {
                inner.metrics.record_sent(frame.len());
                if inner.is_shutting_down() {
                    in_flight.writer.take();
                }
                Ok(())
            }
            None => {
                in_flight.writer.take();
                Err(ServerError::ConnectionLost)
            }
            Some(Err(err)) => {
                if let Some(registration) = registration {
                    inner.pending.cancel(registration);
                }
                in_flight.writer.take();
                drop(in_flight);
                tracing::warn!(
                    service = %inner.service,
                    connection_id = inner.connection_id,
                    error = %err,
                    "write failed"
                );
                inner.close(CloseReason::WriteFailed);
                Err(ServerError::Io(err))
            }
        }
    }

    fn ensure_open(&self) -> ServerResult<()> {
        if self.state() == ConnectionState::Open {
            Ok(())
        } else {
            Err(ServerError::ConnectionClosed)
        }
    }

    /// Process-unique id of this connection.
    pub fn connection_id(&self) -> u32 {
        self.inner.connection_id
    }

    /// Service job this connection talks to.
    pub fn service(&self) -> ServiceId {
        self.inner.service
    }

    /// Job identifier reported by the host, empty until known.
    pub fn job(&self) -> String {
        self.inner.job.read().clone()
    }

    /// Record the job identifier.
    pub fn set_job(&self, job: impl Into<String>) {
        *self.inner.job.write() = job.into();
    }

    /// Local socket address, if the transport reported one.
    pub fn local_address(&self) -> Option<SocketAddr> {
        self.inner.endpoints.local
    }

    /// Address the connection was opened to.
    pub fn peer_address(&self) -> Option<HostAddress> {
        self.inner.endpoints.peer.clone()
    }

    /// Whether requests may still be issued.
    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Open
    }

    /// Current lifecycle state.
    pub fn state(&self) -> ConnectionState {
        self.inner.state()
    }

    /// Number of live leases.
    pub fn reference_count(&self) -> usize {
        self.inner.references.load(Ordering::Acquire)
    }

    /// Requests awaiting a reply, discard entries included.
    pub fn pending_count(&self) -> usize {
        self.inner.pending.len()
    }

    /// Cached exchange-attributes reply from the handshake.
    pub fn exchange_attributes_reply(&self) -> Option<Arc<Reply>> {
        self.inner.exchange_attributes.lock().clone()
    }

    /// Cache the exchange-attributes reply for every later attacher.
    pub fn set_exchange_attributes_reply(&self, reply: Reply) {
        *self.inner.exchange_attributes.lock() = Some(Arc::new(reply));
    }

    /// Prototype for `discriminator` on this connection only.
    ///
    /// Consulted before the shared registry; a later call replaces an earlier
    /// one.
    pub fn add_instance_prototype(&self, discriminator: u16, prototype: ReplyPrototype) {
        self.inner
            .instance_prototypes
            .write()
            .insert(discriminator, prototype);
    }

    /// Remove every per-connection prototype.
    pub fn clear_instance_prototypes(&self) {
        self.inner.instance_prototypes.write().clear();
    }

    /// Default reply deadline.
    pub fn reply_timeout(&self) -> Option<Duration> {
        *self.inner.reply_timeout.lock()
    }

    /// Change the default reply deadline for later requests.
    pub fn set_reply_timeout(&self, timeout: Option<Duration>) {
        *self.inner.reply_timeout.lock() = timeout;
    }

    /// Snapshot of the connection counters.
    pub fn metrics(&self) -> ConnectionMetrics {
        self.inner.metrics.snapshot()
    }
}

impl fmt::Debug for ServiceConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServiceConnection")
            .field("service", &self.inner.service)
            .field("connection_id", &self.inner.connection_id)
            .field("state", &self.state())
            .field("references", &self.reference_count())
            .finish()
    }
}

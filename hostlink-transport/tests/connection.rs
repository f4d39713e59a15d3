//! Integration tests for request/reply matching over one shared connection.
//!
//! A scripted host drives the far end of an in-process duplex stream.

mod common;

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use common::{eventually, open, open_with, Ping, Pong, PONG, SERVICE, UNREGISTERED};
use hostlink_transport::{
    ConnectionConfig, ConnectionState, EnvelopeHeader, ServerError, ServiceConnection, HEADER_SIZE,
};
use parking_lot::Mutex;

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_callers_get_their_own_reply() {
    const CALLERS: u32 = 16;
    let (lease, mut host) = open();

    // answer in reverse arrival order
    let host_task = tokio::spawn(async move {
        let mut requests = Vec::new();
        for _ in 0..CALLERS {
            requests.push(host.expect_request().await);
        }
        for request in requests.iter().rev() {
            host.pong(request.header.correlation_id, request.value() * 10).await;
        }
        host
    });

    let mut callers = Vec::new();
    for value in 0..CALLERS {
        let session = lease.attach().expect("attach");
        callers.push(tokio::spawn(async move {
            let mut request = Ping::new(value);
            let reply = session
                .send_and_receive(&mut request)
                .await
                .expect("reply");
            assert_eq!(reply.correlation_id(), request.correlation_id);
            let pong = reply.downcast::<Pong>().expect("a pong");
            (value, pong.value)
        }));
    }

    for caller in callers {
        let (value, reply) = caller.await.expect("caller task");
        assert_eq!(reply, value * 10, "caller {value} got another caller's reply");
    }
    host_task.await.expect("host task");

    let metrics = lease.metrics();
    assert_eq!(metrics.requests_sent, u64::from(CALLERS));
    assert_eq!(metrics.replies_delivered, u64::from(CALLERS));
    assert_eq!(metrics.replies_discarded, 0);
    assert_eq!(lease.pending_count(), 0);
}

#[tokio::test]
async fn test_small_id_space_never_reuses_pending_ids() {
    let (lease, mut host) = open_with(ConnectionConfig::default().with_correlation_id_limit(4));

    let mut pending = Vec::new();
    for value in 0..4 {
        pending.push(
            lease
                .send_request(&mut Ping::new(value))
                .await
                .expect("send"),
        );
    }
    assert!(matches!(
        lease.send_request(&mut Ping::new(99)).await,
        Err(ServerError::CorrelationIdsExhausted { limit: 4 })
    ));

    // drain the host so the next finds fresh requests
    for _ in 0..4 {
        host.expect_request().await;
    }

    // complete the request holding id 2, then churn through many wraps
    let second = pending.remove(1);
    assert_eq!(second.correlation_id(), 2);
    host.pong(2, 0).await;
    second.await.expect("reply for id 2");

    let mut outstanding: HashSet<u32> = pending.iter().map(|p| p.correlation_id()).collect();
    assert_eq!(outstanding, HashSet::from([1, 3, 4]));

    for round in 0..20u32 {
        let next = lease
            .send_request(&mut Ping::new(round))
            .await
            .expect("send");
        let id = next.correlation_id();
        assert!(
            outstanding.insert(id),
            "id {id} handed out while still pending"
        );

        let request = host.expect_request().await;
        assert_eq!(request.header.correlation_id, id);
        host.pong(id, round).await;
        let reply = next.await.expect("reply");
        assert_eq!(reply.downcast_ref::<Pong>().map(|p| p.value), Some(round));
        outstanding.remove(&id);
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_paired_attach_detach_closes_once() {
    const SESSIONS: usize = 10;
    let (lease, mut host) = open();
    let connection = lease.connection().clone();

    let mut tasks = Vec::new();
    for _ in 0..SESSIONS {
        let connection = connection.clone();
        tasks.push(tokio::spawn(async move {
            let session = connection.attach().expect("attach");
            tokio::time::sleep(Duration::from_millis(10)).await;
            session.detach();
        }));
    }
    for task in tasks {
        task.await.expect("session task");
    }

    assert_eq!(connection.reference_count(), 1);
    assert_eq!(connection.state(), ConnectionState::Open);
    assert_eq!(connection.metrics().closes, 0);

    lease.detach();
    assert_eq!(connection.state(), ConnectionState::Closed);
    assert_eq!(connection.metrics().closes, 1);
    assert!(host.sees_end_of_stream().await);

    assert!(matches!(
        connection.send(&mut Ping::new(1)).await,
        Err(ServerError::ConnectionClosed)
    ));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_force_disconnect_unblocks_every_waiter() {
    const WAITERS: usize = 8;
    let (lease, _host) = open();

    let mut waiters = Vec::new();
    for value in 0..WAITERS as u32 {
        let session = lease.attach().expect("attach");
        waiters.push(tokio::spawn(async move {
            session.send_and_receive(&mut Ping::new(value)).await
        }));
    }
    assert!(eventually(|| lease.pending_count() == WAITERS).await);

    lease.force_disconnect();

    for waiter in waiters {
        let result = tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .expect("waiter released within 1s")
            .expect("waiter task");
        assert!(matches!(result, Err(ServerError::ConnectionLost)));
    }
    assert_eq!(lease.pending_count(), 0);
    assert_eq!(lease.state(), ConnectionState::Closed);
    assert_eq!(lease.metrics().closes, 1);
}

#[tokio::test]
async fn test_late_reply_is_discarded() {
    let (lease, mut host) = open();

    let mut first = Ping::new(1);
    let err = lease
        .send_and_receive_within(&mut first, Duration::from_millis(50))
        .await
        .expect_err("no reply yet");
    assert!(matches!(err, ServerError::Timeout { correlation_id, .. } if correlation_id == first.correlation_id));
    assert_eq!(lease.pending_count(), 0);

    let late = host.expect_request().await;
    let round_trip = tokio::spawn({
        let session = lease.attach().expect("attach");
        async move { session.send_and_receive(&mut Ping::new(2)).await }
    });
    let second = host.expect_request().await;
    assert_ne!(late.header.correlation_id, second.header.correlation_id);

    host.pong(late.header.correlation_id, 111).await;
    host.pong(second.header.correlation_id, 222).await;

    let reply = round_trip
        .await
        .expect("caller task")
        .expect("reply to second request");
    assert_eq!(reply.downcast_ref::<Pong>().map(|p| p.value), Some(222));

    assert!(eventually(|| lease.metrics().replies_discarded == 1).await);
    assert!(lease.is_connected());
    assert_eq!(lease.metrics().protocol_errors, 0);
}

#[tokio::test]
async fn test_default_reply_timeout_applies() {
    let (lease, _host) =
        open_with(ConnectionConfig::default().with_reply_timeout(Some(Duration::from_millis(30))));

    let err = lease
        .send_and_receive(&mut Ping::new(1))
        .await
        .expect_err("timeout");
    assert!(matches!(err, ServerError::Timeout { after, .. } if after == Duration::from_millis(30)));

    lease.set_reply_timeout(Some(Duration::from_millis(10)));
    let err = lease
        .send_and_receive(&mut Ping::new(2))
        .await
        .expect_err("timeout");
    assert!(matches!(err, ServerError::Timeout { after, .. } if after == Duration::from_millis(10)));
}

#[tokio::test]
async fn test_interrupt_from_another_task() {
    let (lease, mut host) = open();

    let pending = lease.send_request(&mut Ping::new(5)).await.expect("send");
    let correlation_id = pending.correlation_id();
    let interrupter = pending.interrupter();

    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(interrupter.interrupt());
        assert!(!interrupter.interrupt());
    });

    let err = pending.await.expect_err("interrupted");
    assert!(matches!(err, ServerError::Interrupted { correlation_id: id } if id == correlation_id));
    assert_eq!(lease.pending_count(), 0);

    // the reply for the interrupted request goes nowhere
    host.expect_request().await;
    host.pong(correlation_id, 0).await;
    assert!(eventually(|| lease.metrics().replies_discarded == 1).await);
    assert!(lease.is_connected());
}

#[tokio::test]
async fn test_dropping_pending_reply_withdraws_request() {
    let (lease, _host) = open();

    let pending = lease.send_request(&mut Ping::new(5)).await.expect("send");
    assert_eq!(lease.pending_count(), 1);
    drop(pending);
    assert_eq!(lease.pending_count(), 0);
}

#[tokio::test]
async fn test_discarding_reply_and_fire_and_forget() {
    let (lease, mut host) = open();

    let discarded = lease
        .send_discarding_reply(&mut Ping::new(1))
        .await
        .expect("send");
    assert_eq!(lease.pending_count(), 1);

    let mut unsolicited = Ping::new(2);
    let sent = lease.send(&mut unsolicited).await.expect("send");
    assert_eq!(unsolicited.correlation_id, sent);
    assert_eq!(lease.pending_count(), 1);

    lease
        .send_with_correlation_id(&mut Ping::new(3), 0x00AB_CDEF)
        .await
        .expect("send with id");

    assert_eq!(host.expect_request().await.header.correlation_id, discarded);
    assert_eq!(host.expect_request().await.header.correlation_id, sent);
    assert_eq!(host.expect_request().await.header.correlation_id, 0x00AB_CDEF);

    host.pong(discarded, 0).await;
    host.pong(sent, 0).await;
    assert!(eventually(|| lease.metrics().replies_discarded == 2).await);
    assert_eq!(lease.pending_count(), 0);
    assert_eq!(lease.metrics().requests_sent, 3);
}

#[tokio::test]
async fn test_unroutable_frames_fail_only_their_waiter() {
    let (lease, mut host) = open();

    let unknown = lease.send_request(&mut Ping::new(1)).await.expect("send");
    let foreign = lease.send_request(&mut Ping::new(2)).await.expect("send");
    let healthy = lease.send_request(&mut Ping::new(3)).await.expect("send");
    for _ in 0..3 {
        host.expect_request().await;
    }

    // unknown discriminator
    host.send_frame(
        EnvelopeHeader {
            request_reply_id: UNREGISTERED,
            ..common::pong_header(unknown.correlation_id())
        },
        &[1, 2, 3],
    )
    .await;
    // wrong server id
    host.send_frame(
        EnvelopeHeader {
            server_id: 0xE002,
            ..common::pong_header(foreign.correlation_id())
        },
        &7u32.to_be_bytes(),
    )
    .await;
    // unroutable and matching nothing
    host.send_frame(
        EnvelopeHeader {
            request_reply_id: UNREGISTERED,
            ..common::pong_header(0x00FF_FFFF)
        },
        &[],
    )
    .await;
    host.pong(healthy.correlation_id(), 30).await;

    let err = tokio::time::timeout(Duration::from_secs(1), unknown)
        .await
        .expect("unknown discriminator reported within 1s")
        .expect_err("unknown discriminator");
    assert!(matches!(err, ServerError::Protocol { ref message } if message.contains("0x80ff")));
    let err = tokio::time::timeout(Duration::from_secs(1), foreign)
        .await
        .expect("foreign server id reported within 1s")
        .expect_err("foreign server id");
    assert!(matches!(err, ServerError::Protocol { ref message } if message.contains("0xe002")));

    let reply = healthy.await.expect("routed after skipped frames");
    assert_eq!(reply.downcast_ref::<Pong>().map(|p| p.value), Some(30));
    assert_eq!(lease.metrics().protocol_errors, 3);
    assert_eq!(lease.pending_count(), 0);
    assert!(lease.is_connected());
}

#[tokio::test]
async fn test_decode_failure_reaches_only_its_waiter() {
    let (lease, mut host) = open();

    let broken = lease.send_request(&mut Ping::new(1)).await.expect("send");
    let healthy = lease.send_request(&mut Ping::new(2)).await.expect("send");
    host.expect_request().await;
    host.expect_request().await;

    host.send_frame(common::pong_header(broken.correlation_id()), &[0]).await;
    host.pong(healthy.correlation_id(), 20).await;

    assert!(matches!(
        broken.await,
        Err(ServerError::Protocol { .. })
    ));
    let reply = healthy.await.expect("healthy reply");
    assert_eq!(reply.downcast_ref::<Pong>().map(|p| p.value), Some(20));
    assert!(lease.is_connected());
}

#[tokio::test]
async fn test_replies_split_across_reads() {
    let (lease, mut host) = open();

    let pending = lease.send_request(&mut Ping::new(1)).await.expect("send");
    host.expect_request().await;

    let frame = hostlink_transport::encode_frame(
        common::pong_header(pending.correlation_id()),
        &42u32.to_be_bytes(),
        1024,
    )
    .expect("encode");
    host.send_raw(&frame[..HEADER_SIZE - 3]).await;
    tokio::time::sleep(Duration::from_millis(10)).await;
    host.send_raw(&frame[HEADER_SIZE - 3..HEADER_SIZE + 1]).await;
    tokio::time::sleep(Duration::from_millis(10)).await;
    host.send_raw(&frame[HEADER_SIZE + 1..]).await;

    let reply = pending.await.expect("reply");
    assert_eq!(reply.request_reply_id(), PONG);
    assert_eq!(reply.downcast_ref::<Pong>().map(|p| p.value), Some(42));
}

#[tokio::test]
async fn test_corrupted_length_disconnects() {
    let (lease, mut host) = open();

    let pending = lease.send_request(&mut Ping::new(1)).await.expect("send");
    host.expect_request().await;

    let mut garbage = vec![0u8; HEADER_SIZE];
    garbage[0..4].copy_from_slice(&3u32.to_be_bytes());
    host.send_raw(&garbage).await;

    assert!(matches!(pending.await, Err(ServerError::ConnectionLost)));
    assert_eq!(lease.state(), ConnectionState::Closed);
    assert_eq!(lease.metrics().protocol_errors, 1);
}

#[tokio::test]
async fn test_host_end_of_stream_fails_waiters() {
    let (lease, host) = open();

    let pending = lease.send_request(&mut Ping::new(1)).await.expect("send");
    drop(host);

    assert!(matches!(pending.await, Err(ServerError::ConnectionLost)));
    assert!(eventually(|| lease.state() == ConnectionState::Closed).await);
    assert!(matches!(
        lease.send_request(&mut Ping::new(2)).await,
        Err(ServerError::ConnectionClosed)
    ));
}

#[tokio::test]
async fn test_instance_prototypes_take_precedence() {
    let (lease, mut host) = open();
    lease.add_instance_prototype(
        UNREGISTERED,
        hostlink_transport::ReplyPrototype::of::<Pong>(),
    );

    let pending = lease.send_request(&mut Ping::new(1)).await.expect("send");
    host.expect_request().await;
    host.send_frame(
        EnvelopeHeader {
            request_reply_id: UNREGISTERED,
            ..common::pong_header(pending.correlation_id())
        },
        &9u32.to_be_bytes(),
    )
    .await;
    let reply = pending.await.expect("reply via instance prototype");
    assert_eq!(reply.request_reply_id(), UNREGISTERED);

    lease.clear_instance_prototypes();
    let pending = lease.send_request(&mut Ping::new(2)).await.expect("send");
    host.expect_request().await;
    host.send_frame(
        EnvelopeHeader {
            request_reply_id: UNREGISTERED,
            ..common::pong_header(pending.correlation_id())
        },
        &9u32.to_be_bytes(),
    )
    .await;
    assert!(matches!(pending.await, Err(ServerError::Protocol { .. })));
    assert_eq!(lease.metrics().protocol_errors, 1);

    let pending = lease.send_request(&mut Ping::new(3)).await.expect("send");
    host.expect_request().await;
    host.pong(pending.correlation_id(), 10).await;
    let reply = pending.await.expect("reply via registry");
    assert_eq!(reply.request_reply_id(), PONG);
}

#[tokio::test]
async fn test_new_correlation_id_skips_outstanding() {
    let (lease, _host) = open_with(ConnectionConfig::default().with_correlation_id_limit(3));

    let held = lease.send_request(&mut Ping::new(1)).await.expect("send");
    assert_eq!(held.correlation_id(), 1);
    assert_eq!(lease.new_correlation_id().expect("id"), 2);
    assert_eq!(lease.new_correlation_id().expect("id"), 3);
    assert_eq!(lease.new_correlation_id().expect("id"), 2);
    assert_eq!(lease.service(), SERVICE);
}

#[tokio::test]
async fn test_fire_and_forget_ids_are_not_reserved() {
    let (lease, mut host) = open_with(ConnectionConfig::default().with_correlation_id_limit(2));

    let unanswered = lease.send(&mut Ping::new(1)).await.expect("send");
    assert_eq!(unanswered, 1);
    assert_eq!(lease.pending_count(), 0);

    let second = lease.send_request(&mut Ping::new(2)).await.expect("send");
    assert_eq!(second.correlation_id(), 2);
    let reused = lease.send_request(&mut Ping::new(3)).await.expect("send");
    assert_eq!(reused.correlation_id(), unanswered);

    // a discard entry stays reserved until its reply arrives
    drop(reused);
    drop(second);
    let discarded = lease
        .send_discarding_reply(&mut Ping::new(4))
        .await
        .expect("send");
    let next = lease.send_request(&mut Ping::new(5)).await.expect("send");
    assert_ne!(next.correlation_id(), discarded);
    assert!(matches!(
        lease.send_request(&mut Ping::new(6)).await,
        Err(ServerError::CorrelationIdsExhausted { limit: 2 })
    ));

    for _ in 0..5 {
        host.expect_request().await;
    }
}

/// Forces a disconnect from inside the flush that completes a frame.
struct DisconnectOnFlush {
    stream: tokio::io::DuplexStream,
    connection: Arc<Mutex<Option<ServiceConnection>>>,
}

impl tokio::io::AsyncRead for DisconnectOnFlush {
    fn poll_read(
        mut self: std::pin::Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
        buf: &mut tokio::io::ReadBuf<'_>,
    ) -> std::task::Poll<std::io::Result<()>> {
        std::pin::Pin::new(&mut self.stream).poll_read(cx, buf)
    }
}

impl tokio::io::AsyncWrite for DisconnectOnFlush {
    fn poll_write(
        mut self: std::pin::Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
        buf: &[u8],
    ) -> std::task::Poll<std::io::Result<usize>> {
        std::pin::Pin::new(&mut self.stream).poll_write(cx, buf)
    }

    fn poll_flush(
        mut self: std::pin::Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<std::io::Result<()>> {
        let flushed = std::pin::Pin::new(&mut self.stream).poll_flush(cx);
        if flushed.is_ready() {
            if let Some(connection) = self.connection.lock().take() {
                connection.force_disconnect();
            }
        }
        flushed
    }

    fn poll_shutdown(
        mut self: std::pin::Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<std::io::Result<()>> {
        std::pin::Pin::new(&mut self.stream).poll_shutdown(cx)
    }
}

#[tokio::test]
async fn test_disconnect_during_write_closes_transport() {
    common::init_tracing();
    let (client, host) = tokio::io::duplex(64 * 1024);
    let mut host = common::FakeHost::new(host);
    let connection = Arc::new(Mutex::new(None));
    let lease = ServiceConnection::from_stream(
        SERVICE,
        DisconnectOnFlush {
            stream: client,
            connection: connection.clone(),
        },
        common::registry(),
        ConnectionConfig::default(),
    );
    *connection.lock() = Some(lease.connection().clone());

    lease.send(&mut Ping::new(1)).await.expect("frame written");
    assert_eq!(lease.state(), ConnectionState::Closed);
    assert_eq!(lease.metrics().closes, 1);

    // the lease is still alive, yet both halves of the stream are gone
    assert!(host.next_request().await.is_some());
    assert!(host.sees_end_of_stream().await);
    assert_eq!(lease.reference_count(), 1);
}

#[allow(dead_code)]
fn assert_send_sync() {
    fn check<T: Send + Sync>() {}
    check::<ServiceConnection>();
    check::<hostlink_transport::ConnectionLease>();
    check::<hostlink_transport::Interrupter>();
}

/// Reads never complete; every write fails.
struct BrokenWriter;

impl tokio::io::AsyncRead for BrokenWriter {
    fn poll_read(
        self: std::pin::Pin<&mut Self>,
        _cx: &mut std::task::Context<'_>,
        _buf: &mut tokio::io::ReadBuf<'_>,
    ) -> std::task::Poll<std::io::Result<()>> {
        std::task::Poll::Pending
    }
}

impl tokio::io::AsyncWrite for BrokenWriter {
    fn poll_write(
        self: std::pin::Pin<&mut Self>,
        _cx: &mut std::task::Context<'_>,
        _buf: &[u8],
    ) -> std::task::Poll<std::io::Result<usize>> {
        std::task::Poll::Ready(Err(std::io::Error::from(std::io::ErrorKind::BrokenPipe)))
    }

    fn poll_flush(
        self: std::pin::Pin<&mut Self>,
        _cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<std::io::Result<()>> {
        std::task::Poll::Ready(Ok(()))
    }

    fn poll_shutdown(
        self: std::pin::Pin<&mut Self>,
        _cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<std::io::Result<()>> {
        std::task::Poll::Ready(Ok(()))
    }
}

#[tokio::test]
async fn test_write_failure_removes_entry_then_disconnects() {
    common::init_tracing();
    let lease = ServiceConnection::from_stream(
        SERVICE,
        BrokenWriter,
        common::registry(),
        ConnectionConfig::default(),
    );

    let err = lease
        .send_and_receive(&mut Ping::new(1))
        .await
        .expect_err("write fails");
    assert!(matches!(err, ServerError::Io(ref io) if io.kind() == std::io::ErrorKind::BrokenPipe));
    assert_eq!(lease.pending_count(), 0);
    assert_eq!(lease.state(), ConnectionState::Closed);
    assert_eq!(lease.metrics().closes, 1);
    assert_eq!(lease.metrics().requests_sent, 0);

    assert!(matches!(
        lease.send_and_receive(&mut Ping::new(2)).await,
        Err(ServerError::ConnectionClosed)
    ));
}

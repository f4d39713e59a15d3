//! Per-connection counters.

use std::sync::atomic::{AtomicU64, Ordering};

/// Snapshot of a connection's counters.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConnectionMetrics {
    /// Frames written.
    pub requests_sent: u64,
    /// Replies handed to a waiting caller.
    pub replies_delivered: u64,
    /// Replies dropped: discard entries, late arrivals, unknown correlation ids.
    pub replies_discarded: u64,
    /// Inbound frames rejected as malformed or unknown.
    pub protocol_errors: u64,
    /// Bytes written to the transport.
    pub bytes_written: u64,
    /// Bytes read from the transport.
    pub bytes_read: u64,
    /// Times the connection entered teardown. Never above one.
    pub closes: u64,
}

#[derive(Debug, Default)]
pub(crate) struct MetricsRecorder {
    requests_sent: AtomicU64,
    replies_delivered: AtomicU64,
    replies_discarded: AtomicU64,
    protocol_errors: AtomicU64,
    bytes_written: AtomicU64,
    bytes_read: AtomicU64,
    closes: AtomicU64,
}

impl MetricsRecorder {
    pub(crate) fn record_sent(&self, bytes: usize) {
        self.requests_sent.fetch_add(1, Ordering::Relaxed);
        self.bytes_written.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    pub(crate) fn record_read(&self, bytes: usize) {
        self.bytes_read.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    pub(crate) fn record_delivered(&self) {
        self.replies_delivered.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_discarded(&self) {
        self.replies_discarded.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_protocol_error(&self) {
        self.protocol_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_close(&self) {
        self.closes.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn snapshot(&self) -> ConnectionMetrics {
        ConnectionMetrics {
            requests_sent: self.requests_sent.load(Ordering::Relaxed),
            replies_delivered: self.replies_delivered.load(Ordering::Relaxed),
            replies_discarded: self.replies_discarded.load(Ordering::Relaxed),
            protocol_errors: self.protocol_errors.load(Ordering::Relaxed),
            bytes_written: self.bytes_written.load(Ordering::Relaxed),
            bytes_read: self.bytes_read.load(Ordering::Relaxed),
            closes: self.closes.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_snapshot_reflects_records() {
        let recorder = MetricsRecorder::default();
        recorder.record_sent(40);
        recorder.record_sent(20);
        recorder.record_read(24);
        recorder.record_delivered();
        recorder.record_discarded();
        recorder.record_close();

        let snapshot = recorder.snapshot();
        assert_eq!(snapshot.requests_sent, 2);
        assert_eq!(snapshot.bytes_written, 60);
        assert_eq!(snapshot.bytes_read, 24);
        assert_eq!(snapshot.replies_delivered, 1);
        assert_eq!(snapshot.replies_discarded, 1);
        assert_eq!(snapshot.protocol_errors, 0);
        assert_eq!(snapshot.closes, 1);
    }
}

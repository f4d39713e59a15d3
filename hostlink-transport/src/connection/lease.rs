//! Scoped attach token.

use std::fmt;
use std::ops::Deref;

use super::core::ServiceConnection;

/// One reference to a [`ServiceConnection`].
///
/// Dropping the lease (or calling [`detach`](Self::detach)) releases the
/// reference; releasing the last one closes the connection.
pub struct ConnectionLease {
    connection: ServiceConnection,
}

impl ConnectionLease {
    /// Take ownership of a reference already counted.
    pub(crate) fn adopt(connection: ServiceConnection) -> Self {
        Self { connection }
    }

    /// The leased connection.
    pub fn connection(&self) -> &ServiceConnection {
        &self.connection
    }

    /// Release the reference now.
    pub fn detach(self) {
        drop(self);
    }
}

impl Deref for ConnectionLease {
    type Target = ServiceConnection;

    fn deref(&self) -> &Self::Target {
        &self.connection
    }
}

impl Drop for ConnectionLease {
    fn drop(&mut self) {
        self.connection.release();
    }
}

impl fmt::Debug for ConnectionLease {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("ConnectionLease")
            .field(&self.connection)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use hostlink_core::ServiceId;

    use super::*;
    use crate::connection::{ConnectionConfig, ConnectionState};
    use crate::ReplyRegistry;

    fn open() -> (ConnectionLease, tokio::io::DuplexStream) {
        let (client, host) = tokio::io::duplex(1024);
        let lease = ServiceConnection::from_stream(
            ServiceId::DataQueue,
            client,
            ReplyRegistry::default(),
            ConnectionConfig::default(),
        );
        (lease, host)
    }

    #[tokio::test]
    async fn test_last_detach_closes() {
        let (first, _host) = open();
        let connection = first.connection().clone();

        let second = connection.attach().expect("attach");
        let third = second.attach().expect("attach through a lease");
        assert_eq!(connection.reference_count(), 3);

        first.detach();
        drop(third);
        assert_eq!(connection.reference_count(), 1);
        assert_eq!(connection.state(), ConnectionState::Open);

        second.detach();
        assert_eq!(connection.reference_count(), 0);
        assert_eq!(connection.state(), ConnectionState::Closed);
        assert_eq!(connection.metrics().closes, 1);
    }

    #[tokio::test]
    async fn test_no_resurrection_after_zero() {
        let (lease, _host) = open();
        let connection = lease.connection().clone();
        drop(lease);

        assert!(connection.attach().is_err());
        assert_eq!(connection.reference_count(), 0);
    }

    #[tokio::test]
    async fn test_forced_disconnect_keeps_leases_valid() {
        let (lease, _host) = open();
        let connection = lease.connection().clone();
        let other = lease.attach().expect("attach");

        lease.force_disconnect();
        assert!(lease.attach().is_err());
        assert_eq!(connection.reference_count(), 2);

        drop(other);
        drop(lease);
        assert_eq!(connection.reference_count(), 0);
        assert_eq!(connection.metrics().closes, 1);
    }
}

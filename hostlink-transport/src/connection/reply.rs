//! PendingReply: caller-side handle on a request awaiting its reply.
//!
//! Created by [`ServiceConnection::send_request`](super::ServiceConnection::send_request).
//! Resolves when the dispatcher hands over the matching reply, the connection
//! goes down, or an [`Interrupter`] fires. Dropping it withdraws the request.

use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Weak;
use std::task::{Context, Poll};
use std::time::Duration;

use super::core::ConnectionInner;
use super::pending::{Registration, ReplyReceiver, Slot};
use crate::error::{ServerError, ServerResult};
use crate::message::Reply;

/// Future resolving to the reply of one request.
pub struct PendingReply {
    connection: Weak<ConnectionInner>,
    registration: Registration,
    rx: ReplyReceiver,
    finished: bool,
}

impl PendingReply {
    pub(crate) fn new(
        connection: Weak<ConnectionInner>,
        registration: Registration,
        rx: ReplyReceiver,
    ) -> Self {
        Self {
            connection,
            registration,
            rx,
            finished: false,
        }
    }

    /// Correlation id of the request.
    pub fn correlation_id(&self) -> u32 {
        self.registration.correlation_id
    }

    /// Handle that can abandon this wait from any task.
    pub fn interrupter(&self) -> Interrupter {
        Interrupter {
            connection: self.connection.clone(),
            registration: self.registration,
        }
    }

    /// Wait for the reply, at most `timeout` when one is given.
    ///
    /// # Errors
    ///
    /// Returns [`ServerError::Timeout`] when the deadline expires; the entry is
    /// removed and a late reply is discarded.
    pub async fn wait(mut self, timeout: Option<Duration>) -> ServerResult<Reply> {
        let Some(after) = timeout else {
            return (&mut self).await;
        };

        match tokio::time::timeout(after, &mut self).await {
            Ok(result) => result,
            Err(_) => {
                self.finished = true;
                if self.withdraw().is_none() {
                    // the dispatcher took the entry first
                    if let Ok(result) = self.rx.try_recv() {
                        return result;
                    }
                }
                tracing::debug!(
                    correlation_id = self.registration.correlation_id,
                    after = ?after,
                    "reply wait timed out"
                );
                Err(ServerError::Timeout {
                    correlation_id: self.registration.correlation_id,
                    after,
                })
            }
        }
    }

    fn withdraw(&self) -> Option<Slot> {
        self.connection
            .upgrade()
            .and_then(|inner| inner.pending.cancel(self.registration))
    }
}

impl Future for PendingReply {
    type Output = ServerResult<Reply>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        match Pin::new(&mut self.rx).poll(cx) {
            Poll::Ready(Ok(result)) => {
                self.finished = true;
                Poll::Ready(result)
            }
            Poll::Ready(Err(_)) => {
                // sender dropped without a reply: the table went away
                self.finished = true;
                Poll::Ready(Err(ServerError::ConnectionLost))
            }
            Poll::Pending => Poll::Pending,
        }
    }
}

impl Drop for PendingReply {
    fn drop(&mut self) {
        if !self.finished && self.withdraw().is_some() {
            tracing::debug!(
                correlation_id = self.registration.correlation_id,
                "pending reply dropped, request withdrawn"
            );
        }
    }
}

impl fmt::Debug for PendingReply {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PendingReply")
            .field("correlation_id", &self.registration.correlation_id)
            .field("finished", &self.finished)
            .finish()
    }
}

/// Abandons one pending wait, which then fails with
/// [`ServerError::Interrupted`].
#[derive(Clone)]
pub struct Interrupter {
    connection: Weak<ConnectionInner>,
    registration: Registration,
}

impl Interrupter {
    /// Correlation id of the request this handle interrupts.
    pub fn correlation_id(&self) -> u32 {
        self.registration.correlation_id
    }

    /// Interrupt the wait.
    ///
    /// Returns false if the wait already ended.
    pub fn interrupt(&self) -> bool {
        let Some(inner) = self.connection.upgrade() else {
            return false;
        };
        let Some(tx) = inner
            .pending
            .cancel(self.registration)
            .and_then(Slot::into_sender)
        else {
            return false;
        };

        tracing::debug!(
            service = %inner.service,
            connection_id = inner.connection_id,
            correlation_id = self.registration.correlation_id,
            "wait interrupted"
        );
        let _ = tx.send(Err(ServerError::Interrupted {
            correlation_id: self.registration.correlation_id,
        }));
        true
    }
}

impl fmt::Debug for Interrupter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Interrupter")
            .field("correlation_id", &self.registration.correlation_id)
            .finish()
    }
}

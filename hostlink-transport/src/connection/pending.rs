//! Correlation id allocation and the pending reply table.
//!
//! The id counter and the table live under one lock, so an id that is still
//! outstanding is never handed out again. Every registration carries a ticket;
//! cancel paths remove an entry only when their ticket matches, which keeps a
//! stale owner from removing a recycled id.

use std::collections::HashMap;

use parking_lot::Mutex;
use tokio::sync::oneshot;

use crate::error::{ServerError, ServerResult};
use crate::message::Reply;

pub(crate) type ReplySender = oneshot::Sender<ServerResult<Reply>>;
pub(crate) type ReplyReceiver = oneshot::Receiver<ServerResult<Reply>>;

/// One pending entry.
#[derive(Debug)]
pub(crate) enum Slot {
    /// A caller awaits the reply.
    Waiting { ticket: u64, tx: ReplySender },
    /// The reply is dropped on arrival.
    Discard { ticket: u64 },
}

impl Slot {
    fn ticket(&self) -> u64 {
        match self {
            Slot::Waiting { ticket, .. } | Slot::Discard { ticket } => *ticket,
        }
    }

    pub(crate) fn into_sender(self) -> Option<ReplySender> {
        match self {
            Slot::Waiting { tx, .. } => Some(tx),
            Slot::Discard { .. } => None,
        }
    }
}

/// Identifies one registration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Registration {
    pub(crate) correlation_id: u32,
    pub(crate) ticket: u64,
}

#[derive(Debug)]
struct TableState {
    entries: HashMap<u32, Slot>,
    next: u32,
    limit: u32,
    next_ticket: u64,
    closed: bool,
}

impl TableState {
    fn next_free_id(&mut self) -> ServerResult<u32> {
        if self.entries.len() as u64 >= u64::from(self.limit) {
            return Err(ServerError::CorrelationIdsExhausted { limit: self.limit });
        }
        loop {
            let id = self.next;
            self.next = if id >= self.limit { 1 } else { id + 1 };
            if !self.entries.contains_key(&id) {
                return Ok(id);
            }
        }
    }

    fn insert(&mut self, make_slot: impl FnOnce(u64) -> Slot) -> ServerResult<Registration> {
        if self.closed {
            return Err(ServerError::ConnectionClosed);
        }
        let correlation_id = self.next_free_id()?;
        let ticket = self.next_ticket;
        self.next_ticket += 1;
        self.entries.insert(correlation_id, make_slot(ticket));
        Ok(Registration {
            correlation_id,
            ticket,
        })
    }
}

/// Correlation id → pending entry.
#[derive(Debug)]
pub(crate) struct PendingTable {
    state: Mutex<TableState>,
}

impl PendingTable {
    /// Table handing out ids in `1..=limit`.
    pub(crate) fn new(limit: u32) -> Self {
        Self {
            state: Mutex::new(TableState {
                entries: HashMap::new(),
                next: 1,
                limit: limit.max(1),
                next_ticket: 1,
                closed: false,
            }),
        }
    }

    /// Next id not currently outstanding, without registering it.
    pub(crate) fn allocate(&self) -> ServerResult<u32> {
        self.state.lock().next_free_id()
    }

    /// Register an entry a caller will wait on.
    pub(crate) fn register_waiting(&self) -> ServerResult<(Registration, ReplyReceiver)> {
        let (tx, rx) = oneshot::channel();
        let registration = self
            .state
            .lock()
            .insert(move |ticket| Slot::Waiting { ticket, tx })?;
        Ok((registration, rx))
    }

    /// Register an entry whose reply is dropped on arrival.
    pub(crate) fn register_discard(&self) -> ServerResult<Registration> {
        self.state
            .lock()
            .insert(|ticket| Slot::Discard { ticket })
    }

    /// Remove the entry for an inbound reply, whoever registered it.
    pub(crate) fn take(&self, correlation_id: u32) -> Option<Slot> {
        self.state.lock().entries.remove(&correlation_id)
    }

    /// Remove the entry only if it still belongs to `registration`.
    pub(crate) fn cancel(&self, registration: Registration) -> Option<Slot> {
        let mut state = self.state.lock();
        match state.entries.get(&registration.correlation_id) {
            Some(slot) if slot.ticket() == registration.ticket => {
                state.entries.remove(&registration.correlation_id)
            }
            _ => None,
        }
    }

    /// Refuse further registrations and drain every entry.
    ///
    /// Returns the senders of entries that had a waiting caller.
    pub(crate) fn close(&self) -> Vec<ReplySender> {
        let mut state = self.state.lock();
        state.closed = true;
        state
            .entries
            .drain()
            .filter_map(|(_, slot)| slot.into_sender())
            .collect()
    }

    pub(crate) fn len(&self) -> usize {
        self.state.lock().entries.len()
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;

    use super::*;

    #[test]
    fn test_ids_start_at_one_and_wrap() {
        let table = PendingTable::new(3);
        let ids: Vec<u32> = (0..5)
            .map(|_| table.allocate().expect("allocate"))
            .collect();
        assert_eq!(ids, vec![1, 2, 3, 1, 2]);
    }

    #[test]
    fn test_outstanding_ids_are_skipped() {
        let table = PendingTable::new(4);
        let (first, _rx1) = table.register_waiting().expect("register");
        let (second, _rx2) = table.register_waiting().expect("register");
        assert_eq!((first.correlation_id, second.correlation_id), (1, 2));

        // 3 and 4 are free, then the counter wraps past the outstanding 1 and 2
        assert_eq!(table.register_discard().expect("register").correlation_id, 3);
        table.take(3);
        assert_eq!(table.allocate().expect("allocate"), 4);
        assert_eq!(table.allocate().expect("allocate"), 3);
    }

    #[test]
    fn test_exhausted_space() {
        let table = PendingTable::new(2);
        let _a = table.register_waiting().expect("register");
        let _b = table.register_discard().expect("register");

        assert!(matches!(
            table.register_waiting(),
            Err(ServerError::CorrelationIdsExhausted { limit: 2 })
        ));
        assert!(matches!(
            table.allocate(),
            Err(ServerError::CorrelationIdsExhausted { limit: 2 })
        ));
    }

    #[test]
    fn test_never_reused_while_pending() {
        let table = PendingTable::new(5);
        let mut outstanding = HashSet::new();
        let mut receivers = Vec::new();

        for round in 0..50u32 {
            let (registration, rx) = table.register_waiting().expect("register");
            assert!(
                outstanding.insert(registration.correlation_id),
                "id {} reused while pending",
                registration.correlation_id
            );
            receivers.push((registration, rx));

            // keep the table nearly full by completing every other request
            if round % 2 == 1 && !receivers.is_empty() {
                let (done, _) = receivers.remove(0);
                table.take(done.correlation_id);
                outstanding.remove(&done.correlation_id);
            }
            if receivers.len() == 5 {
                let (done, _) = receivers.remove(0);
                table.cancel(done);
                outstanding.remove(&done.correlation_id);
            }
        }
    }

    #[test]
    fn test_stale_cancel_leaves_recycled_id() {
        let table = PendingTable::new(1);
        let (stale, _rx) = table.register_waiting().expect("register");
        assert!(table.take(stale.correlation_id).is_some());

        let (fresh, _rx) = table.register_waiting().expect("register");
        assert_eq!(fresh.correlation_id, stale.correlation_id);

        assert!(table.cancel(stale).is_none());
        assert_eq!(table.len(), 1);
        assert!(table.cancel(fresh).is_some());
        assert_eq!(table.len(), 0);
    }

    #[test]
    fn test_close_drains_and_refuses() {
        let table = PendingTable::new(10);
        let (_, mut rx1) = table.register_waiting().expect("register");
        let (_, mut rx2) = table.register_waiting().expect("register");
        table.register_discard().expect("register");

        let senders = table.close();
        assert_eq!(senders.len(), 2);
        assert_eq!(table.len(), 0);
        for tx in senders {
            let _ = tx.send(Err(ServerError::ConnectionLost));
        }
        assert!(matches!(rx1.try_recv(), Ok(Err(ServerError::ConnectionLost))));
        assert!(matches!(rx2.try_recv(), Ok(Err(ServerError::ConnectionLost))));

        assert!(matches!(
            table.register_waiting(),
            Err(ServerError::ConnectionClosed)
        ));
        assert!(matches!(
            table.register_discard(),
            Err(ServerError::ConnectionClosed)
        ));
    }
}

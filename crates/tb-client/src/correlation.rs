//! Request correlation
//!
//! Each in-flight request has a [`RequestRecord`] registered in the
//! [`CorrelationTable`] under a process-unique [`RequestId`]. The id travels
//! through the engine in the packet's user-data word; when the completion comes
//! back the dispatcher looks the record up and fills its result slot exactly
//! once.
//!
//! # Invariants
//! - At most one record per id, and at most one completion delivered per record
//! - A record stays registered until its caller has released the packet
//! - Records abandoned on timeout are handed back through the orphan queue so
//!   their packets can be released once the engine is done with them

use crate::engine::Packet;
use crate::error::ProtocolViolation;
use crate::operation::{Operation, PacketStatus};
use bytes::Bytes;
use crossbeam::channel::{bounded, Receiver, RecvTimeoutError, Sender, TryRecvError};
use crossbeam::queue::ArrayQueue;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use parking_lot::Mutex;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Identity of one in-flight request
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RequestId(u64);

impl RequestId {
    pub const fn from_raw(raw: u64) -> Self {
        Self(raw)
    }

    pub const fn raw(self) -> u64 {
        self.0
    }
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Validated engine output for one request
#[derive(Debug, Clone)]
pub struct Reply {
    pub status: PacketStatus,
    pub result: Bytes,
}

/// What the dispatcher puts in a result slot
pub type Delivery = Result<Reply, ProtocolViolation>;

/// Sending half of a single-use completion signal
#[derive(Debug)]
pub struct CompletionNotifier(Sender<Delivery>);

impl CompletionNotifier {
    fn notify(self, delivery: Delivery) {
        // Capacity one and a single send: never blocks, and a vanished waiter
        // has nothing left to tell.
        let _ = self.0.try_send(delivery);
    }
}

/// Receiving half of a single-use completion signal
#[derive(Debug)]
pub struct CompletionWaiter(Receiver<Delivery>);

/// Why a wait ended without a delivery
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitError {
    Timeout,
    Disconnected,
}

impl CompletionWaiter {
    /// Block until delivered, or until `timeout` elapses when one is given
    pub fn wait(&self, timeout: Option<Duration>) -> Result<Delivery, WaitError> {
        match timeout {
            Some(timeout) => self.0.recv_timeout(timeout).map_err(|e| match e {
                RecvTimeoutError::Timeout => WaitError::Timeout,
                RecvTimeoutError::Disconnected => WaitError::Disconnected,
            }),
            None => self.0.recv().map_err(|_| WaitError::Disconnected),
        }
    }

    /// Take a delivery that is already present
    pub fn try_take(&self) -> Result<Delivery, WaitError> {
        self.0.try_recv().map_err(|e| match e {
            TryRecvError::Empty => WaitError::Timeout,
            TryRecvError::Disconnected => WaitError::Disconnected,
        })
    }
}

/// Single-use completion signal with a one-slot buffer
pub fn completion_signal() -> (CompletionNotifier, CompletionWaiter) {
    let (tx, rx) = bounded(1);
    (CompletionNotifier(tx), CompletionWaiter(rx))
}

#[derive(Debug)]
enum RecordState {
    Pending(CompletionNotifier),
    Completed,
    Abandoned,
}

/// How [`RequestRecord::complete`] resolved
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompleteOutcome {
    /// Handed to the waiting caller
    Delivered,
    /// The caller gave up; the record is now an orphan
    Abandoned,
    /// A completion was already delivered
    AlreadyCompleted,
}

/// Bookkeeping for one in-flight request
#[derive(Debug)]
pub struct RequestRecord {
    id: RequestId,
    packet: Packet,
    operation: Operation,
    event_count: u32,
    request_len: usize,
    state: Mutex<RecordState>,
}

impl RequestRecord {
    pub fn new(
        id: RequestId,
        packet: Packet,
        operation: Operation,
        event_count: u32,
        request_len: usize,
    ) -> (Arc<Self>, CompletionWaiter) {
        let (notifier, waiter) = completion_signal();
        let record = Arc::new(Self {
            id,
            packet,
            operation,
            event_count,
            request_len,
            state: Mutex::new(RecordState::Pending(notifier)),
        });
        (record, waiter)
    }

    pub fn id(&self) -> RequestId {
        self.id
    }

    pub fn packet(&self) -> Packet {
        self.packet
    }

    pub fn operation(&self) -> Operation {
        self.operation
    }

    /// Event count the caller declared
    pub fn event_count(&self) -> u32 {
        self.event_count
    }

    /// Length of the submitted request body
    pub fn request_len(&self) -> usize {
        self.request_len
    }

    /// Fill the result slot and signal the caller, at most once
    pub fn complete(&self, delivery: Delivery) -> CompleteOutcome {
        let mut state = self.state.lock();
        match std::mem::replace(&mut *state, RecordState::Completed) {
            RecordState::Pending(notifier) => {
                notifier.notify(delivery);
                CompleteOutcome::Delivered
            }
            RecordState::Abandoned => CompleteOutcome::Abandoned,
            RecordState::Completed => CompleteOutcome::AlreadyCompleted,
        }
    }

    /// Give up waiting. Returns `false` if a delivery beat the caller to it,
    /// in which case it is waiting in the signal.
    pub fn abandon(&self) -> bool {
        let mut state = self.state.lock();
        match *state {
            RecordState::Pending(_) => {
                *state = RecordState::Abandoned;
                true
            }
            RecordState::Abandoned => true,
            RecordState::Completed => false,
        }
    }
}

/// Concurrent map from request id to in-flight record
pub struct CorrelationTable {
    entries: DashMap<RequestId, Arc<RequestRecord>>,
    next_id: AtomicU64,
    orphans: ArrayQueue<Arc<RequestRecord>>,
}

impl CorrelationTable {
    /// `capacity` bounds the orphan queue; it should match the packet pool
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: DashMap::with_capacity(capacity),
            next_id: AtomicU64::new(1),
            orphans: ArrayQueue::new(capacity.max(1)),
        }
    }

    /// Fresh identity, never zero and never reused by this table
    pub fn next_request_id(&self) -> RequestId {
        RequestId(self.next_id.fetch_add(1, Ordering::Relaxed))
    }

    /// Insert a record; an identity already in flight is a violation
    pub fn register(&self, record: Arc<RequestRecord>) -> Result<(), ProtocolViolation> {
        match self.entries.entry(record.id()) {
            Entry::Occupied(_) => Err(ProtocolViolation::DuplicateIdentity {
                request_id: record.id(),
            }),
            Entry::Vacant(slot) => {
                slot.insert(record);
                Ok(())
            }
        }
    }

    pub fn get(&self, id: RequestId) -> Option<Arc<RequestRecord>> {
        self.entries.get(&id).map(|entry| Arc::clone(entry.value()))
    }

    /// Drop the entry once its caller is done with it
    pub fn remove(&self, id: RequestId) -> Option<Arc<RequestRecord>> {
        self.entries.remove(&id).map(|(_, record)| record)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Queue an abandoned record whose completion has now arrived
    pub fn push_orphan(&self, record: Arc<RequestRecord>) {
        if let Err(record) = self.orphans.push(record) {
            tracing::error!(request_id = %record.id(), "orphan queue full, packet leaked");
        }
    }

    /// Drain orphans ready to have their packets released
    pub fn drain_orphans(&self) -> impl Iterator<Item = Arc<RequestRecord>> + '_ {
        std::iter::from_fn(move || self.orphans.pop())
    }
}

impl fmt::Debug for CorrelationTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CorrelationTable")
            .field("in_flight", &self.entries.len())
            .field("orphans", &self.orphans.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(table: &CorrelationTable, packet: usize) -> (Arc<RequestRecord>, CompletionWaiter) {
        RequestRecord::new(
            table.next_request_id(),
            Packet::from_raw(packet),
            Operation::LOOKUP_ACCOUNTS,
            1,
            16,
        )
    }

    fn ok_reply() -> Delivery {
        Ok(Reply {
            status: PacketStatus::Ok,
            result: Bytes::from_static(b"done"),
        })
    }

    #[test]
    fn test_ids_are_unique() {
        let table = CorrelationTable::new(4);
        let a = table.next_request_id();
        let b = table.next_request_id();
        assert_ne!(a, b);
        assert_ne!(a.raw(), 0);
    }

    #[test]
    fn test_register_get_remove() {
        let table = CorrelationTable::new(4);
        let (rec, _waiter) = record(&table, 1);
        table.register(Arc::clone(&rec)).unwrap();

        assert_eq!(table.len(), 1);
        assert_eq!(table.get(rec.id()).unwrap().packet(), Packet::from_raw(1));

        assert!(table.remove(rec.id()).is_some());
        assert!(table.is_empty());
        assert!(table.get(rec.id()).is_none());
    }

    #[test]
    fn test_duplicate_identity_rejected() {
        let table = CorrelationTable::new(4);
        let (rec, _waiter) = record(&table, 1);
        table.register(Arc::clone(&rec)).unwrap();

        let (twin, _twin_waiter) =
            RequestRecord::new(rec.id(), Packet::from_raw(2), Operation::PULSE, 1, 0);
        assert_eq!(
            table.register(twin),
            Err(ProtocolViolation::DuplicateIdentity { request_id: rec.id() })
        );
        // The original registration is untouched.
        assert_eq!(table.get(rec.id()).unwrap().packet(), Packet::from_raw(1));
    }

    #[test]
    fn test_complete_once() {
        let table = CorrelationTable::new(4);
        let (rec, waiter) = record(&table, 1);

        assert_eq!(rec.complete(ok_reply()), CompleteOutcome::Delivered);
        assert_eq!(rec.complete(ok_reply()), CompleteOutcome::AlreadyCompleted);

        let reply = waiter.wait(None).unwrap().unwrap();
        assert_eq!(reply.result.as_ref(), b"done");
        assert_eq!(waiter.try_take().unwrap_err(), WaitError::Disconnected);
    }

    #[test]
    fn test_wait_times_out() {
        let table = CorrelationTable::new(4);
        let (_rec, waiter) = record(&table, 1);
        assert_eq!(
            waiter.wait(Some(Duration::from_millis(5))).unwrap_err(),
            WaitError::Timeout
        );
    }

    #[test]
    fn test_abandon_then_complete_is_orphaned() {
        let table = CorrelationTable::new(4);
        let (rec, _waiter) = record(&table, 1);

        assert!(rec.abandon());
        assert_eq!(rec.complete(ok_reply()), CompleteOutcome::Abandoned);
        assert_eq!(rec.complete(ok_reply()), CompleteOutcome::AlreadyCompleted);
        table.push_orphan(Arc::clone(&rec));

        let orphans: Vec<_> = table.drain_orphans().collect();
        assert_eq!(orphans.len(), 1);
        assert_eq!(orphans[0].id(), rec.id());
        assert_eq!(table.drain_orphans().count(), 0);
    }

    #[test]
    fn test_abandon_loses_race_to_delivery() {
        let table = CorrelationTable::new(4);
        let (rec, waiter) = record(&table, 1);

        assert_eq!(rec.complete(ok_reply()), CompleteOutcome::Delivered);
        assert!(!rec.abandon());
        assert!(waiter.try_take().unwrap().is_ok());
    }

    #[test]
    fn test_concurrent_register_and_remove() {
        let table = Arc::new(CorrelationTable::new(64));

        std::thread::scope(|s| {
            for t in 0..8 {
                let table = Arc::clone(&table);
                s.spawn(move || {
                    for i in 0..500 {
                        let (rec, _waiter) = record(&table, t * 1000 + i);
                        let id = rec.id();
                        table.register(rec).unwrap();
                        assert!(table.get(id).is_some());
                        assert!(table.remove(id).is_some());
                    }
                });
            }
        });

        assert!(table.is_empty());
    }
}

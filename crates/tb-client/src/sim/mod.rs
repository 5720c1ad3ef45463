//! In-process simulated engine
//!
//! Same contract as the native engine: a bounded packet pool, a single
//! completion thread, and one completion per submitted packet. Requests run
//! against an in-memory [`ledger`]. Faults can be injected to exercise the
//! client's protocol checks.

mod ledger;

use crate::config::ClientConfig;
use crate::engine::{AcquireError, Completion, CompletionSink, Engine, Packet, Submission};
use crate::error::InitError;
use crate::operation::PacketStatus;
use crossbeam::channel::{unbounded, Receiver, RecvTimeoutError, Sender};
use crossbeam::queue::ArrayQueue;
use ledger::Ledger;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

/// Largest request or result body the engine accepts
pub const MESSAGE_BODY_MAX: usize = 1024 * 1024 - 256;

const IDLE_POLL: Duration = Duration::from_millis(5);

#[derive(Debug, Clone)]
pub struct SimOptions {
    /// Request bodies above this size complete with `TooMuchData`
    pub message_body_max: usize,
    /// Added before every request runs
    pub latency: Option<Duration>,
}

impl Default for SimOptions {
    fn default() -> Self {
        Self {
            message_body_max: MESSAGE_BODY_MAX,
            latency: None,
        }
    }
}

/// Misbehaviour applied to the next completion
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SimFault {
    /// Result length that is not a multiple of the element size
    CorruptResultLength,
    /// One more result element than the request had events
    ExtraResults,
    /// Completion reported on a packet that was never submitted
    WrongPacket,
    /// Completion reported twice
    DuplicateCompletion,
    /// Completion held back
    Delay(Duration),
}

struct Pool {
    free: ArrayQueue<usize>,
    leased: Vec<AtomicBool>,
    shutdown: AtomicBool,
    terminate: AtomicBool,
}

impl Pool {
    fn new(capacity: usize) -> Self {
        let free = ArrayQueue::new(capacity);
        for slot in 0..capacity {
            let _ = free.push(slot);
        }
        Self {
            free,
            leased: (0..capacity).map(|_| AtomicBool::new(false)).collect(),
            shutdown: AtomicBool::new(false),
            terminate: AtomicBool::new(false),
        }
    }

    fn capacity(&self) -> usize {
        self.leased.len()
    }

    fn slot(&self, packet: Packet) -> Option<usize> {
        packet
            .raw()
            .checked_sub(1)
            .filter(|slot| *slot < self.capacity())
    }

    fn idle_after_shutdown(&self) -> bool {
        self.terminate.load(Ordering::Acquire)
            || (self.shutdown.load(Ordering::SeqCst) && self.free.len() == self.capacity())
    }
}

struct Job {
    packet: Packet,
    submission: Submission,
}

/// Simulated engine
pub struct SimEngine {
    pool: Arc<Pool>,
    faults: Arc<Mutex<VecDeque<SimFault>>>,
    jobs: Sender<Job>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl SimEngine {
    /// Queue a fault for the next completion the engine reports
    pub fn inject(&self, fault: SimFault) {
        self.faults.lock().push_back(fault);
    }

    /// Packets currently leased
    pub fn leased(&self) -> usize {
        self.pool.capacity() - self.pool.free.len()
    }
}

impl Engine for SimEngine {
    type Options = SimOptions;

    fn init(
        config: &ClientConfig,
        options: SimOptions,
        sink: Arc<dyn CompletionSink>,
    ) -> Result<Self, InitError> {
        if config.concurrency_max == 0 {
            return Err(InitError::InvalidConcurrencyMax);
        }
        if config.addresses.is_empty() {
            return Err(InitError::InvalidAddress);
        }

        let pool = Arc::new(Pool::new(config.concurrency_max as usize));
        let faults = Arc::new(Mutex::new(VecDeque::new()));
        let (jobs, rx) = unbounded();

        let worker = Worker {
            pool: Arc::clone(&pool),
            faults: Arc::clone(&faults),
            sink,
            jobs: rx,
            ledger: Ledger::new(),
            options,
        };
        let handle = thread::Builder::new()
            .name("tb-sim-engine".into())
            .spawn(move || worker.run())
            .map_err(|e| {
                tracing::error!(error = %e, "failed to spawn simulated engine thread");
                InitError::SystemResources
            })?;

        tracing::info!(
            cluster_id = %config.cluster_id,
            concurrency_max = config.concurrency_max,
            "simulated engine started"
        );

        Ok(Self {
            pool,
            faults,
            jobs,
            worker: Mutex::new(Some(handle)),
        })
    }

    fn acquire_packet(&self) -> Result<Packet, AcquireError> {
        if self.pool.shutdown.load(Ordering::Acquire) {
            return Err(AcquireError::Shutdown);
        }
        let slot = self.pool.free.pop().ok_or(AcquireError::ConcurrencyExceeded)?;
        // Lost a race with deinit: the worker may already have seen an idle pool.
        if self.pool.shutdown.load(Ordering::SeqCst) {
            let _ = self.pool.free.push(slot);
            return Err(AcquireError::Shutdown);
        }
        self.pool.leased[slot].store(true, Ordering::Release);
        Ok(Packet::from_raw(slot + 1))
    }

    fn release_packet(&self, packet: Packet) {
        let Some(slot) = self.pool.slot(packet) else {
            tracing::error!(?packet, "release of a packet this engine never issued");
            return;
        };
        if !self.pool.leased[slot].swap(false, Ordering::AcqRel) {
            tracing::error!(?packet, "packet released twice");
            return;
        }
        let _ = self.pool.free.push(slot);
    }

    fn submit(&self, packet: Packet, submission: Submission) {
        if self.jobs.send(Job { packet, submission }).is_err() {
            tracing::error!(?packet, "simulated engine thread is gone, submission dropped");
        }
    }

    fn deinit(&self) {
        if !self.pool.shutdown.swap(true, Ordering::SeqCst) {
            tracing::info!("simulated engine shutting down");
        }
    }
}

impl Drop for SimEngine {
    fn drop(&mut self) {
        self.pool.shutdown.store(true, Ordering::Release);
        self.pool.terminate.store(true, Ordering::Release);
        if let Some(handle) = self.worker.lock().take() {
            if handle.join().is_err() {
                tracing::error!("simulated engine thread panicked");
            }
        }
    }
}

struct Worker {
    pool: Arc<Pool>,
    faults: Arc<Mutex<VecDeque<SimFault>>>,
    sink: Arc<dyn CompletionSink>,
    jobs: Receiver<Job>,
    ledger: Ledger,
    options: SimOptions,
}

impl Worker {
    fn run(mut self) {
        loop {
            match self.jobs.recv_timeout(IDLE_POLL) {
                Ok(job) => self.process(job),
                Err(RecvTimeoutError::Timeout) => {
                    if self.pool.idle_after_shutdown() {
                        break;
                    }
                }
                Err(RecvTimeoutError::Disconnected) => break,
            }
        }
        tracing::debug!("simulated engine thread stopped");
    }

    fn process(&mut self, job: Job) {
        if let Some(latency) = self.options.latency {
            thread::sleep(latency);
        }

        let Job { packet, submission } = job;
        let operation = submission.operation;

        let (status, mut result) =
            match self
                .ledger
                .execute(operation, &submission.data, self.options.message_body_max)
            {
                Ok(result) => (PacketStatus::Ok, result.to_vec()),
                Err(status) => {
                    tracing::debug!(
                        request_id = %submission.request_id,
                        %operation,
                        %status,
                        "request rejected"
                    );
                    (status, Vec::new())
                }
            };

        let mut reported = packet;
        let mut repeat = 1;
        let fault = self.faults.lock().pop_front();
        match fault {
            Some(SimFault::CorruptResultLength) => {
                if result.pop().is_none() {
                    result.push(0);
                }
            }
            Some(SimFault::ExtraResults) => {
                let size = operation.result_size().max(1);
                result = vec![0; (submission.event_count as usize + 1) * size];
            }
            Some(SimFault::WrongPacket) => {
                reported = Packet::from_raw(packet.raw() + self.pool.capacity());
            }
            Some(SimFault::DuplicateCompletion) => repeat = 2,
            Some(SimFault::Delay(delay)) => thread::sleep(delay),
            None => {}
        }
        if let Some(fault) = fault {
            tracing::debug!(request_id = %submission.request_id, ?fault, "fault injected");
        }

        for _ in 0..repeat {
            self.sink.on_completion(Completion {
                packet: reported,
                request_id: submission.request_id,
                operation,
                status,
                request_len: submission.data.len(),
                result: &result,
            });
        }
        // The request bytes stay alive until the completion has been reported.
        drop(submission);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::correlation::RequestId;
    use crate::operation::Operation;
    use bytes::Bytes;
    use crossbeam::channel::bounded;

    struct ChannelSink(Sender<(Packet, RequestId, PacketStatus, Vec<u8>)>);

    impl CompletionSink for ChannelSink {
        fn on_completion(&self, c: Completion<'_>) {
            let _ = self.0.send((c.packet, c.request_id, c.status, c.result.to_vec()));
        }
    }

    fn engine(concurrency_max: u32) -> (SimEngine, Receiver<(Packet, RequestId, PacketStatus, Vec<u8>)>) {
        let (tx, rx) = bounded(64);
        let config = ClientConfig::default().with_concurrency_max(concurrency_max);
        let engine = SimEngine::init(&config, SimOptions::default(), Arc::new(ChannelSink(tx))).unwrap();
        (engine, rx)
    }

    fn submission(id: u64, operation: Operation, data: Vec<u8>) -> Submission {
        Submission {
            request_id: RequestId::from_raw(id),
            operation,
            event_count: 1,
            data: Bytes::from(data),
        }
    }

    #[test]
    fn test_pool_is_bounded() {
        let (engine, _rx) = engine(2);
        let a = engine.acquire_packet().unwrap();
        let b = engine.acquire_packet().unwrap();
        assert_ne!(a, b);
        assert_eq!(engine.acquire_packet(), Err(AcquireError::ConcurrencyExceeded));
        assert_eq!(engine.leased(), 2);

        engine.release_packet(a);
        assert_eq!(engine.leased(), 1);
        assert!(engine.acquire_packet().is_ok());
    }

    #[test]
    fn test_double_release_is_ignored() {
        let (engine, _rx) = engine(2);
        let a = engine.acquire_packet().unwrap();
        engine.release_packet(a);
        engine.release_packet(a);
        engine.release_packet(Packet::from_raw(999));
        assert_eq!(engine.leased(), 0);
        assert!(engine.acquire_packet().is_ok());
        assert!(engine.acquire_packet().is_ok());
        assert!(engine.acquire_packet().is_err());
    }

    #[test]
    fn test_completion_carries_identity() {
        let (engine, rx) = engine(4);
        let packet = engine.acquire_packet().unwrap();
        engine.submit(packet, submission(7, Operation::LOOKUP_ACCOUNTS, vec![0; 16]));

        let (reported, id, status, result) = rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert_eq!(reported, packet);
        assert_eq!(id, RequestId::from_raw(7));
        assert_eq!(status, PacketStatus::Ok);
        assert!(result.is_empty());
    }

    #[test]
    fn test_unknown_operation() {
        let (engine, rx) = engine(4);
        let packet = engine.acquire_packet().unwrap();
        engine.submit(packet, submission(1, Operation::from_raw(7), vec![1]));

        let (_, _, status, _) = rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert_eq!(status, PacketStatus::InvalidOperation);
    }

    #[test]
    fn test_injected_faults() {
        let (engine, rx) = engine(4);
        let packet = engine.acquire_packet().unwrap();

        engine.inject(SimFault::WrongPacket);
        engine.submit(packet, submission(1, Operation::LOOKUP_ACCOUNTS, vec![0; 16]));
        let (reported, _, _, _) = rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert_ne!(reported, packet);

        engine.inject(SimFault::DuplicateCompletion);
        engine.submit(packet, submission(2, Operation::LOOKUP_ACCOUNTS, vec![0; 16]));
        assert!(rx.recv_timeout(Duration::from_secs(5)).is_ok());
        assert!(rx.recv_timeout(Duration::from_secs(5)).is_ok());

        engine.inject(SimFault::CorruptResultLength);
        engine.submit(packet, submission(3, Operation::LOOKUP_ACCOUNTS, vec![0; 16]));
        let (_, _, _, result) = rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert_eq!(result.len(), 1);
    }

    #[test]
    fn test_deinit_refuses_new_packets() {
        let (engine, rx) = engine(4);
        let packet = engine.acquire_packet().unwrap();
        engine.deinit();
        assert_eq!(engine.acquire_packet(), Err(AcquireError::Shutdown));

        // Already leased packets still complete.
        engine.submit(packet, submission(1, Operation::LOOKUP_ACCOUNTS, vec![0; 16]));
        assert!(rx.recv_timeout(Duration::from_secs(5)).is_ok());
        engine.release_packet(packet);
    }
}

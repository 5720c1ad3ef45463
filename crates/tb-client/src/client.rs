//! Synchronous client
//!
//! [`Client::execute`] turns the engine's submit-and-callback model into a
//! blocking call: lease a packet, register the request, submit, wait for the
//! dispatcher to fill the result slot, then release everything. Any number of
//! threads may call it concurrently on a shared client, up to the engine's
//! packet budget.

use crate::bindings::{
    decode_batch, encode_batch, merge_sparse, Account, AccountBalance, AccountFilter,
    CreateAccountResult, CreateAccountsResult, CreateResultEntry, CreateTransferResult,
    CreateTransfersResult, Transfer, Wire,
};
use crate::config::ClientConfig;
use crate::correlation::{CorrelationTable, RequestId, RequestRecord, WaitError};
use crate::dispatch::Dispatcher;
use crate::engine::{AcquireError, CompletionSink, Engine, Packet, Submission};
use crate::error::{ClientError, InitError, ProtocolViolation, Result};
use crate::operation::{Operation, PacketStatus};
use bytes::Bytes;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tb_common::{IdGenerator, IdSource, UInt128};

/// Client bound to one engine instance
pub struct Client<E: Engine> {
    config: ClientConfig,
    engine: E,
    table: Arc<CorrelationTable>,
    dispatcher: Arc<Dispatcher>,
    ids: Box<dyn IdSource>,
    closed: AtomicBool,
}

/// Packet lease held by one `execute` call; released on every exit path
struct Lease<'a, E: Engine> {
    client: &'a Client<E>,
    packet: Packet,
    request_id: Option<RequestId>,
    armed: bool,
}

impl<E: Engine> Lease<'_, E> {
    /// Leave the packet leased; it is reclaimed from the orphan queue later
    fn disarm(&mut self) {
        self.armed = false;
    }
}

impl<E: Engine> Drop for Lease<'_, E> {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        if let Some(id) = self.request_id {
            self.client.table.remove(id);
        }
        self.client.engine.release_packet(self.packet);
    }
}

impl<E: Engine> Client<E> {
    /// Start an engine with default engine options
    pub fn new(config: ClientConfig) -> std::result::Result<Self, InitError> {
        Self::with_options(config, E::Options::default())
    }

    /// Start an engine with explicit engine options
    ///
    /// The configuration is validated before the engine is touched.
    pub fn with_options(
        config: ClientConfig,
        options: E::Options,
    ) -> std::result::Result<Self, InitError> {
        config.validate()?;

        let table = Arc::new(CorrelationTable::new(config.concurrency_max as usize));
        let dispatcher = Arc::new(Dispatcher::new(Arc::clone(&table)));
        let sink: Arc<dyn CompletionSink> = Arc::clone(&dispatcher) as Arc<dyn CompletionSink>;
        let engine = E::init(&config, options, sink)?;

        tracing::info!(
            cluster_id = %config.cluster_id,
            addresses = %config.address_list(),
            concurrency_max = config.concurrency_max,
            "client initialized"
        );

        Ok(Self {
            config,
            engine,
            table,
            dispatcher,
            ids: Box::new(IdGenerator::new()),
            closed: AtomicBool::new(false),
        })
    }

    /// Replace the identifier source used by [`Client::next_id`]
    pub fn with_id_source(mut self, ids: impl IdSource + 'static) -> Self {
        self.ids = Box::new(ids);
        self
    }

    /// Configuration the client was started with
    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    /// The engine this client drives
    pub fn engine(&self) -> &E {
        &self.engine
    }

    /// Fresh identifier for a new account or transfer
    ///
    /// Strictly greater than every identifier this client handed out before.
    pub fn next_id(&self) -> Result<UInt128> {
        self.ids.next_id().map_err(|e| {
            tracing::error!(error = %e, "identifier generation failed");
            ClientError::Id(e)
        })
    }

    /// Requests registered and not yet released
    pub fn in_flight(&self) -> usize {
        self.table.len()
    }

    /// Whether [`Client::close`] has been called
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Submit one request and block until its result arrives
    ///
    /// `request` must hold exactly `event_count` elements of `operation`'s
    /// event size; a mismatch is rejected before anything reaches the engine.
    /// Operations the client does not know are passed through unchecked. The
    /// returned bytes are an independent copy of the engine's result.
    pub fn execute(&self, operation: Operation, event_count: usize, request: Bytes) -> Result<Bytes> {
        if event_count == 0 {
            return Err(ClientError::EmptyBatch);
        }
        if self.is_closed() {
            return Err(ClientError::ClientClosed);
        }
        if let Some(violation) = self.dispatcher.poisoned() {
            return Err(ClientError::ProtocolViolation(violation.clone()));
        }
        check_request_len(operation, event_count, request.len())?;
        let event_count =
            u32::try_from(event_count).map_err(|_| ClientError::MaximumBatchSizeExceeded)?;

        self.reap_orphans();

        let packet = self.engine.acquire_packet().map_err(|e| match e {
            AcquireError::ConcurrencyExceeded => ClientError::ConcurrencyExceeded,
            AcquireError::Shutdown => ClientError::ClientClosed,
        })?;
        let mut lease = Lease {
            client: self,
            packet,
            request_id: None,
            armed: true,
        };

        let request_id = self.table.next_request_id();
        let (record, waiter) =
            RequestRecord::new(request_id, packet, operation, event_count, request.len());
        self.table
            .register(Arc::clone(&record))
            .map_err(|violation| self.fail(violation))?;
        lease.request_id = Some(request_id);

        tracing::debug!(
            request_id = %request_id,
            %operation,
            events = event_count,
            bytes = request.len(),
            "submitting request"
        );
        self.engine.submit(
            packet,
            Submission {
                request_id,
                operation,
                data: request,
                event_count,
            },
        );

        let delivery = match waiter.wait(self.config.request_timeout()) {
            Ok(delivery) => delivery,
            Err(WaitError::Timeout) if record.abandon() => {
                // The engine still owns the packet until it completes.
                lease.disarm();
                tracing::warn!(request_id = %request_id, %operation, "request timed out");
                return Err(ClientError::Timeout);
            }
            Err(WaitError::Timeout) => waiter
                .try_take()
                .map_err(|_| self.fail(ProtocolViolation::CompletionLost { request_id }))?,
            Err(WaitError::Disconnected) => {
                return Err(self.fail(ProtocolViolation::CompletionLost { request_id }));
            }
        };

        // Violations were already logged and recorded by the dispatcher.
        let reply = delivery?;
        match reply.status {
            PacketStatus::Ok => Ok(reply.result),
            PacketStatus::TooMuchData => Err(ClientError::MaximumBatchSizeExceeded),
            PacketStatus::InvalidOperation => Err(ClientError::InvalidOperation),
            status => Err(self.fail(ProtocolViolation::UnexpectedStatus { request_id, status })),
        }
    }

    /// Stop admitting requests and shut the engine down; idempotent
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.engine.deinit();
        self.reap_orphans();
        tracing::info!(in_flight = self.table.len(), "client closed");
    }

    fn fail(&self, violation: ProtocolViolation) -> ClientError {
        self.dispatcher.poison(violation.clone());
        ClientError::ProtocolViolation(violation)
    }

    /// Release packets of abandoned requests the engine has finished with
    fn reap_orphans(&self) {
        for record in self.table.drain_orphans() {
            self.table.remove(record.id());
            self.engine.release_packet(record.packet());
            tracing::debug!(request_id = %record.id(), "reclaimed packet of abandoned request");
        }
    }

    fn execute_batch<T: Wire>(&self, operation: Operation, items: &[T]) -> Result<Bytes> {
        self.execute(operation, items.len(), encode_batch(items))
    }

    fn decode<T: Wire>(&self, operation: Operation, body: &[u8]) -> Result<Vec<T>> {
        decode_batch(operation, body).map_err(|violation| self.fail(violation))
    }

    fn merge<R: Copy>(
        &self,
        operation: Operation,
        count: usize,
        body: &[u8],
        ok: R,
        convert: impl Fn(u32) -> Option<R>,
    ) -> Result<Vec<R>> {
        let sparse: Vec<CreateResultEntry> = self.decode(operation, body)?;
        merge_sparse(operation, count, &sparse, ok, convert).map_err(|violation| self.fail(violation))
    }

    // =========================================================================
    // Typed operations
    // =========================================================================

    /// One result per account, in batch order
    pub fn create_accounts(&self, accounts: &[Account]) -> Result<Vec<CreateAccountsResult>> {
        let op = Operation::CREATE_ACCOUNTS;
        let body = self.execute_batch(op, accounts)?;
        let dense = self.merge(op, accounts.len(), &body, CreateAccountResult::Ok, CreateAccountResult::from_raw)?;
        Ok(dense
            .into_iter()
            .enumerate()
            .map(|(index, result)| CreateAccountsResult { index: index as u32, result })
            .collect())
    }

    /// One result per transfer, in batch order
    pub fn create_transfers(&self, transfers: &[Transfer]) -> Result<Vec<CreateTransfersResult>> {
        let op = Operation::CREATE_TRANSFERS;
        let body = self.execute_batch(op, transfers)?;
        let dense = self.merge(op, transfers.len(), &body, CreateTransferResult::Ok, CreateTransferResult::from_raw)?;
        Ok(dense
            .into_iter()
            .enumerate()
            .map(|(index, result)| CreateTransfersResult { index: index as u32, result })
            .collect())
    }

    /// Accounts that exist, in request order
    pub fn lookup_accounts(&self, ids: &[UInt128]) -> Result<Vec<Account>> {
        let op = Operation::LOOKUP_ACCOUNTS;
        let body = self.execute_batch(op, ids)?;
        self.decode(op, &body)
    }

    /// Transfers that exist, in request order
    pub fn lookup_transfers(&self, ids: &[UInt128]) -> Result<Vec<Transfer>> {
        let op = Operation::LOOKUP_TRANSFERS;
        let body = self.execute_batch(op, ids)?;
        self.decode(op, &body)
    }

    /// Transfers touching the filter's account, at most `filter.limit`
    pub fn get_account_transfers(&self, filter: &AccountFilter) -> Result<Vec<Transfer>> {
        let op = Operation::GET_ACCOUNT_TRANSFERS;
        let body = self.execute_batch(op, std::slice::from_ref(filter))?;
        self.decode(op, &body)
    }

    /// Balance history of the filter's account, which must have `HISTORY` set
    pub fn get_account_balances(&self, filter: &AccountFilter) -> Result<Vec<AccountBalance>> {
        let op = Operation::GET_ACCOUNT_BALANCES;
        let body = self.execute_batch(op, std::slice::from_ref(filter))?;
        self.decode(op, &body)
    }
}

/// Body length the engine will accept for `event_count` events
fn check_request_len(operation: Operation, event_count: usize, len: usize) -> Result<()> {
    if u32::try_from(len).is_err() {
        return Err(ClientError::MaximumBatchSizeExceeded);
    }
    let event_size = operation.event_size();
    if event_size == 0 {
        return Ok(());
    }
    let expected = event_count
        .checked_mul(event_size)
        .ok_or(ClientError::MaximumBatchSizeExceeded)?;
    if len != expected {
        return Err(ClientError::InvalidDataSize {
            operation,
            expected,
            actual: len,
        });
    }
    Ok(())
}

impl<E: Engine> Drop for Client<E> {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bindings::{AccountFlags, TransferFlags};
    use crate::error::ErrorCategory;
    use crate::sim::{SimEngine, SimFault, SimOptions};
    use crate::telemetry::init_test_tracing;
    use tb_common::IdError;
    use std::collections::HashSet;
    use std::time::Duration;

    fn client(concurrency_max: u32) -> Client<SimEngine> {
        init_test_tracing();
        let config = ClientConfig::default().with_concurrency_max(concurrency_max);
        Client::new(config).unwrap()
    }

    fn id(v: u128) -> UInt128 {
        UInt128::new(v)
    }

    fn open_accounts(client: &Client<SimEngine>) {
        let results = client
            .create_accounts(&[
                Account::new(id(1), 700, 10).with_flags(AccountFlags::HISTORY),
                Account::new(id(2), 700, 10),
            ])
            .unwrap();
        assert!(results.iter().all(|r| r.result == CreateAccountResult::Ok));
    }

    #[test]
    fn test_create_and_lookup_accounts() {
        let client = client(8);
        open_accounts(&client);

        let accounts = client.lookup_accounts(&[id(1), id(2)]).unwrap();
        assert_eq!(accounts.len(), 2);
        assert_eq!(accounts[0].id, id(1));
        assert_eq!(accounts[0].ledger, 700);
        assert!(accounts[0].debits_posted.is_zero());
        assert_eq!(client.in_flight(), 0);
    }

    #[test]
    fn test_create_results_are_dense_and_ordered() {
        let client = client(8);
        let results = client
            .create_accounts(&[
                Account::new(id(1), 700, 10),
                Account::new(UInt128::ZERO, 700, 10),
                Account::new(id(1), 700, 11),
            ])
            .unwrap();

        let outcomes: Vec<_> = results.iter().map(|r| (r.index, r.result)).collect();
        assert_eq!(
            outcomes,
            vec![
                (0, CreateAccountResult::Ok),
                (1, CreateAccountResult::IdMustNotBeZero),
                (2, CreateAccountResult::ExistsWithDifferentCode),
            ]
        );
    }

    #[test]
    fn test_transfer_moves_balances() {
        let client = client(8);
        open_accounts(&client);

        let results = client
            .create_transfers(&[Transfer::new(id(10), id(1), id(2), 100, 700, 1)])
            .unwrap();
        assert_eq!(results[0].result, CreateTransferResult::Ok);

        let accounts = client.lookup_accounts(&[id(1), id(2)]).unwrap();
        assert_eq!(accounts[0].debits_posted, id(100));
        assert_eq!(accounts[1].credits_posted, id(100));

        let transfers = client.lookup_transfers(&[id(10)]).unwrap();
        assert_eq!(transfers.len(), 1);
        assert_eq!(transfers[0].amount, id(100));
        assert_ne!(transfers[0].timestamp, 0);
    }

    #[test]
    fn test_linked_chain_fails_atomically() {
        let client = client(8);
        open_accounts(&client);

        let linked = Transfer::new(id(10), id(1), id(2), 100, 700, 1).with_flags(TransferFlags::LINKED);
        let duplicate = Transfer::new(id(10), id(1), id(2), 100, 700, 1);
        let results = client.create_transfers(&[linked, duplicate]).unwrap();

        assert_eq!(results[0].result, CreateTransferResult::LinkedEventFailed);
        assert_eq!(results[1].result, CreateTransferResult::ExistsWithDifferentFlags);

        let accounts = client.lookup_accounts(&[id(1), id(2)]).unwrap();
        assert!(accounts[0].debits_posted.is_zero());
        assert!(accounts[1].credits_posted.is_zero());
    }

    #[test]
    fn test_range_queries() {
        let client = client(8);
        open_accounts(&client);
        let transfers: Vec<_> = (0..3)
            .map(|i| Transfer::new(id(100 + i), id(1), id(2), 5, 700, 1))
            .collect();
        client.create_transfers(&transfers).unwrap();

        let filter = AccountFilter::new(id(1));
        let found = client.get_account_transfers(&filter).unwrap();
        assert_eq!(found.iter().map(|t| t.id).collect::<Vec<_>>(), vec![id(100), id(101), id(102)]);

        let balances = client.get_account_balances(&filter).unwrap();
        assert_eq!(balances.len(), 3);
        assert_eq!(balances[2].debits_posted, id(15));
    }

    #[test]
    fn test_empty_batch_never_acquires_a_packet() {
        let client = client(1);
        assert_eq!(client.create_accounts(&[]), Err(ClientError::EmptyBatch));
        assert_eq!(client.lookup_transfers(&[]), Err(ClientError::EmptyBatch));
        assert_eq!(client.engine().leased(), 0);
        assert!(client.lookup_accounts(&[id(1)]).unwrap().is_empty());
    }

    #[test]
    fn test_invalid_operation_is_a_ping() {
        let client = client(4);
        let result = client.execute(Operation::from_raw(7), 1, Bytes::from_static(&[0]));
        assert_eq!(result, Err(ClientError::InvalidOperation));
        assert_eq!(client.engine().leased(), 0);
        // Not a protocol violation: the client keeps working.
        assert!(client.lookup_accounts(&[id(1)]).is_ok());
    }

    #[test]
    fn test_mismatched_body_rejected_before_submit() {
        let client = client(4);
        open_accounts(&client);

        let err = client
            .execute(Operation::LOOKUP_ACCOUNTS, 1, Bytes::from(vec![0u8; 15]))
            .unwrap_err();
        assert_eq!(
            err,
            ClientError::InvalidDataSize {
                operation: Operation::LOOKUP_ACCOUNTS,
                expected: 16,
                actual: 15,
            }
        );
        assert_eq!(err.category(), ErrorCategory::Validation);

        // Overstating the event count is caught the same way.
        let err = client
            .execute(Operation::LOOKUP_ACCOUNTS, 500, encode_batch(&[id(1)]))
            .unwrap_err();
        assert!(matches!(err, ClientError::InvalidDataSize { expected: 8000, actual: 16, .. }));

        assert_eq!(client.engine().leased(), 0);
        assert_eq!(client.in_flight(), 0);
        // The client is not poisoned.
        assert_eq!(client.lookup_accounts(&[id(1), id(2)]).unwrap().len(), 2);
    }

    #[test]
    fn test_event_count_overflow() {
        let client = client(4);
        assert_eq!(
            client.execute(Operation::LOOKUP_ACCOUNTS, usize::MAX, Bytes::from_static(&[0; 16])),
            Err(ClientError::MaximumBatchSizeExceeded)
        );
        assert!(client.lookup_accounts(&[id(1)]).is_ok());
    }

    #[test]
    fn test_next_id_is_monotonic() {
        let client = client(4);
        let first = client.next_id().unwrap();
        let second = client.next_id().unwrap();
        assert!(second > first);

        let results = client
            .create_accounts(&[Account::new(first, 700, 10), Account::new(second, 700, 10)])
            .unwrap();
        assert!(results.iter().all(|r| r.result == CreateAccountResult::Ok));
    }

    struct DrainedEntropy;

    impl IdSource for DrainedEntropy {
        fn next_id(&self) -> tb_common::IdResult<UInt128> {
            Err(IdError::EntropyUnavailable("no entropy".into()))
        }
    }

    #[test]
    fn test_id_failure_is_a_resource_error() {
        let client = client(4).with_id_source(DrainedEntropy);
        let err = client.next_id().unwrap_err();
        assert!(matches!(err, ClientError::Id(IdError::EntropyUnavailable(_))));
        assert_eq!(err.category(), ErrorCategory::Resource);
        // Requests are unaffected.
        assert!(client.lookup_accounts(&[id(1)]).is_ok());
    }

    #[test]
    fn test_too_much_data() {
        let config = ClientConfig::default();
        let options = SimOptions {
            message_body_max: 256,
            ..SimOptions::default()
        };
        let client = Client::<SimEngine>::with_options(config, options).unwrap();

        let accounts: Vec<_> = (1..=3).map(|i| Account::new(id(i), 700, 10)).collect();
        assert_eq!(
            client.create_accounts(&accounts),
            Err(ClientError::MaximumBatchSizeExceeded)
        );
        assert_eq!(client.create_accounts(&accounts[..2]).unwrap().len(), 2);
    }

    #[test]
    fn test_concurrency_exceeded() {
        let config = ClientConfig::default().with_concurrency_max(1);
        let options = SimOptions {
            latency: Some(Duration::from_millis(200)),
            ..SimOptions::default()
        };
        let client = Client::<SimEngine>::with_options(config, options).unwrap();

        std::thread::scope(|s| {
            let slow = s.spawn(|| client.lookup_accounts(&[id(1)]));
            while client.engine().leased() == 0 {
                std::thread::yield_now();
            }
            let err = client.lookup_accounts(&[id(2)]).unwrap_err();
            assert_eq!(err, ClientError::ConcurrencyExceeded);
            assert!(err.is_retryable());
            assert!(slow.join().unwrap().is_ok());
        });
    }

    #[test]
    fn test_concurrent_transfers() {
        let client = client(64);
        open_accounts(&client);

        const THREADS: u128 = 8;
        const PER_THREAD: u128 = 50;
        std::thread::scope(|s| {
            for t in 0..THREADS {
                let client = &client;
                s.spawn(move || {
                    for i in 0..PER_THREAD {
                        let transfer_id = id(1_000 + t * PER_THREAD + i);
                        let results = client
                            .create_transfers(&[Transfer::new(transfer_id, id(1), id(2), 1, 700, 1)])
                            .unwrap();
                        assert_eq!(results[0].result, CreateTransferResult::Ok);

                        // Each caller sees its own result, never a neighbour's.
                        let found = client.lookup_transfers(&[transfer_id]).unwrap();
                        assert_eq!(found.len(), 1);
                        assert_eq!(found[0].id, transfer_id);
                    }
                });
            }
        });

        let accounts = client.lookup_accounts(&[id(1), id(2)]).unwrap();
        assert_eq!(accounts[0].debits_posted, id(THREADS * PER_THREAD));
        assert_eq!(accounts[1].credits_posted, id(THREADS * PER_THREAD));
        assert_eq!(client.in_flight(), 0);
        assert_eq!(client.engine().leased(), 0);

        let ids: HashSet<_> = client
            .get_account_transfers(&AccountFilter {
                limit: 1_000,
                ..AccountFilter::new(id(1))
            })
            .unwrap()
            .into_iter()
            .map(|t| t.id)
            .collect();
        assert_eq!(ids.len(), (THREADS * PER_THREAD) as usize);
    }

    #[test]
    fn test_bad_result_length_poisons_client() {
        let client = client(4);
        client.engine().inject(SimFault::CorruptResultLength);

        let err = client.lookup_accounts(&[id(1)]).unwrap_err();
        assert!(matches!(
            err,
            ClientError::ProtocolViolation(ProtocolViolation::InvalidResultLength { .. })
        ));
        assert_eq!(err.category(), ErrorCategory::Protocol);

        // Packet and table entry were released on the failure path.
        assert_eq!(client.engine().leased(), 0);
        assert_eq!(client.in_flight(), 0);

        // Every later request reports the first violation.
        assert_eq!(client.lookup_accounts(&[id(1)]).unwrap_err(), err);
    }

    #[test]
    fn test_extra_results_detected() {
        let client = client(4);
        client.engine().inject(SimFault::ExtraResults);
        let err = client.create_accounts(&[Account::new(id(1), 700, 10)]).unwrap_err();
        assert!(matches!(
            err,
            ClientError::ProtocolViolation(ProtocolViolation::ResultCountExceeded {
                results: 2,
                events: 1,
                ..
            })
        ));
    }

    #[test]
    fn test_wrong_packet_detected() {
        let client = client(4);
        client.engine().inject(SimFault::WrongPacket);
        let err = client.lookup_accounts(&[id(1)]).unwrap_err();
        assert!(matches!(
            err,
            ClientError::ProtocolViolation(ProtocolViolation::PacketMismatch { .. })
        ));
    }

    #[test]
    fn test_timeout_then_orphan_reclaimed() {
        init_test_tracing();
        let config = ClientConfig::default()
            .with_concurrency_max(1)
            .with_request_timeout(Duration::from_millis(20));
        let client = Client::<SimEngine>::new(config).unwrap();

        client.engine().inject(SimFault::Delay(Duration::from_millis(200)));
        let err = client.lookup_accounts(&[id(1)]).unwrap_err();
        assert_eq!(err, ClientError::Timeout);
        assert_eq!(err.category(), ErrorCategory::Timeout);

        // The only packet stays with the engine until the late completion.
        assert_eq!(client.engine().leased(), 1);
        std::thread::sleep(Duration::from_millis(400));

        // The late completion parked the record; the next call reclaims it.
        assert!(client.lookup_accounts(&[id(1)]).unwrap().is_empty());
        assert_eq!(client.engine().leased(), 0);
        assert_eq!(client.in_flight(), 0);
    }

    #[test]
    fn test_close_is_idempotent() {
        let client = client(4);
        client.close();
        client.close();
        assert!(client.is_closed());
        assert_eq!(client.lookup_accounts(&[id(1)]), Err(ClientError::ClientClosed));
    }

    #[test]
    fn test_invalid_config_rejected() {
        let config = ClientConfig::new(0, vec![]);
        assert!(matches!(
            Client::<SimEngine>::new(config),
            Err(InitError::Config(_))
        ));
    }
}

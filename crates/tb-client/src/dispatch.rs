//! Completion dispatch
//!
//! Runs on the engine's thread. Routes each completion to its request record,
//! checks the result against what was submitted, and copies the result bytes
//! out before the engine reclaims its buffer. Never blocks on a caller.

use crate::correlation::{CompleteOutcome, CorrelationTable, Reply, RequestRecord};
use crate::engine::{Completion, CompletionSink};
use crate::error::ProtocolViolation;
use bytes::Bytes;
use std::sync::{Arc, OnceLock};

/// Completion sink backed by the correlation table
///
/// The first protocol violation poisons the dispatcher; the client refuses new
/// requests from then on.
pub struct Dispatcher {
    table: Arc<CorrelationTable>,
    poison: OnceLock<ProtocolViolation>,
}

impl Dispatcher {
    /// Dispatcher routing into `table`
    pub fn new(table: Arc<CorrelationTable>) -> Self {
        Self {
            table,
            poison: OnceLock::new(),
        }
    }

    /// First violation seen, if any
    pub fn poisoned(&self) -> Option<&ProtocolViolation> {
        self.poison.get()
    }

    /// Record a violation; only the first is kept
    pub fn poison(&self, violation: ProtocolViolation) {
        tracing::error!(%violation, "protocol violation");
        let _ = self.poison.set(violation);
    }

    /// Route one completion
    ///
    /// Violations found while validating are delivered to the waiting caller.
    /// The returned error covers the ones no caller can be told about.
    pub fn dispatch(&self, completion: Completion<'_>) -> Result<(), ProtocolViolation> {
        let request_id = completion.request_id;
        let record = self
            .table
            .get(request_id)
            .ok_or(ProtocolViolation::UnknownRequest { request_id })?;

        let delivery = validate(&record, &completion).map(|()| Reply {
            status: completion.status,
            result: Bytes::copy_from_slice(completion.result),
        });
        if let Err(violation) = &delivery {
            // Recorded before the caller wakes, so its next request sees it.
            self.poison(violation.clone());
        }

        match record.complete(delivery) {
            CompleteOutcome::Delivered => {
                tracing::trace!(
                    request_id = %request_id,
                    status = %completion.status,
                    result_len = completion.result.len(),
                    "completion delivered"
                );
            }
            CompleteOutcome::Abandoned => {
                tracing::debug!(request_id = %request_id, "completion for abandoned request");
                self.table.push_orphan(record);
            }
            CompleteOutcome::AlreadyCompleted => {
                return Err(ProtocolViolation::DuplicateCompletion { request_id });
            }
        }

        Ok(())
    }
}

impl CompletionSink for Dispatcher {
    fn on_completion(&self, completion: Completion<'_>) {
        if let Err(violation) = self.dispatch(completion) {
            self.poison(violation);
        }
    }
}

/// Check a completion against the request it claims to answer
fn validate(record: &RequestRecord, completion: &Completion<'_>) -> Result<(), ProtocolViolation> {
    let request_id = record.id();

    if completion.packet != record.packet() {
        return Err(ProtocolViolation::PacketMismatch {
            request_id,
            expected: record.packet(),
            reported: completion.packet,
        });
    }
    if completion.operation != record.operation() {
        return Err(ProtocolViolation::OperationMismatch {
            request_id,
            expected: record.operation(),
            reported: completion.operation,
        });
    }
    if completion.request_len != record.request_len() {
        return Err(ProtocolViolation::RequestLengthMismatch {
            request_id,
            expected: record.request_len(),
            reported: completion.request_len,
        });
    }

    let len = completion.result.len();
    if len == 0 {
        return Ok(());
    }

    let operation = record.operation();
    let element_size = operation.result_size();
    if element_size == 0 {
        return Err(ProtocolViolation::UnexpectedResult { operation, len });
    }
    if len % element_size != 0 {
        return Err(ProtocolViolation::InvalidResultLength {
            operation,
            len,
            element_size,
        });
    }

    // Events are counted from the bytes actually submitted.
    let events = match operation.event_size() {
        0 => record.event_count() as usize,
        event_size => record.request_len() / event_size,
    };
    let results = len / element_size;
    if !operation.is_range_query() && results > events {
        return Err(ProtocolViolation::ResultCountExceeded {
            operation,
            results,
            events,
        });
    }

    Ok(())
}

//! Error types for tb-client

use crate::config::ConfigError;
use crate::correlation::RequestId;
use crate::engine::Packet;
use crate::operation::{Operation, PacketStatus};
use tb_common::IdError;
use thiserror::Error;

/// Engine initialization failure
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum InitError {
    #[error("unexpected engine failure")]
    Unexpected,

    #[error("engine out of memory")]
    OutOfMemory,

    #[error("invalid replica address")]
    InvalidAddress,

    #[error("too many replica addresses")]
    AddressLimitExceeded,

    #[error("invalid concurrency maximum")]
    InvalidConcurrencyMax,

    #[error("insufficient system resources")]
    SystemResources,

    #[error("network subsystem failure")]
    NetworkSubsystem,

    #[error("engine status {0}")]
    Other(u32),

    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),
}

impl InitError {
    /// Map a raw `tb_client_init` status; `None` means success
    pub fn from_status(status: u32) -> Option<Self> {
        match status {
            0 => None,
            1 => Some(Self::Unexpected),
            2 => Some(Self::OutOfMemory),
            3 => Some(Self::InvalidAddress),
            4 => Some(Self::AddressLimitExceeded),
            5 => Some(Self::InvalidConcurrencyMax),
            6 => Some(Self::SystemResources),
            7 => Some(Self::NetworkSubsystem),
            other => Some(Self::Other(other)),
        }
    }
}

/// Engine or decoder output that breaks the request/completion contract
///
/// Any of these means the client and engine disagree about the protocol. The
/// client stops admitting requests after the first one.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProtocolViolation {
    #[error("completion for unknown request {request_id}")]
    UnknownRequest { request_id: RequestId },

    #[error("request {request_id} completed on {reported:?}, submitted on {expected:?}")]
    PacketMismatch {
        request_id: RequestId,
        expected: Packet,
        reported: Packet,
    },

    #[error("request {request_id} completed as {reported}, submitted as {expected}")]
    OperationMismatch {
        request_id: RequestId,
        expected: Operation,
        reported: Operation,
    },

    #[error("{operation}: result length {len} is not a multiple of {element_size}")]
    InvalidResultLength {
        operation: Operation,
        len: usize,
        element_size: usize,
    },

    #[error("{operation}: {len} result bytes for an operation without results")]
    UnexpectedResult { operation: Operation, len: usize },

    #[error("{operation}: {results} results for {events} events")]
    ResultCountExceeded {
        operation: Operation,
        results: usize,
        events: usize,
    },

    #[error("request {request_id} completed for {reported} request bytes, submitted {expected}")]
    RequestLengthMismatch {
        request_id: RequestId,
        expected: usize,
        reported: usize,
    },

    #[error("request {request_id} completed twice")]
    DuplicateCompletion { request_id: RequestId },

    #[error("request identity {request_id} already in flight")]
    DuplicateIdentity { request_id: RequestId },

    #[error("request {request_id} completed with status {status}")]
    UnexpectedStatus {
        request_id: RequestId,
        status: PacketStatus,
    },

    #[error("result index {index} outside a batch of {count}")]
    ResultIndexOutOfRange { index: u32, count: usize },

    #[error("result index {index} out of order")]
    ResultIndexOutOfOrder { index: u32 },

    #[error("{operation}: unknown result code {code}")]
    UnknownResultCode { operation: Operation, code: u32 },

    #[error("completion signal for request {request_id} dropped")]
    CompletionLost { request_id: RequestId },
}

/// Request failure reported to the caller
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ClientError {
    #[error("batch is empty")]
    EmptyBatch,

    #[error("client is closed")]
    ClientClosed,

    #[error("maximum concurrency exceeded")]
    ConcurrencyExceeded,

    #[error("maximum batch size exceeded")]
    MaximumBatchSizeExceeded,

    #[error("invalid operation")]
    InvalidOperation,

    #[error("{operation}: {actual} request bytes, expected {expected}")]
    InvalidDataSize {
        operation: Operation,
        expected: usize,
        actual: usize,
    },

    #[error("protocol violation: {0}")]
    ProtocolViolation(#[from] ProtocolViolation),

    #[error("request timed out")]
    Timeout,

    #[error("identifier generation failed: {0}")]
    Id(#[from] IdError),
}

/// Coarse grouping of [`ClientError`] for callers deciding how to react
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCategory {
    /// Rejected before submission; nothing reached the engine
    Admission,
    /// The request itself is malformed or too large
    Validation,
    /// Engine and client disagree; the client is poisoned
    Protocol,
    /// A local resource ran out
    Resource,
    /// No completion within the configured deadline
    Timeout,
}

impl ClientError {
    pub fn category(&self) -> ErrorCategory {
        match self {
            Self::EmptyBatch | Self::ClientClosed | Self::ConcurrencyExceeded => {
                ErrorCategory::Admission
            }
            Self::MaximumBatchSizeExceeded | Self::InvalidOperation | Self::InvalidDataSize { .. } => {
                ErrorCategory::Validation
            }
            Self::ProtocolViolation(_) => ErrorCategory::Protocol,
            Self::Id(_) => ErrorCategory::Resource,
            Self::Timeout => ErrorCategory::Timeout,
        }
    }

    /// Whether the same request may succeed if submitted again unchanged
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::ConcurrencyExceeded | Self::Timeout)
    }
}

pub type Result<T> = std::result::Result<T, ClientError>;

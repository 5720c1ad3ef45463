//! Packet engine abstraction
//!
//! The engine owns a fixed pool of packets, runs submitted requests on its own
//! thread and reports each one back exactly once through a [`CompletionSink`].
//! Abstracted so the client can run against the native library or the
//! in-process simulator.

#[cfg(feature = "native")]
pub mod native;

use crate::config::ClientConfig;
use crate::correlation::RequestId;
use crate::error::InitError;
use crate::operation::{Operation, PacketStatus};
use bytes::Bytes;
use std::fmt;
use std::sync::Arc;
use thiserror::Error;

/// Opaque handle of one leased packet
///
/// Only meaningful to the engine that issued it; compared for equality only.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct Packet(usize);

impl Packet {
    /// Wrap an engine-issued handle
    pub const fn from_raw(raw: usize) -> Self {
        Self(raw)
    }

    /// Handle as the engine issued it
    pub const fn raw(self) -> usize {
        self.0
    }
}

impl fmt::Debug for Packet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Packet({:#x})", self.0)
    }
}

/// Packet pool refusal
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum AcquireError {
    /// Every packet is leased
    #[error("all packets are in use")]
    ConcurrencyExceeded,

    /// `deinit` was called
    #[error("engine is shutting down")]
    Shutdown,
}

/// A request handed to the engine
///
/// The engine keeps this value until it has reported the completion, which
/// keeps the request bytes alive for exactly as long as it may read them.
#[derive(Debug, Clone)]
pub struct Submission {
    pub request_id: RequestId,
    pub operation: Operation,
    /// Request body, `event_count` events of the operation's event size
    pub data: Bytes,
    pub event_count: u32,
}

/// What the engine reports when a packet finishes
///
/// `result` is only valid for the duration of the callback.
#[derive(Debug, Clone, Copy)]
pub struct Completion<'a> {
    pub packet: Packet,
    pub request_id: RequestId,
    pub operation: Operation,
    pub status: PacketStatus,
    /// Length of the request body the engine executed
    pub request_len: usize,
    pub result: &'a [u8],
}

/// Receiver of completions, invoked on the engine's thread
pub trait CompletionSink: Send + Sync {
    fn on_completion(&self, completion: Completion<'_>);
}

/// Packet engine
pub trait Engine: Send + Sync + Sized + 'static {
    /// Engine-specific knobs beyond [`ClientConfig`]
    type Options: Default;

    /// Start the engine; completions go to `sink` from here on
    fn init(
        config: &ClientConfig,
        options: Self::Options,
        sink: Arc<dyn CompletionSink>,
    ) -> Result<Self, InitError>;

    /// Lease a packet without blocking
    fn acquire_packet(&self) -> Result<Packet, AcquireError>;

    /// Return a packet to the pool; must not block
    fn release_packet(&self, packet: Packet);

    /// Queue a request; completion arrives later through the sink
    ///
    /// Every submission is reported exactly once, including ones the engine
    /// cannot carry.
    fn submit(&self, packet: Packet, submission: Submission);

    /// Stop admitting packets; requests already submitted still complete
    fn deinit(&self);
}

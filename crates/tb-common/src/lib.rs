//! tb-common - Shared primitives for the ledger client
//!
//! This crate provides the two self-contained building blocks the client is
//! assembled from:
//! - Fixed-width unsigned integers with an exact little-endian byte layout
//! - A thread-safe generator of monotonic, sortable 128-bit identifiers
//!
//! Neither depends on the engine; both are usable on their own.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod error;
pub mod id;
pub mod uint;

pub use error::*;
pub use id::{id, Clock, EntropySource, IdGenerator, IdSource, OsEntropy, RandomTail, SystemClock};
pub use uint::{UInt128, UInt16, UInt32, UInt64};

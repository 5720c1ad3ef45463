//! tb-client - Synchronous ledger client over a packet engine
//!
//! The engine accepts requests on leased packets and reports each result once,
//! from its own thread, through a callback. This crate correlates those
//! callbacks back to blocked callers:
//! - [`correlation`]: in-flight request table and single-use completion signals
//! - [`dispatch`]: engine-thread completion routing and result validation
//! - [`client`]: blocking request orchestration and the typed ledger API
//! - [`engine`]: the engine seam, with a native binding behind `native`
//! - [`sim`]: an in-process engine for tests and benchmarks
//!
//! # Example
//!
//! ```
//! use tb_client::{Account, Client, ClientConfig, SimEngine, UInt128};
//!
//! let client = Client::<SimEngine>::new(ClientConfig::default()).unwrap();
//! let results = client
//!     .create_accounts(&[Account::new(UInt128::new(1), 700, 10)])
//!     .unwrap();
//! assert_eq!(results.len(), 1);
//! ```

#![warn(clippy::all)]

pub mod bindings;
pub mod client;
pub mod config;
pub mod correlation;
pub mod dispatch;
pub mod engine;
pub mod error;
pub mod operation;
pub mod sim;
pub mod telemetry;

pub use bindings::{
    Account, AccountBalance, AccountFilter, AccountFilterFlags, AccountFlags, CreateAccountResult,
    CreateAccountsResult, CreateTransferResult, CreateTransfersResult, Transfer, TransferFlags,
};
pub use client::Client;
pub use config::{ClientConfig, ConfigError};
pub use engine::{Engine, Packet};
pub use error::{ClientError, ErrorCategory, InitError, ProtocolViolation, Result};
pub use operation::{Operation, PacketStatus};
pub use sim::{SimEngine, SimFault, SimOptions};
pub use tb_common::{id, IdGenerator, UInt128, UInt16, UInt32, UInt64};

#[cfg(feature = "native")]
pub use engine::native::NativeEngine;

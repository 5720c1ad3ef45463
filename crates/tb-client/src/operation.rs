//! Operation tags and packet status codes
//!
//! Both are fixed by the engine's C ABI. Element sizes must match the engine's
//! binary layouts exactly.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Size of a 128-bit identifier on the wire
pub const ID_SIZE: usize = 16;
/// Size of an account record on the wire
pub const ACCOUNT_SIZE: usize = 128;
/// Size of a transfer record on the wire
pub const TRANSFER_SIZE: usize = 128;
/// Size of an account filter on the wire
pub const ACCOUNT_FILTER_SIZE: usize = 64;
/// Size of an account balance on the wire
pub const ACCOUNT_BALANCE_SIZE: usize = 128;
/// Size of a sparse create result `(index, result)` on the wire
pub const CREATE_RESULT_SIZE: usize = 8;

/// Operation tag carried by a packet
///
/// A newtype rather than an enum: callers may deliberately submit an opcode the
/// engine does not know (it answers `InvalidOperation`, which doubles as a ping).
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(transparent)]
pub struct Operation(u8);

impl Operation {
    pub const PULSE: Self = Self(128);
    pub const CREATE_ACCOUNTS: Self = Self(129);
    pub const CREATE_TRANSFERS: Self = Self(130);
    pub const LOOKUP_ACCOUNTS: Self = Self(131);
    pub const LOOKUP_TRANSFERS: Self = Self(132);
    pub const GET_ACCOUNT_TRANSFERS: Self = Self(133);
    pub const GET_ACCOUNT_BALANCES: Self = Self(134);

    pub const fn from_raw(code: u8) -> Self {
        Self(code)
    }

    pub const fn code(self) -> u8 {
        self.0
    }

    /// Size of one request element, 0 for operations the client does not know
    pub const fn event_size(self) -> usize {
        match self.0 {
            129 => ACCOUNT_SIZE,
            130 => TRANSFER_SIZE,
            131 | 132 => ID_SIZE,
            133 | 134 => ACCOUNT_FILTER_SIZE,
            _ => 0,
        }
    }

    /// Size of one result element, 0 for operations the client does not know
    pub const fn result_size(self) -> usize {
        match self.0 {
            129 | 130 => CREATE_RESULT_SIZE,
            131 => ACCOUNT_SIZE,
            132 | 133 => TRANSFER_SIZE,
            134 => ACCOUNT_BALANCE_SIZE,
            _ => 0,
        }
    }

    /// Range queries return as many results as match, independent of the
    /// number of request elements
    pub const fn is_range_query(self) -> bool {
        matches!(self.0, 133 | 134)
    }

    pub const fn name(self) -> &'static str {
        match self.0 {
            128 => "pulse",
            129 => "create_accounts",
            130 => "create_transfers",
            131 => "lookup_accounts",
            132 => "lookup_transfers",
            133 => "get_account_transfers",
            134 => "get_account_balances",
            _ => "unknown",
        }
    }
}

impl fmt::Debug for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Operation({}:{})", self.0, self.name())
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Terminal status the engine writes into a packet
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum PacketStatus {
    Ok,
    TooMuchData,
    InvalidOperation,
    InvalidDataSize,
    Other(u8),
}

impl PacketStatus {
    pub const fn from_raw(code: u8) -> Self {
        match code {
            0 => Self::Ok,
            1 => Self::TooMuchData,
            2 => Self::InvalidOperation,
            3 => Self::InvalidDataSize,
            other => Self::Other(other),
        }
    }

    pub const fn to_raw(self) -> u8 {
        match self {
            Self::Ok => 0,
            Self::TooMuchData => 1,
            Self::InvalidOperation => 2,
            Self::InvalidDataSize => 3,
            Self::Other(code) => code,
        }
    }
}

impl fmt::Display for PacketStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Ok => f.write_str("ok"),
            Self::TooMuchData => f.write_str("too_much_data"),
            Self::InvalidOperation => f.write_str("invalid_operation"),
            Self::InvalidDataSize => f.write_str("invalid_data_size"),
            Self::Other(code) => write!(f, "status({code})"),
        }
    }
}

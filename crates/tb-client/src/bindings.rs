//! Record layouts exchanged with the engine
//!
//! Every record is a fixed-size little-endian structure. 128-bit fields use
//! [`UInt128`] so the byte layout is exactly the engine's.
//!
//! ```text
//! Account (128)             Transfer (128)
//!   0 id                      0 id
//!  16 debits_pending         16 debit_account_id
//!  32 debits_posted          32 credit_account_id
//!  48 credits_pending        48 amount
//!  64 credits_posted         64 pending_id
//!  80 user_data_128          80 user_data_128
//!  96 user_data_64           96 user_data_64
//! 104 user_data_32          104 user_data_32
//! 108 reserved              108 timeout
//! 112 ledger                112 ledger
//! 116 code                  116 code
//! 118 flags                 118 flags
//! 120 timestamp             120 timestamp
//! ```

use crate::error::ProtocolViolation;
use crate::operation::{
    Operation, ACCOUNT_BALANCE_SIZE, ACCOUNT_FILTER_SIZE, ACCOUNT_SIZE, CREATE_RESULT_SIZE,
    ID_SIZE, TRANSFER_SIZE,
};
use bytes::{Buf, BufMut, Bytes, BytesMut};
use serde::{Deserialize, Serialize};
use std::ops::BitOr;
use tb_common::UInt128;

/// Fixed-size binary record
pub trait Wire: Sized {
    /// Encoded size in bytes
    const SIZE: usize;

    /// Append exactly `SIZE` bytes
    fn encode<B: BufMut>(&self, buf: &mut B);

    /// Consume exactly `SIZE` bytes; the caller guarantees they are present
    fn decode<B: Buf>(buf: &mut B) -> Self;
}

/// Encode a batch into one contiguous request body
pub fn encode_batch<T: Wire>(items: &[T]) -> Bytes {
    let mut buf = BytesMut::with_capacity(items.len() * T::SIZE);
    for item in items {
        item.encode(&mut buf);
    }
    buf.freeze()
}

/// Decode a result body into records
pub fn decode_batch<T: Wire>(operation: Operation, mut body: &[u8]) -> Result<Vec<T>, ProtocolViolation> {
    if body.len() % T::SIZE != 0 {
        return Err(ProtocolViolation::InvalidResultLength {
            operation,
            len: body.len(),
            element_size: T::SIZE,
        });
    }
    let mut items = Vec::with_capacity(body.len() / T::SIZE);
    while body.has_remaining() {
        items.push(T::decode(&mut body));
    }
    Ok(items)
}

fn put_u128<B: BufMut>(buf: &mut B, value: UInt128) {
    buf.put_slice(value.as_bytes());
}

fn get_u128<B: Buf>(buf: &mut B) -> UInt128 {
    UInt128::new(buf.get_u128_le())
}

impl Wire for UInt128 {
    const SIZE: usize = ID_SIZE;

    fn encode<B: BufMut>(&self, buf: &mut B) {
        put_u128(buf, *self);
    }

    fn decode<B: Buf>(buf: &mut B) -> Self {
        get_u128(buf)
    }
}

// =============================================================================
// Flags
// =============================================================================

macro_rules! wire_flags {
    ($(#[$meta:meta])* $name:ident: $prim:ty { $($(#[$fmeta:meta])* $flag:ident = $bit:expr;)* }) => {
        $(#[$meta])*
        #[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
        #[repr(transparent)]
        pub struct $name($prim);

        impl $name {
            pub const NONE: Self = Self(0);
            $($(#[$fmeta])* pub const $flag: Self = Self(1 << $bit);)*

            /// Bits with a defined meaning
            pub const KNOWN: $prim = 0 $(| (1 << $bit))*;

            /// Keeps undefined bits so the engine can reject them
            pub const fn from_bits(bits: $prim) -> Self {
                Self(bits)
            }

            pub const fn bits(self) -> $prim {
                self.0
            }

            pub const fn contains(self, other: Self) -> bool {
                self.0 & other.0 == other.0
            }

            pub const fn has_unknown_bits(self) -> bool {
                self.0 & !Self::KNOWN != 0
            }
        }

        impl BitOr for $name {
            type Output = Self;

            fn bitor(self, rhs: Self) -> Self {
                Self(self.0 | rhs.0)
            }
        }
    };
}

wire_flags! {
    /// Account behaviour flags
    AccountFlags: u16 {
        /// Chain with the next event; the chain succeeds or fails as a whole
        LINKED = 0;
        DEBITS_MUST_NOT_EXCEED_CREDITS = 1;
        CREDITS_MUST_NOT_EXCEED_DEBITS = 2;
        /// Keep a balance snapshot after every transfer
        HISTORY = 3;
    }
}

wire_flags! {
    /// Transfer behaviour flags
    TransferFlags: u16 {
        LINKED = 0;
        /// Reserve the amount in the pending balances
        PENDING = 1;
        POST_PENDING_TRANSFER = 2;
        VOID_PENDING_TRANSFER = 3;
        BALANCING_DEBIT = 4;
        BALANCING_CREDIT = 5;
    }
}

wire_flags! {
    /// Which side of an account a range query matches
    AccountFilterFlags: u32 {
        DEBITS = 0;
        CREDITS = 1;
        /// Newest first
        REVERSED = 2;
    }
}

// =============================================================================
// Records
// =============================================================================

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Account {
    pub id: UInt128,
    pub debits_pending: UInt128,
    pub debits_posted: UInt128,
    pub credits_pending: UInt128,
    pub credits_posted: UInt128,
    pub user_data_128: UInt128,
    pub user_data_64: u64,
    pub user_data_32: u32,
    pub reserved: u32,
    pub ledger: u32,
    pub code: u16,
    pub flags: AccountFlags,
    pub timestamp: u64,
}

impl Account {
    /// Account with zero balances and no flags
    pub fn new(id: UInt128, ledger: u32, code: u16) -> Self {
        Self {
            id,
            ledger,
            code,
            ..Self::default()
        }
    }

    pub fn with_flags(mut self, flags: AccountFlags) -> Self {
        self.flags = flags;
        self
    }
}

impl Wire for Account {
    const SIZE: usize = ACCOUNT_SIZE;

    fn encode<B: BufMut>(&self, buf: &mut B) {
        put_u128(buf, self.id);
        put_u128(buf, self.debits_pending);
        put_u128(buf, self.debits_posted);
        put_u128(buf, self.credits_pending);
        put_u128(buf, self.credits_posted);
        put_u128(buf, self.user_data_128);
        buf.put_u64_le(self.user_data_64);
        buf.put_u32_le(self.user_data_32);
        buf.put_u32_le(self.reserved);
        buf.put_u32_le(self.ledger);
        buf.put_u16_le(self.code);
        buf.put_u16_le(self.flags.bits());
        buf.put_u64_le(self.timestamp);
    }

    fn decode<B: Buf>(buf: &mut B) -> Self {
        Self {
            id: get_u128(buf),
            debits_pending: get_u128(buf),
            debits_posted: get_u128(buf),
            credits_pending: get_u128(buf),
            credits_posted: get_u128(buf),
            user_data_128: get_u128(buf),
            user_data_64: buf.get_u64_le(),
            user_data_32: buf.get_u32_le(),
            reserved: buf.get_u32_le(),
            ledger: buf.get_u32_le(),
            code: buf.get_u16_le(),
            flags: AccountFlags::from_bits(buf.get_u16_le()),
            timestamp: buf.get_u64_le(),
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Transfer {
    pub id: UInt128,
    pub debit_account_id: UInt128,
    pub credit_account_id: UInt128,
    pub amount: UInt128,
    pub pending_id: UInt128,
    pub user_data_128: UInt128,
    pub user_data_64: u64,
    pub user_data_32: u32,
    /// Seconds a pending transfer may stay pending
    pub timeout: u32,
    pub ledger: u32,
    pub code: u16,
    pub flags: TransferFlags,
    pub timestamp: u64,
}

impl Transfer {
    /// Single-phase transfer of `amount` from debit to credit account
    pub fn new(
        id: UInt128,
        debit_account_id: UInt128,
        credit_account_id: UInt128,
        amount: u128,
        ledger: u32,
        code: u16,
    ) -> Self {
        Self {
            id,
            debit_account_id,
            credit_account_id,
            amount: UInt128::new(amount),
            ledger,
            code,
            ..Self::default()
        }
    }

    pub fn with_flags(mut self, flags: TransferFlags) -> Self {
        self.flags = flags;
        self
    }
}

impl Wire for Transfer {
    const SIZE: usize = TRANSFER_SIZE;

    fn encode<B: BufMut>(&self, buf: &mut B) {
        put_u128(buf, self.id);
        put_u128(buf, self.debit_account_id);
        put_u128(buf, self.credit_account_id);
        put_u128(buf, self.amount);
        put_u128(buf, self.pending_id);
        put_u128(buf, self.user_data_128);
        buf.put_u64_le(self.user_data_64);
        buf.put_u32_le(self.user_data_32);
        buf.put_u32_le(self.timeout);
        buf.put_u32_le(self.ledger);
        buf.put_u16_le(self.code);
        buf.put_u16_le(self.flags.bits());
        buf.put_u64_le(self.timestamp);
    }

    fn decode<B: Buf>(buf: &mut B) -> Self {
        Self {
            id: get_u128(buf),
            debit_account_id: get_u128(buf),
            credit_account_id: get_u128(buf),
            amount: get_u128(buf),
            pending_id: get_u128(buf),
            user_data_128: get_u128(buf),
            user_data_64: buf.get_u64_le(),
            user_data_32: buf.get_u32_le(),
            timeout: buf.get_u32_le(),
            ledger: buf.get_u32_le(),
            code: buf.get_u16_le(),
            flags: TransferFlags::from_bits(buf.get_u16_le()),
            timestamp: buf.get_u64_le(),
        }
    }
}

/// Range query over one account's transfers or balance history
///
/// `timestamp_min`/`timestamp_max` of zero leave that end of the range open.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccountFilter {
    pub account_id: UInt128,
    pub timestamp_min: u64,
    pub timestamp_max: u64,
    pub limit: u32,
    pub flags: AccountFilterFlags,
}

impl AccountFilter {
    pub const DEFAULT_LIMIT: u32 = 100;

    /// Both sides, oldest first, default limit
    pub fn new(account_id: UInt128) -> Self {
        Self {
            account_id,
            timestamp_min: 0,
            timestamp_max: 0,
            limit: Self::DEFAULT_LIMIT,
            flags: AccountFilterFlags::DEBITS | AccountFilterFlags::CREDITS,
        }
    }
}

impl Wire for AccountFilter {
    const SIZE: usize = ACCOUNT_FILTER_SIZE;

    fn encode<B: BufMut>(&self, buf: &mut B) {
        put_u128(buf, self.account_id);
        buf.put_u64_le(self.timestamp_min);
        buf.put_u64_le(self.timestamp_max);
        buf.put_u32_le(self.limit);
        buf.put_u32_le(self.flags.bits());
        buf.put_bytes(0, 24);
    }

    fn decode<B: Buf>(buf: &mut B) -> Self {
        let filter = Self {
            account_id: get_u128(buf),
            timestamp_min: buf.get_u64_le(),
            timestamp_max: buf.get_u64_le(),
            limit: buf.get_u32_le(),
            flags: AccountFilterFlags::from_bits(buf.get_u32_le()),
        };
        buf.advance(24);
        filter
    }
}

/// Balance snapshot taken after a transfer on an account with history
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccountBalance {
    pub debits_pending: UInt128,
    pub debits_posted: UInt128,
    pub credits_pending: UInt128,
    pub credits_posted: UInt128,
    pub timestamp: u64,
}

impl Wire for AccountBalance {
    const SIZE: usize = ACCOUNT_BALANCE_SIZE;

    fn encode<B: BufMut>(&self, buf: &mut B) {
        put_u128(buf, self.debits_pending);
        put_u128(buf, self.debits_posted);
        put_u128(buf, self.credits_pending);
        put_u128(buf, self.credits_posted);
        buf.put_u64_le(self.timestamp);
        buf.put_bytes(0, 56);
    }

    fn decode<B: Buf>(buf: &mut B) -> Self {
        let balance = Self {
            debits_pending: get_u128(buf),
            debits_posted: get_u128(buf),
            credits_pending: get_u128(buf),
            credits_posted: get_u128(buf),
            timestamp: buf.get_u64_le(),
        };
        buf.advance(56);
        balance
    }
}

/// Sparse create result: only failed events are reported
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct CreateResultEntry {
    pub index: u32,
    pub result: u32,
}

impl Wire for CreateResultEntry {
    const SIZE: usize = CREATE_RESULT_SIZE;

    fn encode<B: BufMut>(&self, buf: &mut B) {
        buf.put_u32_le(self.index);
        buf.put_u32_le(self.result);
    }

    fn decode<B: Buf>(buf: &mut B) -> Self {
        Self {
            index: buf.get_u32_le(),
            result: buf.get_u32_le(),
        }
    }
}

// =============================================================================
// Result codes
// =============================================================================

macro_rules! result_codes {
    ($(#[$meta:meta])* $name:ident { $($variant:ident = $value:literal,)* }) => {
        $(#[$meta])*
        #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
        #[repr(u32)]
        pub enum $name {
            $($variant = $value,)*
        }

        impl $name {
            pub const fn from_raw(code: u32) -> Option<Self> {
                match code {
                    $($value => Some(Self::$variant),)*
                    _ => None,
                }
            }

            pub const fn code(self) -> u32 {
                self as u32
            }
        }
    };
}

result_codes! {
    /// Outcome of one event in a `create_accounts` batch
    CreateAccountResult {
        Ok = 0,
        LinkedEventFailed = 1,
        LinkedEventChainOpen = 2,
        TimestampMustBeZero = 3,
        ReservedField = 4,
        ReservedFlag = 5,
        IdMustNotBeZero = 6,
        IdMustNotBeIntMax = 7,
        FlagsAreMutuallyExclusive = 8,
        DebitsPendingMustBeZero = 9,
        DebitsPostedMustBeZero = 10,
        CreditsPendingMustBeZero = 11,
        CreditsPostedMustBeZero = 12,
        LedgerMustNotBeZero = 13,
        CodeMustNotBeZero = 14,
        ExistsWithDifferentFlags = 15,
        ExistsWithDifferentUserData128 = 16,
        ExistsWithDifferentUserData64 = 17,
        ExistsWithDifferentUserData32 = 18,
        ExistsWithDifferentLedger = 19,
        ExistsWithDifferentCode = 20,
        Exists = 21,
    }
}

result_codes! {
    /// Outcome of one event in a `create_transfers` batch
    CreateTransferResult {
        Ok = 0,
        LinkedEventFailed = 1,
        LinkedEventChainOpen = 2,
        TimestampMustBeZero = 3,
        ReservedFlag = 4,
        IdMustNotBeZero = 5,
        IdMustNotBeIntMax = 6,
        FlagsAreMutuallyExclusive = 7,
        DebitAccountIdMustNotBeZero = 8,
        DebitAccountIdMustNotBeIntMax = 9,
        CreditAccountIdMustNotBeZero = 10,
        CreditAccountIdMustNotBeIntMax = 11,
        AccountsMustBeDifferent = 12,
        PendingIdMustBeZero = 13,
        PendingIdMustNotBeZero = 14,
        PendingIdMustNotBeIntMax = 15,
        PendingIdMustBeDifferent = 16,
        TimeoutReservedForPendingTransfer = 17,
        AmountMustNotBeZero = 18,
        LedgerMustNotBeZero = 19,
        CodeMustNotBeZero = 20,
        DebitAccountNotFound = 21,
        CreditAccountNotFound = 22,
        AccountsMustHaveTheSameLedger = 23,
        TransferMustHaveTheSameLedgerAsAccounts = 24,
        PendingTransferNotFound = 25,
        PendingTransferNotPending = 26,
        PendingTransferHasDifferentDebitAccountId = 27,
        PendingTransferHasDifferentCreditAccountId = 28,
        PendingTransferHasDifferentLedger = 29,
        PendingTransferHasDifferentCode = 30,
        ExceedsPendingTransferAmount = 31,
        PendingTransferHasDifferentAmount = 32,
        PendingTransferAlreadyPosted = 33,
        PendingTransferAlreadyVoided = 34,
        PendingTransferExpired = 35,
        ExistsWithDifferentFlags = 36,
        ExistsWithDifferentDebitAccountId = 37,
        ExistsWithDifferentCreditAccountId = 38,
        ExistsWithDifferentAmount = 39,
        ExistsWithDifferentPendingId = 40,
        ExistsWithDifferentUserData128 = 41,
        ExistsWithDifferentUserData64 = 42,
        ExistsWithDifferentUserData32 = 43,
        ExistsWithDifferentTimeout = 44,
        ExistsWithDifferentCode = 45,
        Exists = 46,
        OverflowsDebitsPending = 47,
        OverflowsCreditsPending = 48,
        OverflowsDebitsPosted = 49,
        OverflowsCreditsPosted = 50,
        OverflowsDebits = 51,
        OverflowsCredits = 52,
        OverflowsTimeout = 53,
        ExceedsCredits = 54,
        ExceedsDebits = 55,
    }
}

/// Dense outcome of one `create_accounts` event
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreateAccountsResult {
    pub index: u32,
    pub result: CreateAccountResult,
}

/// Dense outcome of one `create_transfers` event
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreateTransfersResult {
    pub index: u32,
    pub result: CreateTransferResult,
}

/// Expand sparse `(index, code)` entries to one outcome per event
///
/// Entries must be strictly increasing and inside the batch. Events without an
/// entry succeeded.
pub fn merge_sparse<R: Copy>(
    operation: Operation,
    count: usize,
    sparse: &[CreateResultEntry],
    ok: R,
    convert: impl Fn(u32) -> Option<R>,
) -> Result<Vec<R>, ProtocolViolation> {
    let mut dense = vec![ok; count];
    let mut previous: Option<u32> = None;

    for entry in sparse {
        if entry.index as usize >= count {
            return Err(ProtocolViolation::ResultIndexOutOfRange { index: entry.index, count });
        }
        if previous.is_some_and(|p| p >= entry.index) {
            return Err(ProtocolViolation::ResultIndexOutOfOrder { index: entry.index });
        }
        dense[entry.index as usize] = convert(entry.result).ok_or(
            ProtocolViolation::UnknownResultCode { operation, code: entry.result },
        )?;
        previous = Some(entry.index);
    }

    Ok(dense)
}

//! In-memory ledger state machine for the simulated engine
//!
//! Implements enough of the engine's accounting rules to exercise every
//! operation end to end: account and transfer creation with linked chains,
//! two-phase transfers, balancing transfers, lookups and range queries.
//! Pending transfers never expire on their own.

use crate::bindings::{
    Account, AccountBalance, AccountFilter, AccountFilterFlags, AccountFlags, CreateAccountResult,
    CreateResultEntry, CreateTransferResult, Transfer, TransferFlags, Wire,
};
use crate::operation::{Operation, PacketStatus, ACCOUNT_FILTER_SIZE};
use bytes::BytesMut;
use std::collections::HashMap;
use tb_common::UInt128;

const OK: u32 = 0;
const LINKED_EVENT_FAILED: u32 = 1;
const LINKED_EVENT_CHAIN_OPEN: u32 = 2;

const NANOS_PER_SECOND: u64 = 1_000_000_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PendingOutcome {
    Posted,
    Voided,
}

/// Reverts one mutation inside an open linked chain
#[derive(Debug)]
enum Undo {
    AccountInserted(u128),
    TransferInserted(u128),
    AccountReplaced(Account),
    HistoryPushed(u128),
    PendingResolved(u128),
}

#[derive(Debug, Clone, Copy)]
struct HistoryEntry {
    balance: AccountBalance,
    debit: bool,
}

#[derive(Debug, Default)]
pub(crate) struct Ledger {
    accounts: HashMap<u128, Account>,
    transfers: HashMap<u128, Transfer>,
    /// Transfer ids in timestamp order
    transfer_log: Vec<u128>,
    pending: HashMap<u128, PendingOutcome>,
    history: HashMap<u128, Vec<HistoryEntry>>,
    undo: Vec<Undo>,
    last_timestamp: u64,
}

impl Ledger {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Run one request body; `Err` is the packet status to report instead
    pub(crate) fn execute(
        &mut self,
        operation: Operation,
        body: &[u8],
        body_max: usize,
    ) -> Result<BytesMut, PacketStatus> {
        let event_size = operation.event_size();
        if event_size == 0 {
            return Err(PacketStatus::InvalidOperation);
        }
        if body.len() > body_max {
            return Err(PacketStatus::TooMuchData);
        }
        if body.is_empty() || body.len() % event_size != 0 {
            return Err(PacketStatus::InvalidDataSize);
        }
        if operation.is_range_query() && body.len() != ACCOUNT_FILTER_SIZE {
            return Err(PacketStatus::InvalidDataSize);
        }

        let result_max = body_max / operation.result_size();
        let mut out = BytesMut::new();

        match operation {
            Operation::CREATE_ACCOUNTS => {
                let events: Vec<Account> = decode_events(body);
                let results = self.create_batch(
                    &events,
                    |a| a.flags.contains(AccountFlags::LINKED),
                    Self::create_account,
                );
                encode_into(&mut out, &results);
            }
            Operation::CREATE_TRANSFERS => {
                let events: Vec<Transfer> = decode_events(body);
                let results = self.create_batch(
                    &events,
                    |t| t.flags.contains(TransferFlags::LINKED),
                    Self::create_transfer,
                );
                encode_into(&mut out, &results);
            }
            Operation::LOOKUP_ACCOUNTS => {
                for id in decode_events::<UInt128>(body) {
                    if let Some(account) = self.accounts.get(&id.get()) {
                        account.encode(&mut out);
                    }
                }
            }
            Operation::LOOKUP_TRANSFERS => {
                for id in decode_events::<UInt128>(body) {
                    if let Some(transfer) = self.transfers.get(&id.get()) {
                        transfer.encode(&mut out);
                    }
                }
            }
            Operation::GET_ACCOUNT_TRANSFERS => {
                let mut buf = body;
                let filter = AccountFilter::decode(&mut buf);
                for transfer in self.account_transfers(&filter, result_max) {
                    transfer.encode(&mut out);
                }
            }
            Operation::GET_ACCOUNT_BALANCES => {
                let mut buf = body;
                let filter = AccountFilter::decode(&mut buf);
                for balance in self.account_balances(&filter, result_max) {
                    balance.encode(&mut out);
                }
            }
            _ => return Err(PacketStatus::InvalidOperation),
        }

        Ok(out)
    }

    fn next_timestamp(&mut self) -> u64 {
        let now = chrono::Utc::now()
            .timestamp_nanos_opt()
            .map_or(0, |ns| ns.max(0) as u64);
        self.last_timestamp = now.max(self.last_timestamp + 1);
        self.last_timestamp
    }

    /// Apply a batch of create events with linked-chain atomicity, returning
    /// only the failures
    fn create_batch<E>(
        &mut self,
        events: &[E],
        is_linked: impl Fn(&E) -> bool,
        mut create: impl FnMut(&mut Self, &E, u64) -> u32,
    ) -> Vec<CreateResultEntry> {
        let mut results = vec![OK; events.len()];
        let mut chain_start: Option<usize> = None;
        let mut chain_broken = false;

        for (index, event) in events.iter().enumerate() {
            let linked = is_linked(event);
            if chain_start.is_none() && linked {
                chain_start = Some(index);
            }

            let result = if chain_broken {
                LINKED_EVENT_FAILED
            } else if linked && index + 1 == events.len() {
                LINKED_EVENT_CHAIN_OPEN
            } else {
                let timestamp = self.next_timestamp();
                create(self, event, timestamp)
            };
            results[index] = result;

            if result != OK && !chain_broken {
                if let Some(start) = chain_start {
                    self.rollback();
                    for earlier in &mut results[start..index] {
                        if *earlier == OK {
                            *earlier = LINKED_EVENT_FAILED;
                        }
                    }
                    chain_broken = true;
                }
            }

            if chain_start.is_some() && !linked {
                chain_start = None;
                chain_broken = false;
            }
            if chain_start.is_none() {
                self.undo.clear();
            }
        }

        results
            .into_iter()
            .enumerate()
            .filter(|(_, result)| *result != OK)
            .map(|(index, result)| CreateResultEntry {
                index: index as u32,
                result,
            })
            .collect()
    }

    fn rollback(&mut self) {
        while let Some(undo) = self.undo.pop() {
            match undo {
                Undo::AccountInserted(id) => {
                    self.accounts.remove(&id);
                }
                Undo::TransferInserted(id) => {
                    self.transfers.remove(&id);
                    self.transfer_log.pop();
                }
                Undo::AccountReplaced(previous) => {
                    self.accounts.insert(previous.id.get(), previous);
                }
                Undo::HistoryPushed(id) => {
                    if let Some(entries) = self.history.get_mut(&id) {
                        entries.pop();
                    }
                }
                Undo::PendingResolved(id) => {
                    self.pending.remove(&id);
                }
            }
        }
    }

    // =========================================================================
    // Accounts
    // =========================================================================

    fn create_account(&mut self, account: &Account, timestamp: u64) -> u32 {
        use CreateAccountResult as R;

        let flags = account.flags;
        let result = if account.timestamp != 0 {
            R::TimestampMustBeZero
        } else if account.reserved != 0 {
            R::ReservedField
        } else if flags.has_unknown_bits() {
            R::ReservedFlag
        } else if account.id.is_zero() {
            R::IdMustNotBeZero
        } else if account.id == UInt128::MAX {
            R::IdMustNotBeIntMax
        } else if flags.contains(AccountFlags::DEBITS_MUST_NOT_EXCEED_CREDITS)
            && flags.contains(AccountFlags::CREDITS_MUST_NOT_EXCEED_DEBITS)
        {
            R::FlagsAreMutuallyExclusive
        } else if !account.debits_pending.is_zero() {
            R::DebitsPendingMustBeZero
        } else if !account.debits_posted.is_zero() {
            R::DebitsPostedMustBeZero
        } else if !account.credits_pending.is_zero() {
            R::CreditsPendingMustBeZero
        } else if !account.credits_posted.is_zero() {
            R::CreditsPostedMustBeZero
        } else if account.ledger == 0 {
            R::LedgerMustNotBeZero
        } else if account.code == 0 {
            R::CodeMustNotBeZero
        } else if let Some(existing) = self.accounts.get(&account.id.get()) {
            account_exists(account, existing)
        } else {
            let mut stored = *account;
            stored.timestamp = timestamp;
            self.accounts.insert(stored.id.get(), stored);
            self.undo.push(Undo::AccountInserted(stored.id.get()));
            R::Ok
        };
        result.code()
    }

    fn replace_account(&mut self, account: Account) {
        if let Some(previous) = self.accounts.insert(account.id.get(), account) {
            self.undo.push(Undo::AccountReplaced(previous));
        }
    }

    fn record_history(&mut self, account: &Account, debit: bool, timestamp: u64) {
        if !account.flags.contains(AccountFlags::HISTORY) {
            return;
        }
        let id = account.id.get();
        self.history.entry(id).or_default().push(HistoryEntry {
            balance: AccountBalance {
                debits_pending: account.debits_pending,
                debits_posted: account.debits_posted,
                credits_pending: account.credits_pending,
                credits_posted: account.credits_posted,
                timestamp,
            },
            debit,
        });
        self.undo.push(Undo::HistoryPushed(id));
    }

    // =========================================================================
    // Transfers
    // =========================================================================

    fn create_transfer(&mut self, transfer: &Transfer, timestamp: u64) -> u32 {
        self.try_create_transfer(transfer, timestamp)
            .map_or_else(CreateTransferResult::code, |()| CreateTransferResult::Ok.code())
    }

    fn try_create_transfer(
        &mut self,
        t: &Transfer,
        timestamp: u64,
    ) -> Result<(), CreateTransferResult> {
        use CreateTransferResult as R;

        let flags = t.flags;
        let pending = flags.contains(TransferFlags::PENDING);
        let post = flags.contains(TransferFlags::POST_PENDING_TRANSFER);
        let void = flags.contains(TransferFlags::VOID_PENDING_TRANSFER);
        let balancing_debit = flags.contains(TransferFlags::BALANCING_DEBIT);
        let balancing_credit = flags.contains(TransferFlags::BALANCING_CREDIT);

        check(t.timestamp == 0, R::TimestampMustBeZero)?;
        check(!flags.has_unknown_bits(), R::ReservedFlag)?;
        check(!t.id.is_zero(), R::IdMustNotBeZero)?;
        check(t.id != UInt128::MAX, R::IdMustNotBeIntMax)?;
        check(
            u8::from(pending) + u8::from(post) + u8::from(void) <= 1
                && !((post || void) && (balancing_debit || balancing_credit)),
            R::FlagsAreMutuallyExclusive,
        )?;

        if post || void {
            return self.resolve_pending(t, post, timestamp);
        }

        check(!t.debit_account_id.is_zero(), R::DebitAccountIdMustNotBeZero)?;
        check(t.debit_account_id != UInt128::MAX, R::DebitAccountIdMustNotBeIntMax)?;
        check(!t.credit_account_id.is_zero(), R::CreditAccountIdMustNotBeZero)?;
        check(t.credit_account_id != UInt128::MAX, R::CreditAccountIdMustNotBeIntMax)?;
        check(t.debit_account_id != t.credit_account_id, R::AccountsMustBeDifferent)?;
        check(t.pending_id.is_zero(), R::PendingIdMustBeZero)?;
        check(pending || t.timeout == 0, R::TimeoutReservedForPendingTransfer)?;
        check(
            !t.amount.is_zero() || balancing_debit || balancing_credit,
            R::AmountMustNotBeZero,
        )?;
        check(t.ledger != 0, R::LedgerMustNotBeZero)?;
        check(t.code != 0, R::CodeMustNotBeZero)?;

        let mut dr = *self
            .accounts
            .get(&t.debit_account_id.get())
            .ok_or(R::DebitAccountNotFound)?;
        let mut cr = *self
            .accounts
            .get(&t.credit_account_id.get())
            .ok_or(R::CreditAccountNotFound)?;
        check(dr.ledger == cr.ledger, R::AccountsMustHaveTheSameLedger)?;
        check(t.ledger == dr.ledger, R::TransferMustHaveTheSameLedgerAsAccounts)?;

        if let Some(existing) = self.transfers.get(&t.id.get()) {
            return Err(transfer_exists(t, existing));
        }

        let mut amount = if t.amount.is_zero() { u128::MAX } else { t.amount.get() };
        if balancing_debit {
            let available = dr
                .credits_posted
                .get()
                .saturating_sub(dr.debits_posted.get())
                .saturating_sub(dr.debits_pending.get());
            amount = amount.min(available);
        }
        if balancing_credit {
            let available = cr
                .debits_posted
                .get()
                .saturating_sub(cr.credits_posted.get())
                .saturating_sub(cr.credits_pending.get());
            amount = amount.min(available);
        }

        if pending {
            checked(dr.debits_pending.get(), amount, R::OverflowsDebitsPending)?;
            checked(cr.credits_pending.get(), amount, R::OverflowsCreditsPending)?;
        } else {
            checked(dr.debits_posted.get(), amount, R::OverflowsDebitsPosted)?;
            checked(cr.credits_posted.get(), amount, R::OverflowsCreditsPosted)?;
        }
        let dr_debits = checked(dr.debits_pending.get(), dr.debits_posted.get(), R::OverflowsDebits)
            .and_then(|sum| checked(sum, amount, R::OverflowsDebits))?;
        let cr_credits =
            checked(cr.credits_pending.get(), cr.credits_posted.get(), R::OverflowsCredits)
                .and_then(|sum| checked(sum, amount, R::OverflowsCredits))?;
        if pending {
            u64::from(t.timeout)
                .checked_mul(NANOS_PER_SECOND)
                .and_then(|ns| timestamp.checked_add(ns))
                .ok_or(R::OverflowsTimeout)?;
        }

        if dr.flags.contains(AccountFlags::DEBITS_MUST_NOT_EXCEED_CREDITS) {
            check(dr_debits <= dr.credits_posted.get(), R::ExceedsCredits)?;
        }
        if cr.flags.contains(AccountFlags::CREDITS_MUST_NOT_EXCEED_DEBITS) {
            check(cr_credits <= cr.debits_posted.get(), R::ExceedsDebits)?;
        }

        if pending {
            dr.debits_pending = UInt128::new(dr.debits_pending.get() + amount);
            cr.credits_pending = UInt128::new(cr.credits_pending.get() + amount);
        } else {
            dr.debits_posted = UInt128::new(dr.debits_posted.get() + amount);
            cr.credits_posted = UInt128::new(cr.credits_posted.get() + amount);
        }

        let mut stored = *t;
        stored.amount = UInt128::new(amount);
        stored.timestamp = timestamp;
        self.commit_transfer(stored, dr, cr);
        Ok(())
    }

    fn resolve_pending(
        &mut self,
        t: &Transfer,
        post: bool,
        timestamp: u64,
    ) -> Result<(), CreateTransferResult> {
        use CreateTransferResult as R;

        check(!t.pending_id.is_zero(), R::PendingIdMustNotBeZero)?;
        check(t.pending_id != UInt128::MAX, R::PendingIdMustNotBeIntMax)?;
        check(t.pending_id != t.id, R::PendingIdMustBeDifferent)?;
        check(t.timeout == 0, R::TimeoutReservedForPendingTransfer)?;

        let p = *self
            .transfers
            .get(&t.pending_id.get())
            .ok_or(R::PendingTransferNotFound)?;
        check(p.flags.contains(TransferFlags::PENDING), R::PendingTransferNotPending)?;
        check(
            t.debit_account_id.is_zero() || t.debit_account_id == p.debit_account_id,
            R::PendingTransferHasDifferentDebitAccountId,
        )?;
        check(
            t.credit_account_id.is_zero() || t.credit_account_id == p.credit_account_id,
            R::PendingTransferHasDifferentCreditAccountId,
        )?;
        check(t.ledger == 0 || t.ledger == p.ledger, R::PendingTransferHasDifferentLedger)?;
        check(t.code == 0 || t.code == p.code, R::PendingTransferHasDifferentCode)?;

        let amount = if t.amount.is_zero() { p.amount } else { t.amount };
        check(amount <= p.amount, R::ExceedsPendingTransferAmount)?;
        check(post || amount == p.amount, R::PendingTransferHasDifferentAmount)?;

        if let Some(existing) = self.transfers.get(&t.id.get()) {
            return Err(transfer_exists(t, existing));
        }

        match self.pending.get(&p.id.get()) {
            Some(PendingOutcome::Posted) => return Err(R::PendingTransferAlreadyPosted),
            Some(PendingOutcome::Voided) => return Err(R::PendingTransferAlreadyVoided),
            None => {}
        }
        if p.timeout > 0 {
            let expires_at = p.timestamp + u64::from(p.timeout) * NANOS_PER_SECOND;
            check(timestamp < expires_at, R::PendingTransferExpired)?;
        }

        let mut dr = *self
            .accounts
            .get(&p.debit_account_id.get())
            .ok_or(R::DebitAccountNotFound)?;
        let mut cr = *self
            .accounts
            .get(&p.credit_account_id.get())
            .ok_or(R::CreditAccountNotFound)?;

        dr.debits_pending = UInt128::new(dr.debits_pending.get() - p.amount.get());
        cr.credits_pending = UInt128::new(cr.credits_pending.get() - p.amount.get());
        if post {
            let debits = checked(dr.debits_posted.get(), amount.get(), R::OverflowsDebitsPosted)?;
            let credits = checked(cr.credits_posted.get(), amount.get(), R::OverflowsCreditsPosted)?;
            dr.debits_posted = UInt128::new(debits);
            cr.credits_posted = UInt128::new(credits);
        }

        let mut stored = *t;
        stored.debit_account_id = p.debit_account_id;
        stored.credit_account_id = p.credit_account_id;
        stored.ledger = p.ledger;
        stored.code = p.code;
        stored.amount = amount;
        stored.timestamp = timestamp;

        let outcome = if post { PendingOutcome::Posted } else { PendingOutcome::Voided };
        self.pending.insert(p.id.get(), outcome);
        self.undo.push(Undo::PendingResolved(p.id.get()));
        self.commit_transfer(stored, dr, cr);
        Ok(())
    }

    fn commit_transfer(&mut self, transfer: Transfer, dr: Account, cr: Account) {
        let id = transfer.id.get();
        self.replace_account(dr);
        self.replace_account(cr);
        self.record_history(&dr, true, transfer.timestamp);
        self.record_history(&cr, false, transfer.timestamp);
        self.transfers.insert(id, transfer);
        self.transfer_log.push(id);
        self.undo.push(Undo::TransferInserted(id));
    }

    // =========================================================================
    // Range queries
    // =========================================================================

    fn account_transfers(&self, filter: &AccountFilter, result_max: usize) -> Vec<Transfer> {
        let Some(scope) = FilterScope::new(filter, result_max) else {
            return Vec::new();
        };
        let account = filter.account_id;
        let matches = |t: &&Transfer| {
            scope.in_range(t.timestamp)
                && ((scope.debits && t.debit_account_id == account)
                    || (scope.credits && t.credit_account_id == account))
        };

        let log = self.transfer_log.iter().filter_map(|id| self.transfers.get(id));
        if scope.reversed {
            log.rev().filter(matches).take(scope.limit).copied().collect()
        } else {
            log.filter(matches).take(scope.limit).copied().collect()
        }
    }

    fn account_balances(&self, filter: &AccountFilter, result_max: usize) -> Vec<AccountBalance> {
        let Some(scope) = FilterScope::new(filter, result_max) else {
            return Vec::new();
        };
        let history = match self.accounts.get(&filter.account_id.get()) {
            Some(account) if account.flags.contains(AccountFlags::HISTORY) => {
                self.history.get(&account.id.get())
            }
            _ => None,
        };
        let Some(history) = history else {
            return Vec::new();
        };

        let matches = |e: &&HistoryEntry| {
            scope.in_range(e.balance.timestamp)
                && ((scope.debits && e.debit) || (scope.credits && !e.debit))
        };
        if scope.reversed {
            history.iter().rev().filter(matches).take(scope.limit).map(|e| e.balance).collect()
        } else {
            history.iter().filter(matches).take(scope.limit).map(|e| e.balance).collect()
        }
    }
}

/// Validated view of an [`AccountFilter`]
struct FilterScope {
    timestamp_min: u64,
    timestamp_max: u64,
    limit: usize,
    debits: bool,
    credits: bool,
    reversed: bool,
}

impl FilterScope {
    /// `None` for a filter that matches nothing by construction
    fn new(filter: &AccountFilter, result_max: usize) -> Option<Self> {
        let flags = filter.flags;
        let valid = !filter.account_id.is_zero()
            && filter.account_id != UInt128::MAX
            && filter.limit != 0
            && !flags.has_unknown_bits()
            && (filter.timestamp_max == 0 || filter.timestamp_min <= filter.timestamp_max);
        if !valid {
            return None;
        }

        let mut debits = flags.contains(AccountFilterFlags::DEBITS);
        let mut credits = flags.contains(AccountFilterFlags::CREDITS);
        if !debits && !credits {
            debits = true;
            credits = true;
        }

        Some(Self {
            timestamp_min: filter.timestamp_min,
            timestamp_max: filter.timestamp_max,
            limit: (filter.limit as usize).min(result_max),
            debits,
            credits,
            reversed: flags.contains(AccountFilterFlags::REVERSED),
        })
    }

    fn in_range(&self, timestamp: u64) -> bool {
        timestamp >= self.timestamp_min
            && (self.timestamp_max == 0 || timestamp <= self.timestamp_max)
    }
}

fn check(condition: bool, failure: CreateTransferResult) -> Result<(), CreateTransferResult> {
    if condition {
        Ok(())
    } else {
        Err(failure)
    }
}

fn checked(a: u128, b: u128, failure: CreateTransferResult) -> Result<u128, CreateTransferResult> {
    a.checked_add(b).ok_or(failure)
}

fn account_exists(a: &Account, e: &Account) -> CreateAccountResult {
    use CreateAccountResult as R;

    if a.flags != e.flags {
        R::ExistsWithDifferentFlags
    } else if a.user_data_128 != e.user_data_128 {
        R::ExistsWithDifferentUserData128
    } else if a.user_data_64 != e.user_data_64 {
        R::ExistsWithDifferentUserData64
    } else if a.user_data_32 != e.user_data_32 {
        R::ExistsWithDifferentUserData32
    } else if a.ledger != e.ledger {
        R::ExistsWithDifferentLedger
    } else if a.code != e.code {
        R::ExistsWithDifferentCode
    } else {
        R::Exists
    }
}

fn transfer_exists(t: &Transfer, e: &Transfer) -> CreateTransferResult {
    use CreateTransferResult as R;

    let resolving = t.flags.contains(TransferFlags::POST_PENDING_TRANSFER)
        || t.flags.contains(TransferFlags::VOID_PENDING_TRANSFER);
    let balancing = t.flags.contains(TransferFlags::BALANCING_DEBIT)
        || t.flags.contains(TransferFlags::BALANCING_CREDIT);

    if t.flags != e.flags {
        R::ExistsWithDifferentFlags
    } else if !(resolving && t.debit_account_id.is_zero())
        && t.debit_account_id != e.debit_account_id
    {
        R::ExistsWithDifferentDebitAccountId
    } else if !(resolving && t.credit_account_id.is_zero())
        && t.credit_account_id != e.credit_account_id
    {
        R::ExistsWithDifferentCreditAccountId
    } else if !(balancing || (resolving && t.amount.is_zero())) && t.amount != e.amount {
        R::ExistsWithDifferentAmount
    } else if t.pending_id != e.pending_id {
        R::ExistsWithDifferentPendingId
    } else if t.user_data_128 != e.user_data_128 {
        R::ExistsWithDifferentUserData128
    } else if t.user_data_64 != e.user_data_64 {
        R::ExistsWithDifferentUserData64
    } else if t.user_data_32 != e.user_data_32 {
        R::ExistsWithDifferentUserData32
    } else if t.timeout != e.timeout {
        R::ExistsWithDifferentTimeout
    } else if !(resolving && t.code == 0) && t.code != e.code {
        R::ExistsWithDifferentCode
    } else {
        R::Exists
    }
}

fn decode_events<T: Wire>(mut body: &[u8]) -> Vec<T> {
    let mut events = Vec::with_capacity(body.len() / T::SIZE);
    while body.len() >= T::SIZE {
        events.push(T::decode(&mut body));
    }
    events
}

fn encode_into<T: Wire>(out: &mut BytesMut, items: &[T]) {
    for item in items {
        item.encode(out);
    }
}

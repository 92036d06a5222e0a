//! # Deposit Ledger
//!
//! The in-memory state machine behind the vault: per-account sequences of
//! time-locked deposits, the vault-wide totals and the custody balance.
//!
//! ```text
//!            deposit(lock > 0)            now >= unlock_time
//! NonExistent ─────────────────▶ Locked ─────────────────────▶ Unlocked
//!      │                                                          │
//!      │ deposit(lock = 0)                                        │ withdraw
//!      └─────────────────────────▶ Unlocked                       ▼
//!                                                             Withdrawn
//! ```
//!
//! ## Withdrawals in two phases
//!
//! [`reserve_withdrawal`](DepositLedger::reserve_withdrawal) zeroes the
//! deposit and moves its value from `total_locked` to `total_withdrawn`
//! before any payment is attempted, so a second attempt on the same id sees
//! `AlreadyWithdrawn`. The payment outcome then decides between
//! [`commit_withdrawal`](DepositLedger::commit_withdrawal) (custody drops)
//! and [`rollback_withdrawal`](DepositLedger::rollback_withdrawal) (every
//! effect of the reservation is undone).
//!
//! The ledger never reads the clock and never touches disk. Callers pass
//! `now` in and persist what changed.

use std::collections::BTreeMap;

use timelock_protocol::config::VaultConfig;
use timelock_protocol::{
    Address, Amount, Deposit, DepositId, DepositState, PaymentGateway, PaymentOrder,
    PendingWithdrawal, Timestamp, VaultTotals,
};

use crate::error::LedgerError;

// ---------------------------------------------------------------------------
// Receipts & checkpoints
// ---------------------------------------------------------------------------

/// What a successful deposit created.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DepositReceipt {
    pub account: Address,
    pub deposit_id: DepositId,
    pub amount: Amount,
    pub unlock_time: Timestamp,
    pub timestamp: Timestamp,
}

/// Saved state of one deposit slot plus the vault-wide counters.
///
/// Every ledger mutation touches at most one slot, so restoring a
/// checkpoint undoes any single operation exactly.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Checkpoint {
    account: Address,
    deposit_id: DepositId,
    count: u64,
    deposit: Option<Deposit>,
    pending: Option<PendingWithdrawal>,
    totals: VaultTotals,
    custody: Amount,
}

// ---------------------------------------------------------------------------
// DepositLedger
// ---------------------------------------------------------------------------

/// Deposits, totals and custody for every account.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DepositLedger {
    deposits: BTreeMap<Address, Vec<Deposit>>,
    pending: BTreeMap<(Address, DepositId), PendingWithdrawal>,
    totals: VaultTotals,
    custody: Amount,
}

impl DepositLedger {
    /// An empty ledger.
    pub fn new() -> Self {
        Self::default()
    }

    /// Rebuilds a ledger from persisted parts.
    pub fn restore(
        deposits: BTreeMap<Address, Vec<Deposit>>,
        totals: VaultTotals,
        custody: Amount,
        pending: Vec<PendingWithdrawal>,
    ) -> Self {
        let pending = pending
            .into_iter()
            .map(|p| ((p.account, p.deposit_id), p))
            .collect();
        Self {
            deposits,
            pending,
            totals,
            custody,
        }
    }

    // -- Mutations ----------------------------------------------------------

    /// Records a new time-locked deposit for `caller`.
    ///
    /// # Errors
    ///
    /// - [`LedgerError::InvalidAmount`] when `value` is zero.
    /// - [`LedgerError::InvalidAddress`] for the zero address.
    /// - [`LedgerError::LockDurationTooLong`] when a cap is configured and
    ///   exceeded.
    /// - [`LedgerError::ArithmeticOverflow`] when `now + lock_duration` or a
    ///   running total overflows.
    pub fn deposit(
        &mut self,
        caller: Address,
        value: Amount,
        lock_duration: Timestamp,
        now: Timestamp,
        config: &VaultConfig,
    ) -> Result<DepositReceipt, LedgerError> {
        if value == 0 {
            return Err(LedgerError::InvalidAmount);
        }
        if caller.is_zero() {
            return Err(LedgerError::InvalidAddress);
        }
        if !config.allows_lock_duration(lock_duration) {
            return Err(LedgerError::LockDurationTooLong {
                requested: lock_duration,
                max: config.max_lock_duration.unwrap_or_default(),
            });
        }

        let unlock_time = now
            .checked_add(lock_duration)
            .ok_or(LedgerError::ArithmeticOverflow)?;
        let total_locked = self
            .totals
            .total_locked
            .checked_add(value)
            .ok_or(LedgerError::ArithmeticOverflow)?;
        let total_deposited = self
            .totals
            .total_deposited
            .checked_add(value)
            .ok_or(LedgerError::ArithmeticOverflow)?;
        let custody = self
            .custody
            .checked_add(value)
            .ok_or(LedgerError::ArithmeticOverflow)?;

        let list = self.deposits.entry(caller).or_default();
        let deposit_id = list.len() as DepositId;
        list.push(Deposit::new(value, unlock_time));

        self.totals.total_locked = total_locked;
        self.totals.total_deposited = total_deposited;
        self.custody = custody;

        Ok(DepositReceipt {
            account: caller,
            deposit_id,
            amount: value,
            unlock_time,
            timestamp: now,
        })
    }

    /// Phase one of a withdrawal: checks preconditions, zeroes the deposit
    /// and moves its value into `total_withdrawn`.
    ///
    /// Preconditions are checked in order: existence, not yet withdrawn,
    /// unlocked.
    pub fn reserve_withdrawal(
        &mut self,
        caller: Address,
        deposit_id: DepositId,
        now: Timestamp,
    ) -> Result<PendingWithdrawal, LedgerError> {
        let deposit = self
            .deposits
            .get_mut(&caller)
            .and_then(|list| list.get_mut(slot_index(deposit_id)?))
            .filter(|d| d.exists)
            .ok_or(LedgerError::NoSuchDeposit {
                account: caller,
                deposit_id,
            })?;

        if deposit.amount == 0 {
            return Err(LedgerError::AlreadyWithdrawn { deposit_id });
        }
        if !deposit.is_unlocked_at(now) {
            return Err(LedgerError::StillLocked {
                unlock_time: deposit.unlock_time,
                now,
            });
        }

        let amount = deposit.amount;
        let total_withdrawn = self
            .totals
            .total_withdrawn
            .checked_add(amount)
            .ok_or(LedgerError::ArithmeticOverflow)?;
        let total_locked = self
            .totals
            .total_locked
            .checked_sub(amount)
            .ok_or(LedgerError::ArithmeticOverflow)?;

        deposit.amount = 0;
        self.totals.total_locked = total_locked;
        self.totals.total_withdrawn = total_withdrawn;

        let pending = PendingWithdrawal {
            account: caller,
            deposit_id,
            amount,
            reserved_at: now,
        };
        self.pending.insert((caller, deposit_id), pending.clone());
        Ok(pending)
    }

    /// Phase two, success: the payment went out, custody drops.
    ///
    /// Returns `None` if no reservation exists for the slot.
    pub fn commit_withdrawal(
        &mut self,
        account: &Address,
        deposit_id: DepositId,
    ) -> Option<PendingWithdrawal> {
        let key = (*account, deposit_id);
        let amount = self.pending.get(&key)?.amount;
        self.custody = self.custody.checked_sub(amount)?;
        self.pending.remove(&key)
    }

    /// Phase two, failure: restores the deposit and the totals.
    ///
    /// Returns `None` if no reservation exists for the slot.
    pub fn rollback_withdrawal(
        &mut self,
        account: &Address,
        deposit_id: DepositId,
    ) -> Option<PendingWithdrawal> {
        let pending = self.pending.remove(&(*account, deposit_id))?;
        if let Some(deposit) = self
            .deposits
            .get_mut(account)
            .and_then(|list| list.get_mut(slot_index(deposit_id)?))
        {
            deposit.amount = pending.amount;
        }
        self.totals.total_locked = self.totals.total_locked.saturating_add(pending.amount);
        self.totals.total_withdrawn = self.totals.total_withdrawn.saturating_sub(pending.amount);
        Some(pending)
    }

    /// Reserve, pay, then commit or roll back, all in memory.
    ///
    /// Returns the amount paid out.
    pub fn withdraw(
        &mut self,
        caller: Address,
        deposit_id: DepositId,
        now: Timestamp,
        gateway: &dyn PaymentGateway,
    ) -> Result<Amount, LedgerError> {
        let pending = self.reserve_withdrawal(caller, deposit_id, now)?;
        let order = PaymentOrder::for_withdrawal(caller, deposit_id, pending.amount);
        match gateway.pay(&order) {
            Ok(()) => {
                self.commit_withdrawal(&caller, deposit_id)
                    .ok_or(LedgerError::ArithmeticOverflow)?;
                Ok(pending.amount)
            }
            Err(e) => {
                self.rollback_withdrawal(&caller, deposit_id);
                Err(LedgerError::TransferFailed(e))
            }
        }
    }

    /// Value that reached the vault outside of [`deposit`](Self::deposit).
    ///
    /// Raises custody only. Returns the new custody balance.
    pub fn credit_unaccounted(&mut self, value: Amount) -> Result<Amount, LedgerError> {
        if value == 0 {
            return Err(LedgerError::InvalidAmount);
        }
        self.custody = self
            .custody
            .checked_add(value)
            .ok_or(LedgerError::ArithmeticOverflow)?;
        Ok(self.custody)
    }

    // -- Checkpoints --------------------------------------------------------

    /// Captures the slot `(account, deposit_id)` and the counters.
    ///
    /// For a deposit, pass the id it is about to receive
    /// (`deposit_count(account)`).
    pub fn checkpoint(&self, account: &Address, deposit_id: DepositId) -> Checkpoint {
        Checkpoint {
            account: *account,
            deposit_id,
            count: self.deposit_count(account),
            deposit: self
                .deposits
                .get(account)
                .and_then(|list| list.get(slot_index(deposit_id)?))
                .copied(),
            pending: self.pending.get(&(*account, deposit_id)).cloned(),
            totals: self.totals,
            custody: self.custody,
        }
    }

    /// Puts the ledger back to the state captured by `checkpoint`.
    pub fn restore_checkpoint(&mut self, checkpoint: Checkpoint) {
        let Checkpoint {
            account,
            deposit_id,
            count,
            deposit,
            pending,
            totals,
            custody,
        } = checkpoint;

        let list = self.deposits.entry(account).or_default();
        list.truncate(usize::try_from(count).unwrap_or(usize::MAX));
        if let (Some(saved), Some(slot)) = (
            deposit,
            slot_index(deposit_id).and_then(|i| list.get_mut(i)),
        ) {
            *slot = saved;
        }
        if list.is_empty() {
            self.deposits.remove(&account);
        }

        match pending {
            Some(p) => {
                self.pending.insert((account, deposit_id), p);
            }
            None => {
                self.pending.remove(&(account, deposit_id));
            }
        }

        self.totals = totals;
        self.custody = custody;
    }

    // -- Reads --------------------------------------------------------------

    /// The deposit at `(account, deposit_id)`, or the nonexistent default.
    pub fn get_deposit(&self, account: &Address, deposit_id: DepositId) -> Deposit {
        self.deposits
            .get(account)
            .and_then(|list| list.get(slot_index(deposit_id)?))
            .copied()
            .unwrap_or_default()
    }

    /// Number of deposits `account` has created; also its next id.
    pub fn deposit_count(&self, account: &Address) -> u64 {
        self.deposits.get(account).map_or(0, |list| list.len() as u64)
    }

    /// All deposits of `account`, in id order.
    pub fn deposits_of(&self, account: &Address) -> &[Deposit] {
        self.deposits.get(account).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Derived lifecycle state at `now`.
    pub fn deposit_state(
        &self,
        account: &Address,
        deposit_id: DepositId,
        now: Timestamp,
    ) -> DepositState {
        self.get_deposit(account, deposit_id).state(now)
    }

    /// Value held by the vault.
    pub fn vault_balance(&self) -> Amount {
        self.custody
    }

    pub fn totals(&self) -> VaultTotals {
        self.totals
    }

    /// Withdrawals reserved but not yet committed or rolled back.
    pub fn pending(&self) -> impl Iterator<Item = &PendingWithdrawal> {
        self.pending.values()
    }

    /// Number of accounts that have made at least one deposit.
    pub fn account_count(&self) -> usize {
        self.deposits.len()
    }

    /// Recomputes the accounting identities from scratch.
    ///
    /// - `total_locked` equals the sum of deposit amounts.
    /// - `total_locked + total_withdrawn == total_deposited`.
    /// - custody covers everything locked plus everything reserved.
    /// - every reservation points at a zeroed, existing deposit.
    pub fn is_consistent(&self) -> bool {
        let locked: Option<Amount> = self
            .deposits
            .values()
            .flatten()
            .try_fold(0u128, |acc, d| acc.checked_add(d.amount));
        let reserved: Option<Amount> = self
            .pending
            .values()
            .try_fold(0u128, |acc, p| acc.checked_add(p.amount));

        let (Some(locked), Some(reserved)) = (locked, reserved) else {
            return false;
        };
        let reservations_valid = self.pending.values().all(|p| {
            let d = self.get_deposit(&p.account, p.deposit_id);
            d.exists && d.amount == 0
        });

        locked == self.totals.total_locked
            && self.totals.is_balanced()
            && locked.checked_add(reserved).is_some_and(|need| self.custody >= need)
            && reservations_valid
    }
}

/// Position of `deposit_id` in an account's list. Ids that do not fit a
/// `usize` name no deposit.
fn slot_index(deposit_id: DepositId) -> Option<usize> {
    usize::try_from(deposit_id).ok()
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

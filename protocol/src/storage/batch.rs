//! Write sets for atomic commits.

use crate::address::Address;
use crate::events::EventRecord;
use crate::types::{Amount, Deposit, DepositId, PendingWithdrawal, VaultTotals};

/// Everything one ledger operation wants persisted.
///
/// Built up by the caller, then handed to
/// [`VaultDB::commit`](super::VaultDB::commit), which applies it inside a
/// single sled transaction. An empty batch is a no-op.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LedgerBatch {
    pub(crate) deposits: Vec<(Address, DepositId, Deposit)>,
    pub(crate) deposit_counts: Vec<(Address, u64)>,
    pub(crate) totals: Option<VaultTotals>,
    pub(crate) custody: Option<Amount>,
    pub(crate) owner: Option<Address>,
    pub(crate) events: Vec<EventRecord>,
    pub(crate) pending_put: Vec<PendingWithdrawal>,
    pub(crate) pending_remove: Vec<(Address, DepositId)>,
}

impl LedgerBatch {
    /// An empty batch.
    pub fn new() -> Self {
        Self::default()
    }

    /// Writes (or overwrites) a deposit record.
    pub fn put_deposit(mut self, account: Address, id: DepositId, deposit: Deposit) -> Self {
        self.deposits.push((account, id, deposit));
        self
    }

    /// Sets an account's deposit counter.
    pub fn put_deposit_count(mut self, account: Address, count: u64) -> Self {
        self.deposit_counts.push((account, count));
        self
    }

    /// Replaces the vault totals.
    pub fn set_totals(mut self, totals: VaultTotals) -> Self {
        self.totals = Some(totals);
        self
    }

    /// Replaces the custody balance.
    pub fn set_custody(mut self, custody: Amount) -> Self {
        self.custody = Some(custody);
        self
    }

    /// Replaces the owner.
    pub fn set_owner(mut self, owner: Address) -> Self {
        self.owner = Some(owner);
        self
    }

    /// Appends an event record. Records must arrive in sequence order.
    pub fn append_event(mut self, record: EventRecord) -> Self {
        self.events.push(record);
        self
    }

    /// Records a withdrawal reservation.
    pub fn put_pending(mut self, pending: PendingWithdrawal) -> Self {
        self.pending_put.push(pending);
        self
    }

    /// Clears a withdrawal reservation.
    pub fn remove_pending(mut self, account: Address, id: DepositId) -> Self {
        self.pending_remove.push((account, id));
        self
    }

    /// `true` when the batch would write nothing.
    pub fn is_empty(&self) -> bool {
        self.deposits.is_empty()
            && self.deposit_counts.is_empty()
            && self.totals.is_none()
            && self.custody.is_none()
            && self.owner.is_none()
            && self.events.is_empty()
            && self.pending_put.is_empty()
            && self.pending_remove.is_empty()
    }

    /// Event records carried by this batch.
    pub fn events(&self) -> &[EventRecord] {
        &self.events
    }
}

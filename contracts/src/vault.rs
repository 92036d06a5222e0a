//! # Vault Service
//!
//! Wraps the [`DepositLedger`] and [`AccessControl`] state machines in a
//! thread-safe service that persists every change to a [`VaultDB`] and
//! records it in the hash-chained event log.
//!
//! ## Operation Flow
//!
//! ```text
//!  caller ──▶ write lock ──▶ ledger mutation ──▶ LedgerBatch ──▶ VaultDB::commit
//!                                  ▲                                  │
//!                                  └──── restore checkpoint ◀── fails ┘
//! ```
//!
//! Mutations are applied in memory first and then committed in a single
//! sled transaction. When the commit fails the in-memory change is undone
//! from a [`Checkpoint`](crate::deposit_ledger::Checkpoint), so memory and
//! disk never disagree.
//!
//! ## Withdrawals
//!
//! ```text
//!  reserve ──commit──▶ pending on disk ──▶ gateway.pay(order)
//!                                              │
//!                            Ok ◀──────────────┴──────────────▶ Err
//!                             │                                  │
//!           custody -= amount, Withdrawn event      deposit and totals restored
//!                             └──── pending removed ─────────────┘
//! ```
//!
//! The write lock is released while the gateway runs. The reservation is
//! already committed by then, so a concurrent or re-entrant withdrawal of
//! the same deposit fails with `AlreadyWithdrawn`, and every other
//! operation proceeds normally.
//!
//! A process that dies between the two commits leaves the pending record on
//! disk. [`Vault::open`] re-drives each one with the same payment order;
//! gateways treat repeated order ids as settled, so nothing is paid twice.
//!
//! When the phase-two commit itself fails, the reservation stays pending in
//! memory and on disk and the caller gets `Storage`:
//!
//! - after a successful payment the money has left, but `Withdrawn` is not
//!   recorded yet;
//! - after a failed payment the deposit stays zeroed and reads as
//!   withdrawn.
//!
//! Either way [`Vault::recover_pending`] (or the next open) settles it.

use parking_lot::RwLock;
use std::collections::BTreeSet;
use serde::Serialize;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, error, info, warn};

use timelock_protocol::config::{VaultConfig, MAX_EVENT_PAGE};
use timelock_protocol::storage::{DbError, LedgerBatch, VaultDB};
use timelock_protocol::{
    Address, Amount, Clock, Deposit, DepositId, DepositState, EventRecord, PaymentError,
    PaymentGateway, PaymentOrder, PendingWithdrawal, Timestamp, VaultEvent, VaultTotals,
};

use crate::access_control::AccessControl;
use crate::deposit_ledger::DepositLedger;
use crate::error::{ErrorKind, LedgerError};

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Errors returned by [`Vault`] operations.
#[derive(Debug, Error)]
pub enum VaultError {
    /// A ledger precondition failed. Nothing was changed.
    #[error(transparent)]
    Ledger(#[from] LedgerError),

    /// The change could not be persisted. Nothing was changed.
    #[error("storage error: {0}")]
    Storage(#[from] DbError),

    /// The data directory has no owner recorded.
    #[error("vault is not initialized")]
    NotInitialized,

    /// `initialize` was called on a data directory that already has an owner.
    #[error("vault already initialized with owner {0}")]
    AlreadyInitialized(Address),
}

impl VaultError {
    /// The payload-free classification of this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            VaultError::Ledger(e) => e.kind(),
            VaultError::Storage(_) => ErrorKind::Storage,
            VaultError::NotInitialized => ErrorKind::NotInitialized,
            VaultError::AlreadyInitialized(_) => ErrorKind::AlreadyInitialized,
        }
    }
}

pub type VaultResult<T> = Result<T, VaultError>;

// ---------------------------------------------------------------------------
// Listeners & reports
// ---------------------------------------------------------------------------

/// Receives every event record right after it is committed.
///
/// Called with the vault's write lock held, in commit order. Implementations
/// must not call back into the vault.
pub trait EventListener: Send + Sync {
    fn on_event(&self, record: &EventRecord);
}

/// Outcome of re-driving interrupted withdrawals on open.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct RecoveryReport {
    /// Withdrawals whose payment went through and were committed.
    pub committed: usize,
    /// Withdrawals whose payment failed and were rolled back.
    pub rolled_back: usize,
}

// ---------------------------------------------------------------------------
// Vault
// ---------------------------------------------------------------------------

struct VaultState {
    ledger: DepositLedger,
    access: AccessControl,
    head: Option<EventRecord>,
    /// Reservations whose payment is running outside the lock.
    settling: BTreeSet<(Address, DepositId)>,
}

impl VaultState {
    fn next_record(&self, event: VaultEvent) -> EventRecord {
        EventRecord::next(self.head.as_ref(), event)
    }
}

/// The time-locked deposit vault.
///
/// All mutations are serialized behind one write lock. A withdrawal holds it
/// for each of its two commits but not for the payment in between. Reads
/// take the read lock and see a consistent snapshot.
pub struct Vault {
    state: RwLock<VaultState>,
    db: VaultDB,
    clock: Arc<dyn Clock>,
    gateway: Arc<dyn PaymentGateway>,
    config: VaultConfig,
    listeners: RwLock<Vec<Arc<dyn EventListener>>>,
}

impl Vault {
    /// Writes the initial owner into an empty database and opens the vault.
    ///
    /// Records an `OwnershipTransferred` event from the zero address.
    pub fn initialize(
        db: VaultDB,
        owner: Address,
        clock: Arc<dyn Clock>,
        gateway: Arc<dyn PaymentGateway>,
        config: VaultConfig,
    ) -> VaultResult<Self> {
        if let Some(existing) = db.owner()? {
            return Err(VaultError::AlreadyInitialized(existing));
        }
        AccessControl::new(owner)?;

        let record = EventRecord::next(
            db.last_event()?.as_ref(),
            VaultEvent::OwnershipTransferred {
                previous_owner: Address::ZERO,
                new_owner: owner,
            },
        );
        db.commit(&LedgerBatch::new().set_owner(owner).append_event(record))?;
        info!(%owner, "vault initialized");

        Self::open(db, clock, gateway, config)
    }

    /// Opens an initialized database, rebuilds the ledger and recovers any
    /// interrupted withdrawals.
    pub fn open(
        db: VaultDB,
        clock: Arc<dyn Clock>,
        gateway: Arc<dyn PaymentGateway>,
        config: VaultConfig,
    ) -> VaultResult<Self> {
        let snapshot = db.load_snapshot()?;
        let owner = snapshot.owner.ok_or(VaultError::NotInitialized)?;
        let access = AccessControl::new(owner)
            .map_err(|_| DbError::Corrupt("stored owner is the zero address".to_string()))?;

        if let Some(head) = &snapshot.last_event {
            if !head.is_self_consistent() {
                return Err(DbError::Corrupt(format!(
                    "event {} does not match its hash",
                    head.sequence
                ))
                .into());
            }
        }

        let ledger = DepositLedger::restore(
            snapshot.deposits,
            snapshot.totals,
            snapshot.custody,
            snapshot.pending,
        );
        if !ledger.is_consistent() {
            return Err(DbError::Corrupt("ledger totals do not match deposits".to_string()).into());
        }

        let vault = Self {
            state: RwLock::new(VaultState {
                ledger,
                access,
                head: snapshot.last_event,
                settling: BTreeSet::new(),
            }),
            db,
            clock,
            gateway,
            config,
            listeners: RwLock::new(Vec::new()),
        };

        let report = vault.recover_pending()?;
        if report != RecoveryReport::default() {
            info!(
                committed = report.committed,
                rolled_back = report.rolled_back,
                "recovered interrupted withdrawals"
            );
        }

        {
            let state = vault.state.read();
            info!(
                %owner,
                accounts = state.ledger.account_count(),
                total_locked = %state.ledger.totals().total_locked,
                events = state.head.as_ref().map_or(0, |h| h.sequence + 1),
                "vault opened"
            );
        }

        Ok(vault)
    }

    /// Registers a listener for committed events.
    pub fn add_listener(&self, listener: Arc<dyn EventListener>) {
        self.listeners.write().push(listener);
    }

    // -- Mutations ----------------------------------------------------------

    /// Locks `value` for `lock_duration` seconds on behalf of `caller`.
    ///
    /// Returns the new deposit's id.
    pub fn deposit(
        &self,
        caller: Address,
        value: Amount,
        lock_duration: Timestamp,
    ) -> VaultResult<DepositId> {
        let mut state = self.state.write();
        let now = self.clock.now();

        let checkpoint = state
            .ledger
            .checkpoint(&caller, state.ledger.deposit_count(&caller));
        let receipt = state
            .ledger
            .deposit(caller, value, lock_duration, now, &self.config)
            .map_err(|e| rejected("deposit", &caller, e))?;

        let record = state.next_record(VaultEvent::Deposited {
            account: caller,
            deposit_id: receipt.deposit_id,
            amount: value,
            unlock_time: receipt.unlock_time,
            timestamp: now,
        });
        let batch = LedgerBatch::new()
            .put_deposit(
                caller,
                receipt.deposit_id,
                state.ledger.get_deposit(&caller, receipt.deposit_id),
            )
            .put_deposit_count(caller, receipt.deposit_id + 1)
            .set_totals(state.ledger.totals())
            .set_custody(state.ledger.vault_balance())
            .append_event(record);
        self.persist(&mut state, &batch, move |s| {
            s.ledger.restore_checkpoint(checkpoint)
        })?;

        info!(
            account = %caller,
            deposit_id = receipt.deposit_id,
            amount = %value,
            unlock_time = receipt.unlock_time,
            "deposit accepted"
        );
        Ok(receipt.deposit_id)
    }

    /// Withdraws the full amount of an unlocked deposit to `caller`.
    ///
    /// Only the depositing account can withdraw: deposits are looked up
    /// under `caller`. Returns the amount paid.
    pub fn withdraw(&self, caller: Address, deposit_id: DepositId) -> VaultResult<Amount> {
        let now = self.clock.now();
        let pending = {
            let mut state = self.state.write();

            let checkpoint = state.ledger.checkpoint(&caller, deposit_id);
            let pending = state
                .ledger
                .reserve_withdrawal(caller, deposit_id, now)
                .map_err(|e| rejected("withdraw", &caller, e))?;

            let batch = LedgerBatch::new()
                .put_deposit(
                    caller,
                    deposit_id,
                    state.ledger.get_deposit(&caller, deposit_id),
                )
                .set_totals(state.ledger.totals())
                .put_pending(pending.clone());
            self.persist(&mut state, &batch, move |s| {
                s.ledger.restore_checkpoint(checkpoint)
            })?;
            state.settling.insert((caller, deposit_id));
            pending
        };
        debug!(account = %caller, deposit_id, amount = %pending.amount, "withdrawal reserved");

        let outcome = self.pay(&pending);
        let mut state = self.state.write();
        self.settle(&mut state, &pending, outcome, now)
    }

    /// Hands the owner role to `new_owner`. Only the current owner may call.
    pub fn transfer_ownership(&self, caller: Address, new_owner: Address) -> VaultResult<()> {
        let mut state = self.state.write();

        let saved = state.access;
        let previous_owner = state
            .access
            .transfer_ownership(caller, new_owner)
            .map_err(|e| rejected("transfer_ownership", &caller, e))?;

        let record = state.next_record(VaultEvent::OwnershipTransferred {
            previous_owner,
            new_owner,
        });
        let batch = LedgerBatch::new().set_owner(new_owner).append_event(record);
        self.persist(&mut state, &batch, move |s| s.access = saved)?;

        info!(%previous_owner, %new_owner, "ownership transferred");
        Ok(())
    }

    /// Records value that reached the vault outside of [`deposit`](Self::deposit).
    ///
    /// Raises the custody balance only. Returns the new balance.
    pub fn credit_unaccounted(&self, value: Amount) -> VaultResult<Amount> {
        let mut state = self.state.write();
        let now = self.clock.now();

        let checkpoint = state.ledger.checkpoint(&Address::ZERO, 0);
        let custody = state.ledger.credit_unaccounted(value)?;

        let record = state.next_record(VaultEvent::ExternalCredit {
            amount: value,
            timestamp: now,
        });
        let batch = LedgerBatch::new().set_custody(custody).append_event(record);
        self.persist(&mut state, &batch, move |s| {
            s.ledger.restore_checkpoint(checkpoint)
        })?;

        info!(amount = %value, custody = %custody, "external credit recorded");
        Ok(custody)
    }

    /// Re-drives every reservation that no call is currently settling.
    ///
    /// Each one is paid again with its original order, then committed or
    /// rolled back. Runs on open, and can be called any time a storage
    /// failure has left a withdrawal pending.
    pub fn recover_pending(&self) -> VaultResult<RecoveryReport> {
        let stranded: Vec<PendingWithdrawal> = {
            let mut state = self.state.write();
            let stranded: Vec<PendingWithdrawal> = state
                .ledger
                .pending()
                .filter(|p| !state.settling.contains(&(p.account, p.deposit_id)))
                .cloned()
                .collect();
            for p in &stranded {
                state.settling.insert((p.account, p.deposit_id));
            }
            stranded
        };

        let mut report = RecoveryReport::default();
        let mut failure = None;
        for p in stranded {
            if failure.is_some() {
                self.state.write().settling.remove(&(p.account, p.deposit_id));
                continue;
            }
            warn!(
                account = %p.account,
                deposit_id = p.deposit_id,
                amount = %p.amount,
                reserved_at = p.reserved_at,
                "re-driving interrupted withdrawal"
            );
            let outcome = self.pay(&p);
            let now = self.clock.now();
            let mut state = self.state.write();
            match self.settle(&mut state, &p, outcome, now) {
                Ok(_) => report.committed += 1,
                Err(VaultError::Ledger(LedgerError::TransferFailed(_))) => report.rolled_back += 1,
                Err(e) => failure = Some(e),
            }
        }
        match failure {
            Some(e) => Err(e),
            None => Ok(report),
        }
    }

    // -- Reads --------------------------------------------------------------

    /// The deposit at `(account, deposit_id)`; all-zero if it never existed.
    pub fn get_deposit(&self, account: &Address, deposit_id: DepositId) -> Deposit {
        self.state.read().ledger.get_deposit(account, deposit_id)
    }

    pub fn get_deposit_count(&self, account: &Address) -> u64 {
        self.state.read().ledger.deposit_count(account)
    }

    /// Value held by the vault.
    pub fn get_vault_balance(&self) -> Amount {
        self.state.read().ledger.vault_balance()
    }

    /// Lifecycle state of a deposit at the current time.
    pub fn deposit_state(&self, account: &Address, deposit_id: DepositId) -> DepositState {
        let now = self.clock.now();
        self.state
            .read()
            .ledger
            .deposit_state(account, deposit_id, now)
    }

    pub fn deposits_of(&self, account: &Address) -> Vec<Deposit> {
        self.state.read().ledger.deposits_of(account).to_vec()
    }

    pub fn totals(&self) -> VaultTotals {
        self.state.read().ledger.totals()
    }

    pub fn owner(&self) -> Address {
        self.state.read().access.owner()
    }

    /// Withdrawals reserved but not settled.
    pub fn pending_withdrawals(&self) -> Vec<PendingWithdrawal> {
        self.state.read().ledger.pending().cloned().collect()
    }

    pub fn account_count(&self) -> usize {
        self.state.read().ledger.account_count()
    }

    /// Up to `limit` event records starting at sequence `from`.
    ///
    /// `limit` is clamped to [`MAX_EVENT_PAGE`].
    pub fn events(&self, from: u64, limit: usize) -> VaultResult<Vec<EventRecord>> {
        Ok(self.db.events_range(from, limit.min(MAX_EVENT_PAGE))?)
    }

    /// Number of records in the event log.
    pub fn event_count(&self) -> u64 {
        self.state
            .read()
            .head
            .as_ref()
            .map_or(0, |head| head.sequence + 1)
    }

    /// The most recent event record.
    pub fn last_event(&self) -> Option<EventRecord> {
        self.state.read().head.clone()
    }

    /// Re-verifies every link of the stored event chain.
    pub fn verify_event_chain(&self) -> VaultResult<()> {
        let state = self.state.read();
        self.db.verify_event_chain()?;
        if self.db.last_event()? != state.head {
            return Err(DbError::Corrupt("stored chain head differs from memory".to_string()).into());
        }
        Ok(())
    }

    /// Current time according to the vault's clock.
    pub fn now(&self) -> Timestamp {
        self.clock.now()
    }

    pub fn config(&self) -> &VaultConfig {
        &self.config
    }

    // -- Internals ----------------------------------------------------------

    /// Sends the payment order for a reservation. Runs without the lock.
    fn pay(&self, pending: &PendingWithdrawal) -> Result<(), PaymentError> {
        let order =
            PaymentOrder::for_withdrawal(pending.account, pending.deposit_id, pending.amount);
        self.gateway.pay(&order)
    }

    /// Phase two: commits or rolls back a reservation given the payment
    /// outcome.
    fn settle(
        &self,
        state: &mut VaultState,
        pending: &PendingWithdrawal,
        outcome: Result<(), PaymentError>,
        now: Timestamp,
    ) -> VaultResult<Amount> {
        let account = pending.account;
        let deposit_id = pending.deposit_id;
        state.settling.remove(&(account, deposit_id));
        let checkpoint = state.ledger.checkpoint(&account, deposit_id);

        match outcome {
            Ok(()) => {
                state
                    .ledger
                    .commit_withdrawal(&account, deposit_id)
                    .ok_or(LedgerError::ArithmeticOverflow)?;
                let record = state.next_record(VaultEvent::Withdrawn {
                    account,
                    deposit_id,
                    amount: pending.amount,
                    timestamp: now,
                });
                let batch = LedgerBatch::new()
                    .set_custody(state.ledger.vault_balance())
                    .remove_pending(account, deposit_id)
                    .append_event(record);
                if let Err(e) =
                    self.persist(state, &batch, move |s| s.ledger.restore_checkpoint(checkpoint))
                {
                    error!(
                        %account,
                        deposit_id,
                        amount = %pending.amount,
                        "withdrawal paid but not recorded, left pending"
                    );
                    return Err(e);
                }

                info!(%account, deposit_id, amount = %pending.amount, "withdrawal paid");
                Ok(pending.amount)
            }
            Err(e) => {
                state.ledger.rollback_withdrawal(&account, deposit_id);
                let batch = LedgerBatch::new()
                    .put_deposit(account, deposit_id, state.ledger.get_deposit(&account, deposit_id))
                    .set_totals(state.ledger.totals())
                    .remove_pending(account, deposit_id);
                if let Err(storage) =
                    self.persist(state, &batch, move |s| s.ledger.restore_checkpoint(checkpoint))
                {
                    error!(
                        %account,
                        deposit_id,
                        payment_error = %e,
                        "withdrawal rollback not recorded, deposit stays reserved"
                    );
                    return Err(storage);
                }

                warn!(%account, deposit_id, error = %e, "withdrawal payment failed, rolled back");
                Err(LedgerError::TransferFailed(e).into())
            }
        }
    }

    /// Commits `batch`; on failure runs `undo` against the in-memory state.
    fn persist(
        &self,
        state: &mut VaultState,
        batch: &LedgerBatch,
        undo: impl FnOnce(&mut VaultState),
    ) -> VaultResult<()> {
        if let Err(e) = self.db.commit(batch) {
            error!(error = %e, "ledger commit failed, reverting");
            undo(state);
            return Err(e.into());
        }

        if let Some(last) = batch.events().last() {
            state.head = Some(last.clone());
        }
        let listeners = self.listeners.read();
        for record in batch.events() {
            debug!(
                sequence = record.sequence,
                kind = record.event.kind(),
                account = ?record.event.account(),
                "event committed"
            );
            for listener in listeners.iter() {
                listener.on_event(record);
            }
        }
        Ok(())
    }
}

fn rejected(op: &'static str, caller: &Address, e: LedgerError) -> LedgerError {
    debug!(op, caller = %caller, error = %e, "operation rejected");
    e
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

//! # Core Ledger Types
//!
//! Plain data shared by the storage layer, the contracts crate, and the
//! node API. Behaviour lives elsewhere; the only logic here is the derived
//! [`DepositState`], which is a pure function of a deposit and a timestamp.

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::address::Address;

/// Value in the smallest unit (wei).
pub type Amount = u128;

/// Unix timestamp or duration, in seconds.
pub type Timestamp = u64;

/// Per-account deposit index, starting at 0.
pub type DepositId = u64;

// ---------------------------------------------------------------------------
// Deposit
// ---------------------------------------------------------------------------

/// One unit of value committed by an account.
///
/// A withdrawn deposit keeps `exists = true` and drops to `amount = 0`; it is
/// never removed. `Deposit::default()` is the "never created" record returned
/// for unknown ids.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Deposit {
    /// Value currently held. Zero once withdrawn.
    pub amount: Amount,
    /// Earliest timestamp at which withdrawal is permitted.
    pub unlock_time: Timestamp,
    /// Set on creation, never cleared.
    pub exists: bool,
}

impl Deposit {
    /// Creates a live deposit.
    pub fn new(amount: Amount, unlock_time: Timestamp) -> Self {
        Self {
            amount,
            unlock_time,
            exists: true,
        }
    }

    /// `true` once the deposit has been paid out.
    pub fn is_withdrawn(&self) -> bool {
        self.exists && self.amount == 0
    }

    /// `true` when `now` has reached the unlock time.
    pub fn is_unlocked_at(&self, now: Timestamp) -> bool {
        now >= self.unlock_time
    }

    /// The lifecycle state of this deposit at `now`.
    pub fn state(&self, now: Timestamp) -> DepositState {
        if !self.exists {
            DepositState::NonExistent
        } else if self.amount == 0 {
            DepositState::Withdrawn
        } else if self.is_unlocked_at(now) {
            DepositState::Unlocked
        } else {
            DepositState::Locked
        }
    }
}

// ---------------------------------------------------------------------------
// DepositState
// ---------------------------------------------------------------------------

/// Derived lifecycle state of a deposit.
///
/// `Locked -> Unlocked` happens by the passage of time alone; `Withdrawn` is
/// terminal.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DepositState {
    /// No deposit was ever created under this id.
    NonExistent,
    /// Holds value, unlock time not yet reached.
    Locked,
    /// Holds value and can be withdrawn.
    Unlocked,
    /// Paid out.
    Withdrawn,
}

impl fmt::Display for DepositState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DepositState::NonExistent => write!(f, "NonExistent"),
            DepositState::Locked => write!(f, "Locked"),
            DepositState::Unlocked => write!(f, "Unlocked"),
            DepositState::Withdrawn => write!(f, "Withdrawn"),
        }
    }
}

// ---------------------------------------------------------------------------
// VaultTotals
// ---------------------------------------------------------------------------

/// Vault-wide aggregates.
///
/// `total_locked + total_withdrawn == total_deposited` at every commit point.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct VaultTotals {
    /// Sum of `amount` over all existing deposits.
    pub total_locked: Amount,
    /// Cumulative value paid out by withdrawals.
    pub total_withdrawn: Amount,
    /// Cumulative value ever accepted by `deposit`.
    pub total_deposited: Amount,
}

impl VaultTotals {
    /// Checks the accounting identity between the three counters.
    pub fn is_balanced(&self) -> bool {
        self.total_locked.checked_add(self.total_withdrawn) == Some(self.total_deposited)
    }
}

// ---------------------------------------------------------------------------
// PendingWithdrawal
// ---------------------------------------------------------------------------

/// A withdrawal whose ledger effects are reserved but whose payment has not
/// been confirmed yet.
///
/// Persisted between the two phases of a withdrawal. Holding the original
/// `amount` is what makes rollback possible after a crash.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PendingWithdrawal {
    /// Deposit owner and payment recipient.
    pub account: Address,
    /// Deposit being withdrawn.
    pub deposit_id: DepositId,
    /// Amount the deposit held before it was zeroed.
    pub amount: Amount,
    /// When the reservation was made.
    pub reserved_at: Timestamp,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_deposit_is_nonexistent() {
        let d = Deposit::default();
        assert!(!d.exists);
        assert_eq!(d.amount, 0);
        assert_eq!(d.state(u64::MAX), DepositState::NonExistent);
        assert!(!d.is_withdrawn());
    }

    #[test]
    fn state_follows_time_and_amount() {
        let d = Deposit::new(50, 1_000);
        assert_eq!(d.state(999), DepositState::Locked);
        assert_eq!(d.state(1_000), DepositState::Unlocked);
        assert_eq!(d.state(5_000), DepositState::Unlocked);

        let withdrawn = Deposit { amount: 0, ..d };
        assert_eq!(withdrawn.state(5_000), DepositState::Withdrawn);
        assert!(withdrawn.is_withdrawn());
    }

    #[test]
    fn totals_balance_check() {
        let mut t = VaultTotals::default();
        assert!(t.is_balanced());
        t.total_deposited = 100;
        assert!(!t.is_balanced());
        t.total_locked = 60;
        t.total_withdrawn = 40;
        assert!(t.is_balanced());
    }
}

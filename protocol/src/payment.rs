//! # Outbound Payments
//!
//! A withdrawal ends with value leaving the vault. The ledger does not know
//! *how* that happens; it hands a [`PaymentOrder`] to a [`PaymentGateway`]
//! and acts on the answer.
//!
//! ## Idempotency contract
//!
//! Every order carries a deterministic `order_id` (`<account>/<deposit_id>`).
//! A gateway that has already settled an order id MUST return `Ok(())` for a
//! repeat of it without paying again. Crash recovery depends on this: a
//! withdrawal interrupted between reservation and commit is re-driven with
//! the same order, and the gateway's answer decides commit vs. rollback.
//!
//! ## Implementations
//!
//! - [`PayoutBook`] — durable, sled-backed record of payouts. Used by the node.
//! - [`MemoryGateway`] — in-memory, with a failure switch. Used by tests and
//!   benchmarks.

use chrono::Utc;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use thiserror::Error;

use crate::address::Address;
use crate::types::{Amount, DepositId, Timestamp};

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Why a payment did not go through.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PaymentError {
    /// The receiving side refused the transfer.
    #[error("payment rejected: {0}")]
    Rejected(String),

    /// The payment backend could not be reached or failed internally.
    #[error("payment backend unavailable: {0}")]
    Unavailable(String),
}

// ---------------------------------------------------------------------------
// PaymentOrder
// ---------------------------------------------------------------------------

/// An instruction to move `amount` out of the vault to `recipient`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PaymentOrder {
    /// Deterministic, unique per withdrawal.
    pub order_id: String,
    /// Who gets paid.
    pub recipient: Address,
    /// How much.
    pub amount: Amount,
}

impl PaymentOrder {
    /// The order that settles withdrawal of `deposit_id` for `account`.
    pub fn for_withdrawal(account: Address, deposit_id: DepositId, amount: Amount) -> Self {
        Self {
            order_id: withdrawal_order_id(&account, deposit_id),
            recipient: account,
            amount,
        }
    }
}

/// Canonical order id for a withdrawal.
pub fn withdrawal_order_id(account: &Address, deposit_id: DepositId) -> String {
    format!("{}/{}", account.to_hex(), deposit_id)
}

// ---------------------------------------------------------------------------
// PaymentGateway
// ---------------------------------------------------------------------------

/// Moves value out of the vault.
///
/// Called while the vault's write lock is held. Implementations must not
/// call back into the vault.
pub trait PaymentGateway: Send + Sync {
    /// Settles `order`. Must be idempotent on `order.order_id`.
    fn pay(&self, order: &PaymentOrder) -> Result<(), PaymentError>;
}

// ---------------------------------------------------------------------------
// PayoutBook
// ---------------------------------------------------------------------------

/// A settled payout as recorded by [`PayoutBook`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Payout {
    /// Who was paid.
    pub recipient: Address,
    /// How much.
    pub amount: Amount,
    /// When the payout was recorded (Unix seconds).
    pub paid_at: Timestamp,
}

/// Durable payout ledger on a dedicated sled tree.
///
/// Settling an order writes one entry keyed by its order id with a
/// compare-and-swap, so the first write wins and repeats are no-ops.
#[derive(Debug, Clone)]
pub struct PayoutBook {
    tree: sled::Tree,
}

impl PayoutBook {
    /// Wraps an opened tree (see `VaultDB::open_tree`).
    pub fn new(tree: sled::Tree) -> Self {
        Self { tree }
    }

    /// Looks up a settled payout.
    pub fn payout(&self, order_id: &str) -> Result<Option<Payout>, PaymentError> {
        match self.tree.get(order_id.as_bytes()).map_err(unavailable)? {
            Some(bytes) => bincode::deserialize(&bytes)
                .map(Some)
                .map_err(|e| PaymentError::Unavailable(e.to_string())),
            None => Ok(None),
        }
    }

    /// Total value ever paid to `recipient`.
    pub fn total_paid_to(&self, recipient: &Address) -> Result<Amount, PaymentError> {
        let prefix = format!("{}/", recipient.to_hex());
        let mut total: Amount = 0;
        for item in self.tree.scan_prefix(prefix.as_bytes()) {
            let (_, bytes) = item.map_err(unavailable)?;
            let payout: Payout = bincode::deserialize(&bytes)
                .map_err(|e| PaymentError::Unavailable(e.to_string()))?;
            total = total.saturating_add(payout.amount);
        }
        Ok(total)
    }

    /// Number of settled payouts.
    pub fn len(&self) -> usize {
        self.tree.len()
    }

    /// `true` when nothing has been paid yet.
    pub fn is_empty(&self) -> bool {
        self.tree.is_empty()
    }
}

impl PaymentGateway for PayoutBook {
    fn pay(&self, order: &PaymentOrder) -> Result<(), PaymentError> {
        let payout = Payout {
            recipient: order.recipient,
            amount: order.amount,
            paid_at: Utc::now().timestamp().max(0) as Timestamp,
        };
        let bytes =
            bincode::serialize(&payout).map_err(|e| PaymentError::Unavailable(e.to_string()))?;

        let swapped = self
            .tree
            .compare_and_swap(order.order_id.as_bytes(), None as Option<&[u8]>, Some(bytes))
            .map_err(unavailable)?;

        match swapped {
            Ok(()) => {
                self.tree.flush().map_err(unavailable)?;
                tracing::debug!(order_id = %order.order_id, amount = %order.amount, "payout recorded");
            }
            Err(_) => {
                tracing::debug!(order_id = %order.order_id, "payout already settled");
            }
        }
        Ok(())
    }
}

fn unavailable(e: sled::Error) -> PaymentError {
    PaymentError::Unavailable(e.to_string())
}

// ---------------------------------------------------------------------------
// MemoryGateway
// ---------------------------------------------------------------------------

/// In-memory gateway with a kill switch.
///
/// While `failing` is set every *new* order is rejected; orders that were
/// already settled still return `Ok`, as the idempotency contract requires.
#[derive(Debug, Default)]
pub struct MemoryGateway {
    settled: Mutex<BTreeMap<String, PaymentOrder>>,
    failing: Mutex<Option<String>>,
}

impl MemoryGateway {
    /// A gateway that accepts everything.
    pub fn new() -> Self {
        Self::default()
    }

    /// Rejects new orders with `reason` until [`recover`](Self::recover).
    pub fn fail_with(&self, reason: &str) {
        *self.failing.lock() = Some(reason.to_string());
    }

    /// Clears the failure switch.
    pub fn recover(&self) {
        *self.failing.lock() = None;
    }

    /// Total paid to `recipient`.
    pub fn paid_to(&self, recipient: &Address) -> Amount {
        self.settled
            .lock()
            .values()
            .filter(|o| o.recipient == *recipient)
            .map(|o| o.amount)
            .sum()
    }

    /// Number of settled orders.
    pub fn settled_count(&self) -> usize {
        self.settled.lock().len()
    }

    /// `true` if `order_id` has been settled.
    pub fn is_settled(&self, order_id: &str) -> bool {
        self.settled.lock().contains_key(order_id)
    }
}

impl PaymentGateway for MemoryGateway {
    fn pay(&self, order: &PaymentOrder) -> Result<(), PaymentError> {
        let mut settled = self.settled.lock();
        if settled.contains_key(&order.order_id) {
            return Ok(());
        }
        if let Some(reason) = self.failing.lock().clone() {
            return Err(PaymentError::Rejected(reason));
        }
        settled.insert(order.order_id.clone(), order.clone());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn order(byte: u8, id: DepositId, amount: Amount) -> PaymentOrder {
        PaymentOrder::for_withdrawal(Address::repeat_byte(byte), id, amount)
    }

    #[test]
    fn order_id_is_deterministic() {
        let a = order(7, 3, 100);
        let b = order(7, 3, 999);
        assert_eq!(a.order_id, b.order_id);
        assert_eq!(
            a.order_id,
            "0x0707070707070707070707070707070707070707/3"
        );
        assert_ne!(a.order_id, order(7, 4, 100).order_id);
    }

    #[test]
    fn memory_gateway_is_idempotent() {
        let gw = MemoryGateway::new();
        let o = order(1, 0, 500);
        gw.pay(&o).unwrap();
        gw.pay(&o).unwrap();
        assert_eq!(gw.settled_count(), 1);
        assert_eq!(gw.paid_to(&Address::repeat_byte(1)), 500);
    }

    #[test]
    fn memory_gateway_failure_switch() {
        let gw = MemoryGateway::new();
        let settled = order(1, 0, 10);
        gw.pay(&settled).unwrap();

        gw.fail_with("recipient rejects value");
        let err = gw.pay(&order(1, 1, 10)).unwrap_err();
        assert_eq!(err, PaymentError::Rejected("recipient rejects value".into()));

        // A repeat of a settled order still succeeds.
        gw.pay(&settled).unwrap();

        gw.recover();
        gw.pay(&order(1, 1, 10)).unwrap();
        assert_eq!(gw.settled_count(), 2);
    }

    #[test]
    fn payout_book_records_once() {
        let db = sled::Config::new().temporary(true).open().unwrap();
        let book = PayoutBook::new(db.open_tree("payouts").unwrap());
        assert!(book.is_empty());

        let o = order(2, 0, 1_000);
        book.pay(&o).unwrap();
        book.pay(&PaymentOrder { amount: 5, ..o.clone() }).unwrap();

        assert_eq!(book.len(), 1);
        let recorded = book.payout(&o.order_id).unwrap().unwrap();
        assert_eq!(recorded.amount, 1_000);
        assert_eq!(recorded.recipient, Address::repeat_byte(2));
    }

    #[test]
    fn payout_book_totals_per_recipient() {
        let db = sled::Config::new().temporary(true).open().unwrap();
        let book = PayoutBook::new(db.open_tree("payouts").unwrap());

        book.pay(&order(3, 0, 100)).unwrap();
        book.pay(&order(3, 1, 250)).unwrap();
        book.pay(&order(4, 0, 999)).unwrap();

        assert_eq!(book.total_paid_to(&Address::repeat_byte(3)).unwrap(), 350);
        assert_eq!(book.total_paid_to(&Address::repeat_byte(4)).unwrap(), 999);
        assert_eq!(book.total_paid_to(&Address::repeat_byte(5)).unwrap(), 0);
    }
}

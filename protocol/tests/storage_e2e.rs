//! End-to-end tests for the protocol layer on a real on-disk database.
//!
//! These tests drive `VaultDB` the way the vault does: one `LedgerBatch`
//! per operation, a hash-chained event per batch, the payout book on a
//! tree of the same database. Each test gets its own temporary directory.

use tempfile::TempDir;

use timelock_protocol::payment::{PaymentGateway, PayoutBook};
use timelock_protocol::storage::{LedgerBatch, VaultDB};
use timelock_protocol::{
    Address, Deposit, EventRecord, PaymentOrder, PendingWithdrawal, VaultEvent, VaultTotals,
};

// ---------------------------------------------------------------------------
// Test Helpers
// ---------------------------------------------------------------------------

const OWNER: Address = Address::repeat_byte(0x0E);
const ALICE: Address = Address::repeat_byte(0xA1);

fn open(dir: &TempDir) -> VaultDB {
    VaultDB::open(dir.path().join("db")).expect("open db")
}

/// Genesis batch: owner plus its `OwnershipTransferred` record.
fn genesis() -> (LedgerBatch, EventRecord) {
    let record = EventRecord::next(
        None,
        VaultEvent::OwnershipTransferred {
            previous_owner: Address::ZERO,
            new_owner: OWNER,
        },
    );
    let batch = LedgerBatch::new()
        .set_owner(OWNER)
        .append_event(record.clone());
    (batch, record)
}

/// Batch for a deposit of `amount` as `ALICE`'s `id`-th deposit.
fn deposit_batch(
    prev: &EventRecord,
    id: u64,
    amount: u128,
    totals: VaultTotals,
) -> (LedgerBatch, EventRecord) {
    let record = EventRecord::next(
        Some(prev),
        VaultEvent::Deposited {
            account: ALICE,
            deposit_id: id,
            amount,
            unlock_time: 0,
            timestamp: 0,
        },
    );
    let batch = LedgerBatch::new()
        .put_deposit(ALICE, id, Deposit::new(amount, 0))
        .put_deposit_count(ALICE, id + 1)
        .set_totals(totals)
        .set_custody(totals.total_locked)
        .append_event(record.clone());
    (batch, record)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[test]
fn ledger_survives_reopen() {
    let dir = TempDir::new().unwrap();
    {
        let db = open(&dir);
        let (batch, head) = genesis();
        db.commit(&batch).unwrap();

        let mut totals = VaultTotals::default();
        let mut head = head;
        for (id, amount) in [10u128, 20, 30].into_iter().enumerate() {
            totals.total_locked += amount;
            totals.total_deposited += amount;
            let (batch, record) = deposit_batch(&head, id as u64, amount, totals);
            db.commit(&batch).unwrap();
            head = record;
        }
        db.flush().unwrap();
    }

    let db = open(&dir);
    let snapshot = db.load_snapshot().unwrap();
    assert_eq!(snapshot.owner, Some(OWNER));
    assert_eq!(snapshot.totals.total_locked, 60);
    assert!(snapshot.totals.is_balanced());
    assert_eq!(snapshot.custody, 60);
    assert_eq!(snapshot.deposits[&ALICE].len(), 3);
    assert_eq!(snapshot.deposits[&ALICE][2].amount, 30);
    assert_eq!(snapshot.last_event.map(|e| e.sequence), Some(3));
    db.verify_event_chain().unwrap();
}

#[test]
fn two_phase_withdrawal_on_disk() {
    let dir = TempDir::new().unwrap();
    let db = open(&dir);
    let (batch, head) = genesis();
    db.commit(&batch).unwrap();

    let deposited = VaultTotals {
        total_locked: 50,
        total_withdrawn: 0,
        total_deposited: 50,
    };
    let (batch, head) = deposit_batch(&head, 0, 50, deposited);
    db.commit(&batch).unwrap();

    // Phase one: reserve.
    let reserved = VaultTotals {
        total_locked: 0,
        total_withdrawn: 50,
        total_deposited: 50,
    };
    let pending = PendingWithdrawal {
        account: ALICE,
        deposit_id: 0,
        amount: 50,
        reserved_at: 7,
    };
    db.commit(
        &LedgerBatch::new()
            .put_deposit(ALICE, 0, Deposit { amount: 0, ..Deposit::new(50, 0) })
            .set_totals(reserved)
            .put_pending(pending.clone()),
    )
    .unwrap();
    assert_eq!(db.pending_withdrawals().unwrap(), vec![pending]);
    assert_eq!(db.custody().unwrap(), 50);

    // Pay, twice: the book settles once.
    let book = PayoutBook::new(db.open_tree("payouts").unwrap());
    let order = PaymentOrder::for_withdrawal(ALICE, 0, 50);
    book.pay(&order).unwrap();
    book.pay(&order).unwrap();
    assert_eq!(book.len(), 1);
    assert_eq!(book.total_paid_to(&ALICE).unwrap(), 50);

    // Phase two: commit.
    let record = EventRecord::next(
        Some(&head),
        VaultEvent::Withdrawn {
            account: ALICE,
            deposit_id: 0,
            amount: 50,
            timestamp: 7,
        },
    );
    db.commit(
        &LedgerBatch::new()
            .set_custody(0)
            .remove_pending(ALICE, 0)
            .append_event(record),
    )
    .unwrap();

    assert!(db.pending_withdrawals().unwrap().is_empty());
    assert_eq!(db.custody().unwrap(), 0);
    assert_eq!(db.get_deposit(&ALICE, 0).unwrap().map(|d| d.is_withdrawn()), Some(true));
    assert_eq!(db.event_count(), 3);
    db.verify_event_chain().unwrap();
}

#[test]
fn payouts_share_the_database_directory() {
    let dir = TempDir::new().unwrap();
    {
        let db = open(&dir);
        let book = PayoutBook::new(db.open_tree("payouts").unwrap());
        book.pay(&PaymentOrder::for_withdrawal(ALICE, 3, 9)).unwrap();
        db.flush().unwrap();
    }

    let db = open(&dir);
    let book = PayoutBook::new(db.open_tree("payouts").unwrap());
    let payout = book
        .payout(&PaymentOrder::for_withdrawal(ALICE, 3, 9).order_id)
        .unwrap()
        .expect("payout persisted");
    assert_eq!(payout.recipient, ALICE);
    assert_eq!(payout.amount, 9);
}

#[test]
fn events_page_in_sequence_order() {
    let db = VaultDB::open_temporary().unwrap();
    let (batch, mut head) = genesis();
    db.commit(&batch).unwrap();

    let mut totals = VaultTotals::default();
    for id in 0..300u64 {
        totals.total_locked += 1;
        totals.total_deposited += 1;
        let (batch, record) = deposit_batch(&head, id, 1, totals);
        db.commit(&batch).unwrap();
        head = record;
    }

    let page = db.events_range(250, 100).unwrap();
    assert_eq!(page.len(), 51);
    assert_eq!(page.first().map(|e| e.sequence), Some(250));
    assert_eq!(page.last().map(|e| e.sequence), Some(300));
    assert!(page.windows(2).all(|w| w[1].prev_hash == w[0].hash));
    assert_eq!(db.deposit_count(&ALICE).unwrap(), 300);
}

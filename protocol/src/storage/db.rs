//! # VaultDB — Persistent Storage Engine
//!
//! The persistence layer for the vault ledger, built on sled's embedded
//! key-value store. All on-disk data flows through this module.
//!
//! ## Tree Layout
//!
//! | Tree             | Key                                   | Value                        |
//! |------------------|---------------------------------------|------------------------------|
//! | `deposits`       | `address` (20B) ‖ `id` (8B BE)        | `bincode(Deposit)`           |
//! | `deposit_counts` | `address` (20B)                       | `count` (8B BE)              |
//! | `events`         | `sequence` (8B BE)                    | `bincode(EventRecord)`       |
//! | `pending`        | `address` (20B) ‖ `id` (8B BE)        | `bincode(PendingWithdrawal)` |
//! | `metadata`       | key (UTF-8)                           | value (bytes)                |
//!
//! Payouts made by the node's gateway live in their own `payouts` tree,
//! opened through [`VaultDB::open_tree`].
//!
//! ## Atomicity
//!
//! [`VaultDB::commit`] applies a whole [`LedgerBatch`] inside one sled
//! transaction spanning all five trees, then flushes. Either everything
//! lands on disk or nothing does.

use sled::transaction::{ConflictableTransactionError, TransactionError};
use sled::{Db, Transactional, Tree};
use std::collections::BTreeMap;
use std::path::Path;
#[cfg(feature = "test-util")]
use std::sync::Arc;

#[cfg(feature = "test-util")]
use parking_lot::Mutex;

use super::batch::LedgerBatch;
use crate::address::{Address, ADDRESS_LENGTH};
use crate::config::STORAGE_SCHEMA_VERSION;
use crate::events::{verify_chain, ChainError, EventRecord, GENESIS_PREV_HASH};
use crate::types::{Amount, Deposit, DepositId, PendingWithdrawal, VaultTotals};

// ---------------------------------------------------------------------------
// Error Type
// ---------------------------------------------------------------------------

/// Errors that can occur during database operations.
#[derive(Debug, thiserror::Error)]
pub enum DbError {
    #[error("sled error: {0}")]
    Sled(#[from] sled::Error),

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("corrupt ledger data: {0}")]
    Corrupt(String),

    #[error("storage schema mismatch: found v{found}, expected v{expected}")]
    SchemaMismatch { found: u32, expected: u32 },

    #[error("event chain broken: {0}")]
    BrokenChain(#[from] ChainError),
}

pub type DbResult<T> = Result<T, DbError>;

// ---------------------------------------------------------------------------
// Metadata Keys
// ---------------------------------------------------------------------------

const META_SCHEMA_VERSION: &[u8] = b"schema_version";
const META_TOTALS: &[u8] = b"totals";
const META_CUSTODY: &[u8] = b"custody";
const META_OWNER: &[u8] = b"owner";

const DEPOSIT_KEY_LENGTH: usize = ADDRESS_LENGTH + 8;

// ---------------------------------------------------------------------------
// LedgerSnapshot
// ---------------------------------------------------------------------------

/// Everything needed to rebuild the in-memory ledger after a restart.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LedgerSnapshot {
    /// Deposits per account, in id order.
    pub deposits: BTreeMap<Address, Vec<Deposit>>,
    /// Vault totals.
    pub totals: VaultTotals,
    /// Custody balance.
    pub custody: Amount,
    /// Owner, if the vault has been initialized.
    pub owner: Option<Address>,
    /// Head of the event chain.
    pub last_event: Option<EventRecord>,
    /// Withdrawals reserved but not yet committed or rolled back.
    pub pending: Vec<PendingWithdrawal>,
}

// ---------------------------------------------------------------------------
// VaultDB
// ---------------------------------------------------------------------------

/// Persistent storage engine for the vault ledger.
///
/// # Thread Safety
///
/// sled is thread-safe; `VaultDB` is `Clone` and can be shared across
/// threads. Serializing *ledger* mutations is the caller's job (the vault
/// holds a write lock around every commit).
#[derive(Debug, Clone)]
pub struct VaultDB {
    db: Db,
    deposits: Tree,
    deposit_counts: Tree,
    events: Tree,
    pending: Tree,
    metadata: Tree,
    /// Commits left to succeed before one fails on purpose.
    #[cfg(feature = "test-util")]
    fail_after: Arc<Mutex<Option<usize>>>,
}

impl VaultDB {
    /// Open or create a database at the given filesystem path.
    pub fn open<P: AsRef<Path>>(path: P) -> DbResult<Self> {
        let db = sled::open(path)?;
        Self::from_db(db)
    }

    /// Create a temporary database that is removed when dropped.
    ///
    /// Ideal for unit tests — no filesystem side effects, no cleanup needed.
    pub fn open_temporary() -> DbResult<Self> {
        let config = sled::Config::new().temporary(true);
        let db = config.open()?;
        Self::from_db(db)
    }

    /// Internal constructor: opens named trees and checks the schema version.
    fn from_db(db: Db) -> DbResult<Self> {
        let this = Self {
            deposits: db.open_tree("deposits")?,
            deposit_counts: db.open_tree("deposit_counts")?,
            events: db.open_tree("events")?,
            pending: db.open_tree("pending")?,
            metadata: db.open_tree("metadata")?,
            db,
            #[cfg(feature = "test-util")]
            fail_after: Arc::default(),
        };
        this.check_schema()?;
        Ok(this)
    }

    fn check_schema(&self) -> DbResult<()> {
        match self.metadata.get(META_SCHEMA_VERSION)? {
            Some(bytes) => {
                let found = u32::from_be_bytes(bytes.as_ref().try_into().map_err(|_| {
                    DbError::Corrupt("invalid schema version bytes".to_string())
                })?);
                if found != STORAGE_SCHEMA_VERSION {
                    return Err(DbError::SchemaMismatch {
                        found,
                        expected: STORAGE_SCHEMA_VERSION,
                    });
                }
            }
            None => {
                self.metadata
                    .insert(META_SCHEMA_VERSION, &STORAGE_SCHEMA_VERSION.to_be_bytes()[..])?;
            }
        }
        Ok(())
    }

    /// Open a named sled tree from the underlying database.
    ///
    /// Used by components that need their own keyspace in the same
    /// database (e.g., the payout book).
    pub fn open_tree(&self, name: &str) -> DbResult<Tree> {
        Ok(self.db.open_tree(name)?)
    }

    // -- Fault injection ----------------------------------------------------

    /// Lets the next `successes` non-empty commits through, then fails one
    /// with an I/O error without writing anything. Shared by all clones.
    #[cfg(feature = "test-util")]
    pub fn fail_commit_after(&self, successes: usize) {
        *self.fail_after.lock() = Some(successes);
    }

    #[cfg(feature = "test-util")]
    fn injected_failure(&self) -> DbResult<()> {
        let mut slot = self.fail_after.lock();
        match *slot {
            Some(0) => {
                *slot = None;
                Err(DbError::Sled(sled::Error::Io(std::io::Error::new(
                    std::io::ErrorKind::Other,
                    "injected commit failure",
                ))))
            }
            Some(n) => {
                *slot = Some(n - 1);
                Ok(())
            }
            None => Ok(()),
        }
    }

    // -- Commit -------------------------------------------------------------

    /// Apply a batch atomically and flush it to disk.
    pub fn commit(&self, batch: &LedgerBatch) -> DbResult<()> {
        if batch.is_empty() {
            return Ok(());
        }
        #[cfg(feature = "test-util")]
        self.injected_failure()?;

        // Serialize up front: the transaction closure may be retried and
        // must not fail for non-storage reasons.
        let deposit_rows = batch
            .deposits
            .iter()
            .map(|(addr, id, dep)| Ok((deposit_key(addr, *id).to_vec(), encode(dep)?)))
            .collect::<DbResult<Vec<_>>>()?;
        let count_rows: Vec<(Vec<u8>, [u8; 8])> = batch
            .deposit_counts
            .iter()
            .map(|(addr, count)| (addr.as_bytes().to_vec(), count.to_be_bytes()))
            .collect();
        let event_rows = batch
            .events
            .iter()
            .map(|rec| Ok((rec.sequence.to_be_bytes(), encode(rec)?)))
            .collect::<DbResult<Vec<_>>>()?;
        let pending_rows = batch
            .pending_put
            .iter()
            .map(|p| Ok((deposit_key(&p.account, p.deposit_id).to_vec(), encode(p)?)))
            .collect::<DbResult<Vec<_>>>()?;
        let pending_removals: Vec<Vec<u8>> = batch
            .pending_remove
            .iter()
            .map(|(addr, id)| deposit_key(addr, *id).to_vec())
            .collect();
        let totals_bytes = batch.totals.as_ref().map(encode).transpose()?;
        let custody_bytes = batch.custody.map(|c| c.to_be_bytes());
        let owner_bytes = batch.owner.map(|o| *o.as_bytes());

        let result: Result<(), TransactionError<()>> = (
            &self.deposits,
            &self.deposit_counts,
            &self.events,
            &self.pending,
            &self.metadata,
        )
            .transaction(|(deposits, counts, events, pending, metadata)| {
                for (key, value) in &deposit_rows {
                    deposits.insert(key.as_slice(), value.as_slice())?;
                }
                for (key, value) in &count_rows {
                    counts.insert(key.as_slice(), &value[..])?;
                }
                for (key, value) in &event_rows {
                    events.insert(&key[..], value.as_slice())?;
                }
                for key in &pending_removals {
                    pending.remove(key.as_slice())?;
                }
                for (key, value) in &pending_rows {
                    pending.insert(key.as_slice(), value.as_slice())?;
                }
                if let Some(bytes) = &totals_bytes {
                    metadata.insert(META_TOTALS, bytes.as_slice())?;
                }
                if let Some(bytes) = &custody_bytes {
                    metadata.insert(META_CUSTODY, &bytes[..])?;
                }
                if let Some(bytes) = &owner_bytes {
                    metadata.insert(META_OWNER, &bytes[..])?;
                }
                Ok::<(), ConflictableTransactionError<()>>(())
            });

        match result {
            Ok(()) => {}
            Err(TransactionError::Storage(e)) => return Err(DbError::Sled(e)),
            Err(TransactionError::Abort(())) => {
                return Err(DbError::Corrupt("ledger transaction aborted".to_string()))
            }
        }

        self.db.flush()?;
        Ok(())
    }

    // -- Deposits -----------------------------------------------------------

    /// Fetch a single deposit. `None` if it was never created.
    pub fn get_deposit(&self, account: &Address, id: DepositId) -> DbResult<Option<Deposit>> {
        match self.deposits.get(deposit_key(account, id))? {
            Some(bytes) => Ok(Some(decode(&bytes)?)),
            None => Ok(None),
        }
    }

    /// Number of deposits an account has created.
    pub fn deposit_count(&self, account: &Address) -> DbResult<u64> {
        match self.deposit_counts.get(account.as_bytes())? {
            Some(bytes) => Ok(u64::from_be_bytes(bytes.as_ref().try_into().map_err(
                |_| DbError::Corrupt("invalid deposit count bytes".to_string()),
            )?)),
            None => Ok(0),
        }
    }

    /// All deposits of an account, in id order.
    pub fn deposits_of(&self, account: &Address) -> DbResult<Vec<Deposit>> {
        let mut out = Vec::new();
        for item in self.deposits.scan_prefix(account.as_bytes()) {
            let (_, bytes) = item?;
            out.push(decode(&bytes)?);
        }
        Ok(out)
    }

    // -- Metadata -----------------------------------------------------------

    /// Vault totals; zero when nothing has been committed yet.
    pub fn totals(&self) -> DbResult<VaultTotals> {
        match self.metadata.get(META_TOTALS)? {
            Some(bytes) => decode(&bytes),
            None => Ok(VaultTotals::default()),
        }
    }

    /// Custody balance.
    pub fn custody(&self) -> DbResult<Amount> {
        match self.metadata.get(META_CUSTODY)? {
            Some(bytes) => Ok(u128::from_be_bytes(bytes.as_ref().try_into().map_err(
                |_| DbError::Corrupt("invalid custody bytes".to_string()),
            )?)),
            None => Ok(0),
        }
    }

    /// Current owner, if one has been written.
    pub fn owner(&self) -> DbResult<Option<Address>> {
        match self.metadata.get(META_OWNER)? {
            Some(bytes) => Address::from_slice(&bytes)
                .map(Some)
                .map_err(|e| DbError::Corrupt(format!("owner: {e}"))),
            None => Ok(None),
        }
    }

    // -- Events -------------------------------------------------------------

    /// Up to `limit` records starting at `from`, in sequence order.
    pub fn events_range(&self, from: u64, limit: usize) -> DbResult<Vec<EventRecord>> {
        let mut out = Vec::with_capacity(limit.min(1024));
        for item in self.events.range(from.to_be_bytes()..).take(limit) {
            let (_, bytes) = item?;
            out.push(decode(&bytes)?);
        }
        Ok(out)
    }

    /// The most recent event record.
    pub fn last_event(&self) -> DbResult<Option<EventRecord>> {
        match self.events.last()? {
            Some((_, bytes)) => Ok(Some(decode(&bytes)?)),
            None => Ok(None),
        }
    }

    /// Number of records in the event log.
    pub fn event_count(&self) -> usize {
        self.events.len()
    }

    /// Re-verifies the whole event chain from genesis.
    pub fn verify_event_chain(&self) -> DbResult<()> {
        let mut anchor = GENESIS_PREV_HASH;
        let mut from = 0u64;
        loop {
            let page = self.events_range(from, 1024)?;
            let Some(last) = page.last() else {
                return Ok(());
            };
            if page[0].sequence != from {
                return Err(ChainError::SequenceGap {
                    expected: from,
                    found: page[0].sequence,
                }
                .into());
            }
            verify_chain(&page, anchor)?;
            anchor = last.hash;
            from = last.sequence + 1;
        }
    }

    // -- Pending withdrawals ------------------------------------------------

    /// All outstanding withdrawal reservations.
    pub fn pending_withdrawals(&self) -> DbResult<Vec<PendingWithdrawal>> {
        let mut out = Vec::new();
        for item in self.pending.iter() {
            let (_, bytes) = item?;
            out.push(decode(&bytes)?);
        }
        Ok(out)
    }

    // -- Snapshot -----------------------------------------------------------

    /// Load everything needed to rebuild the in-memory ledger.
    ///
    /// Cross-checks each account's deposit records against its counter; a
    /// mismatch means the directory was written by something other than
    /// [`commit`](Self::commit) and is reported as corrupt.
    pub fn load_snapshot(&self) -> DbResult<LedgerSnapshot> {
        let mut deposits: BTreeMap<Address, Vec<Deposit>> = BTreeMap::new();
        for item in self.deposits.iter() {
            let (key, bytes) = item?;
            let (account, id) = split_deposit_key(&key)?;
            let list = deposits.entry(account).or_default();
            if id != list.len() as u64 {
                return Err(DbError::Corrupt(format!(
                    "deposit ids for {account} are not contiguous at {id}"
                )));
            }
            list.push(decode(&bytes)?);
        }

        for item in self.deposit_counts.iter() {
            let (key, _) = item?;
            let account = Address::from_slice(&key)
                .map_err(|e| DbError::Corrupt(format!("deposit count key: {e}")))?;
            let count = self.deposit_count(&account)?;
            let stored = deposits.get(&account).map_or(0, |v| v.len() as u64);
            if count != stored {
                return Err(DbError::Corrupt(format!(
                    "{account}: counter says {count} deposits, found {stored}"
                )));
            }
        }

        Ok(LedgerSnapshot {
            deposits,
            totals: self.totals()?,
            custody: self.custody()?,
            owner: self.owner()?,
            last_event: self.last_event()?,
            pending: self.pending_withdrawals()?,
        })
    }

    // -- Utility ------------------------------------------------------------

    /// Number of deposit records across all accounts.
    pub fn deposit_record_count(&self) -> usize {
        self.deposits.len()
    }

    /// Force a flush of all pending writes to disk.
    pub fn flush(&self) -> DbResult<()> {
        self.db.flush()?;
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn deposit_key(account: &Address, id: DepositId) -> [u8; DEPOSIT_KEY_LENGTH] {
    let mut key = [0u8; DEPOSIT_KEY_LENGTH];
    key[..ADDRESS_LENGTH].copy_from_slice(account.as_bytes());
    key[ADDRESS_LENGTH..].copy_from_slice(&id.to_be_bytes());
    key
}

fn split_deposit_key(key: &[u8]) -> DbResult<(Address, DepositId)> {
    if key.len() != DEPOSIT_KEY_LENGTH {
        return Err(DbError::Corrupt(format!(
            "deposit key has {} bytes",
            key.len()
        )));
    }
    let account = Address::from_slice(&key[..ADDRESS_LENGTH])
        .map_err(|e| DbError::Corrupt(e.to_string()))?;
    let id = u64::from_be_bytes(
        key[ADDRESS_LENGTH..]
            .try_into()
            .map_err(|_| DbError::Corrupt("invalid deposit id bytes".to_string()))?,
    );
    Ok((account, id))
}

fn encode<T: serde::Serialize>(value: &T) -> DbResult<Vec<u8>> {
    bincode::serialize(value).map_err(|e| DbError::Serialization(e.to_string()))
}

fn decode<T: serde::de::DeserializeOwned>(bytes: &[u8]) -> DbResult<T> {
    bincode::deserialize(bytes).map_err(|e| DbError::Serialization(e.to_string()))
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::VaultEvent;

    // -- Helpers ------------------------------------------------------------

    fn alice() -> Address {
        Address::repeat_byte(0xA1)
    }

    fn bob() -> Address {
        Address::repeat_byte(0xB0)
    }

    fn deposited(account: Address, id: DepositId, amount: Amount) -> VaultEvent {
        VaultEvent::Deposited {
            account,
            deposit_id: id,
            amount,
            unlock_time: 100,
            timestamp: 10,
        }
    }

    /// Commits one deposit the way the vault would.
    fn commit_deposit(
        db: &VaultDB,
        prev: Option<&EventRecord>,
        account: Address,
        id: DepositId,
        amount: Amount,
        totals: &mut VaultTotals,
    ) -> EventRecord {
        totals.total_locked += amount;
        totals.total_deposited += amount;
        let record = EventRecord::next(prev, deposited(account, id, amount));
        let batch = LedgerBatch::new()
            .put_deposit(account, id, Deposit::new(amount, 100))
            .put_deposit_count(account, id + 1)
            .set_totals(*totals)
            .set_custody(totals.total_locked)
            .append_event(record.clone());
        db.commit(&batch).unwrap();
        record
    }

    // -- Tests --------------------------------------------------------------

    #[test]
    fn open_temporary_database() {
        let db = VaultDB::open_temporary().expect("should create temp db");
        assert_eq!(db.deposit_record_count(), 0);
        assert_eq!(db.event_count(), 0);
        assert_eq!(db.totals().unwrap(), VaultTotals::default());
        assert_eq!(db.custody().unwrap(), 0);
        assert!(db.owner().unwrap().is_none());
    }

    #[test]
    fn reopen_persistent_database() {
        let dir = tempfile::tempdir().expect("tempdir");
        {
            let db = VaultDB::open(dir.path()).expect("should open db");
            let mut totals = VaultTotals::default();
            commit_deposit(&db, None, alice(), 0, 500, &mut totals);
            db.commit(&LedgerBatch::new().set_owner(bob())).unwrap();
        }

        let db = VaultDB::open(dir.path()).expect("should reopen db");
        assert_eq!(db.deposit_count(&alice()).unwrap(), 1);
        assert_eq!(db.get_deposit(&alice(), 0).unwrap(), Some(Deposit::new(500, 100)));
        assert_eq!(db.owner().unwrap(), Some(bob()));
        assert_eq!(db.event_count(), 1);
    }

    #[test]
    fn schema_mismatch_is_rejected() {
        let dir = tempfile::tempdir().expect("tempdir");
        {
            let db = VaultDB::open(dir.path()).unwrap();
            db.metadata
                .insert(META_SCHEMA_VERSION, &99u32.to_be_bytes()[..])
                .unwrap();
            db.flush().unwrap();
        }
        let err = VaultDB::open(dir.path()).unwrap_err();
        assert!(matches!(
            err,
            DbError::SchemaMismatch {
                found: 99,
                expected: STORAGE_SCHEMA_VERSION
            }
        ));
    }

    #[test]
    fn missing_records_read_as_defaults() {
        let db = VaultDB::open_temporary().unwrap();
        assert!(db.get_deposit(&alice(), 0).unwrap().is_none());
        assert_eq!(db.deposit_count(&alice()).unwrap(), 0);
        assert!(db.deposits_of(&alice()).unwrap().is_empty());
        assert!(db.events_range(0, 10).unwrap().is_empty());
        assert!(db.last_event().unwrap().is_none());
    }

    #[test]
    fn deposits_scan_in_id_order_per_account() {
        let db = VaultDB::open_temporary().unwrap();
        let mut totals = VaultTotals::default();
        let mut last = None;
        // Interleave accounts; id 256 checks big-endian ordering past one byte.
        for id in 0..300u64 {
            last = Some(commit_deposit(&db, last.as_ref(), alice(), id, 1 + id as u128, &mut totals));
            if id < 3 {
                last = Some(commit_deposit(&db, last.as_ref(), bob(), id, 7, &mut totals));
            }
        }

        let a = db.deposits_of(&alice()).unwrap();
        assert_eq!(a.len(), 300);
        assert_eq!(a[0].amount, 1);
        assert_eq!(a[256].amount, 257);
        assert_eq!(db.deposits_of(&bob()).unwrap().len(), 3);
        assert_eq!(db.deposit_count(&alice()).unwrap(), 300);
    }

    #[test]
    fn commit_writes_every_tree() {
        let db = VaultDB::open_temporary().unwrap();
        let pending = PendingWithdrawal {
            account: alice(),
            deposit_id: 0,
            amount: 500,
            reserved_at: 42,
        };
        let totals = VaultTotals {
            total_locked: 0,
            total_withdrawn: 500,
            total_deposited: 500,
        };
        let batch = LedgerBatch::new()
            .put_deposit(alice(), 0, Deposit { amount: 0, unlock_time: 100, exists: true })
            .put_deposit_count(alice(), 1)
            .set_totals(totals)
            .set_custody(500)
            .set_owner(bob())
            .put_pending(pending.clone());
        db.commit(&batch).unwrap();

        assert_eq!(db.get_deposit(&alice(), 0).unwrap().unwrap().amount, 0);
        assert_eq!(db.totals().unwrap(), totals);
        assert_eq!(db.custody().unwrap(), 500);
        assert_eq!(db.owner().unwrap(), Some(bob()));
        assert_eq!(db.pending_withdrawals().unwrap(), vec![pending]);

        db.commit(&LedgerBatch::new().remove_pending(alice(), 0)).unwrap();
        assert!(db.pending_withdrawals().unwrap().is_empty());
    }

    #[test]
    fn empty_commit_is_noop() {
        let db = VaultDB::open_temporary().unwrap();
        db.commit(&LedgerBatch::new()).unwrap();
        assert_eq!(db.event_count(), 0);
    }

    #[test]
    fn events_range_pages() {
        let db = VaultDB::open_temporary().unwrap();
        let mut totals = VaultTotals::default();
        let mut last = None;
        for id in 0..10 {
            last = Some(commit_deposit(&db, last.as_ref(), alice(), id, 1, &mut totals));
        }

        let page = db.events_range(3, 4).unwrap();
        assert_eq!(page.len(), 4);
        assert_eq!(page[0].sequence, 3);
        assert_eq!(page[3].sequence, 6);
        assert!(db.events_range(10, 5).unwrap().is_empty());
        assert_eq!(db.last_event().unwrap().unwrap().sequence, 9);
        db.verify_event_chain().unwrap();
    }

    #[test]
    fn tampered_event_fails_verification() {
        let db = VaultDB::open_temporary().unwrap();
        let mut totals = VaultTotals::default();
        let first = commit_deposit(&db, None, alice(), 0, 10, &mut totals);
        commit_deposit(&db, Some(&first), alice(), 1, 20, &mut totals);

        let mut forged = first.clone();
        forged.event = deposited(alice(), 0, 1_000_000);
        db.events
            .insert(0u64.to_be_bytes(), encode(&forged).unwrap())
            .unwrap();

        let err = db.verify_event_chain().unwrap_err();
        assert!(matches!(err, DbError::BrokenChain(ChainError::HashMismatch(0))));
    }

    #[test]
    fn snapshot_rebuilds_state() {
        let db = VaultDB::open_temporary().unwrap();
        let mut totals = VaultTotals::default();
        let r0 = commit_deposit(&db, None, alice(), 0, 100, &mut totals);
        let r1 = commit_deposit(&db, Some(&r0), alice(), 1, 50, &mut totals);
        commit_deposit(&db, Some(&r1), bob(), 0, 7, &mut totals);
        db.commit(&LedgerBatch::new().set_owner(alice())).unwrap();

        let snap = db.load_snapshot().unwrap();
        assert_eq!(snap.deposits[&alice()].len(), 2);
        assert_eq!(snap.deposits[&bob()][0].amount, 7);
        assert_eq!(snap.totals.total_locked, 157);
        assert_eq!(snap.custody, 157);
        assert_eq!(snap.owner, Some(alice()));
        assert_eq!(snap.last_event.unwrap().sequence, 2);
        assert!(snap.pending.is_empty());
    }

    #[test]
    fn snapshot_detects_counter_mismatch() {
        let db = VaultDB::open_temporary().unwrap();
        let batch = LedgerBatch::new()
            .put_deposit(alice(), 0, Deposit::new(5, 0))
            .put_deposit_count(alice(), 3);
        db.commit(&batch).unwrap();
        assert!(matches!(db.load_snapshot(), Err(DbError::Corrupt(_))));
    }

    #[test]
    fn concurrent_reads_do_not_block() {
        use std::sync::Arc;
        use std::thread;

        let db = Arc::new(VaultDB::open_temporary().unwrap());
        let mut totals = VaultTotals::default();
        let mut last = None;
        for id in 0..10u64 {
            last = Some(commit_deposit(&db, last.as_ref(), alice(), id, 1_000, &mut totals));
        }

        let handles: Vec<_> = (0..4)
            .map(|_| {
                let db = Arc::clone(&db);
                thread::spawn(move || {
                    for id in 0..10u64 {
                        let d = db.get_deposit(&alice(), id).unwrap().unwrap();
                        assert_eq!(d.amount, 1_000);
                    }
                    assert_eq!(db.totals().unwrap().total_locked, 10_000);
                })
            })
            .collect();

        for handle in handles {
            handle.join().expect("reader thread should not panic");
        }
    }
}

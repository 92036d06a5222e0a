//! # Storage Module
//!
//! Persistent storage for the vault ledger.
//!
//! ## Architecture
//!
//! ```text
//! batch.rs — LedgerBatch: the set of writes one operation commits
//! db.rs    — VaultDB: sled trees, atomic multi-tree commits, snapshot load
//! ```
//!
//! ## Data Flow
//!
//! ```text
//! Vault operation → LedgerBatch → VaultDB::commit (one sled transaction)
//!                                       ↓
//!        restart → VaultDB::load_snapshot → in-memory ledger
//! ```
//!
//! ## Design Decisions
//!
//! 1. **One transaction per operation.** Deposits, counters, totals, owner,
//!    pending withdrawals and the event log are written together or not at
//!    all. A crash never leaves a deposit without its event.
//!
//! 2. **Big-endian integer keys.** sled orders keys lexicographically, so
//!    big-endian `u64`s make deposit ids and event sequences scan in
//!    numeric order.
//!
//! 3. **Bincode for on-disk serialization.** Compact, fast, deterministic.
//!    JSON is for the API; bincode is for storage.

pub mod batch;
pub mod db;

pub use batch::LedgerBatch;
pub use db::{DbError, DbResult, LedgerSnapshot, VaultDB};

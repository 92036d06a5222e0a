//! # Timelock Vault Contracts
//!
//! The state machines of the vault and the service that persists them:
//!
//! - **Deposit Ledger** — per-account sequences of time-locked deposits,
//!   vault-wide totals and the custody balance, with two-phase withdrawals.
//! - **Access Control** — a single owner role whose only power is to hand
//!   itself to someone else.
//! - **Vault** — both of the above behind one lock, backed by sled and an
//!   append-only, hash-chained event log.
//!
//! ## Design Principles
//!
//! 1. All monetary operations check for overflow. We use `checked_add` and
//!    `checked_sub` everywhere, because wrapping arithmetic and money do not
//!    mix.
//! 2. A failed operation changes nothing, in memory or on disk.
//! 3. Identity is an explicit `caller` argument. Authenticating it is the
//!    calling layer's job.
//! 4. Time is passed in, never read ambiently by the state machines.

pub mod access_control;
pub mod deposit_ledger;
pub mod error;
pub mod vault;

pub use access_control::AccessControl;
pub use deposit_ledger::{Checkpoint, DepositLedger, DepositReceipt};
pub use error::{ErrorKind, LedgerError};
pub use vault::{EventListener, RecoveryReport, Vault, VaultError, VaultResult};

// Copyright (c) 2026 ALAS Technology. MIT License.
// See LICENSE for details.

//! # Timelock Protocol — Core Library
//!
//! The primitives every other crate in the workspace builds on. Nothing in
//! here knows what a deposit *means*; it only knows how to name accounts,
//! tell time, record what happened, move money out, and put bytes on disk.
//!
//! ## Architecture
//!
//! - **address** — 20-byte account identities with `0x` hex encoding.
//! - **types** — Amounts, deposit records, derived deposit states, totals.
//! - **clock** — Injectable time source. Tests never touch the wall clock.
//! - **events** — The audit trail: vault events and the BLAKE3 record chain.
//! - **payment** — Outbound value transfer behind an idempotent gateway trait.
//! - **storage** — sled-backed persistence with multi-tree atomic commits.
//! - **config** — Constants and runtime vault policy.
//!
//! ## Design Philosophy
//!
//! 1. Money is `u128` in the smallest unit. No floats, no wrapping.
//! 2. Time is injected, never read ambiently.
//! 3. Every write that matters lands in a single sled transaction.

pub mod address;
pub mod clock;
pub mod config;
pub mod events;
pub mod payment;
pub mod storage;
pub mod types;

pub use address::{Address, AddressError};
pub use clock::{Clock, ManualClock, SystemClock};
pub use events::{EventRecord, VaultEvent};
pub use payment::{PaymentError, PaymentGateway, PaymentOrder};
pub use types::{
    Amount, Deposit, DepositId, DepositState, PendingWithdrawal, Timestamp, VaultTotals,
};

//! # Ledger Errors
//!
//! Every precondition the vault enforces has its own variant. A failed
//! operation leaves no trace in the ledger; the variant is the whole story.
//!
//! [`ErrorKind`] is the stable, payload-free classification exposed to API
//! clients and metrics labels.

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

use timelock_protocol::{Address, DepositId, PaymentError, Timestamp};

// ---------------------------------------------------------------------------
// LedgerError
// ---------------------------------------------------------------------------

/// Errors produced by the deposit ledger and the access-control facet.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LedgerError {
    /// Deposits must carry a strictly positive value.
    #[error("deposit value must be greater than zero")]
    InvalidAmount,

    /// No deposit was ever created under this id.
    #[error("no deposit {deposit_id} for account {account}")]
    NoSuchDeposit {
        /// Account that was queried.
        account: Address,
        /// The unknown id.
        deposit_id: DepositId,
    },

    /// The deposit has already been paid out.
    #[error("deposit {deposit_id} already withdrawn")]
    AlreadyWithdrawn {
        /// The withdrawn deposit.
        deposit_id: DepositId,
    },

    /// The unlock time has not been reached.
    #[error("deposit still locked until {unlock_time} (now {now})")]
    StillLocked {
        /// When the deposit unlocks.
        unlock_time: Timestamp,
        /// Time of the attempt.
        now: Timestamp,
    },

    /// The outbound payment failed; the withdrawal was rolled back.
    #[error("transfer failed: {0}")]
    TransferFailed(#[from] PaymentError),

    /// The caller does not hold the owner role.
    #[error("caller {caller} is not the owner")]
    Unauthorized {
        /// Who tried.
        caller: Address,
    },

    /// The null address was supplied where a real account is required.
    #[error("the zero address is not a valid account")]
    InvalidAddress,

    /// The requested lock exceeds the configured maximum.
    #[error("lock duration {requested}s exceeds maximum of {max}s")]
    LockDurationTooLong {
        /// Requested lock duration in seconds.
        requested: Timestamp,
        /// Configured cap in seconds.
        max: Timestamp,
    },

    /// A timestamp or amount computation would overflow.
    #[error("arithmetic overflow")]
    ArithmeticOverflow,
}

impl LedgerError {
    /// The payload-free classification of this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            LedgerError::InvalidAmount => ErrorKind::InvalidAmount,
            LedgerError::NoSuchDeposit { .. } => ErrorKind::NoSuchDeposit,
            LedgerError::AlreadyWithdrawn { .. } => ErrorKind::AlreadyWithdrawn,
            LedgerError::StillLocked { .. } => ErrorKind::StillLocked,
            LedgerError::TransferFailed(_) => ErrorKind::TransferFailed,
            LedgerError::Unauthorized { .. } => ErrorKind::Unauthorized,
            LedgerError::InvalidAddress => ErrorKind::InvalidAddress,
            LedgerError::LockDurationTooLong { .. } => ErrorKind::LockDurationTooLong,
            LedgerError::ArithmeticOverflow => ErrorKind::ArithmeticOverflow,
        }
    }
}

// ---------------------------------------------------------------------------
// ErrorKind
// ---------------------------------------------------------------------------

/// Stable error classification.
///
/// Serialized with its variant name (`"StillLocked"`, ...). Adding variants
/// is fine; renaming them breaks API clients.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorKind {
    InvalidAmount,
    NoSuchDeposit,
    AlreadyWithdrawn,
    StillLocked,
    TransferFailed,
    Unauthorized,
    InvalidAddress,
    LockDurationTooLong,
    ArithmeticOverflow,
    NotInitialized,
    AlreadyInitialized,
    Storage,
}

impl ErrorKind {
    /// Variant name as a static string, for metric labels.
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::InvalidAmount => "InvalidAmount",
            ErrorKind::NoSuchDeposit => "NoSuchDeposit",
            ErrorKind::AlreadyWithdrawn => "AlreadyWithdrawn",
            ErrorKind::StillLocked => "StillLocked",
            ErrorKind::TransferFailed => "TransferFailed",
            ErrorKind::Unauthorized => "Unauthorized",
            ErrorKind::InvalidAddress => "InvalidAddress",
            ErrorKind::LockDurationTooLong => "LockDurationTooLong",
            ErrorKind::ArithmeticOverflow => "ArithmeticOverflow",
            ErrorKind::NotInitialized => "NotInitialized",
            ErrorKind::AlreadyInitialized => "AlreadyInitialized",
            ErrorKind::Storage => "Storage",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kinds_match_variants() {
        assert_eq!(LedgerError::InvalidAmount.kind(), ErrorKind::InvalidAmount);
        assert_eq!(
            LedgerError::StillLocked {
                unlock_time: 10,
                now: 5
            }
            .kind(),
            ErrorKind::StillLocked
        );
        let e: LedgerError = PaymentError::Rejected("no".into()).into();
        assert_eq!(e.kind(), ErrorKind::TransferFailed);
    }

    #[test]
    fn kind_serializes_as_variant_name() {
        let json = serde_json::to_string(&ErrorKind::AlreadyWithdrawn).unwrap();
        assert_eq!(json, "\"AlreadyWithdrawn\"");
        assert_eq!(ErrorKind::Unauthorized.to_string(), "Unauthorized");
    }

    #[test]
    fn messages_carry_context() {
        let e = LedgerError::StillLocked {
            unlock_time: 2_000,
            now: 1_500,
        };
        assert_eq!(e.to_string(), "deposit still locked until 2000 (now 1500)");

        let caller = Address::repeat_byte(0x11);
        let e = LedgerError::Unauthorized { caller };
        assert!(e.to_string().contains(&caller.to_hex()));
    }
}

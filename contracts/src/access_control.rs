//! # Access Control
//!
//! A single owner role. The owner can hand the role to someone else and
//! that is all it can do: deposits and withdrawals are never gated by it.

use serde::{Deserialize, Serialize};

use timelock_protocol::Address;

use crate::error::LedgerError;

/// Holder of the owner role.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccessControl {
    owner: Address,
}

impl AccessControl {
    /// Creates the facet with its initial owner.
    ///
    /// # Errors
    ///
    /// [`LedgerError::InvalidAddress`] if `owner` is the zero address.
    pub fn new(owner: Address) -> Result<Self, LedgerError> {
        if owner.is_zero() {
            return Err(LedgerError::InvalidAddress);
        }
        Ok(Self { owner })
    }

    /// The current owner.
    pub fn owner(&self) -> Address {
        self.owner
    }

    pub fn is_owner(&self, account: &Address) -> bool {
        self.owner == *account
    }

    /// Hands the owner role to `new_owner` and returns the previous owner.
    ///
    /// The caller is checked before the new owner, so a non-owner always
    /// sees `Unauthorized` whatever it passes. Transferring to oneself is
    /// allowed.
    pub fn transfer_ownership(
        &mut self,
        caller: Address,
        new_owner: Address,
    ) -> Result<Address, LedgerError> {
        if !self.is_owner(&caller) {
            return Err(LedgerError::Unauthorized { caller });
        }
        if new_owner.is_zero() {
            return Err(LedgerError::InvalidAddress);
        }
        let previous = self.owner;
        self.owner = new_owner;
        Ok(previous)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zero_initial_owner_rejected() {
        assert_eq!(
            AccessControl::new(Address::ZERO),
            Err(LedgerError::InvalidAddress)
        );
    }

    #[test]
    fn owner_can_transfer() {
        let a = Address::repeat_byte(1);
        let b = Address::repeat_byte(2);
        let mut ac = AccessControl::new(a).unwrap();
        assert_eq!(ac.transfer_ownership(a, b), Ok(a));
        assert_eq!(ac.owner(), b);
        assert!(!ac.is_owner(&a));
    }

    #[test]
    fn authorization_checked_before_target() {
        let a = Address::repeat_byte(1);
        let mallory = Address::repeat_byte(9);
        let mut ac = AccessControl::new(a).unwrap();
        assert_eq!(
            ac.transfer_ownership(mallory, Address::ZERO),
            Err(LedgerError::Unauthorized { caller: mallory })
        );
        assert_eq!(
            ac.transfer_ownership(a, Address::ZERO),
            Err(LedgerError::InvalidAddress)
        );
        assert_eq!(ac.owner(), a);
    }
}

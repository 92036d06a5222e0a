//! # Vault Events & the Audit Chain
//!
//! Every committed state change produces exactly one [`VaultEvent`]. Events
//! are wrapped in an [`EventRecord`] carrying a gap-free sequence number and
//! a BLAKE3 hash linking it to the previous record:
//!
//! ```text
//! hash(n) = BLAKE3( hash(n-1) || sequence(n) || canonical(event(n)) )
//! hash(-1) = [0; 32]
//! ```
//!
//! Rewriting any past record changes every later hash, so a reader holding
//! the latest hash can detect tampering with [`verify_chain`].
//!
//! The canonical encoding is a one-byte tag followed by fixed-width
//! little-endian fields. It does not depend on serde, so the chain stays
//! stable across serializer upgrades.

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

use crate::address::Address;
use crate::types::{Amount, DepositId, Timestamp};

/// Hash of the (non-existent) record before sequence 0.
pub const GENESIS_PREV_HASH: [u8; 32] = [0u8; 32];

// ---------------------------------------------------------------------------
// VaultEvent
// ---------------------------------------------------------------------------

/// Observable state change.
///
/// Externally tagged so that the same derive works for both bincode (on
/// disk) and JSON (`{"deposited": {...}}` on the API).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VaultEvent {
    /// A deposit was accepted.
    Deposited {
        account: Address,
        deposit_id: DepositId,
        amount: Amount,
        unlock_time: Timestamp,
        timestamp: Timestamp,
    },
    /// A deposit was paid out.
    Withdrawn {
        account: Address,
        deposit_id: DepositId,
        amount: Amount,
        timestamp: Timestamp,
    },
    /// The owner role moved.
    OwnershipTransferred {
        previous_owner: Address,
        new_owner: Address,
    },
    /// Value reached the vault outside of `deposit`.
    ExternalCredit { amount: Amount, timestamp: Timestamp },
}

impl VaultEvent {
    /// Short name, used as a log field and metrics label.
    pub fn kind(&self) -> &'static str {
        match self {
            VaultEvent::Deposited { .. } => "deposited",
            VaultEvent::Withdrawn { .. } => "withdrawn",
            VaultEvent::OwnershipTransferred { .. } => "ownership_transferred",
            VaultEvent::ExternalCredit { .. } => "external_credit",
        }
    }

    /// Account the event concerns, if any.
    pub fn account(&self) -> Option<Address> {
        match self {
            VaultEvent::Deposited { account, .. } | VaultEvent::Withdrawn { account, .. } => {
                Some(*account)
            }
            VaultEvent::OwnershipTransferred { new_owner, .. } => Some(*new_owner),
            VaultEvent::ExternalCredit { .. } => None,
        }
    }

    /// Serde-independent byte encoding used for hashing.
    pub fn canonical_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(96);
        match self {
            VaultEvent::Deposited {
                account,
                deposit_id,
                amount,
                unlock_time,
                timestamp,
            } => {
                out.push(0x01);
                out.extend_from_slice(account.as_bytes());
                out.extend_from_slice(&deposit_id.to_le_bytes());
                out.extend_from_slice(&amount.to_le_bytes());
                out.extend_from_slice(&unlock_time.to_le_bytes());
                out.extend_from_slice(&timestamp.to_le_bytes());
            }
            VaultEvent::Withdrawn {
                account,
                deposit_id,
                amount,
                timestamp,
            } => {
                out.push(0x02);
                out.extend_from_slice(account.as_bytes());
                out.extend_from_slice(&deposit_id.to_le_bytes());
                out.extend_from_slice(&amount.to_le_bytes());
                out.extend_from_slice(&timestamp.to_le_bytes());
            }
            VaultEvent::OwnershipTransferred {
                previous_owner,
                new_owner,
            } => {
                out.push(0x03);
                out.extend_from_slice(previous_owner.as_bytes());
                out.extend_from_slice(new_owner.as_bytes());
            }
            VaultEvent::ExternalCredit { amount, timestamp } => {
                out.push(0x04);
                out.extend_from_slice(&amount.to_le_bytes());
                out.extend_from_slice(&timestamp.to_le_bytes());
            }
        }
        out
    }
}

impl fmt::Display for VaultEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            VaultEvent::Deposited {
                account,
                deposit_id,
                amount,
                unlock_time,
                ..
            } => write!(
                f,
                "Deposited({account}, #{deposit_id}, {amount}, unlock={unlock_time})"
            ),
            VaultEvent::Withdrawn {
                account,
                deposit_id,
                amount,
                ..
            } => write!(f, "Withdrawn({account}, #{deposit_id}, {amount})"),
            VaultEvent::OwnershipTransferred {
                previous_owner,
                new_owner,
            } => write!(f, "OwnershipTransferred({previous_owner} -> {new_owner})"),
            VaultEvent::ExternalCredit { amount, .. } => write!(f, "ExternalCredit({amount})"),
        }
    }
}

// ---------------------------------------------------------------------------
// EventRecord
// ---------------------------------------------------------------------------

/// A sequenced, hash-chained event as stored in the audit log.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventRecord {
    /// Position in the log, starting at 0.
    pub sequence: u64,
    /// Hash of the previous record.
    pub prev_hash: [u8; 32],
    /// Hash of this record.
    pub hash: [u8; 32],
    /// The event itself.
    pub event: VaultEvent,
}

impl EventRecord {
    /// Builds the record that follows `prev` (or the first record when
    /// `prev` is `None`).
    pub fn next(prev: Option<&EventRecord>, event: VaultEvent) -> Self {
        let (sequence, prev_hash) = match prev {
            Some(p) => (p.sequence + 1, p.hash),
            None => (0, GENESIS_PREV_HASH),
        };
        Self::with_link(sequence, prev_hash, event)
    }

    /// Builds a record at an explicit position in the chain.
    pub fn with_link(sequence: u64, prev_hash: [u8; 32], event: VaultEvent) -> Self {
        let hash = compute_record_hash(sequence, &prev_hash, &event);
        Self {
            sequence,
            prev_hash,
            hash,
            event,
        }
    }

    /// Recomputes this record's hash from its contents.
    pub fn is_self_consistent(&self) -> bool {
        compute_record_hash(self.sequence, &self.prev_hash, &self.event) == self.hash
    }

    /// Hex-encoded record hash.
    pub fn hash_hex(&self) -> String {
        hex::encode(self.hash)
    }

    /// Hex-encoded previous hash.
    pub fn prev_hash_hex(&self) -> String {
        hex::encode(self.prev_hash)
    }
}

fn compute_record_hash(sequence: u64, prev_hash: &[u8; 32], event: &VaultEvent) -> [u8; 32] {
    let mut hasher = blake3::Hasher::new();
    hasher.update(prev_hash);
    hasher.update(&sequence.to_le_bytes());
    hasher.update(&event.canonical_bytes());
    *hasher.finalize().as_bytes()
}

// ---------------------------------------------------------------------------
// Chain verification
// ---------------------------------------------------------------------------

/// Ways an event chain can be broken.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ChainError {
    /// Sequence numbers skip or repeat.
    #[error("sequence gap: expected {expected}, found {found}")]
    SequenceGap { expected: u64, found: u64 },

    /// A record's `prev_hash` does not match its predecessor's hash.
    #[error("broken link at sequence {0}")]
    BrokenLink(u64),

    /// A record's hash does not match its contents.
    #[error("hash mismatch at sequence {0}")]
    HashMismatch(u64),
}

/// Verifies a contiguous run of records starting at `records[0].sequence`.
///
/// `anchor` is the hash the first record must link to: the genesis hash
/// when verifying from sequence 0, or the hash of the record just before
/// the slice otherwise.
pub fn verify_chain(records: &[EventRecord], anchor: [u8; 32]) -> Result<(), ChainError> {
    let mut expected_prev = anchor;
    let mut expected_seq = match records.first() {
        Some(r) => r.sequence,
        None => return Ok(()),
    };

    for record in records {
        if record.sequence != expected_seq {
            return Err(ChainError::SequenceGap {
                expected: expected_seq,
                found: record.sequence,
            });
        }
        if record.prev_hash != expected_prev {
            return Err(ChainError::BrokenLink(record.sequence));
        }
        if !record.is_self_consistent() {
            return Err(ChainError::HashMismatch(record.sequence));
        }
        expected_prev = record.hash;
        expected_seq += 1;
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn deposited(id: DepositId, amount: Amount) -> VaultEvent {
        VaultEvent::Deposited {
            account: Address::repeat_byte(0xA1),
            deposit_id: id,
            amount,
            unlock_time: 2_000,
            timestamp: 1_000,
        }
    }

    fn build_chain(n: u64) -> Vec<EventRecord> {
        let mut out: Vec<EventRecord> = Vec::new();
        for i in 0..n {
            let rec = EventRecord::next(out.last(), deposited(i, 100 + i as u128));
            out.push(rec);
        }
        out
    }

    #[test]
    fn first_record_links_to_genesis() {
        let rec = EventRecord::next(None, deposited(0, 1));
        assert_eq!(rec.sequence, 0);
        assert_eq!(rec.prev_hash, GENESIS_PREV_HASH);
        assert!(rec.is_self_consistent());
    }

    #[test]
    fn valid_chain_verifies() {
        let chain = build_chain(5);
        assert_eq!(chain[4].sequence, 4);
        assert_eq!(chain[4].prev_hash, chain[3].hash);
        verify_chain(&chain, GENESIS_PREV_HASH).unwrap();
    }

    #[test]
    fn partial_chain_verifies_against_anchor() {
        let chain = build_chain(6);
        verify_chain(&chain[3..], chain[2].hash).unwrap();
        assert!(verify_chain(&chain[3..], GENESIS_PREV_HASH).is_err());
    }

    #[test]
    fn tampered_amount_is_detected() {
        let mut chain = build_chain(4);
        chain[2].event = deposited(2, 9_999_999);
        assert_eq!(
            verify_chain(&chain, GENESIS_PREV_HASH),
            Err(ChainError::HashMismatch(2))
        );
    }

    #[test]
    fn rehashed_record_breaks_the_next_link() {
        let mut chain = build_chain(4);
        chain[1] = EventRecord::with_link(1, chain[0].hash, deposited(1, 42));
        assert_eq!(
            verify_chain(&chain, GENESIS_PREV_HASH),
            Err(ChainError::BrokenLink(2))
        );
    }

    #[test]
    fn dropped_record_is_a_gap() {
        let mut chain = build_chain(4);
        chain.remove(1);
        assert_eq!(
            verify_chain(&chain, GENESIS_PREV_HASH),
            Err(ChainError::SequenceGap {
                expected: 1,
                found: 2
            })
        );
    }

    #[test]
    fn canonical_bytes_differ_per_variant() {
        let a = VaultEvent::Withdrawn {
            account: Address::repeat_byte(1),
            deposit_id: 0,
            amount: 5,
            timestamp: 7,
        };
        let b = VaultEvent::ExternalCredit {
            amount: 5,
            timestamp: 7,
        };
        assert_ne!(a.canonical_bytes()[0], b.canonical_bytes()[0]);
    }

    #[test]
    fn json_shape_is_externally_tagged() {
        let ev = VaultEvent::OwnershipTransferred {
            previous_owner: Address::repeat_byte(1),
            new_owner: Address::repeat_byte(2),
        };
        let json = serde_json::to_value(&ev).unwrap();
        assert_eq!(
            json["ownership_transferred"]["new_owner"],
            "0x0202020202020202020202020202020202020202"
        );
    }

    #[test]
    fn record_survives_bincode() {
        let rec = EventRecord::next(None, deposited(0, u128::MAX));
        let bytes = bincode::serialize(&rec).unwrap();
        let back: EventRecord = bincode::deserialize(&bytes).unwrap();
        assert_eq!(back, rec);
        assert!(back.is_self_consistent());
    }
}

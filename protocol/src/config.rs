//! # Protocol Configuration & Constants
//!
//! Every magic number in the vault lives here, next to the one piece of
//! runtime policy the ledger accepts ([`VaultConfig`]).

use serde::{Deserialize, Serialize};

use crate::types::Timestamp;

// ---------------------------------------------------------------------------
// Version
// ---------------------------------------------------------------------------

/// Ledger format version. Bump when the on-disk layout changes.
pub const PROTOCOL_VERSION: &str = "0.1.0";

/// Version of the persisted tree layout, stored in the metadata tree on
/// first open so later binaries can refuse an incompatible directory.
pub const STORAGE_SCHEMA_VERSION: u32 = 1;

// ---------------------------------------------------------------------------
// Network Parameters
// ---------------------------------------------------------------------------

/// Default REST/WebSocket API port.
pub const DEFAULT_API_PORT: u16 = 9841;

/// Default Prometheus metrics port.
pub const DEFAULT_METRICS_PORT: u16 = 9842;

/// Broadcast channel capacity for live event streaming. Large enough to
/// absorb bursts without dropping events for connected WebSocket clients.
pub const EVENT_CHANNEL_CAPACITY: usize = 256;

// ---------------------------------------------------------------------------
// Query Limits
// ---------------------------------------------------------------------------

/// Default page size for event log queries.
pub const DEFAULT_EVENT_PAGE: usize = 100;

/// Hard ceiling on a single event log page.
pub const MAX_EVENT_PAGE: usize = 1_000;

// ---------------------------------------------------------------------------
// Runtime Policy
// ---------------------------------------------------------------------------

/// Runtime policy for a vault instance.
///
/// The default imposes no limits. A lock-duration cap is a policy decision
/// that operators opt into explicitly.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct VaultConfig {
    /// Longest accepted `lock_duration` in seconds. `None` = unbounded.
    pub max_lock_duration: Option<Timestamp>,
}

impl VaultConfig {
    /// Config with a lock-duration cap.
    pub fn with_max_lock_duration(max: Timestamp) -> Self {
        Self {
            max_lock_duration: Some(max),
        }
    }

    /// Whether `lock_duration` is within policy.
    pub fn allows_lock_duration(&self, lock_duration: Timestamp) -> bool {
        self.max_lock_duration
            .map_or(true, |max| lock_duration <= max)
    }
}

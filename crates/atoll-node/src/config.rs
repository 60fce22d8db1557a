//! Tunables of the peering and recovery core.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_with::{serde_as, DurationSeconds};

/// Per-node configuration of PG peering, recovery, and backfill.
#[serde_as]
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PgConfig {
    /// Maximum object pushes or pulls in flight per PG during recovery.
    pub max_recovery_ops_per_pg: usize,
    /// Objects enumerated per backfill scan round.
    pub backfill_scan_max: u32,
    /// Process-wide slots for PGs recovering locally.
    pub local_recovery_slots: usize,
    /// Process-wide slots for PGs backfilling locally (as source or target).
    pub local_backfill_slots: usize,
    /// Log entries retained beyond `last_complete` before tail trimming.
    pub log_keep_min: u64,
    /// Delay before a rejected backfill reservation is retried.
    #[serde_as(as = "DurationSeconds<u64>")]
    #[serde(rename = "backfill_retry_secs")]
    pub backfill_retry: Duration,
}

impl Default for PgConfig {
    fn default() -> Self {
        Self {
            max_recovery_ops_per_pg: defaults::max_recovery_ops_per_pg(),
            backfill_scan_max: defaults::backfill_scan_max(),
            local_recovery_slots: defaults::local_recovery_slots(),
            local_backfill_slots: defaults::local_backfill_slots(),
            log_keep_min: defaults::log_keep_min(),
            backfill_retry: defaults::backfill_retry(),
        }
    }
}

pub mod defaults {
    use std::time::Duration;

    pub fn max_recovery_ops_per_pg() -> usize {
        5
    }

    pub fn backfill_scan_max() -> u32 {
        512
    }

    pub fn local_recovery_slots() -> usize {
        1
    }

    pub fn local_backfill_slots() -> usize {
        1
    }

    pub fn log_keep_min() -> u64 {
        1000
    }

    pub fn backfill_retry() -> Duration {
        Duration::from_secs(30)
    }
}

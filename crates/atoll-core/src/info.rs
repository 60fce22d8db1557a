//! Persistent placement-group metadata: history, info, and past intervals.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::{Epoch, Eversion, NodeId, PgId};

/// Epoch milestones of a PG, exchanged during peering and merged pairwise.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PgHistory {
    /// Last epoch in which the PG started serving I/O.
    pub last_epoch_started: Epoch,
    /// Last epoch in which the PG was fully replicated.
    pub last_epoch_clean: Epoch,
    /// First epoch of the current (up, acting) interval.
    pub same_interval_since: Epoch,
    /// First epoch with the current up set.
    pub same_up_since: Epoch,
    /// First epoch with the current primary.
    pub same_primary_since: Epoch,
}

impl PgHistory {
    /// Takes the pairwise maximum of the milestone epochs. Returns true if
    /// anything changed.
    pub fn merge(&mut self, other: &PgHistory) -> bool {
        let mut changed = false;
        for (mine, theirs) in [
            (&mut self.last_epoch_started, other.last_epoch_started),
            (&mut self.last_epoch_clean, other.last_epoch_clean),
            (&mut self.same_interval_since, other.same_interval_since),
            (&mut self.same_up_since, other.same_up_since),
            (&mut self.same_primary_since, other.same_primary_since),
        ] {
            if theirs > *mine {
                *mine = theirs;
                changed = true;
            }
        }
        changed
    }
}

/// The persistent summary of one replica's view of a PG.
// INV: last_complete <= last_update; log_tail <= last_update.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PgInfo {
    pub pgid: PgId,
    /// Newest log version on this replica.
    pub last_update: Eversion,
    /// All objects up to this version are locally readable.
    pub last_complete: Eversion,
    /// Version one below the oldest log entry held.
    pub log_tail: Eversion,
    pub history: PgHistory,
    /// Set when this replica's log cannot serve as an authoritative source
    /// (it was backfilling when the interval ended).
    pub is_incomplete: bool,
}

impl PgInfo {
    pub fn new(pgid: PgId) -> Self {
        Self {
            pgid,
            ..Self::default()
        }
    }

    /// True iff this replica has never been written.
    pub fn is_empty(&self) -> bool {
        self.last_update.is_never()
    }

    /// Whether this info may be chosen as the authoritative history.
    pub fn is_usable(&self) -> bool {
        !self.is_incomplete
    }
}

impl fmt::Display for PgInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}({} lc {} lt {} les {}{})",
            self.pgid,
            self.last_update,
            self.last_complete,
            self.log_tail,
            self.history.last_epoch_started,
            if self.is_incomplete { " incomplete" } else { "" },
        )
    }
}

/// A maximal span of epochs during which the PG's up and acting sets did not
/// change.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PastInterval {
    pub first: Epoch,
    pub last: Epoch,
    pub up: Vec<NodeId>,
    pub acting: Vec<NodeId>,
    /// Whether the PG could have served writes in this interval: the acting
    /// set was non-empty and its primary was alive through the interval.
    pub maybe_went_rw: bool,
}

impl PastInterval {
    pub fn primary(&self) -> Option<NodeId> {
        self.acting.first().copied()
    }
}

impl fmt::Display for PastInterval {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "interval({}-{} up {:?} acting {:?}{})",
            self.first,
            self.last,
            self.up,
            self.acting,
            if self.maybe_went_rw { " maybe_went_rw" } else { "" },
        )
    }
}

/// Past intervals ordered by first epoch, trimmed below the last interval in
/// which the PG went read-write and completed peering.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PastIntervals {
    intervals: BTreeMap<Epoch, PastInterval>,
}

impl PastIntervals {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.intervals.is_empty()
    }

    pub fn len(&self) -> usize {
        self.intervals.len()
    }

    /// Records a completed interval.
    ///
    /// # Panics
    ///
    /// Panics if the interval overlaps an already-recorded one.
    pub fn add(&mut self, interval: PastInterval) {
        if let Some((_, prev)) = self.intervals.range(..=interval.first).next_back() {
            assert!(
                prev.last < interval.first,
                "interval {} overlaps recorded {}",
                interval,
                prev
            );
        }
        self.intervals.insert(interval.first, interval);
    }

    /// Intervals in epoch order, oldest first.
    pub fn iter(&self) -> impl DoubleEndedIterator<Item = &PastInterval> {
        self.intervals.values()
    }

    /// Drops intervals that ended before `epoch`; their history can no
    /// longer matter once the PG peered at or after it.
    pub fn trim_below(&mut self, epoch: Epoch) {
        self.intervals.retain(|_, interval| interval.last >= epoch);
    }

    pub fn newest(&self) -> Option<&PastInterval> {
        self.intervals.values().next_back()
    }
}

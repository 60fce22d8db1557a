//! The per-PG operation log and its in-memory indexes.
//!
//! The log is an ordered sequence of immutable entries bounded by `tail`
//! (exclusive) and `head` (inclusive). It is mutated only at the head
//! (append), at the tail (trim), and by head-rewind during divergent-log
//! merge. Two secondary indexes are maintained: the newest in-log entry per
//! object and per client request id.
//!
//! Entries are kept in an ordered map keyed by version; the indexes name
//! entries by version rather than by reference, so they cannot dangle.

use std::collections::{BTreeMap, HashMap};
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::{Eversion, ObjectId, ReqId};

/// What an entry did to its object.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EntryKind {
    /// The object was written (created or modified).
    Update,
    /// The object was deleted.
    Delete,
    /// The object was administratively marked lost; readers see it as gone.
    LostMark,
}

impl EntryKind {
    pub fn is_update(&self) -> bool {
        matches!(self, EntryKind::Update)
    }

    pub fn is_delete(&self) -> bool {
        matches!(self, EntryKind::Delete)
    }
}

impl fmt::Display for EntryKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EntryKind::Update => write!(f, "update"),
            EntryKind::Delete => write!(f, "delete"),
            EntryKind::LostMark => write!(f, "lost"),
        }
    }
}

/// One operation in the log. Immutable once appended.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogEntry {
    /// Version assigned to this operation; strictly increasing along the log.
    pub version: Eversion,
    /// The version this operation superseded, or [`Eversion::NEVER`] for a
    /// newly created object.
    pub prior_version: Eversion,
    /// Originating client request, or [`ReqId::NONE`] for internal entries.
    pub reqid: ReqId,
    /// The object this operation touched.
    pub oid: ObjectId,
    pub kind: EntryKind,
}

impl LogEntry {
    /// Whether this entry participates in the request-id index.
    pub fn reqid_is_indexed(&self) -> bool {
        self.reqid.is_indexed()
    }
}

impl fmt::Display for LogEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} ({}) {} {} by {}",
            self.version, self.prior_version, self.kind, self.oid, self.reqid
        )
    }
}

/// Object versions orphaned by a head-rewind whose prior version predates the
/// log tail, keyed by that prior version.
///
/// The true state of these objects cannot be derived from the log alone; the
/// next peering pass resolves them by probing peers.
pub type DivergentPriors = BTreeMap<Eversion, ObjectId>;

/// The serializable (wire and disk) form of a log: bounds plus entries in
/// version order.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogBundle {
    pub tail: Eversion,
    pub head: Eversion,
    pub entries: Vec<LogEntry>,
}

/// Entries discarded by [`IndexedLog::rewind`], along with the divergent
/// priors they produced.
#[derive(Debug, Default)]
pub struct Rewound {
    /// Discarded entries, newest first.
    pub removed: Vec<LogEntry>,
    /// `(prior_version, oid)` pairs whose prior predates the log tail.
    pub divergent_priors: Vec<(Eversion, ObjectId)>,
}

/// The in-memory log: ordered entries plus the by-object and by-request
/// indexes and the recovery cursors.
///
/// # Index invariants
///
/// After every public operation, `by_oid[o]` names the newest in-log entry
/// for `o` and `by_reqid[r]` names the newest in-log entry carrying `r`.
#[derive(Debug, Clone, Default)]
pub struct IndexedLog {
    /// Version one below the oldest entry, or [`Eversion::NEVER`].
    tail: Eversion,
    /// Version of the newest entry, or [`Eversion::NEVER`].
    head: Eversion,
    entries: BTreeMap<Eversion, LogEntry>,
    by_oid: HashMap<ObjectId, Eversion>,
    by_reqid: HashMap<ReqId, Eversion>,

    /// First version not yet known locally complete; `None` once recovery of
    /// the local copy has caught up with the head.
    pub complete_to: Option<Eversion>,
    /// Version of the newest object already requested by the primary during
    /// recovery.
    pub last_requested: Eversion,
}

impl IndexedLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Rebuilds a log from its serialized form, reconstructing the indexes.
    pub fn from_bundle(bundle: LogBundle) -> Self {
        let mut log = Self {
            tail: bundle.tail,
            head: bundle.head,
            ..Self::default()
        };
        for entry in bundle.entries {
            log.index_entry(&entry);
            log.entries.insert(entry.version, entry);
        }
        log
    }

    pub fn tail(&self) -> Eversion {
        self.tail
    }

    pub fn head(&self) -> Eversion {
        self.head
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Entries in version order.
    pub fn entries(&self) -> impl DoubleEndedIterator<Item = &LogEntry> {
        self.entries.values()
    }

    pub fn entry_at(&self, version: Eversion) -> Option<&LogEntry> {
        self.entries.get(&version)
    }

    /// The newest in-log entry for `oid`, if any.
    pub fn newest_for(&self, oid: &ObjectId) -> Option<&LogEntry> {
        let version = self.by_oid.get(oid)?;
        self.entries.get(version)
    }

    /// The version assigned to request `reqid`, if it is still in the log.
    ///
    /// Used for write-request idempotence: a replayed request whose id is
    /// still indexed has already been applied.
    pub fn lookup_by_reqid(&self, reqid: &ReqId) -> Option<Eversion> {
        self.by_reqid.get(reqid).copied()
    }

    pub fn is_updated(&self, oid: &ObjectId) -> bool {
        self.newest_for(oid)
            .map(|e| e.kind.is_update())
            .unwrap_or(false)
    }

    pub fn is_deleted(&self, oid: &ObjectId) -> bool {
        self.newest_for(oid)
            .map(|e| e.kind.is_delete())
            .unwrap_or(false)
    }

    /// Appends an entry at the head.
    ///
    /// # Panics
    ///
    /// Panics if `entry.version` is not strictly greater than the current
    /// head.
    pub fn append(&mut self, entry: LogEntry) {
        assert!(
            entry.version > self.head,
            "log append must be monotonic: {} after head {}",
            entry.version,
            self.head
        );
        self.head = entry.version;
        self.index_entry(&entry);
        self.entries.insert(entry.version, entry);
    }

    /// Removes entries with `version <= upto` from the tail and returns them
    /// in version order. Advances `tail` to `max(tail, upto)`.
    pub fn trim_tail(&mut self, upto: Eversion) -> Vec<LogEntry> {
        let keep = self.entries.split_off(&Eversion {
            epoch: upto.epoch,
            seq: upto.seq.wrapping_add(1),
        });
        let removed: Vec<LogEntry> =
            std::mem::replace(&mut self.entries, keep).into_values().collect();
        for entry in &removed {
            self.unindex_entry(entry);
        }
        if upto > self.tail {
            self.tail = upto;
        }
        if self.head < self.tail {
            self.head = self.tail;
        }
        removed
    }

    /// Discards entries with `version > new_head` and re-points the indexes
    /// at the newest surviving entry for each affected key.
    ///
    /// Discarded entries whose `prior_version` predates the log tail are
    /// reported as divergent priors; the caller records them in the side map
    /// for the next peering pass.
    ///
    /// # Panics
    ///
    /// Panics if `new_head < tail`; a rewind below the tail means the local
    /// log has no overlap left and the caller must backfill instead.
    pub fn rewind(&mut self, new_head: Eversion) -> Rewound {
        assert!(
            new_head >= self.tail,
            "rewind target {} below log tail {}",
            new_head,
            self.tail
        );
        let mut out = Rewound::default();
        if new_head >= self.head {
            return out;
        }

        let divergent = self.entries.split_off(&Eversion {
            epoch: new_head.epoch,
            seq: new_head.seq.wrapping_add(1),
        });
        self.head = new_head;

        // Newest first, so the index repair below sees each key at most once
        // in its most constraining position.
        for (_, entry) in divergent.into_iter().rev() {
            self.reindex_after_removal(&entry);
            if !entry.prior_version.is_never() && entry.prior_version <= self.tail {
                out.divergent_priors
                    .push((entry.prior_version, entry.oid.clone()));
            }
            out.removed.push(entry);
        }
        out
    }

    /// Adopts a full peer log wholesale, discarding local entries and
    /// resetting the recovery cursors.
    pub fn claim(&mut self, bundle: LogBundle) {
        *self = Self::from_bundle(bundle);
    }

    /// The serializable form of the whole log.
    pub fn bundle(&self) -> LogBundle {
        LogBundle {
            tail: self.tail,
            head: self.head,
            entries: self.entries.values().cloned().collect(),
        }
    }

    /// The serializable form of the log suffix strictly after `since`.
    pub fn bundle_since(&self, since: Eversion) -> LogBundle {
        LogBundle {
            tail: since,
            head: self.head,
            entries: self
                .entries
                .range(
                    Eversion {
                        epoch: since.epoch,
                        seq: since.seq.wrapping_add(1),
                    }..,
                )
                .map(|(_, e)| e.clone())
                .collect(),
        }
    }

    /// Moves the entries belonging to a child PG into `child`.
    ///
    /// An entry belongs to the child iff the low `split_bits` bits of its
    /// object's placement hash equal `child_sel`. Both logs keep the original
    /// bounds; indexes are rebuilt on both sides.
    pub fn split_into(&mut self, split_bits: u32, child_sel: u64, child: &mut IndexedLog) {
        let mask = (1u64 << split_bits) - 1;
        let mut kept = BTreeMap::new();
        child.entries.clear();
        for (version, entry) in std::mem::take(&mut self.entries) {
            if placement_hash(&entry.oid) & mask == child_sel {
                child.entries.insert(version, entry);
            } else {
                kept.insert(version, entry);
            }
        }
        self.entries = kept;
        child.tail = self.tail;
        child.head = self.head;
        self.reindex();
        child.reindex();
        self.reset_recovery_pointers();
        child.reset_recovery_pointers();
    }

    /// Clears the recovery cursors; called whenever the log is rebuilt.
    pub fn reset_recovery_pointers(&mut self) {
        self.complete_to = None;
        self.last_requested = Eversion::NEVER;
    }

    /// Entry versions strictly after `version`, oldest first.
    pub fn entries_after(&self, version: Eversion) -> impl Iterator<Item = &LogEntry> {
        self.entries
            .range(
                Eversion {
                    epoch: version.epoch,
                    seq: version.seq.wrapping_add(1),
                }..,
            )
            .map(|(_, e)| e)
    }

    fn index_entry(&mut self, entry: &LogEntry) {
        match self.by_oid.get(&entry.oid) {
            Some(existing) if *existing >= entry.version => {}
            _ => {
                self.by_oid.insert(entry.oid.clone(), entry.version);
            }
        }
        if entry.reqid_is_indexed() {
            match self.by_reqid.get(&entry.reqid) {
                Some(existing) if *existing >= entry.version => {}
                _ => {
                    self.by_reqid.insert(entry.reqid, entry.version);
                }
            }
        }
    }

    /// Drops index slots that still name `entry`. A later entry may have
    /// superseded the slot, in which case it is left alone.
    fn unindex_entry(&mut self, entry: &LogEntry) {
        if self.by_oid.get(&entry.oid) == Some(&entry.version) {
            self.by_oid.remove(&entry.oid);
        }
        if entry.reqid_is_indexed() && self.by_reqid.get(&entry.reqid) == Some(&entry.version) {
            self.by_reqid.remove(&entry.reqid);
        }
    }

    /// After removing an entry from the head, re-point its index slots at the
    /// newest surviving entry for the same keys, or clear them.
    fn reindex_after_removal(&mut self, entry: &LogEntry) {
        if self.by_oid.get(&entry.oid) == Some(&entry.version) {
            match self.entries.values().rev().find(|e| e.oid == entry.oid) {
                Some(survivor) => {
                    let version = survivor.version;
                    self.by_oid.insert(entry.oid.clone(), version);
                }
                None => {
                    self.by_oid.remove(&entry.oid);
                }
            }
        }
        if entry.reqid_is_indexed() && self.by_reqid.get(&entry.reqid) == Some(&entry.version) {
            match self
                .entries
                .values()
                .rev()
                .find(|e| e.reqid_is_indexed() && e.reqid == entry.reqid)
            {
                Some(survivor) => {
                    let version = survivor.version;
                    self.by_reqid.insert(entry.reqid, version);
                }
                None => {
                    self.by_reqid.remove(&entry.reqid);
                }
            }
        }
    }

    fn reindex(&mut self) {
        self.by_oid.clear();
        self.by_reqid.clear();
        let entries = std::mem::take(&mut self.entries);
        for entry in entries.values() {
            self.index_entry(entry);
        }
        self.entries = entries;
    }

    /// Checks the index invariants; used by the property tests.
    #[cfg(any(test, feature = "test-utils"))]
    pub fn index_consistent(&self) -> bool {
        for (oid, version) in &self.by_oid {
            let newest = self.entries.values().rev().find(|e| e.oid == *oid);
            if newest.map(|e| e.version) != Some(*version) {
                return false;
            }
        }
        for (reqid, version) in &self.by_reqid {
            let newest = self
                .entries
                .values()
                .rev()
                .find(|e| e.reqid_is_indexed() && e.reqid == *reqid);
            if newest.map(|e| e.version) != Some(*version) {
                return false;
            }
        }
        // Every in-log key must be indexed.
        for entry in self.entries.values() {
            if !self.by_oid.contains_key(&entry.oid) {
                return false;
            }
            if entry.reqid_is_indexed() && !self.by_reqid.contains_key(&entry.reqid) {
                return false;
            }
        }
        true
    }
}

/// Stable placement hash deciding which PG owns an object.
///
/// When a PG splits, an object (and with it its log entries, missing-set
/// entry, and stored copy) belongs to the child whose id matches the low
/// `split_bits` bits of this hash.
pub fn placement_hash(oid: &ObjectId) -> u64 {
    // FNV-1a over the name bytes. Must stay stable across releases since it
    // decides which child PG owns an object.
    let mut hash: u64 = 0xcbf2_9ce4_8422_2325;
    for byte in oid.name().as_bytes() {
        hash ^= u64::from(*byte);
        hash = hash.wrapping_mul(0x0000_0100_0000_01b3);
    }
    hash
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use super::*;
    use crate::test_utils::{entry, entry_req};

    #[test]
    fn append_indexes_newest_entry() {
        let mut log = IndexedLog::new();
        log.append(entry(1, 1, "a", EntryKind::Update));
        log.append(entry(1, 2, "b", EntryKind::Update));
        log.append(entry(1, 3, "a", EntryKind::Update));

        assert_eq!(log.head(), Eversion::new(1, 3));
        assert_eq!(
            log.newest_for(&ObjectId::new("a")).map(|e| e.version),
            Some(Eversion::new(1, 3))
        );
        assert!(log.index_consistent());
    }

    #[test]
    #[should_panic(expected = "monotonic")]
    fn append_rejects_stale_version() {
        let mut log = IndexedLog::new();
        log.append(entry(2, 5, "a", EntryKind::Update));
        log.append(entry(2, 5, "b", EntryKind::Update));
    }

    #[test]
    fn trim_keeps_superseded_index_slots() {
        let mut log = IndexedLog::new();
        log.append(entry_req(1, 1, "a", ReqId::new(9, 1), EntryKind::Update));
        log.append(entry_req(1, 2, "a", ReqId::new(9, 2), EntryKind::Update));

        let removed = log.trim_tail(Eversion::new(1, 1));
        assert_eq!(removed.len(), 1);
        assert_eq!(log.tail(), Eversion::new(1, 1));
        // The newer entry for "a" still owns the index slot.
        assert_eq!(
            log.newest_for(&ObjectId::new("a")).map(|e| e.version),
            Some(Eversion::new(1, 2))
        );
        assert_eq!(log.lookup_by_reqid(&ReqId::new(9, 1)), None);
        assert!(log.index_consistent());
    }

    #[test]
    fn rewind_repoints_index_at_survivor() {
        let mut log = IndexedLog::new();
        log.append(entry(1, 1, "a", EntryKind::Update));
        log.append(entry(1, 2, "a", EntryKind::Update));
        log.append(entry(1, 3, "a", EntryKind::Update));

        let rewound = log.rewind(Eversion::new(1, 1));
        assert_eq!(rewound.removed.len(), 2);
        assert_eq!(log.head(), Eversion::new(1, 1));
        assert_eq!(
            log.newest_for(&ObjectId::new("a")).map(|e| e.version),
            Some(Eversion::new(1, 1))
        );
        assert!(log.index_consistent());
    }

    #[test]
    fn rewind_reports_divergent_priors_below_tail() {
        let mut log = IndexedLog::new();
        log.append(entry(1, 5, "a", EntryKind::Update));
        log.append(entry(1, 6, "b", EntryKind::Update));
        log.trim_tail(Eversion::new(1, 5));

        // b@(1,6) supersedes a version below the tail.
        let mut divergent = entry(1, 7, "b", EntryKind::Update);
        divergent.prior_version = Eversion::new(1, 3);
        // Re-adding b at (1,7) then rewinding past it orphans prior (1,3).
        let mut log2 = IndexedLog::from_bundle(log.bundle());
        log2.append(divergent);
        let rewound = log2.rewind(Eversion::new(1, 6));
        assert_eq!(
            rewound.divergent_priors,
            vec![(Eversion::new(1, 3), ObjectId::new("b"))]
        );
        assert!(log2.index_consistent());
    }

    #[test]
    fn bundle_since_returns_strict_suffix() {
        let mut log = IndexedLog::new();
        for seq in 1..=5 {
            log.append(entry(2, seq, &format!("o{seq}"), EntryKind::Update));
        }
        let suffix = log.bundle_since(Eversion::new(2, 3));
        assert_eq!(suffix.tail, Eversion::new(2, 3));
        assert_eq!(suffix.entries.len(), 2);
        assert_eq!(suffix.entries[0].version, Eversion::new(2, 4));
    }

    #[test]
    fn split_partitions_entries_and_reindexes() {
        let mut log = IndexedLog::new();
        for seq in 1..=32 {
            log.append(entry(3, seq, &format!("obj-{seq}"), EntryKind::Update));
        }
        let mut child = IndexedLog::new();
        let before = log.len();
        log.split_into(1, 1, &mut child);
        assert_eq!(log.len() + child.len(), before);
        assert!(log.index_consistent());
        assert!(child.index_consistent());
        // Both halves retain the parent bounds.
        assert_eq!(log.tail(), child.tail());
        assert_eq!(log.head(), child.head());
    }

    /// Drives a random sequence of appends, trims, and rewinds, asserting
    /// the index invariants after every step.
    fn arb_op() -> impl Strategy<Value = (u8, u64, u8)> {
        (0u8..3, 0u64..40, 0u8..6)
    }

    proptest! {
        #[test]
        fn index_invariant_holds_under_random_ops(ops in prop::collection::vec(arb_op(), 1..60)) {
            let mut log = IndexedLog::new();
            let mut seq = 0u64;
            for (op, pick, oid_sel) in ops {
                match op {
                    0 => {
                        seq += 1;
                        let reqid = if seq % 3 == 0 { ReqId::NONE } else { ReqId::new(1, seq) };
                        let kind = if seq % 5 == 0 { EntryKind::Delete } else { EntryKind::Update };
                        log.append(entry_req(7, seq, &format!("o{oid_sel}"), reqid, kind));
                    }
                    1 => {
                        log.trim_tail(Eversion::new(7, pick.min(seq)));
                    }
                    _ => {
                        let target = Eversion::new(7, pick.min(seq)).max(log.tail());
                        log.rewind(target);
                        if log.head() < Eversion::new(7, seq) {
                            seq = log.head().seq;
                        }
                    }
                }
                prop_assert!(log.index_consistent());
                prop_assert!(log.tail() <= log.head());
            }
        }
    }
}

//! Accounting of objects a replica knows to be out of date, and of the peers
//! that may hold acceptable copies.

use std::collections::{BTreeMap, HashMap, HashSet};

use serde::{Deserialize, Serialize};

use crate::log::{EntryKind, LogEntry};
use crate::{Eversion, NodeId, ObjectId};

/// What a replica needs for one missing object.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MissingItem {
    /// Version the replica must reach.
    pub need: Eversion,
    /// Version of the local copy, or [`Eversion::NEVER`] if absent.
    pub have: Eversion,
}

/// The per-replica missing set.
///
/// `rmissing` orders missing objects by need-version; recovery pulls in that
/// order so `last_complete` can advance as objects arrive.
// INV: for every o in missing, the local copy is absent or at
// have < need; rmissing holds exactly the need versions of missing.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MissingSet {
    missing: HashMap<ObjectId, MissingItem>,
    rmissing: BTreeMap<Eversion, ObjectId>,
}

impl MissingSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn num_missing(&self) -> usize {
        self.missing.len()
    }

    pub fn is_empty(&self) -> bool {
        self.missing.is_empty()
    }

    pub fn is_missing(&self, oid: &ObjectId) -> bool {
        self.missing.contains_key(oid)
    }

    /// True iff `oid` is missing and the local copy is older than `need`
    /// but present (a partial recovery candidate).
    pub fn have_old(&self, oid: &ObjectId) -> Option<Eversion> {
        self.missing
            .get(oid)
            .filter(|item| !item.have.is_never())
            .map(|item| item.have)
    }

    pub fn item(&self, oid: &ObjectId) -> Option<&MissingItem> {
        self.missing.get(oid)
    }

    /// Missing objects ordered by need-version, oldest need first.
    pub fn in_need_order(&self) -> impl Iterator<Item = (&Eversion, &ObjectId)> {
        self.rmissing.iter()
    }

    /// Folds the next log entry into the missing set.
    ///
    /// Updates and lost-marks raise `need` to the entry's version, keeping
    /// the previous `need` as `have` for an already-missing object and the
    /// entry's `prior_version` otherwise. Deletes drop the object: a removal
    /// needs no recovery.
    pub fn add_next_event(&mut self, entry: &LogEntry) {
        match entry.kind {
            EntryKind::Update | EntryKind::LostMark => {
                if entry.prior_version.is_never() {
                    // New object; nothing older can be had.
                    self.insert(entry.oid.clone(), entry.version, Eversion::NEVER);
                } else if let Some(item) = self.missing.get(&entry.oid) {
                    let have = item.have;
                    self.remove(&entry.oid);
                    self.insert(entry.oid.clone(), entry.version, have);
                } else {
                    self.insert(entry.oid.clone(), entry.version, entry.prior_version);
                }
            }
            EntryKind::Delete => {
                self.rm(&entry.oid, entry.version);
            }
        }
    }

    /// Records that `oid` is missing with the given need/have versions.
    pub fn add(&mut self, oid: ObjectId, need: Eversion, have: Eversion) {
        if self.missing.contains_key(&oid) {
            self.remove(&oid);
        }
        self.insert(oid, need, have);
    }

    /// Lowers or raises the need version for an already-missing object.
    pub fn revise_need(&mut self, oid: &ObjectId, need: Eversion) {
        if let Some(item) = self.missing.get(oid) {
            let have = item.have;
            let oid = oid.clone();
            self.remove(&oid);
            self.insert(oid, need, have);
        }
    }

    /// Records receipt of `oid` at version `have`; the object leaves the
    /// missing set once `have` reaches `need`.
    pub fn got(&mut self, oid: &ObjectId, have: Eversion) {
        let Some(item) = self.missing.get_mut(oid) else {
            return;
        };
        if have >= item.need {
            let need = item.need;
            self.rmissing.remove(&need);
            self.missing.remove(oid);
        } else {
            item.have = have;
        }
    }

    /// Drops `oid` if a removal at `at` supersedes its need.
    pub fn rm(&mut self, oid: &ObjectId, at: Eversion) {
        if let Some(item) = self.missing.get(oid) {
            if item.need <= at {
                let need = item.need;
                self.rmissing.remove(&need);
                self.missing.remove(oid);
            }
        }
    }

    fn insert(&mut self, oid: ObjectId, need: Eversion, have: Eversion) {
        self.rmissing.insert(need, oid.clone());
        self.missing.insert(oid, MissingItem { need, have });
    }

    fn remove(&mut self, oid: &ObjectId) {
        if let Some(item) = self.missing.remove(oid) {
            self.rmissing.remove(&item.need);
        }
    }
}

/// Location index for missing objects: which peers may hold an acceptable
/// copy of each, and the set of peers currently usable as sources.
///
/// An object is **unfound** when it is missing and no usable peer holds a
/// copy. The unfound count is cached and recomputed only on structural
/// changes (a source added or removed), not per operation.
#[derive(Debug, Clone, Default)]
pub struct MissingLoc {
    locations: HashMap<ObjectId, HashSet<NodeId>>,
    sources: HashSet<NodeId>,
    num_unfound: usize,
}

impl MissingLoc {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn sources(&self) -> &HashSet<NodeId> {
        &self.sources
    }

    /// Registers `peer` as a usable source of missing objects.
    pub fn add_source(&mut self, peer: NodeId) {
        self.sources.insert(peer);
    }

    /// Records that `peer` holds an acceptable copy of `oid`.
    pub fn add_location(&mut self, oid: ObjectId, peer: NodeId) {
        self.locations.entry(oid).or_default().insert(peer);
    }

    pub fn locations_of(&self, oid: &ObjectId) -> Option<&HashSet<NodeId>> {
        self.locations.get(oid).filter(|set| !set.is_empty())
    }

    /// Picks any location for `oid` among usable sources.
    pub fn any_source_of(&self, oid: &ObjectId) -> Option<NodeId> {
        self.locations
            .get(oid)?
            .iter()
            .find(|peer| self.sources.contains(peer))
            .copied()
    }

    /// Removes a peer as a source and from every location set. Structural:
    /// the caller must recompute the unfound count afterwards.
    pub fn remove_source(&mut self, peer: NodeId) {
        self.sources.remove(&peer);
        for locs in self.locations.values_mut() {
            locs.remove(&peer);
        }
    }

    pub fn is_unfound(&self, missing: &MissingSet, oid: &ObjectId) -> bool {
        missing.is_missing(oid) && self.locations_of(oid).is_none()
    }

    /// Recomputes the cached unfound count against the missing set.
    pub fn recompute_unfound(&mut self, missing: &MissingSet) {
        self.num_unfound = missing
            .in_need_order()
            .filter(|(_, oid)| self.locations_of(oid).is_none())
            .count();
    }

    /// Number of missing objects with no known acceptable copy anywhere.
    pub fn num_unfound(&self) -> usize {
        self.num_unfound
    }

    /// Clears locations and sources; used on peering reset.
    pub fn clear(&mut self) {
        self.locations.clear();
        self.sources.clear();
        self.num_unfound = 0;
    }
}

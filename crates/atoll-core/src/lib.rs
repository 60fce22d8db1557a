//! Core data model for the atoll placement-group peering and recovery core.
//!
//! This crate holds the pure, I/O-free pieces shared by storage nodes: the
//! identifier and version types, the indexed operation log, the missing-set
//! accounting, placement-group info and past intervals, the typed peer
//! messages, and the versioned on-disk record envelope.

use std::fmt;

use serde::{Deserialize, Serialize};

pub mod backfill;
pub mod info;
pub mod log;
pub mod messages;
pub mod missing;
pub mod records;

#[cfg(any(test, feature = "test-utils"))]
pub mod test_utils;

/// The epoch of a cluster map.
pub type Epoch = u64;

/// Identifier of a storage node in the cluster.
pub type NodeId = u32;

/// Identifier of a placement group.
#[derive(
    Debug, Default, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct PgId(pub u64);

impl fmt::Display for PgId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "pg{}", self.0)
    }
}

/// A log version: the epoch of the primary that assigned it and a sequence
/// number monotonic within that epoch.
///
/// Versions are totally ordered lexicographically. [`Eversion::NEVER`]
/// denotes "never written".
#[derive(
    Debug, Default, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct Eversion {
    pub epoch: Epoch,
    pub seq: u64,
}

impl Eversion {
    /// The version of an object that has never been written.
    pub const NEVER: Eversion = Eversion { epoch: 0, seq: 0 };

    pub fn new(epoch: Epoch, seq: u64) -> Self {
        Self { epoch, seq }
    }

    /// Returns true iff this is the "never written" sentinel.
    pub fn is_never(&self) -> bool {
        *self == Self::NEVER
    }
}

impl fmt::Display for Eversion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}'{}", self.epoch, self.seq)
    }
}

/// An ordered, opaque object name.
///
/// [`ObjectId::MAX`] sorts strictly after every real object and is used as
/// the exclusive upper bound of half-open ranges (e.g. backfill intervals).
// INV: the `max` flag participates in `Ord` before the name, so MAX compares
// greater than any named object.
#[derive(
    Debug, Default, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct ObjectId {
    max: bool,
    name: String,
}

impl ObjectId {
    /// The sentinel sorting after every real object id.
    pub const MAX: ObjectId = ObjectId {
        max: true,
        name: String::new(),
    };

    pub fn new(name: impl Into<String>) -> Self {
        Self {
            max: false,
            name: name.into(),
        }
    }

    /// Returns true iff this is the [`ObjectId::MAX`] sentinel.
    pub fn is_max(&self) -> bool {
        self.max
    }

    /// The object name. Empty for the sentinel.
    pub fn name(&self) -> &str {
        &self.name
    }
}

impl fmt::Display for ObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.max {
            write!(f, "MAX")
        } else {
            write!(f, "{}", self.name)
        }
    }
}

impl From<&str> for ObjectId {
    fn from(name: &str) -> Self {
        ObjectId::new(name)
    }
}

/// Identifier of a client write request, used for idempotence.
///
/// [`ReqId::NONE`] marks internal log entries that are never indexed by
/// request id.
#[derive(
    Debug, Default, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct ReqId {
    pub client: u64,
    pub tid: u64,
}

impl ReqId {
    /// The unindexed request id carried by internal entries.
    pub const NONE: ReqId = ReqId { client: 0, tid: 0 };

    pub fn new(client: u64, tid: u64) -> Self {
        Self { client, tid }
    }

    /// Returns true iff entries with this request id are indexed for
    /// idempotence lookups.
    pub fn is_indexed(&self) -> bool {
        *self != Self::NONE
    }
}

impl fmt::Display for ReqId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.client, self.tid)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn eversion_orders_lexicographically() {
        assert!(Eversion::new(4, 900) < Eversion::new(5, 1));
        assert!(Eversion::new(5, 1) < Eversion::new(5, 2));
        assert!(Eversion::NEVER < Eversion::new(1, 0));
        assert!(Eversion::NEVER.is_never());
    }

    #[test]
    fn object_id_max_sorts_last() {
        let a = ObjectId::new("a");
        let zzz = ObjectId::new("zzzzzzzz");
        assert!(a < zzz);
        assert!(zzz < ObjectId::MAX);
        assert!(ObjectId::MAX.is_max());
        assert!(!zzz.is_max());
    }

    #[test]
    fn reqid_none_is_not_indexed() {
        assert!(!ReqId::NONE.is_indexed());
        assert!(ReqId::new(3, 7).is_indexed());
    }
}

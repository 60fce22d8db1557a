//! The half-open object range exchanged between backfill peers.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::{Eversion, ObjectId};

/// A scanned slice `[begin, end)` of a PG's object space, carrying the
/// version of every object found inside it.
///
/// The interval is *empty* when both bounds are the default object id,
/// *bounded* when `end` is a real object, and *extends to the end* of the
/// namespace when `end` is [`ObjectId::MAX`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackfillInterval {
    pub begin: ObjectId,
    pub end: ObjectId,
    pub objects: BTreeMap<ObjectId, Eversion>,
}

impl BackfillInterval {
    pub fn clear(&mut self) {
        *self = Self::default();
    }

    pub fn is_empty(&self) -> bool {
        self.begin == ObjectId::default() && self.end == ObjectId::default()
    }

    /// True once the scan has reached the end of the object namespace.
    pub fn extends_to_end(&self) -> bool {
        self.end == ObjectId::MAX
    }

    /// Drops objects below `keep_from` and advances `begin` accordingly.
    pub fn trim_to(&mut self, keep_from: &ObjectId) {
        self.objects = self.objects.split_off(keep_from);
        self.begin = keep_from.clone();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn interval_states() {
        let mut interval = BackfillInterval::default();
        assert!(interval.is_empty());

        interval.begin = ObjectId::new("a");
        interval.end = ObjectId::new("m");
        assert!(!interval.is_empty());
        assert!(!interval.extends_to_end());

        interval.end = ObjectId::MAX;
        assert!(interval.extends_to_end());
    }

    #[test]
    fn trim_drops_consumed_prefix() {
        let mut interval = BackfillInterval {
            begin: ObjectId::new("a"),
            end: ObjectId::MAX,
            objects: [
                (ObjectId::new("a"), Eversion::new(1, 1)),
                (ObjectId::new("b"), Eversion::new(1, 2)),
                (ObjectId::new("c"), Eversion::new(1, 3)),
            ]
            .into(),
        };
        interval.trim_to(&ObjectId::new("b"));
        assert_eq!(interval.begin, ObjectId::new("b"));
        assert_eq!(interval.objects.len(), 2);
    }
}

//! The set of peers that must be consulted before peering can complete.
//!
//! Built as a pure function of the cluster map, the PG's past intervals, its
//! current membership, and its info. Any interval that may have served
//! writes contributes its acting members: one of them could hold operations
//! nobody else saw.

use std::collections::{BTreeMap, BTreeSet};

use atoll_core::info::{PastIntervals, PgInfo};
use atoll_core::{Epoch, NodeId};

use crate::cluster_map::ClusterMap;

/// Peers to probe before peering, and why peering may be stuck.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PriorSet {
    /// Current and prior peers that must be queried.
    pub probe: BTreeSet<NodeId>,
    /// Down peers that would normally be probed and might matter.
    pub down: BTreeSet<NodeId>,
    /// Down peers whose (re)marking as lost would change this set, with the
    /// lost-at epoch observed when the set was built.
    pub blocked_by: BTreeMap<NodeId, Epoch>,
    /// True iff some interval's writes may survive only on down peers that
    /// are not marked lost; the PG must stall and be reported down.
    pub pg_down: bool,
}

impl PriorSet {
    /// Builds the prior set. Pure: identical inputs yield identical sets.
    pub fn build(
        map: &ClusterMap,
        past_intervals: &PastIntervals,
        up: &[NodeId],
        acting: &[NodeId],
        info: &PgInfo,
    ) -> Self {
        let mut prior = PriorSet::default();

        for &node in up.iter().chain(acting) {
            if map.is_up(node) {
                prior.probe.insert(node);
            }
        }

        for interval in past_intervals.iter().rev() {
            // Intervals that ended before the PG last started are already
            // reflected in every surviving replica.
            if interval.last < info.history.last_epoch_started {
                break;
            }
            if !interval.maybe_went_rw || interval.acting.is_empty() {
                continue;
            }

            let mut any_up_or_forfeited = false;
            for &node in &interval.acting {
                if !map.exists(node) {
                    // Removed from the cluster entirely; its data went with it.
                    continue;
                }
                if map.is_up(node) {
                    prior.probe.insert(node);
                    any_up_or_forfeited = true;
                } else if map.lost_at(node) > interval.first {
                    // Marked lost after the interval began: whatever it held
                    // is forfeited, so it cannot block peering.
                    any_up_or_forfeited = true;
                } else {
                    prior.down.insert(node);
                }
            }

            if !any_up_or_forfeited {
                // Every holder of this interval's possible writes is down
                // and unforfeited. Record what would unblock us.
                prior.pg_down = true;
                for &node in &interval.acting {
                    if map.exists(node) && !map.is_up(node) {
                        prior.blocked_by.insert(node, map.lost_at(node));
                    }
                }
            }
        }

        tracing::debug!(
            probe = ?prior.probe,
            down = ?prior.down,
            blocked_by = ?prior.blocked_by,
            pg_down = prior.pg_down,
            "built prior set",
        );
        prior
    }

    /// Whether `newmap` changes anything this set was derived from; if so it
    /// must be rebuilt (and peering restarted).
    pub fn affected_by_map(&self, newmap: &ClusterMap) -> bool {
        for &node in &self.probe {
            // Probe members were up at build time.
            if !newmap.is_up(node) {
                return true;
            }
        }
        for &node in &self.down {
            if newmap.is_up(node) || !newmap.exists(node) {
                return true;
            }
        }
        for (&node, &lost_at) in &self.blocked_by {
            if newmap.lost_at(node) != lost_at || !newmap.exists(node) {
                return true;
            }
        }
        false
    }
}

#[cfg(test)]
mod tests {
    use atoll_core::info::PastInterval;
    use atoll_core::PgId;

    use super::*;

    fn rw_interval(first: Epoch, last: Epoch, acting: Vec<NodeId>) -> PastInterval {
        PastInterval {
            first,
            last,
            up: acting.clone(),
            acting,
            maybe_went_rw: true,
        }
    }

    fn info_started_at(epoch: Epoch) -> PgInfo {
        let mut info = PgInfo::new(PgId(1));
        info.history.last_epoch_started = epoch;
        info
    }

    #[test]
    fn probes_current_acting_and_prior_interval_members() {
        let map = ClusterMap::builder(10)
            .node_up(1)
            .node_up(2)
            .node_up(3)
            .build();
        let mut past = PastIntervals::new();
        past.add(rw_interval(5, 9, vec![3, 1]));

        let prior = PriorSet::build(&map, &past, &[1, 2], &[1, 2], &info_started_at(5));
        assert_eq!(prior.probe, [1, 2, 3].into());
        assert!(!prior.pg_down);
        assert!(prior.down.is_empty());
    }

    #[test]
    fn down_sole_writer_blocks_peering() {
        // Node 3 alone may have taken writes in (5..9) and is now down.
        let map = ClusterMap::builder(10)
            .node_up(1)
            .node_up(2)
            .node_down(3)
            .build();
        let mut past = PastIntervals::new();
        past.add(rw_interval(5, 9, vec![3]));

        let prior = PriorSet::build(&map, &past, &[1, 2], &[1, 2], &info_started_at(4));
        assert!(prior.pg_down);
        assert_eq!(prior.down, [3].into());
        assert_eq!(prior.blocked_by.get(&3), Some(&0));
    }

    #[test]
    fn lost_marking_unblocks() {
        // Same as above, but 3 was marked lost after the interval started.
        let map = ClusterMap::builder(10)
            .node_up(1)
            .node_up(2)
            .node_lost(3, 7)
            .build();
        let mut past = PastIntervals::new();
        past.add(rw_interval(5, 9, vec![3]));

        let prior = PriorSet::build(&map, &past, &[1, 2], &[1, 2], &info_started_at(4));
        assert!(!prior.pg_down);
        assert!(prior.blocked_by.is_empty());
    }

    #[test]
    fn construction_is_pure() {
        let map = ClusterMap::builder(10)
            .node_up(1)
            .node_down(2)
            .node_up(3)
            .build();
        let mut past = PastIntervals::new();
        past.add(rw_interval(2, 4, vec![2, 3]));
        past.add(rw_interval(5, 9, vec![3, 1]));
        let info = info_started_at(2);

        let first = PriorSet::build(&map, &past, &[1, 3], &[1, 3], &info);
        let second = PriorSet::build(&map, &past, &[1, 3], &[1, 3], &info);
        assert_eq!(first, second);
    }

    #[test]
    fn affected_by_probe_member_going_down() {
        let map = ClusterMap::builder(10).node_up(1).node_up(2).build();
        let prior = PriorSet::build(
            &map,
            &PastIntervals::new(),
            &[1, 2],
            &[1, 2],
            &info_started_at(1),
        );

        let same = ClusterMap::builder(11).node_up(1).node_up(2).build();
        assert!(!prior.affected_by_map(&same));

        let node2_down = ClusterMap::builder(12).node_up(1).node_down(2).build();
        assert!(prior.affected_by_map(&node2_down));
    }
}

//! Immutable, epoch-versioned cluster-map snapshots and the contract of the
//! service that distributes them.
//!
//! Snapshots are shared as `Arc<ClusterMap>` by any number of PGs; contents
//! are frozen at publish time. The map-distribution service itself (election,
//! propagation) is an external collaborator.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use atoll_core::{Epoch, NodeId, PgId};
use serde::{Deserialize, Serialize};

/// What the cluster currently believes about one storage node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeRecord {
    /// The node is currently reachable.
    pub up: bool,
    /// The node is still part of the cluster. A node that does not exist has
    /// forfeited its data.
    pub exists: bool,
    /// Epoch at which the node was last administratively marked lost, or 0.
    pub lost_at: Epoch,
    /// First epoch of the node's current up span.
    pub up_from: Epoch,
    /// Last epoch through which the node is known to have been serving;
    /// bumped on request so peers can prove liveness of past intervals.
    pub up_thru: Epoch,
}

impl Default for NodeRecord {
    fn default() -> Self {
        Self {
            up: false,
            exists: true,
            lost_at: 0,
            up_from: 0,
            up_thru: 0,
        }
    }
}

/// The up and acting sets assigned to one PG by this map.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PgMapping {
    pub up: Vec<NodeId>,
    pub acting: Vec<NodeId>,
}

/// A node's relationship to a PG under a given map.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Primary,
    Replica(usize),
    /// Not in the acting set; may still hold data from a past interval.
    Stray,
}

impl Role {
    pub fn is_primary(&self) -> bool {
        matches!(self, Role::Primary)
    }
}

/// One immutable epoch of cluster state.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClusterMap {
    epoch: Epoch,
    nodes: BTreeMap<NodeId, NodeRecord>,
    pgs: HashMap<PgId, PgMapping>,
}

impl ClusterMap {
    pub fn builder(epoch: Epoch) -> ClusterMapBuilder {
        ClusterMapBuilder {
            map: ClusterMap {
                epoch,
                ..Default::default()
            },
        }
    }

    pub fn epoch(&self) -> Epoch {
        self.epoch
    }

    pub fn exists(&self, node: NodeId) -> bool {
        self.nodes.get(&node).map(|n| n.exists).unwrap_or(false)
    }

    pub fn is_up(&self, node: NodeId) -> bool {
        self.nodes.get(&node).map(|n| n.up).unwrap_or(false)
    }

    pub fn lost_at(&self, node: NodeId) -> Epoch {
        self.nodes.get(&node).map(|n| n.lost_at).unwrap_or(0)
    }

    pub fn up_from(&self, node: NodeId) -> Epoch {
        self.nodes.get(&node).map(|n| n.up_from).unwrap_or(0)
    }

    pub fn up_thru(&self, node: NodeId) -> Epoch {
        self.nodes.get(&node).map(|n| n.up_thru).unwrap_or(0)
    }

    pub fn up_of(&self, pgid: PgId) -> Vec<NodeId> {
        self.pgs.get(&pgid).map(|m| m.up.clone()).unwrap_or_default()
    }

    pub fn acting_of(&self, pgid: PgId) -> Vec<NodeId> {
        self.pgs
            .get(&pgid)
            .map(|m| m.acting.clone())
            .unwrap_or_default()
    }

    pub fn primary_of(&self, pgid: PgId) -> Option<NodeId> {
        self.pgs.get(&pgid).and_then(|m| m.acting.first().copied())
    }

    pub fn role_of(&self, pgid: PgId, node: NodeId) -> Role {
        match self
            .pgs
            .get(&pgid)
            .and_then(|m| m.acting.iter().position(|&n| n == node))
        {
            Some(0) => Role::Primary,
            Some(index) => Role::Replica(index),
            None => Role::Stray,
        }
    }

    /// Whether moving from `self` to `new` closes the PG's current interval.
    pub fn interval_changed(&self, new: &ClusterMap, pgid: PgId) -> bool {
        self.up_of(pgid) != new.up_of(pgid) || self.acting_of(pgid) != new.acting_of(pgid)
    }
}

/// Builds a snapshot; meant for the map-distribution service and for tests.
#[derive(Debug)]
pub struct ClusterMapBuilder {
    map: ClusterMap,
}

impl ClusterMapBuilder {
    pub fn node(mut self, id: NodeId, record: NodeRecord) -> Self {
        self.map.nodes.insert(id, record);
        self
    }

    pub fn node_up(self, id: NodeId) -> Self {
        let up_thru = self.map.epoch;
        self.node(
            id,
            NodeRecord {
                up: true,
                up_from: 1,
                up_thru,
                ..Default::default()
            },
        )
    }

    pub fn node_down(self, id: NodeId) -> Self {
        self.node(id, NodeRecord::default())
    }

    pub fn node_lost(self, id: NodeId, lost_at: Epoch) -> Self {
        self.node(
            id,
            NodeRecord {
                lost_at,
                ..Default::default()
            },
        )
    }

    pub fn node_gone(self, id: NodeId) -> Self {
        self.node(
            id,
            NodeRecord {
                exists: false,
                ..Default::default()
            },
        )
    }

    pub fn up_thru(mut self, id: NodeId, up_thru: Epoch) -> Self {
        if let Some(record) = self.map.nodes.get_mut(&id) {
            record.up_thru = up_thru;
        }
        self
    }

    pub fn pg(mut self, pgid: PgId, up: Vec<NodeId>, acting: Vec<NodeId>) -> Self {
        self.map.pgs.insert(pgid, PgMapping { up, acting });
        self
    }

    pub fn build(self) -> Arc<ClusterMap> {
        Arc::new(self.map)
    }
}

/// Callback invoked for every newly published snapshot.
pub type MapCallback = Box<dyn Fn(Arc<ClusterMap>) + Send + Sync>;

/// The map-distribution service as seen by the peering core.
pub trait MapService: Send + Sync {
    /// Returns the snapshot published at `epoch`, if still retained.
    fn get_map(&self, epoch: Epoch) -> Option<Arc<ClusterMap>>;

    fn current_epoch(&self) -> Epoch;

    /// Registers for new snapshots; the owning service uses this to fan
    /// `AdvanceMap` events out to affected PGs.
    fn subscribe(&self, callback: MapCallback);

    /// Asks the service to record that `node` is serving through `epoch`
    /// (an `up_thru` bump); peers observe it in a later map.
    fn request_up_thru(&self, node: NodeId, epoch: Epoch);
}

#[cfg(test)]
mod tests {
    use super::*;

    fn three_node_map(epoch: Epoch) -> Arc<ClusterMap> {
        ClusterMap::builder(epoch)
            .node_up(1)
            .node_up(2)
            .node_up(3)
            .pg(PgId(1), vec![1, 2, 3], vec![1, 2, 3])
            .build()
    }

    atoll_test_utils::param_test! {
        roles_follow_acting_order: [
            primary: (1, Role::Primary),
            second: (2, Role::Replica(1)),
            third: (3, Role::Replica(2)),
            outsider: (9, Role::Stray),
        ]
    }
    fn roles_follow_acting_order(node: NodeId, expected: Role) {
        let map = three_node_map(5);
        assert_eq!(map.role_of(PgId(1), node), expected);
        assert_eq!(map.primary_of(PgId(1)), Some(1));
    }

    #[test]
    fn interval_change_tracks_membership() {
        let old = three_node_map(5);
        let same = three_node_map(6);
        let shrunk = ClusterMap::builder(7)
            .node_up(1)
            .node_up(2)
            .node_down(3)
            .pg(PgId(1), vec![1, 2], vec![1, 2])
            .build();
        assert!(!old.interval_changed(&same, PgId(1)));
        assert!(old.interval_changed(&shrunk, PgId(1)));
    }
}

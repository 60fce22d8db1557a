//! A miniature cluster harness: several single-PG nodes wired through
//! loopback messengers, with messages routed synchronously until quiescence.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

use atoll_core::log::LogEntry;
use atoll_core::{Epoch, Eversion, NodeId, PgId};

use crate::cluster_map::{ClusterMap, MapService};
use crate::config::PgConfig;
use crate::messenger::{Envelope, LoopbackMessenger};
use crate::metrics::NodeMetricSet;
use crate::peering::PgEvent;
use crate::pg::{NodeContext, Pg};
use crate::reservations::Reserver;
use crate::store::{MemStore, ObjectStore, Transaction};

/// A map service fed by the test, recording up-thru requests.
#[derive(Default)]
pub struct StaticMapService {
    maps: Mutex<BTreeMap<Epoch, Arc<ClusterMap>>>,
    up_thru_requests: Mutex<Vec<(NodeId, Epoch)>>,
    subscribers: Mutex<Vec<crate::cluster_map::MapCallback>>,
}

impl StaticMapService {
    pub fn publish(&self, map: Arc<ClusterMap>) {
        self.maps
            .lock()
            .expect("map service lock poisoned")
            .insert(map.epoch(), map.clone());
        for callback in self
            .subscribers
            .lock()
            .expect("map service lock poisoned")
            .iter()
        {
            callback(map.clone());
        }
    }

    pub fn up_thru_requests(&self) -> Vec<(NodeId, Epoch)> {
        self.up_thru_requests
            .lock()
            .expect("map service lock poisoned")
            .clone()
    }
}

impl MapService for StaticMapService {
    fn get_map(&self, epoch: Epoch) -> Option<Arc<ClusterMap>> {
        self.maps
            .lock()
            .expect("map service lock poisoned")
            .get(&epoch)
            .cloned()
    }

    fn current_epoch(&self) -> Epoch {
        self.maps
            .lock()
            .expect("map service lock poisoned")
            .keys()
            .next_back()
            .copied()
            .unwrap_or(0)
    }

    fn subscribe(&self, callback: crate::cluster_map::MapCallback) {
        self.subscribers
            .lock()
            .expect("map service lock poisoned")
            .push(callback);
    }

    fn request_up_thru(&self, node: NodeId, epoch: Epoch) {
        self.up_thru_requests
            .lock()
            .expect("map service lock poisoned")
            .push((node, epoch));
    }
}

/// One storage node hosting one PG.
pub struct TestNode {
    pub pg: Arc<Pg>,
    pub store: Arc<MemStore>,
    pub messenger: Arc<LoopbackMessenger>,
    pub backfill_reserver: Arc<Reserver>,
    pub recovery_reserver: Arc<Reserver>,
    pub metrics: Arc<NodeMetricSet>,
}

/// A cluster of [`TestNode`]s sharing one PG and one map service.
pub struct TestCluster {
    pub pgid: PgId,
    pub map: Arc<ClusterMap>,
    pub map_service: Arc<StaticMapService>,
    pub nodes: BTreeMap<NodeId, TestNode>,
    /// Envelopes addressed to nodes that do not exist in the cluster.
    pub undeliverable: Vec<Envelope>,
}

impl TestCluster {
    pub fn new(pgid: PgId, map: Arc<ClusterMap>, node_ids: &[NodeId]) -> Self {
        let map_service = Arc::new(StaticMapService::default());
        map_service.publish(map.clone());

        let mut nodes = BTreeMap::new();
        for &id in node_ids {
            let store = Arc::new(MemStore::new());
            let messenger = Arc::new(LoopbackMessenger::new());
            let backfill_reserver = Arc::new(Reserver::new("backfill", 1));
            let recovery_reserver = Arc::new(Reserver::new("recovery", 1));
            let metrics = NodeMetricSet::new_for_test();
            let node = Arc::new(NodeContext {
                whoami: id,
                config: PgConfig::default(),
                store: store.clone(),
                messenger: messenger.clone(),
                map_service: map_service.clone(),
                backfill_reserver: backfill_reserver.clone(),
                recovery_reserver: recovery_reserver.clone(),
                metrics: metrics.clone(),
            });
            let pg = Pg::new(node, pgid, map.clone());
            nodes.insert(
                id,
                TestNode {
                    pg,
                    store,
                    messenger,
                    backfill_reserver,
                    recovery_reserver,
                    metrics,
                },
            );
        }
        Self {
            pgid,
            map,
            map_service,
            nodes,
            undeliverable: Vec::new(),
        }
    }

    pub fn node(&self, id: NodeId) -> &TestNode {
        &self.nodes[&id]
    }

    /// Seeds a node with a log, matching info, and one stored object per
    /// surviving update entry.
    pub fn seed_node(&self, id: NodeId, entries: Vec<LogEntry>) {
        let node = self.node(id);
        let mut txn = Transaction::new();
        node.pg.with_inner(|inner| {
            for entry in entries {
                if entry.kind.is_update() {
                    txn.put(
                        self.pgid,
                        entry.oid.clone(),
                        entry.version,
                        entry.oid.name().as_bytes().to_vec(),
                    );
                } else {
                    txn.remove(self.pgid, entry.oid.clone());
                }
                inner.log.append(entry);
            }
            inner.info.last_update = inner.log.head();
            inner.info.last_complete = inner.log.head();
            inner.info.log_tail = inner.log.tail();
            // The node was last serving in the epoch of its newest write.
            inner.info.history.last_epoch_started = inner.log.head().epoch;
            inner.info.history.last_epoch_clean = inner.log.head().epoch;
            inner.dirty_info = true;
            inner.dirty_log = true;
        });
        node.store
            .apply_transaction(self.pgid, txn, None)
            .expect("seeding the store cannot fail");
        let mut txn = Transaction::new();
        node.pg.write_if_dirty(&mut txn);
        node.store
            .apply_transaction(self.pgid, txn, None)
            .expect("seeding the store cannot fail");
    }

    /// Boots every node's PG from its (possibly seeded) local state.
    pub fn start_all(&mut self) {
        self.start_all_unrouted();
        self.route_until_quiet();
    }

    /// Boots every PG without routing any messages, for tests that need to
    /// interleave routing with other stimuli.
    pub fn start_all_unrouted(&self) {
        for node in self.nodes.values() {
            node.pg.queue_event(PgEvent::Load);
            node.pg.handle_activate_map();
        }
    }

    /// Delivers every queued envelope once. Returns how many were routed.
    pub fn route_once(&mut self) -> usize {
        let mut routed = 0;
        let envelopes: Vec<Envelope> = self
            .nodes
            .values()
            .flat_map(|node| node.messenger.drain())
            .collect();
        for envelope in envelopes {
            match self.nodes.get(&envelope.to) {
                Some(target) => {
                    target.pg.handle_peer_message(envelope);
                    routed += 1;
                }
                None => self.undeliverable.push(envelope),
            }
        }
        routed
    }

    /// Routes until no node has anything left to say.
    pub fn route_until_quiet(&mut self) {
        for _ in 0..1000 {
            if self.route_once() == 0 {
                return;
            }
        }
        panic!("cluster did not quiesce; message storm?");
    }

    /// Publishes a new map and delivers it (plus the activation tick) to
    /// every node, then routes to quiescence.
    pub fn advance_map(&mut self, map: Arc<ClusterMap>) {
        self.map_service.publish(map.clone());
        for node in self.nodes.values() {
            node.pg.handle_advance_map(map.clone());
            node.pg.handle_activate_map();
        }
        self.map = map;
        self.route_until_quiet();
    }

    /// Re-delivers only the activation tick, e.g. to retry a stalled
    /// sub-protocol without a membership change.
    pub fn tick(&mut self) {
        for node in self.nodes.values() {
            node.pg.handle_activate_map();
        }
        self.route_until_quiet();
    }

    /// Asserts every reservation granted anywhere was released.
    pub fn assert_reservations_balanced(&self) {
        for (id, node) in &self.nodes {
            for reserver in [&node.backfill_reserver, &node.recovery_reserver] {
                let (granted, released) = reserver.counters();
                assert_eq!(
                    granted, released,
                    "node {id}: {granted} grants vs {released} releases",
                );
                assert_eq!(reserver.outstanding(), 0, "node {id} still holds a slot");
            }
        }
    }

    /// The version every replica's object should converge to; handy in
    /// assertions.
    pub fn object_version_on(&self, id: NodeId, oid: &atoll_core::ObjectId) -> Option<Eversion> {
        self.node(id)
            .store
            .read(self.pgid, oid)
            .map(|(version, _)| version)
    }
}

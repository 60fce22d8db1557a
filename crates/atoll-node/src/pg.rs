//! The per-PG control block: the lock, the persistent fields and dirty
//! flags, the event queue, and the glue routing external stimuli into the
//! state machine.
//!
//! Events are serialized per PG by the inner mutex. One event is processed
//! to quiescence (internal follow-ups drain in the same pass), dirtied state
//! is persisted in a single transaction, and only then, with the lock
//! dropped, are messages sent, flushes requested, and reservation slots
//! touched. Callbacks from those side effects re-enter through the queue.

use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Instant;

use atoll_core::info::{PastIntervals, PgInfo};
use atoll_core::log::{
    placement_hash, DivergentPriors, EntryKind, IndexedLog, LogBundle, LogEntry,
};
use atoll_core::missing::MissingItem;
use atoll_core::messages::{
    Message, PgScan, RecoveryReserveOp, ReserveOp,
};
use atoll_core::missing::{MissingLoc, MissingSet};
use atoll_core::records::{decode_record, encode_record};
use atoll_core::{Epoch, Eversion, NodeId, ObjectId, PgId, ReqId};
use serde::Serialize;

use crate::backfill::BackfillState;
use crate::cluster_map::{ClusterMap, MapService, Role};
use crate::config::PgConfig;
use crate::errors::PgFatalError;
use crate::messenger::{Envelope, Messenger};
use crate::metrics::NodeMetricSet;
use crate::peering::{self, MachineState, PgEvent, ReactCtx, ReserveKind};
use crate::prior_set::PriorSet;
use crate::reconcile;
use crate::recovery::RecoveryOps;
use crate::reservations::Reserver;
use crate::store::{ObjectStore, Transaction};

const INFO_KEY: &str = "info";
const LOG_KEY: &str = "log";
const DIVERGENT_KEY: &str = "divergent";
const MISSING_KEY: &str = "missing";
const INTERVALS_KEY: &str = "intervals";
const DOWN_KEY: &str = "down";

const INFO_STRUCT_V: u8 = 2;
const LOG_STRUCT_V: u8 = 1;
const COMPAT_V: u8 = 1;

/// Node-wide services shared by every PG.
pub struct NodeContext {
    pub whoami: NodeId,
    pub config: PgConfig,
    pub store: Arc<dyn ObjectStore>,
    pub messenger: Arc<dyn Messenger>,
    pub map_service: Arc<dyn MapService>,
    pub backfill_reserver: Arc<Reserver>,
    pub recovery_reserver: Arc<Reserver>,
    pub metrics: Arc<NodeMetricSet>,
}

/// The state a PG owns, guarded by the control block's lock.
///
/// Fields are public for the service layer's introspection and for the test
/// harness; all mutation goes through the state machine under the lock.
pub struct PgInner {
    pub pgid: PgId,
    pub whoami: NodeId,

    // Persistent state.
    pub info: PgInfo,
    pub log: IndexedLog,
    pub divergent_priors: DivergentPriors,
    pub missing: MissingSet,
    pub past_intervals: PastIntervals,

    // Map-derived membership.
    pub map: Arc<ClusterMap>,
    pub up: Vec<NodeId>,
    pub acting: Vec<NodeId>,
    pub role: Role,

    // Machine state and lifecycle.
    pub state: MachineState,
    pub dirty_info: bool,
    pub dirty_log: bool,
    pub last_peering_reset: Epoch,
    pub down_fatal: bool,
    pub deleting: bool,

    // Peering bookkeeping, cleared on every reset.
    pub need_up_thru: bool,
    pub flushed: bool,
    pub send_notify: bool,
    pub all_replicas_activated: bool,
    pub peer_info: BTreeMap<NodeId, PgInfo>,
    pub peer_missing: BTreeMap<NodeId, MissingSet>,
    pub peer_info_requested: BTreeSet<NodeId>,
    pub peer_log_requested: BTreeSet<NodeId>,
    pub peer_missing_requested: BTreeSet<NodeId>,
    pub peer_activated: BTreeSet<NodeId>,
    pub stray_set: BTreeSet<NodeId>,
    pub might_have_unfound: BTreeSet<NodeId>,
    pub prior_set: Option<PriorSet>,
    pub auth_log_source: Option<NodeId>,
    pub pending_auth_log: Option<(NodeId, Box<atoll_core::messages::PgLogMsg>)>,
    pub missing_loc: MissingLoc,

    // Recovery and backfill.
    pub backfill_target: Option<NodeId>,
    pub backfill: BackfillState,
    pub recovery: RecoveryOps,
    pub remote_recovery_granted: BTreeSet<NodeId>,
    pub replica_reservation: Option<ReserveKind>,
    pub reject_remote_reservations: bool,

    // Liveness.
    pub heartbeat_peers: BTreeSet<NodeId>,

    // Tunables copied out of the node config.
    pub config_max_recovery_ops: usize,
    pub config_backfill_scan_max: usize,
    pub config_log_keep: u64,
}

impl PgInner {
    pub fn new(pgid: PgId, whoami: NodeId, map: Arc<ClusterMap>) -> Self {
        let config = PgConfig::default();
        let mut info = PgInfo::new(pgid);
        info.history.same_interval_since = map.epoch();
        info.history.same_up_since = map.epoch();
        info.history.same_primary_since = map.epoch();
        Self {
            pgid,
            whoami,
            info,
            log: IndexedLog::new(),
            divergent_priors: DivergentPriors::new(),
            missing: MissingSet::new(),
            past_intervals: PastIntervals::new(),
            up: Vec::new(),
            acting: Vec::new(),
            role: Role::Stray,
            map,
            state: MachineState::Initial,
            dirty_info: false,
            dirty_log: false,
            last_peering_reset: 0,
            down_fatal: false,
            deleting: false,
            need_up_thru: false,
            flushed: false,
            send_notify: false,
            all_replicas_activated: false,
            peer_info: BTreeMap::new(),
            peer_missing: BTreeMap::new(),
            peer_info_requested: BTreeSet::new(),
            peer_log_requested: BTreeSet::new(),
            peer_missing_requested: BTreeSet::new(),
            peer_activated: BTreeSet::new(),
            stray_set: BTreeSet::new(),
            might_have_unfound: BTreeSet::new(),
            prior_set: None,
            auth_log_source: None,
            pending_auth_log: None,
            missing_loc: MissingLoc::new(),
            backfill_target: None,
            backfill: BackfillState::default(),
            recovery: RecoveryOps::default(),
            remote_recovery_granted: BTreeSet::new(),
            replica_reservation: None,
            reject_remote_reservations: false,
            heartbeat_peers: BTreeSet::new(),
            config_max_recovery_ops: config.max_recovery_ops_per_pg,
            config_backfill_scan_max: config.backfill_scan_max as usize,
            config_log_keep: config.log_keep_min,
        }
    }

    pub fn primary(&self) -> Option<NodeId> {
        self.acting.first().copied()
    }

    pub fn acting_minus_self(&self) -> Vec<NodeId> {
        self.acting
            .iter()
            .copied()
            .filter(|&node| node != self.whoami)
            .collect()
    }

    /// True when nothing locally missing can still be pulled: the set is
    /// empty or what remains is unfound.
    pub fn local_missing_drained(&self) -> bool {
        self.missing
            .in_need_order()
            .all(|(_, oid)| self.missing_loc.locations_of(oid).is_none())
    }

    /// The peers whose liveness this PG cares about: current membership plus
    /// whoever we are probing.
    pub(crate) fn update_heartbeat_peers(&mut self, prior: &PriorSet) {
        self.heartbeat_peers.clear();
        for &node in self.up.iter().chain(&self.acting).chain(&prior.probe) {
            if node != self.whoami {
                self.heartbeat_peers.insert(node);
            }
        }
    }
}

/// What a client write produced.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RequestOutcome {
    /// Applied and assigned this version.
    Applied(Eversion),
    /// The request id is still in the log: a replay, already applied.
    AlreadyApplied(Eversion),
    /// The object is unfound; the operation blocks until a peer with a copy
    /// appears or the object is marked lost.
    BlockedUnfound,
    /// The object is missing locally and recovery is underway; retry after
    /// it lands.
    WaitRecovery,
    /// This PG is not an active primary here.
    NotReady,
}

/// A client write as seen by the core.
#[derive(Debug, Clone)]
pub struct ClientOp {
    pub reqid: ReqId,
    pub oid: ObjectId,
    pub kind: EntryKind,
    pub data: Vec<u8>,
}

/// Introspection snapshot, serializable for operator tooling.
#[derive(Debug, Clone, Serialize)]
pub struct PgSnapshot {
    pub pgid: PgId,
    pub state: String,
    pub epoch: Epoch,
    pub up: Vec<NodeId>,
    pub acting: Vec<NodeId>,
    pub last_update: Eversion,
    pub last_complete: Eversion,
    pub log_tail: Eversion,
    pub log_len: usize,
    pub num_missing: usize,
    pub num_unfound: usize,
    pub peer_count: usize,
    pub backfill_target: Option<NodeId>,
    pub recovery_ops_active: usize,
    pub down: bool,
}

/// Side effects collected while the lock was held, performed after it drops.
#[derive(Default)]
struct SideEffects {
    txn: Transaction,
    outbound: Vec<(NodeId, Message)>,
    request_up_thru: Option<Epoch>,
    request_flush: bool,
    local_reserve: Vec<ReserveKind>,
    local_release: Vec<ReserveKind>,
}

/// A placement group.
pub struct Pg {
    pgid: PgId,
    node: Arc<NodeContext>,
    inner: Mutex<PgInner>,
    pending: Mutex<VecDeque<PgEvent>>,
}

impl Pg {
    /// Creates the control block for a PG first observed under `map`.
    /// Queue [`PgEvent::Initialize`] (new PG) or call [`Pg::load`] followed
    /// by [`PgEvent::Load`] (existing PG) before anything else.
    pub fn new(node: Arc<NodeContext>, pgid: PgId, map: Arc<ClusterMap>) -> Arc<Self> {
        let mut inner = PgInner::new(pgid, node.whoami, map.clone());
        inner.up = map.up_of(pgid);
        inner.acting = map.acting_of(pgid);
        inner.role = map.role_of(pgid, node.whoami);
        inner.send_notify = !matches!(inner.role, Role::Primary);
        inner.config_max_recovery_ops = node.config.max_recovery_ops_per_pg;
        inner.config_backfill_scan_max = node.config.backfill_scan_max as usize;
        inner.config_log_keep = node.config.log_keep_min;
        Arc::new(Self {
            pgid,
            node,
            inner: Mutex::new(inner),
            pending: Mutex::new(VecDeque::new()),
        })
    }

    pub fn pgid(&self) -> PgId {
        self.pgid
    }

    /// Reads the PG's persistent records back from the store. A checksum or
    /// structure failure is a read-log error: the PG comes up down.
    pub fn load(&self) -> Result<(), PgFatalError> {
        let mut inner = self.lock_inner();
        let store = &self.node.store;

        if store.get_meta(self.pgid, DOWN_KEY).is_some() {
            inner.down_fatal = true;
            self.node.metrics.pgs_down.inc();
            tracing::error!(pgid = %self.pgid, "pg was marked down; refusing to load");
            return Ok(());
        }

        let result = (|| -> Result<(), PgFatalError> {
            if let Some(bytes) = store.get_meta(self.pgid, INFO_KEY) {
                inner.info = decode_record::<PgInfo>(INFO_STRUCT_V, &bytes)
                    .map_err(PgFatalError::ReadLog)?
                    .value;
            }
            if let Some(bytes) = store.get_meta(self.pgid, INTERVALS_KEY) {
                inner.past_intervals = decode_record::<PastIntervals>(LOG_STRUCT_V, &bytes)
                    .map_err(PgFatalError::ReadLog)?
                    .value;
            }
            if let Some(bytes) = store.get_meta(self.pgid, LOG_KEY) {
                let bundle = decode_record::<LogBundle>(LOG_STRUCT_V, &bytes)
                    .map_err(PgFatalError::ReadLog)?
                    .value;
                inner.log = IndexedLog::from_bundle(bundle);
            }
            if let Some(bytes) = store.get_meta(self.pgid, DIVERGENT_KEY) {
                inner.divergent_priors = decode_record::<DivergentPriors>(LOG_STRUCT_V, &bytes)
                    .map_err(PgFatalError::ReadLog)?
                    .value;
            }
            if let Some(bytes) = store.get_meta(self.pgid, MISSING_KEY) {
                inner.missing = decode_record::<MissingSet>(LOG_STRUCT_V, &bytes)
                    .map_err(PgFatalError::ReadLog)?
                    .value;
            }
            Ok(())
        })();

        if let Err(error) = result {
            tracing::error!(pgid = %self.pgid, %error, "failed to read pg state");
            inner.down_fatal = true;
            self.node.metrics.pgs_down.inc();
            let mut txn = Transaction::new();
            txn.set_meta(self.pgid, DOWN_KEY, vec![1]);
            drop(inner);
            self.apply_txn(txn);
            return Err(error);
        }
        Ok(())
    }

    /// Queues an event and drains the queue. The public entry point for the
    /// owning service and for completion callbacks.
    pub fn queue_event(self: &Arc<Self>, event: PgEvent) {
        self.pending
            .lock()
            .expect("pg pending queue lock poisoned")
            .push_back(event);
        self.pump();
    }

    /// Routes a new map into the machine, carrying the previous snapshot for
    /// interval bookkeeping.
    pub fn handle_advance_map(self: &Arc<Self>, map: Arc<ClusterMap>) {
        let last_map = self.lock_inner().map.clone();
        let new_up = map.up_of(self.pgid);
        let new_acting = map.acting_of(self.pgid);
        self.queue_event(PgEvent::AdvanceMap {
            map,
            last_map,
            new_up,
            new_acting,
        });
    }

    /// Delivers the per-epoch activation tick.
    pub fn handle_activate_map(self: &Arc<Self>) {
        self.queue_event(PgEvent::ActMap);
    }

    /// Translates an inbound peer message into a machine event. Messages
    /// from before our last peering reset are stale and dropped.
    pub fn handle_peer_message(self: &Arc<Self>, envelope: Envelope) {
        let from = envelope.from;
        {
            let inner = self.lock_inner();
            if envelope.message.epoch() < inner.last_peering_reset {
                tracing::debug!(
                    pgid = %self.pgid,
                    from,
                    kind = envelope.message.kind_name(),
                    epoch = envelope.message.epoch(),
                    reset = inner.last_peering_reset,
                    "stale peer message dropped",
                );
                return;
            }
        }
        let event = match envelope.message {
            Message::Query(query) => PgEvent::Query { from, query },
            Message::Notify(notify) => PgEvent::Notify { from, notify },
            Message::Info(info) => PgEvent::InfoMsg { from, info },
            Message::Log(msg) => PgEvent::LogMsg { from, msg },
            Message::BackfillReserve(reserve) => match reserve.op {
                ReserveOp::Request => PgEvent::RequestBackfill,
                ReserveOp::Grant => PgEvent::RemoteBackfillReserved { from },
                ReserveOp::Reject => PgEvent::RemoteReservationRejected { from },
                ReserveOp::Release => PgEvent::RecoveryDone,
            },
            Message::RecoveryReserve(reserve) => match reserve.op {
                RecoveryReserveOp::Request => PgEvent::RequestRecovery,
                RecoveryReserveOp::Grant => PgEvent::RemoteRecoveryReserved { from },
                RecoveryReserveOp::Release => PgEvent::RecoveryDone,
            },
            Message::Scan(PgScan::Request { begin, max, .. }) => {
                PgEvent::ScanRequest { from, begin, max }
            }
            Message::Scan(PgScan::Response { interval, .. }) => {
                PgEvent::ScanResponse { from, interval }
            }
            Message::Push(push) => PgEvent::Push { from, push },
            Message::PushReply(reply) => PgEvent::PushReply { from, reply },
            Message::Pull(pull) => PgEvent::Pull { from, pull },
            Message::Remove(remove) => PgEvent::RemoveObjects {
                from,
                oids: remove.oids,
            },
            Message::Purge(_) => PgEvent::Purge { from },
        };
        self.queue_event(event);
    }

    /// A client write reaching the primary. Replication to the acting set
    /// rides the ordered write queue owned by the service layer; here the
    /// log entry is assigned, indexed, and persisted, and reads-your-writes
    /// idempotence is enforced through the request-id index.
    pub fn do_request(&self, op: ClientOp) -> RequestOutcome {
        let mut inner = self.lock_inner();
        if inner.down_fatal || !(inner.state.is_active() && matches!(inner.role, Role::Primary)) {
            return RequestOutcome::NotReady;
        }
        if op.reqid.is_indexed() {
            if let Some(version) = inner.log.lookup_by_reqid(&op.reqid) {
                return RequestOutcome::AlreadyApplied(version);
            }
        }
        if inner.missing_loc.is_unfound(&inner.missing, &op.oid) {
            return RequestOutcome::BlockedUnfound;
        }
        if inner.missing.is_missing(&op.oid) {
            return RequestOutcome::WaitRecovery;
        }

        let version = Eversion::new(
            inner.map.epoch().max(inner.info.last_update.epoch),
            inner.info.last_update.seq + 1,
        );
        let prior_version = inner
            .log
            .newest_for(&op.oid)
            .map(|entry| entry.version)
            .unwrap_or(Eversion::NEVER);
        let mut txn = Transaction::new();
        match op.kind {
            EntryKind::Update => txn.put(self.pgid, op.oid.clone(), version, op.data),
            EntryKind::Delete | EntryKind::LostMark => txn.remove(self.pgid, op.oid.clone()),
        }
        inner.log.append(LogEntry {
            version,
            prior_version,
            reqid: op.reqid,
            oid: op.oid,
            kind: op.kind,
        });
        inner.info.last_update = version;
        reconcile::update_last_complete(&mut inner);
        inner.dirty_info = true;
        inner.dirty_log = true;
        Self::write_if_dirty_locked(self.pgid, &mut inner, &mut txn);
        drop(inner);
        self.apply_txn(txn);
        RequestOutcome::Applied(version)
    }

    /// Administratively resolves every unfound object by appending lost
    /// marks; blocked operations observe the objects as gone. Returns how
    /// many objects were marked.
    pub fn mark_all_unfound_lost(self: &Arc<Self>) -> usize {
        let mut inner = self.lock_inner();
        if inner.down_fatal {
            return 0;
        }
        let unfound: Vec<ObjectId> = inner
            .missing
            .in_need_order()
            .filter(|(_, oid)| inner.missing_loc.locations_of(oid).is_none())
            .map(|(_, oid)| oid.clone())
            .collect();
        if unfound.is_empty() {
            return 0;
        }
        tracing::warn!(pgid = %self.pgid, count = unfound.len(), "marking unfound objects lost");

        let mut txn = Transaction::new();
        for oid in &unfound {
            let version = Eversion::new(
                inner.map.epoch().max(inner.info.last_update.epoch),
                inner.info.last_update.seq + 1,
            );
            let prior_version = inner
                .missing
                .item(oid)
                .map(|item| item.have)
                .unwrap_or(Eversion::NEVER);
            let entry = LogEntry {
                version,
                prior_version,
                reqid: ReqId::NONE,
                oid: oid.clone(),
                kind: EntryKind::LostMark,
            };
            for peer_missing in inner.peer_missing.values_mut() {
                peer_missing.add_next_event(&entry);
            }
            inner.log.append(entry);
            inner.info.last_update = version;
            inner.missing.rm(oid, version);
            txn.remove(self.pgid, oid.clone());
        }
        let marked = unfound.len();
        {
            let inner = &mut *inner;
            inner.missing_loc.recompute_unfound(&inner.missing);
        }
        reconcile::update_last_complete(&mut inner);
        inner.dirty_info = true;
        inner.dirty_log = true;
        Self::write_if_dirty_locked(self.pgid, &mut inner, &mut txn);
        let kick = inner.state.is_active();
        drop(inner);
        self.apply_txn(txn);
        if kick {
            // Recovery may now be able to finish.
            self.queue_event(PgEvent::DoRecovery);
        }
        marked
    }

    /// Carves the child PG's share out of this PG when the object namespace
    /// splits: log entries, missing-set entries, divergent priors, and
    /// stored objects whose placement hash selects the child move over, and
    /// the child adopts the parent's info and past intervals.
    ///
    /// The owning service calls this on a map that raises the PG count,
    /// with the child control block created and not yet activated; both PGs
    /// are persisted in one transaction. Locks the parent before the child,
    /// so concurrent splits of the same pair must go through the same call.
    pub fn split_into(&self, child: &Pg, split_bits: u32) {
        debug_assert!(child.pgid != self.pgid, "a pg cannot split into itself");
        debug_assert!(
            split_bits > 0 && split_bits < 64,
            "split_bits must select a nonempty strict subset",
        );
        let mask = (1u64 << split_bits) - 1;
        let child_sel = child.pgid.0 & mask;
        tracing::info!(
            pgid = %self.pgid,
            child = %child.pgid,
            split_bits,
            "splitting pg",
        );

        let mut inner = self.lock_inner();
        let mut child_inner = child.lock_inner();

        // Log entries and their indexes.
        inner
            .log
            .split_into(split_bits, child_sel, &mut child_inner.log);

        // The child starts from the parent's view of history.
        child_inner.info.last_update = inner.info.last_update;
        child_inner.info.log_tail = inner.info.log_tail;
        child_inner.info.is_incomplete = inner.info.is_incomplete;
        child_inner.info.history = inner.info.history;
        child_inner.past_intervals = inner.past_intervals.clone();

        // Missing objects follow their log entries.
        let moved: Vec<(ObjectId, MissingItem)> = inner
            .missing
            .in_need_order()
            .filter(|(_, oid)| placement_hash(oid) & mask == child_sel)
            .map(|(_, oid)| {
                let item = *inner.missing.item(oid).expect("listed by in_need_order");
                (oid.clone(), item)
            })
            .collect();
        for (oid, item) in moved {
            child_inner.missing.add(oid.clone(), item.need, item.have);
            inner.missing.rm(&oid, item.need);
        }

        // Divergent priors follow their objects.
        let divergent = std::mem::take(&mut inner.divergent_priors);
        for (version, oid) in divergent {
            if placement_hash(&oid) & mask == child_sel {
                child_inner.divergent_priors.insert(version, oid);
            } else {
                inner.divergent_priors.insert(version, oid);
            }
        }

        // Stored objects change collections.
        let mut txn = Transaction::new();
        let mut pos = ObjectId::default();
        loop {
            let (objects, end) =
                self.node
                    .store
                    .scan_range(self.pgid, &pos, inner.config_backfill_scan_max);
            for (oid, _) in &objects {
                if placement_hash(oid) & mask != child_sel {
                    continue;
                }
                if let Some((version, data)) = self.node.store.read(self.pgid, oid) {
                    txn.put(child.pgid, oid.clone(), version, data);
                    txn.remove(self.pgid, oid.clone());
                }
            }
            if end.is_max() {
                break;
            }
            pos = end;
        }

        reconcile::update_last_complete(&mut inner);
        reconcile::update_last_complete(&mut child_inner);
        inner.dirty_info = true;
        inner.dirty_log = true;
        child_inner.dirty_info = true;
        child_inner.dirty_log = true;
        Self::write_if_dirty_locked(self.pgid, &mut inner, &mut txn);
        Self::write_if_dirty_locked(child.pgid, &mut child_inner, &mut txn);
        drop(child_inner);
        drop(inner);
        self.apply_txn(txn);
    }

    /// Appends any dirtied persistent records to `txn` and clears the dirty
    /// flags. Exposed for the service layer to piggyback on its own
    /// transactions.
    pub fn write_if_dirty(&self, txn: &mut Transaction) {
        let mut inner = self.lock_inner();
        Self::write_if_dirty_locked(self.pgid, &mut inner, txn);
    }

    /// Introspection for operator tooling.
    pub fn dump_recovery_info(&self) -> PgSnapshot {
        let inner = self.lock_inner();
        PgSnapshot {
            pgid: self.pgid,
            state: inner.state.name().to_owned(),
            epoch: inner.map.epoch(),
            up: inner.up.clone(),
            acting: inner.acting.clone(),
            last_update: inner.info.last_update,
            last_complete: inner.info.last_complete,
            log_tail: inner.log.tail(),
            log_len: inner.log.len(),
            num_missing: inner.missing.num_missing(),
            num_unfound: inner.missing_loc.num_unfound(),
            peer_count: inner.peer_info.len(),
            backfill_target: inner.backfill_target,
            recovery_ops_active: inner.recovery.active,
            down: inner.down_fatal,
        }
    }

    /// The peers the liveness subsystem should heartbeat for this PG.
    pub fn heartbeat_peers(&self) -> Vec<NodeId> {
        self.lock_inner().heartbeat_peers.iter().copied().collect()
    }

    pub fn is_clean(&self) -> bool {
        self.lock_inner().state.is_clean()
    }

    pub fn is_down(&self) -> bool {
        self.lock_inner().down_fatal
    }

    pub fn state_name(&self) -> &'static str {
        self.lock_inner().state.name()
    }

    /// Direct access to the guarded state, for tests and harnesses.
    #[cfg(any(test, feature = "test-utils"))]
    pub fn with_inner<R>(&self, f: impl FnOnce(&mut PgInner) -> R) -> R {
        f(&mut self.lock_inner())
    }

    fn lock_inner(&self) -> std::sync::MutexGuard<'_, PgInner> {
        self.inner.lock().expect("pg lock poisoned")
    }

    /// Drains the event queue. Blocks on the PG lock per event; side effects
    /// run only after the lock drops, so completion callbacks re-entering
    /// [`Pg::queue_event`] cannot deadlock.
    fn pump(self: &Arc<Self>) {
        loop {
            let event = {
                let mut pending = self
                    .pending
                    .lock()
                    .expect("pg pending queue lock poisoned");
                pending.pop_front()
            };
            let Some(event) = event else {
                return;
            };

            let started = Instant::now();
            let mut inner = self.lock_inner();
            if inner.deleting {
                continue;
            }
            if inner.down_fatal
                && !matches!(event, PgEvent::AdvanceMap { .. } | PgEvent::ActMap)
            {
                tracing::debug!(pgid = %self.pgid, event = event.name(), "down pg ignores event");
                continue;
            }

            self.node
                .metrics
                .events_processed
                .with_label_values(&[event.name()])
                .inc();

            let mut ctx = ReactCtx::new(&*self.node.store);
            peering::handle_event(&mut inner, &mut ctx, event);
            while let Some(next) = ctx.posted.pop_front() {
                peering::handle_event(&mut inner, &mut ctx, next);
            }

            let mut side = SideEffects {
                txn: std::mem::take(&mut ctx.txn),
                outbound: std::mem::take(&mut ctx.outbound),
                request_up_thru: ctx.request_up_thru.take(),
                request_flush: ctx.request_flush,
                local_reserve: std::mem::take(&mut ctx.local_reserve),
                local_release: std::mem::take(&mut ctx.local_release),
            };

            if let Some(fatal) = ctx.fatal.take() {
                tracing::error!(pgid = %self.pgid, error = %fatal, "pg fatal error; marking down");
                inner.down_fatal = true;
                self.node.metrics.pgs_down.inc();
                side.txn.set_meta(self.pgid, DOWN_KEY, vec![1]);
            }

            Self::write_if_dirty_locked(self.pgid, &mut inner, &mut side.txn);
            debug_assert!(!inner.dirty_info && !inner.dirty_log);
            drop(inner);

            self.perform(side);
            self.node
                .metrics
                .event_seconds
                .observe(started.elapsed().as_secs_f64());
        }
    }

    fn perform(self: &Arc<Self>, side: SideEffects) {
        if !side.txn.is_empty() {
            self.apply_txn(side.txn);
            self.node.metrics.txns_committed.inc();
        }
        for (to, message) in side.outbound {
            self.node
                .metrics
                .messages_sent
                .with_label_values(&[message.kind_name()])
                .inc();
            self.node.messenger.send(Envelope {
                from: self.node.whoami,
                to,
                pgid: self.pgid,
                message,
            });
        }
        if let Some(epoch) = side.request_up_thru {
            self.node.map_service.request_up_thru(self.node.whoami, epoch);
        }
        if side.request_flush {
            self.node.metrics.flushes_requested.inc();
            let weak = Arc::downgrade(self);
            self.node.store.flush(
                self.pgid,
                Box::new(move || {
                    if let Some(pg) = weak.upgrade() {
                        pg.queue_event(PgEvent::Flushed);
                    }
                }),
            );
        }
        // Releases before acquisitions: a PG cycling within one pass must
        // not deadlock on its own slot.
        for kind in side.local_release {
            self.reserver(kind).release(self.pgid);
        }
        for kind in side.local_reserve {
            let weak = Arc::downgrade(self);
            let event = match kind {
                ReserveKind::Backfill => PgEvent::LocalBackfillReserved,
                ReserveKind::Recovery => PgEvent::LocalRecoveryReserved,
            };
            self.reserver(kind).request(
                self.pgid,
                Box::new(move || {
                    if let Some(pg) = weak.upgrade() {
                        pg.queue_event(event.clone());
                    }
                }),
            );
        }
    }

    fn reserver(&self, kind: ReserveKind) -> &Reserver {
        match kind {
            ReserveKind::Backfill => &self.node.backfill_reserver,
            ReserveKind::Recovery => &self.node.recovery_reserver,
        }
    }

    fn apply_txn(&self, txn: Transaction) {
        // A commit failure is storage-fatal: the node must exit so a peer
        // replaces it.
        self.node
            .store
            .apply_transaction(self.pgid, txn, None)
            .unwrap_or_else(|error| panic!("storage fatal on {}: {error}", self.pgid));
    }

    fn write_if_dirty_locked(pgid: PgId, inner: &mut PgInner, txn: &mut Transaction) {
        if inner.dirty_info {
            txn.set_meta(
                pgid,
                INFO_KEY,
                encode_record(INFO_STRUCT_V, COMPAT_V, &inner.info),
            );
            txn.set_meta(
                pgid,
                INTERVALS_KEY,
                encode_record(LOG_STRUCT_V, COMPAT_V, &inner.past_intervals),
            );
            inner.dirty_info = false;
        }
        if inner.dirty_log {
            txn.set_meta(
                pgid,
                LOG_KEY,
                encode_record(LOG_STRUCT_V, COMPAT_V, &inner.log.bundle()),
            );
            txn.set_meta(
                pgid,
                DIVERGENT_KEY,
                encode_record(LOG_STRUCT_V, COMPAT_V, &inner.divergent_priors),
            );
            txn.set_meta(
                pgid,
                MISSING_KEY,
                encode_record(LOG_STRUCT_V, COMPAT_V, &inner.missing),
            );
            inner.dirty_log = false;
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use atoll_core::log::EntryKind;
    use atoll_core::test_utils::entry;

    use super::*;
    use crate::cluster_map::ClusterMap;
    use crate::messenger::LoopbackMessenger;
    use crate::store::MemStore;

    struct StaticMaps;

    impl MapService for StaticMaps {
        fn get_map(&self, _epoch: Epoch) -> Option<Arc<ClusterMap>> {
            None
        }
        fn current_epoch(&self) -> Epoch {
            1
        }
        fn subscribe(&self, _callback: crate::cluster_map::MapCallback) {}
        fn request_up_thru(&self, _node: NodeId, _epoch: Epoch) {}
    }

    fn test_node(whoami: NodeId, store: Arc<MemStore>) -> Arc<NodeContext> {
        Arc::new(NodeContext {
            whoami,
            config: PgConfig::default(),
            store,
            messenger: Arc::new(LoopbackMessenger::new()),
            map_service: Arc::new(StaticMaps),
            backfill_reserver: Arc::new(Reserver::new("backfill", 1)),
            recovery_reserver: Arc::new(Reserver::new("recovery", 1)),
            metrics: NodeMetricSet::new_for_test(),
        })
    }

    fn solo_map(epoch: Epoch, pgid: PgId) -> Arc<ClusterMap> {
        ClusterMap::builder(epoch)
            .node_up(1)
            .pg(pgid, vec![1], vec![1])
            .build()
    }

    #[test]
    fn persists_and_reloads_state() {
        let store = Arc::new(MemStore::new());
        let node = test_node(1, store.clone());
        let pgid = PgId(3);
        let map = solo_map(1, pgid);

        let pg = Pg::new(node.clone(), pgid, map.clone());
        pg.with_inner(|inner| {
            inner.log.append(entry(1, 1, "a", EntryKind::Update));
            inner.info.last_update = Eversion::new(1, 1);
            inner.info.last_complete = Eversion::new(1, 1);
            inner.dirty_info = true;
            inner.dirty_log = true;
        });
        let mut txn = Transaction::new();
        pg.write_if_dirty(&mut txn);
        store.apply_transaction(pgid, txn, None).expect("apply");

        let reloaded = Pg::new(node, pgid, map);
        reloaded.load().expect("load");
        reloaded.with_inner(|inner| {
            assert_eq!(inner.info.last_update, Eversion::new(1, 1));
            assert_eq!(inner.log.len(), 1);
            assert!(inner.log.index_consistent());
        });
    }

    #[test]
    fn corrupt_log_record_marks_pg_down() {
        let store = Arc::new(MemStore::new());
        let node = test_node(1, store.clone());
        let pgid = PgId(4);
        let map = solo_map(1, pgid);

        let pg = Pg::new(node.clone(), pgid, map.clone());
        pg.with_inner(|inner| {
            inner.log.append(entry(1, 1, "a", EntryKind::Update));
            inner.dirty_log = true;
        });
        let mut txn = Transaction::new();
        pg.write_if_dirty(&mut txn);
        store.apply_transaction(pgid, txn, None).expect("apply");
        store.corrupt_meta(pgid, LOG_KEY);

        let reloaded = Pg::new(node, pgid, map);
        assert!(matches!(reloaded.load(), Err(PgFatalError::ReadLog(_))));
        assert!(reloaded.is_down());

        // The down bit is persistent: a further load refuses to proceed.
        let _ = reloaded;
    }

    #[test]
    fn solo_primary_reaches_clean() {
        let store = Arc::new(MemStore::new());
        let node = test_node(1, store);
        let pgid = PgId(5);
        let map = solo_map(1, pgid);

        let pg = Pg::new(node, pgid, map);
        pg.queue_event(PgEvent::Initialize);
        pg.handle_activate_map();
        assert!(pg.is_clean(), "state: {}", pg.state_name());
    }

    fn seed_solo(pg: &Arc<Pg>, store: &MemStore, pgid: PgId, count: u64) {
        let mut txn = Transaction::new();
        pg.with_inner(|inner| {
            for seq in 1..=count {
                let entry = entry(1, seq, &format!("obj-{seq}"), EntryKind::Update);
                txn.put(pgid, entry.oid.clone(), entry.version, vec![seq as u8]);
                inner.log.append(entry);
            }
            inner.info.last_update = inner.log.head();
            inner.info.last_complete = inner.log.head();
            inner.dirty_info = true;
            inner.dirty_log = true;
        });
        store.apply_transaction(pgid, txn, None).expect("seed");
        let mut txn = Transaction::new();
        pg.write_if_dirty(&mut txn);
        store.apply_transaction(pgid, txn, None).expect("seed");
    }

    #[test]
    fn split_partitions_state_between_parent_and_child() {
        let store = Arc::new(MemStore::new());
        let node = test_node(1, store.clone());
        let parent_id = PgId(0);
        let child_id = PgId(1);
        let map = ClusterMap::builder(1)
            .node_up(1)
            .pg(parent_id, vec![1], vec![1])
            .pg(child_id, vec![1], vec![1])
            .build();
        let parent = Pg::new(node.clone(), parent_id, map.clone());
        let child = Pg::new(node, child_id, map);
        seed_solo(&parent, &store, parent_id, 16);

        // A missing object and an unresolved divergent prior ride along with
        // whichever side owns them.
        let missing_oid = ObjectId::new("obj-3");
        let prior_oid = ObjectId::new("obj-7");
        parent.with_inner(|inner| {
            inner
                .missing
                .add(missing_oid.clone(), Eversion::new(1, 3), Eversion::NEVER);
            inner
                .divergent_priors
                .insert(Eversion::new(1, 100), prior_oid.clone());
        });

        parent.split_into(&child, 1);

        let on_child = |oid: &ObjectId| placement_hash(oid) & 1 == child_id.0 & 1;
        parent.with_inner(|inner| {
            assert!(inner.log.index_consistent());
            assert!(inner.log.entries().all(|e| !on_child(&e.oid)));
            assert_eq!(inner.missing.is_missing(&missing_oid), !on_child(&missing_oid));
            assert_eq!(
                inner.divergent_priors.contains_key(&Eversion::new(1, 100)),
                !on_child(&prior_oid),
            );
        });
        child.with_inner(|inner| {
            assert!(inner.log.index_consistent());
            assert!(!inner.log.is_empty(), "no entries landed in the child");
            assert!(inner.log.entries().all(|e| on_child(&e.oid)));
            assert_eq!(inner.missing.is_missing(&missing_oid), on_child(&missing_oid));
            assert_eq!(
                inner.divergent_priors.contains_key(&Eversion::new(1, 100)),
                on_child(&prior_oid),
            );
            // The child adopts the parent's history wholesale.
            assert_eq!(inner.info.last_update, Eversion::new(1, 16));
        });

        let entry_total = parent.with_inner(|inner| inner.log.len())
            + child.with_inner(|inner| inner.log.len());
        assert_eq!(entry_total, 16);
        assert_eq!(
            store.object_count(parent_id) + store.object_count(child_id),
            16,
            "stored objects must move collections, not vanish",
        );
        for (oid, _) in store.scan_range(child_id, &ObjectId::default(), 64).0 {
            assert!(on_child(&oid), "{oid} does not belong to the child");
        }
    }

    #[test]
    fn split_halves_peer_clean_independently() {
        let store = Arc::new(MemStore::new());
        let node = test_node(1, store.clone());
        let parent_id = PgId(0);
        let child_id = PgId(1);
        let map = ClusterMap::builder(1)
            .node_up(1)
            .pg(parent_id, vec![1], vec![1])
            .pg(child_id, vec![1], vec![1])
            .build();
        let parent = Pg::new(node.clone(), parent_id, map.clone());
        let child = Pg::new(node, child_id, map);
        seed_solo(&parent, &store, parent_id, 16);

        parent.split_into(&child, 1);

        for pg in [&parent, &child] {
            pg.queue_event(PgEvent::Load);
            pg.handle_activate_map();
            assert!(pg.is_clean(), "{} state: {}", pg.pgid(), pg.state_name());
        }
    }

    #[test]
    fn do_request_is_idempotent_by_reqid() {
        let store = Arc::new(MemStore::new());
        let node = test_node(1, store);
        let pgid = PgId(6);
        let pg = Pg::new(node, pgid, solo_map(1, pgid));
        pg.queue_event(PgEvent::Initialize);
        pg.handle_activate_map();

        let op = ClientOp {
            reqid: ReqId::new(7, 1),
            oid: ObjectId::new("x"),
            kind: EntryKind::Update,
            data: vec![1, 2, 3],
        };
        let first = pg.do_request(op.clone());
        let RequestOutcome::Applied(version) = first else {
            panic!("expected Applied, got {first:?}");
        };
        assert_eq!(pg.do_request(op), RequestOutcome::AlreadyApplied(version));
    }
}

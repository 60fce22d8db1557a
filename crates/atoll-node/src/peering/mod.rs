//! The per-PG peering state machine.
//!
//! Events are processed strictly under the PG lock, one at a time, each to
//! quiescence: a reaction may post follow-up events, which drain in the same
//! pass. Reactions never block; anything awaited (peer replies, store
//! flushes, reservation grants) is encoded as a waiting state, and the
//! corresponding completion re-enters the machine as an event.
//!
//! Dispatch is hierarchical: the innermost state reacts first and returns
//! the event unconsumed to let an ancestor handle it. Events no state
//! accounts for send the machine to `Crashed`.

pub mod event;
pub mod state;

use std::collections::VecDeque;

use atoll_core::info::PastInterval;
use atoll_core::log::LogBundle;
use atoll_core::messages::{
    BackfillReserve, Message, PgInfoMsg, PgLogMsg, PgNotify, PgPurge, PgQuery, QueryKind,
    RecoveryReserve, RecoveryReserveOp, ReserveOp,
};
use atoll_core::{Epoch, Eversion, NodeId};

use crate::backfill;
use crate::cluster_map::Role;
use crate::errors::PgFatalError;
use crate::pg::PgInner;
use crate::prior_set::PriorSet;
use crate::reconcile;
use crate::recovery;
use crate::store::{ObjectStore, Transaction};

pub use event::PgEvent;
pub use state::{ActivePhase, MachineState, Peering, Primary, Replica, Started};

/// Which process-wide reservation slot a request or release refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReserveKind {
    Backfill,
    Recovery,
}

/// Everything a reaction may do besides mutating the PG: accumulate a store
/// transaction, stage outbound messages, post follow-up events, and request
/// side effects the control block performs after the lock drops.
pub struct ReactCtx<'a> {
    pub store: &'a dyn ObjectStore,
    pub txn: Transaction,
    pub outbound: Vec<(NodeId, Message)>,
    pub posted: VecDeque<PgEvent>,
    pub request_up_thru: Option<Epoch>,
    pub request_flush: bool,
    pub local_reserve: Vec<ReserveKind>,
    pub local_release: Vec<ReserveKind>,
    pub fatal: Option<PgFatalError>,
}

impl<'a> ReactCtx<'a> {
    pub fn new(store: &'a dyn ObjectStore) -> Self {
        Self {
            store,
            txn: Transaction::new(),
            outbound: Vec::new(),
            posted: VecDeque::new(),
            request_up_thru: None,
            request_flush: false,
            local_reserve: Vec::new(),
            local_release: Vec::new(),
            fatal: None,
        }
    }

    pub fn send(&mut self, to: NodeId, message: Message) {
        self.outbound.push((to, message));
    }

    pub fn post(&mut self, event: PgEvent) {
        self.posted.push_back(event);
    }
}

/// Runs one event through the machine. Posted follow-ups are drained by the
/// control block in the same locked pass.
pub(crate) fn handle_event(pg: &mut PgInner, ctx: &mut ReactCtx<'_>, event: PgEvent) {
    tracing::debug!(
        pgid = %pg.pgid,
        state = %pg.state,
        event = event.name(),
        "peering event",
    );
    let unconsumed = match pg.state {
        MachineState::Initial => react_initial(pg, ctx, event),
        MachineState::Reset => react_reset(pg, ctx, event),
        MachineState::Started(sub) => react_started(pg, ctx, sub, event),
        MachineState::Crashed => {
            tracing::warn!(pgid = %pg.pgid, event = event.name(), "event for crashed pg dropped");
            None
        }
    };
    if let Some(event) = unconsumed {
        if is_discardable(&event) {
            // Late completions and peer traffic can race a reset or a phase
            // change; they carry no obligation and are dropped.
            tracing::debug!(
                pgid = %pg.pgid,
                state = %pg.state,
                event = event.name(),
                "stale event discarded",
            );
        } else {
            crash(pg, ctx, &event);
        }
    }
}

/// Events that may legitimately arrive after the state that wanted them is
/// gone. Everything else reaching the fall-through is a programmer error.
fn is_discardable(event: &PgEvent) -> bool {
    matches!(
        event,
        PgEvent::LocalBackfillReserved
            | PgEvent::LocalRecoveryReserved
            | PgEvent::RemoteBackfillReserved { .. }
            | PgEvent::RemoteRecoveryReserved { .. }
            | PgEvent::RemoteReservationRejected { .. }
            | PgEvent::RequestBackfill
            | PgEvent::RequestRecovery
            | PgEvent::RecoveryDone
            | PgEvent::DoRecovery
            | PgEvent::Backfilled
            | PgEvent::AllReplicasRecovered
            | PgEvent::InfoMsg { .. }
            | PgEvent::LogMsg { .. }
            | PgEvent::Notify { .. }
            | PgEvent::Push { .. }
            | PgEvent::PushReply { .. }
            | PgEvent::ScanResponse { .. }
            | PgEvent::RemoveObjects { .. }
            | PgEvent::Query { .. }
            | PgEvent::Pull { .. }
            | PgEvent::ScanRequest { .. }
            | PgEvent::Purge { .. }
            | PgEvent::Flushed
            | PgEvent::ActMap
    )
}

// ---------------------------------------------------------------- Initial

fn react_initial(pg: &mut PgInner, ctx: &mut ReactCtx<'_>, event: PgEvent) -> Option<PgEvent> {
    match event {
        PgEvent::Initialize => {
            pg.dirty_info = true;
            pg.dirty_log = true;
            pg.state = MachineState::Reset;
            None
        }
        PgEvent::Load => {
            pg.state = MachineState::Reset;
            None
        }
        PgEvent::AdvanceMap {
            map,
            last_map,
            new_up,
            new_acting,
        } => {
            // Maps can outrun initialization; absorb them here.
            advance_map(pg, ctx, map, last_map, new_up, new_acting);
            pg.state = MachineState::Reset;
            None
        }
        other => Some(other),
    }
}

// ------------------------------------------------------------------ Reset

fn react_reset(pg: &mut PgInner, ctx: &mut ReactCtx<'_>, event: PgEvent) -> Option<PgEvent> {
    match event {
        PgEvent::AdvanceMap {
            map,
            last_map,
            new_up,
            new_acting,
        } => {
            advance_map(pg, ctx, map, last_map, new_up, new_acting);
            None
        }
        PgEvent::ActMap => {
            if pg.send_notify {
                send_notify_to_primary(pg, ctx);
            }
            enter_start(pg, ctx);
            None
        }
        PgEvent::Flushed => {
            pg.flushed = true;
            None
        }
        PgEvent::Query { .. }
        | PgEvent::Notify { .. }
        | PgEvent::InfoMsg { .. }
        | PgEvent::LogMsg { .. } => {
            // The sender raced our reset; it will re-learn our state after
            // the next activation tick.
            tracing::debug!(pgid = %pg.pgid, "peer message during reset dropped");
            None
        }
        other => Some(other),
    }
}

// ---------------------------------------------------------------- Started

fn react_started(
    pg: &mut PgInner,
    ctx: &mut ReactCtx<'_>,
    sub: Started,
    event: PgEvent,
) -> Option<PgEvent> {
    let leftover = match sub {
        Started::Start => react_start(pg, ctx, event),
        Started::Stray => react_stray(pg, ctx, event),
        Started::Primary(primary) => react_primary(pg, ctx, primary, event),
        Started::Replica(rep) => react_replica(pg, ctx, rep, event),
    };
    let event = leftover?;
    match event {
        PgEvent::AdvanceMap {
            map,
            last_map,
            new_up,
            new_acting,
        } => {
            let interval_changed = pg.map.interval_changed(&map, pg.pgid);
            let prior_affected = pg
                .prior_set
                .as_ref()
                .map(|prior| prior.affected_by_map(&map))
                .unwrap_or(false);
            advance_map(pg, ctx, map, last_map, new_up, new_acting);
            if interval_changed || prior_affected {
                restart_peering(pg, ctx);
            }
            None
        }
        PgEvent::ActMap => {
            if pg.send_notify {
                send_notify_to_primary(pg, ctx);
            }
            None
        }
        PgEvent::Flushed => {
            pg.flushed = true;
            None
        }
        PgEvent::Query { from, query } => {
            fulfill_query(pg, ctx, from, query);
            None
        }
        PgEvent::Notify { from, notify } => {
            if pg.state.is_primary() {
                proc_replica_notify(pg, ctx, from, notify);
            }
            None
        }
        // Any node holding data may serve as a recovery source or answer a
        // backfill scan, whatever its role this interval.
        PgEvent::Pull { from, pull } => {
            recovery::handle_pull(pg, ctx, from, pull);
            None
        }
        PgEvent::ScanRequest { from, begin, max } => {
            backfill::handle_scan_request(pg, ctx, from, begin, max as usize);
            None
        }
        PgEvent::Purge { from } => {
            handle_purge(pg, ctx, from);
            None
        }
        PgEvent::RecoveryDone => None,
        other => Some(other),
    }
}

fn react_start(pg: &mut PgInner, ctx: &mut ReactCtx<'_>, event: PgEvent) -> Option<PgEvent> {
    match event {
        PgEvent::MakePrimary => {
            pg.state = MachineState::Started(Started::Primary(Primary::Peering(Peering::GetInfo)));
            enter_get_info(pg, ctx);
            None
        }
        PgEvent::MakeStray => {
            pg.state = MachineState::Started(Started::Stray);
            None
        }
        other => Some(other),
    }
}

// ------------------------------------------------------------------ Stray

fn react_stray(pg: &mut PgInner, ctx: &mut ReactCtx<'_>, event: PgEvent) -> Option<PgEvent> {
    match event {
        PgEvent::LogMsg { from, msg } => {
            if stray_receive_log(pg, ctx, from, *msg) {
                become_replica(pg, ctx, from);
            }
            None
        }
        PgEvent::InfoMsg { from, info } => {
            pg.info.history.merge(&info.info.history);
            pg.dirty_info = true;
            ack_info(pg, ctx, from);
            become_replica(pg, ctx, from);
            None
        }
        other => Some(other),
    }
}

/// Absorbs an activation log from the new primary. Returns false on fatal
/// divergence (the machine is already marked down).
fn stray_receive_log(
    pg: &mut PgInner,
    ctx: &mut ReactCtx<'_>,
    from: NodeId,
    msg: PgLogMsg,
) -> bool {
    if msg.log.tail > pg.log.head() {
        // No overlap: we are being activated as a backfill target. Adopt the
        // authoritative log wholesale; our data stays partial until backfill
        // rewrites it.
        adopt_log_wholesale(pg, msg.info, msg.log);
    } else {
        match reconcile::merge_log(pg, ctx, msg.info, msg.log, from) {
            Ok(_) => {}
            Err(fatal) => {
                ctx.fatal = Some(fatal);
                return false;
            }
        }
    }
    ack_info(pg, ctx, from);
    true
}

fn adopt_log_wholesale(pg: &mut PgInner, info: atoll_core::info::PgInfo, log: LogBundle) {
    pg.log.claim(log);
    pg.missing = Default::default();
    pg.divergent_priors.clear();
    let pgid = pg.info.pgid;
    pg.info = info;
    pg.info.pgid = pgid;
    // Readable only up to nothing until the backfill sweep rewrites us.
    pg.info.last_complete = atoll_core::Eversion::NEVER;
    pg.info.is_incomplete = true;
    pg.dirty_info = true;
    pg.dirty_log = true;
}

fn become_replica(pg: &mut PgInner, _ctx: &mut ReactCtx<'_>, from: NodeId) {
    tracing::info!(pgid = %pg.pgid, primary = from, "activated as replica");
    pg.info.history.last_epoch_started = pg.map.epoch();
    pg.dirty_info = true;
    pg.send_notify = false;
    pg.state = MachineState::Started(Started::Replica(Replica::RepNotRecovering));
}

fn ack_info(pg: &mut PgInner, ctx: &mut ReactCtx<'_>, to: NodeId) {
    let message = Message::Info(PgInfoMsg {
        info: pg.info.clone(),
        epoch: pg.map.epoch(),
    });
    ctx.send(to, message);
}

// ---------------------------------------------------------------- Replica

fn react_replica(
    pg: &mut PgInner,
    ctx: &mut ReactCtx<'_>,
    rep: Replica,
    event: PgEvent,
) -> Option<PgEvent> {
    match (rep, event) {
        (Replica::RepNotRecovering, PgEvent::RequestBackfill) => {
            if pg.reject_remote_reservations {
                let primary = pg.primary();
                if let Some(primary) = primary {
                    ctx.send(
                        primary,
                        Message::BackfillReserve(BackfillReserve {
                            op: ReserveOp::Reject,
                            epoch: pg.map.epoch(),
                        }),
                    );
                }
                return None;
            }
            pg.state = MachineState::Started(Started::Replica(Replica::RepWaitBackfillReserved));
            ctx.local_reserve.push(ReserveKind::Backfill);
            None
        }
        (Replica::RepNotRecovering, PgEvent::RequestRecovery) => {
            pg.state = MachineState::Started(Started::Replica(Replica::RepWaitRecoveryReserved));
            ctx.local_reserve.push(ReserveKind::Recovery);
            None
        }
        (Replica::RepWaitBackfillReserved, PgEvent::LocalBackfillReserved) => {
            pg.replica_reservation = Some(ReserveKind::Backfill);
            if let Some(primary) = pg.primary() {
                ctx.send(
                    primary,
                    Message::BackfillReserve(BackfillReserve {
                        op: ReserveOp::Grant,
                        epoch: pg.map.epoch(),
                    }),
                );
            }
            pg.state = MachineState::Started(Started::Replica(Replica::RepRecovering));
            None
        }
        (Replica::RepWaitRecoveryReserved, PgEvent::LocalRecoveryReserved) => {
            pg.replica_reservation = Some(ReserveKind::Recovery);
            if let Some(primary) = pg.primary() {
                ctx.send(
                    primary,
                    Message::RecoveryReserve(RecoveryReserve {
                        op: RecoveryReserveOp::Grant,
                        epoch: pg.map.epoch(),
                    }),
                );
            }
            pg.state = MachineState::Started(Started::Replica(Replica::RepRecovering));
            None
        }
        (_, PgEvent::RecoveryDone) => {
            if let Some(kind) = pg.replica_reservation.take() {
                ctx.local_release.push(kind);
            } else {
                // A queued-but-ungranted request is cancelled by release.
                ctx.local_release.push(ReserveKind::Backfill);
                ctx.local_release.push(ReserveKind::Recovery);
            }
            pg.state = MachineState::Started(Started::Replica(Replica::RepNotRecovering));
            None
        }
        (_, PgEvent::Push { from, push }) => {
            recovery::handle_push_replica(pg, ctx, from, push);
            None
        }
        (_, PgEvent::RemoveObjects { oids, .. }) => {
            backfill::handle_remove(pg, ctx, oids);
            None
        }
        (_, PgEvent::LogMsg { from, msg }) => {
            // The primary may extend us again (e.g. after divergence repair).
            if stray_receive_log(pg, ctx, from, *msg) {
                pg.dirty_info = true;
            }
            None
        }
        (_, PgEvent::InfoMsg { from, info }) => {
            replica_adopt_info(pg, ctx, from, info);
            None
        }
        (_, other) => Some(other),
    }
}

/// A replica absorbing an info push from its primary. At backfill completion
/// this is what makes the target's metadata authoritative again.
fn replica_adopt_info(pg: &mut PgInner, ctx: &mut ReactCtx<'_>, from: NodeId, info: PgInfoMsg) {
    pg.info.history.merge(&info.info.history);
    if pg.info.is_incomplete && info.info.last_update >= pg.log.head() {
        pg.info.last_update = info.info.last_update;
        pg.info.last_complete = info.info.last_update;
        pg.info.is_incomplete = false;
    }
    pg.dirty_info = true;
    ack_info(pg, ctx, from);
}

// ---------------------------------------------------------------- Primary

fn react_primary(
    pg: &mut PgInner,
    ctx: &mut ReactCtx<'_>,
    primary: Primary,
    event: PgEvent,
) -> Option<PgEvent> {
    match primary {
        Primary::Peering(peering) => react_peering(pg, ctx, peering, event),
        Primary::WaitActingChange => match event {
            // Parked: only a map change can help.
            PgEvent::LogMsg { .. } | PgEvent::InfoMsg { .. } | PgEvent::Notify { .. } => None,
            other => Some(other),
        },
        Primary::Active(active) => react_active(pg, ctx, active, event),
    }
}

fn react_peering(
    pg: &mut PgInner,
    ctx: &mut ReactCtx<'_>,
    peering: Peering,
    event: PgEvent,
) -> Option<PgEvent> {
    // Reactions shared by every peering substate.
    match event {
        PgEvent::Activate { query_epoch } => {
            enter_active(pg, ctx, query_epoch);
            return None;
        }
        PgEvent::IsIncomplete => {
            tracing::warn!(pgid = %pg.pgid, "no usable authoritative log; pg incomplete");
            pg.state =
                MachineState::Started(Started::Primary(Primary::Peering(Peering::Incomplete)));
            return None;
        }
        PgEvent::NeedActingChange => {
            pg.state = MachineState::Started(Started::Primary(Primary::WaitActingChange));
            return None;
        }
        _ => {}
    }

    match (peering, event) {
        (Peering::GetInfo, PgEvent::Notify { from, notify }) => {
            proc_replica_notify(pg, ctx, from, notify);
            maybe_got_all_infos(pg, ctx);
            None
        }
        (Peering::GetInfo, PgEvent::GotInfo) => {
            pg.state = MachineState::Started(Started::Primary(Primary::Peering(Peering::GetLog)));
            enter_get_log(pg, ctx);
            None
        }
        (Peering::GetLog, PgEvent::LogMsg { from, msg }) => {
            if Some(from) == pg.auth_log_source {
                pg.peer_log_requested.remove(&from);
                pg.pending_auth_log = Some((from, msg));
                ctx.post(PgEvent::GotLog);
            } else {
                tracing::debug!(pgid = %pg.pgid, from, "log from non-authoritative peer dropped");
            }
            None
        }
        (Peering::GetLog, PgEvent::GotLog) => {
            if let Some((from, msg)) = pg.pending_auth_log.take() {
                let PgLogMsg {
                    info,
                    log,
                    missing,
                    ..
                } = *msg;
                match reconcile::merge_log(pg, ctx, info.clone(), log, from) {
                    Ok(reconcile::MergeOutcome::Merged) => {
                        pg.peer_info.insert(from, info);
                        pg.peer_missing.insert(from, missing);
                        reconcile::search_for_missing(pg, from);
                    }
                    Ok(reconcile::MergeOutcome::NoOverlap) => {
                        ctx.post(PgEvent::IsIncomplete);
                        return None;
                    }
                    Err(fatal) => {
                        ctx.fatal = Some(fatal);
                        return None;
                    }
                }
            }
            pg.state =
                MachineState::Started(Started::Primary(Primary::Peering(Peering::GetMissing)));
            enter_get_missing(pg, ctx);
            None
        }
        (Peering::GetMissing, PgEvent::LogMsg { from, msg }) => {
            let PgLogMsg {
                info,
                log,
                missing,
                ..
            } = *msg;
            reconcile::proc_replica_log(pg, from, info, log, missing);
            pg.peer_missing_requested.remove(&from);
            if pg.peer_missing_requested.is_empty() {
                after_missing_collected(pg, ctx);
            }
            None
        }
        (Peering::GetMissing, PgEvent::NeedUpThru) => {
            pg.state =
                MachineState::Started(Started::Primary(Primary::Peering(Peering::WaitUpThru)));
            ctx.request_up_thru = Some(pg.map.epoch());
            None
        }
        (Peering::GetMissing | Peering::WaitUpThru, PgEvent::CheckRepops) => {
            pg.state = MachineState::Started(Started::Primary(Primary::Peering(
                Peering::WaitFlushedPeering,
            )));
            if pg.flushed {
                ctx.post(PgEvent::Flushed);
            } else {
                ctx.request_flush = true;
            }
            None
        }
        (Peering::WaitUpThru, PgEvent::ActMap) => {
            if pg.map.up_thru(pg.whoami) >= pg.info.history.same_interval_since {
                pg.need_up_thru = false;
                ctx.post(PgEvent::CheckRepops);
            }
            // Fall through for the notify side of ActMap is irrelevant on a
            // primary; consume the event.
            None
        }
        (Peering::WaitUpThru, PgEvent::LogMsg { from, msg }) => {
            let PgLogMsg {
                info,
                log,
                missing,
                ..
            } = *msg;
            reconcile::proc_replica_log(pg, from, info, log, missing);
            None
        }
        (Peering::WaitFlushedPeering, PgEvent::Flushed) => {
            pg.flushed = true;
            ctx.post(PgEvent::Activate {
                query_epoch: pg.map.epoch(),
            });
            None
        }
        (Peering::Incomplete, PgEvent::Notify { from, notify }) => {
            // A newly arrived info may make peering possible; retry.
            proc_replica_notify(pg, ctx, from, notify);
            restart_peering(pg, ctx);
            None
        }
        (_, other) => Some(other),
    }
}

fn react_active(
    pg: &mut PgInner,
    ctx: &mut ReactCtx<'_>,
    active: ActivePhase,
    event: PgEvent,
) -> Option<PgEvent> {
    // Reactions shared by every Active substate.
    match event {
        PgEvent::InfoMsg { from, info } => {
            activation_ack(pg, ctx, from, info);
            return None;
        }
        PgEvent::Notify { from, notify } => {
            proc_replica_notify(pg, ctx, from, notify);
            return None;
        }
        PgEvent::LogMsg { from, msg } => {
            // A late log (e.g. a stray answering a missing probe).
            let PgLogMsg {
                info,
                log,
                missing,
                ..
            } = *msg;
            reconcile::proc_replica_log(pg, from, info, log, missing);
            recovery::maybe_recovery_complete(pg, ctx);
            return None;
        }
        PgEvent::AllReplicasActivated => {
            pg.all_replicas_activated = true;
            tracing::info!(pgid = %pg.pgid, "all replicas activated");
            if matches!(
                pg.state,
                MachineState::Started(Started::Primary(Primary::Active(ActivePhase::Recovered)))
            ) {
                ctx.post(PgEvent::GoClean);
            } else {
                decide_recovery(pg, ctx);
            }
            return None;
        }
        _ => {}
    }

    match (active, event) {
        (ActivePhase::Activating, PgEvent::AllReplicasRecovered) => {
            enter_recovered(pg, ctx);
            None
        }
        (ActivePhase::Activating, PgEvent::DoRecovery) => {
            pg.state = MachineState::Started(Started::Primary(Primary::Active(
                ActivePhase::WaitLocalRecoveryReserved,
            )));
            ctx.local_reserve.push(ReserveKind::Recovery);
            None
        }
        (ActivePhase::Activating | ActivePhase::NotBackfilling, PgEvent::RequestBackfill) => {
            pg.state = MachineState::Started(Started::Primary(Primary::Active(
                ActivePhase::WaitLocalBackfillReserved,
            )));
            ctx.local_reserve.push(ReserveKind::Backfill);
            None
        }
        (ActivePhase::WaitLocalRecoveryReserved, PgEvent::LocalRecoveryReserved) => {
            pg.state = MachineState::Started(Started::Primary(Primary::Active(
                ActivePhase::WaitRemoteRecoveryReserved,
            )));
            enter_wait_remote_recovery(pg, ctx);
            None
        }
        (ActivePhase::WaitRemoteRecoveryReserved, PgEvent::RemoteRecoveryReserved { from }) => {
            pg.remote_recovery_granted.insert(from);
            let expected = pg.acting_minus_self();
            if expected
                .iter()
                .all(|peer| pg.remote_recovery_granted.contains(peer))
            {
                ctx.post(PgEvent::AllRemotesReserved);
            }
            None
        }
        (ActivePhase::WaitRemoteRecoveryReserved, PgEvent::AllRemotesReserved) => {
            pg.state =
                MachineState::Started(Started::Primary(Primary::Active(ActivePhase::Recovering)));
            recovery::start_recovery_ops(pg, ctx);
            recovery::maybe_recovery_complete(pg, ctx);
            None
        }
        (ActivePhase::Recovering, PgEvent::DoRecovery) => {
            // Kicked after missing-set changes (e.g. unfound marked lost).
            recovery::start_recovery_ops(pg, ctx);
            recovery::maybe_recovery_complete(pg, ctx);
            None
        }
        (ActivePhase::Recovering, PgEvent::Push { from, push }) => {
            recovery::handle_push_primary(pg, ctx, from, push);
            None
        }
        (ActivePhase::Recovering, PgEvent::PushReply { from, reply }) => {
            recovery::handle_push_reply(pg, ctx, from, reply);
            None
        }
        (ActivePhase::Recovering, PgEvent::AllReplicasRecovered) => {
            release_recovery_reservations(pg, ctx);
            enter_recovered(pg, ctx);
            None
        }
        (ActivePhase::Recovering, PgEvent::RequestBackfill) => {
            // Log-based recovery is done; the backfill target remains.
            release_recovery_reservations(pg, ctx);
            pg.state = MachineState::Started(Started::Primary(Primary::Active(
                ActivePhase::WaitLocalBackfillReserved,
            )));
            ctx.local_reserve.push(ReserveKind::Backfill);
            None
        }
        (ActivePhase::WaitLocalBackfillReserved, PgEvent::LocalBackfillReserved) => {
            pg.state = MachineState::Started(Started::Primary(Primary::Active(
                ActivePhase::WaitRemoteBackfillReserved,
            )));
            enter_wait_remote_backfill(pg, ctx);
            None
        }
        (ActivePhase::WaitRemoteBackfillReserved, PgEvent::RemoteBackfillReserved { .. }) => {
            pg.state =
                MachineState::Started(Started::Primary(Primary::Active(ActivePhase::Backfilling)));
            backfill::begin(pg, ctx);
            None
        }
        (ActivePhase::WaitRemoteBackfillReserved, PgEvent::RemoteReservationRejected { from }) => {
            tracing::info!(pgid = %pg.pgid, from, "backfill reservation rejected");
            ctx.local_release.push(ReserveKind::Backfill);
            pg.state = MachineState::Started(Started::Primary(Primary::Active(
                ActivePhase::NotBackfilling,
            )));
            None
        }
        (ActivePhase::NotBackfilling, PgEvent::ActMap) => {
            if pg.backfill_target.is_some() {
                ctx.post(PgEvent::RequestBackfill);
            }
            None
        }
        (ActivePhase::Backfilling, PgEvent::ScanResponse { from, interval }) => {
            backfill::handle_scan_response(pg, ctx, from, interval);
            None
        }
        (ActivePhase::Backfilling, PgEvent::PushReply { from, reply }) => {
            backfill::push_acked(pg, ctx, from, reply);
            None
        }
        (ActivePhase::Backfilling, PgEvent::RemoteReservationRejected { from }) => {
            // The target gave up (e.g. ran out of space) mid-backfill.
            tracing::warn!(pgid = %pg.pgid, from, "backfill target dropped reservation");
            ctx.local_release.push(ReserveKind::Backfill);
            pg.backfill.clear();
            pg.state = MachineState::Started(Started::Primary(Primary::Active(
                ActivePhase::NotBackfilling,
            )));
            None
        }
        (ActivePhase::Backfilling, PgEvent::Backfilled) => {
            finish_backfill(pg, ctx);
            enter_recovered(pg, ctx);
            None
        }
        (ActivePhase::Recovered, PgEvent::GoClean) => {
            enter_clean(pg, ctx);
            None
        }
        (ActivePhase::Clean, PgEvent::DoRecovery) => {
            // New missing objects (e.g. marked lost) can reopen recovery.
            pg.state = MachineState::Started(Started::Primary(Primary::Active(
                ActivePhase::WaitLocalRecoveryReserved,
            )));
            ctx.local_reserve.push(ReserveKind::Recovery);
            None
        }
        (_, PgEvent::PushReply { from, reply }) => {
            // Stragglers from a completed phase.
            tracing::debug!(pgid = %pg.pgid, from, oid = %reply.oid, "late push reply");
            None
        }
        (_, other) => Some(other),
    }
}

// ------------------------------------------------------ transition actions

fn enter_start(pg: &mut PgInner, ctx: &mut ReactCtx<'_>) {
    pg.state = MachineState::Started(Started::Start);
    match pg.role {
        Role::Primary => ctx.post(PgEvent::MakePrimary),
        Role::Replica(_) | Role::Stray => ctx.post(PgEvent::MakeStray),
    }
}

fn enter_get_info(pg: &mut PgInner, ctx: &mut ReactCtx<'_>) {
    let prior = PriorSet::build(&pg.map, &pg.past_intervals, &pg.up, &pg.acting, &pg.info);
    pg.need_up_thru = pg.map.up_thru(pg.whoami) < pg.info.history.same_interval_since;

    pg.peer_info_requested.clear();
    for &peer in &prior.probe {
        if peer == pg.whoami {
            continue;
        }
        pg.peer_info_requested.insert(peer);
        let message = Message::Query(PgQuery {
            kind: QueryKind::Info,
            history: pg.info.history,
            epoch: pg.map.epoch(),
        });
        ctx.send(peer, message);
    }
    pg.update_heartbeat_peers(&prior);
    pg.prior_set = Some(prior);
    maybe_got_all_infos(pg, ctx);
}

fn maybe_got_all_infos(pg: &mut PgInner, ctx: &mut ReactCtx<'_>) {
    if !matches!(
        pg.state,
        MachineState::Started(Started::Primary(Primary::Peering(Peering::GetInfo)))
    ) {
        return;
    }
    let pg_down = pg
        .prior_set
        .as_ref()
        .map(|prior| prior.pg_down)
        .unwrap_or(false);
    if pg_down {
        // Stalled until a down prior peer returns or is marked lost.
        return;
    }
    if pg.peer_info_requested.is_empty() {
        ctx.post(PgEvent::GotInfo);
    }
}

fn enter_get_log(pg: &mut PgInner, ctx: &mut ReactCtx<'_>) {
    match reconcile::find_best_info(pg) {
        None => ctx.post(PgEvent::IsIncomplete),
        Some(best) if best == pg.whoami => {
            pg.auth_log_source = None;
            ctx.post(PgEvent::GotLog);
        }
        Some(best) => {
            let best_info = &pg.peer_info[&best];
            if pg.info.last_update < best_info.log_tail {
                // Our own log cannot reach the authoritative one; a peer
                // with better history must take over as primary.
                ctx.post(PgEvent::NeedActingChange);
                return;
            }
            pg.auth_log_source = Some(best);
            pg.peer_log_requested.insert(best);
            let message = Message::Query(PgQuery {
                kind: QueryKind::Log {
                    since: pg.info.last_update,
                },
                history: pg.info.history,
                epoch: pg.map.epoch(),
            });
            ctx.send(best, message);
        }
    }
}

fn enter_get_missing(pg: &mut PgInner, ctx: &mut ReactCtx<'_>) {
    pg.peer_missing_requested.clear();
    let peers = pg.acting_minus_self();
    for peer in peers {
        let Some(peer_info) = pg.peer_info.get(&peer).cloned() else {
            // Never replied to GetInfo, so it cannot have been admitted to
            // the acting set this interval. Defensive skip.
            continue;
        };
        if peer_info.last_update < pg.log.tail() {
            // Its log fell out of our overlap entirely: ranged backfill.
            tracing::info!(pgid = %pg.pgid, peer, "peer requires backfill");
            pg.backfill_target = Some(peer);
            pg.peer_missing.insert(peer, Default::default());
            continue;
        }
        if pg.peer_missing.contains_key(&peer) {
            // Already learned everything during GetLog.
            continue;
        }
        if peer_info.last_update == pg.info.last_update
            && peer_info.last_complete == peer_info.last_update
        {
            // Fully caught up and fully applied; nothing can be missing.
            pg.peer_missing.insert(peer, Default::default());
            reconcile::search_for_missing(pg, peer);
            continue;
        }
        // Ask for its log from the epoch it last started serving in:
        // everything below that is guaranteed agreed, everything above may
        // be missing or divergent. The reply also carries its own missing
        // set.
        let epoch_base = Eversion::new(peer_info.history.last_epoch_started, 0);
        let since = if peer_info.last_update <= epoch_base {
            peer_info.last_update
        } else {
            epoch_base
        };
        pg.peer_missing_requested.insert(peer);
        let message = Message::Query(PgQuery {
            kind: QueryKind::Log { since },
            history: pg.info.history,
            epoch: pg.map.epoch(),
        });
        ctx.send(peer, message);
    }
    if pg.peer_missing_requested.is_empty() {
        after_missing_collected(pg, ctx);
    }
}

fn after_missing_collected(pg: &mut PgInner, ctx: &mut ReactCtx<'_>) {
    if pg.need_up_thru {
        ctx.post(PgEvent::NeedUpThru);
    } else {
        ctx.post(PgEvent::CheckRepops);
    }
}

fn enter_active(pg: &mut PgInner, ctx: &mut ReactCtx<'_>, query_epoch: Epoch) {
    tracing::info!(pgid = %pg.pgid, epoch = query_epoch, "activating");
    pg.state = MachineState::Started(Started::Primary(Primary::Active(ActivePhase::Activating)));
    pg.info.history.last_epoch_started = pg.map.epoch();
    pg.dirty_info = true;
    pg.all_replicas_activated = false;
    pg.peer_activated.clear();

    // Give every acting replica what it needs to adopt our history: the
    // whole log for a backfill target, the suffix for a laggard, bare info
    // for a current replica.
    for peer in pg.acting_minus_self() {
        let peer_last_update = pg.peer_info.get(&peer).map(|info| info.last_update);
        let message = if pg.backfill_target == Some(peer) {
            Message::Log(Box::new(PgLogMsg {
                info: pg.info.clone(),
                log: pg.log.bundle(),
                missing: pg.missing.clone(),
                query_epoch,
                epoch: pg.map.epoch(),
            }))
        } else if peer_last_update.is_some_and(|last_update| last_update < pg.info.last_update) {
            Message::Log(Box::new(PgLogMsg {
                info: pg.info.clone(),
                log: pg
                    .log
                    .bundle_since(peer_last_update.expect("checked by is_some_and")),
                missing: pg.missing.clone(),
                query_epoch,
                epoch: pg.map.epoch(),
            }))
        } else {
            Message::Info(PgInfoMsg {
                info: pg.info.clone(),
                epoch: pg.map.epoch(),
            })
        };
        ctx.send(peer, message);
    }

    // Recovery sources: the acting set plus anyone who answered our probes.
    pg.missing_loc.clear();
    for peer in pg.acting_minus_self() {
        pg.missing_loc.add_source(peer);
        reconcile::search_for_missing(pg, peer);
    }
    let known: Vec<NodeId> = pg.peer_info.keys().copied().collect();
    for peer in known {
        if !pg.acting.contains(&peer) {
            pg.might_have_unfound.insert(peer);
            pg.missing_loc.add_source(peer);
            reconcile::search_for_missing(pg, peer);
        }
    }
    reconcile::update_last_complete(pg);

    if pg.acting_minus_self().is_empty() {
        ctx.post(PgEvent::AllReplicasActivated);
    }
}

fn activation_ack(
    pg: &mut PgInner,
    ctx: &mut ReactCtx<'_>,
    from: NodeId,
    info: PgInfoMsg,
) {
    pg.peer_info.insert(from, info.info);
    if pg.peer_activated.insert(from) {
        tracing::debug!(pgid = %pg.pgid, from, "replica activation ack");
    }
    let expected = pg.acting_minus_self();
    if !pg.all_replicas_activated
        && expected.iter().all(|peer| pg.peer_activated.contains(peer))
    {
        ctx.post(PgEvent::AllReplicasActivated);
    }
}

/// Chooses the Active substate once activation acks are in.
fn decide_recovery(pg: &mut PgInner, ctx: &mut ReactCtx<'_>) {
    if !matches!(
        pg.state,
        MachineState::Started(Started::Primary(Primary::Active(ActivePhase::Activating)))
    ) {
        return;
    }
    let peers_missing = pg
        .peer_missing
        .values()
        .any(|missing| !missing.is_empty());
    if pg.missing.is_empty() && !peers_missing && pg.backfill_target.is_none() {
        ctx.post(PgEvent::AllReplicasRecovered);
    } else if !pg.missing.is_empty() || peers_missing {
        ctx.post(PgEvent::DoRecovery);
    } else {
        ctx.post(PgEvent::RequestBackfill);
    }
}

fn enter_wait_remote_recovery(pg: &mut PgInner, ctx: &mut ReactCtx<'_>) {
    pg.remote_recovery_granted.clear();
    let peers = pg.acting_minus_self();
    if peers.is_empty() {
        ctx.post(PgEvent::AllRemotesReserved);
        return;
    }
    for peer in peers {
        ctx.send(
            peer,
            Message::RecoveryReserve(RecoveryReserve {
                op: RecoveryReserveOp::Request,
                epoch: pg.map.epoch(),
            }),
        );
    }
}

fn enter_wait_remote_backfill(pg: &mut PgInner, ctx: &mut ReactCtx<'_>) {
    let Some(target) = pg.backfill_target else {
        // Nothing left to backfill after all; treat as done.
        ctx.local_release.push(ReserveKind::Backfill);
        enter_recovered(pg, ctx);
        return;
    };
    ctx.send(
        target,
        Message::BackfillReserve(BackfillReserve {
            op: ReserveOp::Request,
            epoch: pg.map.epoch(),
        }),
    );
}

fn release_recovery_reservations(pg: &mut PgInner, ctx: &mut ReactCtx<'_>) {
    ctx.local_release.push(ReserveKind::Recovery);
    for peer in std::mem::take(&mut pg.remote_recovery_granted) {
        ctx.send(
            peer,
            Message::RecoveryReserve(RecoveryReserve {
                op: RecoveryReserveOp::Release,
                epoch: pg.map.epoch(),
            }),
        );
    }
}

fn finish_backfill(pg: &mut PgInner, ctx: &mut ReactCtx<'_>) {
    let Some(target) = pg.backfill_target.take() else {
        return;
    };
    tracing::info!(pgid = %pg.pgid, target, "backfill complete");
    ctx.send(
        target,
        Message::BackfillReserve(BackfillReserve {
            op: ReserveOp::Release,
            epoch: pg.map.epoch(),
        }),
    );
    // The target's metadata becomes authoritative again.
    ctx.send(
        target,
        Message::Info(PgInfoMsg {
            info: pg.info.clone(),
            epoch: pg.map.epoch(),
        }),
    );
    ctx.local_release.push(ReserveKind::Backfill);
    pg.backfill.clear();
    if let Some(peer_missing) = pg.peer_missing.get_mut(&target) {
        *peer_missing = Default::default();
    }
}

fn enter_recovered(pg: &mut PgInner, ctx: &mut ReactCtx<'_>) {
    pg.state = MachineState::Started(Started::Primary(Primary::Active(ActivePhase::Recovered)));
    if pg.all_replicas_activated {
        ctx.post(PgEvent::GoClean);
    }
}

fn enter_clean(pg: &mut PgInner, ctx: &mut ReactCtx<'_>) {
    tracing::info!(pgid = %pg.pgid, "clean");
    pg.state = MachineState::Started(Started::Primary(Primary::Active(ActivePhase::Clean)));
    pg.info.history.last_epoch_clean = pg.map.epoch();
    pg.dirty_info = true;

    // Strays served their purpose; their copies can go.
    for stray in std::mem::take(&mut pg.stray_set) {
        if !pg.acting.contains(&stray) {
            ctx.send(
                stray,
                Message::Purge(PgPurge {
                    epoch: pg.map.epoch(),
                }),
            );
        }
    }
    pg.might_have_unfound.clear();

    // Now that every replica is whole, the tail can come in.
    let keep = pg.config_log_keep;
    if pg.log.len() as u64 > keep {
        let entries: Vec<_> = pg.log.entries().map(|e| e.version).collect();
        let cut_index = entries.len() - keep as usize;
        let cut = entries[cut_index.saturating_sub(1)];
        let trim_to = cut.min(pg.info.last_complete);
        if trim_to > pg.log.tail() {
            pg.log.trim_tail(trim_to);
            pg.info.log_tail = trim_to;
            pg.dirty_log = true;
        }
    }
    pg.past_intervals.trim_below(pg.info.history.last_epoch_started);
}

// ---------------------------------------------------------- shared actions

fn send_notify_to_primary(pg: &mut PgInner, ctx: &mut ReactCtx<'_>) {
    let Some(primary) = pg.primary() else {
        return;
    };
    if primary == pg.whoami {
        return;
    }
    ctx.send(
        primary,
        Message::Notify(PgNotify {
            info: pg.info.clone(),
            query_epoch: pg.map.epoch(),
            epoch: pg.map.epoch(),
        }),
    );
}

fn fulfill_query(pg: &mut PgInner, ctx: &mut ReactCtx<'_>, from: NodeId, query: PgQuery) {
    if pg.info.history.merge(&query.history) {
        pg.dirty_info = true;
    }
    match query.kind {
        QueryKind::Info => {
            ctx.send(
                from,
                Message::Notify(PgNotify {
                    info: pg.info.clone(),
                    query_epoch: query.epoch,
                    epoch: pg.map.epoch(),
                }),
            );
        }
        QueryKind::Log { since } => {
            let log = if since >= pg.log.tail() {
                pg.log.bundle_since(since)
            } else {
                pg.log.bundle()
            };
            ctx.send(
                from,
                Message::Log(Box::new(PgLogMsg {
                    info: pg.info.clone(),
                    log,
                    missing: pg.missing.clone(),
                    query_epoch: query.epoch,
                    epoch: pg.map.epoch(),
                })),
            );
        }
        QueryKind::FullLog => {
            ctx.send(
                from,
                Message::Log(Box::new(PgLogMsg {
                    info: pg.info.clone(),
                    log: pg.log.bundle(),
                    missing: pg.missing.clone(),
                    query_epoch: query.epoch,
                    epoch: pg.map.epoch(),
                })),
            );
        }
    }
}

fn proc_replica_notify(
    pg: &mut PgInner,
    _ctx: &mut ReactCtx<'_>,
    from: NodeId,
    notify: PgNotify,
) {
    if pg.info.history.merge(&notify.info.history) {
        pg.dirty_info = true;
    }
    pg.peer_info.insert(from, notify.info);
    pg.peer_info_requested.remove(&from);
    if !pg.acting.contains(&from) && !pg.up.contains(&from) {
        pg.stray_set.insert(from);
    }
    if pg.state.is_active() {
        // A stray appearing mid-recovery may hold unfound objects.
        pg.missing_loc.add_source(from);
        reconcile::search_for_missing(pg, from);
    }
}

fn handle_purge(pg: &mut PgInner, ctx: &mut ReactCtx<'_>, from: NodeId) {
    if pg.acting.contains(&pg.whoami) {
        tracing::warn!(pgid = %pg.pgid, from, "purge for an acting member ignored");
        return;
    }
    tracing::info!(pgid = %pg.pgid, from, "purging stray pg");
    ctx.txn.remove_collection(pg.pgid);
    pg.deleting = true;
}

/// Updates membership from a new map. Closes the current interval when the
/// acting or up set changed; the caller decides whether peering restarts.
fn advance_map(
    pg: &mut PgInner,
    _ctx: &mut ReactCtx<'_>,
    map: std::sync::Arc<crate::cluster_map::ClusterMap>,
    last_map: std::sync::Arc<crate::cluster_map::ClusterMap>,
    new_up: Vec<NodeId>,
    new_acting: Vec<NodeId>,
) {
    let old_up = std::mem::take(&mut pg.up);
    let old_acting = std::mem::take(&mut pg.acting);
    let up_changed = old_up != new_up;
    let primary_changed = old_acting.first() != new_acting.first();

    if up_changed || old_acting != new_acting {
        let first = pg.info.history.same_interval_since;
        let last = map.epoch().saturating_sub(1);
        if first != 0 && first <= last && !old_acting.is_empty() {
            let old_primary = old_acting[0];
            let maybe_went_rw = last_map.up_thru(old_primary) >= first
                && last_map.up_from(old_primary) <= first;
            pg.past_intervals.add(PastInterval {
                first,
                last,
                up: old_up,
                acting: old_acting,
                maybe_went_rw,
            });
            pg.dirty_info = true;
        }
        pg.info.history.same_interval_since = map.epoch();
        if up_changed {
            pg.info.history.same_up_since = map.epoch();
        }
        if primary_changed {
            pg.info.history.same_primary_since = map.epoch();
        }
    }

    pg.up = new_up;
    pg.acting = new_acting;
    pg.role = if pg.acting.first() == Some(&pg.whoami) {
        Role::Primary
    } else if let Some(index) = pg.acting.iter().position(|&n| n == pg.whoami) {
        Role::Replica(index)
    } else {
        Role::Stray
    };
    pg.send_notify = !matches!(pg.role, Role::Primary);
    pg.map = map;
}

/// Drops all in-flight peering work and parks the machine in `Reset`; the
/// next `ActMap` starts over. This is the universal cancellation path.
pub(crate) fn restart_peering(pg: &mut PgInner, ctx: &mut ReactCtx<'_>) {
    tracing::debug!(pgid = %pg.pgid, epoch = pg.map.epoch(), "peering reset");
    pg.last_peering_reset = pg.map.epoch();

    pg.peer_info.clear();
    pg.peer_missing.clear();
    pg.peer_info_requested.clear();
    pg.peer_log_requested.clear();
    pg.peer_missing_requested.clear();
    pg.peer_activated.clear();
    pg.might_have_unfound.clear();
    pg.prior_set = None;
    pg.auth_log_source = None;
    pg.pending_auth_log = None;
    pg.backfill_target = None;
    pg.backfill.clear();
    pg.recovery.clear();
    pg.remote_recovery_granted.clear();
    pg.missing_loc.clear();
    pg.all_replicas_activated = false;
    pg.flushed = false;

    // Every local slot we might hold or be queued for is returned; releasing
    // an unheld slot is a no-op, so this is safe on every path.
    ctx.local_release.push(ReserveKind::Backfill);
    ctx.local_release.push(ReserveKind::Recovery);
    pg.replica_reservation = None;

    pg.state = MachineState::Reset;
}

fn crash(pg: &mut PgInner, ctx: &mut ReactCtx<'_>, event: &PgEvent) {
    tracing::error!(
        pgid = %pg.pgid,
        state = %pg.state,
        event = event.name(),
        "unexpected event; pg machine crashed",
    );
    // Crashing must not leak reservation slots.
    ctx.local_release.push(ReserveKind::Backfill);
    ctx.local_release.push(ReserveKind::Recovery);
    pg.replica_reservation = None;
    pg.state = MachineState::Crashed;
}

//! Object-by-object recovery: the primary pulls what it is missing, then
//! pushes what each replica is missing, bounded by the per-PG op limit.
//!
//! Pull order follows the missing set's need-version order starting at the
//! log's completion cursor, so `last_complete` advances as objects land.

use atoll_core::messages::{Message, PgPull, PgPush, PgPushReply};
use atoll_core::{NodeId, ObjectId};

use crate::peering::{PgEvent, ReactCtx};
use crate::pg::PgInner;
use crate::reconcile;

/// In-flight recovery bookkeeping for one PG.
#[derive(Debug, Default)]
pub struct RecoveryOps {
    /// Pulls and pushes currently outstanding.
    pub active: usize,
    /// Replica pushes awaiting acknowledgement.
    pub pushing: std::collections::BTreeSet<(NodeId, ObjectId)>,
}

impl RecoveryOps {
    pub fn clear(&mut self) {
        self.active = 0;
        self.pushing.clear();
    }
}

/// Starts as many recovery operations as the op budget allows. The primary's
/// own copies come first; replicas are filled once the local set is drained
/// of everything findable.
pub(crate) fn start_recovery_ops(pg: &mut PgInner, ctx: &mut ReactCtx<'_>) {
    let budget = pg.config_max_recovery_ops;

    // Pull what we are missing ourselves, oldest need first.
    loop {
        if pg.recovery.active >= budget {
            return;
        }
        let next = pg
            .missing
            .in_need_order()
            .find(|(need, oid)| {
                **need > pg.log.last_requested && pg.missing_loc.any_source_of(oid).is_some()
            })
            .map(|(need, oid)| (*need, oid.clone()));
        let Some((need, oid)) = next else {
            break;
        };
        let source = pg
            .missing_loc
            .any_source_of(&oid)
            .expect("filtered on a known source above");
        tracing::debug!(pgid = %pg.pgid, %oid, %need, source, "pulling missing object");
        ctx.send(
            source,
            Message::Pull(PgPull {
                oid,
                need,
                epoch: pg.map.epoch(),
            }),
        );
        pg.recovery.active += 1;
        pg.log.last_requested = need;
    }

    if !pg.local_missing_drained() {
        return;
    }

    // Push what replicas are missing and we hold. Objects whose newest
    // authoritative entry is a delete or lost-mark are propagated as
    // removals instead.
    let mut pushes = Vec::new();
    let mut removals: Vec<(NodeId, ObjectId, atoll_core::Eversion)> = Vec::new();
    for (&peer, peer_missing) in &pg.peer_missing {
        if pg.backfill_target == Some(peer) {
            continue;
        }
        for (_, oid) in peer_missing.in_need_order() {
            if pg.recovery.pushing.contains(&(peer, oid.clone())) {
                continue;
            }
            match pg.log.newest_for(oid) {
                Some(auth) if !auth.kind.is_update() => {
                    removals.push((peer, oid.clone(), auth.version));
                }
                _ if pg.missing.is_missing(oid) => {}
                _ => pushes.push((peer, oid.clone())),
            }
        }
    }
    for (peer, oid, version) in removals {
        ctx.send(
            peer,
            Message::Remove(atoll_core::messages::PgRemove {
                oids: vec![oid.clone()],
                epoch: pg.map.epoch(),
            }),
        );
        if let Some(peer_missing) = pg.peer_missing.get_mut(&peer) {
            peer_missing.rm(&oid, version);
        }
    }
    for (peer, oid) in pushes {
        if pg.recovery.active >= budget {
            return;
        }
        let Some((version, data)) = ctx.store.read(pg.pgid, &oid) else {
            tracing::warn!(pgid = %pg.pgid, %oid, "object expected locally is absent; skipping push");
            continue;
        };
        tracing::debug!(pgid = %pg.pgid, %oid, %version, peer, "pushing object to replica");
        ctx.send(
            peer,
            Message::Push(PgPush {
                oid: oid.clone(),
                version,
                data,
                epoch: pg.map.epoch(),
            }),
        );
        pg.recovery.pushing.insert((peer, oid));
        pg.recovery.active += 1;
    }
}

/// Serves a pull: any node still holding the object answers with a push.
pub(crate) fn handle_pull(pg: &mut PgInner, ctx: &mut ReactCtx<'_>, from: NodeId, pull: PgPull) {
    match ctx.store.read(pg.pgid, &pull.oid) {
        Some((version, data)) => {
            ctx.send(
                from,
                Message::Push(PgPush {
                    oid: pull.oid,
                    version,
                    data,
                    epoch: pg.map.epoch(),
                }),
            );
        }
        None => {
            tracing::warn!(pgid = %pg.pgid, oid = %pull.oid, from, "pulled object not present here");
        }
    }
}

/// The primary received an object it pulled.
pub(crate) fn handle_push_primary(
    pg: &mut PgInner,
    ctx: &mut ReactCtx<'_>,
    from: NodeId,
    push: PgPush,
) {
    tracing::debug!(pgid = %pg.pgid, oid = %push.oid, version = %push.version, from, "pulled object arrived");
    ctx.txn.put(pg.pgid, push.oid.clone(), push.version, push.data);
    pg.missing.got(&push.oid, push.version);
    reconcile::update_last_complete(pg);
    pg.dirty_info = true;
    pg.recovery.active = pg.recovery.active.saturating_sub(1);
    start_recovery_ops(pg, ctx);
    maybe_recovery_complete(pg, ctx);
}

/// A replica received an object pushed by the primary (recovery or
/// backfill); it applies the write and acknowledges stability.
pub(crate) fn handle_push_replica(
    pg: &mut PgInner,
    ctx: &mut ReactCtx<'_>,
    from: NodeId,
    push: PgPush,
) {
    ctx.txn
        .put(pg.pgid, push.oid.clone(), push.version, push.data);
    pg.missing.got(&push.oid, push.version);
    reconcile::update_last_complete(pg);
    pg.dirty_info = true;
    ctx.send(
        from,
        Message::PushReply(PgPushReply {
            oid: push.oid,
            version: push.version,
            epoch: pg.map.epoch(),
        }),
    );
}

/// The primary learned a push is stable on a replica.
pub(crate) fn handle_push_reply(
    pg: &mut PgInner,
    ctx: &mut ReactCtx<'_>,
    from: NodeId,
    reply: PgPushReply,
) {
    if let Some(peer_missing) = pg.peer_missing.get_mut(&from) {
        peer_missing.got(&reply.oid, reply.version);
    }
    pg.recovery.pushing.remove(&(from, reply.oid));
    pg.recovery.active = pg.recovery.active.saturating_sub(1);
    start_recovery_ops(pg, ctx);
    maybe_recovery_complete(pg, ctx);
}

/// Posts the appropriate completion event once nothing recoverable remains:
/// `RequestBackfill` when a ranged target still waits, otherwise
/// `AllReplicasRecovered`. Unfound objects keep the PG in `Recovering`.
pub(crate) fn maybe_recovery_complete(pg: &mut PgInner, ctx: &mut ReactCtx<'_>) {
    use crate::peering::{ActivePhase, MachineState, Primary, Started};
    if !matches!(
        pg.state,
        MachineState::Started(Started::Primary(Primary::Active(ActivePhase::Recovering)))
    ) {
        return;
    }
    if pg.recovery.active > 0 || !pg.missing.is_empty() {
        return;
    }
    let replicas_missing = pg
        .peer_missing
        .iter()
        .any(|(peer, missing)| pg.backfill_target != Some(*peer) && !missing.is_empty());
    if replicas_missing {
        return;
    }
    if pg.backfill_target.is_some() {
        ctx.post(PgEvent::RequestBackfill);
    } else {
        ctx.post(PgEvent::AllReplicasRecovered);
    }
}

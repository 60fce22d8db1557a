//! Ranged backfill: rebuilding a replica whose log fell out of overlap by
//! sweeping the object space in bounded rounds.
//!
//! Each round scans the local collection from the current position, asks the
//! target for its view of the same range, pushes objects the target lacks or
//! holds stale, removes objects it should no longer have, then advances past
//! the shorter of the two scans. The sweep is done when both sides report
//! their scan extends to the end of the namespace and every push is acked.

use std::collections::BTreeSet;

use atoll_core::backfill::BackfillInterval;
use atoll_core::messages::{Message, PgPush, PgPushReply, PgRemove, PgScan};
use atoll_core::{NodeId, ObjectId};

use crate::peering::{PgEvent, ReactCtx};
use crate::pg::PgInner;

/// Sweep state for the active backfill, if any.
#[derive(Debug, Default)]
pub struct BackfillState {
    /// Next object position to scan from.
    pub pos: ObjectId,
    pub local: BackfillInterval,
    pub peer: BackfillInterval,
    /// Pushes sent this round, not yet acked by the target.
    pub pending: BTreeSet<ObjectId>,
    pub peer_scan_in_flight: bool,
}

impl BackfillState {
    pub fn clear(&mut self) {
        *self = Self::default();
    }
}

/// Starts the sweep from the beginning of the object space.
pub(crate) fn begin(pg: &mut PgInner, ctx: &mut ReactCtx<'_>) {
    pg.backfill.clear();
    tracing::info!(pgid = %pg.pgid, target = ?pg.backfill_target, "backfill starting");
    continue_round(pg, ctx);
}

/// Runs one round: scan locally, ask the target for the same range.
pub(crate) fn continue_round(pg: &mut PgInner, ctx: &mut ReactCtx<'_>) {
    let Some(target) = pg.backfill_target else {
        return;
    };
    let max = pg.config_backfill_scan_max;

    let (objects, end) = ctx.store.scan_range(pg.pgid, &pg.backfill.pos, max);
    pg.backfill.local = BackfillInterval {
        begin: pg.backfill.pos.clone(),
        end,
        objects: objects.into_iter().collect(),
    };

    pg.backfill.peer_scan_in_flight = true;
    ctx.send(
        target,
        Message::Scan(PgScan::Request {
            begin: pg.backfill.pos.clone(),
            max: max as u32,
            epoch: pg.map.epoch(),
        }),
    );
}

/// Target side: enumerate our objects over the requested range.
pub(crate) fn handle_scan_request(
    pg: &mut PgInner,
    ctx: &mut ReactCtx<'_>,
    from: NodeId,
    begin: ObjectId,
    max: usize,
) {
    let (objects, end) = ctx.store.scan_range(pg.pgid, &begin, max);
    ctx.send(
        from,
        Message::Scan(PgScan::Response {
            interval: BackfillInterval {
                begin,
                end,
                objects: objects.into_iter().collect(),
            },
            epoch: pg.map.epoch(),
        }),
    );
}

/// Primary side: the target's interval arrived; diff the round.
pub(crate) fn handle_scan_response(
    pg: &mut PgInner,
    ctx: &mut ReactCtx<'_>,
    from: NodeId,
    interval: BackfillInterval,
) {
    if pg.backfill_target != Some(from) || !pg.backfill.peer_scan_in_flight {
        tracing::debug!(pgid = %pg.pgid, from, "unexpected backfill scan response dropped");
        return;
    }
    pg.backfill.peer_scan_in_flight = false;
    pg.backfill.peer = interval;

    let bound = ordered_min(&pg.backfill.local.end, &pg.backfill.peer.end);

    // Push anything the target lacks or holds at the wrong version.
    let mut pushes = Vec::new();
    for (oid, version) in &pg.backfill.local.objects {
        if *oid >= bound && !bound.is_max() {
            continue;
        }
        if pg.backfill.peer.objects.get(oid) != Some(version) {
            pushes.push(oid.clone());
        }
    }
    // Remove anything the target holds that no longer exists.
    let mut removes = Vec::new();
    for oid in pg.backfill.peer.objects.keys() {
        if *oid >= bound && !bound.is_max() {
            continue;
        }
        if !pg.backfill.local.objects.contains_key(oid) {
            removes.push(oid.clone());
        }
    }

    for oid in pushes {
        let Some((version, data)) = ctx.store.read(pg.pgid, &oid) else {
            // Raced a deletion between scan and read.
            continue;
        };
        ctx.send(
            from,
            Message::Push(PgPush {
                oid: oid.clone(),
                version,
                data,
                epoch: pg.map.epoch(),
            }),
        );
        pg.backfill.pending.insert(oid);
    }
    if !removes.is_empty() {
        ctx.send(
            from,
            Message::Remove(PgRemove {
                oids: removes,
                epoch: pg.map.epoch(),
            }),
        );
    }

    pg.backfill.pos = bound;
    maybe_round_done(pg, ctx);
}

/// Target acked one pushed object.
pub(crate) fn push_acked(
    pg: &mut PgInner,
    ctx: &mut ReactCtx<'_>,
    from: NodeId,
    reply: PgPushReply,
) {
    if pg.backfill_target != Some(from) {
        return;
    }
    pg.backfill.pending.remove(&reply.oid);
    maybe_round_done(pg, ctx);
}

/// Target side: drop objects the primary says are gone.
pub(crate) fn handle_remove(pg: &mut PgInner, ctx: &mut ReactCtx<'_>, oids: Vec<ObjectId>) {
    for oid in oids {
        let version = pg.log.head();
        pg.missing.rm(&oid, version);
        ctx.txn.remove(pg.pgid, oid);
    }
}

fn maybe_round_done(pg: &mut PgInner, ctx: &mut ReactCtx<'_>) {
    if !pg.backfill.pending.is_empty() || pg.backfill.peer_scan_in_flight {
        return;
    }
    if pg.backfill.local.extends_to_end() && pg.backfill.peer.extends_to_end() {
        ctx.post(PgEvent::Backfilled);
    } else {
        continue_round(pg, ctx);
    }
}

/// The smaller of two range ends, where [`ObjectId::MAX`] is the largest.
fn ordered_min(a: &ObjectId, b: &ObjectId) -> ObjectId {
    if a <= b {
        a.clone()
    } else {
        b.clone()
    }
}

//! Log reconciliation: choosing the authoritative history and folding peer
//! logs into the local one.
//!
//! All mutations of the local log, missing set, and info performed here
//! belong to the single transaction the control block commits after the
//! event that triggered them.

use atoll_core::info::PgInfo;
use atoll_core::log::LogBundle;
use atoll_core::missing::MissingSet;
use atoll_core::{Eversion, NodeId};

use crate::errors::PgFatalError;
use crate::peering::ReactCtx;
use crate::pg::PgInner;

/// Result of [`merge_log`]: either the peer log was folded in, or it shares
/// no overlap with ours and this replica must be rebuilt by backfill.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum MergeOutcome {
    Merged,
    NoOverlap,
}

/// Picks the peer (or ourselves) whose log should serve as the source of
/// truth: greatest `(last_update, last_epoch_started)`, then the longer tail,
/// then the lowest id. Incomplete replicas are never authoritative.
pub(crate) fn find_best_info(pg: &PgInner) -> Option<NodeId> {
    let mut best: Option<(NodeId, &PgInfo)> = None;
    let candidates =
        std::iter::once((pg.whoami, &pg.info)).chain(pg.peer_info.iter().map(|(&id, info)| (id, info)));
    for (id, info) in candidates {
        if info.is_incomplete {
            continue;
        }
        let better = match best {
            None => true,
            Some((best_id, best_info)) => {
                let lhs = (info.last_update, info.history.last_epoch_started);
                let rhs = (best_info.last_update, best_info.history.last_epoch_started);
                lhs > rhs
                    || (lhs == rhs && info.log_tail < best_info.log_tail)
                    || (lhs == rhs && info.log_tail == best_info.log_tail && id < best_id)
            }
        };
        if better {
            best = Some((id, info));
        }
    }
    best.map(|(id, _)| id)
}

/// Folds the authoritative log `(oinfo, olog)` from `from` into the local
/// state, per the peering contract:
///
/// 1. no shared overlap → the caller must backfill instead;
/// 2. the merge point is the newest version at which both logs agree on
///    `(oid, reqid, kind)`. Local entries beyond it are divergent: rewound,
///    and their objects re-resolved against the authoritative history.
///    Disagreement *below* an agreeing entry means the logs describe
///    impossible histories: a fatal protocol error;
/// 3. authoritative entries beyond the merge point are appended, marking
///    their objects missing locally.
///
/// Idempotent: merging the same log twice leaves the same state.
pub(crate) fn merge_log(
    pg: &mut PgInner,
    ctx: &mut ReactCtx<'_>,
    oinfo: PgInfo,
    olog: LogBundle,
    from: NodeId,
) -> Result<MergeOutcome, PgFatalError> {
    if olog.tail > pg.log.head() {
        tracing::info!(
            pgid = %pg.pgid,
            from,
            olog_tail = %olog.tail,
            local_head = %pg.log.head(),
            "no log overlap with authoritative peer",
        );
        return Ok(MergeOutcome::NoOverlap);
    }

    // Find the merge point: scan the authoritative entries we share a
    // version range with, in order, tracking the newest agreement.
    let overlap_hi = pg.log.head().min(olog.head);
    let mut split: Option<Eversion> = None;
    let mut first_mismatch: Option<Eversion> = None;
    for entry in olog.entries.iter().filter(|e| e.version <= overlap_hi) {
        let agrees = pg.log.entry_at(entry.version).is_some_and(|local| {
            local.oid == entry.oid && local.reqid == entry.reqid && local.kind == entry.kind
        });
        if agrees {
            if let Some(mismatch) = first_mismatch {
                // Agreement above a disagreement cannot happen under a
                // single sequence of primaries.
                let local = pg
                    .log
                    .entry_at(mismatch)
                    .map(|e| e.to_string())
                    .unwrap_or_else(|| "<absent>".to_owned());
                let remote = olog
                    .entries
                    .iter()
                    .find(|e| e.version == mismatch)
                    .map(|e| e.to_string())
                    .unwrap_or_else(|| "<absent>".to_owned());
                return Err(PgFatalError::ProtocolDivergence {
                    from,
                    version: mismatch,
                    local,
                    remote,
                });
            }
            split = Some(entry.version);
        } else {
            first_mismatch.get_or_insert(entry.version);
        }
    }
    let merge_point = split.unwrap_or_else(|| {
        // Nothing shared: either the logs are adjacent (merge at our head)
        // or everything in the shared range is divergent (rewind to its
        // base).
        olog.tail.max(pg.log.tail()).min(pg.log.head())
    });

    // Rewind our divergent entries beyond the merge point.
    if merge_point < pg.log.head() {
        tracing::info!(
            pgid = %pg.pgid,
            from,
            new_head = %merge_point,
            old_head = %pg.log.head(),
            "rewinding divergent log entries",
        );
        let rewound = pg.log.rewind(merge_point);
        for (version, oid) in rewound.divergent_priors {
            pg.divergent_priors.insert(version, oid);
        }
        for entry in &rewound.removed {
            resolve_divergent(pg, ctx, entry);
        }
        pg.dirty_log = true;
    }

    // Extend with the authoritative history beyond the merge point.
    let head_before = pg.log.head();
    for entry in olog.entries.iter().filter(|e| e.version > head_before) {
        pg.log.append(entry.clone());
        pg.missing.add_next_event(entry);
        pg.dirty_log = true;
    }

    pg.info.history.merge(&oinfo.history);
    pg.info.last_update = pg.log.head();
    pg.info.log_tail = pg.log.tail();
    update_last_complete(pg);
    pg.dirty_info = true;
    Ok(MergeOutcome::Merged)
}

/// Re-resolves one object whose local log entry was rewound as divergent.
/// The authoritative log (post-rewind, post-extension candidates not yet
/// appended at this point never mention divergent-only objects) now decides
/// the object's true state.
fn resolve_divergent(
    pg: &mut PgInner,
    ctx: &mut ReactCtx<'_>,
    entry: &atoll_core::log::LogEntry,
) {
    let oid = entry.oid.clone();
    match pg.log.newest_for(&oid) {
        Some(auth) if auth.kind.is_update() => {
            // The divergent local copy is unusable; refetch the real one.
            let need = auth.version;
            pg.missing.add(oid, need, Eversion::NEVER);
        }
        Some(auth) => {
            // Authoritatively deleted or lost.
            let version = auth.version;
            pg.missing.rm(&oid, version);
            ctx.txn.remove(pg.pgid, oid);
        }
        None => {
            if entry.prior_version.is_never() {
                // Born in the divergent entry; it never really existed.
                let version = entry.version;
                pg.missing.rm(&oid, version);
                ctx.txn.remove(pg.pgid, oid);
            } else if entry.prior_version <= pg.log.tail() {
                // Already recorded in the divergent-prior side map; the next
                // peering pass resolves it by probing peers.
            } else {
                // The prior state is still in our log; roll back to it.
                pg.missing.add(oid, entry.prior_version, Eversion::NEVER);
            }
        }
    }
}

/// Primary-side processing of an acting replica's log reply during
/// missing-gathering.
///
/// The replica's effective position is the newest entry it shares with the
/// authoritative log; anything it holds beyond that is divergent. Its
/// stored `peer_info.last_update` is rewound to that split point, so
/// activation sends it the authoritative suffix from there and its own
/// merge rewinds the divergent entries. What the replica lacks (the
/// authoritative entries past the split, plus repairs for the objects its
/// divergent entries touched) becomes its missing set on the primary.
pub(crate) fn proc_replica_log(
    pg: &mut PgInner,
    from: NodeId,
    mut oinfo: PgInfo,
    olog: LogBundle,
    omissing: MissingSet,
) {
    let mut peer_missing = omissing;

    let split = olog
        .entries
        .iter()
        .rev()
        .find(|entry| {
            pg.log.entry_at(entry.version).is_some_and(|local| {
                local.oid == entry.oid
                    && local.reqid == entry.reqid
                    && local.kind == entry.kind
            })
        })
        .map(|entry| entry.version)
        .unwrap_or_else(|| {
            if olog.entries.is_empty() {
                // Nothing sent: the replica is simply behind, no divergence
                // to judge.
                oinfo.last_update
            } else {
                // Everything it sent is divergent; agreement is assumed at
                // the suffix base.
                olog.tail
            }
        });

    // The objects its divergent entries touched need the authoritative
    // state (re-pushed, or removed by its own merge when none exists).
    for entry in olog.entries.iter().filter(|e| e.version > split) {
        match pg.log.newest_for(&entry.oid) {
            Some(auth) if auth.kind.is_update() => {
                peer_missing.add(entry.oid.clone(), auth.version, Eversion::NEVER);
            }
            Some(auth) => {
                let version = auth.version;
                peer_missing.rm(&entry.oid, version);
            }
            None => {}
        }
    }

    // Everything committed after its split point is missing there.
    for entry in pg.log.entries_after(split) {
        peer_missing.add_next_event(entry);
    }

    if split < oinfo.last_update {
        tracing::info!(
            pgid = %pg.pgid,
            from,
            reported = %oinfo.last_update,
            %split,
            "replica log diverges; rewinding its effective position",
        );
        oinfo.last_update = split;
        oinfo.last_complete = oinfo.last_complete.min(split);
    }

    tracing::debug!(
        pgid = %pg.pgid,
        from,
        peer_missing = peer_missing.num_missing(),
        "processed replica log",
    );
    pg.peer_info.insert(from, oinfo);
    pg.peer_missing.insert(from, peer_missing);
    search_for_missing(pg, from);
}

/// Indexes `from` as a location for every locally-missing object it holds an
/// acceptable copy of, and refreshes the unfound count.
pub(crate) fn search_for_missing(pg: &mut PgInner, from: NodeId) {
    let Some(peer_info) = pg.peer_info.get(&from) else {
        return;
    };
    if peer_info.is_incomplete {
        return;
    }
    let peer_missing = pg.peer_missing.get(&from);
    let mut found = Vec::new();
    for (need, oid) in pg.missing.in_need_order() {
        let peer_has = peer_info.last_update >= *need
            && peer_missing.map(|m| !m.is_missing(oid)).unwrap_or(true);
        if peer_has {
            found.push(oid.clone());
        }
    }
    pg.missing_loc.add_source(from);
    for oid in found {
        pg.missing_loc.add_location(oid, from);
    }
    pg.missing_loc.recompute_unfound(&pg.missing);
}

/// Recomputes `last_complete` and the log's recovery cursor from the missing
/// set: everything up to the first missing need-version is locally readable.
pub(crate) fn update_last_complete(pg: &mut PgInner) {
    if pg.info.is_incomplete {
        // A backfill target's data is partial regardless of its log; its
        // completion point is restored when backfill finishes.
        pg.info.last_complete = Eversion::NEVER;
        return;
    }
    let min_need = pg.missing.in_need_order().next().map(|(need, _)| *need);
    let mut last_complete = pg.log.tail();
    let mut complete_to = None;
    for entry in pg.log.entries() {
        if let Some(min_need) = min_need {
            if entry.version >= min_need {
                complete_to = Some(entry.version);
                break;
            }
        }
        last_complete = entry.version;
    }
    pg.log.complete_to = complete_to;
    pg.info.last_complete = last_complete.min(pg.info.last_update);
    if pg.info.last_update.is_never() {
        pg.info.last_complete = Eversion::NEVER;
    }
}

#[cfg(test)]
mod tests {
    use atoll_core::log::{EntryKind, IndexedLog};
    use atoll_core::test_utils::{entry, entry_req, update_over};
    use atoll_core::{Eversion, ObjectId, PgId, ReqId};

    use super::*;
    use crate::cluster_map::ClusterMap;
    use crate::pg::PgInner;
    use crate::store::MemStore;

    fn test_pg(whoami: NodeId) -> PgInner {
        let map = ClusterMap::builder(5)
            .node_up(1)
            .node_up(2)
            .pg(PgId(1), vec![1, 2], vec![1, 2])
            .build();
        let mut pg = PgInner::new(PgId(1), whoami, map);
        pg.up = vec![1, 2];
        pg.acting = vec![1, 2];
        pg
    }

    fn seeded_log(entries: Vec<atoll_core::log::LogEntry>) -> IndexedLog {
        let mut log = IndexedLog::new();
        for entry in entries {
            log.append(entry);
        }
        log
    }

    fn info_with(last_update: Eversion) -> PgInfo {
        let mut info = PgInfo::new(PgId(1));
        info.last_update = last_update;
        info.last_complete = last_update;
        info
    }

    #[test]
    fn best_info_prefers_last_update_then_tail_then_id() {
        let mut pg = test_pg(1);
        pg.info = info_with(Eversion::new(5, 100));
        pg.peer_info.insert(2, info_with(Eversion::new(5, 120)));
        assert_eq!(find_best_info(&pg), Some(2));

        // Tie on last_update: same versions, node 1 wins by lower id.
        pg.peer_info.insert(2, info_with(Eversion::new(5, 100)));
        assert_eq!(find_best_info(&pg), Some(1));

        // Incomplete peers are skipped entirely.
        let mut incomplete = info_with(Eversion::new(5, 200));
        incomplete.is_incomplete = true;
        pg.peer_info.insert(2, incomplete);
        assert_eq!(find_best_info(&pg), Some(1));
    }

    #[test]
    fn merge_extends_head_and_marks_missing() {
        let store = MemStore::new();
        let mut ctx = ReactCtx::new(&store);
        let mut pg = test_pg(2);
        pg.log = seeded_log(vec![
            entry(5, 1, "a", EntryKind::Update),
            entry(5, 2, "b", EntryKind::Update),
        ]);
        pg.info = info_with(Eversion::new(5, 2));

        let mut auth = seeded_log(vec![
            entry(5, 1, "a", EntryKind::Update),
            entry(5, 2, "b", EntryKind::Update),
            update_over(5, 3, "a", Eversion::new(5, 1)),
            entry(5, 4, "c", EntryKind::Update),
        ]);
        auth.complete_to = None;
        let outcome = merge_log(
            &mut pg,
            &mut ctx,
            info_with(Eversion::new(5, 4)),
            auth.bundle(),
            1,
        )
        .expect("merge");
        assert_eq!(outcome, MergeOutcome::Merged);
        assert_eq!(pg.info.last_update, Eversion::new(5, 4));
        assert!(pg.missing.is_missing(&ObjectId::new("a")));
        assert!(pg.missing.is_missing(&ObjectId::new("c")));
        assert!(!pg.missing.is_missing(&ObjectId::new("b")));
        // Readable through (5,2); the extension is not yet recovered.
        assert_eq!(pg.info.last_complete, Eversion::new(5, 2));
    }

    #[test]
    fn merge_resolves_divergent_head_entry() {
        let store = MemStore::new();
        let mut ctx = ReactCtx::new(&store);
        let mut pg = test_pg(2);
        // Node 2 recorded B at (5,150); the authority says (5,150) was A.
        pg.log = seeded_log(vec![
            entry(5, 100, "base", EntryKind::Update),
            entry_req(5, 150, "b", ReqId::new(9, 2), EntryKind::Update),
        ]);
        pg.info = info_with(Eversion::new(5, 150));

        let auth_log = seeded_log(vec![
            entry(5, 100, "base", EntryKind::Update),
            entry_req(5, 150, "a", ReqId::new(9, 1), EntryKind::Update),
        ]);
        let outcome = merge_log(
            &mut pg,
            &mut ctx,
            info_with(Eversion::new(5, 150)),
            auth_log.bundle(),
            1,
        )
        .expect("divergence at the head resolves by rewind");
        assert_eq!(outcome, MergeOutcome::Merged);

        // A took (5,150); B never really existed and is gone entirely.
        let head = pg.log.entry_at(Eversion::new(5, 150)).expect("head entry");
        assert_eq!(head.oid, ObjectId::new("a"));
        assert!(pg.log.newest_for(&ObjectId::new("b")).is_none());
        assert!(!pg.missing.is_missing(&ObjectId::new("b")));
        assert!(pg.missing.is_missing(&ObjectId::new("a")));
        assert_eq!(pg.log.lookup_by_reqid(&ReqId::new(9, 2)), None);
        assert_eq!(
            pg.log.lookup_by_reqid(&ReqId::new(9, 1)),
            Some(Eversion::new(5, 150))
        );
        assert!(pg.log.index_consistent());
    }

    #[test]
    fn divergent_entry_with_prior_below_tail_lands_in_side_map() {
        let store = MemStore::new();
        let mut ctx = ReactCtx::new(&store);
        let mut pg = test_pg(2);
        let mut log = seeded_log(vec![
            entry(5, 100, "base", EntryKind::Update),
            update_over(5, 150, "b", Eversion::new(5, 40)),
        ]);
        log.trim_tail(Eversion::new(5, 100));
        pg.log = log;
        pg.info = info_with(Eversion::new(5, 150));
        pg.info.log_tail = Eversion::new(5, 100);

        // The authority never saw (5,150).
        let mut auth_log = seeded_log(vec![
            entry(5, 100, "base", EntryKind::Update),
            entry(5, 149, "c", EntryKind::Update),
        ]);
        auth_log.trim_tail(Eversion::new(5, 100));
        merge_log(
            &mut pg,
            &mut ctx,
            info_with(Eversion::new(5, 149)),
            auth_log.bundle(),
            1,
        )
        .expect("merge");

        // B's prior predates the tail: deferred to the divergent-prior map.
        assert_eq!(
            pg.divergent_priors.get(&Eversion::new(5, 40)),
            Some(&ObjectId::new("b"))
        );
        assert!(pg.log.entry_at(Eversion::new(5, 149)).is_some());
        assert_eq!(pg.info.last_update, Eversion::new(5, 149));
    }

    #[test]
    fn agreement_above_disagreement_is_fatal() {
        let store = MemStore::new();
        let mut ctx = ReactCtx::new(&store);
        let mut pg = test_pg(2);
        pg.log = seeded_log(vec![
            entry(5, 100, "x", EntryKind::Update),
            entry(5, 150, "shared", EntryKind::Update),
        ]);
        pg.info = info_with(Eversion::new(5, 150));

        let auth_log = seeded_log(vec![
            entry(5, 100, "y", EntryKind::Update),
            entry(5, 150, "shared", EntryKind::Update),
        ]);
        let outcome = merge_log(
            &mut pg,
            &mut ctx,
            info_with(Eversion::new(5, 150)),
            auth_log.bundle(),
            1,
        );
        assert!(matches!(
            outcome,
            Err(PgFatalError::ProtocolDivergence { version, .. }) if version == Eversion::new(5, 100)
        ));
    }

    #[test]
    fn merge_moves_orphaned_entries_to_missing() {
        let store = MemStore::new();
        let mut ctx = ReactCtx::new(&store);
        let mut pg = test_pg(2);
        // Node 2's (5,150) write was never acked by the authority, whose
        // head stops at (5,149).
        pg.log = seeded_log(vec![
            entry(5, 100, "base", EntryKind::Update),
            update_over(5, 150, "b", Eversion::new(5, 100)),
        ]);
        pg.info = info_with(Eversion::new(5, 150));

        let auth_log = seeded_log(vec![entry(5, 100, "base", EntryKind::Update)]);
        let outcome = merge_log(
            &mut pg,
            &mut ctx,
            info_with(Eversion::new(5, 100)),
            auth_log.bundle(),
            1,
        )
        .expect("merge");
        assert_eq!(outcome, MergeOutcome::Merged);
        assert_eq!(pg.info.last_update, Eversion::new(5, 100));
        // B's prior (5,100) is in-log, so B rolls back to it via recovery.
        assert!(pg.missing.is_missing(&ObjectId::new("b")));
    }

    #[test]
    fn merge_is_idempotent() {
        let store = MemStore::new();
        let mut pg = test_pg(2);
        pg.log = seeded_log(vec![entry(5, 1, "a", EntryKind::Update)]);
        pg.info = info_with(Eversion::new(5, 1));

        let auth = seeded_log(vec![
            entry(5, 1, "a", EntryKind::Update),
            entry(5, 2, "b", EntryKind::Update),
        ]);
        let oinfo = info_with(Eversion::new(5, 2));

        let mut ctx = ReactCtx::new(&store);
        merge_log(&mut pg, &mut ctx, oinfo.clone(), auth.bundle(), 1).expect("first merge");
        let info_after_one = pg.info.clone();
        let log_after_one = pg.log.bundle();
        let missing_after_one = pg.missing.clone();

        let mut ctx = ReactCtx::new(&store);
        merge_log(&mut pg, &mut ctx, oinfo, auth.bundle(), 1).expect("second merge");
        assert_eq!(pg.info, info_after_one);
        assert_eq!(pg.log.bundle(), log_after_one);
        assert_eq!(pg.missing, missing_after_one);
    }

    #[test]
    fn replica_log_derives_missing_from_suffix() {
        let mut pg = test_pg(1);
        pg.log = seeded_log(vec![
            entry(5, 1, "a", EntryKind::Update),
            entry(5, 2, "b", EntryKind::Update),
            update_over(5, 3, "a", Eversion::new(5, 1)),
        ]);
        pg.info = info_with(Eversion::new(5, 3));

        // Peer 2 stopped at (5,1).
        let peer_log = seeded_log(vec![entry(5, 1, "a", EntryKind::Update)]);
        proc_replica_log(
            &mut pg,
            2,
            info_with(Eversion::new(5, 1)),
            peer_log.bundle(),
            MissingSet::new(),
        );

        let peer_missing = &pg.peer_missing[&2];
        assert!(peer_missing.is_missing(&ObjectId::new("a")));
        assert!(peer_missing.is_missing(&ObjectId::new("b")));
        assert_eq!(peer_missing.num_missing(), 2);
    }
}

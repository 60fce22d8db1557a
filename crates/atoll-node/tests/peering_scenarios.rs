//! End-to-end peering and recovery scenarios over a miniature cluster.

use std::sync::Arc;

use atoll_core::log::EntryKind;
use atoll_core::test_utils::{entry, entry_req};
use atoll_core::{Eversion, ObjectId, PgId, ReqId};
use atoll_node::cluster_map::{ClusterMap, NodeRecord};
use atoll_node::pg::{ClientOp, RequestOutcome};
use atoll_node::test_utils::TestCluster;

const PG: PgId = PgId(1);

fn trace_init() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

fn three_node_map(epoch: u64) -> Arc<ClusterMap> {
    ClusterMap::builder(epoch)
        .node_up(1)
        .node_up(2)
        .node_up(3)
        .pg(PG, vec![1, 2, 3], vec![1, 2, 3])
        .build()
}

fn two_node_map(epoch: u64) -> Arc<ClusterMap> {
    ClusterMap::builder(epoch)
        .node_up(1)
        .node_up(2)
        .pg(PG, vec![1, 2], vec![1, 2])
        .build()
}

fn assert_info_invariants(cluster: &TestCluster) {
    for (id, node) in &cluster.nodes {
        let snapshot = node.pg.dump_recovery_info();
        assert!(
            snapshot.last_complete <= snapshot.last_update,
            "node {id}: last_complete {} > last_update {}",
            snapshot.last_complete,
            snapshot.last_update,
        );
    }
}

/// S1: a clean restart. Three identical replicas peer on a new epoch and
/// reach `Clean` without a single recovery operation or a message to a peer
/// that does not exist.
#[test]
fn clean_restart_reaches_clean_without_recovery() {
    trace_init();
    let mut cluster = TestCluster::new(PG, three_node_map(6), &[1, 2, 3]);
    let entries: Vec<_> = (96..=100)
        .map(|seq| entry(5, seq, &format!("o{seq}"), EntryKind::Update))
        .collect();
    for id in [1, 2, 3] {
        cluster.seed_node(id, entries.clone());
    }

    cluster.start_all();

    assert!(cluster.node(1).pg.is_clean(), "primary state: {}", cluster.node(1).pg.state_name());
    for id in [2, 3] {
        assert!(
            cluster.node(id).pg.state_name().contains("ReplicaActive"),
            "node {id} state: {}",
            cluster.node(id).pg.state_name(),
        );
    }

    let snapshot = cluster.node(1).pg.dump_recovery_info();
    assert_eq!(snapshot.last_update, Eversion::new(5, 100));
    assert_eq!(snapshot.num_missing, 0);
    assert_eq!(snapshot.recovery_ops_active, 0);
    for id in [1, 2, 3] {
        let pushed = cluster
            .node(id)
            .metrics
            .messages_sent
            .with_label_values(&["push"])
            .get();
        assert_eq!(pushed, 0, "node {id} pushed objects during a clean restart");
    }
    assert!(
        cluster.undeliverable.is_empty(),
        "messages sent to nonexistent peers: {:?}",
        cluster.undeliverable.len(),
    );
    cluster.assert_reservations_balanced();
    assert_info_invariants(&cluster);
}

/// S2: one replica's log is behind. After peering its missing set holds
/// exactly the objects updated past its head, recovery pushes them, and its
/// `last_update` converges on the primary's.
#[test]
fn lagging_replica_recovers_log_suffix() {
    trace_init();
    let mut cluster = TestCluster::new(PG, two_node_map(6), &[1, 2]);
    let full: Vec<_> = (1..=20)
        .map(|seq| entry(5, seq, &format!("o{seq}"), EntryKind::Update))
        .collect();
    cluster.seed_node(1, full.clone());
    cluster.seed_node(2, full[..15].to_vec());

    cluster.start_all();

    assert!(cluster.node(1).pg.is_clean(), "primary state: {}", cluster.node(1).pg.state_name());
    let replica = cluster.node(2).pg.dump_recovery_info();
    assert_eq!(replica.last_update, Eversion::new(5, 20));
    assert_eq!(replica.num_missing, 0);
    for seq in 16..=20 {
        let oid = ObjectId::new(format!("o{seq}"));
        assert_eq!(
            cluster.object_version_on(2, &oid),
            Some(Eversion::new(5, seq)),
            "o{seq} was not recovered onto node 2",
        );
    }
    cluster.assert_reservations_balanced();
    assert_info_invariants(&cluster);
}

/// S2 precondition check: right after the replica merges the authoritative
/// log, its missing set is exactly the suffix it had not seen.
#[test]
fn lagging_replica_missing_set_is_exact_suffix() {
    trace_init();
    let mut cluster = TestCluster::new(PG, two_node_map(6), &[1, 2]);
    let full: Vec<_> = (1..=20)
        .map(|seq| entry(5, seq, &format!("o{seq}"), EntryKind::Update))
        .collect();
    cluster.seed_node(1, full.clone());
    cluster.seed_node(2, full[..15].to_vec());

    cluster.start_all();

    // The primary derived the same set before pushing.
    let total_pushes = cluster
        .node(1)
        .metrics
        .messages_sent
        .with_label_values(&["push"])
        .get();
    assert_eq!(total_pushes, 5, "expected exactly the 5 suffix objects pushed");
}

/// S3: divergent head. The replica recorded an entry from a stale interval
/// that the authoritative history does not contain; after peering its log
/// carries the authoritative entry, the divergent object is gone, and the
/// authoritative object is recovered onto it.
#[test]
fn divergent_replica_entry_is_rewound_and_replaced() {
    trace_init();
    let mut cluster = TestCluster::new(PG, two_node_map(6), &[1, 2]);

    let base = vec![
        entry(4, 1, "x", EntryKind::Update),
        entry(4, 2, "y", EntryKind::Update),
    ];
    // Authoritative: A took (5,3). Divergent on node 2: B at (4,3), written
    // under the prior interval's primary and never acknowledged.
    let mut auth = base.clone();
    auth.push(entry_req(5, 3, "a", ReqId::new(9, 1), EntryKind::Update));
    let mut stale = base;
    stale.push(entry_req(4, 3, "b", ReqId::new(9, 2), EntryKind::Update));
    cluster.seed_node(1, auth);
    cluster.seed_node(2, stale);

    cluster.start_all();

    assert!(cluster.node(1).pg.is_clean(), "primary state: {}", cluster.node(1).pg.state_name());
    cluster.node(2).pg.with_inner(|inner| {
        let head = inner
            .log
            .entry_at(Eversion::new(5, 3))
            .expect("authoritative head entry adopted");
        assert_eq!(head.oid, ObjectId::new("a"));
        assert!(inner.log.newest_for(&ObjectId::new("b")).is_none());
        assert!(inner.missing.is_empty());
        assert!(inner.log.index_consistent());
        assert_eq!(inner.info.last_update, Eversion::new(5, 3));
    });
    // The divergent object's data is gone from node 2; the real one arrived.
    assert_eq!(cluster.object_version_on(2, &ObjectId::new("b")), None);
    assert_eq!(
        cluster.object_version_on(2, &ObjectId::new("a")),
        Some(Eversion::new(5, 3)),
    );
    cluster.assert_reservations_balanced();
    assert_info_invariants(&cluster);
}

/// S4: an object nobody holds. The PG activates, reports it unfound,
/// blocks writes against it, and finishes recovery only once it is
/// administratively marked lost.
#[test]
fn unfound_object_blocks_until_marked_lost() {
    trace_init();
    let mut cluster = TestCluster::new(PG, two_node_map(6), &[1, 2]);
    cluster.seed_node(
        1,
        vec![
            entry(5, 1, "o1", EntryKind::Update),
            entry(5, 2, "lost-obj", EntryKind::Update),
        ],
    );
    cluster.seed_node(2, vec![entry(5, 1, "o1", EntryKind::Update)]);

    // Node 1 knows about (5,2) but lost its copy.
    let lost = ObjectId::new("lost-obj");
    cluster.node(1).pg.with_inner(|inner| {
        inner.missing.add(lost.clone(), Eversion::new(5, 2), Eversion::NEVER);
        inner.info.last_complete = Eversion::new(5, 1);
    });
    {
        let mut txn = atoll_node::Transaction::new();
        txn.remove(PG, lost.clone());
        use atoll_node::ObjectStore as _;
        cluster
            .node(1)
            .store
            .apply_transaction(PG, txn, None)
            .expect("seed");
    }

    cluster.start_all();

    let snapshot = cluster.node(1).pg.dump_recovery_info();
    assert_eq!(snapshot.num_unfound, 1);
    assert!(
        snapshot.state.ends_with("Recovering"),
        "expected to stall in Recovering, got {}",
        snapshot.state,
    );
    assert_eq!(
        cluster.node(1).pg.do_request(ClientOp {
            reqid: ReqId::new(7, 1),
            oid: lost.clone(),
            kind: EntryKind::Update,
            data: vec![1],
        }),
        RequestOutcome::BlockedUnfound,
    );

    let marked = cluster.node(1).pg.mark_all_unfound_lost();
    assert_eq!(marked, 1);
    cluster.route_until_quiet();

    assert!(cluster.node(1).pg.is_clean(), "state: {}", cluster.node(1).pg.state_name());
    assert_eq!(cluster.node(1).pg.dump_recovery_info().num_unfound, 0);
    cluster.assert_reservations_balanced();
    assert_info_invariants(&cluster);
}

/// S5: the backfill target rejects its reservation. The primary drops to
/// `NotBackfilling`, the local reservation slot returns to its prior value,
/// and the next activation tick retries successfully.
#[test]
fn rejected_backfill_reservation_is_retried() {
    trace_init();
    let mut cluster = TestCluster::new(PG, ClusterMap::builder(6)
        .node_up(1)
        .node_up(3)
        .pg(PG, vec![1, 3], vec![1, 3])
        .build(), &[1, 3]);

    let entries: Vec<_> = (1..=20)
        .map(|seq| entry(5, seq, &format!("o{seq}"), EntryKind::Update))
        .collect();
    cluster.seed_node(1, entries);
    // Trim the primary's log so node 3 (empty) falls outside the overlap
    // and must be backfilled.
    cluster.node(1).pg.with_inner(|inner| {
        inner.log.trim_tail(Eversion::new(5, 10));
        inner.info.log_tail = Eversion::new(5, 10);
        inner.dirty_log = true;
        inner.dirty_info = true;
    });
    {
        let mut txn = atoll_node::Transaction::new();
        cluster.node(1).pg.write_if_dirty(&mut txn);
        use atoll_node::ObjectStore as _;
        cluster.node(1).store.apply_transaction(PG, txn, None).expect("seed");
    }
    cluster.node(3).pg.with_inner(|inner| {
        inner.reject_remote_reservations = true;
    });

    cluster.start_all();

    let snapshot = cluster.node(1).pg.dump_recovery_info();
    assert!(
        snapshot.state.ends_with("NotBackfilling"),
        "expected NotBackfilling after rejection, got {}",
        snapshot.state,
    );
    assert_eq!(
        cluster.node(1).backfill_reserver.outstanding(),
        0,
        "local backfill slot must be returned on rejection",
    );

    // The target relents; the next activation tick retries.
    cluster.node(3).pg.with_inner(|inner| {
        inner.reject_remote_reservations = false;
    });
    cluster.tick();

    assert!(cluster.node(1).pg.is_clean(), "state: {}", cluster.node(1).pg.state_name());
    assert_eq!(cluster.node(3).store.object_count(PG), 20);
    let target = cluster.node(3).pg.dump_recovery_info();
    assert_eq!(target.last_update, Eversion::new(5, 20));
    cluster.assert_reservations_balanced();
    assert_info_invariants(&cluster);
}

/// S6: the map flaps while the primary waits for the authoritative log.
/// The machine resets, re-peers against the surviving members, and never
/// merges the stale reply.
#[test]
fn map_flap_mid_get_log_resets_cleanly() {
    trace_init();
    let mut cluster = TestCluster::new(PG, three_node_map(6), &[1, 2, 3]);
    let shared: Vec<_> = (1..=20)
        .map(|seq| entry(5, seq, &format!("o{seq}"), EntryKind::Update))
        .collect();
    let longer: Vec<_> = (1..=30)
        .map(|seq| entry(5, seq, &format!("o{seq}"), EntryKind::Update))
        .collect();
    cluster.seed_node(1, shared.clone());
    cluster.seed_node(2, shared);
    // Node 3 holds the best log; it will be chosen as authoritative.
    cluster.seed_node(3, longer);

    cluster.start_all_unrouted();
    let mut reached_get_log = false;
    for _ in 0..20 {
        cluster.route_once();
        if cluster.node(1).pg.state_name().ends_with("GetLog") {
            reached_get_log = true;
            break;
        }
    }
    assert!(reached_get_log, "primary never reached GetLog");

    // The authoritative peer drops out before its log reply is delivered.
    let map7 = ClusterMap::builder(7)
        .node_up(1)
        .node_up(2)
        .node_down(3)
        .pg(PG, vec![1, 2], vec![1, 2])
        .build();
    cluster.advance_map(map7);

    assert!(cluster.node(1).pg.is_clean(), "state: {}", cluster.node(1).pg.state_name());
    cluster.node(1).pg.with_inner(|inner| {
        // The stale authoritative log was never merged.
        assert_eq!(inner.log.head(), Eversion::new(5, 20));
        assert!(inner.log.entry_at(Eversion::new(5, 21)).is_none());
    });
    cluster.assert_reservations_balanced();
    assert_info_invariants(&cluster);
}

/// A primary whose `up_thru` lags the interval must have the map service
/// bump it before activating, and proceeds on the epoch that shows it.
#[test]
fn stale_up_thru_waits_for_map_bump() {
    trace_init();
    let map6 = ClusterMap::builder(6)
        .node(1, NodeRecord { up: true, exists: true, lost_at: 0, up_from: 1, up_thru: 0 })
        .node(2, NodeRecord { up: true, exists: true, lost_at: 0, up_from: 1, up_thru: 0 })
        .pg(PG, vec![1, 2], vec![1, 2])
        .build();
    let mut cluster = TestCluster::new(PG, map6, &[1, 2]);
    let entries: Vec<_> = (1..=5)
        .map(|seq| entry(5, seq, &format!("o{seq}"), EntryKind::Update))
        .collect();
    cluster.seed_node(1, entries.clone());
    cluster.seed_node(2, entries);

    cluster.start_all();

    assert!(
        cluster.node(1).pg.state_name().ends_with("WaitUpThru"),
        "state: {}",
        cluster.node(1).pg.state_name(),
    );
    assert!(
        cluster
            .map_service
            .up_thru_requests()
            .contains(&(1, 6)),
        "the primary never asked for an up-thru bump",
    );

    // The service publishes an epoch that reflects the bump; the same
    // membership, so no reset.
    let map7 = ClusterMap::builder(7)
        .node(1, NodeRecord { up: true, exists: true, lost_at: 0, up_from: 1, up_thru: 7 })
        .node(2, NodeRecord { up: true, exists: true, lost_at: 0, up_from: 1, up_thru: 7 })
        .pg(PG, vec![1, 2], vec![1, 2])
        .build();
    cluster.advance_map(map7);

    assert!(cluster.node(1).pg.is_clean(), "state: {}", cluster.node(1).pg.state_name());
    cluster.assert_reservations_balanced();
}

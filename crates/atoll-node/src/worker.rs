//! The event worker pool: a queue of `(PG, event)` pairs drained by the
//! tokio blocking pool.
//!
//! Per-PG serialization comes from the PG lock, not the pool: any number of
//! workers may pick up events for the same PG and they will simply line up
//! on its mutex, while events for different PGs run fully in parallel.

use std::sync::Arc;

use tokio::sync::mpsc;

use crate::peering::PgEvent;
use crate::pg::Pg;

/// Handle for submitting PG events to the pool. Dropping every handle shuts
/// the dispatcher down once the queue drains.
#[derive(Clone)]
pub struct PgWorkerPool {
    tx: mpsc::UnboundedSender<(Arc<Pg>, PgEvent)>,
}

impl PgWorkerPool {
    /// Spawns the dispatcher on the current tokio runtime.
    pub fn start() -> Self {
        let (tx, mut rx) = mpsc::unbounded_channel::<(Arc<Pg>, PgEvent)>();
        tokio::spawn(async move {
            while let Some((pg, event)) = rx.recv().await {
                let handle = tokio::task::spawn_blocking(move || {
                    pg.queue_event(event);
                });
                if let Err(join_error) = handle.await {
                    if join_error.is_panic() {
                        tracing::error!(%join_error, "pg event worker panicked");
                    }
                }
            }
        });
        Self { tx }
    }

    /// Enqueues one event for one PG.
    pub fn submit(&self, pg: Arc<Pg>, event: PgEvent) {
        if self.tx.send((pg, event)).is_err() {
            tracing::warn!("pg worker pool is shut down; event dropped");
        }
    }

    /// Fans a map advance plus its activation tick out to a set of PGs.
    pub fn submit_map_advance(
        &self,
        pgs: impl IntoIterator<Item = Arc<Pg>>,
        map: Arc<crate::cluster_map::ClusterMap>,
    ) {
        for pg in pgs {
            pg.handle_advance_map(map.clone());
            self.submit(pg, PgEvent::ActMap);
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use atoll_core::PgId;

    use super::*;
    use crate::cluster_map::{ClusterMap, MapService};
    use crate::config::PgConfig;
    use crate::messenger::LoopbackMessenger;
    use crate::metrics::NodeMetricSet;
    use crate::pg::NodeContext;
    use crate::reservations::Reserver;
    use crate::store::MemStore;

    struct NoMaps;

    impl MapService for NoMaps {
        fn get_map(&self, _epoch: u64) -> Option<Arc<ClusterMap>> {
            None
        }
        fn current_epoch(&self) -> u64 {
            1
        }
        fn subscribe(&self, _callback: crate::cluster_map::MapCallback) {}
        fn request_up_thru(&self, _node: u32, _epoch: u64) {}
    }

    #[tokio::test]
    async fn pool_drives_pg_to_clean() {
        let pgid = PgId(1);
        let map = ClusterMap::builder(1)
            .node_up(1)
            .pg(pgid, vec![1], vec![1])
            .build();
        let node = Arc::new(NodeContext {
            whoami: 1,
            config: PgConfig::default(),
            store: Arc::new(MemStore::new()),
            messenger: Arc::new(LoopbackMessenger::new()),
            map_service: Arc::new(NoMaps),
            backfill_reserver: Arc::new(Reserver::new("backfill", 1)),
            recovery_reserver: Arc::new(Reserver::new("recovery", 1)),
            metrics: NodeMetricSet::new_for_test(),
        });
        let pg = Pg::new(node, pgid, map);

        let pool = PgWorkerPool::start();
        pool.submit(pg.clone(), PgEvent::Initialize);
        pool.submit(pg.clone(), PgEvent::ActMap);

        for _ in 0..100 {
            if pg.is_clean() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("pg did not reach clean; state: {}", pg.state_name());
    }
}

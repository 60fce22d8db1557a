//! Placement-group peering, log reconciliation, and recovery for atoll
//! storage nodes.
//!
//! A PG is the unit of replication: a shard of the object namespace served
//! by a small ordered set of nodes. After every cluster-map change this
//! crate drives each affected PG through a deterministic protocol (elect a
//! primary, reconcile replica logs, restore redundancy, reactivate I/O)
//! while preserving durability and read-your-writes ordering.
//!
//! The external collaborators (map distribution, object store, messenger)
//! are consumed as traits; see [`cluster_map::MapService`],
//! [`store::ObjectStore`], and [`messenger::Messenger`].

pub mod backfill;
pub mod cluster_map;
pub mod config;
pub mod errors;
pub mod messenger;
pub mod metrics;
pub mod peering;
pub mod pg;
pub mod prior_set;
pub mod recovery;
pub mod reservations;
pub mod store;
pub mod worker;

mod reconcile;

#[cfg(any(test, feature = "test-utils"))]
pub mod test_utils;

pub use cluster_map::{ClusterMap, MapCallback, MapService, Role};
pub use config::PgConfig;
pub use errors::{PgFatalError, StorageFatalError};
pub use messenger::{Envelope, Messenger};
pub use peering::{MachineState, PgEvent};
pub use pg::{ClientOp, NodeContext, Pg, PgSnapshot, RequestOutcome};
pub use reservations::Reserver;
pub use store::{MemStore, ObjectStore, Transaction};
pub use worker::PgWorkerPool;

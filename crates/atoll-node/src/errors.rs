//! Error taxonomy of the peering and recovery core.
//!
//! Only two failure classes surface as errors: corruption of a PG's own
//! persistent state (fatal for that PG) and object-store write failure
//! (fatal for the node). Missing peer replies and reservation rejections are
//! ordinary events, handled by the state machine.

use atoll_core::records::RecordError;
use atoll_core::{Eversion, NodeId};
use thiserror::Error;

/// Fatal for one PG: it is marked down persistently and stops processing
/// events other than map advances.
#[derive(Debug, Error)]
pub enum PgFatalError {
    /// A persisted log or info chunk failed its checksum or is structurally
    /// malformed. An external repair path must be invoked.
    #[error("failed to read pg state: {0}")]
    ReadLog(#[source] RecordError),

    /// Two logs disagree inside their overlap region, which replication
    /// guarantees cannot happen.
    #[error(
        "log diverges from peer {from} within overlap at {version}: \
         local entry {local}, authoritative entry {remote}"
    )]
    ProtocolDivergence {
        from: NodeId,
        version: Eversion,
        local: String,
        remote: String,
    },
}

/// The object store could not commit a transaction. Fatal for the node; the
/// process exits so a peer replaces it.
#[derive(Debug, Error)]
#[error("object store failed to commit: {context}")]
pub struct StorageFatalError {
    pub context: String,
}

impl StorageFatalError {
    pub fn new(context: impl Into<String>) -> Self {
        Self {
            context: context.into(),
        }
    }
}

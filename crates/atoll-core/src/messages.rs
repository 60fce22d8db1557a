//! Typed messages exchanged between storage nodes on behalf of a PG.
//!
//! Every message carries the sender's map epoch; receivers drop messages
//! whose epoch predates their last peering reset. Delivery is best-effort
//! and order-preserving per peer pair; duplicates must be tolerated.

use serde::{Deserialize, Serialize};

use crate::backfill::BackfillInterval;
use crate::info::{PgHistory, PgInfo};
use crate::log::LogBundle;
use crate::missing::MissingSet;
use crate::{Epoch, Eversion, ObjectId};

/// What a primary wants from a peer during peering.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum QueryKind {
    /// Send your info.
    Info,
    /// Send your log strictly after `since`, with your info and missing set.
    Log { since: Eversion },
    /// Send your entire log; the requester has no usable overlap.
    FullLog,
}

/// Peering query sent by a primary to a probe-set member.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PgQuery {
    pub kind: QueryKind,
    /// The requester's view of the shared history, so strays can catch up.
    pub history: PgHistory,
    pub epoch: Epoch,
}

/// A peer's reply to an info query, or an unsolicited "I exist" note from a
/// stray replica to a new primary.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PgNotify {
    pub info: PgInfo,
    /// Epoch of the query being answered, or of the map that prompted the
    /// notify.
    pub query_epoch: Epoch,
    pub epoch: Epoch,
}

/// Info push (primary activating a replica) or info ack (replica confirming
/// adoption of the authoritative history).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PgInfoMsg {
    pub info: PgInfo,
    pub epoch: Epoch,
}

/// A log (suffix or whole) together with the sender's info and missing set.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PgLogMsg {
    pub info: PgInfo,
    pub log: LogBundle,
    pub missing: MissingSet,
    pub query_epoch: Epoch,
    pub epoch: Epoch,
}

/// Backfill reservation sub-protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ReserveOp {
    Request,
    Grant,
    Reject,
    Release,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackfillReserve {
    pub op: ReserveOp,
    pub epoch: Epoch,
}

/// Recovery reservation sub-protocol. Recovery grants are never rejected;
/// they queue behind the remote slot instead.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RecoveryReserveOp {
    Request,
    Grant,
    Release,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecoveryReserve {
    pub op: RecoveryReserveOp,
    pub epoch: Epoch,
}

/// Backfill range scan: the primary asks a backfill target to enumerate its
/// objects from `begin`, and receives the resulting interval.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum PgScan {
    Request {
        begin: ObjectId,
        max: u32,
        epoch: Epoch,
    },
    Response {
        interval: BackfillInterval,
        epoch: Epoch,
    },
}

/// Object content pushed to a peer during recovery or backfill.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PgPush {
    pub oid: ObjectId,
    pub version: Eversion,
    pub data: Vec<u8>,
    pub epoch: Epoch,
}

/// Acknowledgement that a pushed object is stable on the peer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PgPushReply {
    pub oid: ObjectId,
    pub version: Eversion,
    pub epoch: Epoch,
}

/// Request that a peer send us an object we are missing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PgPull {
    pub oid: ObjectId,
    pub need: Eversion,
    pub epoch: Epoch,
}

/// Instruct a backfill target to drop objects that no longer exist.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PgRemove {
    pub oids: Vec<ObjectId>,
    pub epoch: Epoch,
}

/// Tell a stray replica its data is no longer needed; it deletes the PG.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PgPurge {
    pub epoch: Epoch,
}

/// The messages the peering and recovery core exchanges between nodes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Message {
    Query(PgQuery),
    Notify(PgNotify),
    Info(PgInfoMsg),
    Log(Box<PgLogMsg>),
    BackfillReserve(BackfillReserve),
    RecoveryReserve(RecoveryReserve),
    Scan(PgScan),
    Push(PgPush),
    PushReply(PgPushReply),
    Pull(PgPull),
    Remove(PgRemove),
    Purge(PgPurge),
}

impl Message {
    /// The sender's map epoch, used for staleness filtering.
    pub fn epoch(&self) -> Epoch {
        match self {
            Message::Query(m) => m.epoch,
            Message::Notify(m) => m.epoch,
            Message::Info(m) => m.epoch,
            Message::Log(m) => m.epoch,
            Message::BackfillReserve(m) => m.epoch,
            Message::RecoveryReserve(m) => m.epoch,
            Message::Scan(PgScan::Request { epoch, .. }) => *epoch,
            Message::Scan(PgScan::Response { epoch, .. }) => *epoch,
            Message::Push(m) => m.epoch,
            Message::PushReply(m) => m.epoch,
            Message::Pull(m) => m.epoch,
            Message::Remove(m) => m.epoch,
            Message::Purge(m) => m.epoch,
        }
    }

    /// Short name for logging.
    pub fn kind_name(&self) -> &'static str {
        match self {
            Message::Query(_) => "query",
            Message::Notify(_) => "notify",
            Message::Info(_) => "info",
            Message::Log(_) => "log",
            Message::BackfillReserve(_) => "backfill_reserve",
            Message::RecoveryReserve(_) => "recovery_reserve",
            Message::Scan(_) => "scan",
            Message::Push(_) => "push",
            Message::PushReply(_) => "push_reply",
            Message::Pull(_) => "pull",
            Message::Remove(_) => "remove",
            Message::Purge(_) => "purge",
        }
    }
}

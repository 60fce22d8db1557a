//! Events driving the peering state machine.
//!
//! External stimuli (map advances, peer messages, store flushes, reservation
//! grants) and internal milestones all arrive through the same queue; the
//! machine processes each to quiescence under the PG lock and never blocks.

use std::sync::Arc;

use atoll_core::backfill::BackfillInterval;
use atoll_core::messages::{PgInfoMsg, PgLogMsg, PgNotify, PgPull, PgPush, PgPushReply, PgQuery};
use atoll_core::{Epoch, NodeId, ObjectId};

use crate::cluster_map::ClusterMap;

#[derive(Debug, Clone)]
pub enum PgEvent {
    /// First event of a newly created PG.
    Initialize,
    /// First event of a PG read back from stable storage.
    Load,

    /// A new cluster map; carries the previous one for interval bookkeeping.
    AdvanceMap {
        map: Arc<ClusterMap>,
        last_map: Arc<ClusterMap>,
        new_up: Vec<NodeId>,
        new_acting: Vec<NodeId>,
    },
    /// The per-epoch activation tick, delivered after every `AdvanceMap`.
    ActMap,
    /// The store confirmed all applied writes for this PG are stable.
    Flushed,

    // Peer messages, post epoch filtering.
    Query { from: NodeId, query: PgQuery },
    Notify { from: NodeId, notify: PgNotify },
    InfoMsg { from: NodeId, info: PgInfoMsg },
    LogMsg { from: NodeId, msg: Box<PgLogMsg> },
    ScanRequest { from: NodeId, begin: ObjectId, max: u32 },
    ScanResponse { from: NodeId, interval: BackfillInterval },
    Push { from: NodeId, push: PgPush },
    PushReply { from: NodeId, reply: PgPushReply },
    Pull { from: NodeId, pull: PgPull },
    RemoveObjects { from: NodeId, oids: Vec<ObjectId> },
    Purge { from: NodeId },

    // Internal milestones posted by the machine itself.
    MakePrimary,
    MakeStray,
    GotInfo,
    GotLog,
    NeedUpThru,
    CheckRepops,
    Activate { query_epoch: Epoch },
    IsIncomplete,
    NeedActingChange,

    // Reservation protocol.
    LocalBackfillReserved,
    RemoteBackfillReserved { from: NodeId },
    RemoteReservationRejected { from: NodeId },
    LocalRecoveryReserved,
    RemoteRecoveryReserved { from: NodeId },
    AllRemotesReserved,
    RequestBackfill,
    RequestRecovery,
    RecoveryDone,

    // Recovery and backfill milestones.
    DoRecovery,
    Backfilled,
    AllReplicasRecovered,
    AllReplicasActivated,
    GoClean,
}

impl PgEvent {
    /// Short name for logs and metrics labels.
    pub fn name(&self) -> &'static str {
        match self {
            PgEvent::Initialize => "Initialize",
            PgEvent::Load => "Load",
            PgEvent::AdvanceMap { .. } => "AdvanceMap",
            PgEvent::ActMap => "ActMap",
            PgEvent::Flushed => "Flushed",
            PgEvent::Query { .. } => "Query",
            PgEvent::Notify { .. } => "Notify",
            PgEvent::InfoMsg { .. } => "InfoMsg",
            PgEvent::LogMsg { .. } => "LogMsg",
            PgEvent::ScanRequest { .. } => "ScanRequest",
            PgEvent::ScanResponse { .. } => "ScanResponse",
            PgEvent::Push { .. } => "Push",
            PgEvent::PushReply { .. } => "PushReply",
            PgEvent::Pull { .. } => "Pull",
            PgEvent::RemoveObjects { .. } => "RemoveObjects",
            PgEvent::Purge { .. } => "Purge",
            PgEvent::MakePrimary => "MakePrimary",
            PgEvent::MakeStray => "MakeStray",
            PgEvent::GotInfo => "GotInfo",
            PgEvent::GotLog => "GotLog",
            PgEvent::NeedUpThru => "NeedUpThru",
            PgEvent::CheckRepops => "CheckRepops",
            PgEvent::Activate { .. } => "Activate",
            PgEvent::IsIncomplete => "IsIncomplete",
            PgEvent::NeedActingChange => "NeedActingChange",
            PgEvent::LocalBackfillReserved => "LocalBackfillReserved",
            PgEvent::RemoteBackfillReserved { .. } => "RemoteBackfillReserved",
            PgEvent::RemoteReservationRejected { .. } => "RemoteReservationRejected",
            PgEvent::LocalRecoveryReserved => "LocalRecoveryReserved",
            PgEvent::RemoteRecoveryReserved { .. } => "RemoteRecoveryReserved",
            PgEvent::AllRemotesReserved => "AllRemotesReserved",
            PgEvent::RequestBackfill => "RequestBackfill",
            PgEvent::RequestRecovery => "RequestRecovery",
            PgEvent::RecoveryDone => "RecoveryDone",
            PgEvent::DoRecovery => "DoRecovery",
            PgEvent::Backfilled => "Backfilled",
            PgEvent::AllReplicasRecovered => "AllReplicasRecovered",
            PgEvent::AllReplicasActivated => "AllReplicasActivated",
            PgEvent::GoClean => "GoClean",
        }
    }
}

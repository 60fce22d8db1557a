//! Builders shared by tests across the workspace.

use crate::log::{EntryKind, LogEntry};
use crate::{Eversion, ObjectId, ReqId};

/// A log entry with an internal (unindexed) request id.
pub fn entry(epoch: u64, seq: u64, oid: &str, kind: EntryKind) -> LogEntry {
    entry_req(epoch, seq, oid, ReqId::NONE, kind)
}

/// A log entry with an explicit request id.
pub fn entry_req(epoch: u64, seq: u64, oid: &str, reqid: ReqId, kind: EntryKind) -> LogEntry {
    LogEntry {
        version: Eversion::new(epoch, seq),
        prior_version: Eversion::NEVER,
        reqid,
        oid: ObjectId::new(oid),
        kind,
    }
}

/// An update entry that supersedes `prior`.
pub fn update_over(epoch: u64, seq: u64, oid: &str, prior: Eversion) -> LogEntry {
    LogEntry {
        prior_version: prior,
        ..entry(epoch, seq, oid, EntryKind::Update)
    }
}

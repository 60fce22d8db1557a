//! The hierarchical peering states.
//!
//! States are nested enums mirroring the parent/child structure: an event is
//! offered to the innermost state first and falls through to ancestors when
//! unhandled. State-local bookkeeping (which peers were asked, who replied)
//! lives on the PG control block so states stay plain values.

use std::fmt;

/// Root of the hierarchy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MachineState {
    /// Freshly constructed; waiting for `Initialize` or `Load`.
    Initial,
    /// Membership changed; waiting for the activation tick.
    Reset,
    Started(Started),
    /// Terminal: an event arrived that the machine cannot account for.
    /// The PG must not be touched again except by map advances.
    Crashed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Started {
    /// Deciding between primary and stray duty for this interval.
    Start,
    Primary(Primary),
    /// Not in the acting set; holds data and answers queries until purged.
    Stray,
    /// Acting replica under an active primary.
    Replica(Replica),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Primary {
    Peering(Peering),
    /// Peering concluded the acting set itself must change; parked until the
    /// map obliges.
    WaitActingChange,
    Active(ActivePhase),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Peering {
    /// Querying the prior probe set for infos.
    GetInfo,
    /// Fetching the authoritative log.
    GetLog,
    /// Collecting log suffixes / missing sets from acting peers.
    GetMissing,
    /// Waiting for the map service to publish our up-thru bump.
    WaitUpThru,
    /// Waiting for the store to confirm all applied writes are stable.
    WaitFlushedPeering,
    /// No usable authoritative log source; stalled until the map changes.
    Incomplete,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActivePhase {
    /// Pushing the authoritative history to replicas, awaiting acks.
    Activating,
    WaitLocalRecoveryReserved,
    WaitRemoteRecoveryReserved,
    Recovering,
    WaitLocalBackfillReserved,
    WaitRemoteBackfillReserved,
    /// A backfill reservation was rejected; retrying on a later map tick.
    NotBackfilling,
    Backfilling,
    /// Redundancy restored; releasing reservations.
    Recovered,
    /// Steady state.
    Clean,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Replica {
    RepNotRecovering,
    RepWaitBackfillReserved,
    RepWaitRecoveryReserved,
    RepRecovering,
}

impl MachineState {
    /// The innermost active state, for logs and introspection.
    pub fn name(&self) -> &'static str {
        match self {
            MachineState::Initial => "Initial",
            MachineState::Reset => "Reset",
            MachineState::Crashed => "Crashed",
            MachineState::Started(Started::Start) => "Started/Start",
            MachineState::Started(Started::Stray) => "Started/Stray",
            MachineState::Started(Started::Replica(rep)) => match rep {
                Replica::RepNotRecovering => "Started/ReplicaActive/RepNotRecovering",
                Replica::RepWaitBackfillReserved => "Started/ReplicaActive/RepWaitBackfillReserved",
                Replica::RepWaitRecoveryReserved => "Started/ReplicaActive/RepWaitRecoveryReserved",
                Replica::RepRecovering => "Started/ReplicaActive/RepRecovering",
            },
            MachineState::Started(Started::Primary(primary)) => match primary {
                Primary::WaitActingChange => "Started/Primary/WaitActingChange",
                Primary::Peering(peering) => match peering {
                    Peering::GetInfo => "Started/Primary/Peering/GetInfo",
                    Peering::GetLog => "Started/Primary/Peering/GetLog",
                    Peering::GetMissing => "Started/Primary/Peering/GetMissing",
                    Peering::WaitUpThru => "Started/Primary/Peering/WaitUpThru",
                    Peering::WaitFlushedPeering => "Started/Primary/Peering/WaitFlushedPeering",
                    Peering::Incomplete => "Started/Primary/Peering/Incomplete",
                },
                Primary::Active(active) => match active {
                    ActivePhase::Activating => "Started/Primary/Active/Activating",
                    ActivePhase::WaitLocalRecoveryReserved => {
                        "Started/Primary/Active/WaitLocalRecoveryReserved"
                    }
                    ActivePhase::WaitRemoteRecoveryReserved => {
                        "Started/Primary/Active/WaitRemoteRecoveryReserved"
                    }
                    ActivePhase::Recovering => "Started/Primary/Active/Recovering",
                    ActivePhase::WaitLocalBackfillReserved => {
                        "Started/Primary/Active/WaitLocalBackfillReserved"
                    }
                    ActivePhase::WaitRemoteBackfillReserved => {
                        "Started/Primary/Active/WaitRemoteBackfillReserved"
                    }
                    ActivePhase::NotBackfilling => "Started/Primary/Active/NotBackfilling",
                    ActivePhase::Backfilling => "Started/Primary/Active/Backfilling",
                    ActivePhase::Recovered => "Started/Primary/Active/Recovered",
                    ActivePhase::Clean => "Started/Primary/Active/Clean",
                },
            },
        }
    }

    pub fn is_primary(&self) -> bool {
        matches!(self, MachineState::Started(Started::Primary(_)))
    }

    pub fn is_peering(&self) -> bool {
        matches!(
            self,
            MachineState::Started(Started::Primary(Primary::Peering(_)))
        )
    }

    pub fn is_active(&self) -> bool {
        matches!(
            self,
            MachineState::Started(Started::Primary(Primary::Active(_)))
        )
    }

    pub fn is_clean(&self) -> bool {
        matches!(
            self,
            MachineState::Started(Started::Primary(Primary::Active(ActivePhase::Clean)))
        )
    }

    pub fn is_replica_active(&self) -> bool {
        matches!(self, MachineState::Started(Started::Replica(_)))
    }

    pub fn is_crashed(&self) -> bool {
        matches!(self, MachineState::Crashed)
    }

    /// Whether this state holds the local backfill reservation slot on the
    /// primary. Replica-side slot ownership is tracked on the control block,
    /// since `RepRecovering` is reached from either reservation kind.
    pub fn holds_local_backfill(&self) -> bool {
        matches!(
            self,
            MachineState::Started(Started::Primary(Primary::Active(
                ActivePhase::WaitRemoteBackfillReserved | ActivePhase::Backfilling
            )))
        )
    }

    /// Whether this state holds the local recovery reservation slot.
    pub fn holds_local_recovery(&self) -> bool {
        matches!(
            self,
            MachineState::Started(Started::Primary(Primary::Active(
                ActivePhase::WaitRemoteRecoveryReserved | ActivePhase::Recovering
            )))
        )
    }
}

impl fmt::Display for MachineState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn names_reflect_hierarchy() {
        let state = MachineState::Started(Started::Primary(Primary::Peering(Peering::GetLog)));
        assert_eq!(state.name(), "Started/Primary/Peering/GetLog");
        assert!(state.is_primary());
        assert!(state.is_peering());
        assert!(!state.is_active());
    }

    #[test]
    fn reservation_holding_states() {
        let backfilling =
            MachineState::Started(Started::Primary(Primary::Active(ActivePhase::Backfilling)));
        assert!(backfilling.holds_local_backfill());
        assert!(!backfilling.holds_local_recovery());

        let recovering =
            MachineState::Started(Started::Primary(Primary::Active(ActivePhase::Recovering)));
        assert!(recovering.holds_local_recovery());
    }
}

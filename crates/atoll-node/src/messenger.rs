//! The typed message-delivery contract between storage nodes.
//!
//! Delivery is best-effort and fire-and-forget: the core never waits on a
//! send, and missing replies are handled by the state machine staying in its
//! waiting substate. Ordering is preserved per (source, destination) pair;
//! duplicates must be tolerated by receivers.

use std::collections::VecDeque;
use std::sync::Mutex;

use atoll_core::messages::Message;
use atoll_core::{NodeId, PgId};

/// A message addressed to a PG on a peer node.
#[derive(Debug, Clone)]
pub struct Envelope {
    pub from: NodeId,
    pub to: NodeId,
    pub pgid: PgId,
    pub message: Message,
}

/// Outbound message transport.
pub trait Messenger: Send + Sync {
    fn send(&self, envelope: Envelope);
}

/// A messenger that parks envelopes in a queue instead of sending them.
/// Used by the cluster test harness, which routes queues between nodes, and
/// useful for inspecting exactly what a PG said.
#[derive(Debug, Default)]
pub struct LoopbackMessenger {
    queue: Mutex<VecDeque<Envelope>>,
}

impl LoopbackMessenger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Takes everything sent since the last drain, in send order.
    pub fn drain(&self) -> Vec<Envelope> {
        self.queue
            .lock()
            .expect("messenger queue lock poisoned")
            .drain(..)
            .collect()
    }

    pub fn is_empty(&self) -> bool {
        self.queue
            .lock()
            .expect("messenger queue lock poisoned")
            .is_empty()
    }
}

impl Messenger for LoopbackMessenger {
    fn send(&self, envelope: Envelope) {
        self.queue
            .lock()
            .expect("messenger queue lock poisoned")
            .push_back(envelope);
    }
}

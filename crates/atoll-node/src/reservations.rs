//! Process-wide reservation slots that bound how many PGs recover or
//! backfill concurrently on one node.
//!
//! A PG requests a slot with a grant callback; the callback fires when the
//! slot is acquired (possibly immediately) and re-enters the state machine
//! as a `Local*Reserved` event. Release is the holder's obligation on every
//! exit path: for every grant exactly one release.

use std::collections::{HashSet, VecDeque};
use std::sync::Mutex;

use atoll_core::PgId;

type GrantFn = Box<dyn FnOnce() + Send>;

#[derive(Default)]
struct ReserverInner {
    slots: usize,
    held: HashSet<PgId>,
    queue: VecDeque<(PgId, GrantFn)>,
    granted: u64,
    released: u64,
}

/// A bounded slot counter with a FIFO wait queue.
pub struct Reserver {
    name: &'static str,
    inner: Mutex<ReserverInner>,
}

impl std::fmt::Debug for Reserver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.inner.lock().expect("reserver lock poisoned");
        f.debug_struct("Reserver")
            .field("name", &self.name)
            .field("slots", &inner.slots)
            .field("held", &inner.held.len())
            .field("queued", &inner.queue.len())
            .finish()
    }
}

impl Reserver {
    pub fn new(name: &'static str, slots: usize) -> Self {
        Self {
            name,
            inner: Mutex::new(ReserverInner {
                slots,
                ..Default::default()
            }),
        }
    }

    /// Requests a slot for `pgid`. The grant callback runs outside the
    /// reserver lock, immediately if a slot is free. A request while already
    /// holding or queued is a duplicate and is dropped.
    pub fn request(&self, pgid: PgId, grant: GrantFn) {
        let ready = {
            let mut inner = self.inner.lock().expect("reserver lock poisoned");
            if inner.held.contains(&pgid) || inner.queue.iter().any(|(queued, _)| *queued == pgid) {
                tracing::debug!(name = self.name, %pgid, "duplicate reservation request");
                return;
            }
            if inner.held.len() < inner.slots {
                inner.held.insert(pgid);
                inner.granted += 1;
                Some(grant)
            } else {
                inner.queue.push_back((pgid, grant));
                None
            }
        };
        if let Some(grant) = ready {
            tracing::debug!(name = self.name, %pgid, "reservation granted");
            grant();
        }
    }

    /// Releases the slot held by `pgid`, or cancels its queued request.
    /// Granting the next waiter happens outside the lock.
    pub fn release(&self, pgid: PgId) {
        let next = {
            let mut inner = self.inner.lock().expect("reserver lock poisoned");
            if inner.held.remove(&pgid) {
                inner.released += 1;
                if let Some((waiter, grant)) = inner.queue.pop_front() {
                    inner.held.insert(waiter);
                    inner.granted += 1;
                    Some((waiter, grant))
                } else {
                    None
                }
            } else {
                inner.queue.retain(|(queued, _)| *queued != pgid);
                None
            }
        };
        if let Some((waiter, grant)) = next {
            tracing::debug!(name = self.name, pgid = %waiter, "reservation granted from queue");
            grant();
        }
    }

    /// Slots currently held.
    pub fn outstanding(&self) -> usize {
        self.inner.lock().expect("reserver lock poisoned").held.len()
    }

    /// Lifetime `(granted, released)` counts; equal whenever no slot is held.
    pub fn counters(&self) -> (u64, u64) {
        let inner = self.inner.lock().expect("reserver lock poisoned");
        (inner.granted, inner.released)
    }
}

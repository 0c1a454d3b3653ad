use std::collections::HashMap;
use std::time::Instant;

use parking_lot::Mutex;
use tokio::sync::mpsc;
use tracing::debug;

/// Opaque worker identity, stable for the worker's lifetime and carried in
/// backend key data.
pub type WorkerId = u32;

/// Control messages delivered to a worker, standing in for the process
/// signals of a fork-based deployment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerSignal {
    /// Re-read configuration.
    Reload,
    /// Abort the active transaction and exit cleanly.
    Terminate,
    /// Exit immediately without cleanup.
    Quit,
    /// Freeze in place (core-dump preservation); only Quit releases it.
    Stop,
    /// Cancel the statement in flight.
    Interrupt,
}

/// Delivery handle for one worker's control messages.
#[derive(Debug, Clone)]
pub struct WorkerHandle {
    signals: mpsc::UnboundedSender<WorkerSignal>,
}

impl WorkerHandle {
    pub fn new(signals: mpsc::UnboundedSender<WorkerSignal>) -> Self {
        Self { signals }
    }

    /// Best-effort delivery; a worker that already exited drops the
    /// message.
    pub fn signal(&self, signal: WorkerSignal) {
        let _ = self.signals.send(signal);
    }
}

struct WorkerEntry {
    cancel_secret: u32,
    created_at: Instant,
    handle: WorkerHandle,
}

struct Inner {
    entries: HashMap<WorkerId, WorkerEntry>,
    /// Rows reserved for spawns in flight; they count as children.
    reserved: usize,
    next_id: WorkerId,
    /// Bumped when shared structures are rebuilt after crash recovery.
    generation: u64,
}

/// The authoritative set of live workers.
///
/// A row is linked before its worker body can run, so a cancel request
/// arriving immediately after spawn cannot miss it; it is removed exactly
/// once, by the reaper, after the exit was observed. Written only by the
/// spawner and the reaper; the cancellation path reads it.
pub struct Registry {
    inner: Mutex<Inner>,
}

impl Registry {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner {
                entries: HashMap::new(),
                reserved: 0,
                next_id: 1,
                generation: 0,
            }),
        }
    }

    /// Preallocate a row and assign the worker identity.
    ///
    /// Fails without side effects when the child capacity is exhausted.
    pub fn reserve(&self, capacity: usize) -> Option<WorkerId> {
        let mut inner = self.inner.lock();
        if inner.entries.len() + inner.reserved >= capacity {
            return None;
        }
        let id = inner.next_id;
        inner.next_id = inner.next_id.wrapping_add(1).max(1);
        inner.reserved += 1;
        Some(id)
    }

    /// Bind a reserved row to its secret and delivery handle, linking it
    /// into the registry.
    pub fn commit(&self, id: WorkerId, cancel_secret: u32, handle: WorkerHandle) {
        let mut inner = self.inner.lock();
        inner.reserved = inner.reserved.saturating_sub(1);
        inner.entries.insert(
            id,
            WorkerEntry {
                cancel_secret,
                created_at: Instant::now(),
                handle,
            },
        );
    }

    /// Free a reserved row after a failed spawn.
    pub fn release(&self, _id: WorkerId) {
        let mut inner = self.inner.lock();
        inner.reserved = inner.reserved.saturating_sub(1);
    }

    /// Remove an exited worker. Returns the age of the row if it existed.
    pub fn remove(&self, id: WorkerId) -> Option<std::time::Duration> {
        self.inner
            .lock()
            .entries
            .remove(&id)
            .map(|e| e.created_at.elapsed())
    }

    /// Live children, including reserved rows for spawns in flight.
    pub fn children(&self) -> usize {
        let inner = self.inner.lock();
        inner.entries.len() + inner.reserved
    }

    pub fn is_empty(&self) -> bool {
        self.children() == 0
    }

    /// Route a cancel request: only an exact worker-id and secret match
    /// delivers an interrupt. Misses and mismatches are silent so the
    /// request is no oracle.
    pub fn cancel(&self, id: WorkerId, cancel_secret: u32) -> bool {
        let inner = self.inner.lock();
        match inner.entries.get(&id) {
            Some(entry) if entry.cancel_secret == cancel_secret => {
                debug!(worker = id, "delivering cancel interrupt");
                entry.handle.signal(WorkerSignal::Interrupt);
                true
            }
            Some(_) => {
                debug!(worker = id, "bad secret in cancel request");
                false
            }
            None => {
                debug!(worker = id, "cancel request for unknown worker");
                false
            }
        }
    }

    /// Signal every registered worker, from a stable snapshot of the set.
    pub fn signal_all(&self, signal: WorkerSignal) {
        self.signal_except(None, signal);
    }

    /// Signal every registered worker except one (the freshly dead one
    /// during crash handling).
    pub fn signal_except(&self, skip: Option<WorkerId>, signal: WorkerSignal) {
        let handles: Vec<WorkerHandle> = {
            let inner = self.inner.lock();
            inner
                .entries
                .iter()
                .filter(|(id, _)| Some(**id) != skip)
                .map(|(_, e)| e.handle.clone())
                .collect()
        };
        for handle in handles {
            handle.signal(signal);
        }
    }

    /// Record that shared session structures were rebuilt. The registry
    /// must already be drained.
    pub fn bump_generation(&self) -> u64 {
        let mut inner = self.inner.lock();
        debug_assert!(inner.entries.is_empty());
        inner.generation += 1;
        inner.generation
    }

    pub fn generation(&self) -> u64 {
        self.inner.lock().generation
    }
}

impl Default for Registry {
    fn default() -> Self {
        Self::new()
    }
}

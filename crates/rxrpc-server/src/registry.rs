//! Per-session map of running invocations to their cancellation handles.
//!
//! Every registration gets a sequence number. Emission and removal done on
//! behalf of a producer are guarded by that number, so a producer whose id
//! was unsubscribed (or reused by a newer call) can never touch the newer
//! entry or emit after its own entry is gone.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;
use rxrpc_core::InvocationId;
use tokio_util::sync::CancellationToken;
use tracing::warn;

/// Cancellation handle for one running invocation.
#[derive(Clone, Debug)]
pub struct Registration {
    seq: u64,
    token: CancellationToken,
}

impl Registration {
    /// Request cooperative cancellation. Idempotent.
    pub fn cancel(&self) {
        self.token.cancel();
    }

    /// Whether cancellation was requested.
    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Resolves once cancellation is requested.
    pub async fn cancelled(&self) {
        self.token.cancelled().await;
    }
}

/// `put` after the registry was drained.
#[derive(Debug, thiserror::Error)]
#[error("invocation registry is closed")]
pub struct RegistryClosed;

#[derive(Default)]
struct Entries {
    active: HashMap<InvocationId, Registration>,
    sealed: bool,
}

/// Concurrency-safe map from invocation id to cancellation handle.
#[derive(Default)]
pub struct InvocationRegistry {
    entries: Mutex<Entries>,
    next_seq: AtomicU64,
}

impl InvocationRegistry {
    /// Create an empty, open registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a new invocation.
    ///
    /// A still-active entry with the same id is cancelled and replaced.
    pub fn put(&self, id: InvocationId) -> Result<Registration, RegistryClosed> {
        let registration = Registration {
            seq: self.next_seq.fetch_add(1, Ordering::Relaxed),
            token: CancellationToken::new(),
        };

        let previous = {
            let mut entries = self.entries.lock();
            if entries.sealed {
                return Err(RegistryClosed);
            }
            entries.active.insert(id, registration.clone())
        };

        if let Some(previous) = previous {
            warn!(invocation_id = id, "invocation id reused while active, cancelling previous call");
            previous.cancel();
        }
        Ok(registration)
    }

    /// Remove the entry for `id` regardless of which call owns it.
    pub fn remove(&self, id: InvocationId) -> Option<Registration> {
        self.entries.lock().active.remove(&id)
    }

    /// Remove and cancel the entry for `id`. Returns whether one was present.
    pub fn cancel(&self, id: InvocationId) -> bool {
        match self.remove(id) {
            Some(registration) => {
                registration.cancel();
                true
            }
            None => false,
        }
    }

    /// Remove the entry only if it still belongs to `registration`.
    pub fn remove_if_current(&self, id: InvocationId, registration: &Registration) -> bool {
        self.finish_if_current(id, registration, || ()).is_some()
    }

    /// Run `emit` under the registry lock if `registration` is still the
    /// active entry for `id`. `emit` must not block or re-enter the registry.
    pub fn emit_if_current<R>(
        &self,
        id: InvocationId,
        registration: &Registration,
        emit: impl FnOnce() -> R,
    ) -> Option<R> {
        let entries = self.entries.lock();
        Self::is_current(&entries, id, registration).then(emit)
    }

    /// Like [`emit_if_current`](Self::emit_if_current), but also removes the
    /// entry. Used for terminal events: exactly one of this and an
    /// unsubscribe can win.
    pub fn finish_if_current<R>(
        &self,
        id: InvocationId,
        registration: &Registration,
        emit: impl FnOnce() -> R,
    ) -> Option<R> {
        let mut entries = self.entries.lock();
        if !Self::is_current(&entries, id, registration) {
            return None;
        }
        let _ = entries.active.remove(&id);
        Some(emit())
    }

    /// Seal the registry and cancel every remaining entry.
    ///
    /// Later `put` calls fail, so nothing registered after teardown started
    /// can escape cancellation. Returns the number of cancelled entries.
    pub fn drain(&self) -> usize {
        let drained: Vec<Registration> = {
            let mut entries = self.entries.lock();
            entries.sealed = true;
            entries.active.drain().map(|(_, registration)| registration).collect()
        };
        for registration in &drained {
            registration.cancel();
        }
        drained.len()
    }

    /// Whether `id` currently has an entry.
    pub fn contains(&self, id: InvocationId) -> bool {
        self.entries.lock().active.contains_key(&id)
    }

    /// Number of active entries.
    pub fn len(&self) -> usize {
        self.entries.lock().active.len()
    }

    /// Whether there are no active entries.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Whether [`drain`](Self::drain) has run.
    pub fn is_sealed(&self) -> bool {
        self.entries.lock().sealed
    }

    fn is_current(entries: &Entries, id: InvocationId, registration: &Registration) -> bool {
        entries
            .active
            .get(&id)
            .is_some_and(|current| current.seq == registration.seq)
    }
}

//! Process-wide table of calls waiting for a reply.
//!
//! Every producer registers and cancels entries while the single consumer
//! loop delivers them, so all access goes through one mutex. The lock is
//! never held across an await.

use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;

use tokio::sync::oneshot;
use tokio::task::AbortHandle;
use tracing::{debug, warn};

use crate::error::RegistryError;
use crate::queue::MessageData;

/// Shared handle to the registry. Clones refer to the same table.
#[derive(Clone, Default)]
pub struct CorrelationRegistry {
    inner: Arc<RegistryInner>,
}

#[derive(Default)]
struct RegistryInner {
    pending: Mutex<HashMap<String, Pending>>,
    expiry: Option<Duration>,
    generation: AtomicU64,
}

struct Pending {
    reply: oneshot::Sender<MessageData>,
    generation: u64,
    expiry: Option<AbortHandle>,
}

impl Pending {
    fn disarm(&self) {
        if let Some(handle) = &self.expiry {
            handle.abort();
        }
    }
}

impl CorrelationRegistry {
    /// Registry whose entries live until delivered or cancelled.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry that also drops any entry still pending after `ttl`,
    /// independently of whether the caller is still waiting.
    ///
    /// Registering on such a registry must happen inside a tokio runtime.
    pub fn with_expiry(ttl: Duration) -> Self {
        Self {
            inner: Arc::new(RegistryInner {
                expiry: Some(ttl),
                ..Default::default()
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, Pending>> {
        self.inner
            .pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Allocate a single-use receiver for `id`.
    pub fn register(&self, id: &str) -> Result<oneshot::Receiver<MessageData>, RegistryError> {
        let (tx, rx) = oneshot::channel();
        let generation = self.inner.generation.fetch_add(1, Ordering::Relaxed);

        let mut pending = self.lock();
        match pending.entry(id.to_string()) {
            Entry::Occupied(_) => return Err(RegistryError::Duplicate(id.to_string())),
            Entry::Vacant(slot) => {
                let expiry = self
                    .inner
                    .expiry
                    .map(|ttl| spawn_expiry(Arc::downgrade(&self.inner), id.to_string(), generation, ttl));

                slot.insert(Pending {
                    reply: tx,
                    generation,
                    expiry,
                });
            }
        }

        debug!(id = id, pending = pending.len(), "correlation_registered");
        Ok(rx)
    }

    /// Hand `data` to whoever registered `id`, removing the entry.
    ///
    /// Returns `false` when no caller was waiting: unknown id, already
    /// delivered, cancelled, expired, or the caller went away.
    pub fn deliver(&self, id: &str, data: MessageData) -> bool {
        let entry = self.lock().remove(id);

        match entry {
            Some(pending) => {
                pending.disarm();
                let delivered = pending.reply.send(data).is_ok();
                debug!(id = id, delivered, "correlation_delivered");
                delivered
            }
            None => false,
        }
    }

    /// Remove `id` without delivering. Returns whether an entry existed.
    pub fn cancel(&self, id: &str) -> bool {
        let entry = self.lock().remove(id);

        match entry {
            Some(pending) => {
                pending.disarm();
                debug!(id = id, "correlation_cancelled");
                true
            }
            None => false,
        }
    }

    pub fn contains(&self, id: &str) -> bool {
        self.lock().contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl RegistryInner {
    /// Drop `id` if it still belongs to the registration that armed the timer.
    fn expire(&self, id: &str, generation: u64) {
        let mut pending = self.pending.lock().unwrap_or_else(PoisonError::into_inner);

        if pending.get(id).map(|p| p.generation) == Some(generation) {
            pending.remove(id);
            warn!(id = id, "correlation_expired");
        }
    }
}

fn spawn_expiry(inner: Weak<RegistryInner>, id: String, generation: u64, ttl: Duration) -> AbortHandle {
    tokio::spawn(async move {
        tokio::time::sleep(ttl).await;
        if let Some(inner) = inner.upgrade() {
            inner.expire(&id, generation);
        }
    })
    .abort_handle()
}

//! Durable offline queue: operations emitted while disconnected, replayed
//! in order on reconnect.
//!
//! Entries persist through a [`StorageBackend`] under a namespace-scoped
//! key. The load path distrusts the blob: every entry is structurally
//! validated and its operation re-checked, corrupt or stale entries are
//! discarded with a warning, and the store is rewritten when anything was
//! dropped. Storage failures log and degrade to in-memory operation.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::crdt::{now_seconds, Operation};
use crate::storage::StorageBackend;

/// Hard cap on queued entries; the oldest is dropped on overflow.
pub const MAX_QUEUE_ENTRIES: usize = 1000;
/// Entries older than this are pruned on load and on [`OfflineQueue::prune_old`].
pub const MAX_ENTRY_AGE: Duration = Duration::from_secs(24 * 60 * 60);

/// One queued operation bound for a room.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueuedOp {
    pub room_id: String,
    pub operation: Operation,
    pub queued_at: f64,
}

/// FIFO of pending operations with size and age bounds.
pub struct OfflineQueue {
    namespace: String,
    storage: Option<Arc<dyn StorageBackend>>,
    entries: VecDeque<QueuedOp>,
}

impl OfflineQueue {
    /// Queue without persistence.
    pub fn in_memory(namespace: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            storage: None,
            entries: VecDeque::new(),
        }
    }

    /// Open a durable queue, loading and validating any persisted entries.
    pub async fn open(namespace: impl Into<String>, storage: Arc<dyn StorageBackend>) -> Self {
        let mut queue = Self {
            namespace: namespace.into(),
            storage: Some(storage),
            entries: VecDeque::new(),
        };
        queue.load().await;
        queue
    }

    fn storage_key(&self) -> String {
        format!("{}/offline-queue", self.namespace)
    }

    async fn load(&mut self) {
        let Some(storage) = self.storage.clone() else {
            return;
        };
        let blob = match storage.load(&self.storage_key()).await {
            Ok(Some(blob)) => blob,
            Ok(None) => return,
            Err(e) => {
                log::warn!("offline queue load failed: {e}");
                return;
            }
        };
        let raw: Vec<Value> = match serde_json::from_slice(&blob) {
            Ok(raw) => raw,
            Err(e) => {
                log::warn!("offline queue blob corrupted, discarding: {e}");
                self.persist().await;
                return;
            }
        };
        let total = raw.len();
        let cutoff = now_seconds() - MAX_ENTRY_AGE.as_secs_f64();
        for item in raw {
            match serde_json::from_value::<QueuedOp>(item) {
                Ok(entry) if entry.operation.validate().is_ok() && entry.queued_at >= cutoff => {
                    self.entries.push_back(entry);
                }
                _ => {}
            }
        }
        while self.entries.len() > MAX_QUEUE_ENTRIES {
            self.entries.pop_front();
        }
        if self.entries.len() != total {
            log::warn!(
                "offline queue dropped {} invalid or stale entries",
                total - self.entries.len()
            );
            self.persist().await;
        }
    }

    async fn persist(&self) {
        let Some(storage) = &self.storage else {
            return;
        };
        let blob = match serde_json::to_vec(&self.entries) {
            Ok(blob) => blob,
            Err(e) => {
                log::warn!("offline queue serialization failed: {e}");
                return;
            }
        };
        if let Err(e) = storage.save(&self.storage_key(), &blob).await {
            log::warn!("offline queue persist failed: {e}");
        }
    }

    /// Append an entry; at capacity, the oldest entry is dropped first.
    pub async fn enqueue(&mut self, room_id: impl Into<String>, operation: Operation) {
        while self.entries.len() >= MAX_QUEUE_ENTRIES {
            self.entries.pop_front();
        }
        self.entries.push_back(QueuedOp {
            room_id: room_id.into(),
            operation,
            queued_at: now_seconds(),
        });
        self.persist().await;
    }

    pub fn peek(&self) -> Option<&QueuedOp> {
        self.entries.front()
    }

    pub fn peek_all(&self) -> Vec<QueuedOp> {
        self.entries.iter().cloned().collect()
    }

    /// Remove and return all entries for one room, preserving order.
    pub async fn drain(&mut self, room_id: &str) -> Vec<QueuedOp> {
        let mut drained = Vec::new();
        let mut kept = VecDeque::new();
        for entry in self.entries.drain(..) {
            if entry.room_id == room_id {
                drained.push(entry);
            } else {
                kept.push_back(entry);
            }
        }
        self.entries = kept;
        if !drained.is_empty() {
            self.persist().await;
        }
        drained
    }

    /// Remove and return every entry, preserving order.
    pub async fn drain_all(&mut self) -> Vec<QueuedOp> {
        let drained: Vec<QueuedOp> = self.entries.drain(..).collect();
        if !drained.is_empty() {
            self.persist().await;
        }
        drained
    }

    /// Drop all entries for one room; returns how many were removed.
    pub async fn clear(&mut self, room_id: &str) -> usize {
        let before = self.entries.len();
        self.entries.retain(|entry| entry.room_id != room_id);
        let removed = before - self.entries.len();
        if removed > 0 {
            self.persist().await;
        }
        removed
    }

    pub async fn clear_all(&mut self) -> usize {
        let removed = self.entries.len();
        self.entries.clear();
        if removed > 0 {
            self.persist().await;
        }
        removed
    }

    pub fn size(&self) -> usize {
        self.entries.len()
    }

    pub fn size_for_room(&self, room_id: &str) -> usize {
        self.entries
            .iter()
            .filter(|entry| entry.room_id == room_id)
            .count()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Drop entries older than `max_age`; returns how many were removed.
    pub async fn prune_old(&mut self, max_age: Duration) -> usize {
        let cutoff = now_seconds() - max_age.as_secs_f64();
        let before = self.entries.len();
        self.entries.retain(|entry| entry.queued_at >= cutoff);
        let removed = before - self.entries.len();
        if removed > 0 {
            log::debug!("offline queue pruned {removed} aged entries");
            self.persist().await;
        }
        removed
    }
}

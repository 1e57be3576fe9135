use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::{mpsc, Mutex};
use tracing::debug;

use crate::error::StoreError;

/// What happened to a document within a subscribed collection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeKind {
    Added,
    Modified,
    Removed,
}

/// One change notification from a collection subscription.
#[derive(Debug, Clone)]
pub struct StoreChange {
    pub path: String,
    pub doc_id: String,
    pub kind: ChangeKind,
    pub data: Value,
}

/// Seam to the shared document store used as the signaling bus.
///
/// Subscriptions replay the collection's current documents (one `Added` per
/// doc) and then stream live changes. Delivery is at-least-once: a change
/// may be redelivered after reconnect, and a notification may arrive for a
/// document that another reader already deleted. Consumers must treat such
/// duplicates as no-ops. Retry/backoff for failed calls belongs to the
/// store client, not to this crate.
#[async_trait]
pub trait DocumentStore: Send + Sync + 'static {
    /// Create or overwrite a document. With `merge`, object fields are
    /// merged into the existing document instead of replacing it.
    async fn set_document(
        &self,
        path: &str,
        doc_id: &str,
        value: Value,
        merge: bool,
    ) -> Result<(), StoreError>;

    /// Append a document with a generated id; returns the id.
    async fn add_document(&self, path: &str, value: Value) -> Result<String, StoreError>;

    /// Delete a document. Deleting a missing document is a no-op.
    async fn delete_document(&self, path: &str, doc_id: &str) -> Result<(), StoreError>;

    /// Delete several documents atomically (all or nothing).
    async fn batch_delete(&self, path: &str, doc_ids: &[String]) -> Result<(), StoreError>;

    /// All documents in `path` whose `field` equals `value`, as (id, doc).
    async fn query_where(
        &self,
        path: &str,
        field: &str,
        value: &Value,
    ) -> Result<Vec<(String, Value)>, StoreError>;

    /// Subscribe to a collection. The receiver first yields the current
    /// contents, then live changes. Dropping the receiver ends the
    /// subscription.
    async fn subscribe(&self, path: &str) -> mpsc::Receiver<StoreChange>;
}

type Collections = HashMap<String, BTreeMap<String, Value>>;

/// In-process `DocumentStore` with the same replay-then-stream semantics as
/// a remote store. Used by the integration tests and by single-process
/// deployments that don't need a shared backend.
#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<MemoryInner>,
}

#[derive(Default)]
struct MemoryInner {
    collections: Collections,
    watchers: HashMap<String, Vec<mpsc::Sender<StoreChange>>>,
}

impl MemoryStore {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn notify(inner: &mut MemoryInner, change: StoreChange) {
        if let Some(senders) = inner.watchers.get_mut(&change.path) {
            // try_send keeps mutation non-blocking; a watcher that can't
            // keep up (or was dropped) is pruned.
            senders.retain(|tx| match tx.try_send(change.clone()) {
                Ok(()) => true,
                Err(mpsc::error::TrySendError::Full(_)) => {
                    debug!(path = %change.path, "store watcher lagging, dropping it");
                    false
                }
                Err(mpsc::error::TrySendError::Closed(_)) => false,
            });
        }
    }

    fn merge_into(existing: &mut Value, update: Value) {
        match (existing, update) {
            (Value::Object(base), Value::Object(patch)) => {
                for (k, v) in patch {
                    base.insert(k, v);
                }
            }
            (slot, update) => *slot = update,
        }
    }
}

#[async_trait]
impl DocumentStore for MemoryStore {
    async fn set_document(
        &self,
        path: &str,
        doc_id: &str,
        value: Value,
        merge: bool,
    ) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().await;
        let collection = inner.collections.entry(path.to_string()).or_default();
        let kind = match collection.get_mut(doc_id) {
            Some(existing) => {
                if merge {
                    Self::merge_into(existing, value);
                } else {
                    *existing = value;
                }
                ChangeKind::Modified
            }
            None => {
                collection.insert(doc_id.to_string(), value);
                ChangeKind::Added
            }
        };
        let data = inner.collections[path][doc_id].clone();
        Self::notify(
            &mut inner,
            StoreChange {
                path: path.to_string(),
                doc_id: doc_id.to_string(),
                kind,
                data,
            },
        );
        Ok(())
    }

    async fn add_document(&self, path: &str, value: Value) -> Result<String, StoreError> {
        let doc_id = uuid::Uuid::new_v4().to_string();
        let mut inner = self.inner.lock().await;
        inner
            .collections
            .entry(path.to_string())
            .or_default()
            .insert(doc_id.clone(), value.clone());
        Self::notify(
            &mut inner,
            StoreChange {
                path: path.to_string(),
                doc_id: doc_id.clone(),
                kind: ChangeKind::Added,
                data: value,
            },
        );
        Ok(doc_id)
    }

    async fn delete_document(&self, path: &str, doc_id: &str) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().await;
        let removed = inner
            .collections
            .get_mut(path)
            .and_then(|c| c.remove(doc_id));
        if let Some(data) = removed {
            Self::notify(
                &mut inner,
                StoreChange {
                    path: path.to_string(),
                    doc_id: doc_id.to_string(),
                    kind: ChangeKind::Removed,
                    data,
                },
            );
        }
        Ok(())
    }

    async fn batch_delete(&self, path: &str, doc_ids: &[String]) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().await;
        let mut removals = Vec::new();
        if let Some(collection) = inner.collections.get_mut(path) {
            for doc_id in doc_ids {
                if let Some(data) = collection.remove(doc_id) {
                    removals.push((doc_id.clone(), data));
                }
            }
        }
        for (doc_id, data) in removals {
            Self::notify(
                &mut inner,
                StoreChange {
                    path: path.to_string(),
                    doc_id,
                    kind: ChangeKind::Removed,
                    data,
                },
            );
        }
        Ok(())
    }

    async fn query_where(
        &self,
        path: &str,
        field: &str,
        value: &Value,
    ) -> Result<Vec<(String, Value)>, StoreError> {
        let inner = self.inner.lock().await;
        let mut out = Vec::new();
        if let Some(collection) = inner.collections.get(path) {
            for (doc_id, doc) in collection {
                if doc.get(field) == Some(value) {
                    out.push((doc_id.clone(), doc.clone()));
                }
            }
        }
        Ok(out)
    }

    async fn subscribe(&self, path: &str) -> mpsc::Receiver<StoreChange> {
        let (tx, rx) = mpsc::channel(256);
        let mut inner = self.inner.lock().await;
        // Replay current contents before going live.
        if let Some(collection) = inner.collections.get(path) {
            for (doc_id, data) in collection {
                let _ = tx.try_send(StoreChange {
                    path: path.to_string(),
                    doc_id: doc_id.clone(),
                    kind: ChangeKind::Added,
                    data: data.clone(),
                });
            }
        }
        inner
            .watchers
            .entry(path.to_string())
            .or_default()
            .push(tx);
        rx
    }
}

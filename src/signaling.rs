use std::collections::HashSet;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::error::SignalingError;
use crate::link::{CandidatePayload, SdpPayload};
use crate::store::{ChangeKind, DocumentStore};

/// The three per-peer mailbox kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SignalKind {
    Offer,
    Answer,
    IceCandidate,
}

impl SignalKind {
    pub const ALL: [SignalKind; 3] = [
        SignalKind::Offer,
        SignalKind::Answer,
        SignalKind::IceCandidate,
    ];

    fn collection(self) -> &'static str {
        match self {
            SignalKind::Offer => "offers",
            SignalKind::Answer => "answers",
            SignalKind::IceCandidate => "iceCandidates",
        }
    }
}

/// One mailbox document. Stored in the *target's* mailbox of the given
/// kind and deleted by the target after processing. Not idempotent by
/// itself; the consume-then-delete step plus the reader's seen-id guard
/// make duplicate delivery a no-op.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SignalMessage {
    pub from: String,
    pub target_id: String,
    pub payload: Value,
    pub created_at: DateTime<Utc>,
}

/// A consumed mailbox message, forwarded to the session loop.
#[derive(Debug)]
pub struct IncomingSignal {
    pub kind: SignalKind,
    pub from: String,
    pub payload: Value,
}

/// Cancels the watch task when dropped. Teardown drops these before the
/// link handle is released, so no message is ever processed against a
/// half-destroyed connection.
pub struct WatchGuard {
    handle: JoinHandle<()>,
}

impl Drop for WatchGuard {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

/// Per-peer mailbox semantics over the document store: three append-only
/// collections per (channel, peer), consumed by their owner. Swapping the
/// store for a WebSocket relay or a queue only touches this type.
#[derive(Clone)]
pub struct SignalingTransport {
    store: Arc<dyn DocumentStore>,
    channel_id: String,
}

impl SignalingTransport {
    pub fn new(store: Arc<dyn DocumentStore>, channel_id: impl Into<String>) -> Self {
        Self {
            store,
            channel_id: channel_id.into(),
        }
    }

    fn mailbox(&self, peer_id: &str, kind: SignalKind) -> String {
        format!(
            "channels/{}/peers/{}/{}",
            self.channel_id,
            peer_id,
            kind.collection()
        )
    }

    async fn send(
        &self,
        kind: SignalKind,
        from: &str,
        to: &str,
        payload: Value,
    ) -> Result<(), SignalingError> {
        let message = SignalMessage {
            from: from.to_string(),
            target_id: to.to_string(),
            payload,
            created_at: Utc::now(),
        };
        self.store
            .add_document(&self.mailbox(to, kind), serde_json::to_value(&message)?)
            .await?;
        Ok(())
    }

    pub async fn send_offer(
        &self,
        from: &str,
        to: &str,
        offer: &SdpPayload,
    ) -> Result<(), SignalingError> {
        self.send(SignalKind::Offer, from, to, serde_json::to_value(offer)?)
            .await
    }

    pub async fn send_answer(
        &self,
        from: &str,
        to: &str,
        answer: &SdpPayload,
    ) -> Result<(), SignalingError> {
        self.send(SignalKind::Answer, from, to, serde_json::to_value(answer)?)
            .await
    }

    pub async fn send_candidate(
        &self,
        from: &str,
        to: &str,
        candidate: &CandidatePayload,
    ) -> Result<(), SignalingError> {
        self.send(
            SignalKind::IceCandidate,
            from,
            to,
            serde_json::to_value(candidate)?,
        )
        .await
    }

    /// Watch the caller's own mailbox of `kind` for messages from one
    /// specific peer. Each matching message is forwarded to `out` and then
    /// deleted from the store, so steady-state delivery is once per
    /// message. Messages already consumed (or addressed elsewhere) are
    /// skipped.
    pub fn watch(
        &self,
        kind: SignalKind,
        self_id: &str,
        from_peer: &str,
        out: mpsc::Sender<IncomingSignal>,
    ) -> WatchGuard {
        let store = self.store.clone();
        let path = self.mailbox(self_id, kind);
        let self_id = self_id.to_string();
        let from_peer = from_peer.to_string();

        let handle = tokio::spawn(async move {
            let mut rx = store.subscribe(&path).await;
            // Subscriptions can replay on reconnect; remember consumed doc
            // ids so a redelivered add is a no-op.
            let mut seen: HashSet<String> = HashSet::new();
            while let Some(change) = rx.recv().await {
                if change.kind != ChangeKind::Added {
                    continue;
                }
                let message: SignalMessage = match serde_json::from_value(change.data) {
                    Ok(m) => m,
                    Err(e) => {
                        warn!(path, doc = %change.doc_id, "skipping malformed mailbox doc: {e}");
                        continue;
                    }
                };
                if message.target_id != self_id || message.from != from_peer {
                    continue;
                }
                if !seen.insert(change.doc_id.clone()) {
                    debug!(doc = %change.doc_id, "duplicate mailbox delivery, ignoring");
                    continue;
                }
                if out
                    .send(IncomingSignal {
                        kind,
                        from: message.from,
                        payload: message.payload,
                    })
                    .await
                    .is_err()
                {
                    break;
                }
                // Consume. A racing reader may have deleted it already;
                // the store treats that as a no-op.
                if let Err(e) = store.delete_document(&path, &change.doc_id).await {
                    warn!(path, doc = %change.doc_id, "failed to consume mailbox doc: {e}");
                }
            }
        });

        WatchGuard { handle }
    }

    /// Delete every residual message from `from_peer` in our three
    /// mailboxes. Called at peer teardown so departed peers leave no
    /// orphaned candidate documents behind.
    pub async fn purge_from_peer(
        &self,
        self_id: &str,
        from_peer: &str,
    ) -> Result<(), SignalingError> {
        for kind in SignalKind::ALL {
            let path = self.mailbox(self_id, kind);
            let docs = self
                .store
                .query_where(&path, "from", &Value::String(from_peer.to_string()))
                .await?;
            if docs.is_empty() {
                continue;
            }
            let ids: Vec<String> = docs.into_iter().map(|(id, _)| id).collect();
            self.store.batch_delete(&path, &ids).await?;
        }
        Ok(())
    }

    /// Drain our own mailboxes entirely. Called when leaving the channel.
    pub async fn purge_own_mailboxes(&self, self_id: &str) -> Result<(), SignalingError> {
        for kind in SignalKind::ALL {
            let path = self.mailbox(self_id, kind);
            let docs = self
                .store
                .query_where(&path, "targetId", &Value::String(self_id.to_string()))
                .await?;
            if docs.is_empty() {
                continue;
            }
            let ids: Vec<String> = docs.into_iter().map(|(id, _)| id).collect();
            self.store.batch_delete(&path, &ids).await?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::StoreError;
    use crate::store::{MemoryStore, StoreChange};
    use tokio::time::{timeout, Duration};

    fn transport(store: &Arc<MemoryStore>) -> SignalingTransport {
        SignalingTransport::new(store.clone() as Arc<dyn DocumentStore>, "ch")
    }

    #[tokio::test]
    async fn offer_is_delivered_then_consumed() {
        let store = MemoryStore::new();
        let t = transport(&store);
        let (tx, mut rx) = mpsc::channel(8);
        let _guard = t.watch(SignalKind::Offer, "a", "m", tx);

        t.send_offer(
            "m",
            "a",
            &SdpPayload {
                kind: "offer".into(),
                sdp: "v=0".into(),
            },
        )
        .await
        .unwrap();

        let incoming = timeout(Duration::from_secs(1), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(incoming.kind, SignalKind::Offer);
        assert_eq!(incoming.from, "m");

        // The mailbox doc must be gone once processed.
        tokio::time::sleep(Duration::from_millis(50)).await;
        let left = store
            .query_where(
                "channels/ch/peers/a/offers",
                "targetId",
                &serde_json::json!("a"),
            )
            .await
            .unwrap();
        assert!(left.is_empty());
    }

    #[tokio::test]
    async fn watch_filters_sender_and_target() {
        let store = MemoryStore::new();
        let t = transport(&store);
        let (tx, mut rx) = mpsc::channel(8);
        let _guard = t.watch(SignalKind::Answer, "a", "m", tx);

        // Wrong sender: lands in a's mailbox but the m-scoped watcher
        // must not consume it.
        t.send_answer(
            "z",
            "a",
            &SdpPayload {
                kind: "answer".into(),
                sdp: "z".into(),
            },
        )
        .await
        .unwrap();
        t.send_answer(
            "m",
            "a",
            &SdpPayload {
                kind: "answer".into(),
                sdp: "m".into(),
            },
        )
        .await
        .unwrap();

        let incoming = timeout(Duration::from_secs(1), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(incoming.from, "m");
        assert!(rx.try_recv().is_err());
    }

    /// Delegates to a `MemoryStore` but notifies every `Added` twice,
    /// like a replay after reconnect.
    struct RedeliveringStore {
        inner: Arc<MemoryStore>,
    }

    #[async_trait::async_trait]
    impl DocumentStore for RedeliveringStore {
        async fn set_document(
            &self,
            path: &str,
            doc_id: &str,
            value: Value,
            merge: bool,
        ) -> Result<(), StoreError> {
            self.inner.set_document(path, doc_id, value, merge).await
        }

        async fn add_document(&self, path: &str, value: Value) -> Result<String, StoreError> {
            self.inner.add_document(path, value).await
        }

        async fn delete_document(&self, path: &str, doc_id: &str) -> Result<(), StoreError> {
            self.inner.delete_document(path, doc_id).await
        }

        async fn batch_delete(&self, path: &str, doc_ids: &[String]) -> Result<(), StoreError> {
            self.inner.batch_delete(path, doc_ids).await
        }

        async fn query_where(
            &self,
            path: &str,
            field: &str,
            value: &Value,
        ) -> Result<Vec<(String, Value)>, StoreError> {
            self.inner.query_where(path, field, value).await
        }

        async fn subscribe(&self, path: &str) -> mpsc::Receiver<StoreChange> {
            let mut inner_rx = self.inner.subscribe(path).await;
            let (tx, rx) = mpsc::channel(64);
            tokio::spawn(async move {
                while let Some(change) = inner_rx.recv().await {
                    let duplicate = change.kind == ChangeKind::Added;
                    if tx.send(change.clone()).await.is_err() {
                        break;
                    }
                    if duplicate && tx.send(change).await.is_err() {
                        break;
                    }
                }
            });
            rx
        }
    }

    #[tokio::test]
    async fn redelivered_doc_is_forwarded_once() {
        let store = Arc::new(RedeliveringStore {
            inner: MemoryStore::new(),
        });
        let t = SignalingTransport::new(store as Arc<dyn DocumentStore>, "ch");
        let (tx, mut rx) = mpsc::channel(8);
        let _guard = t.watch(SignalKind::Offer, "a", "m", tx);

        t.send_offer(
            "m",
            "a",
            &SdpPayload {
                kind: "offer".into(),
                sdp: "v=0".into(),
            },
        )
        .await
        .unwrap();

        let incoming = timeout(Duration::from_secs(1), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(incoming.from, "m");

        // The second delivery of the same doc id must be swallowed by the
        // consumed-id guard, not applied again.
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn purge_from_peer_clears_residuals() {
        let store = MemoryStore::new();
        let t = transport(&store);
        for _ in 0..3 {
            t.send_candidate(
                "m",
                "a",
                &CandidatePayload {
                    candidate: "c".into(),
                    sdp_mid: Some("0".into()),
                    sdp_mline_index: Some(0),
                },
            )
            .await
            .unwrap();
        }
        t.send_offer(
            "m",
            "a",
            &SdpPayload {
                kind: "offer".into(),
                sdp: "v=0".into(),
            },
        )
        .await
        .unwrap();

        t.purge_from_peer("a", "m").await.unwrap();

        for kind in SignalKind::ALL {
            let path = format!("channels/ch/peers/a/{}", kind.collection());
            let docs = store
                .query_where(&path, "from", &serde_json::json!("m"))
                .await
                .unwrap();
            assert!(docs.is_empty(), "residual docs in {path}");
        }
    }
}

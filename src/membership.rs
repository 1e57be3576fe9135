use std::collections::BTreeSet;
use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::store::{ChangeKind, DocumentStore};

/// One recomputed membership snapshot, already diffed against the
/// previously observed set. `joined` and `left` are disjoint.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct MembershipDiff {
    pub joined: Vec<String>,
    pub left: Vec<String>,
}

/// Live view of a channel's participant-id set.
///
/// Subscribes to the channel document and, on every snapshot, recomputes
/// the full set and emits the diff. There is no ordering guarantee between
/// snapshots beyond most-recent-wins; consumers get full-recompute diffs,
/// never a delta stream from the store itself.
pub struct MembershipWatcher {
    handle: JoinHandle<()>,
}

impl MembershipWatcher {
    pub fn spawn(
        store: Arc<dyn DocumentStore>,
        channel_id: impl Into<String>,
    ) -> (Self, mpsc::Receiver<MembershipDiff>) {
        let channel_id = channel_id.into();
        let (tx, rx) = mpsc::channel(32);

        let handle = tokio::spawn(async move {
            let mut store_rx = store.subscribe("channels").await;
            let mut known: BTreeSet<String> = BTreeSet::new();

            while let Some(change) = store_rx.recv().await {
                if change.doc_id != channel_id {
                    continue;
                }
                let current: BTreeSet<String> = match change.kind {
                    // Channel doc deleted: everyone is gone.
                    ChangeKind::Removed => BTreeSet::new(),
                    ChangeKind::Added | ChangeKind::Modified => {
                        match parse_participants(&change.data) {
                            Some(set) => set,
                            None => {
                                warn!(channel = %channel_id, "channel doc missing participants array");
                                continue;
                            }
                        }
                    }
                };

                let joined: Vec<String> =
                    current.difference(&known).cloned().collect();
                let left: Vec<String> = known.difference(&current).cloned().collect();
                known = current;

                if joined.is_empty() && left.is_empty() {
                    continue;
                }
                debug!(channel = %channel_id, ?joined, ?left, "membership changed");
                if tx.send(MembershipDiff { joined, left }).await.is_err() {
                    break;
                }
            }
        });

        (Self { handle }, rx)
    }
}

impl Drop for MembershipWatcher {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

fn parse_participants(data: &serde_json::Value) -> Option<BTreeSet<String>> {
    Some(
        data.get("participants")?
            .as_array()?
            .iter()
            .filter_map(|v| v.as_str().map(str::to_string))
            .collect(),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use serde_json::json;
    use tokio::time::{timeout, Duration};

    async fn set_participants(store: &Arc<MemoryStore>, ids: &[&str]) {
        store
            .set_document("channels", "ch", json!({ "participants": ids }), false)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn emits_joined_then_left() {
        let store = MemoryStore::new();
        let (_watcher, mut rx) =
            MembershipWatcher::spawn(store.clone() as Arc<dyn DocumentStore>, "ch");

        set_participants(&store, &["a", "m"]).await;
        let diff = timeout(Duration::from_secs(1), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(diff.joined, vec!["a".to_string(), "m".to_string()]);
        assert!(diff.left.is_empty());

        set_participants(&store, &["a"]).await;
        let diff = timeout(Duration::from_secs(1), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert!(diff.joined.is_empty());
        assert_eq!(diff.left, vec!["m".to_string()]);
    }

    #[tokio::test]
    async fn redundant_snapshot_emits_nothing() {
        let store = MemoryStore::new();
        set_participants(&store, &["a"]).await;
        let (_watcher, mut rx) =
            MembershipWatcher::spawn(store.clone() as Arc<dyn DocumentStore>, "ch");

        // Replay snapshot.
        let first = timeout(Duration::from_secs(1), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(first.joined, vec!["a".to_string()]);

        // Same set written again: full recompute, empty diff, no emit.
        set_participants(&store, &["a"]).await;
        set_participants(&store, &["a", "b"]).await;
        let next = timeout(Duration::from_secs(1), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(next.joined, vec!["b".to_string()]);
    }

    #[tokio::test]
    async fn other_channels_are_ignored() {
        let store = MemoryStore::new();
        let (_watcher, mut rx) =
            MembershipWatcher::spawn(store.clone() as Arc<dyn DocumentStore>, "ch");

        store
            .set_document("channels", "other", json!({ "participants": ["x"] }), false)
            .await
            .unwrap();
        set_participants(&store, &["a"]).await;

        let diff = timeout(Duration::from_secs(1), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(diff.joined, vec!["a".to_string()]);
    }
}

use serde::Serialize;
use tokio::sync::broadcast;

/// Events the core emits outward. Consumed by whatever product surface sits
/// on top (UI bridge, bot glue); the core never depends on the consumer.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", content = "data")]
pub enum SessionEvent {
    /// A direct connection to a remote participant reached connected.
    PeerConnected { peer_id: String },
    /// A peer left, failed, or was closed; its media is gone.
    PeerDisconnected { peer_id: String },
    /// A remote media stream became available for playback.
    RemoteStreamAdded { peer_id: String },
    /// Speaking flag flipped for a participant ("local" included).
    SpeakingChanged { peer_id: String, speaking: bool },
    /// Local capture failed; the join was aborted.
    LocalMediaFailed { reason: String },
    /// One peer's connection failed or disconnected. Other peers unaffected.
    PeerFailed { peer_id: String, reason: String },
    /// Local participant finished joining (media acquired, watcher running).
    Joined { channel_id: String },
    /// Local participant left; all connections torn down.
    Left { channel_id: String },
}

pub type EventSender = broadcast::Sender<SessionEvent>;
pub type EventReceiver = broadcast::Receiver<SessionEvent>;

pub fn create_event_bus() -> (EventSender, EventReceiver) {
    broadcast::channel(256)
}

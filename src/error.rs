use thiserror::Error;

/// Document-store call failures. The store client owns retry/backoff; this
/// core logs, abandons the operation, and lets a later event retry naturally.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("store unreachable: {0}")]
    Unreachable(String),
    #[error("document not found: {path}/{doc_id}")]
    NotFound { path: String, doc_id: String },
    #[error("malformed document at {path}: {reason}")]
    Malformed { path: String, reason: String },
}

/// Signaling-layer failures: a store call or a payload encode/decode went
/// wrong while carrying an offer, answer, or candidate.
#[derive(Debug, Error)]
pub enum SignalingError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("signaling payload encode/decode failed: {0}")]
    Codec(#[from] serde_json::Error),
}

/// Local capture failed. Fatal to joining a channel (participation requires
/// local media), not to anything else.
#[derive(Debug, Error)]
pub enum LocalMediaError {
    #[error("media capture failed: {0}")]
    CaptureFailed(String),
    #[error("no capture device matching constraints")]
    NoDevice,
}

/// A single peer's connection pipeline failed. Isolated per peer: recorded
/// as that peer's state, never aborts other peers or the local session.
#[derive(Debug, Error)]
pub enum PeerConnectionError {
    #[error("connection setup failed for {peer_id}: {reason}")]
    Setup { peer_id: String, reason: String },
    #[error("negotiation failed for {peer_id}: {reason}")]
    Negotiation { peer_id: String, reason: String },
    #[error("ice failure for {peer_id}")]
    IceFailed { peer_id: String },
    #[error("track operation failed for {peer_id}: {reason}")]
    Track { peer_id: String, reason: String },
}

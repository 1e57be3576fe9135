use std::any::Any;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::error::PeerConnectionError;

/// A session description as carried over signaling: `kind` is "offer" or
/// "answer", `sdp` is the standard encoding produced by the connection
/// primitive. Opaque to this crate beyond those two fields.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SdpPayload {
    pub kind: String,
    pub sdp: String,
}

/// A proposed network path for the direct connection.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CandidatePayload {
    pub candidate: String,
    pub sdp_mid: Option<String>,
    pub sdp_mline_index: Option<u16>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TrackKind {
    Audio,
    Video,
}

/// Connection lifecycle as reported by the primitive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum LinkState {
    New,
    Connecting,
    Connected,
    Disconnected,
    Failed,
    Closed,
}

/// An outgoing media track handed to links as a sender source. Concrete
/// types belong to the capture/connection adapters; `as_any` lets an
/// adapter recover its own type.
pub trait OutboundTrack: Send + Sync {
    fn id(&self) -> &str;
    fn kind(&self) -> TrackKind;
    fn as_any(&self) -> &dyn Any;
}

/// Decoded audio from one remote participant: 48kHz mono f32 PCM frames.
/// Feeds the speaking detector and whatever playback sits above this core.
#[derive(Debug)]
pub struct RemoteStream {
    pub peer_id: String,
    pub frames: mpsc::Receiver<Vec<f32>>,
}

/// Events a link pushes back to its owner.
#[derive(Debug)]
pub enum LinkEvent {
    StateChanged {
        peer_id: String,
        state: LinkState,
    },
    /// The remote side's media arrived.
    RemoteStream {
        peer_id: String,
        stream: RemoteStream,
    },
    /// A locally gathered candidate that must be signaled to the peer.
    LocalCandidate {
        peer_id: String,
        candidate: CandidatePayload,
    },
}

/// Handle to one outgoing track on one link; supports in-place replacement
/// without renegotiation.
#[async_trait]
pub trait TrackSender: Send + Sync {
    fn kind(&self) -> TrackKind;
    async fn replace(&self, track: Arc<dyn OutboundTrack>) -> Result<(), PeerConnectionError>;
}

/// The point-to-point connection primitive, as a capability object. The
/// production implementation lives in [`crate::rtc`]; tests script their
/// own.
#[async_trait]
pub trait PeerLink: Send + Sync {
    async fn add_track(
        &self,
        track: Arc<dyn OutboundTrack>,
    ) -> Result<Box<dyn TrackSender>, PeerConnectionError>;
    async fn create_offer(&self) -> Result<SdpPayload, PeerConnectionError>;
    async fn create_answer(&self) -> Result<SdpPayload, PeerConnectionError>;
    async fn set_local_description(&self, desc: SdpPayload) -> Result<(), PeerConnectionError>;
    async fn set_remote_description(&self, desc: SdpPayload) -> Result<(), PeerConnectionError>;
    async fn add_ice_candidate(
        &self,
        candidate: CandidatePayload,
    ) -> Result<(), PeerConnectionError>;
    async fn close(&self);
}

/// Factory for links. `events` receives state changes, remote streams, and
/// locally gathered candidates for the created link.
#[async_trait]
pub trait PeerConnector: Send + Sync {
    async fn connect(
        &self,
        peer_id: &str,
        events: mpsc::Sender<LinkEvent>,
    ) -> Result<Arc<dyn PeerLink>, PeerConnectionError>;
}

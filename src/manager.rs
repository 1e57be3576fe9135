use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::error::PeerConnectionError;
use crate::events::{EventSender, SessionEvent};
use crate::link::{
    CandidatePayload, LinkEvent, LinkState, PeerConnector, PeerLink, SdpPayload, TrackSender,
};
use crate::media::LocalStream;
use crate::signaling::{IncomingSignal, SignalKind, SignalingTransport, WatchGuard};

/// Deterministic glare avoidance: for any unordered pair of participant
/// ids, the lexicographically greater id creates the offer and the lesser
/// one answers. `str` ordering is total and antisymmetric, so exactly one
/// side of every pair initiates; changing the id format must preserve
/// those two properties.
pub fn is_initiator(self_id: &str, remote_id: &str) -> bool {
    self_id > remote_id
}

/// Negotiation phase for one remote participant.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerPhase {
    /// Link created; `offered` records which side of the offer/answer
    /// exchange we are on.
    Connecting { offered: bool },
    Connected,
    /// Connection failed or dropped. Kept until the peer leaves the
    /// membership set; rejoining re-triggers a fresh connection.
    Failed,
}

/// Everything owned for one remote participant. A single teardown routine
/// releases it all together: watch guards are dropped before the link is
/// closed, so no signaling message is ever applied to a half-destroyed
/// connection.
struct PeerEntry {
    watches: Vec<WatchGuard>,
    link: Arc<dyn PeerLink>,
    audio_sender: Option<Box<dyn TrackSender>>,
    video_sender: Option<Box<dyn TrackSender>>,
    phase: PeerPhase,
    error: Option<String>,
}

/// Maintains the set of direct connections, one per remote participant,
/// and drives the offer/answer/ICE exchange through the signaling
/// transport.
pub struct PeerConnectionManager {
    self_id: String,
    signaling: SignalingTransport,
    connector: Arc<dyn PeerConnector>,
    link_events: mpsc::Sender<LinkEvent>,
    signal_tx: mpsc::Sender<IncomingSignal>,
    event_tx: EventSender,
    peers: HashMap<String, PeerEntry>,
}

impl PeerConnectionManager {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        self_id: impl Into<String>,
        signaling: SignalingTransport,
        connector: Arc<dyn PeerConnector>,
        link_events: mpsc::Sender<LinkEvent>,
        signal_tx: mpsc::Sender<IncomingSignal>,
        event_tx: EventSender,
    ) -> Self {
        Self {
            self_id: self_id.into(),
            signaling,
            connector,
            link_events,
            signal_tx,
            event_tx,
            peers: HashMap::new(),
        }
    }

    /// Open a connection toward a newly present participant. No-op for the
    /// local id or for a peer that already has one. Adds the current local
    /// tracks, registers the three per-peer signaling watchers, and sends
    /// the offer iff we are the initiator for this pair.
    pub async fn ensure_peer(
        &mut self,
        peer_id: &str,
        local: &LocalStream,
    ) -> Result<(), PeerConnectionError> {
        if peer_id == self.self_id || self.peers.contains_key(peer_id) {
            return Ok(());
        }
        info!(peer = peer_id, "opening peer connection");

        let link = self
            .connector
            .connect(peer_id, self.link_events.clone())
            .await?;

        let audio_sender = link.add_track(local.audio.clone()).await?;
        let video_sender = match &local.video {
            Some(video) => Some(link.add_track(video.clone()).await?),
            None => None,
        };

        let watches = SignalKind::ALL
            .iter()
            .map(|kind| {
                self.signaling
                    .watch(*kind, &self.self_id, peer_id, self.signal_tx.clone())
            })
            .collect();

        let offered = is_initiator(&self.self_id, peer_id);
        if offered {
            let offer = link.create_offer().await?;
            link.set_local_description(offer.clone()).await?;
            if let Err(e) = self.signaling.send_offer(&self.self_id, peer_id, &offer).await {
                // Store write failed: log and abandon. The peer can still
                // reach us by leaving and rejoining the membership set.
                warn!(peer = peer_id, "failed to send offer: {e}");
            }
        }

        self.peers.insert(
            peer_id.to_string(),
            PeerEntry {
                watches,
                link,
                audio_sender: Some(audio_sender),
                video_sender,
                phase: PeerPhase::Connecting { offered },
                error: None,
            },
        );
        Ok(())
    }

    /// Route one consumed mailbox message. Messages for unknown or already
    /// torn-down peers are dropped (apply-if-still-valid).
    pub async fn handle_signal(&mut self, signal: IncomingSignal) {
        let from = signal.from.clone();
        match signal.kind {
            SignalKind::Offer => self.handle_offer(&from, signal.payload).await,
            SignalKind::Answer => self.handle_answer(&from, signal.payload).await,
            SignalKind::IceCandidate => self.handle_candidate(&from, signal.payload).await,
        }
    }

    async fn handle_offer(&mut self, from: &str, payload: serde_json::Value) {
        let Some(entry) = self.peers.get(from) else {
            debug!(peer = from, "offer for unknown peer, dropping");
            return;
        };
        if entry.phase != (PeerPhase::Connecting { offered: false }) {
            debug!(peer = from, phase = ?entry.phase, "offer out of phase, dropping");
            return;
        }
        let offer: SdpPayload = match serde_json::from_value(payload) {
            Ok(o) => o,
            Err(e) => {
                warn!(peer = from, "malformed offer payload: {e}");
                return;
            }
        };

        let link = entry.link.clone();
        let result: Result<SdpPayload, PeerConnectionError> = async {
            link.set_remote_description(offer).await?;
            let answer = link.create_answer().await?;
            link.set_local_description(answer.clone()).await?;
            Ok(answer)
        }
        .await;

        match result {
            Ok(answer) => {
                if let Err(e) = self.signaling.send_answer(&self.self_id, from, &answer).await {
                    warn!(peer = from, "failed to send answer: {e}");
                }
            }
            Err(e) => self.mark_failed(from, &e.to_string()),
        }
    }

    async fn handle_answer(&mut self, from: &str, payload: serde_json::Value) {
        let Some(entry) = self.peers.get(from) else {
            debug!(peer = from, "answer for unknown peer, dropping");
            return;
        };
        if entry.phase != (PeerPhase::Connecting { offered: true }) {
            debug!(peer = from, phase = ?entry.phase, "answer out of phase, dropping");
            return;
        }
        let answer: SdpPayload = match serde_json::from_value(payload) {
            Ok(a) => a,
            Err(e) => {
                warn!(peer = from, "malformed answer payload: {e}");
                return;
            }
        };
        let link = entry.link.clone();
        if let Err(e) = link.set_remote_description(answer).await {
            let reason = e.to_string();
            self.mark_failed(from, &reason);
        }
    }

    async fn handle_candidate(&mut self, from: &str, payload: serde_json::Value) {
        // Candidates apply in any phase; a torn-down peer has no entry.
        let Some(entry) = self.peers.get(from) else {
            debug!(peer = from, "candidate for unknown peer, dropping");
            return;
        };
        let candidate: CandidatePayload = match serde_json::from_value(payload) {
            Ok(c) => c,
            Err(e) => {
                warn!(peer = from, "malformed candidate payload: {e}");
                return;
            }
        };
        if let Err(e) = entry.link.add_ice_candidate(candidate).await {
            debug!(peer = from, "failed to apply candidate: {e}");
        }
    }

    /// Apply a connection-state report from the link itself.
    pub fn handle_link_state(&mut self, peer_id: &str, state: LinkState) {
        let Some(entry) = self.peers.get_mut(peer_id) else {
            return;
        };
        match state {
            LinkState::Connected => {
                entry.phase = PeerPhase::Connected;
                info!(peer = peer_id, "peer connected");
                let _ = self.event_tx.send(SessionEvent::PeerConnected {
                    peer_id: peer_id.to_string(),
                });
            }
            LinkState::Disconnected | LinkState::Failed => {
                let reason = format!("connection state {state:?}");
                self.mark_failed(peer_id, &reason);
            }
            LinkState::New | LinkState::Connecting | LinkState::Closed => {}
        }
    }

    /// Record a per-peer failure. Isolated: no other peer is touched and
    /// there is no automatic retry.
    fn mark_failed(&mut self, peer_id: &str, reason: &str) {
        if let Some(entry) = self.peers.get_mut(peer_id) {
            if entry.phase == PeerPhase::Failed {
                return;
            }
            warn!(peer = peer_id, reason, "peer connection failed");
            entry.phase = PeerPhase::Failed;
            entry.error = Some(reason.to_string());
            let _ = self.event_tx.send(SessionEvent::PeerFailed {
                peer_id: peer_id.to_string(),
                reason: reason.to_string(),
            });
        }
    }

    /// Tear down one peer: watchers first, then the link, then a
    /// best-effort purge of its residual mailbox entries. Idempotent.
    pub async fn remove_peer(&mut self, peer_id: &str) -> bool {
        let Some(entry) = self.peers.remove(peer_id) else {
            return false;
        };
        // Unsubscribe before touching the link.
        drop(entry.watches);
        entry.link.close().await;

        let signaling = self.signaling.clone();
        let self_id = self.self_id.clone();
        let peer = peer_id.to_string();
        tokio::spawn(async move {
            if let Err(e) = signaling.purge_from_peer(&self_id, &peer).await {
                warn!(peer = %peer, "mailbox purge failed: {e}");
            }
        });

        info!(peer = peer_id, "peer connection closed");
        let _ = self.event_tx.send(SessionEvent::PeerDisconnected {
            peer_id: peer_id.to_string(),
        });
        true
    }

    /// Tear down every peer (local leave).
    pub async fn close_all(&mut self) {
        let ids: Vec<String> = self.peers.keys().cloned().collect();
        for id in ids {
            self.remove_peer(&id).await;
        }
    }

    /// Swap the outgoing tracks on every live connection in place. No
    /// renegotiation: each sender keeps its negotiated slot and only the
    /// source changes.
    pub async fn replace_tracks(&mut self, local: &LocalStream) {
        for (peer_id, entry) in &mut self.peers {
            if let Some(sender) = &entry.audio_sender {
                if let Err(e) = sender.replace(local.audio.clone()).await {
                    warn!(peer = %peer_id, "audio track replace failed: {e}");
                }
            }
            match (&entry.video_sender, &local.video) {
                (Some(sender), Some(video)) => {
                    if let Err(e) = sender.replace(video.clone()).await {
                        warn!(peer = %peer_id, "video track replace failed: {e}");
                    }
                }
                (None, Some(video)) => match entry.link.add_track(video.clone()).await {
                    Ok(sender) => {
                        // This sender has no negotiated slot; on transports
                        // that need an offer/answer round for new senders it
                        // carries nothing until the connection is rebuilt
                        // (leave and rejoin).
                        warn!(
                            peer = %peer_id,
                            "video sender added mid-call without a negotiated slot"
                        );
                        entry.video_sender = Some(sender);
                    }
                    Err(e) => warn!(peer = %peer_id, "video track add failed: {e}"),
                },
                // Video turned off: the sender stays idle until the next
                // stream carries a video track again.
                (Some(_), None) | (None, None) => {}
            }
        }
    }

    pub fn has_peer(&self, peer_id: &str) -> bool {
        self.peers.contains_key(peer_id)
    }

    pub fn peer_ids(&self) -> Vec<String> {
        self.peers.keys().cloned().collect()
    }

    pub fn connected_peers(&self) -> Vec<String> {
        self.peers
            .iter()
            .filter(|(_, e)| e.phase == PeerPhase::Connected)
            .map(|(id, _)| id.clone())
            .collect()
    }

    pub fn phase(&self, peer_id: &str) -> Option<PeerPhase> {
        self.peers.get(peer_id).map(|e| e.phase)
    }

    pub fn peer_error(&self, peer_id: &str) -> Option<&str> {
        self.peers.get(peer_id).and_then(|e| e.error.as_deref())
    }
}

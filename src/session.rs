use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

use crate::events::{create_event_bus, EventSender, SessionEvent};
use crate::link::{LinkEvent, PeerConnector};
use crate::manager::PeerConnectionManager;
use crate::media::{CaptureConstraints, MediaCapture, MediaLifecycle};
use crate::membership::{MembershipDiff, MembershipWatcher};
use crate::signaling::{IncomingSignal, SignalingTransport};
use crate::speaking::{
    FftAnalyzer, ProfileSink, SpeakingConfig, SpeakingDetector, LOCAL_PARTICIPANT,
};
use crate::store::DocumentStore;

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// STUN/TURN URLs handed to the connection primitive.
    pub ice_servers: Vec<String>,
    pub speaking: SpeakingConfig,
    /// Speaking-detector poll period. Stands in for the animation tick of
    /// a rendering host.
    pub tick_interval_ms: u64,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            ice_servers: vec![
                "stun:stun.l.google.com:19302".to_string(),
                "stun:stun1.l.google.com:19302".to_string(),
            ],
            speaking: SpeakingConfig::default(),
            tick_interval_ms: 33,
        }
    }
}

/// Commands sent into the session loop from the product surface.
#[derive(Debug)]
pub enum SessionCommand {
    Join {
        channel_id: String,
        constraints: CaptureConstraints,
    },
    Leave,
    /// Capture-mode or device change while in the channel: reacquire and
    /// replace tracks in place, never renegotiate.
    SwitchDevice { constraints: CaptureConstraints },
}

/// Snapshot of the session, published over a watch channel.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ChannelSnapshot {
    pub in_channel: bool,
    pub channel_id: Option<String>,
    pub connected_peers: Vec<String>,
    pub remote_streams: Vec<String>,
    pub speaking: Vec<String>,
    pub local_media_error: Option<String>,
}

/// Handle held by the caller: commands in, events and snapshots out.
#[derive(Clone)]
pub struct SessionHandle {
    pub command_tx: mpsc::Sender<SessionCommand>,
    pub events: EventSender,
    pub snapshot_rx: watch::Receiver<ChannelSnapshot>,
}

/// Everything that exists only while joined to a channel. Dropping it
/// cancels the membership subscription.
struct ActiveChannel {
    channel_id: String,
    signaling: SignalingTransport,
    manager: PeerConnectionManager,
    _membership: MembershipWatcher,
    membership_rx: mpsc::Receiver<MembershipDiff>,
}

pub struct Session;

impl Session {
    /// Spawn the session event loop and return its handle.
    pub fn spawn(
        config: SessionConfig,
        store: Arc<dyn DocumentStore>,
        capture: Arc<dyn MediaCapture>,
        connector: Arc<dyn PeerConnector>,
        profile: Arc<dyn ProfileSink>,
        self_id: impl Into<String>,
    ) -> SessionHandle {
        let (command_tx, command_rx) = mpsc::channel(64);
        let (event_tx, _event_rx) = create_event_bus();
        let (snapshot_tx, snapshot_rx) = watch::channel(ChannelSnapshot::default());
        let handle = SessionHandle {
            command_tx,
            events: event_tx.clone(),
            snapshot_rx,
        };
        tokio::spawn(run_session(
            config,
            store,
            capture,
            connector,
            profile,
            command_rx,
            event_tx,
            snapshot_tx,
            self_id.into(),
        ));
        handle
    }
}

/// The session event loop. All core state lives here; collaborator
/// callbacks deliver over channels, so state mutation between awaits is
/// atomic with respect to the rest of the core.
#[allow(clippy::too_many_arguments)]
pub async fn run_session(
    config: SessionConfig,
    store: Arc<dyn DocumentStore>,
    capture: Arc<dyn MediaCapture>,
    connector: Arc<dyn PeerConnector>,
    profile: Arc<dyn ProfileSink>,
    mut cmd_rx: mpsc::Receiver<SessionCommand>,
    event_tx: EventSender,
    snapshot_tx: watch::Sender<ChannelSnapshot>,
    self_id: String,
) {
    info!(%self_id, "session started");

    let mut media = MediaLifecycle::new(capture);
    let mut detector = SpeakingDetector::new(config.speaking.clone(), profile, event_tx.clone());
    let mut remote_streams: BTreeSet<String> = BTreeSet::new();
    let mut current: Option<ActiveChannel> = None;

    let (link_tx, mut link_rx) = mpsc::channel::<LinkEvent>(256);
    let (signal_tx, mut signal_rx) = mpsc::channel::<IncomingSignal>(256);

    let mut tick = tokio::time::interval(Duration::from_millis(config.tick_interval_ms.max(1)));
    tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    macro_rules! publish_snapshot {
        () => {
            let _ = snapshot_tx.send(ChannelSnapshot {
                in_channel: current.is_some(),
                channel_id: current.as_ref().map(|c| c.channel_id.clone()),
                connected_peers: current
                    .as_ref()
                    .map(|c| c.manager.connected_peers())
                    .unwrap_or_default(),
                remote_streams: remote_streams.iter().cloned().collect(),
                speaking: detector.speaking_ids(),
                local_media_error: media.last_error().map(str::to_string),
            });
        };
    }

    macro_rules! leave_channel {
        () => {
            if let Some(mut active) = current.take() {
                info!(channel = %active.channel_id, "leaving channel");
                // Cleanup path: local speaking flag goes false before
                // anything else is torn down.
                detector.detach_all();
                active.manager.close_all().await;
                remote_streams.clear();
                media.release();

                // Best-effort async mailbox drain; local state is already
                // cleared and nothing waits on it.
                let signaling = active.signaling.clone();
                let id = self_id.clone();
                tokio::spawn(async move {
                    if let Err(e) = signaling.purge_own_mailboxes(&id).await {
                        debug!("own-mailbox purge failed: {e}");
                    }
                });

                let _ = event_tx.send(SessionEvent::Left {
                    channel_id: active.channel_id,
                });
            }
        };
    }

    loop {
        tokio::select! {
            maybe_cmd = cmd_rx.recv() => {
                // Handle dropped: tear down and stop.
                let Some(cmd) = maybe_cmd else {
                    leave_channel!();
                    break;
                };
                match cmd {
                    SessionCommand::Join { channel_id, constraints } => {
                        leave_channel!();
                        info!(channel = %channel_id, "joining channel");

                        // Participation requires local media: on capture
                        // failure, record the error and create no peer
                        // connections at all.
                        match media.acquire(constraints).await {
                            Ok(stream) => {
                                if let Some(monitor) = stream.take_monitor() {
                                    detector.attach(
                                        LOCAL_PARTICIPANT,
                                        Box::new(FftAnalyzer::new(monitor)),
                                    );
                                }
                            }
                            Err(e) => {
                                let _ = event_tx.send(SessionEvent::LocalMediaFailed {
                                    reason: e.to_string(),
                                });
                                publish_snapshot!();
                                continue;
                            }
                        }

                        let signaling = SignalingTransport::new(store.clone(), &channel_id);
                        let manager = PeerConnectionManager::new(
                            &self_id,
                            signaling.clone(),
                            connector.clone(),
                            link_tx.clone(),
                            signal_tx.clone(),
                            event_tx.clone(),
                        );
                        let (membership, membership_rx) =
                            MembershipWatcher::spawn(store.clone(), &channel_id);

                        current = Some(ActiveChannel {
                            channel_id: channel_id.clone(),
                            signaling,
                            manager,
                            _membership: membership,
                            membership_rx,
                        });
                        let _ = event_tx.send(SessionEvent::Joined { channel_id });
                        publish_snapshot!();
                    }

                    SessionCommand::Leave => {
                        leave_channel!();
                        publish_snapshot!();
                    }

                    SessionCommand::SwitchDevice { constraints } => {
                        if current.is_none() {
                            warn!("device switch ignored: not in a channel");
                            continue;
                        }
                        match media.reacquire(constraints).await {
                            Ok(stream) => {
                                if let Some(monitor) = stream.take_monitor() {
                                    detector.attach(
                                        LOCAL_PARTICIPANT,
                                        Box::new(FftAnalyzer::new(monitor)),
                                    );
                                }
                            }
                            Err(e) => {
                                let _ = event_tx.send(SessionEvent::LocalMediaFailed {
                                    reason: e.to_string(),
                                });
                                publish_snapshot!();
                                continue;
                            }
                        }
                        if let (Some(active), Some(stream)) =
                            (current.as_mut(), media.current())
                        {
                            active.manager.replace_tracks(stream).await;
                        }
                        publish_snapshot!();
                    }
                }
            }

            // One membership diff is applied fully before the next is read.
            Some(diff) = async {
                match current.as_mut() {
                    Some(active) => active.membership_rx.recv().await,
                    None => std::future::pending().await,
                }
            } => {
                if let Some(active) = current.as_mut() {
                    for id in &diff.left {
                        active.manager.remove_peer(id).await;
                        detector.detach(id);
                        remote_streams.remove(id);
                    }
                    for id in &diff.joined {
                        if id == &self_id {
                            continue;
                        }
                        let Some(stream) = media.current() else {
                            warn!(peer = %id, "no local media, skipping peer");
                            continue;
                        };
                        if let Err(e) = active.manager.ensure_peer(id, stream).await {
                            warn!(peer = %id, "failed to open peer connection: {e}");
                            let _ = event_tx.send(SessionEvent::PeerFailed {
                                peer_id: id.clone(),
                                reason: e.to_string(),
                            });
                        }
                    }
                }
                publish_snapshot!();
            }

            // Consumed mailbox messages, routed per peer.
            Some(signal) = signal_rx.recv() => {
                if let Some(active) = current.as_mut() {
                    active.manager.handle_signal(signal).await;
                }
                publish_snapshot!();
            }

            // Reports from the connection primitive.
            Some(link_event) = link_rx.recv() => {
                match link_event {
                    LinkEvent::StateChanged { peer_id, state } => {
                        if let Some(active) = current.as_mut() {
                            active.manager.handle_link_state(&peer_id, state);
                        }
                    }
                    LinkEvent::RemoteStream { peer_id, stream } => {
                        debug!(peer = %peer_id, "remote stream attached");
                        detector.attach(&peer_id, Box::new(FftAnalyzer::new(stream.frames)));
                        remote_streams.insert(peer_id.clone());
                        let _ = event_tx.send(SessionEvent::RemoteStreamAdded { peer_id });
                    }
                    LinkEvent::LocalCandidate { peer_id, candidate } => {
                        if let Some(active) = current.as_ref() {
                            if let Err(e) = active
                                .signaling
                                .send_candidate(&self_id, &peer_id, &candidate)
                                .await
                            {
                                warn!(peer = %peer_id, "failed to send candidate: {e}");
                            }
                        }
                    }
                }
                publish_snapshot!();
            }

            // Animation-tick stand-in: poll every analyzer once.
            _ = tick.tick() => {
                if !detector.tick().is_empty() {
                    publish_snapshot!();
                }
            }
        }
    }

    info!(%self_id, "session stopped");
}

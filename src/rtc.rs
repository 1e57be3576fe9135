//! Production adapter: the [`crate::link`] seam implemented on the
//! `webrtc` crate, with Opus sample tracks for outgoing audio and decoded
//! PCM feeds for incoming audio.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, info, warn};
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::MediaEngine;
use webrtc::api::APIBuilder;
use webrtc::ice_transport::ice_candidate::RTCIceCandidateInit;
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::media::Sample;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtp_transceiver::rtp_codec::{RTCRtpCodecCapability, RTPCodecType};
use webrtc::rtp_transceiver::rtp_sender::RTCRtpSender;
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;
use webrtc::track::track_local::TrackLocal;

use crate::error::{LocalMediaError, PeerConnectionError};
use crate::link::{
    CandidatePayload, LinkEvent, LinkState, OutboundTrack, PeerConnector, PeerLink, RemoteStream,
    SdpPayload, TrackKind, TrackSender,
};

const OPUS_SAMPLE_RATE: u32 = 48_000;
const OPUS_FRAME_SAMPLES: usize = 960; // 20ms at 48kHz mono

/// Opus encoder wrapper: 48kHz mono, 20ms frames (960 samples).
struct OpusEncoder {
    encoder: opus::Encoder,
}

impl OpusEncoder {
    fn new() -> Result<Self, LocalMediaError> {
        let encoder = opus::Encoder::new(
            OPUS_SAMPLE_RATE,
            opus::Channels::Mono,
            opus::Application::Voip,
        )
        .map_err(|e| LocalMediaError::CaptureFailed(format!("opus encoder: {e}")))?;
        Ok(Self { encoder })
    }

    fn encode(&mut self, pcm: &[f32]) -> Result<Vec<u8>, LocalMediaError> {
        let mut output = vec![0u8; 4000]; // max opus frame
        let len = self
            .encoder
            .encode_float(pcm, &mut output)
            .map_err(|e| LocalMediaError::CaptureFailed(format!("opus encode: {e}")))?;
        output.truncate(len);
        Ok(output)
    }
}

/// Opus decoder wrapper, one per remote audio track.
struct OpusDecoder {
    decoder: opus::Decoder,
}

impl OpusDecoder {
    fn new() -> Result<Self, PeerConnectionError> {
        let decoder = opus::Decoder::new(OPUS_SAMPLE_RATE, opus::Channels::Mono).map_err(|e| {
            PeerConnectionError::Track {
                peer_id: String::new(),
                reason: format!("opus decoder: {e}"),
            }
        })?;
        Ok(Self { decoder })
    }

    fn decode(&mut self, data: &[u8]) -> Result<Vec<f32>, opus::Error> {
        let mut output = vec![0.0f32; OPUS_FRAME_SAMPLES];
        let len = self.decoder.decode_float(data, &mut output, false)?;
        output.truncate(len);
        Ok(output)
    }
}

/// Outgoing Opus audio track. `write_pcm` encodes a 960-sample f32 frame
/// and hands it to every connection the track was added to.
pub struct RtcAudioTrack {
    id: String,
    track: Arc<TrackLocalStaticSample>,
    encoder: Mutex<OpusEncoder>,
}

impl RtcAudioTrack {
    pub fn new(id: impl Into<String>, stream_id: &str) -> Result<Arc<Self>, LocalMediaError> {
        let id = id.into();
        let track = Arc::new(TrackLocalStaticSample::new(
            RTCRtpCodecCapability {
                mime_type: "audio/opus".to_string(),
                clock_rate: OPUS_SAMPLE_RATE,
                channels: 1,
                sdp_fmtp_line: "minptime=10;useinbandfec=1".to_string(),
                rtcp_feedback: vec![],
            },
            id.clone(),
            stream_id.to_string(),
        ));
        Ok(Arc::new(Self {
            id,
            track,
            encoder: Mutex::new(OpusEncoder::new()?),
        }))
    }

    pub async fn write_pcm(&self, pcm: &[f32]) -> Result<(), LocalMediaError> {
        let data = self.encoder.lock().await.encode(pcm)?;
        self.track
            .write_sample(&Sample {
                data: data.into(),
                duration: std::time::Duration::from_millis(20),
                ..Default::default()
            })
            .await
            .map_err(|e| LocalMediaError::CaptureFailed(format!("write sample: {e}")))
    }

    fn rtp_track(&self) -> Arc<dyn TrackLocal + Send + Sync> {
        self.track.clone()
    }
}

impl OutboundTrack for RtcAudioTrack {
    fn id(&self) -> &str {
        &self.id
    }
    fn kind(&self) -> TrackKind {
        TrackKind::Audio
    }
    fn as_any(&self) -> &dyn std::any::Any {
        self
    }
}

/// Outgoing VP8 video track; callers feed it already-encoded samples.
pub struct RtcVideoTrack {
    id: String,
    track: Arc<TrackLocalStaticSample>,
}

impl RtcVideoTrack {
    pub fn new(id: impl Into<String>, stream_id: &str) -> Arc<Self> {
        let id = id.into();
        let track = Arc::new(TrackLocalStaticSample::new(
            RTCRtpCodecCapability {
                mime_type: "video/VP8".to_string(),
                clock_rate: 90_000,
                ..Default::default()
            },
            id.clone(),
            stream_id.to_string(),
        ));
        Arc::new(Self { id, track })
    }

    pub async fn write_sample(
        &self,
        data: bytes::Bytes,
        duration: std::time::Duration,
    ) -> Result<(), LocalMediaError> {
        self.track
            .write_sample(&Sample {
                data,
                duration,
                ..Default::default()
            })
            .await
            .map_err(|e| LocalMediaError::CaptureFailed(format!("write sample: {e}")))
    }

    fn rtp_track(&self) -> Arc<dyn TrackLocal + Send + Sync> {
        self.track.clone()
    }
}

impl OutboundTrack for RtcVideoTrack {
    fn id(&self) -> &str {
        &self.id
    }
    fn kind(&self) -> TrackKind {
        TrackKind::Video
    }
    fn as_any(&self) -> &dyn std::any::Any {
        self
    }
}

fn rtp_track_of(
    peer_id: &str,
    track: &Arc<dyn OutboundTrack>,
) -> Result<Arc<dyn TrackLocal + Send + Sync>, PeerConnectionError> {
    if let Some(audio) = track.as_any().downcast_ref::<RtcAudioTrack>() {
        return Ok(audio.rtp_track());
    }
    if let Some(video) = track.as_any().downcast_ref::<RtcVideoTrack>() {
        return Ok(video.rtp_track());
    }
    Err(PeerConnectionError::Track {
        peer_id: peer_id.to_string(),
        reason: "track was not created by the rtc adapter".to_string(),
    })
}

fn to_link_state(state: RTCPeerConnectionState) -> Option<LinkState> {
    match state {
        RTCPeerConnectionState::New => Some(LinkState::New),
        RTCPeerConnectionState::Connecting => Some(LinkState::Connecting),
        RTCPeerConnectionState::Connected => Some(LinkState::Connected),
        RTCPeerConnectionState::Disconnected => Some(LinkState::Disconnected),
        RTCPeerConnectionState::Failed => Some(LinkState::Failed),
        RTCPeerConnectionState::Closed => Some(LinkState::Closed),
        RTCPeerConnectionState::Unspecified => None,
    }
}

fn to_session_description(desc: &SdpPayload) -> Result<RTCSessionDescription, PeerConnectionError> {
    let result = match desc.kind.as_str() {
        "offer" => RTCSessionDescription::offer(desc.sdp.clone()),
        "answer" => RTCSessionDescription::answer(desc.sdp.clone()),
        other => {
            return Err(PeerConnectionError::Negotiation {
                peer_id: String::new(),
                reason: format!("unsupported description kind {other:?}"),
            })
        }
    };
    result.map_err(|e| PeerConnectionError::Negotiation {
        peer_id: String::new(),
        reason: e.to_string(),
    })
}

/// `PeerConnector` over the `webrtc` crate.
pub struct RtcConnector {
    ice_servers: Vec<String>,
}

impl RtcConnector {
    pub fn new(ice_servers: Vec<String>) -> Arc<Self> {
        Arc::new(Self { ice_servers })
    }
}

#[async_trait]
impl PeerConnector for RtcConnector {
    async fn connect(
        &self,
        peer_id: &str,
        events: mpsc::Sender<LinkEvent>,
    ) -> Result<Arc<dyn PeerLink>, PeerConnectionError> {
        let setup = |reason: String| PeerConnectionError::Setup {
            peer_id: peer_id.to_string(),
            reason,
        };

        let mut media_engine = MediaEngine::default();
        media_engine
            .register_default_codecs()
            .map_err(|e| setup(format!("register codecs: {e}")))?;

        let mut registry = Registry::new();
        registry = register_default_interceptors(registry, &mut media_engine)
            .map_err(|e| setup(format!("register interceptors: {e}")))?;

        let api = APIBuilder::new()
            .with_media_engine(media_engine)
            .with_interceptor_registry(registry)
            .build();

        let config = RTCConfiguration {
            ice_servers: vec![RTCIceServer {
                urls: self.ice_servers.clone(),
                ..Default::default()
            }],
            ..Default::default()
        };

        let pc = Arc::new(
            api.new_peer_connection(config)
                .await
                .map_err(|e| setup(format!("new peer connection: {e}")))?,
        );

        // Connection state changes.
        let state_tx = events.clone();
        let state_pid = peer_id.to_string();
        pc.on_peer_connection_state_change(Box::new(move |state: RTCPeerConnectionState| {
            let tx = state_tx.clone();
            let peer_id = state_pid.clone();
            Box::pin(async move {
                info!(peer = %peer_id, ?state, "connection state changed");
                if let Some(state) = to_link_state(state) {
                    let _ = tx.send(LinkEvent::StateChanged { peer_id, state }).await;
                }
            })
        }));

        // Remote audio: decode RTP payloads to PCM and hand the feed over.
        let track_tx = events.clone();
        let track_pid = peer_id.to_string();
        pc.on_track(Box::new(move |track, _receiver, _transceiver| {
            let tx = track_tx.clone();
            let peer_id = track_pid.clone();
            Box::pin(async move {
                if track.kind() != RTPCodecType::Audio {
                    return;
                }
                info!(peer = %peer_id, "remote audio track received");
                let mut decoder = match OpusDecoder::new() {
                    Ok(d) => d,
                    Err(e) => {
                        warn!(peer = %peer_id, "cannot decode remote track: {e}");
                        return;
                    }
                };
                let (frames_tx, frames_rx) = mpsc::channel::<Vec<f32>>(64);
                let _ = tx
                    .send(LinkEvent::RemoteStream {
                        peer_id: peer_id.clone(),
                        stream: RemoteStream {
                            peer_id: peer_id.clone(),
                            frames: frames_rx,
                        },
                    })
                    .await;

                let mut buf = vec![0u8; 4096];
                loop {
                    match track.read(&mut buf).await {
                        Ok((rtp_packet, _attributes)) => {
                            let payload = &rtp_packet.payload;
                            if payload.is_empty() {
                                continue;
                            }
                            match decoder.decode(payload) {
                                Ok(pcm) => {
                                    // try_send: a slow consumer drops
                                    // frames, it never backs up the read
                                    // loop.
                                    let _ = frames_tx.try_send(pcm);
                                }
                                Err(e) => debug!(peer = %peer_id, "opus decode: {e}"),
                            }
                        }
                        Err(e) => {
                            debug!(peer = %peer_id, "remote track ended: {e}");
                            break;
                        }
                    }
                }
            })
        }));

        // Locally gathered candidates, to be signaled to the peer.
        let ice_tx = events.clone();
        let ice_pid = peer_id.to_string();
        pc.on_ice_candidate(Box::new(move |candidate| {
            let tx = ice_tx.clone();
            let peer_id = ice_pid.clone();
            Box::pin(async move {
                let Some(candidate) = candidate else { return };
                match candidate.to_json() {
                    Ok(init) => {
                        let _ = tx
                            .send(LinkEvent::LocalCandidate {
                                peer_id,
                                candidate: CandidatePayload {
                                    candidate: init.candidate,
                                    sdp_mid: init.sdp_mid,
                                    sdp_mline_index: init.sdp_mline_index,
                                },
                            })
                            .await;
                    }
                    Err(e) => warn!(peer = %peer_id, "serialize candidate: {e}"),
                }
            })
        }));

        Ok(Arc::new(RtcLink {
            peer_id: peer_id.to_string(),
            pc,
        }))
    }
}

struct RtcLink {
    peer_id: String,
    pc: Arc<RTCPeerConnection>,
}

impl RtcLink {
    fn negotiation(&self, e: impl std::fmt::Display) -> PeerConnectionError {
        PeerConnectionError::Negotiation {
            peer_id: self.peer_id.clone(),
            reason: e.to_string(),
        }
    }
}

#[async_trait]
impl PeerLink for RtcLink {
    async fn add_track(
        &self,
        track: Arc<dyn OutboundTrack>,
    ) -> Result<Box<dyn TrackSender>, PeerConnectionError> {
        let kind = track.kind();
        let rtp_track = rtp_track_of(&self.peer_id, &track)?;
        let sender = self
            .pc
            .add_track(rtp_track)
            .await
            .map_err(|e| PeerConnectionError::Track {
                peer_id: self.peer_id.clone(),
                reason: e.to_string(),
            })?;

        // Drain incoming RTCP for this sender; required by the webrtc
        // crate for interceptors to run.
        let rtcp_sender = sender.clone();
        tokio::spawn(async move {
            let mut buf = vec![0u8; 1500];
            while rtcp_sender.read(&mut buf).await.is_ok() {}
        });

        Ok(Box::new(RtcTrackSender {
            peer_id: self.peer_id.clone(),
            kind,
            sender,
        }))
    }

    async fn create_offer(&self) -> Result<SdpPayload, PeerConnectionError> {
        let offer = self
            .pc
            .create_offer(None)
            .await
            .map_err(|e| self.negotiation(e))?;
        Ok(SdpPayload {
            kind: offer.sdp_type.to_string(),
            sdp: offer.sdp,
        })
    }

    async fn create_answer(&self) -> Result<SdpPayload, PeerConnectionError> {
        let answer = self
            .pc
            .create_answer(None)
            .await
            .map_err(|e| self.negotiation(e))?;
        Ok(SdpPayload {
            kind: answer.sdp_type.to_string(),
            sdp: answer.sdp,
        })
    }

    async fn set_local_description(&self, desc: SdpPayload) -> Result<(), PeerConnectionError> {
        let desc = to_session_description(&desc)?;
        self.pc
            .set_local_description(desc)
            .await
            .map_err(|e| self.negotiation(e))
    }

    async fn set_remote_description(&self, desc: SdpPayload) -> Result<(), PeerConnectionError> {
        let desc = to_session_description(&desc)?;
        self.pc
            .set_remote_description(desc)
            .await
            .map_err(|e| self.negotiation(e))
    }

    async fn add_ice_candidate(
        &self,
        candidate: CandidatePayload,
    ) -> Result<(), PeerConnectionError> {
        self.pc
            .add_ice_candidate(RTCIceCandidateInit {
                candidate: candidate.candidate,
                sdp_mid: candidate.sdp_mid,
                sdp_mline_index: candidate.sdp_mline_index,
                username_fragment: None,
            })
            .await
            .map_err(|e| {
                debug!(peer = %self.peer_id, "add candidate failed: {e}");
                PeerConnectionError::IceFailed {
                    peer_id: self.peer_id.clone(),
                }
            })
    }

    async fn close(&self) {
        if let Err(e) = self.pc.close().await {
            warn!(peer = %self.peer_id, "error closing connection: {e}");
        }
    }
}

struct RtcTrackSender {
    peer_id: String,
    kind: TrackKind,
    sender: Arc<RTCRtpSender>,
}

#[async_trait]
impl TrackSender for RtcTrackSender {
    fn kind(&self) -> TrackKind {
        self.kind
    }

    /// In-place source swap on the negotiated sender; no renegotiation.
    async fn replace(&self, track: Arc<dyn OutboundTrack>) -> Result<(), PeerConnectionError> {
        let rtp_track = rtp_track_of(&self.peer_id, &track)?;
        self.sender
            .replace_track(Some(rtp_track))
            .await
            .map_err(|e| PeerConnectionError::Track {
                peer_id: self.peer_id.clone(),
                reason: e.to_string(),
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn description_conversion_round_trips_kind() {
        let payload = SdpPayload {
            kind: "offer".into(),
            sdp: "v=0\r\no=- 0 0 IN IP4 127.0.0.1\r\ns=-\r\nt=0 0\r\n".into(),
        };
        let desc = to_session_description(&payload).expect("convert");
        assert_eq!(desc.sdp_type.to_string(), "offer");
        assert_eq!(desc.sdp, payload.sdp);

        let bad = SdpPayload {
            kind: "rollback".into(),
            sdp: String::new(),
        };
        assert!(to_session_description(&bad).is_err());
    }

    #[test]
    fn foreign_track_is_rejected() {
        struct Foreign;
        impl OutboundTrack for Foreign {
            fn id(&self) -> &str {
                "f"
            }
            fn kind(&self) -> TrackKind {
                TrackKind::Audio
            }
            fn as_any(&self) -> &dyn std::any::Any {
                self
            }
        }
        let track: Arc<dyn OutboundTrack> = Arc::new(Foreign);
        assert!(rtp_track_of("p", &track).is_err());
    }
}

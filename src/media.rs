use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::{info, warn};

use crate::error::LocalMediaError;
use crate::link::OutboundTrack;

/// What to capture. `audio_device: None` means the default input.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CaptureConstraints {
    pub audio_device: Option<String>,
    pub video: bool,
}

/// Capture device info surfaced to whatever settings UI sits above.
#[derive(Debug, Clone, Serialize)]
pub struct MediaDevice {
    pub id: String,
    pub name: String,
    pub is_input: bool,
    pub is_default: bool,
}

/// The local capture stream: an audio track, an optional video track, and
/// a monitor feed of raw PCM for the speaking detector. The monitor is
/// taken once per acquisition.
pub struct LocalStream {
    pub audio: Arc<dyn OutboundTrack>,
    pub video: Option<Arc<dyn OutboundTrack>>,
    monitor: Option<mpsc::Receiver<Vec<f32>>>,
}

impl LocalStream {
    pub fn new(
        audio: Arc<dyn OutboundTrack>,
        video: Option<Arc<dyn OutboundTrack>>,
        monitor: mpsc::Receiver<Vec<f32>>,
    ) -> Self {
        Self {
            audio,
            video,
            monitor: Some(monitor),
        }
    }

    /// Take the PCM monitor feed (once).
    pub fn take_monitor(&mut self) -> Option<mpsc::Receiver<Vec<f32>>> {
        self.monitor.take()
    }
}

/// Media-capture collaborator: local capture and device enumeration.
#[async_trait]
pub trait MediaCapture: Send + Sync {
    async fn get_user_media(
        &self,
        constraints: &CaptureConstraints,
    ) -> Result<LocalStream, LocalMediaError>;
    async fn enumerate_devices(&self) -> Result<Vec<MediaDevice>, LocalMediaError>;
}

/// Owns the local capture stream's lifecycle: acquire on join, release on
/// leave, reacquire on device/video-mode change. Track replacement on live
/// connections is the connection manager's side of the handoff; this type
/// only swaps the stream wholesale.
pub struct MediaLifecycle {
    capture: Arc<dyn MediaCapture>,
    current: Option<LocalStream>,
    constraints: CaptureConstraints,
    last_error: Option<String>,
}

impl MediaLifecycle {
    pub fn new(capture: Arc<dyn MediaCapture>) -> Self {
        Self {
            capture,
            current: None,
            constraints: CaptureConstraints::default(),
            last_error: None,
        }
    }

    /// Acquire capture for a join. On failure the error is recorded and no
    /// stream is held; the caller must not create peer connections.
    pub async fn acquire(
        &mut self,
        constraints: CaptureConstraints,
    ) -> Result<&mut LocalStream, LocalMediaError> {
        match self.capture.get_user_media(&constraints).await {
            Ok(stream) => {
                info!(video = constraints.video, "local media acquired");
                self.constraints = constraints;
                self.last_error = None;
                Ok(self.current.insert(stream))
            }
            Err(e) => {
                warn!("local media acquisition failed: {e}");
                self.last_error = Some(e.to_string());
                self.current = None;
                Err(e)
            }
        }
    }

    /// Swap the stream for new constraints while staying in the channel.
    /// On failure the previous stream is kept so the call stays up on the
    /// old device.
    pub async fn reacquire(
        &mut self,
        constraints: CaptureConstraints,
    ) -> Result<&mut LocalStream, LocalMediaError> {
        match self.capture.get_user_media(&constraints).await {
            Ok(stream) => {
                info!(video = constraints.video, "local media reacquired");
                self.constraints = constraints;
                self.last_error = None;
                Ok(self.current.insert(stream))
            }
            Err(e) => {
                warn!("device switch failed, keeping previous stream: {e}");
                self.last_error = Some(e.to_string());
                Err(e)
            }
        }
    }

    /// Drop the capture stream (leave).
    pub fn release(&mut self) {
        if self.current.take().is_some() {
            info!("local media released");
        }
    }

    pub fn current(&self) -> Option<&LocalStream> {
        self.current.as_ref()
    }

    pub fn current_mut(&mut self) -> Option<&mut LocalStream> {
        self.current.as_mut()
    }

    pub fn constraints(&self) -> &CaptureConstraints {
        &self.constraints
    }

    pub fn last_error(&self) -> Option<&str> {
        self.last_error.as_deref()
    }

    pub async fn enumerate_devices(&self) -> Result<Vec<MediaDevice>, LocalMediaError> {
        self.capture.enumerate_devices().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::link::TrackKind;
    use std::sync::atomic::{AtomicBool, Ordering};

    struct FakeTrack(TrackKind);

    impl OutboundTrack for FakeTrack {
        fn id(&self) -> &str {
            "t"
        }
        fn kind(&self) -> TrackKind {
            self.0
        }
        fn as_any(&self) -> &dyn std::any::Any {
            self
        }
    }

    struct FakeCapture {
        fail: AtomicBool,
    }

    #[async_trait]
    impl MediaCapture for FakeCapture {
        async fn get_user_media(
            &self,
            constraints: &CaptureConstraints,
        ) -> Result<LocalStream, LocalMediaError> {
            if self.fail.load(Ordering::SeqCst) {
                return Err(LocalMediaError::CaptureFailed("busy".into()));
            }
            let (_tx, rx) = mpsc::channel(1);
            Ok(LocalStream::new(
                Arc::new(FakeTrack(TrackKind::Audio)),
                constraints.video.then(|| {
                    Arc::new(FakeTrack(TrackKind::Video)) as Arc<dyn OutboundTrack>
                }),
                rx,
            ))
        }

        async fn enumerate_devices(&self) -> Result<Vec<MediaDevice>, LocalMediaError> {
            Ok(vec![])
        }
    }

    #[tokio::test]
    async fn acquire_failure_records_error_and_holds_nothing() {
        let capture = Arc::new(FakeCapture {
            fail: AtomicBool::new(true),
        });
        let mut media = MediaLifecycle::new(capture);
        assert!(media.acquire(CaptureConstraints::default()).await.is_err());
        assert!(media.current().is_none());
        assert!(media.last_error().is_some());
    }

    #[tokio::test]
    async fn reacquire_failure_keeps_previous_stream() {
        let capture = Arc::new(FakeCapture {
            fail: AtomicBool::new(false),
        });
        let mut media = MediaLifecycle::new(capture.clone());
        media
            .acquire(CaptureConstraints::default())
            .await
            .expect("acquire");

        capture.fail.store(true, Ordering::SeqCst);
        let err = media
            .reacquire(CaptureConstraints {
                audio_device: Some("other".into()),
                video: false,
            })
            .await;
        assert!(err.is_err());
        assert!(media.current().is_some());
        // Old constraints stay authoritative after the failed switch.
        assert_eq!(media.constraints().audio_device, None);
    }

    #[tokio::test]
    async fn monitor_is_taken_once() {
        let capture = Arc::new(FakeCapture {
            fail: AtomicBool::new(false),
        });
        let mut media = MediaLifecycle::new(capture);
        let stream = media
            .acquire(CaptureConstraints::default())
            .await
            .expect("acquire");
        assert!(stream.take_monitor().is_some());
        assert!(stream.take_monitor().is_none());
    }
}

use std::collections::HashMap;
use std::sync::Arc;

use rustfft::num_complex::Complex;
use rustfft::{Fft, FftPlanner};
use serde::Deserialize;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::error::StoreError;
use crate::events::{EventSender, SessionEvent};
use crate::store::DocumentStore;

/// Participant id used for the local capture stream.
pub const LOCAL_PARTICIPANT: &str = "local";

/// Mean frequency-magnitude threshold over normalized f32 PCM spectra.
pub const SPEAKING_THRESHOLD: f32 = 0.05;
/// Consecutive above-threshold ticks before flipping to speaking.
pub const ATTACK_FRAMES: u32 = 2;
/// Consecutive below-threshold ticks before flipping back. Asymmetric with
/// attack so short pauses between words don't flicker the flag.
pub const RELEASE_FRAMES: u32 = 20;

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SpeakingConfig {
    pub threshold: f32,
    pub attack_frames: u32,
    pub release_frames: u32,
}

impl Default for SpeakingConfig {
    fn default() -> Self {
        Self {
            threshold: SPEAKING_THRESHOLD,
            attack_frames: ATTACK_FRAMES,
            release_frames: RELEASE_FRAMES,
        }
    }
}

/// Per-stream frequency-magnitude sampler. `None` means no audio arrived
/// since the last poll; the detector treats that as silence.
pub trait SpectrumSource: Send {
    fn magnitudes(&mut self) -> Option<Vec<f32>>;
}

/// FFT analyzer over a PCM frame feed (48kHz mono f32). Polled once per
/// tick; keeps only the newest frame when it falls behind.
pub struct FftAnalyzer {
    frames: mpsc::Receiver<Vec<f32>>,
    fft: Arc<dyn Fft<f32>>,
    fft_size: usize,
}

impl FftAnalyzer {
    const FFT_SIZE: usize = 1024;

    pub fn new(frames: mpsc::Receiver<Vec<f32>>) -> Self {
        let fft = FftPlanner::new().plan_fft_forward(Self::FFT_SIZE);
        Self {
            frames,
            fft,
            fft_size: Self::FFT_SIZE,
        }
    }
}

impl SpectrumSource for FftAnalyzer {
    fn magnitudes(&mut self) -> Option<Vec<f32>> {
        let mut latest = None;
        while let Ok(frame) = self.frames.try_recv() {
            latest = Some(frame);
        }
        let frame = latest?;

        let mut buffer: Vec<Complex<f32>> = frame
            .iter()
            .copied()
            .chain(std::iter::repeat(0.0))
            .take(self.fft_size)
            .map(|s| Complex { re: s, im: 0.0 })
            .collect();
        self.fft.process(&mut buffer);

        let scale = 1.0 / self.fft_size as f32;
        Some(
            buffer[..self.fft_size / 2]
                .iter()
                .map(|c| c.norm() * scale)
                .collect(),
        )
    }
}

/// Outward mirror for the local speaking flag. Writes are fire-and-forget;
/// the detector never waits on them.
pub trait ProfileSink: Send + Sync {
    fn publish_speaking(&self, speaking: bool);
}

/// Merge-writes `{"isSpeaking": ...}` into the local user's profile doc.
pub struct StoreProfileSink {
    store: Arc<dyn DocumentStore>,
    path: String,
    doc_id: String,
}

impl StoreProfileSink {
    pub fn new(
        store: Arc<dyn DocumentStore>,
        path: impl Into<String>,
        doc_id: impl Into<String>,
    ) -> Self {
        Self {
            store,
            path: path.into(),
            doc_id: doc_id.into(),
        }
    }
}

impl ProfileSink for StoreProfileSink {
    fn publish_speaking(&self, speaking: bool) {
        let store = self.store.clone();
        let path = self.path.clone();
        let doc_id = self.doc_id.clone();
        tokio::spawn(async move {
            let result: Result<(), StoreError> = store
                .set_document(
                    &path,
                    &doc_id,
                    serde_json::json!({ "isSpeaking": speaking }),
                    true,
                )
                .await;
            if let Err(e) = result {
                warn!("profile speaking write failed: {e}");
            }
        });
    }
}

/// Sink for sessions without a profile collaborator.
pub struct NoProfile;

impl ProfileSink for NoProfile {
    fn publish_speaking(&self, _speaking: bool) {}
}

struct Entry {
    source: Box<dyn SpectrumSource>,
    speaking: bool,
    attack: u32,
    release: u32,
}

/// Classifies each attached stream as speaking/silent with attack/release
/// hysteresis. One entry per participant id, including
/// [`LOCAL_PARTICIPANT`]; the local flag is mirrored to the profile sink
/// on every flip and forced back to false on detach.
pub struct SpeakingDetector {
    config: SpeakingConfig,
    entries: HashMap<String, Entry>,
    profile: Arc<dyn ProfileSink>,
    event_tx: EventSender,
}

impl SpeakingDetector {
    pub fn new(config: SpeakingConfig, profile: Arc<dyn ProfileSink>, event_tx: EventSender) -> Self {
        Self {
            config,
            entries: HashMap::new(),
            profile,
            event_tx,
        }
    }

    /// Attach (or replace) the analyzer for a participant. Counters start
    /// from silence.
    pub fn attach(&mut self, id: impl Into<String>, source: Box<dyn SpectrumSource>) {
        let id = id.into();
        debug!(id = %id, "speaking analyzer attached");
        self.entries.insert(
            id,
            Entry {
                source,
                speaking: false,
                attack: 0,
                release: 0,
            },
        );
    }

    /// Drop a participant's analyzer and counters. After this the source is
    /// never polled again. An entry detached mid-speech emits a final
    /// `false` flip, and detaching the local id always publishes `false`
    /// outward, so a departed participant can't be left marked as speaking.
    pub fn detach(&mut self, id: &str) {
        let was_speaking = self
            .entries
            .remove(id)
            .map(|e| e.speaking)
            .unwrap_or(false);
        if id == LOCAL_PARTICIPANT {
            self.profile.publish_speaking(false);
        }
        if was_speaking {
            let _ = self.event_tx.send(SessionEvent::SpeakingChanged {
                peer_id: id.to_string(),
                speaking: false,
            });
        }
    }

    pub fn detach_all(&mut self) {
        let ids: Vec<String> = self.entries.keys().cloned().collect();
        for id in ids {
            self.detach(&id);
        }
    }

    pub fn is_speaking(&self, id: &str) -> bool {
        self.entries.get(id).map(|e| e.speaking).unwrap_or(false)
    }

    /// Ids currently classified as speaking, in stable order.
    pub fn speaking_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self
            .entries
            .iter()
            .filter(|(_, e)| e.speaking)
            .map(|(id, _)| id.clone())
            .collect();
        ids.sort();
        ids
    }

    /// Poll every analyzer once and apply the hysteresis. Returns the flips
    /// that occurred this tick (also emitted on the event bus).
    pub fn tick(&mut self) -> Vec<(String, bool)> {
        let mut flips = Vec::new();
        for (id, entry) in &mut self.entries {
            let mean = entry.source.magnitudes().map(|mags| {
                if mags.is_empty() {
                    0.0
                } else {
                    mags.iter().sum::<f32>() / mags.len() as f32
                }
            });

            let loud = mean.map(|m| m > self.config.threshold).unwrap_or(false);
            if loud {
                entry.attack = entry.attack.saturating_add(1);
                entry.release = 0;
                if !entry.speaking && entry.attack >= self.config.attack_frames {
                    entry.speaking = true;
                    flips.push((id.clone(), true));
                }
            } else {
                entry.release = entry.release.saturating_add(1);
                entry.attack = 0;
                if entry.speaking && entry.release >= self.config.release_frames {
                    entry.speaking = false;
                    flips.push((id.clone(), false));
                }
            }
        }

        for (id, speaking) in &flips {
            if id == LOCAL_PARTICIPANT {
                self.profile.publish_speaking(*speaking);
            }
            let _ = self.event_tx.send(SessionEvent::SpeakingChanged {
                peer_id: id.clone(),
                speaking: *speaking,
            });
        }
        flips
    }
}

//! Local and remote stream handles.
//!
//! A [`LocalTrack`] owns its sample source: the pump task that feeds the
//! underlying RTP track keeps running until `stop()` aborts it. Handles are
//! cheap clones sharing the same track state, so a snapshot published to the
//! UI controls the same `enabled` flag the peer session is sending from.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock};

use tokio::task::JoinHandle;
use webrtc::rtp_transceiver::rtp_codec::RTPCodecType;
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;
use webrtc::track::track_remote::TrackRemote;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrackKind {
    Audio,
    Video,
}

impl TrackKind {
    pub(crate) fn from_codec_type(kind: RTPCodecType) -> Self {
        match kind {
            RTPCodecType::Video => TrackKind::Video,
            _ => TrackKind::Audio,
        }
    }
}

/// Where a local track's samples come from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrackSource {
    /// Real capture hardware, opened through the device interface.
    Device,
    /// Procedurally generated fallback.
    Synthetic,
}

/// One locally produced media track plus the task pumping samples into it.
#[derive(Clone)]
pub struct LocalTrack {
    kind: TrackKind,
    source: TrackSource,
    rtc: Arc<TrackLocalStaticSample>,
    enabled: Arc<AtomicBool>,
    pump: Arc<Mutex<Option<JoinHandle<()>>>>,
}

impl LocalTrack {
    pub fn new(
        kind: TrackKind,
        source: TrackSource,
        rtc: Arc<TrackLocalStaticSample>,
        enabled: Arc<AtomicBool>,
        pump: JoinHandle<()>,
    ) -> Self {
        Self {
            kind,
            source,
            rtc,
            enabled,
            pump: Arc::new(Mutex::new(Some(pump))),
        }
    }

    pub fn kind(&self) -> TrackKind {
        self.kind
    }

    pub fn source(&self) -> TrackSource {
        self.source
    }

    pub fn is_synthetic(&self) -> bool {
        self.source == TrackSource::Synthetic
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::SeqCst)
    }

    /// Flip the track in place. A disabled track keeps its pump alive and
    /// emits silence/black frames, so no renegotiation happens.
    pub fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::SeqCst);
    }

    /// Stop the sample pump and release the source. Idempotent.
    pub fn stop(&self) {
        if let Some(pump) = self.pump.lock().unwrap().take() {
            pump.abort();
        }
    }

    pub(crate) fn rtc_track(&self) -> Arc<TrackLocalStaticSample> {
        Arc::clone(&self.rtc)
    }
}

impl fmt::Debug for LocalTrack {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LocalTrack")
            .field("kind", &self.kind)
            .field("source", &self.source)
            .field("enabled", &self.is_enabled())
            .finish()
    }
}

/// The local capture bundle for one call: always an audio track, plus a
/// video track for video calls.
#[derive(Debug, Clone, Default)]
pub struct LocalStream {
    audio: Option<LocalTrack>,
    video: Option<LocalTrack>,
}

impl LocalStream {
    pub(crate) fn new(audio: Option<LocalTrack>, video: Option<LocalTrack>) -> Self {
        Self { audio, video }
    }

    pub fn audio(&self) -> Option<&LocalTrack> {
        self.audio.as_ref()
    }

    pub fn video(&self) -> Option<&LocalTrack> {
        self.video.as_ref()
    }

    pub fn tracks(&self) -> impl Iterator<Item = &LocalTrack> {
        self.audio.iter().chain(self.video.iter())
    }

    /// Stop every track and its generator. Idempotent.
    pub fn stop_all(&self) {
        for track in self.tracks() {
            track.stop();
        }
    }
}

/// One track received from the remote peer.
#[derive(Clone)]
pub struct RemoteTrack {
    pub kind: TrackKind,
    pub ssrc: u32,
    rtc: Arc<TrackRemote>,
}

impl RemoteTrack {
    pub(crate) fn new(rtc: Arc<TrackRemote>) -> Self {
        Self {
            kind: TrackKind::from_codec_type(rtc.kind()),
            ssrc: rtc.ssrc(),
            rtc,
        }
    }

    /// The underlying RTP track, for a renderer to read samples from.
    pub fn rtc_track(&self) -> Arc<TrackRemote> {
        Arc::clone(&self.rtc)
    }
}

impl fmt::Debug for RemoteTrack {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RemoteTrack")
            .field("kind", &self.kind)
            .field("ssrc", &self.ssrc)
            .finish()
    }
}

/// Tracks received from the remote peer, filled in as they arrive.
#[derive(Debug, Clone, Default)]
pub struct RemoteStream {
    tracks: Arc<RwLock<Vec<RemoteTrack>>>,
}

impl RemoteStream {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn push(&self, track: RemoteTrack) {
        self.tracks.write().unwrap().push(track);
    }

    pub fn tracks(&self) -> Vec<RemoteTrack> {
        self.tracks.read().unwrap().clone()
    }

    pub fn is_empty(&self) -> bool {
        self.tracks.read().unwrap().is_empty()
    }

    pub fn has_track(&self, kind: TrackKind) -> bool {
        self.tracks.read().unwrap().iter().any(|t| t.kind == kind)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::media::synthetic;

    #[tokio::test]
    async fn toggling_a_track_flips_enabled_in_place() {
        let track = synthetic::audio_track();
        assert!(track.is_enabled());
        track.set_enabled(false);
        assert!(!track.is_enabled());
        track.set_enabled(true);
        assert!(track.is_enabled());
        track.stop();
    }

    #[tokio::test]
    async fn clones_share_enabled_state() {
        let track = synthetic::audio_track();
        let clone = track.clone();
        clone.set_enabled(false);
        assert!(!track.is_enabled());
        track.stop();
    }

    #[tokio::test]
    async fn stop_is_idempotent() {
        let stream = LocalStream::new(Some(synthetic::audio_track()), Some(synthetic::video_track()));
        stream.stop_all();
        stream.stop_all();
    }
}

//! Procedurally generated fallback media.
//!
//! When no capture hardware is available (or permission is denied), calls
//! still need a local stream: a video track showing an animated test pattern
//! and a near-silent audio tone. Both are produced by fixed-rate pump tasks
//! writing samples into the RTP tracks; disabling a track switches its pump
//! to black frames / silence without stopping it.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use bytes::Bytes;
use log::debug;
use tokio::task::JoinHandle;
use webrtc::api::media_engine::{MIME_TYPE_OPUS, MIME_TYPE_VP8};
use webrtc::media::Sample;
use webrtc::rtp_transceiver::rtp_codec::RTCRtpCodecCapability;
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;

use super::tracks::{LocalTrack, TrackKind, TrackSource};

/// Test-pattern geometry (I420: luma plane + quarter-size chroma planes).
pub const FRAME_WIDTH: usize = 320;
pub const FRAME_HEIGHT: usize = 240;
pub const VIDEO_FPS: u32 = 15;

pub const AUDIO_SAMPLE_RATE: u32 = 48_000;
/// 20 ms packets, the usual Opus frame size.
pub const AUDIO_FRAME_MS: u64 = 20;
const TONE_HZ: f32 = 440.0;
/// Near-silent: audible only with the gain cranked, but keeps RTP flowing.
const TONE_AMPLITUDE: f32 = 0.003;

const LUMA_BLACK: u8 = 16;
const CHROMA_NEUTRAL: u8 = 128;

fn frame_len() -> usize {
    FRAME_WIDTH * FRAME_HEIGHT * 3 / 2
}

/// One animated test-pattern frame: a diagonal gradient that scrolls with the
/// frame index, a bright sweeping bar, and a fixed marker band across the top
/// standing in for the "test mode" banner.
pub fn video_frame(index: u64) -> Vec<u8> {
    let mut buf = vec![CHROMA_NEUTRAL; frame_len()];
    let phase = (index * 4) as usize;
    let bar_y = (phase / 2) % FRAME_HEIGHT;

    for y in 0..FRAME_HEIGHT {
        for x in 0..FRAME_WIDTH {
            let luma = if y < 16 {
                // Marker band: alternating blocks, stationary.
                if (x / 16) % 2 == 0 { 235 } else { LUMA_BLACK }
            } else if y.abs_diff(bar_y) < 4 {
                235
            } else {
                (((x + y + phase) % 220) + 16) as u8
            };
            buf[y * FRAME_WIDTH + x] = luma;
        }
    }
    buf
}

/// A black frame, emitted while the video track is disabled.
pub fn black_frame() -> Vec<u8> {
    let mut buf = vec![CHROMA_NEUTRAL; frame_len()];
    buf[..FRAME_WIDTH * FRAME_HEIGHT].fill(LUMA_BLACK);
    buf
}

/// One 20 ms packet of near-silent sine tone, phase-continuous across frames
/// (i16 little-endian mono PCM).
pub fn audio_frame(index: u64) -> Vec<u8> {
    let samples_per_frame = (AUDIO_SAMPLE_RATE as u64 * AUDIO_FRAME_MS / 1000) as usize;
    let mut buf = Vec::with_capacity(samples_per_frame * 2);
    let base = index * samples_per_frame as u64;
    for n in 0..samples_per_frame {
        let t = (base + n as u64) as f32 / AUDIO_SAMPLE_RATE as f32;
        let value = (t * TONE_HZ * std::f32::consts::TAU).sin() * TONE_AMPLITUDE;
        let sample = (value * i16::MAX as f32) as i16;
        buf.extend_from_slice(&sample.to_le_bytes());
    }
    buf
}

fn silence_frame() -> Vec<u8> {
    let samples_per_frame = (AUDIO_SAMPLE_RATE as u64 * AUDIO_FRAME_MS / 1000) as usize;
    vec![0u8; samples_per_frame * 2]
}

fn spawn_video_pump(
    track: Arc<TrackLocalStaticSample>,
    enabled: Arc<AtomicBool>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let frame_interval = Duration::from_millis(1000 / VIDEO_FPS as u64);
        let mut ticker = tokio::time::interval(frame_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        let mut index: u64 = 0;
        loop {
            ticker.tick().await;
            let data = if enabled.load(Ordering::SeqCst) {
                video_frame(index)
            } else {
                black_frame()
            };
            index += 1;
            let sample = Sample {
                data: Bytes::from(data),
                duration: frame_interval,
                ..Default::default()
            };
            if let Err(e) = track.write_sample(&sample).await {
                debug!("Synthetic video pump stopping: {}", e);
                break;
            }
        }
    })
}

fn spawn_audio_pump(
    track: Arc<TrackLocalStaticSample>,
    enabled: Arc<AtomicBool>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let frame_interval = Duration::from_millis(AUDIO_FRAME_MS);
        let mut ticker = tokio::time::interval(frame_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        let mut index: u64 = 0;
        loop {
            ticker.tick().await;
            let data = if enabled.load(Ordering::SeqCst) {
                audio_frame(index)
            } else {
                silence_frame()
            };
            index += 1;
            let sample = Sample {
                data: Bytes::from(data),
                duration: frame_interval,
                ..Default::default()
            };
            if let Err(e) = track.write_sample(&sample).await {
                debug!("Synthetic audio pump stopping: {}", e);
                break;
            }
        }
    })
}

/// Build the synthetic near-silent audio track.
pub fn audio_track() -> LocalTrack {
    let rtc = Arc::new(TrackLocalStaticSample::new(
        RTCRtpCodecCapability {
            mime_type: MIME_TYPE_OPUS.to_owned(),
            clock_rate: AUDIO_SAMPLE_RATE,
            channels: 2,
            ..Default::default()
        },
        "synthetic-audio".to_owned(),
        "peerline-local".to_owned(),
    ));
    let enabled = Arc::new(AtomicBool::new(true));
    let pump = spawn_audio_pump(Arc::clone(&rtc), Arc::clone(&enabled));
    LocalTrack::new(TrackKind::Audio, TrackSource::Synthetic, rtc, enabled, pump)
}

/// Build the synthetic test-pattern video track.
pub fn video_track() -> LocalTrack {
    let rtc = Arc::new(TrackLocalStaticSample::new(
        RTCRtpCodecCapability {
            mime_type: MIME_TYPE_VP8.to_owned(),
            clock_rate: 90_000,
            ..Default::default()
        },
        "synthetic-video".to_owned(),
        "peerline-local".to_owned(),
    ));
    let enabled = Arc::new(AtomicBool::new(true));
    let pump = spawn_video_pump(Arc::clone(&rtc), Arc::clone(&enabled));
    LocalTrack::new(TrackKind::Video, TrackSource::Synthetic, rtc, enabled, pump)
}

//! Capture device interface.
//!
//! The host shell owns the actual hardware (microphone, camera) and provides
//! it behind [`MediaDevices`]; this crate only decides what to request and
//! how to degrade when the request cannot be satisfied. [`NullDevices`] is
//! the headless default: it reports no devices, so acquisition always takes
//! the synthetic fallback.

use async_trait::async_trait;
use thiserror::Error;

use super::tracks::LocalTrack;

/// Input device classes relevant to calling.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceKind {
    AudioInput,
    VideoInput,
}

#[derive(Debug, Clone)]
pub struct DeviceInfo {
    pub kind: DeviceKind,
    pub label: String,
}

/// Audio capture constraints; echo cancellation, noise suppression and auto
/// gain are all requested by default.
#[derive(Debug, Clone)]
pub struct AudioConstraints {
    pub echo_cancellation: bool,
    pub noise_suppression: bool,
    pub auto_gain_control: bool,
}

impl Default for AudioConstraints {
    fn default() -> Self {
        Self {
            echo_cancellation: true,
            noise_suppression: true,
            auto_gain_control: true,
        }
    }
}

/// Video capture constraints: front-facing at a bounded ideal resolution.
#[derive(Debug, Clone)]
pub struct VideoConstraints {
    pub ideal_width: u32,
    pub ideal_height: u32,
    pub frame_rate: u32,
    pub facing_front: bool,
}

impl Default for VideoConstraints {
    fn default() -> Self {
        Self {
            ideal_width: 1280,
            ideal_height: 720,
            frame_rate: 30,
            facing_front: true,
        }
    }
}

/// Typed capture failures, mirrored from the host platform.
#[derive(Debug, Error)]
pub enum MediaError {
    #[error("permission to use the capture device was denied")]
    PermissionDenied,

    #[error("no suitable capture device: {0}")]
    NotFound(&'static str),

    #[error("capture device is busy")]
    Busy,

    #[error("capture backend failure: {0}")]
    Backend(String),
}

/// Host capture interface consumed by [`acquire`](super::acquire).
#[async_trait]
pub trait MediaDevices: Send + Sync + 'static {
    async fn enumerate(&self) -> Result<Vec<DeviceInfo>, MediaError>;

    async fn open_audio(&self, constraints: &AudioConstraints) -> Result<LocalTrack, MediaError>;

    async fn open_video(&self, constraints: &VideoConstraints) -> Result<LocalTrack, MediaError>;
}

/// Device interface that reports no hardware at all.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullDevices;

#[async_trait]
impl MediaDevices for NullDevices {
    async fn enumerate(&self) -> Result<Vec<DeviceInfo>, MediaError> {
        Ok(Vec::new())
    }

    async fn open_audio(&self, _constraints: &AudioConstraints) -> Result<LocalTrack, MediaError> {
        Err(MediaError::NotFound("no microphone"))
    }

    async fn open_video(&self, _constraints: &VideoConstraints) -> Result<LocalTrack, MediaError> {
        Err(MediaError::NotFound("no camera"))
    }
}

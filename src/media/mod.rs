//! Media acquisition for calls.
//!
//! # Architecture
//!
//! - [`MediaDevices`]: host capture interface (consumed, injectable)
//! - [`synthetic`]: generated fallback tracks (test pattern + near-silent tone)
//! - [`LocalStream`] / [`RemoteStream`]: stream handles held in call state
//! - [`acquire`]: the degrade-don't-fail acquisition policy
//!
//! `acquire` never fails outright: missing hardware or a capture error
//! degrades to the synthetic fallback so the calling flow is never blocked.

pub mod devices;
pub mod synthetic;
pub mod tracks;

pub use devices::{
    AudioConstraints, DeviceInfo, DeviceKind, MediaDevices, MediaError, NullDevices,
    VideoConstraints,
};
pub use tracks::{LocalStream, LocalTrack, RemoteStream, RemoteTrack, TrackKind, TrackSource};

use std::fmt;

use log::{info, warn};

use crate::types::CallType;

/// Informational notice about degraded capture, surfaced to the UI alongside
/// the call state. Never a fatal error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MediaNotice {
    /// Capture permission was denied; synthetic media is used instead.
    PermissionDenied,
    /// No capture device of the required class exists.
    NoDevice,
}

impl fmt::Display for MediaNotice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MediaNotice::PermissionDenied => {
                f.write_str("capture permission denied, using generated media")
            }
            MediaNotice::NoDevice => f.write_str("no capture device, using generated media"),
        }
    }
}

/// Result of [`acquire`]: the local stream plus an optional degradation
/// notice.
#[derive(Debug, Clone)]
pub struct AcquiredMedia {
    pub stream: LocalStream,
    pub notice: Option<MediaNotice>,
}

fn notice_for(err: &MediaError) -> MediaNotice {
    match err {
        MediaError::PermissionDenied => MediaNotice::PermissionDenied,
        _ => MediaNotice::NoDevice,
    }
}

/// Pick the more user-relevant of two notices; permission problems win.
fn merge_notice(a: Option<MediaNotice>, b: Option<MediaNotice>) -> Option<MediaNotice> {
    match (a, b) {
        (Some(MediaNotice::PermissionDenied), _) | (_, Some(MediaNotice::PermissionDenied)) => {
            Some(MediaNotice::PermissionDenied)
        }
        (Some(n), _) | (_, Some(n)) => Some(n),
        (None, None) => None,
    }
}

/// Obtain the local capture bundle for a call.
///
/// A microphone is required for every call, a camera only for video calls.
/// Whenever the required device class is absent or opening it fails, the
/// corresponding synthetic track is used instead — this function cannot fail.
pub async fn acquire(call_type: CallType, devices: &dyn MediaDevices) -> AcquiredMedia {
    let available = match devices.enumerate().await {
        Ok(list) => list,
        Err(e) => {
            warn!("Device enumeration failed, assuming no devices: {}", e);
            Vec::new()
        }
    };
    let has_mic = available.iter().any(|d| d.kind == DeviceKind::AudioInput);
    let has_camera = available.iter().any(|d| d.kind == DeviceKind::VideoInput);

    let mut notice = None;

    let audio = if has_mic {
        match devices.open_audio(&AudioConstraints::default()).await {
            Ok(track) => track,
            Err(e) => {
                warn!("Microphone capture failed, falling back to tone: {}", e);
                notice = merge_notice(notice, Some(notice_for(&e)));
                synthetic::audio_track()
            }
        }
    } else {
        info!("No microphone available, using synthetic audio");
        notice = merge_notice(notice, Some(MediaNotice::NoDevice));
        synthetic::audio_track()
    };

    let video = if call_type.is_video() {
        let track = if has_camera {
            match devices.open_video(&VideoConstraints::default()).await {
                Ok(track) => track,
                Err(e) => {
                    warn!("Camera capture failed, falling back to test pattern: {}", e);
                    notice = merge_notice(notice, Some(notice_for(&e)));
                    synthetic::video_track()
                }
            }
        } else {
            info!("No camera available, using synthetic video");
            notice = merge_notice(notice, Some(MediaNotice::NoDevice));
            synthetic::video_track()
        };
        Some(track)
    } else {
        None
    };

    AcquiredMedia {
        stream: LocalStream::new(Some(audio), video),
        notice,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;

    /// Devices that exist but refuse every open with the configured error.
    struct RefusingDevices {
        error: fn() -> MediaError,
    }

    #[async_trait]
    impl MediaDevices for RefusingDevices {
        async fn enumerate(&self) -> Result<Vec<DeviceInfo>, MediaError> {
            Ok(vec![
                DeviceInfo {
                    kind: DeviceKind::AudioInput,
                    label: "Built-in Microphone".into(),
                },
                DeviceInfo {
                    kind: DeviceKind::VideoInput,
                    label: "Front Camera".into(),
                },
            ])
        }

        async fn open_audio(&self, _: &AudioConstraints) -> Result<LocalTrack, MediaError> {
            Err((self.error)())
        }

        async fn open_video(&self, _: &VideoConstraints) -> Result<LocalTrack, MediaError> {
            Err((self.error)())
        }
    }

    #[tokio::test]
    async fn audio_acquire_with_no_devices_yields_synthetic_audio() {
        let acquired = acquire(CallType::Audio, &NullDevices).await;
        let audio = acquired.stream.audio().expect("audio track");
        assert_eq!(audio.kind(), TrackKind::Audio);
        assert!(audio.is_synthetic());
        assert!(acquired.stream.video().is_none());
        assert_eq!(acquired.notice, Some(MediaNotice::NoDevice));
        acquired.stream.stop_all();
    }

    #[tokio::test]
    async fn video_acquire_with_no_devices_yields_both_synthetic_tracks() {
        let acquired = acquire(CallType::Video, &NullDevices).await;
        let audio = acquired.stream.audio().expect("audio track");
        let video = acquired.stream.video().expect("video track");
        assert!(audio.is_synthetic());
        assert!(video.is_synthetic());
        assert_eq!(video.kind(), TrackKind::Video);
        acquired.stream.stop_all();
    }

    #[tokio::test]
    async fn permission_denied_surfaces_notice_but_still_succeeds() {
        let devices = RefusingDevices {
            error: || MediaError::PermissionDenied,
        };
        let acquired = acquire(CallType::Video, &devices).await;
        assert_eq!(acquired.notice, Some(MediaNotice::PermissionDenied));
        assert!(acquired.stream.audio().unwrap().is_synthetic());
        assert!(acquired.stream.video().unwrap().is_synthetic());
        acquired.stream.stop_all();
    }

    #[tokio::test]
    async fn busy_device_degrades_with_no_device_notice() {
        let devices = RefusingDevices {
            error: || MediaError::Busy,
        };
        let acquired = acquire(CallType::Audio, &devices).await;
        assert_eq!(acquired.notice, Some(MediaNotice::NoDevice));
        assert!(acquired.stream.audio().unwrap().is_synthetic());
        acquired.stream.stop_all();
    }
}

//! Local, in-memory call state.
//!
//! One [`CallState`] snapshot is owned per controller and published through a
//! `tokio::sync::watch` channel; the UI layer only ever observes clones of
//! it. It mirrors the subset of the shared record relevant to the local peer
//! plus local-only fields (streams, mute flags, last error).

use std::fmt;

use crate::media::{LocalStream, MediaNotice, RemoteStream};
use crate::types::{CallId, CallType};

/// The local lifecycle phase of the controller.
///
/// Terminal record statuses (declined/ended/missed/busy) have no local phase:
/// cleanup resets the controller straight back to `Idle`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CallPhase {
    /// No call in progress.
    #[default]
    Idle,
    /// Outgoing call created, waiting for the receiver to pick up.
    Ringing,
    /// Answer exchanged; media session established or establishing.
    Connected,
}

/// Reactive snapshot of the current call, published to the UI layer.
#[derive(Clone, Default)]
pub struct CallState {
    pub phase: CallPhase,
    pub call_id: Option<CallId>,
    pub is_caller: bool,
    pub call_type: Option<CallType>,
    /// Display metadata of the remote party, snapshotted at call start.
    pub peer_name: Option<String>,
    pub peer_image: Option<String>,
    pub local_stream: Option<LocalStream>,
    pub remote_stream: Option<RemoteStream>,
    pub is_muted: bool,
    pub is_video_off: bool,
    /// Informational notice about degraded media capture (not an error).
    pub media_notice: Option<MediaNotice>,
    /// Last fatal setup error, surfaced after the state rolled back to idle.
    pub error: Option<String>,
}

impl CallState {
    pub fn idle() -> Self {
        Self::default()
    }

    pub fn is_in_call(&self) -> bool {
        self.phase != CallPhase::Idle
    }
}

impl fmt::Debug for CallState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CallState")
            .field("phase", &self.phase)
            .field("call_id", &self.call_id)
            .field("is_caller", &self.is_caller)
            .field("call_type", &self.call_type)
            .field("has_local_stream", &self.local_stream.is_some())
            .field("has_remote_stream", &self.remote_stream.is_some())
            .field("is_muted", &self.is_muted)
            .field("is_video_off", &self.is_video_off)
            .field("media_notice", &self.media_notice)
            .field("error", &self.error)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn idle_state_is_not_in_call() {
        let state = CallState::idle();
        assert!(!state.is_in_call());
        assert!(state.call_id.is_none());
        assert!(state.local_stream.is_none());
    }

    #[test]
    fn ringing_and_connected_count_as_in_call() {
        let mut state = CallState::idle();
        state.phase = CallPhase::Ringing;
        assert!(state.is_in_call());
        state.phase = CallPhase::Connected;
        assert!(state.is_in_call());
    }
}

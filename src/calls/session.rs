//! Peer media session.
//!
//! Wraps one `RTCPeerConnection` and turns its callback hooks into a single
//! [`SessionEvent`] stream the controller consumes: locally discovered
//! candidates (to persist), remote tracks (to expose), connection-state
//! transitions (to drive the lifecycle) and a connectivity-loss watchdog.
//!
//! The watchdog guards against a silent half-open link: if ICE reports
//! `disconnected` and does not recover within a bounded delay, the session is
//! treated as lost even when the coarser peer-connection state has not moved
//! yet.

use std::sync::Arc;
use std::sync::Mutex as StdMutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use log::{debug, warn};
use tokio::sync::Mutex;
use tokio::sync::mpsc::UnboundedSender;
use tokio::task::JoinHandle;
use webrtc::api::APIBuilder;
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::MediaEngine;
use webrtc::ice_transport::ice_candidate::{RTCIceCandidate, RTCIceCandidateInit};
use webrtc::ice_transport::ice_connection_state::RTCIceConnectionState;
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::track::track_local::TrackLocal;
use webrtc::track::track_remote::TrackRemote;

use crate::calls::record::{CandidateSide, IceCandidateRecord, SessionDescription};
use crate::media::{LocalStream, RemoteTrack};

/// Which end of the offer/answer exchange this session is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionRole {
    Caller,
    Receiver,
}

impl SessionRole {
    /// The candidate collection this side writes to.
    pub fn local_side(self) -> CandidateSide {
        match self {
            SessionRole::Caller => CandidateSide::Caller,
            SessionRole::Receiver => CandidateSide::Callee,
        }
    }

    /// The candidate collection this side reads from.
    pub fn remote_side(self) -> CandidateSide {
        self.local_side().other()
    }
}

/// Coarse connection state, mirrored from the peer connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    New,
    Connecting,
    Connected,
    Disconnected,
    Failed,
    Closed,
}

impl ConnectionState {
    fn from_rtc(state: RTCPeerConnectionState) -> Self {
        match state {
            RTCPeerConnectionState::Connecting => ConnectionState::Connecting,
            RTCPeerConnectionState::Connected => ConnectionState::Connected,
            RTCPeerConnectionState::Disconnected => ConnectionState::Disconnected,
            RTCPeerConnectionState::Failed => ConnectionState::Failed,
            RTCPeerConnectionState::Closed => ConnectionState::Closed,
            _ => ConnectionState::New,
        }
    }

    /// States that must tear the call down.
    pub fn is_lost(self) -> bool {
        matches!(
            self,
            ConnectionState::Disconnected | ConnectionState::Failed | ConnectionState::Closed
        )
    }
}

/// Everything the session reports back to the controller.
#[derive(Debug)]
pub enum SessionEvent {
    /// A locally discovered candidate that must be persisted immediately.
    LocalCandidate(IceCandidateRecord),
    /// A remote media track arrived.
    RemoteTrack(RemoteTrack),
    /// The peer connection changed state.
    ConnectionState(ConnectionState),
    /// ICE stayed disconnected past the watchdog delay.
    ConnectivityLost,
}

fn candidate_record(init: RTCIceCandidateInit) -> IceCandidateRecord {
    IceCandidateRecord {
        candidate: init.candidate,
        sdp_mid: init.sdp_mid,
        sdp_mline_index: init.sdp_mline_index,
        username_fragment: init.username_fragment,
    }
}

fn candidate_init(record: &IceCandidateRecord) -> RTCIceCandidateInit {
    RTCIceCandidateInit {
        candidate: record.candidate.clone(),
        sdp_mid: record.sdp_mid.clone(),
        sdp_mline_index: record.sdp_mline_index,
        username_fragment: record.username_fragment.clone(),
    }
}

/// One peer-to-peer media session.
pub struct PeerSession {
    pc: Arc<RTCPeerConnection>,
    role: SessionRole,
    /// Candidates that arrived before the remote description, in order.
    pending_candidates: Mutex<Vec<IceCandidateRecord>>,
    watchdog: Arc<StdMutex<Option<JoinHandle<()>>>>,
    closed: AtomicBool,
}

impl PeerSession {
    /// Create the session and register all observers.
    pub async fn new(
        role: SessionRole,
        ice_servers: &[String],
        disconnect_timeout: Duration,
        events: UnboundedSender<SessionEvent>,
    ) -> Result<Arc<Self>, webrtc::Error> {
        let mut media_engine = MediaEngine::default();
        media_engine.register_default_codecs()?;
        let mut registry = Registry::new();
        registry = register_default_interceptors(registry, &mut media_engine)?;
        let api = APIBuilder::new()
            .with_media_engine(media_engine)
            .with_interceptor_registry(registry)
            .build();

        let servers = if ice_servers.is_empty() {
            Vec::new()
        } else {
            vec![RTCIceServer {
                urls: ice_servers.to_vec(),
                ..Default::default()
            }]
        };
        let config = RTCConfiguration {
            ice_servers: servers,
            ..Default::default()
        };
        let pc = Arc::new(api.new_peer_connection(config).await?);
        let watchdog: Arc<StdMutex<Option<JoinHandle<()>>>> = Arc::new(StdMutex::new(None));

        let tx = events.clone();
        pc.on_ice_candidate(Box::new(move |candidate: Option<RTCIceCandidate>| {
            let tx = tx.clone();
            Box::pin(async move {
                let Some(candidate) = candidate else { return };
                match candidate.to_json() {
                    Ok(init) => {
                        let _ = tx.send(SessionEvent::LocalCandidate(candidate_record(init)));
                    }
                    Err(e) => warn!("Failed to serialize local candidate: {}", e),
                }
            })
        }));

        let tx = events.clone();
        pc.on_track(Box::new(move |track: Arc<TrackRemote>, _receiver, _transceiver| {
            let tx = tx.clone();
            Box::pin(async move {
                debug!("Remote track arrived (ssrc {})", track.ssrc());
                let _ = tx.send(SessionEvent::RemoteTrack(RemoteTrack::new(track)));
            })
        }));

        let tx = events.clone();
        pc.on_peer_connection_state_change(Box::new(move |state: RTCPeerConnectionState| {
            let tx = tx.clone();
            Box::pin(async move {
                debug!("Peer connection state: {}", state);
                let _ = tx.send(SessionEvent::ConnectionState(ConnectionState::from_rtc(state)));
            })
        }));

        let tx = events.clone();
        let dog = Arc::clone(&watchdog);
        pc.on_ice_connection_state_change(Box::new(move |state: RTCIceConnectionState| {
            let tx = tx.clone();
            let dog = Arc::clone(&dog);
            Box::pin(async move {
                debug!("ICE connection state: {}", state);
                match state {
                    RTCIceConnectionState::Disconnected => {
                        let mut guard = dog.lock().unwrap();
                        if guard.is_none() {
                            let tx = tx.clone();
                            *guard = Some(tokio::spawn(async move {
                                tokio::time::sleep(disconnect_timeout).await;
                                warn!("ICE stayed disconnected past the watchdog delay");
                                let _ = tx.send(SessionEvent::ConnectivityLost);
                            }));
                        }
                    }
                    RTCIceConnectionState::Connected | RTCIceConnectionState::Completed => {
                        if let Some(timer) = dog.lock().unwrap().take() {
                            timer.abort();
                        }
                    }
                    _ => {}
                }
            })
        }));

        Ok(Arc::new(Self {
            pc,
            role,
            pending_candidates: Mutex::new(Vec::new()),
            watchdog,
            closed: AtomicBool::new(false),
        }))
    }

    pub fn role(&self) -> SessionRole {
        self.role
    }

    /// Add every track of the local stream to the connection. Must happen
    /// before the description this side produces.
    pub async fn add_local_tracks(&self, stream: &LocalStream) -> Result<(), webrtc::Error> {
        for track in stream.tracks() {
            let rtc = track.rtc_track();
            self.pc
                .add_track(rtc as Arc<dyn TrackLocal + Send + Sync>)
                .await?;
        }
        Ok(())
    }

    /// Caller side: produce the offer and install it locally.
    pub async fn create_offer(&self) -> Result<SessionDescription, webrtc::Error> {
        let offer = self.pc.create_offer(None).await?;
        let sdp = offer.sdp.clone();
        self.pc.set_local_description(offer).await?;
        Ok(SessionDescription::offer(sdp))
    }

    /// Receiver side: install the caller's offer as remote description.
    /// Returns `false` if a remote description was already applied.
    pub async fn apply_offer(&self, offer: &SessionDescription) -> Result<bool, webrtc::Error> {
        if self.pc.remote_description().await.is_some() {
            debug!("Remote description already set, ignoring offer");
            return Ok(false);
        }
        let desc = RTCSessionDescription::offer(offer.sdp.clone())?;
        self.pc.set_remote_description(desc).await?;
        self.drain_pending_candidates().await;
        Ok(true)
    }

    /// Receiver side: produce the answer and install it locally.
    pub async fn create_answer(&self) -> Result<SessionDescription, webrtc::Error> {
        let answer = self.pc.create_answer(None).await?;
        let sdp = answer.sdp.clone();
        self.pc.set_local_description(answer).await?;
        Ok(SessionDescription::answer(sdp))
    }

    /// Caller side: apply the receiver's answer exactly once. Returns `false`
    /// (and does nothing) when a remote description is already installed, so
    /// a replayed answer is never re-applied.
    pub async fn apply_answer(&self, answer: &SessionDescription) -> Result<bool, webrtc::Error> {
        if self.pc.remote_description().await.is_some() {
            debug!("Remote description already set, ignoring answer");
            return Ok(false);
        }
        let desc = RTCSessionDescription::answer(answer.sdp.clone())?;
        self.pc.set_remote_description(desc).await?;
        self.drain_pending_candidates().await;
        Ok(true)
    }

    /// Feed one remote candidate. Candidates arriving before the remote
    /// description are queued in arrival order and applied on drain. The
    /// queue lock is held across the description check so a candidate can
    /// never slip in behind a concurrent drain.
    pub async fn apply_candidate(&self, candidate: IceCandidateRecord) -> Result<(), webrtc::Error> {
        {
            let mut pending = self.pending_candidates.lock().await;
            if self.pc.remote_description().await.is_none() {
                debug!("Queueing early candidate");
                pending.push(candidate);
                return Ok(());
            }
        }
        self.pc.add_ice_candidate(candidate_init(&candidate)).await
    }

    async fn drain_pending_candidates(&self) {
        let pending = std::mem::take(&mut *self.pending_candidates.lock().await);
        for candidate in pending {
            if let Err(e) = self.pc.add_ice_candidate(candidate_init(&candidate)).await {
                warn!("Failed to apply queued candidate: {}", e);
            }
        }
    }

    #[cfg(test)]
    pub(crate) async fn pending_candidate_count(&self) -> usize {
        self.pending_candidates.lock().await.len()
    }

    /// Close the connection and cancel the watchdog. Idempotent.
    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Some(timer) = self.watchdog.lock().unwrap().take() {
            timer.abort();
        }
        if let Err(e) = self.pc.close().await {
            debug!("Error closing peer connection: {}", e);
        }
    }
}

impl std::fmt::Debug for PeerSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PeerSession")
            .field("role", &self.role)
            .field("closed", &self.closed.load(Ordering::SeqCst))
            .finish()
    }
}

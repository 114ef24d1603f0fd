//! Call signaling controller.
//!
//! Orchestrates one call at a time: media acquisition, the peer session, the
//! shared record in the signaling store, and the local reactive state. All
//! exit paths — decline, hangup, ring timeout, transport loss, remote
//! termination, teardown — converge on one idempotent cleanup routine.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex, Weak};
use std::time::Duration;

use async_trait::async_trait;
use log::{debug, info, warn};
use tokio::sync::mpsc::{self, UnboundedReceiver};
use tokio::sync::{Mutex, watch};
use tokio::task::JoinHandle;

use crate::calls::error::CallError;
use crate::calls::listener;
use crate::calls::record::{CallRecord, CallStatus, IceCandidateRecord, RecordError};
use crate::calls::session::{ConnectionState, PeerSession, SessionEvent, SessionRole};
use crate::calls::state::{CallPhase, CallState};
use crate::media::{self, LocalStream, MediaDevices, RemoteStream};
use crate::store::{CallPatch, SignalingStore, Subscription};
use crate::types::{CallId, CallType, LocalIdentity, UserId};

/// Public connectivity-assistance servers used when the embedder does not
/// supply its own.
pub const DEFAULT_STUN_SERVERS: &[&str] = &[
    "stun:stun.l.google.com:19302",
    "stun:stun1.l.google.com:19302",
];

/// Configuration for the call controller.
#[derive(Debug, Clone)]
pub struct CallConfig {
    /// ICE servers handed to every peer session.
    pub ice_servers: Vec<String>,
    /// How long ICE may stay `disconnected` before the session counts as lost.
    pub ice_disconnect_timeout: Duration,
    /// How long an outgoing call rings before it is marked missed.
    pub ring_timeout: Duration,
    /// Grace period between a terminal status write and record deletion, so
    /// the peer's subscription observes the status first.
    pub delete_grace: Duration,
}

impl Default for CallConfig {
    fn default() -> Self {
        Self {
            ice_servers: DEFAULT_STUN_SERVERS.iter().map(|s| s.to_string()).collect(),
            ice_disconnect_timeout: Duration::from_secs(5),
            ring_timeout: Duration::from_secs(45),
            delete_grace: Duration::from_secs(2),
        }
    }
}

/// Callback surface for the UI shell. Both hooks default to no-ops.
#[async_trait]
pub trait CallEvents: Send + Sync {
    /// A new incoming call is ringing for the local user.
    async fn on_call_received(&self, _record: CallRecord) {}

    /// The active call ended, for whatever reason.
    async fn on_call_ended(&self) {}
}

/// Resources owned by the currently active call.
struct ActiveCall {
    call_id: CallId,
    generation: u64,
    session: Arc<PeerSession>,
    local_stream: LocalStream,
    tasks: Vec<JoinHandle<()>>,
}

/// Drives one call through its lifecycle and exposes a reactive state
/// snapshot to the UI layer.
pub struct CallController {
    pub(crate) identity: LocalIdentity,
    config: CallConfig,
    pub(crate) store: Arc<dyn SignalingStore>,
    devices: Arc<dyn MediaDevices>,
    events: Option<Arc<dyn CallEvents>>,
    state_tx: watch::Sender<CallState>,
    active: Mutex<Option<ActiveCall>>,
    /// Bumped on every cleanup; async continuations compare their captured
    /// value against it before touching shared state, so a stale continuation
    /// from an ended call is discarded.
    generation: AtomicU64,
    listener_task: StdMutex<Option<JoinHandle<()>>>,
    /// Self-handle for the tasks this controller spawns.
    weak_self: Weak<CallController>,
}

impl CallController {
    /// Build the controller and establish the incoming-call listener.
    pub fn new(
        identity: LocalIdentity,
        store: Arc<dyn SignalingStore>,
        devices: Arc<dyn MediaDevices>,
        config: CallConfig,
        events: Option<Arc<dyn CallEvents>>,
    ) -> Arc<Self> {
        let (state_tx, _) = watch::channel(CallState::idle());
        let controller = Arc::new_cyclic(|weak_self| Self {
            identity,
            config,
            store,
            devices,
            events,
            state_tx,
            active: Mutex::new(None),
            generation: AtomicU64::new(0),
            listener_task: StdMutex::new(None),
            weak_self: weak_self.clone(),
        });
        let task = listener::spawn(Arc::clone(&controller));
        *controller.listener_task.lock().unwrap() = Some(task);
        controller
    }

    fn arc_self(&self) -> Arc<Self> {
        self.weak_self.upgrade().expect("controller still referenced")
    }

    /// Current state snapshot.
    pub fn call_state(&self) -> CallState {
        self.state_tx.borrow().clone()
    }

    /// Reactive handle; resolves on every state change.
    pub fn subscribe_state(&self) -> watch::Receiver<CallState> {
        self.state_tx.subscribe()
    }

    pub fn config(&self) -> &CallConfig {
        &self.config
    }

    fn update_state(&self, f: impl FnOnce(&mut CallState)) {
        self.state_tx.send_modify(f);
    }

    fn next_generation(&self) -> u64 {
        self.generation.fetch_add(1, Ordering::SeqCst) + 1
    }

    fn generation_is(&self, generation: u64) -> bool {
        self.generation.load(Ordering::SeqCst) == generation
    }

    /// Start an outgoing call. The record broadcasts `Ringing` immediately so
    /// the receiver's listener picks it up.
    pub async fn start_call(
        &self,
        receiver_id: impl Into<UserId>,
        receiver_name: impl Into<String>,
        receiver_image: impl Into<String>,
        call_type: CallType,
    ) -> Result<CallId, CallError> {
        let receiver_id = receiver_id.into();
        let receiver_name = receiver_name.into();
        let receiver_image = receiver_image.into();

        let mut active = self.active.lock().await;
        if active.is_some() {
            return Err(CallError::AlreadyInCall);
        }

        let generation = self.next_generation();
        let call_id = CallId::generate();
        info!("Starting {} call {} to {}", call_type, call_id, receiver_id);

        let acquired = media::acquire(call_type, self.devices.as_ref()).await;
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let session = match PeerSession::new(
            SessionRole::Caller,
            &self.config.ice_servers,
            self.config.ice_disconnect_timeout,
            event_tx,
        )
        .await
        {
            Ok(session) => session,
            Err(e) => {
                acquired.stream.stop_all();
                return Err(self.setup_failed(e.into()).await);
            }
        };

        let offer = {
            let produce = async {
                session.add_local_tracks(&acquired.stream).await?;
                session.create_offer().await
            };
            match produce.await {
                Ok(offer) => offer,
                Err(e) => {
                    acquired.stream.stop_all();
                    session.close().await;
                    return Err(self.setup_failed(e.into()).await);
                }
            }
        };

        let record = CallRecord::new_outgoing(
            call_id.clone(),
            self.identity.user_id.clone(),
            self.identity.display_name.clone(),
            self.identity.avatar_url.clone(),
            receiver_id,
            receiver_name.clone(),
            receiver_image.clone(),
            call_type,
            offer,
        );

        let subscriptions = async {
            let record = self.store.create_call(record).await?;
            let record_sub = self.store.watch_call(&call_id).await?;
            let candidate_sub = self
                .store
                .watch_candidates(&call_id, SessionRole::Caller.remote_side())
                .await?;
            Ok::<_, CallError>((record, record_sub, candidate_sub))
        };
        let (_record, record_sub, candidate_sub) = match subscriptions.await {
            Ok(parts) => parts,
            Err(e) => {
                acquired.stream.stop_all();
                session.close().await;
                return Err(self.setup_failed(e).await);
            }
        };

        let local_stream = acquired.stream.clone();
        self.state_tx.send_replace(CallState {
            phase: CallPhase::Ringing,
            call_id: Some(call_id.clone()),
            is_caller: true,
            call_type: Some(call_type),
            peer_name: Some(receiver_name),
            peer_image: Some(receiver_image),
            local_stream: Some(local_stream.clone()),
            remote_stream: None,
            is_muted: false,
            is_video_off: false,
            media_notice: acquired.notice,
            error: None,
        });

        let tasks = vec![
            tokio::spawn(run_session_events(
                self.arc_self(),
                event_rx,
                Arc::clone(&session),
                generation,
                call_id.clone(),
            )),
            tokio::spawn(run_record_watch(
                self.arc_self(),
                record_sub,
                Arc::clone(&session),
                generation,
                true,
            )),
            tokio::spawn(run_candidate_watch(
                self.arc_self(),
                candidate_sub,
                Arc::clone(&session),
                generation,
            )),
            tokio::spawn(run_ring_timeout(
                self.arc_self(),
                generation,
                call_id.clone(),
            )),
        ];

        *active = Some(ActiveCall {
            call_id: call_id.clone(),
            generation,
            session,
            local_stream,
            tasks,
        });
        Ok(call_id)
    }

    /// Answer an incoming call. Rejected synchronously if the record is
    /// missing, malformed, not addressed to us, or no longer ringing.
    pub async fn answer_call(&self, call_id: &CallId) -> Result<(), CallError> {
        let mut active = self.active.lock().await;
        if active.is_some() {
            return Err(CallError::AlreadyInCall);
        }

        let mut record = self
            .store
            .get_call(call_id)
            .await?
            .ok_or_else(|| CallError::NotFound(call_id.to_string()))?;
        record.validate()?;
        if record.receiver_id != self.identity.user_id {
            return Err(CallError::NotAddressedToUs);
        }
        if !record.status.is_awaiting_answer() {
            return Err(CallError::NotRinging);
        }
        let offer = record
            .offer
            .clone()
            .ok_or(CallError::Record(RecordError::MissingOffer))?;

        let generation = self.next_generation();
        info!(
            "Answering {} call {} from {}",
            record.call_type, call_id, record.caller_id
        );

        let acquired = media::acquire(record.call_type, self.devices.as_ref()).await;
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let session = match PeerSession::new(
            SessionRole::Receiver,
            &self.config.ice_servers,
            self.config.ice_disconnect_timeout,
            event_tx,
        )
        .await
        {
            Ok(session) => session,
            Err(e) => {
                acquired.stream.stop_all();
                return Err(self.setup_failed(e.into()).await);
            }
        };

        let setup = async {
            session.apply_offer(&offer).await?;
            session.add_local_tracks(&acquired.stream).await?;
            session.create_answer().await
        };
        let answer = match setup.await {
            Ok(answer) => answer,
            Err(e) => {
                acquired.stream.stop_all();
                session.close().await;
                return Err(self.setup_failed(e.into()).await);
            }
        };

        let subscriptions = async {
            self.store
                .update_call(call_id, CallPatch::Answer(answer))
                .await?;
            let record_sub = self.store.watch_call(call_id).await?;
            let candidate_sub = self
                .store
                .watch_candidates(call_id, SessionRole::Receiver.remote_side())
                .await?;
            Ok::<_, CallError>((record_sub, candidate_sub))
        };
        let (record_sub, candidate_sub) = match subscriptions.await {
            Ok(parts) => parts,
            Err(e) => {
                acquired.stream.stop_all();
                session.close().await;
                return Err(self.setup_failed(e).await);
            }
        };

        let local_stream = acquired.stream.clone();
        self.state_tx.send_replace(CallState {
            phase: CallPhase::Connected,
            call_id: Some(call_id.clone()),
            is_caller: false,
            call_type: Some(record.call_type),
            peer_name: Some(record.caller_name.clone()),
            peer_image: Some(record.caller_image.clone()),
            local_stream: Some(local_stream.clone()),
            remote_stream: None,
            is_muted: false,
            is_video_off: false,
            media_notice: acquired.notice,
            error: None,
        });

        let tasks = vec![
            tokio::spawn(run_session_events(
                self.arc_self(),
                event_rx,
                Arc::clone(&session),
                generation,
                call_id.clone(),
            )),
            tokio::spawn(run_record_watch(
                self.arc_self(),
                record_sub,
                Arc::clone(&session),
                generation,
                false,
            )),
            tokio::spawn(run_candidate_watch(
                self.arc_self(),
                candidate_sub,
                Arc::clone(&session),
                generation,
            )),
        ];

        *active = Some(ActiveCall {
            call_id: call_id.clone(),
            generation,
            session,
            local_stream,
            tasks,
        });
        Ok(())
    }

    /// Decline an incoming call that was never accepted locally. No local
    /// state changes; the terminal write is best-effort.
    pub async fn decline_call(&self, call_id: &CallId) -> Result<(), CallError> {
        info!("Declining call {}", call_id);
        if let Err(e) = self
            .store
            .update_call(call_id, CallPatch::Status(CallStatus::Declined))
            .await
        {
            warn!("Best-effort decline write failed for call {}: {}", call_id, e);
        }
        self.schedule_delete(call_id.clone());
        Ok(())
    }

    /// Hang up the active call. The terminal write is best-effort; cleanup
    /// always runs.
    pub async fn end_call(&self) -> Result<(), CallError> {
        let (call_id, generation) = {
            let guard = self.active.lock().await;
            match guard.as_ref() {
                Some(call) => (call.call_id.clone(), call.generation),
                None => return Err(CallError::NotInCall),
            }
        };
        info!("Ending call {}", call_id);
        if let Err(e) = self
            .store
            .update_call(&call_id, CallPatch::Status(CallStatus::Ended))
            .await
        {
            warn!("Best-effort ended write failed for call {}: {}", call_id, e);
        }
        self.schedule_delete(call_id);
        if self.cleanup_call(Some(generation)).await {
            self.notify_call_ended().await;
        }
        Ok(())
    }

    /// Flip the local audio track in place. Returns the new muted state.
    pub async fn toggle_mute(&self) -> Result<bool, CallError> {
        let muted = {
            let guard = self.active.lock().await;
            let call = guard.as_ref().ok_or(CallError::NotInCall)?;
            let track = call
                .local_stream
                .audio()
                .ok_or(CallError::NoTrack("audio"))?;
            let enabled = !track.is_enabled();
            track.set_enabled(enabled);
            !enabled
        };
        debug!("Audio track {}", if muted { "muted" } else { "unmuted" });
        self.update_state(|s| s.is_muted = muted);
        Ok(muted)
    }

    /// Flip the local video track in place. Returns the new video-off state.
    pub async fn toggle_video(&self) -> Result<bool, CallError> {
        let video_off = {
            let guard = self.active.lock().await;
            let call = guard.as_ref().ok_or(CallError::NotInCall)?;
            let track = call
                .local_stream
                .video()
                .ok_or(CallError::NoTrack("video"))?;
            let enabled = !track.is_enabled();
            track.set_enabled(enabled);
            !enabled
        };
        debug!("Video track {}", if video_off { "off" } else { "on" });
        self.update_state(|s| s.is_video_off = video_off);
        Ok(video_off)
    }

    /// Tear the controller down: stop listening for incoming calls and end
    /// any active call.
    pub async fn shutdown(&self) {
        if let Some(task) = self.listener_task.lock().unwrap().take() {
            task.abort();
        }
        if self.call_state().is_in_call() {
            let _ = self.end_call().await;
        } else {
            self.cleanup().await;
        }
    }

    /// The shared cleanup routine. Safe to call at any time, any number of
    /// times, with any subset of resources allocated.
    pub async fn cleanup(&self) {
        self.cleanup_call(None).await;
    }

    /// Release the active call's resources and reset the state to idle.
    /// With `expected` set, only the matching call generation is cleaned;
    /// a stale request leaves a newer call untouched. Returns whether an
    /// active call was actually torn down.
    async fn cleanup_call(&self, expected: Option<u64>) -> bool {
        let call = {
            let mut guard = self.active.lock().await;
            match (guard.as_ref(), expected) {
                (Some(active), Some(generation)) if active.generation != generation => {
                    return false;
                }
                (None, Some(_)) => return false,
                _ => guard.take(),
            }
        };
        self.generation.fetch_add(1, Ordering::SeqCst);
        if let Some(call) = &call {
            debug!("Cleaning up call {}", call.call_id);
            for task in &call.tasks {
                task.abort();
            }
            call.local_stream.stop_all();
            call.session.close().await;
        }
        self.state_tx.send_replace(CallState::idle());
        call.is_some()
    }

    /// Automatic-termination path shared by the session observers, the
    /// connectivity watchdog, the ring timeout and remote terminal statuses.
    pub(crate) async fn terminate(
        &self,
        generation: u64,
        write_status: Option<CallStatus>,
    ) {
        if !self.generation_is(generation) {
            return;
        }
        if let Some(status) = write_status {
            let call_id = {
                let guard = self.active.lock().await;
                guard
                    .as_ref()
                    .filter(|call| call.generation == generation)
                    .map(|call| call.call_id.clone())
            };
            if let Some(call_id) = call_id {
                if let Err(e) = self
                    .store
                    .update_call(&call_id, CallPatch::Status(status))
                    .await
                {
                    warn!(
                        "Best-effort {:?} write failed for call {}: {}",
                        status, call_id, e
                    );
                }
                self.schedule_delete(call_id);
            }
        }
        if self.cleanup_call(Some(generation)).await {
            self.notify_call_ended().await;
        }
    }

    /// Roll a failed setup back to idle and surface the error in the state.
    async fn setup_failed(&self, error: CallError) -> CallError {
        warn!("Call setup failed: {}", error);
        let mut state = CallState::idle();
        state.error = Some(error.to_string());
        self.state_tx.send_replace(state);
        error
    }

    /// Delete the call record after the grace delay, so the peer's
    /// subscription observes the terminal status first.
    pub(crate) fn schedule_delete(&self, call_id: CallId) {
        let store = Arc::clone(&self.store);
        let grace = self.config.delete_grace;
        tokio::spawn(async move {
            tokio::time::sleep(grace).await;
            if let Err(e) = store.delete_call(&call_id).await {
                warn!("Failed to delete call record {}: {}", call_id, e);
            }
        });
    }

    pub(crate) async fn notify_call_received(&self, record: CallRecord) {
        if let Some(events) = &self.events {
            events.on_call_received(record).await;
        }
    }

    async fn notify_call_ended(&self) {
        if let Some(events) = &self.events {
            events.on_call_ended().await;
        }
    }
}

impl Drop for CallController {
    fn drop(&mut self) {
        if let Some(task) = self.listener_task.lock().unwrap().take() {
            task.abort();
        }
        if let Some(call) = self.active.get_mut().take() {
            for task in &call.tasks {
                task.abort();
            }
            call.local_stream.stop_all();
        }
    }
}

impl std::fmt::Debug for CallController {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CallController")
            .field("user", &self.identity.user_id)
            .field("state", &*self.state_tx.borrow())
            .finish()
    }
}

/// Consume the peer session's event stream: persist local candidates, expose
/// remote tracks, drive state transitions, and trigger termination on
/// transport loss.
async fn run_session_events(
    controller: Arc<CallController>,
    mut events: UnboundedReceiver<SessionEvent>,
    session: Arc<PeerSession>,
    generation: u64,
    call_id: CallId,
) {
    let local_side = session.role().local_side();
    while let Some(event) = events.recv().await {
        if !controller.generation_is(generation) {
            return;
        }
        match event {
            SessionEvent::LocalCandidate(candidate) => {
                if let Err(e) = controller
                    .store
                    .add_candidate(&call_id, local_side, candidate)
                    .await
                {
                    warn!(
                        "Failed to persist local candidate for call {}: {}",
                        call_id, e
                    );
                }
            }
            SessionEvent::RemoteTrack(track) => {
                debug!("Remote {:?} track for call {}", track.kind, call_id);
                controller.update_state(|s| {
                    s.remote_stream
                        .get_or_insert_with(RemoteStream::new)
                        .push(track);
                });
            }
            SessionEvent::ConnectionState(state) => {
                if state == ConnectionState::Connected {
                    controller.update_state(|s| {
                        if s.phase != CallPhase::Idle {
                            s.phase = CallPhase::Connected;
                        }
                    });
                } else if state.is_lost() {
                    info!("Peer connection {:?} for call {}", state, call_id);
                    let controller = Arc::clone(&controller);
                    tokio::spawn(async move {
                        controller
                            .terminate(generation, Some(CallStatus::Ended))
                            .await;
                    });
                    return;
                }
            }
            SessionEvent::ConnectivityLost => {
                info!("Connectivity watchdog fired for call {}", call_id);
                let controller = Arc::clone(&controller);
                tokio::spawn(async move {
                    controller
                        .terminate(generation, Some(CallStatus::Ended))
                        .await;
                });
                return;
            }
        }
    }
}

/// Watch the shared record: the caller applies the answer from it, both
/// sides react to a remote terminal status, and an unexpected deletion is
/// treated as termination.
async fn run_record_watch(
    controller: Arc<CallController>,
    mut sub: Subscription<CallRecord>,
    session: Arc<PeerSession>,
    generation: u64,
    is_caller: bool,
) {
    while let Some(mut record) = sub.recv().await {
        if !controller.generation_is(generation) {
            return;
        }
        if let Err(e) = record.validate() {
            warn!("Ignoring malformed update for call {}: {}", record.call_id, e);
            continue;
        }
        if record.status.is_terminal() {
            info!(
                "Call {} set to {:?} by the remote peer",
                record.call_id, record.status
            );
            let controller = Arc::clone(&controller);
            tokio::spawn(async move {
                controller.terminate(generation, None).await;
            });
            return;
        }
        if is_caller {
            if let Some(answer) = record.answer.clone() {
                match session.apply_answer(&answer).await {
                    Ok(true) => {
                        info!("Answer applied for call {}", record.call_id);
                        controller.update_state(|s| {
                            if s.phase == CallPhase::Ringing {
                                s.phase = CallPhase::Connected;
                            }
                        });
                    }
                    Ok(false) => {}
                    Err(e) => {
                        warn!("Failed to apply answer for call {}: {}", record.call_id, e);
                    }
                }
            }
        }
    }
    // The stream ended without a terminal status: the record disappeared
    // from under the call.
    if controller.generation_is(generation) {
        debug!("Record stream ended, terminating call");
        let controller = Arc::clone(&controller);
        tokio::spawn(async move {
            controller.terminate(generation, None).await;
        });
    }
}

/// Apply each of the remote side's candidates as it lands in the store.
async fn run_candidate_watch(
    controller: Arc<CallController>,
    mut sub: Subscription<IceCandidateRecord>,
    session: Arc<PeerSession>,
    generation: u64,
) {
    while let Some(candidate) = sub.recv().await {
        if !controller.generation_is(generation) {
            return;
        }
        if let Err(e) = session.apply_candidate(candidate).await {
            warn!("Failed to apply remote candidate: {}", e);
        }
    }
}

/// Caller side: an unanswered ring expires into `Missed`.
async fn run_ring_timeout(controller: Arc<CallController>, generation: u64, call_id: CallId) {
    let timeout = controller.config.ring_timeout;
    tokio::time::sleep(timeout).await;
    if !controller.generation_is(generation) {
        return;
    }
    if controller.call_state().phase != CallPhase::Ringing {
        return;
    }
    info!("Call {} unanswered after {:?}, marking missed", call_id, timeout);
    tokio::spawn(async move {
        controller
            .terminate(generation, Some(CallStatus::Missed))
            .await;
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::media::NullDevices;
    use crate::store::{MemoryStore, StoreError};
    use async_trait::async_trait;

    fn identity(user: &str) -> LocalIdentity {
        LocalIdentity::new(user, user.to_uppercase(), format!("https://cdn.example/{user}.png"))
    }

    fn quick_config() -> CallConfig {
        CallConfig {
            ice_servers: Vec::new(),
            delete_grace: Duration::from_millis(50),
            ..CallConfig::default()
        }
    }

    fn controller(user: &str, store: Arc<MemoryStore>) -> Arc<CallController> {
        CallController::new(
            identity(user),
            store,
            Arc::new(NullDevices),
            quick_config(),
            None,
        )
    }

    #[tokio::test]
    async fn cleanup_is_idempotent_from_idle() {
        let ctrl = controller("alice", Arc::new(MemoryStore::new()));
        ctrl.cleanup().await;
        ctrl.cleanup().await;
        tokio::join!(ctrl.cleanup(), ctrl.cleanup());
        assert!(!ctrl.call_state().is_in_call());
    }

    #[tokio::test]
    async fn cleanup_is_idempotent_with_a_live_call() {
        let store = Arc::new(MemoryStore::new());
        let ctrl = controller("alice", Arc::clone(&store));
        ctrl.start_call("bob", "Bob", "", CallType::Video)
            .await
            .unwrap();
        assert!(ctrl.call_state().is_in_call());

        ctrl.cleanup().await;
        assert!(!ctrl.call_state().is_in_call());
        ctrl.cleanup().await;
        tokio::join!(ctrl.cleanup(), ctrl.cleanup());
        assert!(!ctrl.call_state().is_in_call());
    }

    #[tokio::test]
    async fn second_start_call_is_rejected_without_touching_the_first() {
        let store = Arc::new(MemoryStore::new());
        let ctrl = controller("alice", Arc::clone(&store));
        let call_id = ctrl
            .start_call("bob", "Bob", "", CallType::Audio)
            .await
            .unwrap();

        let err = ctrl
            .start_call("carol", "Carol", "", CallType::Audio)
            .await
            .unwrap_err();
        assert!(matches!(err, CallError::AlreadyInCall));

        let state = ctrl.call_state();
        assert_eq!(state.call_id, Some(call_id.clone()));
        assert_eq!(state.phase, CallPhase::Ringing);
        assert_eq!(state.peer_name.as_deref(), Some("Bob"));
        assert!(store.get_call(&call_id).await.unwrap().is_some());

        ctrl.cleanup().await;
    }

    #[tokio::test]
    async fn start_call_with_no_devices_uses_synthetic_stream() {
        let store = Arc::new(MemoryStore::new());
        let ctrl = controller("alice", Arc::clone(&store));
        let call_id = ctrl
            .start_call("bob", "Bob", "", CallType::Video)
            .await
            .unwrap();

        let state = ctrl.call_state();
        let stream = state.local_stream.as_ref().expect("local stream");
        assert!(stream.audio().unwrap().is_synthetic());
        assert!(stream.video().unwrap().is_synthetic());

        let record = store.get_call(&call_id).await.unwrap().unwrap();
        assert_eq!(record.status, CallStatus::Ringing);
        assert!(record.offer.is_some());
        assert!(record.created_at.is_some());
        assert_eq!(record.caller_name, "ALICE");

        ctrl.cleanup().await;
    }

    #[tokio::test]
    async fn toggles_mirror_track_state_and_round_trip() {
        let store = Arc::new(MemoryStore::new());
        let ctrl = controller("alice", store);
        ctrl.start_call("bob", "Bob", "", CallType::Video)
            .await
            .unwrap();

        assert!(ctrl.toggle_mute().await.unwrap());
        let state = ctrl.call_state();
        assert!(state.is_muted);
        let audio = state.local_stream.as_ref().unwrap().audio().unwrap().clone();
        assert_eq!(state.is_muted, !audio.is_enabled());

        assert!(!ctrl.toggle_mute().await.unwrap());
        assert!(!ctrl.call_state().is_muted);
        assert!(audio.is_enabled());

        assert!(ctrl.toggle_video().await.unwrap());
        assert!(ctrl.call_state().is_video_off);
        assert!(!ctrl.toggle_video().await.unwrap());
        assert!(!ctrl.call_state().is_video_off);

        ctrl.cleanup().await;
    }

    #[tokio::test]
    async fn toggle_video_on_an_audio_call_reports_missing_track() {
        let store = Arc::new(MemoryStore::new());
        let ctrl = controller("alice", store);
        ctrl.start_call("bob", "Bob", "", CallType::Audio)
            .await
            .unwrap();

        assert!(matches!(
            ctrl.toggle_video().await,
            Err(CallError::NoTrack("video"))
        ));
        ctrl.cleanup().await;
    }

    #[tokio::test]
    async fn toggles_require_an_active_call() {
        let ctrl = controller("alice", Arc::new(MemoryStore::new()));
        assert!(matches!(ctrl.toggle_mute().await, Err(CallError::NotInCall)));
        assert!(matches!(
            ctrl.toggle_video().await,
            Err(CallError::NotInCall)
        ));
    }

    #[tokio::test]
    async fn answer_call_for_unknown_record_is_rejected_without_state_change() {
        let ctrl = controller("bob", Arc::new(MemoryStore::new()));
        let err = ctrl.answer_call(&CallId::new("missing")).await.unwrap_err();
        assert!(matches!(err, CallError::NotFound(_)));
        assert!(!ctrl.call_state().is_in_call());
        assert!(ctrl.call_state().error.is_none());
    }

    #[tokio::test]
    async fn end_call_requires_an_active_call() {
        let ctrl = controller("alice", Arc::new(MemoryStore::new()));
        assert!(matches!(ctrl.end_call().await, Err(CallError::NotInCall)));
    }

    #[tokio::test]
    async fn end_call_writes_terminal_status_and_deletes_after_grace() {
        let store = Arc::new(MemoryStore::new());
        let ctrl = controller("alice", Arc::clone(&store));
        let call_id = ctrl
            .start_call("bob", "Bob", "", CallType::Audio)
            .await
            .unwrap();

        ctrl.end_call().await.unwrap();
        assert!(!ctrl.call_state().is_in_call());

        // The terminal status lands before deletion...
        let record = store.get_call(&call_id).await.unwrap().unwrap();
        assert_eq!(record.status, CallStatus::Ended);

        // ...and the record disappears after the grace delay.
        let mut deleted = false;
        for _ in 0..200 {
            if store.get_call(&call_id).await.unwrap().is_none() {
                deleted = true;
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(deleted, "record should be deleted after the grace delay");
    }

    #[tokio::test]
    async fn ring_timeout_marks_the_call_missed() {
        let store = Arc::new(MemoryStore::new());
        let config = CallConfig {
            ice_servers: Vec::new(),
            ring_timeout: Duration::from_millis(100),
            delete_grace: Duration::from_secs(60),
            ..CallConfig::default()
        };
        let ctrl = CallController::new(
            identity("alice"),
            Arc::clone(&store) as Arc<dyn SignalingStore>,
            Arc::new(NullDevices),
            config,
            None,
        );
        let call_id = ctrl
            .start_call("bob", "Bob", "", CallType::Audio)
            .await
            .unwrap();

        tokio::time::sleep(Duration::from_millis(400)).await;
        assert!(!ctrl.call_state().is_in_call());
        let record = store.get_call(&call_id).await.unwrap().unwrap();
        assert_eq!(record.status, CallStatus::Missed);
    }

    struct BrokenStore;

    #[async_trait]
    impl SignalingStore for BrokenStore {
        async fn create_call(&self, _record: CallRecord) -> Result<CallRecord, StoreError> {
            Err(StoreError::Backend("backend unreachable".into()))
        }
        async fn get_call(&self, _call_id: &CallId) -> Result<Option<CallRecord>, StoreError> {
            Err(StoreError::Backend("backend unreachable".into()))
        }
        async fn update_call(&self, _call_id: &CallId, _patch: CallPatch) -> Result<(), StoreError> {
            Err(StoreError::Backend("backend unreachable".into()))
        }
        async fn delete_call(&self, _call_id: &CallId) -> Result<(), StoreError> {
            Err(StoreError::Backend("backend unreachable".into()))
        }
        async fn add_candidate(
            &self,
            _call_id: &CallId,
            _side: crate::calls::record::CandidateSide,
            _candidate: IceCandidateRecord,
        ) -> Result<(), StoreError> {
            Err(StoreError::Backend("backend unreachable".into()))
        }
        async fn watch_call(
            &self,
            _call_id: &CallId,
        ) -> Result<Subscription<CallRecord>, StoreError> {
            Err(StoreError::Backend("backend unreachable".into()))
        }
        async fn watch_candidates(
            &self,
            _call_id: &CallId,
            _side: crate::calls::record::CandidateSide,
        ) -> Result<Subscription<IceCandidateRecord>, StoreError> {
            Err(StoreError::Backend("backend unreachable".into()))
        }
        async fn watch_incoming(
            &self,
            _receiver: &UserId,
        ) -> Result<Subscription<CallRecord>, StoreError> {
            Err(StoreError::Backend("backend unreachable".into()))
        }
    }

    #[tokio::test]
    async fn start_call_rolls_back_to_idle_when_the_store_write_fails() {
        let ctrl = CallController::new(
            identity("alice"),
            Arc::new(BrokenStore),
            Arc::new(NullDevices),
            quick_config(),
            None,
        );
        let err = ctrl
            .start_call("bob", "Bob", "", CallType::Audio)
            .await
            .unwrap_err();
        assert!(matches!(err, CallError::Store(_)));

        let state = ctrl.call_state();
        assert!(!state.is_in_call());
        assert!(state.local_stream.is_none());
        assert!(state.error.as_deref().unwrap().contains("backend unreachable"));

        // A new call attempt is possible after the rollback.
        assert!(matches!(
            ctrl.start_call("bob", "Bob", "", CallType::Audio).await,
            Err(CallError::Store(_))
        ));
    }
}

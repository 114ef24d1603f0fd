//! Call signaling for Peerline.
//!
//! This module drives a peer-to-peer call from a "start call" intent on one
//! side and a "call received" notification on the other, through an
//! intermediary signaling store, to a direct media session between the peers.
//!
//! # Architecture
//!
//! - [`CallRecord`] & [`CallStatus`]: the shared document coordinating one
//!   call attempt, with a validated schema
//! - [`CallState`] & [`CallPhase`]: the local reactive snapshot the UI reads
//! - [`PeerSession`]: wrapper around one peer connection, reporting
//!   [`SessionEvent`]s
//! - [`CallController`]: orchestrates media, session, store and state;
//!   exposes the imperative command surface
//! - Incoming-call listener: standing subscription surfacing new calls
//!   addressed to the local user, owned by the controller
//!
//! # Lifecycle
//!
//! `Idle → Ringing → Connected → {Declined | Ended | Missed | Busy}`. The
//! record broadcasts `Ringing` while awaiting an answer; every exit path
//! (decline, hangup, ring timeout, transport loss, remote termination,
//! teardown) converges on one idempotent cleanup routine.

pub mod controller;
pub mod error;
mod listener;
pub mod record;
pub mod session;
pub mod state;


pub use controller::{CallConfig, CallController, CallEvents, DEFAULT_STUN_SERVERS};
pub use error::CallError;
pub use record::{
    CallRecord, CallStatus, CandidateSide, IceCandidateRecord, RecordError, SdpKind,
    SessionDescription,
};
pub use session::{ConnectionState, PeerSession, SessionEvent, SessionRole};
pub use state::{CallPhase, CallState};

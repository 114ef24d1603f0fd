//! Peer-to-peer audio/video calling engine for the Peerline messenger.
//!
//! The surrounding chat application provides identity, a signaling store
//! (any document database with a live change feed — see
//! [`store::SignalingStore`]) and optionally real capture devices (see
//! [`media::MediaDevices`]); this crate provides everything between a
//! "start call" tap and media flowing directly between two peers:
//!
//! ```no_run
//! use std::sync::Arc;
//! use peerline::{CallConfig, CallController, CallType, LocalIdentity};
//! use peerline::media::NullDevices;
//! use peerline::store::MemoryStore;
//!
//! # async fn demo() -> Result<(), peerline::CallError> {
//! let controller = CallController::new(
//!     LocalIdentity::new("alice", "Alice", "https://cdn.example/alice.png"),
//!     Arc::new(MemoryStore::new()),
//!     Arc::new(NullDevices),
//!     CallConfig::default(),
//!     None,
//! );
//! let call_id = controller
//!     .start_call("bob", "Bob", "https://cdn.example/bob.png", CallType::Video)
//!     .await?;
//! # let _ = call_id;
//! # Ok(())
//! # }
//! ```

pub mod calls;
pub mod media;
pub mod store;
pub mod types;

pub use calls::{
    CallConfig, CallController, CallError, CallEvents, CallPhase, CallRecord, CallState,
    CallStatus, SessionDescription,
};
pub use types::{CallId, CallType, LocalIdentity, UserId};

//! Signaling store contract.
//!
//! The store is the external collaborator both peers can reach: a document
//! database holding one [`CallRecord`] per call attempt plus two directional
//! candidate collections under it, with a live change feed. This crate only
//! consumes the interface; [`MemoryStore`] is the in-process implementation
//! used by the tests and by embedders without a backend.
//!
//! Single-writer-per-field discipline is enforced by construction: the only
//! update surface is the role-scoped [`CallPatch`] — the receiver writes the
//! answer (which implies `Connected`), a terminator writes a terminal status.
//! There is no general field merge.

mod memory;

pub use memory::MemoryStore;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::mpsc;

use crate::calls::record::{CallRecord, CallStatus, CandidateSide, IceCandidateRecord, SessionDescription};
use crate::types::{CallId, UserId};

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("document already exists: {0}")]
    AlreadyExists(String),

    #[error("document not found: {0}")]
    NotFound(String),

    #[error("store backend failure: {0}")]
    Backend(String),

    #[error("store is closed")]
    Closed,
}

/// Role-scoped update to a call record.
#[derive(Debug, Clone)]
pub enum CallPatch {
    /// Receiver role: set the answer and transition the record to
    /// `Connected` in one write.
    Answer(SessionDescription),
    /// Terminator role: set a terminal status (or the caller-side missed
    /// expiry). Non-terminal statuses other than `Connected` are not
    /// representable here on purpose.
    Status(CallStatus),
}

/// A cancellable stream of change events. Dropping the subscription
/// unsubscribes; the stream ends (`recv` returns `None`) when the store side
/// goes away, e.g. because the watched document was deleted.
#[derive(Debug)]
pub struct Subscription<T> {
    rx: mpsc::UnboundedReceiver<T>,
}

impl<T> Subscription<T> {
    /// Pair a subscription with the sender a store implementation feeds.
    pub fn channel() -> (mpsc::UnboundedSender<T>, Self) {
        let (tx, rx) = mpsc::unbounded_channel();
        (tx, Self { rx })
    }

    pub async fn recv(&mut self) -> Option<T> {
        self.rx.recv().await
    }

    /// Stop receiving further events without dropping the value.
    pub fn close(&mut self) {
        self.rx.close();
    }
}

/// Document store + live change feed consumed by the call controller.
///
/// Implementations must provide read-after-write consistency: a change feed
/// event for a write is delivered only after a subsequent `get_call` would
/// observe that write.
#[async_trait]
pub trait SignalingStore: Send + Sync + 'static {
    /// Persist a new call record, stamping `created_at`. Returns the stored
    /// record. Fails with [`StoreError::AlreadyExists`] on key collision.
    async fn create_call(&self, record: CallRecord) -> Result<CallRecord, StoreError>;

    async fn get_call(&self, call_id: &CallId) -> Result<Option<CallRecord>, StoreError>;

    /// Apply a role-scoped patch. A missing document is tolerated (terminal
    /// writes race deletion by design) and reported as success.
    async fn update_call(&self, call_id: &CallId, patch: CallPatch) -> Result<(), StoreError>;

    /// Delete the record and its candidate collections. Missing documents are
    /// tolerated.
    async fn delete_call(&self, call_id: &CallId) -> Result<(), StoreError>;

    /// Append one candidate to the given directional collection. The
    /// collection may outlive — and predate — the parent record, matching
    /// document-store semantics.
    async fn add_candidate(
        &self,
        call_id: &CallId,
        side: CandidateSide,
        candidate: IceCandidateRecord,
    ) -> Result<(), StoreError>;

    /// Watch one call record. The current snapshot (if any) is replayed
    /// first, then every subsequent create/update. The stream ends when the
    /// record is deleted.
    async fn watch_call(&self, call_id: &CallId) -> Result<Subscription<CallRecord>, StoreError>;

    /// Watch one directional candidate collection. Candidates already present
    /// are replayed in order, then each newly added one is delivered exactly
    /// once.
    async fn watch_candidates(
        &self,
        call_id: &CallId,
        side: CandidateSide,
    ) -> Result<Subscription<IceCandidateRecord>, StoreError>;

    /// Watch for call records addressed to `receiver` that are awaiting an
    /// answer. Fires once per added record (existing matches are replayed);
    /// updates to an already-delivered record do not re-fire.
    async fn watch_incoming(&self, receiver: &UserId) -> Result<Subscription<CallRecord>, StoreError>;
}

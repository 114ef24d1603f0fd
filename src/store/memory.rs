//! In-process signaling store.
//!
//! Backs the tests and embedders that run both peers in one process. All
//! mutations and subscription registrations serialize on one watcher lock,
//! which is what gives the change feed its read-after-write and exactly-once
//! guarantees: a replay-plus-register can never race a mutate-plus-notify.

use std::collections::HashSet;
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::Utc;
use dashmap::DashMap;
use log::warn;
use tokio::sync::mpsc::UnboundedSender;

use super::{CallPatch, SignalingStore, StoreError, Subscription};
use crate::calls::record::{CallRecord, CallStatus, CandidateSide, IceCandidateRecord};
use crate::types::{CallId, UserId};

#[derive(Default)]
struct Watchers {
    call: Vec<(CallId, UnboundedSender<CallRecord>)>,
    candidate: Vec<(CallId, CandidateSide, UnboundedSender<IceCandidateRecord>)>,
    incoming: Vec<IncomingWatcher>,
}

struct IncomingWatcher {
    receiver: UserId,
    delivered: HashSet<CallId>,
    tx: UnboundedSender<CallRecord>,
}

/// In-memory [`SignalingStore`] with a change fan-out.
#[derive(Default)]
pub struct MemoryStore {
    calls: DashMap<CallId, CallRecord>,
    candidates: DashMap<(CallId, CandidateSide), Vec<IceCandidateRecord>>,
    watchers: Mutex<Watchers>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn notify_call(watchers: &mut Watchers, record: &CallRecord) {
        watchers
            .call
            .retain(|(id, tx)| *id != record.call_id || tx.send(record.clone()).is_ok());
    }

    fn notify_incoming(watchers: &mut Watchers, record: &CallRecord) {
        if !record.status.is_awaiting_answer() {
            return;
        }
        watchers.incoming.retain_mut(|w| {
            if w.receiver != record.receiver_id {
                return true;
            }
            if !w.delivered.insert(record.call_id.clone()) {
                return true;
            }
            w.tx.send(record.clone()).is_ok()
        });
    }
}

#[async_trait]
impl SignalingStore for MemoryStore {
    async fn create_call(&self, mut record: CallRecord) -> Result<CallRecord, StoreError> {
        let mut watchers = self.watchers.lock().unwrap();
        if self.calls.contains_key(&record.call_id) {
            return Err(StoreError::AlreadyExists(record.call_id.to_string()));
        }
        record.created_at = Some(Utc::now());
        self.calls.insert(record.call_id.clone(), record.clone());
        Self::notify_call(&mut watchers, &record);
        Self::notify_incoming(&mut watchers, &record);
        Ok(record)
    }

    async fn get_call(&self, call_id: &CallId) -> Result<Option<CallRecord>, StoreError> {
        Ok(self.calls.get(call_id).map(|r| r.value().clone()))
    }

    async fn update_call(&self, call_id: &CallId, patch: CallPatch) -> Result<(), StoreError> {
        let mut watchers = self.watchers.lock().unwrap();
        let Some(mut entry) = self.calls.get_mut(call_id) else {
            // Terminal writes race deletion by design; not-found is non-fatal.
            return Ok(());
        };
        if entry.status.is_terminal() {
            warn!(
                "Ignoring {:?} patch for call {}: record is already {:?}",
                patch, call_id, entry.status
            );
            return Ok(());
        }
        match patch {
            CallPatch::Answer(answer) => {
                if entry.answer.is_some() {
                    warn!("Ignoring duplicate answer for call {}", call_id);
                    return Ok(());
                }
                entry.answer = Some(answer);
                entry.status = CallStatus::Connected;
            }
            CallPatch::Status(status) => {
                if !status.is_terminal() {
                    warn!(
                        "Ignoring non-terminal status patch {:?} for call {}",
                        status, call_id
                    );
                    return Ok(());
                }
                entry.status = status;
            }
        }
        let updated = entry.value().clone();
        drop(entry);
        Self::notify_call(&mut watchers, &updated);
        Ok(())
    }

    async fn delete_call(&self, call_id: &CallId) -> Result<(), StoreError> {
        let mut watchers = self.watchers.lock().unwrap();
        self.calls.remove(call_id);
        self.candidates
            .remove(&(call_id.clone(), CandidateSide::Caller));
        self.candidates
            .remove(&(call_id.clone(), CandidateSide::Callee));
        // Dropping the senders ends the document's change streams.
        watchers.call.retain(|(id, _)| id != call_id);
        watchers.candidate.retain(|(id, _, _)| id != call_id);
        Ok(())
    }

    async fn add_candidate(
        &self,
        call_id: &CallId,
        side: CandidateSide,
        candidate: IceCandidateRecord,
    ) -> Result<(), StoreError> {
        let mut watchers = self.watchers.lock().unwrap();
        self.candidates
            .entry((call_id.clone(), side))
            .or_default()
            .push(candidate.clone());
        watchers.candidate.retain(|(id, s, tx)| {
            id != call_id || *s != side || tx.send(candidate.clone()).is_ok()
        });
        Ok(())
    }

    async fn watch_call(&self, call_id: &CallId) -> Result<Subscription<CallRecord>, StoreError> {
        let mut watchers = self.watchers.lock().unwrap();
        let (tx, sub) = Subscription::channel();
        if let Some(record) = self.calls.get(call_id) {
            let _ = tx.send(record.value().clone());
        }
        watchers.call.push((call_id.clone(), tx));
        Ok(sub)
    }

    async fn watch_candidates(
        &self,
        call_id: &CallId,
        side: CandidateSide,
    ) -> Result<Subscription<IceCandidateRecord>, StoreError> {
        let mut watchers = self.watchers.lock().unwrap();
        let (tx, sub) = Subscription::channel();
        if let Some(existing) = self.candidates.get(&(call_id.clone(), side)) {
            for candidate in existing.iter() {
                let _ = tx.send(candidate.clone());
            }
        }
        watchers.candidate.push((call_id.clone(), side, tx));
        Ok(sub)
    }

    async fn watch_incoming(
        &self,
        receiver: &UserId,
    ) -> Result<Subscription<CallRecord>, StoreError> {
        let mut watchers = self.watchers.lock().unwrap();
        let (tx, sub) = Subscription::channel();
        let mut delivered = HashSet::new();
        for entry in self.calls.iter() {
            let record = entry.value();
            if record.receiver_id == *receiver && record.status.is_awaiting_answer() {
                delivered.insert(record.call_id.clone());
                let _ = tx.send(record.clone());
            }
        }
        watchers.incoming.push(IncomingWatcher {
            receiver: receiver.clone(),
            delivered,
            tx,
        });
        Ok(sub)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::calls::record::{SdpKind, SessionDescription};
    use crate::types::CallType;

    fn record(id: &str) -> CallRecord {
        CallRecord::new_outgoing(
            CallId::new(id),
            UserId::from("alice"),
            "Alice",
            "",
            UserId::from("bob"),
            "Bob",
            "",
            CallType::Audio,
            SessionDescription::offer("v=0\r\n"),
        )
    }

    fn candidate(n: u32) -> IceCandidateRecord {
        IceCandidateRecord {
            candidate: format!("candidate:{n} 1 udp 2130706431 192.0.2.1 54400 typ host"),
            sdp_mid: Some("0".into()),
            sdp_mline_index: Some(0),
            username_fragment: None,
        }
    }

    #[tokio::test]
    async fn create_stamps_created_at_and_round_trips() {
        let store = MemoryStore::new();
        let stored = store.create_call(record("c1")).await.unwrap();
        assert!(stored.created_at.is_some());
        let fetched = store.get_call(&CallId::new("c1")).await.unwrap().unwrap();
        assert_eq!(fetched.status, CallStatus::Ringing);
        assert_eq!(fetched.offer.as_ref().unwrap().kind, SdpKind::Offer);
    }

    #[tokio::test]
    async fn duplicate_create_fails() {
        let store = MemoryStore::new();
        store.create_call(record("c1")).await.unwrap();
        assert!(matches!(
            store.create_call(record("c1")).await,
            Err(StoreError::AlreadyExists(_))
        ));
    }

    #[tokio::test]
    async fn update_of_missing_record_is_tolerated() {
        let store = MemoryStore::new();
        store
            .update_call(&CallId::new("ghost"), CallPatch::Status(CallStatus::Ended))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn terminal_record_is_frozen() {
        let store = MemoryStore::new();
        let id = CallId::new("c1");
        store.create_call(record("c1")).await.unwrap();
        store
            .update_call(&id, CallPatch::Status(CallStatus::Declined))
            .await
            .unwrap();

        store
            .update_call(&id, CallPatch::Status(CallStatus::Ended))
            .await
            .unwrap();
        store
            .update_call(&id, CallPatch::Answer(SessionDescription::answer("v=0\r\n")))
            .await
            .unwrap();

        let rec = store.get_call(&id).await.unwrap().unwrap();
        assert_eq!(rec.status, CallStatus::Declined);
        assert!(rec.answer.is_none());
    }

    #[tokio::test]
    async fn answer_patch_connects_and_is_write_once() {
        let store = MemoryStore::new();
        let id = CallId::new("c1");
        store.create_call(record("c1")).await.unwrap();
        store
            .update_call(&id, CallPatch::Answer(SessionDescription::answer("first")))
            .await
            .unwrap();
        store
            .update_call(&id, CallPatch::Answer(SessionDescription::answer("second")))
            .await
            .unwrap();

        let rec = store.get_call(&id).await.unwrap().unwrap();
        assert_eq!(rec.status, CallStatus::Connected);
        assert_eq!(rec.answer.unwrap().sdp, "first");
    }

    #[tokio::test]
    async fn non_terminal_status_patch_is_ignored() {
        let store = MemoryStore::new();
        let id = CallId::new("c1");
        store.create_call(record("c1")).await.unwrap();
        store
            .update_call(&id, CallPatch::Status(CallStatus::Connected))
            .await
            .unwrap();
        let rec = store.get_call(&id).await.unwrap().unwrap();
        assert_eq!(rec.status, CallStatus::Ringing);
    }

    #[tokio::test]
    async fn watch_call_replays_then_streams_and_ends_on_delete() {
        let store = MemoryStore::new();
        let id = CallId::new("c1");
        store.create_call(record("c1")).await.unwrap();

        let mut sub = store.watch_call(&id).await.unwrap();
        let first = sub.recv().await.unwrap();
        assert_eq!(first.status, CallStatus::Ringing);

        store
            .update_call(&id, CallPatch::Status(CallStatus::Ended))
            .await
            .unwrap();
        let second = sub.recv().await.unwrap();
        assert_eq!(second.status, CallStatus::Ended);

        store.delete_call(&id).await.unwrap();
        assert!(sub.recv().await.is_none());
    }

    #[tokio::test]
    async fn candidates_are_delivered_exactly_once_in_order() {
        let store = MemoryStore::new();
        let id = CallId::new("c1");

        // Candidates may land before the parent record exists.
        store
            .add_candidate(&id, CandidateSide::Caller, candidate(0))
            .await
            .unwrap();
        store
            .add_candidate(&id, CandidateSide::Caller, candidate(1))
            .await
            .unwrap();

        let mut sub = store
            .watch_candidates(&id, CandidateSide::Caller)
            .await
            .unwrap();
        store
            .add_candidate(&id, CandidateSide::Caller, candidate(2))
            .await
            .unwrap();

        for n in 0..3u32 {
            let got = sub.recv().await.unwrap();
            assert_eq!(got, candidate(n));
        }
    }

    #[tokio::test]
    async fn candidate_sides_are_independent() {
        let store = MemoryStore::new();
        let id = CallId::new("c1");
        store
            .add_candidate(&id, CandidateSide::Caller, candidate(0))
            .await
            .unwrap();

        let mut sub = store
            .watch_candidates(&id, CandidateSide::Callee)
            .await
            .unwrap();
        store
            .add_candidate(&id, CandidateSide::Callee, candidate(7))
            .await
            .unwrap();
        assert_eq!(sub.recv().await.unwrap(), candidate(7));
    }

    #[tokio::test]
    async fn incoming_watch_fires_once_per_added_record() {
        let store = MemoryStore::new();
        let mut sub = store.watch_incoming(&UserId::from("bob")).await.unwrap();

        store.create_call(record("c1")).await.unwrap();
        let got = sub.recv().await.unwrap();
        assert_eq!(got.call_id, CallId::new("c1"));

        // Updates to the surfaced record must not re-fire.
        store
            .update_call(&CallId::new("c1"), CallPatch::Status(CallStatus::Declined))
            .await
            .unwrap();

        // A record for someone else must not fire either.
        let mut other = record("c2");
        other.receiver_id = UserId::from("carol");
        store.create_call(other).await.unwrap();

        store.create_call(record("c3")).await.unwrap();
        let next = sub.recv().await.unwrap();
        assert_eq!(next.call_id, CallId::new("c3"));
    }

    #[tokio::test]
    async fn incoming_watch_replays_existing_ringing_records() {
        let store = MemoryStore::new();
        store.create_call(record("c1")).await.unwrap();

        let mut sub = store.watch_incoming(&UserId::from("bob")).await.unwrap();
        let got = sub.recv().await.unwrap();
        assert_eq!(got.call_id, CallId::new("c1"));
    }
}

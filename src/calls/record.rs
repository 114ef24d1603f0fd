//! The shared call document and its sub-records.
//!
//! A [`CallRecord`] is the signaling-store document coordinating one call
//! attempt between two peers. Each field has exactly one writer role: the
//! caller writes the record (with the offer) at creation, the receiver writes
//! the answer, and whichever peer terminates writes the final status. Reads go
//! through [`CallRecord::validate`], which rejects structurally invalid
//! documents instead of silently coercing them.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::types::{CallId, CallType, UserId};

/// Lifecycle status stored in the shared record.
///
/// `Ringing` is the canonical broadcast status for "awaiting answer";
/// `Calling` is a legacy spelling some older writers used for the same phase
/// and is normalized to `Ringing` on read.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CallStatus {
    Calling,
    Ringing,
    Connected,
    Declined,
    Ended,
    Missed,
    Busy,
}

impl CallStatus {
    /// Terminal statuses freeze the record; only deletion may follow.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            CallStatus::Declined | CallStatus::Ended | CallStatus::Missed | CallStatus::Busy
        )
    }

    /// Whether the record is still waiting for the receiver to pick up.
    pub fn is_awaiting_answer(self) -> bool {
        matches!(self, CallStatus::Calling | CallStatus::Ringing)
    }
}

/// Which half of the offer/answer exchange a description blob is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SdpKind {
    Offer,
    Answer,
}

/// Serialized session description: type tag plus opaque SDP payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionDescription {
    pub kind: SdpKind,
    pub sdp: String,
}

impl SessionDescription {
    pub fn offer(sdp: impl Into<String>) -> Self {
        Self {
            kind: SdpKind::Offer,
            sdp: sdp.into(),
        }
    }

    pub fn answer(sdp: impl Into<String>) -> Self {
        Self {
            kind: SdpKind::Answer,
            sdp: sdp.into(),
        }
    }
}

/// Directional candidate collection under a call record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CandidateSide {
    Caller,
    Callee,
}

impl CandidateSide {
    pub fn collection_name(self) -> &'static str {
        match self {
            CandidateSide::Caller => "caller_candidates",
            CandidateSide::Callee => "callee_candidates",
        }
    }

    pub fn other(self) -> Self {
        match self {
            CandidateSide::Caller => CandidateSide::Callee,
            CandidateSide::Callee => CandidateSide::Caller,
        }
    }
}

/// Opaque connectivity-negotiation blob appended under a call record. Every
/// candidate must reach the other side exactly once; ordering within a side
/// does not matter.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IceCandidateRecord {
    pub candidate: String,
    #[serde(default)]
    pub sdp_mid: Option<String>,
    #[serde(default)]
    pub sdp_mline_index: Option<u16>,
    #[serde(default)]
    pub username_fragment: Option<String>,
}

/// The shared, store-persisted document coordinating one call attempt.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CallRecord {
    pub call_id: CallId,
    pub caller_id: UserId,
    pub receiver_id: UserId,
    pub caller_name: String,
    pub caller_image: String,
    pub receiver_name: String,
    pub receiver_image: String,
    pub call_type: CallType,
    pub status: CallStatus,
    #[serde(default)]
    pub offer: Option<SessionDescription>,
    #[serde(default)]
    pub answer: Option<SessionDescription>,
    /// Store-assigned creation time; `None` until the record is persisted.
    #[serde(default)]
    pub created_at: Option<DateTime<Utc>>,
}

/// Structural problems found while validating a record read back from the
/// store.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RecordError {
    #[error("record has an empty call id")]
    MissingCallId,

    #[error("record has an empty {0} id")]
    MissingParticipant(&'static str),

    #[error("caller and receiver are the same user")]
    SelfCall,

    #[error("record is awaiting answer but carries no offer")]
    MissingOffer,

    #[error("record is connected but carries no answer")]
    MissingAnswer,

    #[error("{0} blob has the wrong description kind")]
    WrongDescriptionKind(&'static str),
}

impl CallRecord {
    /// Build the document a caller persists when starting a call. The record
    /// broadcasts `Ringing` so the receiver's incoming listener picks it up
    /// immediately.
    pub fn new_outgoing(
        call_id: CallId,
        caller_id: UserId,
        caller_name: impl Into<String>,
        caller_image: impl Into<String>,
        receiver_id: UserId,
        receiver_name: impl Into<String>,
        receiver_image: impl Into<String>,
        call_type: CallType,
        offer: SessionDescription,
    ) -> Self {
        Self {
            call_id,
            caller_id,
            receiver_id,
            caller_name: caller_name.into(),
            caller_image: caller_image.into(),
            receiver_name: receiver_name.into(),
            receiver_image: receiver_image.into(),
            call_type,
            status: CallStatus::Ringing,
            offer: Some(offer),
            answer: None,
            created_at: None,
        }
    }

    /// Validate the record's shape and normalize the legacy `calling` status
    /// to `ringing`. Called on every read path before the record is acted on.
    pub fn validate(&mut self) -> Result<(), RecordError> {
        if self.call_id.is_empty() {
            return Err(RecordError::MissingCallId);
        }
        if self.caller_id.is_empty() {
            return Err(RecordError::MissingParticipant("caller"));
        }
        if self.receiver_id.is_empty() {
            return Err(RecordError::MissingParticipant("receiver"));
        }
        if self.caller_id == self.receiver_id {
            return Err(RecordError::SelfCall);
        }

        if self.status == CallStatus::Calling {
            self.status = CallStatus::Ringing;
        }

        if let Some(offer) = &self.offer {
            if offer.kind != SdpKind::Offer {
                return Err(RecordError::WrongDescriptionKind("offer"));
            }
        }
        if let Some(answer) = &self.answer {
            if answer.kind != SdpKind::Answer {
                return Err(RecordError::WrongDescriptionKind("answer"));
            }
        }

        if self.status.is_awaiting_answer() && self.offer.is_none() {
            return Err(RecordError::MissingOffer);
        }
        if self.status == CallStatus::Connected && self.answer.is_none() {
            return Err(RecordError::MissingAnswer);
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record() -> CallRecord {
        CallRecord::new_outgoing(
            CallId::new("AC90CFD09DF712D981142B172706F9F2"),
            UserId::from("alice"),
            "Alice",
            "https://cdn.example/alice.png",
            UserId::from("bob"),
            "Bob",
            "",
            CallType::Video,
            SessionDescription::offer("v=0\r\n"),
        )
    }

    #[test]
    fn outgoing_record_validates() {
        let mut rec = record();
        rec.validate().unwrap();
        assert_eq!(rec.status, CallStatus::Ringing);
    }

    #[test]
    fn legacy_calling_status_normalizes_to_ringing() {
        let mut rec = record();
        rec.status = CallStatus::Calling;
        rec.validate().unwrap();
        assert_eq!(rec.status, CallStatus::Ringing);
    }

    #[test]
    fn ringing_record_without_offer_is_rejected() {
        let mut rec = record();
        rec.offer = None;
        assert_eq!(rec.validate(), Err(RecordError::MissingOffer));
    }

    #[test]
    fn connected_record_without_answer_is_rejected() {
        let mut rec = record();
        rec.status = CallStatus::Connected;
        assert_eq!(rec.validate(), Err(RecordError::MissingAnswer));
    }

    #[test]
    fn swapped_description_kind_is_rejected() {
        let mut rec = record();
        rec.offer = Some(SessionDescription::answer("v=0\r\n"));
        assert_eq!(
            rec.validate(),
            Err(RecordError::WrongDescriptionKind("offer"))
        );
    }

    #[test]
    fn self_call_is_rejected() {
        let mut rec = record();
        rec.receiver_id = UserId::from("alice");
        assert_eq!(rec.validate(), Err(RecordError::SelfCall));
    }

    #[test]
    fn unknown_status_string_fails_deserialization() {
        let mut value = serde_json::to_value(record()).unwrap();
        value["status"] = serde_json::Value::String("haunted".into());
        assert!(serde_json::from_value::<CallRecord>(value).is_err());
    }

    #[test]
    fn terminal_statuses() {
        assert!(CallStatus::Declined.is_terminal());
        assert!(CallStatus::Ended.is_terminal());
        assert!(CallStatus::Missed.is_terminal());
        assert!(CallStatus::Busy.is_terminal());
        assert!(!CallStatus::Ringing.is_terminal());
        assert!(!CallStatus::Connected.is_terminal());
    }
}

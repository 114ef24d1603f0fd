//! Call-related error types.

use thiserror::Error;

use crate::calls::record::RecordError;
use crate::store::StoreError;

#[derive(Debug, Error)]
pub enum CallError {
    #[error("a call is already active")]
    AlreadyInCall,

    #[error("no call is active")]
    NotInCall,

    #[error("call not found: {0}")]
    NotFound(String),

    #[error("call record rejected: {0}")]
    Record(#[from] RecordError),

    #[error("call is not addressed to this user")]
    NotAddressedToUs,

    #[error("call is no longer awaiting an answer")]
    NotRinging,

    #[error("call has no {0} track")]
    NoTrack(&'static str),

    #[error("signaling store error: {0}")]
    Store(#[from] StoreError),

    #[error("peer connection error: {0}")]
    Rtc(#[from] webrtc::Error),
}

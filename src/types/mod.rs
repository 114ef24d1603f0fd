//! Shared identifier and metadata types.

pub mod call;

pub use call::{CallId, CallType, LocalIdentity, UserId};

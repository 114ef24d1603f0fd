//! Core call identifier and metadata types.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Opaque user identifier, assigned by the surrounding application.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct UserId(String);

impl UserId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Display for UserId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for UserId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for UserId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

/// Identifier unique per call attempt, used as the signaling document key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CallId(String);

impl CallId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Generate a random call id (32 uppercase hex chars).
    pub fn generate() -> Self {
        let bytes = rand::random::<[u8; 16]>();
        let mut s = String::with_capacity(32);
        for b in bytes {
            s.push_str(&format!("{b:02X}"));
        }
        Self(s)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Display for CallId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for CallId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Whether a call carries video or audio only. Immutable once the call is
/// created.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CallType {
    Audio,
    Video,
}

impl CallType {
    pub fn is_video(self) -> bool {
        self == CallType::Video
    }
}

impl fmt::Display for CallType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CallType::Audio => f.write_str("audio"),
            CallType::Video => f.write_str("video"),
        }
    }
}

/// Display metadata for the local user, snapshotted into outgoing call
/// records. The directory/profile service that produces these is not part of
/// this crate.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LocalIdentity {
    pub user_id: UserId,
    pub display_name: String,
    pub avatar_url: String,
}

impl LocalIdentity {
    pub fn new(
        user_id: impl Into<UserId>,
        display_name: impl Into<String>,
        avatar_url: impl Into<String>,
    ) -> Self {
        Self {
            user_id: user_id.into(),
            display_name: display_name.into(),
            avatar_url: avatar_url.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generated_call_ids_are_unique_hex() {
        let a = CallId::generate();
        let b = CallId::generate();
        assert_ne!(a, b);
        assert_eq!(a.as_str().len(), 32);
        assert!(a.as_str().chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn call_type_serializes_lowercase() {
        assert_eq!(serde_json::to_string(&CallType::Video).unwrap(), "\"video\"");
        let t: CallType = serde_json::from_str("\"audio\"").unwrap();
        assert_eq!(t, CallType::Audio);
    }
}

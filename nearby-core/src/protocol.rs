//! Message model and protocol version.

use serde::{Deserialize, Serialize};
use std::time::{SystemTime, UNIX_EPOCH};

use crate::identity::MessageId;

/// Current protocol version. Carried by every transport frame.
pub const PROTOCOL_VERSION: u8 = 1;

/// One published message: identity plus opaque payload. Immutable once
/// created; owned by the publishing session until unpublished.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub id: MessageId,
    pub payload: Vec<u8>,
    /// Milliseconds since the Unix epoch at construction.
    pub created_at: u64,
    /// Free-form application tag; empty when unused.
    pub kind: String,
}

impl Message {
    pub fn new(id: MessageId, payload: Vec<u8>) -> Self {
        Self {
            id,
            payload,
            created_at: now_millis(),
            kind: String::new(),
        }
    }

    pub fn with_kind(mut self, kind: impl Into<String>) -> Self {
        self.kind = kind.into();
        self
    }
}

fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

//! Error taxonomy for the public surface.
//!
//! Transport failures surface synchronously to the immediate caller and are
//! never retried internally; a failed start leaves the session Idle so the
//! caller can retry.

use crate::identity::MessageId;

#[derive(Debug, thiserror::Error)]
pub enum NearbyError {
    /// The radio or a required feature is absent, powered off, or failing.
    #[error("transport unavailable: {0}")]
    TransportUnavailable(String),
    /// Start requested while already running, where toggle or replace
    /// semantics do not apply.
    #[error("already active")]
    AlreadyActive,
    /// Payload exceeds the envelope cap.
    #[error("payload too large: {size} bytes (limit {limit})")]
    PayloadTooLarge { size: usize, limit: usize },
    /// Operation referenced an identity not published here.
    #[error("identity not found: {0}")]
    IdentityNotFound(MessageId),
    /// A transfer was dropped mid-flight. Never returned to callers; the
    /// only externally observable signal is the Found event that never
    /// happens.
    #[error("transfer abandoned: {0}")]
    TransferAbandoned(MessageId),
}

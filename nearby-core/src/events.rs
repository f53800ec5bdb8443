//! Caller-facing event stream.
//!
//! Everything a session surfaces arrives as one tagged variant on a single
//! channel handed out at construction, in place of per-call-site listener
//! objects.

use crate::identity::MessageId;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NearbyEvent {
    /// An identity became present. Emitted at most once per appearance; the
    /// payload is absent when the advertisement carried none.
    Found {
        id: MessageId,
        payload: Option<Vec<u8>>,
    },
    /// A present identity went unrenewed for the liveness window. Carries
    /// the last-known payload.
    Lost {
        id: MessageId,
        payload: Option<Vec<u8>>,
    },
    /// The publish session's TTL elapsed; the publication was stopped.
    PublishExpired,
    /// The subscribe session's TTL elapsed; the scan was stopped.
    SubscribeExpired,
}

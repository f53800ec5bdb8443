//! Transport seam: what the core consumes from the radio layer.
//!
//! The core never opens sockets or touches hardware; implementations of
//! [`Radio`] broadcast one advertisement, deliver scan sightings, and carry
//! offset pulls between peers. The serving side of the pull protocol is
//! reached through the session's `PullHandle`, which transport hosts drive
//! when remote peers read.

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::chunk::PullStatus;
use crate::error::NearbyError;
use crate::identity::{MessageId, PeerId};

/// One advertisement observation delivered by an active scan.
#[derive(Debug, Clone)]
pub struct Sighting {
    /// Peer the advertisement came from; addresses follow-up pulls.
    pub peer: PeerId,
    pub id: MessageId,
    /// Complete envelope when the advertisement carried it inline. `None`
    /// means the payload must be pulled from the peer.
    pub envelope: Option<Vec<u8>>,
}

/// Transport-level failures, reported synchronously by start operations.
#[derive(Debug, Clone, thiserror::Error)]
pub enum RadioError {
    #[error("radio unavailable")]
    Unavailable,
    #[error("feature not supported")]
    Unsupported,
    #[error("already started")]
    AlreadyStarted,
    #[error("advertisement data too large: {size} bytes (limit {limit})")]
    PayloadTooLarge { size: usize, limit: usize },
    #[error("transport error: {0}")]
    Io(String),
}

impl From<RadioError> for NearbyError {
    fn from(e: RadioError) -> Self {
        match e {
            RadioError::AlreadyStarted => NearbyError::AlreadyActive,
            RadioError::PayloadTooLarge { size, limit } => {
                NearbyError::PayloadTooLarge { size, limit }
            }
            other => NearbyError::TransportUnavailable(other.to_string()),
        }
    }
}

/// Radio primitives the session controller drives.
#[async_trait]
pub trait Radio: Send + Sync + 'static {
    /// Begin advertising `id`, carrying the encoded envelope inline when the
    /// medium allows. At most one broadcast is active per radio; the session
    /// stops the previous broadcast before starting a replacement.
    async fn start_broadcast(&self, id: MessageId, envelope: Vec<u8>) -> Result<(), RadioError>;

    async fn stop_broadcast(&self);

    /// Begin scanning for the service identity this radio was built with.
    /// Sightings arrive on the returned channel until the scan stops.
    async fn start_scan(&self) -> Result<mpsc::UnboundedReceiver<Sighting>, RadioError>;

    async fn stop_scan(&self);

    /// Pull one chunk of `id` from `peer` starting at `offset`.
    async fn pull_chunk(
        &self,
        peer: PeerId,
        id: MessageId,
        offset: usize,
    ) -> Result<(Vec<u8>, PullStatus), RadioError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn radio_errors_map_into_taxonomy() {
        assert!(matches!(
            NearbyError::from(RadioError::AlreadyStarted),
            NearbyError::AlreadyActive
        ));
        assert!(matches!(
            NearbyError::from(RadioError::PayloadTooLarge { size: 9, limit: 4 }),
            NearbyError::PayloadTooLarge { size: 9, limit: 4 }
        ));
        assert!(matches!(
            NearbyError::from(RadioError::Unavailable),
            NearbyError::TransportUnavailable(_)
        ));
        assert!(matches!(
            NearbyError::from(RadioError::Unsupported),
            NearbyError::TransportUnavailable(_)
        ));
    }
}

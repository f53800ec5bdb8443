//! Nearby protocol core: presence tracking and chunked pull transport for
//! proximity message exchange.
//!
//! One side advertises a service identity plus a payload; the other scans
//! for that identity and tracks which payloads are currently present. The
//! core owns liveness (found / renewed / lost, driven by intermittent
//! sightings and a TTL) and chunk reassembly; the radio primitives
//! themselves live behind the [`Radio`] trait.

pub mod chunk;
pub mod config;
pub mod error;
pub mod events;
pub mod identity;
pub mod presence;
pub mod protocol;
pub mod radio;
pub mod session;
pub mod testing;
pub mod wire;

pub use chunk::{PagingServer, PullStatus, Reassembler, DEFAULT_CHUNK_SIZE};
pub use config::Config;
pub use error::NearbyError;
pub use events::NearbyEvent;
pub use identity::{MessageId, PeerId, ServiceId};
pub use presence::{Observation, PresenceRegistry, DEFAULT_PRESENCE_TTL};
pub use protocol::{Message, PROTOCOL_VERSION};
pub use radio::{Radio, RadioError, Sighting};
pub use session::{NearbySession, PullHandle, Status};

//! Identity types: opaque 128-bit identifiers keying every map in the protocol.

use serde::{Deserialize, Serialize};

mod bytes_16 {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    pub fn serialize<S: Serializer>(v: &[u8; 16], serializer: S) -> Result<S::Ok, S::Error> {
        v.as_slice().serialize(serializer)
    }
    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<[u8; 16], D::Error> {
        let buf: Vec<u8> = Deserialize::deserialize(d)?;
        buf.try_into()
            .map_err(|_| serde::de::Error::custom("expected 16 bytes"))
    }
}

/// Service identity: names the service whose advertisements scanners filter on.
/// All radios of one deployment share the same service identity.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ServiceId(#[serde(with = "bytes_16")] [u8; 16]);

/// Message identity: names one published message. Never reused concurrently
/// by two live sessions on the same side.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct MessageId(#[serde(with = "bytes_16")] [u8; 16]);

/// Peer identity: transient transport-level address of a remote radio, used
/// to key pull cursors and direct follow-up pulls.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PeerId(#[serde(with = "bytes_16")] [u8; 16]);

/// Error parsing an identifier from its canonical uuid string form.
#[derive(Debug, thiserror::Error)]
#[error("invalid identifier: {0}")]
pub struct IdentityParseError(#[from] uuid::Error);

impl ServiceId {
    pub fn from_bytes(bytes: [u8; 16]) -> Self {
        ServiceId(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 16] {
        &self.0
    }

    pub fn random() -> Self {
        ServiceId(uuid::Uuid::new_v4().into_bytes())
    }
}

impl MessageId {
    pub fn from_bytes(bytes: [u8; 16]) -> Self {
        MessageId(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 16] {
        &self.0
    }

    pub fn random() -> Self {
        MessageId(uuid::Uuid::new_v4().into_bytes())
    }
}

impl PeerId {
    pub fn from_bytes(bytes: [u8; 16]) -> Self {
        PeerId(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 16] {
        &self.0
    }

    pub fn random() -> Self {
        PeerId(uuid::Uuid::new_v4().into_bytes())
    }
}

impl std::fmt::Display for ServiceId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        uuid::Uuid::from_bytes(self.0).fmt(f)
    }
}

impl std::fmt::Display for MessageId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        uuid::Uuid::from_bytes(self.0).fmt(f)
    }
}

impl std::fmt::Display for PeerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        uuid::Uuid::from_bytes(self.0).fmt(f)
    }
}

impl std::str::FromStr for ServiceId {
    type Err = IdentityParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(ServiceId(uuid::Uuid::parse_str(s)?.into_bytes()))
    }
}

impl std::str::FromStr for MessageId {
    type Err = IdentityParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(MessageId(uuid::Uuid::parse_str(s)?.into_bytes()))
    }
}

//! Core tunables.

use std::time::Duration;

use serde::Deserialize;

use crate::chunk::DEFAULT_CHUNK_SIZE;
use crate::presence::DEFAULT_PRESENCE_TTL;

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Liveness window before an unrenewed identity is reported lost.
    pub presence_ttl: Duration,
    /// Pull chunk size until the transport renegotiates its transfer unit.
    pub chunk_size: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            presence_ttl: DEFAULT_PRESENCE_TTL,
            chunk_size: DEFAULT_CHUNK_SIZE,
        }
    }
}

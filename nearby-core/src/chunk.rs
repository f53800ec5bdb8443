//! Chunked transport: offset-paginated pull serving and in-order reassembly.
//!
//! Two independent halves share the offset/sentinel protocol. The paging
//! server (publish side) slices a payload into chunks addressed by byte
//! offset; the reassembler (subscribe side) appends chunks in arrival order
//! and finalizes when the end-of-data sentinel arrives. The sentinel, not a
//! short or empty chunk, is the authoritative end marker: a short chunk can
//! legitimately appear mid-transfer after a transfer-unit renegotiation.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::error::NearbyError;
use crate::identity::{MessageId, PeerId};

/// Default chunk size in bytes until the transport negotiates a transfer unit.
pub const DEFAULT_CHUNK_SIZE: usize = 512;

/// Status accompanying every pulled chunk.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PullStatus {
    /// Chunk data returned; more may follow.
    Ok,
    /// No data at or beyond the requested offset. Terminal.
    EndOfData,
}

/// Read position of one peer pulling one payload.
#[derive(Debug, Clone, Copy)]
struct PullCursor {
    offset: usize,
}

/// Serves offset-addressed chunks of published payloads to pulling peers.
///
/// One cursor exists per (identity, peer) pair actively pulling; it advances
/// monotonically, never exceeds the payload length, and is retired on
/// completion or peer disconnect. The chunk size is read at pull time so a
/// renegotiated transfer unit takes effect on the next pull.
pub struct PagingServer {
    payloads: HashMap<MessageId, Vec<u8>>,
    cursors: HashMap<(MessageId, PeerId), PullCursor>,
    chunk_size: usize,
}

impl PagingServer {
    pub fn new(chunk_size: usize) -> Self {
        Self {
            payloads: HashMap::new(),
            cursors: HashMap::new(),
            chunk_size: chunk_size.max(1),
        }
    }

    /// Transfer unit renegotiation. Takes effect on the next pull.
    pub fn set_chunk_size(&mut self, chunk_size: usize) {
        self.chunk_size = chunk_size.max(1);
    }

    pub fn chunk_size(&self) -> usize {
        self.chunk_size
    }

    /// Install a payload for serving. Returns false (and leaves the existing
    /// payload untouched) if the identity is already active; replacement goes
    /// through `remove_payload` first.
    pub fn add_payload(&mut self, id: MessageId, bytes: Vec<u8>) -> bool {
        if self.payloads.contains_key(&id) {
            return false;
        }
        self.payloads.insert(id, bytes);
        true
    }

    /// Stop serving a payload, retiring any cursors pulling it.
    pub fn remove_payload(&mut self, id: MessageId) -> bool {
        if self.payloads.remove(&id).is_none() {
            return false;
        }
        self.cursors.retain(|(m, _), _| *m != id);
        true
    }

    pub fn contains(&self, id: MessageId) -> bool {
        self.payloads.contains_key(&id)
    }

    pub fn payload_ids(&self) -> Vec<MessageId> {
        self.payloads.keys().copied().collect()
    }

    /// Serve one chunk of `id` to `peer` starting at `offset`.
    ///
    /// `offset >= total` yields an empty chunk with `EndOfData` and retires
    /// the peer's cursor; this covers both normal completion and a
    /// zero-length payload, whose very first pull is terminal.
    pub fn pull(
        &mut self,
        id: MessageId,
        peer: PeerId,
        offset: usize,
    ) -> Result<(Vec<u8>, PullStatus), NearbyError> {
        let payload = self
            .payloads
            .get(&id)
            .ok_or(NearbyError::IdentityNotFound(id))?;
        let total = payload.len();
        if offset >= total {
            self.cursors.remove(&(id, peer));
            return Ok((Vec::new(), PullStatus::EndOfData));
        }
        let end = offset.saturating_add(self.chunk_size).min(total);
        let chunk = payload[offset..end].to_vec();
        let cursor = self
            .cursors
            .entry((id, peer))
            .or_insert(PullCursor { offset: 0 });
        // Monotonic: a stale re-request never moves the cursor backwards.
        cursor.offset = cursor.offset.max(end);
        Ok((chunk, PullStatus::Ok))
    }

    /// Peer connection lost: retire all of its cursors.
    pub fn disconnect(&mut self, peer: PeerId) {
        self.cursors.retain(|(_, p), _| *p != peer);
    }

    #[cfg(test)]
    fn cursor_offset(&self, id: MessageId, peer: PeerId) -> Option<usize> {
        self.cursors.get(&(id, peer)).map(|c| c.offset)
    }
}

/// Accumulated bytes of one in-flight transfer.
#[derive(Debug, Default)]
pub struct TransferState {
    buffer: Vec<u8>,
}

impl TransferState {
    pub fn len(&self) -> usize {
        self.buffer.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }
}

/// Rebuilds payloads from chunks delivered in arrival order.
///
/// Chunk delivery for one identity is sequential by contract (the pull
/// protocol itself is sequential per peer); out-of-order delivery is not
/// reconstructed here. A transfer abandoned mid-flight is discarded without
/// producing anything.
#[derive(Default)]
pub struct Reassembler {
    transfers: HashMap<MessageId, TransferState>,
}

impl Reassembler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed one chunk. Returns the completed buffer on `EndOfData`; a
    /// sentinel with no prior chunks yields an empty buffer (zero-length
    /// payload).
    pub fn on_chunk(&mut self, id: MessageId, bytes: &[u8], status: PullStatus) -> Option<Vec<u8>> {
        match status {
            PullStatus::Ok => {
                self.transfers
                    .entry(id)
                    .or_default()
                    .buffer
                    .extend_from_slice(bytes);
                None
            }
            PullStatus::EndOfData => {
                let state = self.transfers.remove(&id).unwrap_or_default();
                Some(state.buffer)
            }
        }
    }

    /// Drop a partial transfer (connection lost mid-pull). No output.
    pub fn abandon(&mut self, id: MessageId) -> bool {
        self.transfers.remove(&id).is_some()
    }

    /// Drop every partial transfer (session stopping).
    pub fn clear(&mut self) {
        self.transfers.clear();
    }

    pub fn in_flight(&self, id: MessageId) -> bool {
        self.transfers.contains_key(&id)
    }

    pub fn buffered_len(&self, id: MessageId) -> Option<usize> {
        self.transfers.get(&id).map(TransferState::len)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ids() -> (MessageId, PeerId) {
        (MessageId::random(), PeerId::random())
    }

    #[test]
    fn pull_slices_by_chunk_size() {
        let (id, peer) = ids();
        let payload: Vec<u8> = (0..100u8).collect();
        let mut server = PagingServer::new(30);
        assert!(server.add_payload(id, payload));

        let (chunk, status) = server.pull(id, peer, 0).unwrap();
        assert_eq!(status, PullStatus::Ok);
        assert_eq!(chunk, (0..30u8).collect::<Vec<_>>());
        assert_eq!(server.cursor_offset(id, peer), Some(30));

        let (chunk, status) = server.pull(id, peer, 90).unwrap();
        assert_eq!(status, PullStatus::Ok);
        assert_eq!(chunk.len(), 10); // short final chunk
        assert_eq!(server.cursor_offset(id, peer), Some(100));
    }

    #[test]
    fn offset_at_or_past_end_is_terminal() {
        let (id, peer) = ids();
        let mut server = PagingServer::new(30);
        server.add_payload(id, vec![1u8; 50]);

        let (chunk, status) = server.pull(id, peer, 50).unwrap();
        assert!(chunk.is_empty());
        assert_eq!(status, PullStatus::EndOfData);
        // Cursor retired on completion.
        assert_eq!(server.cursor_offset(id, peer), None);

        // Beyond the end (e.g. after renegotiation) is terminal too.
        let (chunk, status) = server.pull(id, peer, 9999).unwrap();
        assert!(chunk.is_empty());
        assert_eq!(status, PullStatus::EndOfData);
    }

    #[test]
    fn zero_length_payload_is_immediately_terminal() {
        let (id, peer) = ids();
        let mut server = PagingServer::new(30);
        server.add_payload(id, Vec::new());

        let (chunk, status) = server.pull(id, peer, 0).unwrap();
        assert!(chunk.is_empty());
        assert_eq!(status, PullStatus::EndOfData);
    }

    #[test]
    fn chunk_size_change_applies_at_read_time() {
        let (id, peer) = ids();
        let mut server = PagingServer::new(10);
        server.add_payload(id, vec![7u8; 100]);

        let (chunk, _) = server.pull(id, peer, 0).unwrap();
        assert_eq!(chunk.len(), 10);

        server.set_chunk_size(25);
        let (chunk, _) = server.pull(id, peer, 10).unwrap();
        assert_eq!(chunk.len(), 25);

        // Shrinking below a previous unit keeps the terminal boundary right.
        server.set_chunk_size(3);
        let (chunk, status) = server.pull(id, peer, 99).unwrap();
        assert_eq!(chunk.len(), 1);
        assert_eq!(status, PullStatus::Ok);
        let (_, status) = server.pull(id, peer, 100).unwrap();
        assert_eq!(status, PullStatus::EndOfData);
    }

    #[test]
    fn unknown_identity_is_an_error() {
        let (id, peer) = ids();
        let mut server = PagingServer::new(10);
        assert!(matches!(
            server.pull(id, peer, 0),
            Err(NearbyError::IdentityNotFound(_))
        ));
    }

    #[test]
    fn duplicate_add_rejected_until_removed() {
        let (id, _) = ids();
        let mut server = PagingServer::new(10);
        assert!(server.add_payload(id, vec![1]));
        assert!(!server.add_payload(id, vec![2]));
        assert!(server.remove_payload(id));
        assert!(!server.remove_payload(id));
        assert!(server.add_payload(id, vec![2]));
    }

    #[test]
    fn remove_payload_retires_cursors() {
        let (id, peer) = ids();
        let mut server = PagingServer::new(10);
        server.add_payload(id, vec![0u8; 40]);
        server.pull(id, peer, 0).unwrap();
        assert_eq!(server.cursor_offset(id, peer), Some(10));

        server.remove_payload(id);
        assert_eq!(server.cursor_offset(id, peer), None);
    }

    #[test]
    fn disconnect_retires_only_that_peer() {
        let (id, peer_a) = ids();
        let peer_b = PeerId::random();
        let mut server = PagingServer::new(10);
        server.add_payload(id, vec![0u8; 40]);
        server.pull(id, peer_a, 0).unwrap();
        server.pull(id, peer_b, 0).unwrap();

        server.disconnect(peer_a);
        assert_eq!(server.cursor_offset(id, peer_a), None);
        assert_eq!(server.cursor_offset(id, peer_b), Some(10));
    }

    #[test]
    fn cursor_never_moves_backwards() {
        let (id, peer) = ids();
        let mut server = PagingServer::new(10);
        server.add_payload(id, vec![0u8; 40]);
        server.pull(id, peer, 30).unwrap();
        assert_eq!(server.cursor_offset(id, peer), Some(40));

        // Stale re-request of an earlier range.
        server.pull(id, peer, 0).unwrap();
        assert_eq!(server.cursor_offset(id, peer), Some(40));
    }

    #[test]
    fn pull_then_reassemble_roundtrip() {
        // k full chunks plus a short remainder, then the sentinel.
        let (id, peer) = ids();
        let payload: Vec<u8> = (0..=255u8).cycle().take(1000).collect();
        let mut server = PagingServer::new(64);
        server.add_payload(id, payload.clone());
        let mut reassembler = Reassembler::new();

        let mut offset = 0;
        let mut pulls = 0;
        let rebuilt = loop {
            let (bytes, status) = server.pull(id, peer, offset).unwrap();
            pulls += 1;
            offset += bytes.len();
            if let Some(buffer) = reassembler.on_chunk(id, &bytes, status) {
                break buffer;
            }
        };
        assert_eq!(rebuilt, payload);
        // 15 full chunks + one 40-byte remainder + one terminal pull.
        assert_eq!(pulls, 17);
        assert!(!reassembler.in_flight(id));
    }

    #[test]
    fn exact_multiple_needs_separate_sentinel_pull() {
        let (id, peer) = ids();
        let payload = vec![9u8; 128];
        let mut server = PagingServer::new(64);
        server.add_payload(id, payload.clone());
        let mut reassembler = Reassembler::new();

        let mut offset = 0;
        let mut pulls = 0;
        loop {
            let (bytes, status) = server.pull(id, peer, offset).unwrap();
            pulls += 1;
            offset += bytes.len();
            if let Some(buffer) = reassembler.on_chunk(id, &bytes, status) {
                assert_eq!(buffer, payload);
                break;
            }
        }
        // Two full chunks, then EndOfData on its own.
        assert_eq!(pulls, 3);
    }

    #[test]
    fn immediate_sentinel_yields_empty_buffer() {
        let id = MessageId::random();
        let mut reassembler = Reassembler::new();
        let buffer = reassembler.on_chunk(id, &[], PullStatus::EndOfData).unwrap();
        assert!(buffer.is_empty());
    }

    #[test]
    fn abandon_discards_partial_buffer() {
        let id = MessageId::random();
        let mut reassembler = Reassembler::new();
        reassembler.on_chunk(id, &[1, 2, 3], PullStatus::Ok);
        assert!(reassembler.in_flight(id));
        assert!(reassembler.abandon(id));
        assert!(!reassembler.in_flight(id));
        assert!(!reassembler.abandon(id));

        // A later sentinel for the same identity starts from nothing.
        let buffer = reassembler.on_chunk(id, &[], PullStatus::EndOfData).unwrap();
        assert!(buffer.is_empty());
    }

    #[test]
    fn interleaved_identities_do_not_cross_contaminate() {
        let a = MessageId::random();
        let b = MessageId::random();
        let mut reassembler = Reassembler::new();

        reassembler.on_chunk(a, &[1, 1], PullStatus::Ok);
        reassembler.on_chunk(b, &[2, 2, 2], PullStatus::Ok);
        reassembler.on_chunk(a, &[1], PullStatus::Ok);
        assert_eq!(reassembler.buffered_len(a), Some(3));
        assert_eq!(reassembler.buffered_len(b), Some(3));

        let got_a = reassembler.on_chunk(a, &[], PullStatus::EndOfData).unwrap();
        let got_b = reassembler.on_chunk(b, &[], PullStatus::EndOfData).unwrap();
        assert_eq!(got_a, vec![1, 1, 1]);
        assert_eq!(got_b, vec![2, 2, 2]);
    }
}

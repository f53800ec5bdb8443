//! Envelope framing: 4 bytes LE length + bincode message body.
//!
//! The encoded envelope is the byte sequence the paging server serves and
//! the reassembler rebuilds; both sides treat it as opaque.

use crate::protocol::Message;

const LEN_SIZE: usize = 4;

/// Upper bound on one encoded envelope. Anything larger is rejected at
/// publish time rather than partially transferred.
pub const MAX_ENVELOPE_LEN: u32 = 1024 * 1024; // 1 MiB

/// Encode a message into a single envelope: 4 bytes LE length + bincode body.
pub fn encode_message(msg: &Message) -> Result<Vec<u8>, EnvelopeEncodeError> {
    let body = bincode::serialize(msg).map_err(EnvelopeEncodeError::Encode)?;
    let len = body.len() as u32;
    if len > MAX_ENVELOPE_LEN {
        return Err(EnvelopeEncodeError::TooLarge {
            size: body.len(),
            limit: MAX_ENVELOPE_LEN as usize,
        });
    }
    let mut out = Vec::with_capacity(LEN_SIZE + body.len());
    out.extend_from_slice(&len.to_le_bytes());
    out.extend_from_slice(&body);
    Ok(out)
}

/// Error encoding a message into an envelope (bincode or size limit).
#[derive(Debug, thiserror::Error)]
pub enum EnvelopeEncodeError {
    #[error("encode error: {0}")]
    Encode(#[from] bincode::Error),
    #[error("envelope too large: {size} bytes (limit {limit})")]
    TooLarge { size: usize, limit: usize },
}

/// Decode one envelope from the front of `bytes`. Returns the message and the
/// number of bytes consumed. A partial buffer yields `NeedMore`.
pub fn decode_message(bytes: &[u8]) -> Result<(Message, usize), EnvelopeDecodeError> {
    if bytes.len() < LEN_SIZE {
        return Err(EnvelopeDecodeError::NeedMore);
    }
    let len = u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]) as usize;
    if len > MAX_ENVELOPE_LEN as usize {
        return Err(EnvelopeDecodeError::TooLarge);
    }
    if bytes.len() < LEN_SIZE + len {
        return Err(EnvelopeDecodeError::NeedMore);
    }
    let msg: Message = bincode::deserialize(&bytes[LEN_SIZE..LEN_SIZE + len])
        .map_err(EnvelopeDecodeError::Decode)?;
    Ok((msg, LEN_SIZE + len))
}

/// Error decoding an envelope (need more bytes, too large, or bincode failure).
#[derive(Debug, thiserror::Error)]
pub enum EnvelopeDecodeError {
    #[error("need more bytes")]
    NeedMore,
    #[error("envelope too large")]
    TooLarge,
    #[error("decode error: {0}")]
    Decode(#[from] bincode::Error),
}

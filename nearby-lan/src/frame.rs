//! LAN wire frames: 4 bytes LE length + bincode body.
//!
//! Advertisements travel as single UDP datagrams; pull requests and
//! responses travel length-prefixed over TCP.

use nearby_core::chunk::PullStatus;
use nearby_core::identity::{MessageId, PeerId, ServiceId};
use serde::{Deserialize, Serialize};

pub const LEN_SIZE: usize = 4;
pub const MAX_FRAME_LEN: u32 = 2 * 1024 * 1024; // 2 MiB

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Frame {
    /// Periodic advertisement of one published message.
    Advert {
        protocol_version: u8,
        /// Advertising node, so a scanner can skip its own datagrams and
        /// address follow-up pulls.
        node: PeerId,
        service: ServiceId,
        id: MessageId,
        total_len: u64,
        /// Envelope inline when it fits the datagram budget.
        envelope: Option<Vec<u8>>,
        /// TCP port answering pulls on the advertising node.
        pull_port: u16,
    },
    /// Request one chunk of `id` starting at `offset`.
    PullRequest {
        protocol_version: u8,
        node: PeerId,
        id: MessageId,
        offset: u64,
    },
    /// One chunk plus its terminal marker.
    PullResponse { bytes: Vec<u8>, status: PullStatus },
    /// The peer does not serve `id`.
    PullDenied { id: MessageId },
}

/// Encode a frame: 4 bytes LE length + bincode body.
pub fn encode_frame(frame: &Frame) -> Result<Vec<u8>, FrameEncodeError> {
    let body = bincode::serialize(frame).map_err(FrameEncodeError::Encode)?;
    let len = body.len() as u32;
    if len > MAX_FRAME_LEN {
        return Err(FrameEncodeError::TooLarge);
    }
    let mut out = Vec::with_capacity(LEN_SIZE + body.len());
    out.extend_from_slice(&len.to_le_bytes());
    out.extend_from_slice(&body);
    Ok(out)
}

#[derive(Debug, thiserror::Error)]
pub enum FrameEncodeError {
    #[error("encode error: {0}")]
    Encode(#[from] bincode::Error),
    #[error("frame too large")]
    TooLarge,
}

/// Decode one frame from the front of `bytes` (datagram path). Returns the
/// frame and the number of bytes consumed.
pub fn decode_frame(bytes: &[u8]) -> Result<(Frame, usize), FrameDecodeError> {
    if bytes.len() < LEN_SIZE {
        return Err(FrameDecodeError::NeedMore);
    }
    let len = u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]) as usize;
    if len > MAX_FRAME_LEN as usize {
        return Err(FrameDecodeError::TooLarge);
    }
    if bytes.len() < LEN_SIZE + len {
        return Err(FrameDecodeError::NeedMore);
    }
    let frame = decode_body(&bytes[LEN_SIZE..LEN_SIZE + len])?;
    Ok((frame, LEN_SIZE + len))
}

/// Decode a frame body whose length prefix was already consumed (TCP path).
pub fn decode_body(body: &[u8]) -> Result<Frame, FrameDecodeError> {
    bincode::deserialize(body).map_err(FrameDecodeError::Decode)
}

#[derive(Debug, thiserror::Error)]
pub enum FrameDecodeError {
    #[error("need more bytes")]
    NeedMore,
    #[error("frame too large")]
    TooLarge,
    #[error("decode error: {0}")]
    Decode(#[from] bincode::Error),
}

#[cfg(test)]
mod tests {
    use super::*;
    use nearby_core::PROTOCOL_VERSION;

    fn sample_advert() -> Frame {
        Frame::Advert {
            protocol_version: PROTOCOL_VERSION,
            node: PeerId::random(),
            service: ServiceId::random(),
            id: MessageId::random(),
            total_len: 42,
            envelope: Some(vec![1, 2, 3]),
            pull_port: 45761,
        }
    }

    #[test]
    fn roundtrip_advert() {
        let frame = sample_advert();
        let bytes = encode_frame(&frame).unwrap();
        let (decoded, n) = decode_frame(&bytes).unwrap();
        assert_eq!(n, bytes.len());
        match (frame, decoded) {
            (
                Frame::Advert {
                    id: a, envelope: ea, ..
                },
                Frame::Advert {
                    id: b, envelope: eb, ..
                },
            ) => {
                assert_eq!(a, b);
                assert_eq!(ea, eb);
            }
            _ => panic!("expected Advert"),
        }
    }

    #[test]
    fn roundtrip_pull_exchange() {
        let request = Frame::PullRequest {
            protocol_version: PROTOCOL_VERSION,
            node: PeerId::random(),
            id: MessageId::random(),
            offset: 128,
        };
        let bytes = encode_frame(&request).unwrap();
        let (decoded, _) = decode_frame(&bytes).unwrap();
        assert!(matches!(decoded, Frame::PullRequest { offset: 128, .. }));

        let response = Frame::PullResponse {
            bytes: vec![9; 64],
            status: PullStatus::Ok,
        };
        let bytes = encode_frame(&response).unwrap();
        let body = &bytes[LEN_SIZE..];
        let decoded = decode_body(body).unwrap();
        match decoded {
            Frame::PullResponse { bytes, status } => {
                assert_eq!(bytes.len(), 64);
                assert_eq!(status, PullStatus::Ok);
            }
            _ => panic!("expected PullResponse"),
        }
    }

    #[test]
    fn partial_read_need_more() {
        let bytes = encode_frame(&sample_advert()).unwrap();
        assert!(matches!(
            decode_frame(&bytes[..2]),
            Err(FrameDecodeError::NeedMore)
        ));
        assert!(matches!(
            decode_frame(&bytes[..LEN_SIZE]),
            Err(FrameDecodeError::NeedMore)
        ));
    }
}

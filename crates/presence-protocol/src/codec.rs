//! Length-prefixed MessagePack framing.
//!
//! Wire format: a 4-byte big-endian payload length followed by the
//! MessagePack-encoded [`Frame`].

use bytes::{Buf, BufMut, Bytes, BytesMut};
use thiserror::Error;

use crate::frames::Frame;

/// Maximum frame size (16 MiB).
pub const MAX_FRAME_SIZE: usize = 16 * 1024 * 1024;

/// Length prefix size in bytes.
pub const LENGTH_PREFIX_SIZE: usize = 4;

/// Errors raised while encoding or decoding frames.
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("Frame size {0} exceeds maximum {MAX_FRAME_SIZE}")]
    FrameTooLarge(usize),

    #[error("Incomplete frame: need {0} more bytes")]
    Incomplete(usize),

    #[error("Encoding error: {0}")]
    Encode(#[from] rmp_serde::encode::Error),

    #[error("Decoding error: {0}")]
    Decode(#[from] rmp_serde::decode::Error),

    /// Bytes trailing a complete frame in a single message.
    #[error("Trailing data: {0} bytes after frame")]
    TrailingData(usize),
}

fn payload_len(prefix: &[u8]) -> Result<usize, ProtocolError> {
    let length = u32::from_be_bytes([prefix[0], prefix[1], prefix[2], prefix[3]]) as usize;
    if length > MAX_FRAME_SIZE {
        return Err(ProtocolError::FrameTooLarge(length));
    }
    Ok(length)
}

/// Encode a frame into an existing buffer.
///
/// # Errors
///
/// Returns an error if the frame is too large or encoding fails.
pub fn encode_into(frame: &Frame, buf: &mut BytesMut) -> Result<(), ProtocolError> {
    let payload = rmp_serde::to_vec_named(frame)?;
    if payload.len() > MAX_FRAME_SIZE {
        return Err(ProtocolError::FrameTooLarge(payload.len()));
    }

    buf.reserve(LENGTH_PREFIX_SIZE + payload.len());
    buf.put_u32(payload.len() as u32);
    buf.extend_from_slice(&payload);
    Ok(())
}

/// Encode a frame to bytes.
///
/// # Errors
///
/// Returns an error if the frame is too large or encoding fails.
pub fn encode(frame: &Frame) -> Result<Bytes, ProtocolError> {
    let mut buf = BytesMut::new();
    encode_into(frame, &mut buf)?;
    Ok(buf.freeze())
}

/// Decode exactly one frame from a complete message.
///
/// # Errors
///
/// Returns an error if the data is incomplete, too large, has trailing
/// bytes, or is not a valid frame.
pub fn decode(data: &[u8]) -> Result<Frame, ProtocolError> {
    if data.len() < LENGTH_PREFIX_SIZE {
        return Err(ProtocolError::Incomplete(LENGTH_PREFIX_SIZE - data.len()));
    }

    let total = LENGTH_PREFIX_SIZE + payload_len(data)?;
    if data.len() < total {
        return Err(ProtocolError::Incomplete(total - data.len()));
    }
    if data.len() > total {
        return Err(ProtocolError::TrailingData(data.len() - total));
    }

    Ok(rmp_serde::from_slice(&data[LENGTH_PREFIX_SIZE..])?)
}

/// Try to decode a frame from a streaming buffer, advancing it on success.
///
/// Returns `Ok(None)` if more data is needed.
///
/// # Errors
///
/// Returns an error if the frame is too large or invalid.
pub fn decode_from(buf: &mut BytesMut) -> Result<Option<Frame>, ProtocolError> {
    if buf.len() < LENGTH_PREFIX_SIZE {
        return Ok(None);
    }

    let length = payload_len(buf)?;
    if buf.len() < LENGTH_PREFIX_SIZE + length {
        return Ok(None);
    }

    buf.advance(LENGTH_PREFIX_SIZE);
    let payload = buf.split_to(length);
    Ok(Some(rmp_serde::from_slice(&payload)?))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frames::StatusEntry;

    #[test]
    fn test_snapshot_result_preserves_hidden_entries() {
        let frame = Frame::SnapshotResult {
            id: 9,
            statuses: vec![
                StatusEntry {
                    account_id: "alice".into(),
                    can_show_status: true,
                    is_online: Some(false),
                    last_online_at: Some(0),
                },
                StatusEntry {
                    account_id: "bob".into(),
                    can_show_status: false,
                    is_online: None,
                    last_online_at: None,
                },
            ],
        };

        let decoded = decode(&encode(&frame).unwrap()).unwrap();
        assert_eq!(decoded, frame);
    }

    #[test]
    fn test_decode_incomplete() {
        let encoded = encode(&Frame::snapshot(1, ["alice", "bob"])).unwrap();

        match decode(&encoded[..5]) {
            Err(ProtocolError::Incomplete(_)) => {}
            other => panic!("Expected Incomplete error, got {other:?}"),
        }
    }

    #[test]
    fn test_decode_rejects_trailing_bytes() {
        let mut buf = BytesMut::new();
        encode_into(&Frame::ping(), &mut buf).unwrap();
        buf.put_u8(0);

        assert!(matches!(decode(&buf), Err(ProtocolError::TrailingData(1))));
    }

    #[test]
    fn test_oversized_prefix_rejected() {
        let mut buf = BytesMut::new();
        buf.put_u32((MAX_FRAME_SIZE + 1) as u32);

        assert!(matches!(
            decode_from(&mut buf),
            Err(ProtocolError::FrameTooLarge(_))
        ));
    }

    #[test]
    fn test_streaming_decode() {
        let first = Frame::connect(1, "alice", None);
        let second = Frame::ping();

        let mut buf = BytesMut::new();
        encode_into(&first, &mut buf).unwrap();
        encode_into(&second, &mut buf).unwrap();
        let tail = buf.split_off(buf.len() - 2);

        assert_eq!(decode_from(&mut buf).unwrap(), Some(first));
        assert_eq!(decode_from(&mut buf).unwrap(), None);

        buf.unsplit(tail);
        assert_eq!(decode_from(&mut buf).unwrap(), Some(second));
        assert!(buf.is_empty());
    }
}

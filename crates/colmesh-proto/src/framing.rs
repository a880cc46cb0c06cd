//! Length-prefixed framing for node-to-node messages.
//!
//! A frame is a 4-byte big-endian payload length followed by the payload.

use crate::Error;

/// Upper bound on a single frame's payload (64 MB).
///
/// Shard results for wide projections are larger than typical RPCs, but a
/// peer announcing more than this is treated as corrupt.
pub const MAX_FRAME_SIZE: usize = 64 * 1024 * 1024;

/// Size of the length prefix in bytes.
pub const LENGTH_PREFIX_SIZE: usize = 4;

/// Wrap a payload in a frame.
pub fn encode_frame(payload: &[u8]) -> Result<Vec<u8>, Error> {
    if payload.len() > MAX_FRAME_SIZE {
        return Err(Error::InvalidMessage(format!(
            "payload of {} bytes exceeds frame limit of {}",
            payload.len(),
            MAX_FRAME_SIZE
        )));
    }

    let mut frame = Vec::with_capacity(LENGTH_PREFIX_SIZE + payload.len());
    frame.extend_from_slice(&(payload.len() as u32).to_be_bytes());
    frame.extend_from_slice(payload);
    Ok(frame)
}

/// Borrow the payload of a complete frame.
///
/// Trailing bytes after the announced length are rejected.
pub fn decode_frame(frame: &[u8]) -> Result<&[u8], Error> {
    let header: [u8; LENGTH_PREFIX_SIZE] = frame
        .get(..LENGTH_PREFIX_SIZE)
        .and_then(|h| h.try_into().ok())
        .ok_or_else(|| Error::InvalidMessage(format!("frame too short: {} bytes", frame.len())))?;

    let len = u32::from_be_bytes(header) as usize;
    if len > MAX_FRAME_SIZE {
        return Err(Error::InvalidMessage(format!(
            "announced frame length {} exceeds limit of {}",
            len, MAX_FRAME_SIZE
        )));
    }

    let body = &frame[LENGTH_PREFIX_SIZE..];
    if body.len() != len {
        return Err(Error::InvalidMessage(format!(
            "frame length mismatch: announced {}, have {}",
            len,
            body.len()
        )));
    }
    Ok(body)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_frame_prefix_is_big_endian() {
        let frame = encode_frame(&[7u8; 1000]).unwrap();
        assert_eq!(&frame[..4], &[0, 0, 0x03, 0xE8]);
        assert_eq!(decode_frame(&frame).unwrap().len(), 1000);
    }

    #[test]
    fn test_empty_payload() {
        let frame = encode_frame(&[]).unwrap();
        assert_eq!(frame, vec![0, 0, 0, 0]);
        assert!(decode_frame(&frame).unwrap().is_empty());
    }

    #[test]
    fn test_rejects_truncated_and_trailing() {
        let mut frame = encode_frame(b"shard").unwrap();
        assert!(decode_frame(&frame[..frame.len() - 1]).is_err());
        frame.push(0);
        assert!(decode_frame(&frame).is_err());
        assert!(decode_frame(&[0, 0]).is_err());
    }

    #[test]
    fn test_rejects_oversized_announcement() {
        let mut frame = Vec::new();
        frame.extend_from_slice(&u32::MAX.to_be_bytes());
        assert!(decode_frame(&frame).is_err());
    }
}

//! Hybi-10 framing
//!
//! Every message is a single final text frame; continuation and control
//! frames are not interpreted. Outgoing frames are masked with a fresh random
//! key per frame.
//!
//! ```text
//!  byte 0      byte 1          extended length     mask key    payload
//! +--------+-+-------------+ +-----------------+ +----------+ +--------+
//! |  0x81  |M| length (7)  | | 0, 2 or 8 bytes | | 0 or 4 B | |  ...   |
//! +--------+-+-------------+ +-----------------+ +----------+ +--------+
//! ```

use thiserror::Error;

/// First byte of every frame we emit: FIN + text opcode
pub const TEXT_FINAL: u8 = 0x81;

/// Mask bit in the second header byte
pub const MASK_BIT: u8 = 0x80;

/// Largest payload length carried directly in the second header byte
pub const MAX_INLINE_LEN: usize = 125;

/// Length class marker for a 2-byte extended length
pub const LEN_16: u8 = 126;

/// Length class marker for an 8-byte extended length
pub const LEN_64: u8 = 127;

/// Largest possible header: 2 + 8 byte length + 4 byte mask
pub const MAX_HEADER_LEN: usize = 14;

/// Errors that can occur while decoding a frame
#[derive(Debug, Error, PartialEq, Eq)]
pub enum FrameError {
    #[error("Frame payload of {len} bytes exceeds limit of {max} bytes")]
    TooLarge { len: u64, max: usize },
}

/// A decoded frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    /// Raw first header byte (FIN, RSV and opcode bits)
    pub opcode: u8,
    pub masked: bool,
    /// Unmasked payload
    pub payload: Vec<u8>,
}

/// Encode a payload as a masked final text frame
pub fn encode(payload: &[u8]) -> Vec<u8> {
    encode_with_mask(payload, rand::random())
}

/// Encode a payload with a caller-chosen mask key
pub fn encode_with_mask(payload: &[u8], mask: [u8; 4]) -> Vec<u8> {
    let len = payload.len();
    let mut frame = Vec::with_capacity(MAX_HEADER_LEN + len);
    frame.push(TEXT_FINAL);

    if len <= MAX_INLINE_LEN {
        frame.push(MASK_BIT | len as u8);
    } else if let Ok(len) = u16::try_from(len) {
        frame.push(MASK_BIT | LEN_16);
        frame.extend_from_slice(&len.to_be_bytes());
    } else {
        frame.push(MASK_BIT | LEN_64);
        frame.extend_from_slice(&(len as u64).to_be_bytes());
    }

    frame.extend_from_slice(&mask);
    let start = frame.len();
    frame.extend_from_slice(payload);
    apply_mask(&mut frame[start..], mask);
    frame
}

/// Decode the frame at the start of `buf`
///
/// Returns the frame and the number of bytes it occupied, or `None` when `buf`
/// does not yet hold the whole frame. Unmasked frames are accepted as-is.
pub fn decode(buf: &[u8], max_payload: usize) -> Result<Option<(Frame, usize)>, FrameError> {
    if buf.len() < 2 {
        return Ok(None);
    }

    let opcode = buf[0];
    let masked = buf[1] & MASK_BIT != 0;

    let (declared, mut offset) = match buf[1] & !MASK_BIT {
        LEN_16 => match buf.get(2..4) {
            Some(bytes) => (u64::from(u16::from_be_bytes([bytes[0], bytes[1]])), 4),
            None => return Ok(None),
        },
        LEN_64 => match buf.get(2..10) {
            Some(bytes) => {
                let mut len = [0u8; 8];
                len.copy_from_slice(bytes);
                (u64::from_be_bytes(len), 10)
            }
            None => return Ok(None),
        },
        len => (u64::from(len), 2),
    };

    let len = usize::try_from(declared)
        .ok()
        .filter(|len| *len <= max_payload)
        .ok_or(FrameError::TooLarge {
            len: declared,
            max: max_payload,
        })?;

    let mask = if masked {
        let Some(bytes) = buf.get(offset..offset + 4) else {
            return Ok(None);
        };
        offset += 4;
        Some([bytes[0], bytes[1], bytes[2], bytes[3]])
    } else {
        None
    };

    let Some(data) = buf.get(offset..offset + len) else {
        return Ok(None);
    };

    let mut payload = data.to_vec();
    if let Some(mask) = mask {
        apply_mask(&mut payload, mask);
    }

    Ok(Some((
        Frame {
            opcode,
            masked,
            payload,
        },
        offset + len,
    )))
}

/// XOR each byte with `mask[i % 4]`; applying it twice restores the input
pub fn apply_mask(data: &mut [u8], mask: [u8; 4]) {
    for (i, byte) in data.iter_mut().enumerate() {
        *byte ^= mask[i % 4];
    }
}

//! Hixie-76 framing
//!
//! Text messages are sent as `0x00 <payload> 0xFF`.

use thiserror::Error;

pub const FRAME_START: u8 = 0x00;
pub const FRAME_END: u8 = 0xFF;

/// Errors that can occur while decoding legacy frames
#[derive(Debug, Error, PartialEq, Eq)]
pub enum LegacyFrameError {
    #[error("Frame does not start with 0x00 (found {0:#04x})")]
    MissingStart(u8),

    #[error("Empty frame before 0xFF delimiter")]
    Empty,
}

pub fn encode(payload: &[u8]) -> Vec<u8> {
    let mut frame = Vec::with_capacity(payload.len() + 2);
    frame.push(FRAME_START);
    frame.extend_from_slice(payload);
    frame.push(FRAME_END);
    frame
}

/// Decode the message at the start of `buf`
///
/// Returns the message and the bytes consumed (including the delimiter), or
/// `None` if no `0xFF` has arrived yet. A chunk that does not begin with `0x00`
/// is rejected as soon as its first byte is seen.
pub fn decode_next(buf: &[u8]) -> Result<Option<(Vec<u8>, usize)>, LegacyFrameError> {
    decode_next_from(buf, 0)
}

/// Like [`decode_next`], but resumes the search for `0xFF` at `scanned`
///
/// The first `scanned` bytes must already be known to hold no `0xFF`, so a
/// message arriving in many small reads is scanned once overall.
pub fn decode_next_from(
    buf: &[u8],
    scanned: usize,
) -> Result<Option<(Vec<u8>, usize)>, LegacyFrameError> {
    match buf.first() {
        None => return Ok(None),
        Some(&FRAME_START) => {}
        Some(&FRAME_END) => return Err(LegacyFrameError::Empty),
        Some(&other) => return Err(LegacyFrameError::MissingStart(other)),
    }

    let from = scanned.clamp(1, buf.len());
    match buf[from..].iter().position(|b| *b == FRAME_END) {
        Some(end) => {
            let end = from + end;
            Ok(Some((buf[1..end].to_vec(), end + 1)))
        }
        None => Ok(None),
    }
}

/// Decode every complete message in `buf`
///
/// An unfinished frame after the last `0xFF` is not returned. A tail that
/// does not start with `0x00` is a framing error, not an unfinished frame.
#[allow(dead_code)]
pub fn decode(buf: &[u8]) -> Result<Vec<Vec<u8>>, LegacyFrameError> {
    let mut messages = Vec::new();
    let mut offset = 0;
    while let Some((message, consumed)) = decode_next(&buf[offset..])? {
        messages.push(message);
        offset += consumed;
    }
    Ok(messages)
}

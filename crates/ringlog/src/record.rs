//! Record wire codec.
//!
//! A record travels through the ring buffers as one chunk: a fixed 24-byte
//! little-endian header followed by the UTF-8 message payload. The encoder
//! writes directly into the reserved chunk (at-most-one-copy); the decoder
//! produces a borrowed [`RecordView`] without allocating.
//!
//! Header layout:
//!
//! | offset | field        | type  |
//! |--------|--------------|-------|
//! | 0      | level        | `u8`  |
//! | 1..4   | reserved     |       |
//! | 4      | category     | `u32` |
//! | 8      | thread tag   | `u64` |
//! | 16     | epoch millis | `u64` |
//! | 24     | message      | bytes |

use crate::level::Level;

/// Fixed header bytes preceding the message payload.
pub const RECORD_HEADER_SIZE: usize = 24;

/// A decoded record borrowing its message from the transport chunk.
#[derive(Debug, Clone, Copy)]
pub struct RecordView<'a> {
    pub level: Level,
    pub category: u32,
    pub thread: u64,
    pub timestamp_ms: u64,
    pub message: &'a [u8],
}

impl<'a> RecordView<'a> {
    /// The message as text, replacing any invalid UTF-8.
    pub fn message_text(&self) -> std::borrow::Cow<'a, str> {
        String::from_utf8_lossy(self.message)
    }
}

/// Chunk size needed for a record with `message_len` payload bytes.
#[inline]
pub fn encoded_size(message_len: usize) -> u32 {
    (RECORD_HEADER_SIZE + message_len) as u32
}

/// Encodes a record into `buf`, which must be exactly
/// `encoded_size(message.len())` bytes (the reserved chunk).
pub fn encode_into(
    buf: &mut [u8],
    level: Level,
    category: u32,
    thread: u64,
    timestamp_ms: u64,
    message: &[u8],
) {
    debug_assert_eq!(buf.len(), RECORD_HEADER_SIZE + message.len());
    buf[0] = level as u8;
    buf[1..4].fill(0);
    buf[4..8].copy_from_slice(&category.to_le_bytes());
    buf[8..16].copy_from_slice(&thread.to_le_bytes());
    buf[16..24].copy_from_slice(&timestamp_ms.to_le_bytes());
    buf[RECORD_HEADER_SIZE..].copy_from_slice(message);
}

/// Decodes a transport chunk back into a record view.
///
/// Returns `None` for chunks too short to carry a header or with an
/// unknown level byte; the consumer drops such records rather than
/// guessing at their contents.
pub fn decode(bytes: &[u8]) -> Option<RecordView<'_>> {
    if bytes.len() < RECORD_HEADER_SIZE {
        return None;
    }
    let level = Level::from_u8(bytes[0])?;
    let category = u32::from_le_bytes(bytes[4..8].try_into().ok()?);
    let thread = u64::from_le_bytes(bytes[8..16].try_into().ok()?);
    let timestamp_ms = u64::from_le_bytes(bytes[16..24].try_into().ok()?);
    Some(RecordView {
        level,
        category,
        thread,
        timestamp_ms,
        message: &bytes[RECORD_HEADER_SIZE..],
    })
}

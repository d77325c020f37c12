//! Entry framing (magic + length + crc32c).

use std::io::Read;

use crc32c::crc32c;

use super::{JournalError, JournalResult};

pub(crate) const FRAME_MAGIC: u32 = 0x504A_4C31; // "PJL1"
pub(crate) const FRAME_HEADER_LEN: usize = 12;

/// Frame an encoded entry body: `[magic | len | crc32c | body]`.
pub fn encode_frame(body: &[u8], max_entry_bytes: usize) -> JournalResult<Vec<u8>> {
    if body.len() > max_entry_bytes {
        return Err(JournalError::EntryTooLarge {
            max_bytes: max_entry_bytes,
            got_bytes: body.len(),
        });
    }
    let length = u32::try_from(body.len()).map_err(|_| JournalError::FrameLengthInvalid {
        reason: "frame length exceeds u32".to_string(),
    })?;
    if length == 0 {
        return Err(JournalError::FrameLengthInvalid {
            reason: "frame length cannot be zero".to_string(),
        });
    }
    let crc = crc32c(body);

    let mut buf = Vec::with_capacity(FRAME_HEADER_LEN + body.len());
    buf.extend_from_slice(&FRAME_MAGIC.to_le_bytes());
    buf.extend_from_slice(&length.to_le_bytes());
    buf.extend_from_slice(&crc.to_le_bytes());
    buf.extend_from_slice(body);
    Ok(buf)
}

/// Streaming frame reader for sealed or repaired segments.
///
/// Returns `Ok(None)` at a clean end of stream, including a partial trailing
/// frame (the tail was already repaired at open; anything partial here is a
/// write racing the read and is not yet acknowledged).
pub struct FrameReader<R> {
    reader: R,
    max_entry_bytes: usize,
    offset: u64,
}

impl<R: Read> FrameReader<R> {
    pub fn new(reader: R, max_entry_bytes: usize) -> Self {
        FrameReader {
            reader,
            max_entry_bytes,
            offset: 0,
        }
    }

    /// Byte offset of the next unread frame.
    pub fn offset(&self) -> u64 {
        self.offset
    }

    pub fn read_next(&mut self) -> JournalResult<Option<Vec<u8>>> {
        let mut header = [0u8; FRAME_HEADER_LEN];
        if !read_full(&mut self.reader, &mut header)? {
            return Ok(None);
        }

        let magic = u32::from_le_bytes([header[0], header[1], header[2], header[3]]);
        if magic != FRAME_MAGIC {
            return Err(JournalError::FrameMagicMismatch { got: magic });
        }

        let length = u32::from_le_bytes([header[4], header[5], header[6], header[7]]) as usize;
        if length == 0 {
            return Err(JournalError::FrameLengthInvalid {
                reason: "frame length cannot be zero".to_string(),
            });
        }
        if length > self.max_entry_bytes {
            return Err(JournalError::EntryTooLarge {
                max_bytes: self.max_entry_bytes,
                got_bytes: length,
            });
        }

        let expected_crc = u32::from_le_bytes([header[8], header[9], header[10], header[11]]);
        let mut body = vec![0u8; length];
        if !read_full(&mut self.reader, &mut body)? {
            return Ok(None);
        }

        let actual_crc = crc32c(&body);
        if actual_crc != expected_crc {
            return Err(JournalError::FrameCrcMismatch {
                expected: expected_crc,
                got: actual_crc,
            });
        }

        self.offset += (FRAME_HEADER_LEN + length) as u64;
        Ok(Some(body))
    }
}

/// Fill `buf` completely; `Ok(false)` on end of stream (even mid-buffer).
fn read_full<R: Read>(reader: &mut R, buf: &mut [u8]) -> JournalResult<bool> {
    let mut read = 0usize;
    while read < buf.len() {
        let n = reader
            .read(&mut buf[read..])
            .map_err(|source| JournalError::Io {
                path: std::path::PathBuf::new(),
                source,
            })?;
        if n == 0 {
            return Ok(false);
        }
        read += n;
    }
    Ok(true)
}

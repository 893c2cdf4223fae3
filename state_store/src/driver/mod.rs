//! Journal media.
//!
//! Every medium stores opaque record bodies wrapped in the same frame:
//!
//! ```text
//! [magic:u32 BE][body_len:u32 BE][body_checksum:u32 BE][header_checksum:u32 BE][body]
//! ```
//!
//! Checksums are the first four bytes of a SHA-256 digest. The header
//! checksum covers the three header words before it, so a damaged length is
//! detected instead of trusted. When a header is unreadable the scan resyncs
//! on the next magic word that starts a complete frame and reports the
//! skipped bytes as one corrupt entry. Only damage with no frame after it is
//! a torn tail.

use bytes::{BufMut, Bytes, BytesMut};
use sha2::{Digest, Sha256};

use crate::JournalError;

pub mod file;
pub mod memory;
pub mod rocksdb;

pub const FRAME_MAGIC: u32 = 0x5347_4a4c;
pub const FRAME_HEADER_LEN: usize = 16;

/// One entry read back from a medium, in append order.
#[derive(Debug)]
pub enum JournalEntry {
    Record { position: u64, body: Bytes },
    Corrupt { position: u64, error: JournalError },
    TornTail { position: u64, len: usize },
}

impl JournalEntry {
    pub fn position(&self) -> u64 {
        match self {
            JournalEntry::Record { position, .. } |
            JournalEntry::Corrupt { position, .. } |
            JournalEntry::TornTail { position, .. } => *position,
        }
    }
}

pub trait JournalMedium: Send + Sync {
    fn name(&self) -> &'static str;

    /// Durably appends one record body. Errors here are fatal to the caller.
    fn append(&self, body: &[u8]) -> Result<(), JournalError>;

    /// Reads every entry in append order, including defects.
    fn entries(&self) -> Result<Vec<JournalEntry>, JournalError>;
}

pub fn checksum(bytes: &[u8]) -> u32 {
    let digest = Sha256::digest(bytes);
    u32::from_be_bytes([digest[0], digest[1], digest[2], digest[3]])
}

pub fn encode_frame(body: &[u8]) -> Bytes {
    let mut buf = BytesMut::with_capacity(FRAME_HEADER_LEN + body.len());
    buf.put_u32(FRAME_MAGIC);
    buf.put_u32(body.len() as u32);
    buf.put_u32(checksum(body));
    let header_checksum = checksum(&buf[..12]);
    buf.put_u32(header_checksum);
    buf.put_slice(body);
    buf.freeze()
}

#[derive(Debug, Clone, Copy)]
struct FrameHeader {
    body_len: usize,
    body_checksum: u32,
}

fn parse_header(buf: &[u8]) -> Result<FrameHeader, JournalError> {
    if buf.len() < FRAME_HEADER_LEN {
        return Err(JournalError::Truncated {
            field: "frame header",
            needed: FRAME_HEADER_LEN - buf.len(),
        });
    }
    let magic = read_u32(&buf[0..4]);
    if magic != FRAME_MAGIC {
        return Err(JournalError::BadMagic(magic));
    }
    let expected = read_u32(&buf[12..16]);
    let found = checksum(&buf[..12]);
    if expected != found {
        return Err(JournalError::HeaderChecksumMismatch { expected, found });
    }
    Ok(FrameHeader {
        body_len: read_u32(&buf[4..8]) as usize,
        body_checksum: read_u32(&buf[8..12]),
    })
}

/// Offset of the first complete frame with a sound header at or after `from`.
fn resync(buf: &[u8], from: usize) -> Option<usize> {
    let magic = FRAME_MAGIC.to_be_bytes();
    (from..buf.len().saturating_sub(FRAME_HEADER_LEN - 1)).find(|&offset| {
        buf[offset..offset + 4] == magic &&
            matches!(
                parse_header(&buf[offset..]),
                Ok(header) if buf.len() - offset - FRAME_HEADER_LEN >= header.body_len
            )
    })
}

/// Result of scanning a contiguous run of frames.
#[derive(Debug)]
pub struct FrameScan {
    pub entries: Vec<JournalEntry>,
    /// Length the medium may be cut back to before the next append. Only an
    /// interrupted final write is ever cut; unrecognisable trailing bytes are
    /// kept and skipped by later scans.
    pub valid_len: usize,
}

pub fn scan_frames(buf: &[u8]) -> FrameScan {
    let mut entries = Vec::new();
    let mut valid_len = buf.len();
    let mut offset = 0;
    while offset < buf.len() {
        let remaining = &buf[offset..];
        let error = match parse_header(remaining) {
            Ok(header) if remaining.len() - FRAME_HEADER_LEN >= header.body_len => {
                let frame_len = FRAME_HEADER_LEN + header.body_len;
                entries.push(decode_body(
                    offset as u64,
                    header,
                    &remaining[FRAME_HEADER_LEN..frame_len],
                ));
                offset += frame_len;
                continue;
            }
            Ok(header) => JournalError::LengthMismatch {
                expected: header.body_len,
                found: remaining.len() - FRAME_HEADER_LEN,
            },
            Err(err) => err,
        };

        match resync(buf, offset + 1) {
            Some(next) => {
                entries.push(JournalEntry::Corrupt {
                    position: offset as u64,
                    error,
                });
                offset = next;
            }
            None => {
                // A short header or a sound header whose body ran out is the
                // shape of a write cut off by a crash.
                let interrupted = matches!(
                    error,
                    JournalError::Truncated { .. } | JournalError::LengthMismatch { .. }
                );
                if interrupted {
                    valid_len = offset;
                }
                entries.push(JournalEntry::TornTail {
                    position: offset as u64,
                    len: remaining.len(),
                });
                break;
            }
        }
    }
    FrameScan { entries, valid_len }
}

/// Decodes a buffer holding exactly one frame.
pub fn decode_frame(position: u64, frame: &[u8]) -> JournalEntry {
    let header = match parse_header(frame) {
        Ok(header) => header,
        Err(error) => return JournalEntry::Corrupt { position, error },
    };
    let body = &frame[FRAME_HEADER_LEN..];
    if body.len() != header.body_len {
        return JournalEntry::Corrupt {
            position,
            error: JournalError::LengthMismatch {
                expected: header.body_len,
                found: body.len(),
            },
        };
    }
    decode_body(position, header, body)
}

fn decode_body(position: u64, header: FrameHeader, body: &[u8]) -> JournalEntry {
    let found = checksum(body);
    if header.body_checksum != found {
        return JournalEntry::Corrupt {
            position,
            error: JournalError::ChecksumMismatch {
                expected: header.body_checksum,
                found,
            },
        };
    }
    JournalEntry::Record {
        position,
        body: Bytes::copy_from_slice(body),
    }
}

fn read_u32(bytes: &[u8]) -> u32 {
    u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]])
}

//! Framing for WAL entries and snapshot records.
//!
//! Every record is one frame:
//!
//! ```text
//! [version: u8][length: u32 LE][payload: JSON][crc32(payload): u32 LE]
//! ```
//!
//! Files start with a five byte header: `b"LDGR"` plus the codec version.

use std::io::{Error as IoError, ErrorKind, Read, Result as IoResult, Write};

use crc32fast::Hasher;
use serde::{de::DeserializeOwned, Serialize};

/// Frame and file format version.
pub const CODEC_VERSION: u8 = 1;

/// File magic.
pub const MAGIC: [u8; 4] = *b"LDGR";

/// Header length in bytes.
pub const HEADER_LEN: u64 = 5;

/// Upper bound on a single payload.
const MAX_FRAME_LEN: usize = 100 * 1024 * 1024;

fn invalid(message: String) -> IoError {
    IoError::new(ErrorKind::InvalidData, message)
}

fn checksum(payload: &[u8]) -> u32 {
    let mut hasher = Hasher::new();
    hasher.update(payload);
    hasher.finalize()
}

/// Encode one value as a frame.
pub fn encode<T: Serialize>(value: &T) -> IoResult<Vec<u8>> {
    let payload =
        serde_json::to_vec(value).map_err(|e| invalid(format!("serialization failed: {e}")))?;
    let len = u32::try_from(payload.len())
        .ok()
        .filter(|len| *len as usize <= MAX_FRAME_LEN)
        .ok_or_else(|| invalid(format!("frame of {} bytes is too large", payload.len())))?;

    let mut frame = Vec::with_capacity(payload.len() + 9);
    frame.push(CODEC_VERSION);
    frame.extend_from_slice(&len.to_le_bytes());
    frame.extend_from_slice(&payload);
    frame.extend_from_slice(&checksum(&payload).to_le_bytes());
    Ok(frame)
}

/// Decode one frame.
///
/// A frame cut short surfaces as `ErrorKind::UnexpectedEof`; a bad version,
/// length or checksum as `ErrorKind::InvalidData`.
pub fn decode<T: DeserializeOwned>(reader: &mut impl Read) -> IoResult<T> {
    let mut head = [0u8; 5];
    reader.read_exact(&mut head)?;

    if head[0] != CODEC_VERSION {
        return Err(invalid(format!(
            "unsupported codec version {} (expected {CODEC_VERSION})",
            head[0]
        )));
    }

    let len = u32::from_le_bytes([head[1], head[2], head[3], head[4]]) as usize;
    if len > MAX_FRAME_LEN {
        return Err(invalid(format!(
            "frame size {len} exceeds maximum {MAX_FRAME_LEN}"
        )));
    }

    let mut payload = vec![0u8; len];
    reader.read_exact(&mut payload)?;

    let mut crc = [0u8; 4];
    reader.read_exact(&mut crc)?;
    let stored = u32::from_le_bytes(crc);
    let computed = checksum(&payload);
    if stored != computed {
        return Err(invalid(format!(
            "CRC mismatch: stored={stored:08x} computed={computed:08x}"
        )));
    }

    serde_json::from_slice(&payload).map_err(|e| invalid(format!("deserialization failed: {e}")))
}

/// Write the file header.
pub fn write_header(writer: &mut impl Write) -> IoResult<()> {
    writer.write_all(&MAGIC)?;
    writer.write_all(&[CODEC_VERSION])
}

/// Read and check the file header. Returns the file's codec version.
pub fn read_header(reader: &mut impl Read) -> IoResult<u8> {
    let mut header = [0u8; 5];
    reader.read_exact(&mut header)?;
    if header[..4] != MAGIC {
        return Err(invalid(format!(
            "not a leadgraph file (magic {:?})",
            &header[..4]
        )));
    }
    Ok(header[4])
}

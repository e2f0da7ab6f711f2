//! Wire framing for the delegate pipe: `[u32-le length][serialized message]`.
//!
//! The reader enforces a 2 MiB per-frame ceiling. Anything over the ceiling,
//! or a body that fails to parse, is corruption and requires a child restart.
//! The writer performs no size enforcement beyond what producers respect.

use std::io::{ErrorKind, Read};

use thiserror::Error;

use super::{Message, ProtocolError};

/// Per-frame sanity ceiling on the read side. Fixed for wire compatibility.
pub const MAX_FRAME_LEN: usize = 2 * 1024 * 1024;

#[derive(Error, Debug)]
pub enum FrameError {
    #[error("frame length {len} exceeds ceiling {max}")]
    Oversized { len: usize, max: usize },

    #[error("malformed frame body: {0}")]
    Malformed(#[from] serde_json::Error),

    #[error("truncated frame: {0}")]
    Truncated(std::io::Error),

    #[error(transparent)]
    Io(std::io::Error),
}

/// Encode one message as a length-prefixed frame.
pub fn encode_frame(message: &Message) -> Result<Vec<u8>, ProtocolError> {
    let mut buf = Vec::new();
    encode_frame_into(&mut buf, message)?;
    Ok(buf)
}

/// Append one framed message to `buf`. Batches built this way are written
/// and flushed as a single contiguous unit.
pub fn encode_frame_into(buf: &mut Vec<u8>, message: &Message) -> Result<(), ProtocolError> {
    let body = serde_json::to_vec(message)?;
    buf.reserve(4 + body.len());
    buf.extend_from_slice(&(body.len() as u32).to_le_bytes());
    buf.extend_from_slice(&body);
    Ok(())
}

/// Read one frame from the stream.
///
/// Returns `Ok(None)` on a clean end-of-stream at a frame boundary.
pub fn read_frame<R: Read>(reader: &mut R) -> Result<Option<Message>, FrameError> {
    let mut prefix = [0u8; 4];
    if let Err(e) = reader.read_exact(&mut prefix) {
        return match e.kind() {
            // EOF at a frame boundary: the pipe closed cleanly.
            ErrorKind::UnexpectedEof => Ok(None),
            _ => Err(FrameError::Io(e)),
        };
    }

    let len = u32::from_le_bytes(prefix) as usize;
    if len > MAX_FRAME_LEN {
        return Err(FrameError::Oversized { len, max: MAX_FRAME_LEN });
    }

    let mut body = vec![0u8; len];
    reader
        .read_exact(&mut body)
        .map_err(FrameError::Truncated)?;

    let message = serde_json::from_slice(&body)?;
    Ok(Some(message))
}

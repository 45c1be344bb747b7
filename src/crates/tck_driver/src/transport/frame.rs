//! Length-prefixed JSON frames of the reference transport.

use std::io::{ErrorKind, Read, Write};

use serde::{Deserialize, Serialize};

use crate::error::{DriverError, DriverResult};
use crate::reactive::Payload;

/// Largest frame body accepted in either direction.
pub const MAX_FRAME_LEN: usize = 16 * 1024 * 1024;

/// One protocol message, serialized as JSON tagged by `type`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Frame {
    RequestResponse {
        stream_id: u32,
        payload: Payload,
    },
    RequestStream {
        stream_id: u32,
        initial_n: u64,
        payload: Payload,
    },
    RequestSubscription {
        stream_id: u32,
        initial_n: u64,
        payload: Payload,
    },
    FireAndForget {
        stream_id: u32,
        payload: Payload,
    },
    /// Opens a channel; `payload` is the requester's first item.
    RequestChannel {
        stream_id: u32,
        initial_n: u64,
        payload: Payload,
    },
    RequestN {
        stream_id: u32,
        n: u64,
    },
    Cancel {
        stream_id: u32,
    },
    Next {
        stream_id: u32,
        payload: Payload,
    },
    Complete {
        stream_id: u32,
    },
    Error {
        stream_id: u32,
        message: String,
    },
}

impl Frame {
    /// Stream the frame belongs to.
    pub fn stream_id(&self) -> u32 {
        match self {
            Frame::RequestResponse { stream_id, .. }
            | Frame::RequestStream { stream_id, .. }
            | Frame::RequestSubscription { stream_id, .. }
            | Frame::FireAndForget { stream_id, .. }
            | Frame::RequestChannel { stream_id, .. }
            | Frame::RequestN { stream_id, .. }
            | Frame::Cancel { stream_id }
            | Frame::Next { stream_id, .. }
            | Frame::Complete { stream_id }
            | Frame::Error { stream_id, .. } => *stream_id,
        }
    }
}

/// Write `frame` as a big-endian u32 length followed by its JSON body.
pub fn write_frame<W: Write>(writer: &mut W, frame: &Frame) -> DriverResult<()> {
    let bytes = serde_json::to_vec(frame)?;
    if bytes.len() > MAX_FRAME_LEN {
        return Err(DriverError::FrameTooLarge(bytes.len()));
    }
    let mut framed = Vec::with_capacity(4 + bytes.len());
    framed.extend_from_slice(&(bytes.len() as u32).to_be_bytes());
    framed.extend_from_slice(&bytes);
    writer.write_all(&framed)?;
    writer.flush()?;
    Ok(())
}

/// Read the next frame. Returns `None` when the stream ends cleanly between frames.
pub fn read_frame<R: Read>(reader: &mut R) -> DriverResult<Option<Frame>> {
    let mut len_buf = [0u8; 4];
    match reader.read_exact(&mut len_buf) {
        Ok(()) => {}
        Err(err) if err.kind() == ErrorKind::UnexpectedEof => return Ok(None),
        Err(err) => return Err(err.into()),
    }
    let len = u32::from_be_bytes(len_buf) as usize;
    if len > MAX_FRAME_LEN {
        return Err(DriverError::FrameTooLarge(len));
    }
    let mut buf = vec![0u8; len];
    reader.read_exact(&mut buf)?;
    Ok(Some(serde_json::from_slice(&buf)?))
}

use std::io::{ErrorKind, Read, Write};

use serde::{Deserialize, Serialize, de::DeserializeOwned};

use crate::constants::{FRAME_HEADER_BYTES, MAX_FRAME_SIZE_BYTES};
use crate::error::{BridgeError, Result};

/// Unit of transfer on a channel pipe.
///
/// `Stop` is a dedicated variant, so no `Message` payload can ever be
/// mistaken for end of stream.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "frame", content = "body", rename_all = "snake_case")]
pub(crate) enum Frame<T> {
    Message(T),
    Stop,
}

/// Serialize a frame into one length-prefixed buffer
pub(crate) fn encode<T: Serialize>(frame: &Frame<T>) -> Result<Vec<u8>> {
    let body = serde_json::to_vec(frame)?;
    if body.len() > MAX_FRAME_SIZE_BYTES {
        return Err(BridgeError::FrameTooLarge(body.len(), MAX_FRAME_SIZE_BYTES));
    }

    let mut buf = Vec::with_capacity(FRAME_HEADER_BYTES + body.len());
    buf.extend_from_slice(&(body.len() as u32).to_be_bytes());
    buf.extend_from_slice(&body);
    Ok(buf)
}

/// Write a whole frame with a single `write_all`
pub(crate) fn write_frame<W: Write, T: Serialize>(mut writer: W, frame: &Frame<T>) -> Result<()> {
    let buf = encode(frame)?;
    writer.write_all(&buf)?;
    writer.flush()?;
    Ok(())
}

/// Read exactly one frame. `None` on EOF at a frame boundary.
///
/// Never reads past the end of the frame, so a poller watching the same
/// descriptor still sees any frame that follows.
pub(crate) fn read_frame<R: Read, T: DeserializeOwned>(mut reader: R) -> Result<Option<Frame<T>>> {
    let mut header = [0u8; FRAME_HEADER_BYTES];
    let mut filled = 0;
    while filled < header.len() {
        match reader.read(&mut header[filled..]) {
            Ok(0) if filled == 0 => return Ok(None),
            Ok(0) => {
                return Err(std::io::Error::new(
                    ErrorKind::UnexpectedEof,
                    "channel closed inside a frame header",
                )
                .into());
            }
            Ok(n) => filled += n,
            Err(e) if e.kind() == ErrorKind::Interrupted => continue,
            Err(e) => return Err(e.into()),
        }
    }

    let len = u32::from_be_bytes(header) as usize;
    if len > MAX_FRAME_SIZE_BYTES {
        return Err(BridgeError::FrameTooLarge(len, MAX_FRAME_SIZE_BYTES));
    }

    let mut body = vec![0u8; len];
    reader.read_exact(&mut body)?;
    Ok(Some(serde_json::from_slice(&body)?))
}

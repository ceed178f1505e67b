//! Length-prefixed frame codec.
//!
//! Each frame is a 4-byte big-endian length followed by the bincode encoding of a
//! [`Frame`]. Frames larger than [`MAX_FRAME_SIZE`] are rejected in both directions.

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::{Result, TransportError};
use crate::protocol::{Frame, MAX_FRAME_SIZE};

/// Encodes a frame including its length prefix.
pub fn encode(frame: &Frame) -> Result<Vec<u8>> {
    let body = bincode::serialize(frame).map_err(|e| TransportError::Codec(e.to_string()))?;
    if body.len() > MAX_FRAME_SIZE {
        return Err(TransportError::FrameTooLarge {
            size: body.len(),
            max: MAX_FRAME_SIZE,
        });
    }
    let mut buf = Vec::with_capacity(4 + body.len());
    buf.extend_from_slice(&(body.len() as u32).to_be_bytes());
    buf.extend_from_slice(&body);
    Ok(buf)
}

/// Encoded size of a frame body, without the length prefix.
pub fn encoded_len(frame: &Frame) -> Result<usize> {
    bincode::serialized_size(frame)
        .map(|size| size as usize)
        .map_err(|e| TransportError::Codec(e.to_string()))
}

/// Fails with [`TransportError::RequestTooLarge`] if any of `frames` would not fit on
/// the wire.
pub fn check_fits(frames: &[Frame]) -> Result<()> {
    for frame in frames {
        let size = encoded_len(frame)?;
        if size > MAX_FRAME_SIZE {
            return Err(TransportError::RequestTooLarge {
                size,
                max: MAX_FRAME_SIZE,
            });
        }
    }
    Ok(())
}

/// Decodes a frame body (without its length prefix).
pub fn decode(body: &[u8]) -> Result<Frame> {
    bincode::deserialize(body).map_err(|e| TransportError::Codec(e.to_string()))
}

/// Writes one frame and flushes the writer.
pub async fn write_frame<W>(writer: &mut W, frame: &Frame) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    let buf = encode(frame)?;
    writer.write_all(&buf).await?;
    writer.flush().await?;
    Ok(())
}

/// Reads one frame.
pub async fn read_frame<R>(reader: &mut R) -> Result<Frame>
where
    R: AsyncRead + Unpin,
{
    let mut len_buf = [0u8; 4];
    reader.read_exact(&mut len_buf).await?;
    let len = u32::from_be_bytes(len_buf) as usize;
    if len > MAX_FRAME_SIZE {
        return Err(TransportError::FrameTooLarge {
            size: len,
            max: MAX_FRAME_SIZE,
        });
    }
    let mut body = vec![0u8; len];
    reader.read_exact(&mut body).await?;
    decode(&body)
}

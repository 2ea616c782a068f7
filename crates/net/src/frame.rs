//! Length-prefixed frame encoding/decoding
//!
//! Wire format: [4-byte big-endian length][JSON payload]
//! Maximum frame size: 1MB (sanity limit)

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::{Error, Result};
use crate::protocol::RelayMessage;

/// Maximum allowed frame size (1MB)
pub(crate) const MAX_FRAME_SIZE: u32 = 1024 * 1024;

fn map_eof(e: std::io::Error) -> Error {
    if e.kind() == std::io::ErrorKind::UnexpectedEof {
        Error::ConnectionClosed
    } else {
        Error::Io(e)
    }
}

/// Read a length-prefixed frame from a stream
pub async fn read_frame<R: AsyncRead + Unpin>(reader: &mut R) -> Result<RelayMessage> {
    let mut len_buf = [0u8; 4];
    reader.read_exact(&mut len_buf).await.map_err(map_eof)?;

    let len = u32::from_be_bytes(len_buf);
    if len == 0 {
        return Err(Error::Protocol("Empty frame".into()));
    }
    if len > MAX_FRAME_SIZE {
        return Err(Error::Protocol(format!(
            "Frame too large: {} bytes (max {})",
            len, MAX_FRAME_SIZE
        )));
    }

    let mut payload = vec![0u8; len as usize];
    reader.read_exact(&mut payload).await.map_err(map_eof)?;

    RelayMessage::from_bytes(&payload)
        .map_err(|e| Error::Protocol(format!("Invalid JSON: {}", e)))
}

/// Write a length-prefixed frame to a stream
pub async fn write_frame<W: AsyncWrite + Unpin>(writer: &mut W, msg: &RelayMessage) -> Result<()> {
    let payload = msg
        .to_bytes()
        .map_err(|e| Error::Protocol(format!("Serialization failed: {}", e)))?;

    let len = u32::try_from(payload.len())
        .ok()
        .filter(|len| *len <= MAX_FRAME_SIZE)
        .ok_or_else(|| {
            Error::Protocol(format!(
                "Message too large: {} bytes (max {})",
                payload.len(),
                MAX_FRAME_SIZE
            ))
        })?;

    writer.write_all(&len.to_be_bytes()).await?;
    writer.write_all(&payload).await?;
    writer.flush().await?;

    Ok(())
}

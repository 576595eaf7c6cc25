//! Length-prefixed frame I/O: `u32 length` (network byte order) followed
//! by `length` bytes of payload. The top bit of the length word marks
//! end-of-file in a file-streaming sequence; every other frame clears it.

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::{ProtocolError, Result};

/// Maximum payload size, shared with the guest side of the channel.
/// Chosen generously above the 64 KiB file-chunk size so a single
/// bincode-encoded RPC envelope never needs splitting.
pub const MAX_FRAME_PAYLOAD: usize = 32 * 1024 * 1024;

/// File-chunk frames are capped much lower than [`MAX_FRAME_PAYLOAD`]
/// so a slow peer can't stall behind one giant write.
pub const MAX_FILE_CHUNK: usize = 64 * 1024;

const EOF_BIT: u32 = 0x8000_0000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameKind {
    Data,
    Eof,
}

/// Reads one frame: a length prefix and its payload. Returns `Ok(None)`
/// on a clean peer close at a frame boundary.
pub async fn read_frame<R: AsyncRead + Unpin>(
    reader: &mut R,
) -> Result<Option<(FrameKind, Vec<u8>)>> {
    let mut len_buf = [0u8; 4];
    match read_exact_or_eof(reader, &mut len_buf).await? {
        false => return Ok(None),
        true => {}
    }
    let raw = u32::from_be_bytes(len_buf);
    let kind = if raw & EOF_BIT != 0 {
        FrameKind::Eof
    } else {
        FrameKind::Data
    };
    let len = (raw & !EOF_BIT) as usize;
    if len > MAX_FRAME_PAYLOAD {
        return Err(ProtocolError::FrameTooLarge(len));
    }
    let mut payload = vec![0u8; len];
    reader
        .read_exact(&mut payload)
        .await
        .map_err(ProtocolError::Io)?;
    Ok(Some((kind, payload)))
}

/// Writes one frame. `kind` is only ever `Eof` for the final chunk of a
/// file-streaming sequence.
pub async fn write_frame<W: AsyncWrite + Unpin>(
    writer: &mut W,
    kind: FrameKind,
    payload: &[u8],
) -> Result<()> {
    if payload.len() > MAX_FRAME_PAYLOAD {
        return Err(ProtocolError::FrameTooLarge(payload.len()));
    }
    let mut len = payload.len() as u32;
    if kind == FrameKind::Eof {
        len |= EOF_BIT;
    }
    writer.write_all(&len.to_be_bytes()).await?;
    writer.write_all(payload).await?;
    writer.flush().await?;
    Ok(())
}

/// Like `AsyncReadExt::read_exact`, but distinguishes "peer closed
/// before any byte of this frame arrived" (returns `Ok(false)`) from a
/// genuine short-read error.
async fn read_exact_or_eof<R: AsyncRead + Unpin>(reader: &mut R, buf: &mut [u8]) -> Result<bool> {
    let mut filled = 0;
    while filled < buf.len() {
        let n = reader.read(&mut buf[filled..]).await?;
        if n == 0 {
            if filled == 0 {
                return Ok(false);
            }
            return Err(ProtocolError::Io(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                "peer closed mid-frame",
            )));
        }
        filled += n;
    }
    Ok(true)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn roundtrip_data_frame() {
        let mut buf = Vec::new();
        write_frame(&mut buf, FrameKind::Data, b"hello").await.unwrap();
        let mut cursor = std::io::Cursor::new(buf);
        let (kind, payload) = read_frame(&mut cursor).await.unwrap().unwrap();
        assert_eq!(kind, FrameKind::Data);
        assert_eq!(payload, b"hello");
    }

    #[tokio::test]
    async fn roundtrip_eof_frame() {
        let mut buf = Vec::new();
        write_frame(&mut buf, FrameKind::Eof, b"tail").await.unwrap();
        let mut cursor = std::io::Cursor::new(buf);
        let (kind, payload) = read_frame(&mut cursor).await.unwrap().unwrap();
        assert_eq!(kind, FrameKind::Eof);
        assert_eq!(payload, b"tail");
    }

    #[tokio::test]
    async fn clean_close_at_boundary_is_none() {
        let mut cursor = std::io::Cursor::new(Vec::<u8>::new());
        assert!(read_frame(&mut cursor).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn oversized_frame_rejected() {
        let mut buf = Vec::new();
        let len = (MAX_FRAME_PAYLOAD as u32 + 1).to_be_bytes();
        buf.extend_from_slice(&len);
        let mut cursor = std::io::Cursor::new(buf);
        assert!(read_frame(&mut cursor).await.is_err());
    }
}

//! Frame I/O over async streams.

use bytes::{Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use fanout_core::wire::{EncodedFrame, FrameHeader, FrameKind, WireError, HEADER_LEN};

/// A frame as read off the wire, sections still undecoded.
#[derive(Debug, Clone)]
pub struct RawFrame {
    pub kind: FrameKind,
    pub meta: Vec<u8>,
    pub payload: Bytes,
}

#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Wire(#[from] WireError),
}

/// Payload buffer growth per read, so memory follows bytes actually received.
const PAYLOAD_STEP: usize = 64 * 1024;

/// Read one frame.
///
/// Returns `Ok(None)` when the peer closed the stream cleanly between
/// frames. A close in the middle of a frame is an I/O error.
pub async fn read_frame<R>(reader: &mut R) -> Result<Option<RawFrame>, FrameError>
where
    R: AsyncRead + Unpin,
{
    let mut header_buf = [0u8; HEADER_LEN];
    let first = reader.read(&mut header_buf).await?;
    if first == 0 {
        return Ok(None);
    }
    reader.read_exact(&mut header_buf[first..]).await?;

    let header = FrameHeader::parse(&header_buf)?;
    let kind = header.frame_kind()?;

    let mut meta = vec![0u8; header.meta_len()];
    reader.read_exact(&mut meta).await?;

    // Bounded by MAX_PAYLOAD_LEN in FrameHeader::parse.
    let payload_len = header.payload_len();
    let mut payload = BytesMut::new();
    let mut body = reader.take(payload_len);
    while (payload.len() as u64) < payload_len {
        let remaining = (payload_len - payload.len() as u64) as usize;
        payload.reserve(remaining.min(PAYLOAD_STEP));
        if body.read_buf(&mut payload).await? == 0 {
            return Err(std::io::Error::from(std::io::ErrorKind::UnexpectedEof).into());
        }
    }

    Ok(Some(RawFrame {
        kind,
        meta,
        payload: payload.freeze(),
    }))
}

/// Write one frame and flush.
pub async fn write_frame<W>(writer: &mut W, frame: &EncodedFrame) -> Result<(), FrameError>
where
    W: AsyncWrite + Unpin,
{
    use zerocopy::AsBytes;

    writer.write_all(frame.header.as_bytes()).await?;
    writer.write_all(&frame.meta).await?;
    if !frame.payload.is_empty() {
        writer.write_all(&frame.payload).await?;
    }
    writer.flush().await?;
    Ok(())
}

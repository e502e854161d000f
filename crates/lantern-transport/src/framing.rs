//! Length-prefixed message framing.
//!
//! Every control message on a stream is sent as a 4-byte big-endian length
//! followed by a bincode body. Frames are read with exact-length reads and no
//! intermediate buffering, so raw bytes that follow a response (a relayed
//! circuit, for instance) stay in the stream for the next reader.

use crate::{TransportError, TransportResult};
use serde::Serialize;
use serde::de::DeserializeOwned;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Maximum accepted frame body (64 KiB)
pub const MAX_FRAME_SIZE: usize = 64 * 1024;

/// Length prefix size in bytes
pub const LENGTH_PREFIX_SIZE: usize = 4;

/// Write one frame and flush
///
/// # Errors
///
/// Returns [`TransportError::FrameTooLarge`] if `body` exceeds
/// [`MAX_FRAME_SIZE`], or [`TransportError::Io`] if the write fails.
pub async fn write_frame<W>(writer: &mut W, body: &[u8]) -> TransportResult<()>
where
    W: AsyncWrite + Unpin + ?Sized,
{
    if body.len() > MAX_FRAME_SIZE {
        return Err(TransportError::FrameTooLarge {
            len: body.len(),
            max: MAX_FRAME_SIZE,
        });
    }

    let len = u32::try_from(body.len()).map_err(|_| TransportError::FrameTooLarge {
        len: body.len(),
        max: MAX_FRAME_SIZE,
    })?;

    writer.write_all(&len.to_be_bytes()).await?;
    writer.write_all(body).await?;
    writer.flush().await?;
    Ok(())
}

/// Read one frame of at most `max` bytes
///
/// # Errors
///
/// Returns [`TransportError::FrameTooLarge`] if the announced length exceeds
/// `max`, or [`TransportError::Io`] on a short read (including EOF before the
/// first byte of the prefix).
pub async fn read_frame<R>(reader: &mut R, max: usize) -> TransportResult<Vec<u8>>
where
    R: AsyncRead + Unpin + ?Sized,
{
    let mut prefix = [0u8; LENGTH_PREFIX_SIZE];
    reader.read_exact(&mut prefix).await?;
    let len = u32::from_be_bytes(prefix) as usize;

    if len > max {
        return Err(TransportError::FrameTooLarge { len, max });
    }

    let mut body = vec![0u8; len];
    reader.read_exact(&mut body).await?;
    Ok(body)
}

/// Encode `message` with bincode and write it as a frame
///
/// # Errors
///
/// Returns [`TransportError::Codec`] if encoding fails, otherwise the errors
/// of [`write_frame`].
pub async fn write_message<W, T>(writer: &mut W, message: &T) -> TransportResult<()>
where
    W: AsyncWrite + Unpin + ?Sized,
    T: Serialize + ?Sized,
{
    let body = bincode::serialize(message).map_err(|e| TransportError::Codec(e.to_string()))?;
    write_frame(writer, &body).await
}

/// Read a frame and decode it with bincode
///
/// # Errors
///
/// Returns [`TransportError::Codec`] if the body does not decode as `T`,
/// otherwise the errors of [`read_frame`].
pub async fn read_message<R, T>(reader: &mut R) -> TransportResult<T>
where
    R: AsyncRead + Unpin + ?Sized,
    T: DeserializeOwned,
{
    let body = read_frame(reader, MAX_FRAME_SIZE).await?;
    bincode::deserialize(&body).map_err(|e| TransportError::Codec(e.to_string()))
}

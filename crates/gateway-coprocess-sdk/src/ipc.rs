//! IPC framing between the gateway and the coprocess dispatcher.
//!
//! Every message is a frame:
//!
//! ```text
//! +---------+-------------+--------------+-----------------+
//! | kind u8 | id u64 (BE) | len u32 (BE) | payload (len)   |
//! +---------+-------------+--------------+-----------------+
//! ```
//!
//! The dispatcher answers each request frame with a frame carrying the same
//! `id`, so several requests may be in flight at once.

use bytes::Bytes;
use std::io::{self, Read, Write};

use crate::error::HandlerError;

/// Upper bound on a single frame payload (64 MiB)
pub const MAX_FRAME_LEN: usize = 64 * 1024 * 1024;

const HEADER_LEN: usize = 1 + 8 + 4;

/// Frame kinds
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum FrameKind {
    /// Serialized object for a request hook
    DispatchHook = 1,
    /// Serialized event
    DispatchEvent = 2,
    /// UTF-8 bundle path
    LoadBundle = 3,
    Reload = 4,
    Shutdown = 5,
    /// API id, a NUL byte, then a zipped bundle; answered with the
    /// installed bundle path
    InstallBundle = 6,
    /// Error text answering a failed request
    Failure = 0x80,
}

impl TryFrom<u8> for FrameKind {
    type Error = HandlerError;

    fn try_from(value: u8) -> Result<Self, HandlerError> {
        match value {
            1 => Ok(FrameKind::DispatchHook),
            2 => Ok(FrameKind::DispatchEvent),
            3 => Ok(FrameKind::LoadBundle),
            4 => Ok(FrameKind::Reload),
            5 => Ok(FrameKind::Shutdown),
            6 => Ok(FrameKind::InstallBundle),
            0x80 => Ok(FrameKind::Failure),
            other => Err(HandlerError::Ipc(format!("Unknown frame kind: {:#04x}", other))),
        }
    }
}

/// A single protocol frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub kind: FrameKind,
    pub id: u64,
    pub payload: Bytes,
}

impl Frame {
    pub fn new(kind: FrameKind, id: u64, payload: impl Into<Bytes>) -> Self {
        Self {
            kind,
            id,
            payload: payload.into(),
        }
    }

    /// A frame with no payload (acknowledgements, reload, shutdown)
    pub fn empty(kind: FrameKind, id: u64) -> Self {
        Self::new(kind, id, Bytes::new())
    }

    fn header(&self) -> Result<[u8; HEADER_LEN], HandlerError> {
        if self.payload.len() > MAX_FRAME_LEN {
            return Err(HandlerError::Ipc(format!(
                "Frame payload too large: {} bytes",
                self.payload.len()
            )));
        }
        let mut header = [0u8; HEADER_LEN];
        header[0] = self.kind as u8;
        header[1..9].copy_from_slice(&self.id.to_be_bytes());
        header[9..].copy_from_slice(&(self.payload.len() as u32).to_be_bytes());
        Ok(header)
    }
}

fn parse_header(header: &[u8; HEADER_LEN]) -> Result<(FrameKind, u64, usize), HandlerError> {
    let kind = FrameKind::try_from(header[0])?;
    let mut id = [0u8; 8];
    id.copy_from_slice(&header[1..9]);
    let mut len = [0u8; 4];
    len.copy_from_slice(&header[9..]);
    let len = u32::from_be_bytes(len) as usize;
    if len > MAX_FRAME_LEN {
        return Err(HandlerError::Ipc(format!("Frame payload too large: {} bytes", len)));
    }
    Ok((kind, u64::from_be_bytes(id), len))
}

/// Read one frame. Returns `None` on a clean end of stream.
pub fn read_frame<R: Read>(reader: &mut R) -> Result<Option<Frame>, HandlerError> {
    let mut header = [0u8; HEADER_LEN];
    match reader.read(&mut header[..1]) {
        Ok(0) => return Ok(None),
        Ok(_) => {}
        Err(e) if e.kind() == io::ErrorKind::Interrupted => return read_frame(reader),
        Err(e) => return Err(e.into()),
    }
    reader
        .read_exact(&mut header[1..])
        .map_err(|e| HandlerError::Ipc(format!("Failed to read frame header: {}", e)))?;

    let (kind, id, len) = parse_header(&header)?;
    let mut payload = vec![0u8; len];
    reader
        .read_exact(&mut payload)
        .map_err(|e| HandlerError::Ipc(format!("Failed to read payload: {}", e)))?;

    Ok(Some(Frame::new(kind, id, payload)))
}

/// Write one frame and flush
pub fn write_frame<W: Write>(writer: &mut W, frame: &Frame) -> Result<(), HandlerError> {
    let header = frame.header()?;
    writer
        .write_all(&header)
        .map_err(|e| HandlerError::Ipc(format!("Failed to write header: {}", e)))?;
    writer
        .write_all(&frame.payload)
        .map_err(|e| HandlerError::Ipc(format!("Failed to write payload: {}", e)))?;
    writer
        .flush()
        .map_err(|e| HandlerError::Ipc(format!("Failed to flush: {}", e)))?;
    Ok(())
}

/// Async counterparts used by the dispatcher host
#[cfg(feature = "async")]
pub mod tokio_io {
    use super::*;
    use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

    /// Read one frame. Returns `None` on a clean end of stream.
    pub async fn read_frame<R: AsyncRead + Unpin>(reader: &mut R) -> Result<Option<Frame>, HandlerError> {
        let mut header = [0u8; HEADER_LEN];
        if reader.read(&mut header[..1]).await? == 0 {
            return Ok(None);
        }
        reader
            .read_exact(&mut header[1..])
            .await
            .map_err(|e| HandlerError::Ipc(format!("Failed to read frame header: {}", e)))?;

        let (kind, id, len) = parse_header(&header)?;
        let mut payload = vec![0u8; len];
        reader
            .read_exact(&mut payload)
            .await
            .map_err(|e| HandlerError::Ipc(format!("Failed to read payload: {}", e)))?;

        Ok(Some(Frame::new(kind, id, payload)))
    }

    /// Write one frame and flush
    pub async fn write_frame<W: AsyncWrite + Unpin>(writer: &mut W, frame: &Frame) -> Result<(), HandlerError> {
        let header = frame.header()?;
        writer.write_all(&header).await?;
        writer.write_all(&frame.payload).await?;
        writer.flush().await?;
        Ok(())
    }
}

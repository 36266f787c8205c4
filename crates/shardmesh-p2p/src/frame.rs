//! Stream framing for byte-stream transports.
//!
//! Each frame is:
//! - 4 bytes: magic
//! - 1 byte: frame kind
//! - 4 bytes: payload length (big-endian)
//! - N bytes: payload

use crate::{ProtocolError, MAX_MESSAGE_SIZE};
use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Frame magic bytes.
pub const MAGIC: [u8; 4] = *b"SHM1";

/// Header length in bytes.
pub const HEADER_LEN: usize = 9;

/// The kind of frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum FrameKind {
    /// Stream opening: sender identity and protocol name.
    Hello = 0,
    /// Protocol data.
    Data = 1,
}

impl FrameKind {
    fn from_u8(b: u8) -> Result<Self, ProtocolError> {
        match b {
            0 => Ok(Self::Hello),
            1 => Ok(Self::Data),
            _ => Err(ProtocolError::Malformed(format!("unknown frame kind: {b}"))),
        }
    }
}

/// A single frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub kind: FrameKind,
    pub payload: Bytes,
}

impl Frame {
    /// Creates a data frame.
    #[must_use]
    pub fn data(payload: impl Into<Bytes>) -> Self {
        Self {
            kind: FrameKind::Data,
            payload: payload.into(),
        }
    }

    /// Encodes the frame.
    #[must_use]
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(HEADER_LEN + self.payload.len());
        buf.put_slice(&MAGIC);
        buf.put_u8(self.kind as u8);
        buf.put_u32(self.payload.len() as u32);
        buf.put_slice(&self.payload);
        buf.freeze()
    }

    /// Decodes a complete frame from a buffer.
    pub fn decode(mut data: Bytes) -> Result<Self, ProtocolError> {
        let (kind, len) = parse_header(&data)?;
        data.advance(HEADER_LEN);
        if data.len() < len {
            return Err(ProtocolError::Malformed("incomplete payload".into()));
        }
        Ok(Self {
            kind,
            payload: data.slice(..len),
        })
    }

    /// Reads one frame from an async reader.
    pub async fn read_from<R: AsyncRead + Unpin>(reader: &mut R) -> std::io::Result<Self> {
        let mut header = [0u8; HEADER_LEN];
        reader.read_exact(&mut header).await?;
        let (kind, len) = parse_header(&header).map_err(invalid_data)?;

        let mut payload = vec![0u8; len];
        reader.read_exact(&mut payload).await?;
        Ok(Self {
            kind,
            payload: Bytes::from(payload),
        })
    }

    /// Writes this frame to an async writer.
    pub async fn write_to<W: AsyncWrite + Unpin>(&self, writer: &mut W) -> std::io::Result<()> {
        if self.payload.len() > MAX_MESSAGE_SIZE {
            return Err(invalid_data(ProtocolError::TooLarge {
                size: self.payload.len(),
                max: MAX_MESSAGE_SIZE,
            }));
        }
        writer.write_all(&self.encode()).await?;
        writer.flush().await
    }
}

fn parse_header(data: &[u8]) -> Result<(FrameKind, usize), ProtocolError> {
    if data.len() < HEADER_LEN {
        return Err(ProtocolError::Malformed("frame too short".into()));
    }
    if data[..4] != MAGIC {
        return Err(ProtocolError::Malformed("invalid magic".into()));
    }
    let kind = FrameKind::from_u8(data[4])?;
    let len = u32::from_be_bytes([data[5], data[6], data[7], data[8]]) as usize;
    if len > MAX_MESSAGE_SIZE {
        return Err(ProtocolError::TooLarge {
            size: len,
            max: MAX_MESSAGE_SIZE,
        });
    }
    Ok((kind, len))
}

fn invalid_data(e: ProtocolError) -> std::io::Error {
    std::io::Error::new(std::io::ErrorKind::InvalidData, e)
}

//! Wire format for binary imaging frames
//!
//! Each frame is a fixed 80-byte little-endian header followed by the
//! payload. The header's `length` field covers header plus payload, so
//! a header-only frame has `length == 80`.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::{Error, Result};
use crate::frame::{BinaryFrame, FrameKind};
use crate::protocol::{FRAME_HEADER_SIZE, FRAME_MAGIC, MAX_FRAME_SIZE};

/// Parsed binary frame header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    pub length: u32,
    pub id: u64,
    pub kind: u32,
    pub timestamp_us: u64,
    pub width: u32,
    pub height: u32,
}

impl FrameHeader {
    /// Payload length implied by `length` (which covers the header too).
    pub fn payload_len(&self) -> usize {
        (self.length as usize).saturating_sub(FRAME_HEADER_SIZE)
    }
}

/// Serialize a header to its 80-byte wire form.
pub fn encode_header(header: &FrameHeader) -> Bytes {
    let mut buf = BytesMut::with_capacity(FRAME_HEADER_SIZE);
    buf.put_u32_le(FRAME_MAGIC);
    buf.put_u32_le(0); // reserved
    buf.put_u32_le(header.length);
    buf.put_u64_le(header.id);
    buf.put_u32_le(header.kind);
    buf.put_u64_le(header.timestamp_us);
    buf.put_u32_le(header.width);
    buf.put_u32_le(header.height);
    // filler to 80 bytes
    buf.resize(FRAME_HEADER_SIZE, 0);
    buf.freeze()
}

/// Parse an 80-byte header, validating magic and length bounds.
///
/// Rejects oversized frames before any payload allocation happens.
pub fn decode_header(buf: &[u8]) -> Result<FrameHeader> {
    if buf.len() < FRAME_HEADER_SIZE {
        return Err(Error::Protocol(format!(
            "header too short: {} < {}",
            buf.len(),
            FRAME_HEADER_SIZE
        )));
    }
    let mut cursor = buf;
    let magic = cursor.get_u32_le();
    if magic != FRAME_MAGIC {
        return Err(Error::Protocol(format!("bad frame magic {magic:#010x}")));
    }
    let _reserved = cursor.get_u32_le();
    let length = cursor.get_u32_le();
    let id = cursor.get_u64_le();
    let kind = cursor.get_u32_le();
    let timestamp_us = cursor.get_u64_le();
    let width = cursor.get_u32_le();
    let height = cursor.get_u32_le();

    if (length as usize) < FRAME_HEADER_SIZE {
        return Err(Error::Protocol(format!(
            "frame length {length} smaller than header"
        )));
    }
    if length as usize > MAX_FRAME_SIZE {
        return Err(Error::Protocol(format!(
            "frame length {length} exceeds maximum {MAX_FRAME_SIZE}"
        )));
    }

    Ok(FrameHeader {
        length,
        id,
        kind,
        timestamp_us,
        width,
        height,
    })
}

/// Assemble a `BinaryFrame` from a validated header and its payload.
pub fn frame_from_parts(header: FrameHeader, payload: Bytes) -> BinaryFrame {
    BinaryFrame {
        id: header.id,
        kind: FrameKind::from(header.kind),
        timestamp_us: header.timestamp_us,
        width: (header.width > 0).then_some(header.width),
        height: (header.height > 0).then_some(header.height),
        payload,
    }
}

/// Read one frame from an async reader.
///
/// Returns `Ok(None)` on clean EOF at a frame boundary. EOF inside a
/// header or payload is a protocol error (the partial frame is lost).
pub async fn read_frame<R: AsyncRead + Unpin>(reader: &mut R) -> Result<Option<BinaryFrame>> {
    let mut header_buf = [0u8; FRAME_HEADER_SIZE];

    // Distinguish clean EOF (no bytes at all) from a truncated header.
    let mut filled = 0;
    while filled < FRAME_HEADER_SIZE {
        let n = reader.read(&mut header_buf[filled..]).await?;
        if n == 0 {
            if filled == 0 {
                return Ok(None);
            }
            return Err(Error::Protocol(format!(
                "connection closed mid-header ({filled} of {FRAME_HEADER_SIZE} bytes)"
            )));
        }
        filled += n;
    }

    let header = decode_header(&header_buf)?;
    let payload_len = header.payload_len();

    let payload = if payload_len == 0 {
        Bytes::new()
    } else {
        let mut buf = vec![0u8; payload_len];
        reader.read_exact(&mut buf).await.map_err(|e| {
            if e.kind() == std::io::ErrorKind::UnexpectedEof {
                Error::Protocol("connection closed mid-payload".to_string())
            } else {
                Error::Io(e)
            }
        })?;
        Bytes::from(buf)
    };

    Ok(Some(frame_from_parts(header, payload)))
}

/// Write one frame to an async writer (header + payload).
pub async fn write_frame<W: AsyncWrite + Unpin>(writer: &mut W, frame: &BinaryFrame) -> Result<()> {
    let total = FRAME_HEADER_SIZE + frame.payload.len();
    if total > MAX_FRAME_SIZE {
        return Err(Error::Protocol(format!(
            "frame too large: {total} > {MAX_FRAME_SIZE}"
        )));
    }
    let header = FrameHeader {
        length: total as u32,
        id: frame.id,
        kind: frame.kind.as_u32(),
        timestamp_us: frame.timestamp_us,
        width: frame.width.unwrap_or(0),
        height: frame.height.unwrap_or(0),
    };
    writer.write_all(&encode_header(&header)).await?;
    writer.write_all(&frame.payload).await?;
    writer.flush().await?;
    Ok(())
}

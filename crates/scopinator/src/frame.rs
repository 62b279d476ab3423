//! Frame types for the binary imaging channel

use bytes::Bytes;
use serde::{Deserialize, Serialize};

/// Kind of payload carried by a binary frame.
///
/// The `Unknown` variant provides forward compatibility: frames with
/// unrecognized kind values are accepted and handed to subscribers
/// without error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FrameKind {
    /// Live preview exposure (continuous mode)
    Preview,
    /// Live-stacked image
    Stacked,
    /// Raw sub-exposure
    Raw,
    /// Reduced-size thumbnail
    Thumbnail,
    /// Forward-compatible: accept unknown kind values
    Unknown(u32),
}

impl FrameKind {
    /// Convert to the wire-format value.
    pub fn as_u32(&self) -> u32 {
        match self {
            FrameKind::Preview => 0,
            FrameKind::Stacked => 1,
            FrameKind::Raw => 2,
            FrameKind::Thumbnail => 3,
            FrameKind::Unknown(v) => *v,
        }
    }
}

impl From<u32> for FrameKind {
    fn from(value: u32) -> Self {
        match value {
            0 => FrameKind::Preview,
            1 => FrameKind::Stacked,
            2 => FrameKind::Raw,
            3 => FrameKind::Thumbnail,
            v => FrameKind::Unknown(v),
        }
    }
}

/// A single unit on the binary imaging channel: parsed header plus an
/// opaque payload.
///
/// Wire format (80-byte little-endian header, payload follows):
/// ```text
/// ┌───────┬──────────┬────────┬──────┬──────┬───────────┬───────┬────────┬────────┐
/// │ magic │ reserved │ length │  id  │ kind │ timestamp │ width │ height │ filler │
/// │  u32  │   u32    │  u32   │ u64  │ u32  │    u64    │  u32  │  u32   │ →80 B  │
/// └───────┴──────────┴────────┴──────┴──────┴───────────┴───────┴────────┴────────┘
/// ```
/// `length` covers header and payload. Width/height are zero when the
/// payload is not an image.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BinaryFrame {
    /// Frame id assigned by the device
    pub id: u64,
    /// Payload classification
    pub kind: FrameKind,
    /// Device timestamp in microseconds
    pub timestamp_us: u64,
    /// Image width in pixels, if the payload is an image
    pub width: Option<u32>,
    /// Image height in pixels, if the payload is an image
    pub height: Option<u32>,
    /// Opaque payload bytes (JPEG, raw sensor data, ...)
    pub payload: Bytes,
}

impl BinaryFrame {
    /// Create a preview frame. Used by live-view sources that feed
    /// decoded RTSP images into the frame pipeline.
    pub fn preview(id: u64, timestamp_us: u64, width: u32, height: u32, payload: Bytes) -> Self {
        Self {
            id,
            kind: FrameKind::Preview,
            timestamp_us,
            width: Some(width),
            height: Some(height),
            payload,
        }
    }

    /// True when the frame is the device's drop marker: a stacked-kind
    /// frame with no payload and no image dimensions.
    pub fn is_drop_marker(&self) -> bool {
        self.kind == FrameKind::Stacked
            && self.payload.is_empty()
            && self.width.is_none()
            && self.height.is_none()
    }
}

//! Protocol constants for the telescope's two TCP channels

pub mod binary;
pub mod text;

/// Default port for the line-delimited JSON control channel
pub const DEFAULT_CONTROL_PORT: u16 = 4700;

/// Default port for the binary imaging channel
pub const DEFAULT_IMAGING_PORT: u16 = 4800;

/// Port of the RTSP live-view sub-stream advertised by the device
pub const RTSP_PORT: u16 = 4554;

/// Magic value at the start of every binary frame header
pub const FRAME_MAGIC: u32 = 0x8073_636F;

/// Binary frame header size in bytes (fixed-layout, little-endian)
pub const FRAME_HEADER_SIZE: usize = 80;

/// Maximum accepted binary frame size, header included (32 MiB)
pub const MAX_FRAME_SIZE: usize = 32 * 1024 * 1024;

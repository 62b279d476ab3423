//! Scopinator — client library for networked smart telescopes
//!
//! The device exposes two TCP protocols: an LF-delimited JSON control
//! channel and a binary imaging channel with an RTSP live-view
//! sub-stream. This crate provides:
//!
//! - **`transport`**: reconnecting framed transport (text or binary)
//!   with full-jitter backoff
//! - **`correlator`**: request/response matching with per-request
//!   deadlines and a reaper
//! - **`bus`**: pub/sub delivery of device events with per-subscriber
//!   bounded queues
//! - **`status`**: consolidated device snapshot, torn-read free
//! - **`client`** / **`imaging`**: the high-level façades composing the
//!   above over the control and imaging ports
//!
//! ```no_run
//! use scopinator::{ClientConfig, ControlClient, Endpoint};
//!
//! # async fn demo() -> scopinator::Result<()> {
//! let client =
//!     ControlClient::connect(Endpoint::new("192.168.42.41"), ClientConfig::default()).await?;
//! let time = client.get_time().await?;
//! println!("device time: {}", time.time);
//! client.disconnect().await;
//! # Ok(())
//! # }
//! ```

mod bus;
mod client;
mod command;
mod config;
mod correlator;
mod error;
mod event;
mod frame;
mod imaging;
pub mod protocol;
mod status;
pub mod transport;

pub use bus::{EventBus, Subscription};
pub use client::{ControlClient, SendOptions};
pub use command::{
    BeginStreaming, Command, DeviceState, EquCoord, GetDeviceState, GetDiskVolume, GetEquCoord,
    GetFocuserPosition, GetStackedImage, GetTime, GetViewState, GotoTarget, PiStatus, ScopePark,
    StopGoto, StopStreaming, StreamMode, TestConnection, TimeInfo, ViewInfo, ViewState,
};
pub use config::{ClientConfig, Endpoint, ReconnectConfig};
pub use correlator::Correlator;
pub use error::{Error, Result};
pub use event::{kind, Event};
pub use frame::{BinaryFrame, FrameKind};
pub use imaging::{FrameSubscription, ImagingClient, ImagingStatus, LiveViewSource};
pub use protocol::text::{CommandResponse, DeviceError, IncomingMessage};
pub use status::{StatusSnapshot, StatusStore};

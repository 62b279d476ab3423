//! Client configuration
//!
//! The library only ever sees this typed struct; reading environment
//! variables or CLI flags is the binary's job.

use std::time::Duration;

use crate::protocol::{DEFAULT_CONTROL_PORT, DEFAULT_IMAGING_PORT, RTSP_PORT};

/// Where the device lives on the network.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoint {
    /// Device IP address or hostname
    pub host: String,
    /// Port of the line-delimited JSON control channel
    pub control_port: u16,
    /// Port of the binary imaging channel
    pub imaging_port: u16,
}

impl Endpoint {
    /// Endpoint with the device's default ports.
    pub fn new(host: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            control_port: DEFAULT_CONTROL_PORT,
            imaging_port: DEFAULT_IMAGING_PORT,
        }
    }

    /// Socket address of the control channel.
    pub fn control_addr(&self) -> String {
        format!("{}:{}", self.host, self.control_port)
    }

    /// Socket address of the imaging channel.
    pub fn imaging_addr(&self) -> String {
        format!("{}:{}", self.host, self.imaging_port)
    }

    /// URL of the RTSP live-view sub-stream advertised by the device.
    pub fn rtsp_url(&self) -> String {
        format!("rtsp://{}:{}/stream", self.host, RTSP_PORT)
    }
}

/// Reconnect backoff tuning.
#[derive(Debug, Clone)]
pub struct ReconnectConfig {
    /// Base delay before the first retry
    pub base: Duration,
    /// Ceiling for the exponential delay
    pub cap: Duration,
    /// Give up after this many consecutive failures (None = retry forever)
    pub max_attempts: Option<u32>,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            base: Duration::from_millis(500),
            cap: Duration::from_secs(10),
            max_attempts: None,
        }
    }
}

/// Tunables for both the control and imaging sessions.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Max wait on the initial TCP connect
    pub connect_timeout: Duration,
    /// Treat the connection as dead after no bytes for this long
    pub read_idle_timeout: Duration,
    /// Default per-request deadline
    pub command_timeout: Duration,
    /// Interval between liveness probes on the control channel
    pub heartbeat_interval: Duration,
    /// Backoff tuning
    pub reconnect: ReconnectConfig,
    /// Bounded write queue length
    pub write_queue_size: usize,
    /// How long a full write queue blocks the issuer before `Overloaded`
    pub write_queue_timeout: Duration,
    /// Per-subscriber event/frame delivery queue length
    pub subscriber_queue_size: usize,
    /// How long `wait_for_reconnect` sends block for the link to return
    pub reconnect_wait_timeout: Duration,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(10),
            read_idle_timeout: Duration::from_secs(30),
            command_timeout: Duration::from_secs(10),
            heartbeat_interval: Duration::from_secs(5),
            reconnect: ReconnectConfig::default(),
            write_queue_size: 256,
            write_queue_timeout: Duration::from_secs(5),
            subscriber_queue_size: 64,
            reconnect_wait_timeout: Duration::from_secs(30),
        }
    }
}

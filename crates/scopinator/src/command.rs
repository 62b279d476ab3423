//! Command catalog surface
//!
//! Each command declares its wire method name, a serializable parameter
//! object and the shape of the `result` payload. The connection layer
//! consumes only this declaration; adding a command never touches the
//! codec or the correlator.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};

/// A device command: method name, parameters and typed response.
pub trait Command: Send + Sync {
    /// Type decoded from the response's `result` field
    type Response: DeserializeOwned + Send;

    /// JSON-RPC method name on the wire
    fn method(&self) -> &'static str;

    /// Parameters object; empty by default
    fn params(&self) -> Value {
        Value::Object(Map::new())
    }
}

// ========== Simple queries ==========

/// `get_time` — device wall clock
#[derive(Debug, Clone, Copy, Default)]
pub struct GetTime;

#[derive(Debug, Clone, Deserialize)]
pub struct TimeInfo {
    pub time: String,
}

impl Command for GetTime {
    type Response = TimeInfo;
    fn method(&self) -> &'static str {
        "get_time"
    }
}

/// `test_connection` — liveness probe, empty result
#[derive(Debug, Clone, Copy, Default)]
pub struct TestConnection;

impl Command for TestConnection {
    type Response = Value;
    fn method(&self) -> &'static str {
        "test_connection"
    }
}

/// `iscope_get_device_state` — consolidated hardware report
#[derive(Debug, Clone, Copy, Default)]
pub struct GetDeviceState;

#[derive(Debug, Clone, Deserialize)]
pub struct DeviceState {
    pub pi_status: Option<PiStatus>,
    /// Sections the library does not model ride along untouched
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PiStatus {
    pub temp: Option<f64>,
    pub battery_capacity: Option<i64>,
    pub charger_status: Option<String>,
    pub charge_online: Option<bool>,
}

impl Command for GetDeviceState {
    type Response = DeviceState;
    fn method(&self) -> &'static str {
        "iscope_get_device_state"
    }
}

/// `iscope_get_view_state` — current view mode/stage/target
#[derive(Debug, Clone, Copy, Default)]
pub struct GetViewState;

#[derive(Debug, Clone, Deserialize)]
pub struct ViewState {
    #[serde(rename = "View")]
    pub view: Option<ViewInfo>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ViewInfo {
    pub mode: Option<String>,
    pub stage: Option<String>,
    pub state: Option<String>,
    pub target_name: Option<String>,
    pub gain: Option<i64>,
}

impl Command for GetViewState {
    type Response = ViewState;
    fn method(&self) -> &'static str {
        "iscope_get_view_state"
    }
}

/// `scope_get_focuser_position` — bare integer result
#[derive(Debug, Clone, Copy, Default)]
pub struct GetFocuserPosition;

impl Command for GetFocuserPosition {
    type Response = i64;
    fn method(&self) -> &'static str {
        "scope_get_focuser_position"
    }
}

/// `scope_get_equ_coord` — where the scope points
#[derive(Debug, Clone, Copy, Default)]
pub struct GetEquCoord;

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct EquCoord {
    pub ra: f64,
    pub dec: f64,
}

impl Command for GetEquCoord {
    type Response = EquCoord;
    fn method(&self) -> &'static str {
        "scope_get_equ_coord"
    }
}

/// `get_disk_volume` — storage usage, shape varies across firmware
#[derive(Debug, Clone, Copy, Default)]
pub struct GetDiskVolume;

impl Command for GetDiskVolume {
    type Response = Value;
    fn method(&self) -> &'static str {
        "get_disk_volume"
    }
}

// ========== Mount control ==========

/// `iscope_start_view` — slew to a target and begin observing
#[derive(Debug, Clone)]
pub struct GotoTarget {
    pub target_name: Option<String>,
    pub ra: f64,
    pub dec: f64,
}

impl Command for GotoTarget {
    type Response = Value;
    fn method(&self) -> &'static str {
        "iscope_start_view"
    }
    fn params(&self) -> Value {
        json!({
            "mode": "star",
            "target_ra_dec": [self.ra, self.dec],
            "target_name": self.target_name.clone().unwrap_or_default(),
            "lp_filter": false,
        })
    }
}

/// `iscope_stop_view` — abort the current goto/observation stage
#[derive(Debug, Clone, Copy, Default)]
pub struct StopGoto;

impl Command for StopGoto {
    type Response = Value;
    fn method(&self) -> &'static str {
        "iscope_stop_view"
    }
    fn params(&self) -> Value {
        json!({"stage": "AutoGoto"})
    }
}

/// `scope_park` — return the mount to its stowed position
#[derive(Debug, Clone, Copy, Default)]
pub struct ScopePark;

impl Command for ScopePark {
    type Response = Value;
    fn method(&self) -> &'static str {
        "scope_park"
    }
}

// ========== Imaging channel ==========

/// Streaming mode requested on `begin_streaming`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamMode {
    Preview,
    Stack,
    Raw,
}

impl StreamMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            StreamMode::Preview => "preview",
            StreamMode::Stack => "stack",
            StreamMode::Raw => "raw",
        }
    }
}

/// `begin_streaming` — start frame delivery on the imaging channel
#[derive(Debug, Clone, Copy)]
pub struct BeginStreaming {
    pub mode: StreamMode,
}

impl Command for BeginStreaming {
    type Response = Value;
    fn method(&self) -> &'static str {
        "begin_streaming"
    }
    fn params(&self) -> Value {
        json!({"mode": self.mode.as_str()})
    }
}

/// `stop_streaming` — stop frame delivery
#[derive(Debug, Clone, Copy, Default)]
pub struct StopStreaming;

impl Command for StopStreaming {
    type Response = Value;
    fn method(&self) -> &'static str {
        "stop_streaming"
    }
}

/// `get_stacked_img` — request the current stacked image as one frame
#[derive(Debug, Clone, Copy, Default)]
pub struct GetStackedImage;

impl Command for GetStackedImage {
    type Response = Value;
    fn method(&self) -> &'static str {
        "get_stacked_img"
    }
}

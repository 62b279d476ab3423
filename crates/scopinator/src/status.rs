//! Consolidated device status
//!
//! One store, mutated only by the reader loops, observed through
//! copy-on-read snapshots. Fields are grouped by vintage: each update
//! call rewrites a whole group under the lock together with its
//! `updated_at` stamp, so a snapshot can never show half-old,
//! half-new sub-fields within a group.

use std::time::SystemTime;

use serde::Serialize;
use serde_json::Value;
use tokio::sync::RwLock;
use tracing::trace;

use crate::command::{DeviceState, ViewState};
use crate::event::{kind, Event};
use crate::protocol::text::CommandResponse;

/// Where the scope points.
#[derive(Debug, Clone, Default, Serialize, PartialEq)]
pub struct PointingGroup {
    pub ra: Option<f64>,
    pub dec: Option<f64>,
    pub updated_at: Option<SystemTime>,
}

/// Device health: temperature, battery, charger.
#[derive(Debug, Clone, Default, Serialize, PartialEq)]
pub struct PiGroup {
    pub temp: Option<f64>,
    pub battery_capacity: Option<i64>,
    pub charger_status: Option<String>,
    pub updated_at: Option<SystemTime>,
}

/// Current view: mode, stage, target.
#[derive(Debug, Clone, Default, Serialize, PartialEq)]
pub struct ViewGroup {
    pub mode: Option<String>,
    pub stage: Option<String>,
    pub state: Option<String>,
    pub target_name: Option<String>,
    pub updated_at: Option<SystemTime>,
}

/// Focuser position.
#[derive(Debug, Clone, Default, Serialize, PartialEq)]
pub struct FocusGroup {
    pub position: Option<i64>,
    pub updated_at: Option<SystemTime>,
}

/// Streaming counters for the current imaging session.
#[derive(Debug, Clone, Default, Serialize, PartialEq)]
pub struct StackGroup {
    pub stacked: u64,
    pub dropped: u64,
    pub skipped: u64,
    pub updated_at: Option<SystemTime>,
}

/// Immutable copy of the store at one instant.
#[derive(Debug, Clone, Default, Serialize, PartialEq)]
pub struct StatusSnapshot {
    pub pointing: PointingGroup,
    pub pi: PiGroup,
    pub view: ViewGroup,
    pub focus: FocusGroup,
    pub stack: StackGroup,
    pub control_connected: bool,
    pub imaging_connected: bool,
    /// Last time any byte arrived from the device. Sticky across
    /// reconnects and session resets.
    pub last_seen: Option<SystemTime>,
    /// Malformed inputs tolerated so far
    pub protocol_errors: u64,
}

/// The store itself. Writers are the reader loops; everyone else calls
/// `snapshot`.
#[derive(Default)]
pub struct StatusStore {
    inner: RwLock<StatusSnapshot>,
}

impl StatusStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Copy-on-read view.
    pub async fn snapshot(&self) -> StatusSnapshot {
        self.inner.read().await.clone()
    }

    /// Forget device state for a fresh session. `last_seen` is sticky.
    pub async fn reset(&self) {
        let mut inner = self.inner.write().await;
        let last_seen = inner.last_seen;
        *inner = StatusSnapshot {
            last_seen,
            ..StatusSnapshot::default()
        };
    }

    pub async fn set_control_connected(&self, connected: bool) {
        self.inner.write().await.control_connected = connected;
    }

    pub async fn set_imaging_connected(&self, connected: bool) {
        self.inner.write().await.imaging_connected = connected;
    }

    /// Record that the device just said something.
    pub async fn note_seen(&self) {
        self.inner.write().await.last_seen = Some(SystemTime::now());
    }

    pub async fn count_protocol_error(&self) {
        self.inner.write().await.protocol_errors += 1;
    }

    pub async fn update_pointing(&self, ra: f64, dec: f64) {
        let mut inner = self.inner.write().await;
        inner.pointing = PointingGroup {
            ra: Some(ra),
            dec: Some(dec),
            updated_at: Some(SystemTime::now()),
        };
    }

    pub async fn update_pi(
        &self,
        temp: Option<f64>,
        battery_capacity: Option<i64>,
        charger_status: Option<String>,
    ) {
        let mut inner = self.inner.write().await;
        inner.pi = PiGroup {
            temp,
            battery_capacity,
            charger_status,
            updated_at: Some(SystemTime::now()),
        };
    }

    pub async fn update_view(
        &self,
        mode: Option<String>,
        stage: Option<String>,
        state: Option<String>,
        target_name: Option<String>,
    ) {
        let mut inner = self.inner.write().await;
        inner.view = ViewGroup {
            mode,
            stage,
            state,
            target_name,
            updated_at: Some(SystemTime::now()),
        };
    }

    pub async fn update_focus(&self, position: i64) {
        let mut inner = self.inner.write().await;
        inner.focus = FocusGroup {
            position: Some(position),
            updated_at: Some(SystemTime::now()),
        };
    }

    /// Replace the streaming counters as one group.
    pub async fn update_stack(&self, stacked: u64, dropped: u64, skipped: u64) {
        let mut inner = self.inner.write().await;
        inner.stack = StackGroup {
            stacked,
            dropped,
            skipped,
            updated_at: Some(SystemTime::now()),
        };
    }

    /// Fold an unsolicited event into the store. Unknown kinds are
    /// ignored here; the bus still delivers them to subscribers.
    pub async fn apply_event(&self, event: &Event) {
        match event.kind.as_str() {
            kind::PI_STATUS => {
                let payload = &event.payload;
                self.update_pi(
                    payload.get("temp").and_then(Value::as_f64),
                    payload.get("battery_capacity").and_then(Value::as_i64),
                    payload
                        .get("charger_status")
                        .and_then(Value::as_str)
                        .map(str::to_string),
                )
                .await;
            }
            kind::VIEW_STATE_CHANGED => {
                let view = event.payload.get("View").unwrap_or(&event.payload);
                self.update_view(
                    view.get("mode").and_then(Value::as_str).map(str::to_string),
                    view.get("stage").and_then(Value::as_str).map(str::to_string),
                    view.get("state").and_then(Value::as_str).map(str::to_string),
                    view.get("target_name")
                        .and_then(Value::as_str)
                        .map(str::to_string),
                )
                .await;
            }
            kind::FOCUSER_MOVE => {
                if let Some(position) = event.payload.get("position").and_then(Value::as_i64) {
                    self.update_focus(position).await;
                }
            }
            other => trace!(kind = other, "event not folded into status"),
        }
    }

    /// Fold a correlated response into the store, keyed by the method
    /// that asked for it. Used by the refresh path after connect and
    /// reconnect.
    pub async fn apply_response(&self, method: &str, response: &CommandResponse) {
        let Some(result) = response.result.as_ref() else {
            return;
        };
        match method {
            "scope_get_equ_coord" => {
                if let (Some(ra), Some(dec)) = (
                    result.get("ra").and_then(Value::as_f64),
                    result.get("dec").and_then(Value::as_f64),
                ) {
                    self.update_pointing(ra, dec).await;
                }
            }
            "iscope_get_device_state" => {
                if let Ok(state) = serde_json::from_value::<DeviceState>(result.clone()) {
                    if let Some(pi) = state.pi_status {
                        self.update_pi(pi.temp, pi.battery_capacity, pi.charger_status)
                            .await;
                    }
                }
            }
            "iscope_get_view_state" => {
                if let Ok(state) = serde_json::from_value::<ViewState>(result.clone()) {
                    if let Some(view) = state.view {
                        self.update_view(view.mode, view.stage, view.state, view.target_name)
                            .await;
                    }
                }
            }
            "scope_get_focuser_position" => {
                if let Some(position) = result.as_i64() {
                    self.update_focus(position).await;
                }
            }
            _ => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn response_for(result: Value) -> CommandResponse {
        CommandResponse {
            id: 1,
            result: Some(result),
            error: None,
            timestamp: None,
            received_at: SystemTime::now(),
        }
    }

    // ========== Group updates ==========

    #[tokio::test]
    async fn test_pointing_group_updates_together() {
        let store = StatusStore::new();
        store.update_pointing(10.68, 41.27).await;

        let snap = store.snapshot().await;
        assert_eq!(snap.pointing.ra, Some(10.68));
        assert_eq!(snap.pointing.dec, Some(41.27));
        assert!(snap.pointing.updated_at.is_some());
        // untouched groups stay untouched
        assert!(snap.pi.updated_at.is_none());
    }

    #[tokio::test]
    async fn test_snapshot_is_a_copy() {
        let store = StatusStore::new();
        store.update_focus(5000).await;
        let before = store.snapshot().await;

        store.update_focus(6000).await;
        assert_eq!(before.focus.position, Some(5000));
        assert_eq!(store.snapshot().await.focus.position, Some(6000));
    }

    // ========== Event folding ==========

    #[tokio::test]
    async fn test_pi_status_event_folds_into_pi_group() {
        let store = StatusStore::new();
        let event = Event::internal(
            kind::PI_STATUS,
            json!({"temp": 25.5, "battery_capacity": 93, "charger_status": "Discharging"}),
        );
        store.apply_event(&event).await;

        let snap = store.snapshot().await;
        assert_eq!(snap.pi.temp, Some(25.5));
        assert_eq!(snap.pi.battery_capacity, Some(93));
        assert_eq!(snap.pi.charger_status.as_deref(), Some("Discharging"));
    }

    #[tokio::test]
    async fn test_view_event_handles_nested_and_flat_shapes() {
        let store = StatusStore::new();
        store
            .apply_event(&Event::internal(
                kind::VIEW_STATE_CHANGED,
                json!({"View": {"mode": "star", "stage": "AutoGoto", "state": "working", "target_name": "M31"}}),
            ))
            .await;
        let snap = store.snapshot().await;
        assert_eq!(snap.view.stage.as_deref(), Some("AutoGoto"));
        assert_eq!(snap.view.target_name.as_deref(), Some("M31"));

        store
            .apply_event(&Event::internal(
                kind::VIEW_STATE_CHANGED,
                json!({"mode": "star", "stage": "Idle", "state": "idle", "target_name": ""}),
            ))
            .await;
        assert_eq!(store.snapshot().await.view.stage.as_deref(), Some("Idle"));
    }

    #[tokio::test]
    async fn test_unknown_event_kind_ignored() {
        let store = StatusStore::new();
        store
            .apply_event(&Event::internal("SomethingNew", json!({"x": 1})))
            .await;
        assert_eq!(store.snapshot().await, StatusSnapshot::default());
    }

    // ========== Response folding ==========

    #[tokio::test]
    async fn test_refresh_responses_fold_into_groups() {
        let store = StatusStore::new();
        store
            .apply_response("scope_get_equ_coord", &response_for(json!({"ra": 1.5, "dec": -2.5})))
            .await;
        store
            .apply_response(
                "iscope_get_device_state",
                &response_for(json!({"pi_status": {"temp": 31.0, "battery_capacity": 55}})),
            )
            .await;
        store
            .apply_response("scope_get_focuser_position", &response_for(json!(4200)))
            .await;

        let snap = store.snapshot().await;
        assert_eq!(snap.pointing.ra, Some(1.5));
        assert_eq!(snap.pi.battery_capacity, Some(55));
        assert_eq!(snap.focus.position, Some(4200));
    }

    // ========== Reset semantics ==========

    #[tokio::test]
    async fn test_reset_clears_state_but_keeps_last_seen() {
        let store = StatusStore::new();
        store.update_focus(1234).await;
        store.note_seen().await;
        let seen = store.snapshot().await.last_seen;
        assert!(seen.is_some());

        store.reset().await;
        let snap = store.snapshot().await;
        assert!(snap.focus.position.is_none());
        assert!(!snap.control_connected);
        assert_eq!(snap.last_seen, seen);
    }

    #[tokio::test]
    async fn test_groups_never_observed_torn() {
        use std::sync::Arc;

        let store = Arc::new(StatusStore::new());
        let writer_store = Arc::clone(&store);
        let writer = tokio::spawn(async move {
            for i in 0..500i64 {
                // ra and dec always written as a matched pair
                let value = i as f64;
                writer_store.update_pointing(value, -value).await;
                tokio::task::yield_now().await;
            }
        });

        for _ in 0..500 {
            let snap = store.snapshot().await;
            if let (Some(ra), Some(dec)) = (snap.pointing.ra, snap.pointing.dec) {
                assert_eq!(dec, -ra, "observed a half-written pointing group");
            }
            tokio::task::yield_now().await;
        }
        writer.await.unwrap();
    }

    #[tokio::test]
    async fn test_disconnect_flips_flag_but_keeps_fields() {
        let store = StatusStore::new();
        store.set_control_connected(true).await;
        store.update_pi(Some(25.0), Some(80), None).await;

        store.set_control_connected(false).await;
        let snap = store.snapshot().await;
        assert!(!snap.control_connected);
        // stale values are retained, still stamped
        assert_eq!(snap.pi.battery_capacity, Some(80));
        assert!(snap.pi.updated_at.is_some());
    }
}

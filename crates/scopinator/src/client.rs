//! High-level control-channel client
//!
//! Composes the transport, correlator, event bus and status store into
//! the façade applications use: `connect`, `send`, `subscribe`,
//! `status`, `disconnect`. One reader task drains the transport and
//! routes: responses to the correlator, events to the status store and
//! the bus. A heartbeat task keeps the liveness window honest.

use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};

use crate::bus::{EventBus, Subscription};
use crate::command::{
    Command, DeviceState, EquCoord, GetDeviceState, GetEquCoord, GetFocuserPosition, GetTime,
    GetViewState, GotoTarget, ScopePark, StopGoto, TimeInfo, ViewState,
};
use crate::config::{ClientConfig, Endpoint};
use crate::correlator::Correlator;
use crate::error::{Error, Result};
use crate::event::{kind, Event};
use crate::protocol::text::{classify_line, IncomingMessage};
use crate::status::{StatusSnapshot, StatusStore};
use crate::transport::{self, TransportHandle, TransportMessage, TransportMode};

/// Methods re-queried after connect and reconnect to rebuild the
/// status snapshot.
const REFRESH_METHODS: &[&str] = &[
    "iscope_get_device_state",
    "get_time",
    "scope_get_equ_coord",
    "iscope_get_view_state",
    "scope_get_focuser_position",
];

/// Per-call knobs for `send_with`.
#[derive(Debug, Clone, Copy, Default)]
pub struct SendOptions {
    /// Override the config's `command_timeout`
    pub timeout: Option<Duration>,
    /// While the link is down, wait for it to come back (up to
    /// `reconnect_wait_timeout`) and retry once instead of failing
    /// fast with `Disconnected`.
    pub wait_for_reconnect: bool,
}

/// Client for the telescope's control channel.
pub struct ControlClient {
    endpoint: Endpoint,
    config: ClientConfig,
    transport: TransportHandle,
    correlator: Arc<Correlator>,
    bus: EventBus,
    status: Arc<StatusStore>,
    cancel: CancellationToken,
    tracker: TaskTracker,
}

impl ControlClient {
    /// Connect to the device's control port and start the background
    /// tasks. Fails with `ConnectFailed` when the device is
    /// unreachable.
    pub async fn connect(endpoint: Endpoint, config: ClientConfig) -> Result<Self> {
        let cancel = CancellationToken::new();
        let tracker = TaskTracker::new();

        let (transport, incoming) = transport::open(
            endpoint.control_addr(),
            TransportMode::Text,
            &config,
            cancel.clone(),
        )
        .await?;

        let correlator = Arc::new(Correlator::new());
        correlator.spawn_reaper(&tracker, cancel.clone());

        let bus = EventBus::new(config.subscriber_queue_size);
        let status = Arc::new(StatusStore::new());
        status.set_control_connected(true).await;

        tracker.spawn(run_reader(
            incoming,
            transport.clone(),
            Arc::clone(&correlator),
            bus.clone(),
            Arc::clone(&status),
            config.command_timeout,
        ));

        spawn_heartbeat(
            &tracker,
            cancel.clone(),
            transport.clone(),
            Arc::clone(&correlator),
            Arc::clone(&status),
            config.heartbeat_interval,
            config.command_timeout,
        );

        let client = Self {
            endpoint,
            config,
            transport,
            correlator,
            bus,
            status,
            cancel,
            tracker,
        };

        // Populate the snapshot before handing the client out. Any
        // individual query failing is not fatal to the connection.
        refresh_status(
            &client.transport,
            &client.correlator,
            &client.status,
            client.config.command_timeout,
        )
        .await;

        info!(host = %client.endpoint.host, "control client connected");
        Ok(client)
    }

    /// The endpoint this client was built for.
    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    /// True while the control link is up and the reader is live.
    pub fn is_connected(&self) -> bool {
        self.transport.is_connected()
    }

    /// Event bus shared with subscribers (and the imaging client).
    pub fn bus(&self) -> &EventBus {
        &self.bus
    }

    /// The consolidated status store, shareable with an imaging client.
    pub fn status_store(&self) -> Arc<StatusStore> {
        Arc::clone(&self.status)
    }

    /// Immutable snapshot of device status.
    pub async fn status(&self) -> StatusSnapshot {
        let mut snapshot = self.status.snapshot().await;
        snapshot.protocol_errors += self.transport.protocol_errors();
        snapshot
    }

    /// Subscribe to one event kind, or all kinds with `None`.
    pub fn subscribe(&self, kind: Option<&str>) -> Subscription {
        self.bus.subscribe(kind)
    }

    /// Register an async handler for an event kind. The handler runs on
    /// the bus's fan-out task; its failures never reach the publisher.
    pub fn on_event<F, Fut>(&self, kind: Option<&str>, handler: F)
    where
        F: Fn(Event) -> Fut + Send + 'static,
        Fut: std::future::Future<Output = ()> + Send + 'static,
    {
        self.bus
            .subscribe_handler(kind, handler, &self.tracker, self.cancel.clone());
    }

    /// Send a command and decode its typed response.
    pub async fn send<C: Command>(&self, command: &C) -> Result<C::Response> {
        self.send_with(command, SendOptions::default()).await
    }

    /// Send with per-call options.
    pub async fn send_with<C: Command>(
        &self,
        command: &C,
        options: SendOptions,
    ) -> Result<C::Response> {
        let deadline = options.timeout.unwrap_or(self.config.command_timeout);
        let mut retried = false;
        loop {
            if !self.transport.is_connected() {
                if !options.wait_for_reconnect {
                    return Err(Error::Disconnected);
                }
                self.transport
                    .wait_connected(self.config.reconnect_wait_timeout)
                    .await?;
            }

            let outcome = self
                .correlator
                .issue(&self.transport, command.method(), &command.params(), deadline)
                .await;

            match outcome {
                Ok(response) => {
                    self.status.apply_response(command.method(), &response).await;
                    let result = response.into_result()?;
                    return serde_json::from_value(result).map_err(|e| {
                        Error::Protocol(format!(
                            "unexpected result shape for {}: {e}",
                            command.method()
                        ))
                    });
                }
                Err(Error::Disconnected) if options.wait_for_reconnect && !retried => {
                    retried = true;
                    continue;
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Block until a progress event of `kind` reaches a terminal state.
    ///
    /// `complete` resolves to `Ok`; `fail`/`cancel` resolve to
    /// `CommandRejected` carrying the device's reason text.
    pub async fn wait_for_event_completion(&self, kind: &str, limit: Duration) -> Result<()> {
        let mut subscription = self.bus.subscribe(Some(kind));
        let wait = async {
            while let Some(event) = subscription.recv().await {
                match event.state() {
                    Some("complete") => return Ok(()),
                    Some("fail") | Some("cancel") => {
                        return Err(Error::CommandRejected {
                            code: 0,
                            message: event
                                .failure_reason()
                                .unwrap_or_else(|| "operation failed".to_string()),
                        });
                    }
                    _ => {}
                }
            }
            Err(Error::Disconnected)
        };
        timeout(limit, wait).await.map_err(|_| Error::Timeout)?
    }

    // ========== Convenience commands ==========

    pub async fn get_time(&self) -> Result<TimeInfo> {
        self.send(&GetTime).await
    }

    pub async fn get_device_state(&self) -> Result<DeviceState> {
        self.send(&GetDeviceState).await
    }

    pub async fn get_view_state(&self) -> Result<ViewState> {
        self.send(&GetViewState).await
    }

    pub async fn get_equ_coord(&self) -> Result<EquCoord> {
        self.send(&GetEquCoord).await
    }

    pub async fn get_focuser_position(&self) -> Result<i64> {
        self.send(&GetFocuserPosition).await
    }

    /// Slew to a target and begin observing it.
    pub async fn goto_target(
        &self,
        target_name: Option<String>,
        ra: f64,
        dec: f64,
    ) -> Result<serde_json::Value> {
        self.send(&GotoTarget { target_name, ra, dec }).await
    }

    /// Abort the current goto.
    pub async fn stop_goto(&self) -> Result<serde_json::Value> {
        self.send(&StopGoto).await
    }

    /// Stow the mount.
    pub async fn park(&self) -> Result<serde_json::Value> {
        self.send(&ScopePark).await
    }

    /// Tear everything down: cancel the reader, close the socket,
    /// drain the correlator with `Cancelled` (so callers can tell
    /// shutdown from network loss) and stop the reaper. The session is
    /// over, so the status snapshot is cleared; only `last_seen`
    /// survives.
    pub async fn disconnect(&self) {
        info!(host = %self.endpoint.host, "control client disconnecting");
        self.cancel.cancel();
        self.correlator.fail_all(|| Error::Cancelled).await;
        self.status.reset().await;
        self.tracker.close();
        if timeout(Duration::from_secs(1), self.tracker.wait())
            .await
            .is_err()
        {
            warn!("background tasks did not stop within 1s");
        }
    }
}

impl Drop for ControlClient {
    fn drop(&mut self) {
        // Guaranteed release on every exit path, scoped-acquisition
        // style: dropping the client stops its tasks and socket even
        // if disconnect() was never awaited.
        self.cancel.cancel();
    }
}

async fn run_reader(
    mut incoming: tokio::sync::mpsc::Receiver<TransportMessage>,
    transport: TransportHandle,
    correlator: Arc<Correlator>,
    bus: EventBus,
    status: Arc<StatusStore>,
    command_timeout: Duration,
) {
    while let Some(message) = incoming.recv().await {
        match message {
            TransportMessage::Line(line) => {
                status.note_seen().await;
                match classify_line(&line) {
                    Ok(IncomingMessage::Response(response)) => {
                        correlator.complete(response).await;
                    }
                    Ok(IncomingMessage::Event(event)) => {
                        status.apply_event(&event).await;
                        bus.publish(event);
                    }
                    Ok(IncomingMessage::Notification(value)) => {
                        debug!(%value, "unclassified message dropped");
                    }
                    Err(e) => {
                        status.count_protocol_error().await;
                        warn!(error = %e, "bad line on control channel");
                    }
                }
            }
            TransportMessage::Down => {
                // All in-flight requests fail before anyone can observe
                // the reconnect, so retrying callers see an empty table.
                correlator.fail_all(|| Error::Disconnected).await;
                correlator.reset_ids();
                status.set_control_connected(false).await;
                bus.publish(Event::internal(
                    kind::INTERNAL_DISCONNECTED,
                    json!({"channel": "control"}),
                ));
            }
            TransportMessage::Up => {
                status.set_control_connected(true).await;
                bus.publish(Event::internal(
                    kind::INTERNAL_RECONNECTED,
                    json!({"channel": "control"}),
                ));
                // Refresh must not run on this task: the queries it
                // issues resolve through this very loop.
                let transport = transport.clone();
                let correlator = Arc::clone(&correlator);
                let status = Arc::clone(&status);
                tokio::spawn(async move {
                    refresh_status(&transport, &correlator, &status, command_timeout).await;
                });
            }
            TransportMessage::Frame(_) => {
                debug!("binary frame on control channel ignored");
            }
        }
    }
}

/// Re-query the snapshot sources after (re)connect.
async fn refresh_status(
    transport: &TransportHandle,
    correlator: &Correlator,
    status: &StatusStore,
    command_timeout: Duration,
) {
    for &method in REFRESH_METHODS {
        match correlator
            .issue(transport, method, &json!({}), command_timeout)
            .await
        {
            Ok(response) => status.apply_response(method, &response).await,
            Err(e) => {
                debug!(method, error = %e, "status refresh query failed");
            }
        }
    }
}

fn spawn_heartbeat(
    tracker: &TaskTracker,
    cancel: CancellationToken,
    transport: TransportHandle,
    correlator: Arc<Correlator>,
    status: Arc<StatusStore>,
    interval: Duration,
    command_timeout: Duration,
) {
    tracker.spawn(async move {
        let mut tick = tokio::time::interval(interval);
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        tick.tick().await; // the immediate first tick
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tick.tick() => {
                    if !transport.is_connected() {
                        continue;
                    }
                    match correlator
                        .issue(&transport, "test_connection", &json!({}), command_timeout)
                        .await
                    {
                        Ok(_) => {
                            status.set_control_connected(transport.is_connected()).await;
                        }
                        Err(Error::Timeout) => {
                            warn!("heartbeat timed out, marking control link unhealthy");
                            status.set_control_connected(false).await;
                        }
                        Err(e) => {
                            debug!(error = %e, "heartbeat failed");
                        }
                    }
                }
            }
        }
    });
}

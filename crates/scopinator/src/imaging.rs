//! Imaging-channel client
//!
//! Runs a second, binary-mode transport against the imaging port.
//! Decoded frames are classified, counted and fanned out to
//! subscribers through a bounded broadcast — a slow subscriber misses
//! frames, the read loop never stalls. Streaming state is explicit:
//! after a reconnect the device delivers nothing until
//! `start_streaming` is called again.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde::Serialize;
use serde_json::json;
use tokio::sync::{broadcast, mpsc, Mutex};
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};

use crate::bus::EventBus;
use crate::command::{BeginStreaming, Command, GetStackedImage, StopStreaming, StreamMode};
use crate::config::{ClientConfig, Endpoint};
use crate::error::{Error, Result};
use crate::event::{kind, Event};
use crate::frame::{BinaryFrame, FrameKind};
use crate::protocol::text::encode_envelope;
use crate::status::StatusStore;
use crate::transport::{self, TransportHandle, TransportMessage, TransportMode};

/// Minimum spacing between slow-subscriber warnings
const DROP_WARN_INTERVAL: Duration = Duration::from_secs(5);

/// Gap samples kept for the skipped-frame heuristic
const GAP_WINDOW: usize = 16;

/// Session counters plus streaming flags.
#[derive(Debug, Clone, Default, Serialize, PartialEq)]
pub struct ImagingStatus {
    pub is_streaming: bool,
    pub mode: Option<String>,
    /// Frames delivered and stacked this session
    pub stacked: u64,
    /// Drop markers plus partial frames lost to disconnects
    pub dropped: u64,
    /// Frames the device skipped, inferred from timestamp jumps
    pub skipped: u64,
    pub connected: bool,
}

struct Counters {
    stacked: AtomicU64,
    dropped: AtomicU64,
    skipped: AtomicU64,
    is_streaming: AtomicBool,
    /// Bumped on every `start_streaming`; tells the reader to forget
    /// its timestamp history from the previous session.
    epoch: AtomicU64,
}

impl Counters {
    fn new() -> Self {
        Self {
            stacked: AtomicU64::new(0),
            dropped: AtomicU64::new(0),
            skipped: AtomicU64::new(0),
            is_streaming: AtomicBool::new(false),
            epoch: AtomicU64::new(0),
        }
    }

    fn reset_session(&self) {
        self.stacked.store(0, Ordering::Relaxed);
        self.dropped.store(0, Ordering::Relaxed);
        self.skipped.store(0, Ordering::Relaxed);
        self.epoch.fetch_add(1, Ordering::Relaxed);
    }
}

/// Client for the telescope's imaging channel.
pub struct ImagingClient {
    endpoint: Endpoint,
    transport: TransportHandle,
    frames: broadcast::Sender<BinaryFrame>,
    counters: Arc<Counters>,
    mode: Mutex<Option<StreamMode>>,
    status: Arc<StatusStore>,
    next_id: AtomicU64,
    command_timeout: Duration,
    cancel: CancellationToken,
    tracker: TaskTracker,
}

impl ImagingClient {
    /// Connect to the device's imaging port. The bus and status store
    /// are shared with the control client so events and counters land
    /// in one place.
    pub async fn connect(
        endpoint: Endpoint,
        config: ClientConfig,
        bus: EventBus,
        status: Arc<StatusStore>,
    ) -> Result<Self> {
        let cancel = CancellationToken::new();
        let tracker = TaskTracker::new();

        let (transport, incoming) = transport::open(
            endpoint.imaging_addr(),
            TransportMode::Binary,
            &config,
            cancel.clone(),
        )
        .await?;

        let (frames, _) = broadcast::channel(config.subscriber_queue_size.max(1));
        let counters = Arc::new(Counters::new());
        status.set_imaging_connected(true).await;

        tracker.spawn(run_reader(
            incoming,
            frames.clone(),
            Arc::clone(&counters),
            Arc::clone(&status),
            bus,
        ));

        info!(host = %endpoint.host, "imaging client connected");
        Ok(Self {
            endpoint,
            transport,
            frames,
            counters,
            mode: Mutex::new(None),
            status,
            next_id: AtomicU64::new(1),
            command_timeout: config.command_timeout,
            cancel,
            tracker,
        })
    }

    /// True while the imaging link is up.
    pub fn is_connected(&self) -> bool {
        self.transport.is_connected()
    }

    /// Current session counters and flags.
    pub async fn status(&self) -> ImagingStatus {
        ImagingStatus {
            is_streaming: self.counters.is_streaming.load(Ordering::Relaxed),
            mode: self.mode.lock().await.map(|m| m.as_str().to_string()),
            stacked: self.counters.stacked.load(Ordering::Relaxed),
            dropped: self.counters.dropped.load(Ordering::Relaxed),
            skipped: self.counters.skipped.load(Ordering::Relaxed),
            connected: self.transport.is_connected(),
        }
    }

    /// Ask the device to start delivering frames. Clears the session
    /// counters. A no-op while already streaming.
    pub async fn start_streaming(&self, mode: StreamMode) -> Result<()> {
        if self.counters.is_streaming.load(Ordering::Relaxed) {
            debug!("already streaming");
            return Ok(());
        }
        self.counters.reset_session();
        self.write_command(&BeginStreaming { mode }).await?;
        self.counters.is_streaming.store(true, Ordering::Relaxed);
        *self.mode.lock().await = Some(mode);
        self.status.update_stack(0, 0, 0).await;
        info!(mode = mode.as_str(), "streaming started");
        Ok(())
    }

    /// Ask the device to stop delivering frames. A no-op while not
    /// streaming.
    pub async fn stop_streaming(&self) -> Result<()> {
        if !self.counters.is_streaming.swap(false, Ordering::Relaxed) {
            return Ok(());
        }
        *self.mode.lock().await = None;
        self.write_command(&StopStreaming).await?;
        info!("streaming stopped");
        Ok(())
    }

    /// Request the current stacked image and wait for it to arrive as
    /// a frame.
    pub async fn fetch_image(&self) -> Result<BinaryFrame> {
        let mut subscription = self.subscribe_frames();
        self.write_command(&GetStackedImage).await?;

        let wait = async {
            loop {
                match subscription.recv().await {
                    Some(frame) if frame.kind == FrameKind::Stacked => return Ok(frame),
                    Some(_) => continue,
                    None => return Err(Error::Disconnected),
                }
            }
        };
        timeout(self.command_timeout, wait)
            .await
            .map_err(|_| Error::Timeout)?
    }

    /// Subscribe to decoded frames. Each subscriber has its own
    /// bounded queue; falling behind loses the oldest frames.
    pub fn subscribe_frames(&self) -> FrameSubscription {
        FrameSubscription {
            rx: self.frames.subscribe(),
            dropped: 0,
            last_drop_warn: None,
        }
    }

    /// Plug in an external live-view source (the RTSP decoder). Its
    /// frames join the same fan-out as device frames.
    pub async fn attach_live_view(&self, mut source: Box<dyn LiveViewSource>) -> Result<()> {
        let mut stream = source.open().await?;
        let frames = self.frames.clone();
        let cancel = self.cancel.clone();
        self.tracker.spawn(async move {
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    frame = stream.recv() => {
                        match frame {
                            Some(frame) => {
                                let _ = frames.send(frame);
                            }
                            None => break,
                        }
                    }
                }
            }
            if let Err(e) = source.close().await {
                warn!(error = %e, "live view source close failed");
            }
        });
        Ok(())
    }

    /// URL of the device's RTSP sub-stream, for constructing a source.
    pub fn rtsp_url(&self) -> String {
        self.endpoint.rtsp_url()
    }

    /// Tear down the imaging session. Tries to stop streaming first so
    /// the device does not keep pushing frames at a dead socket.
    pub async fn disconnect(&self) {
        info!(host = %self.endpoint.host, "imaging client disconnecting");
        if self.counters.is_streaming.load(Ordering::Relaxed) {
            if let Err(e) = self.stop_streaming().await {
                debug!(error = %e, "stop_streaming during disconnect failed");
            }
        }
        self.cancel.cancel();
        self.status.set_imaging_connected(false).await;
        self.tracker.close();
        if timeout(Duration::from_secs(1), self.tracker.wait())
            .await
            .is_err()
        {
            warn!("imaging tasks did not stop within 1s");
        }
    }

    /// Fire-and-forget command on the imaging channel. Replies, when
    /// the device sends any, arrive as frames.
    async fn write_command<C: Command>(&self, command: &C) -> Result<()> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let line = encode_envelope(id, command.method(), &command.params());
        self.transport.send(line).await
    }
}

impl Drop for ImagingClient {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

/// One subscriber's view of the frame fan-out.
pub struct FrameSubscription {
    rx: broadcast::Receiver<BinaryFrame>,
    dropped: u64,
    last_drop_warn: Option<Instant>,
}

impl FrameSubscription {
    /// Receive the next frame. Returns `None` once the client is gone.
    pub async fn recv(&mut self) -> Option<BinaryFrame> {
        loop {
            match self.rx.recv().await {
                Ok(frame) => return Some(frame),
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    self.dropped += n;
                    let due = self
                        .last_drop_warn
                        .map_or(true, |at| at.elapsed() >= DROP_WARN_INTERVAL);
                    if due {
                        warn!(
                            missed = n,
                            total_missed = self.dropped,
                            "frame subscriber too slow"
                        );
                        self.last_drop_warn = Some(Instant::now());
                    }
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }

    /// Frames this subscriber missed to backpressure.
    pub fn dropped(&self) -> u64 {
        self.dropped
    }
}

/// A pluggable source of live-view frames (the RTSP decoder lives
/// outside this crate). `open` yields a stream of preview frames;
/// `close` releases whatever the decoder holds.
#[async_trait]
pub trait LiveViewSource: Send {
    async fn open(&mut self) -> Result<mpsc::Receiver<BinaryFrame>>;
    async fn close(&mut self) -> Result<()>;
}

/// Timestamp-gap tracker behind the skipped-frame heuristic: a frame
/// arriving more than twice the median gap after its predecessor means
/// the device skipped at least one in between.
struct GapTracker {
    last_timestamp: Option<u64>,
    gaps: VecDeque<u64>,
    epoch: u64,
}

impl GapTracker {
    fn new() -> Self {
        Self {
            last_timestamp: None,
            gaps: VecDeque::with_capacity(GAP_WINDOW),
            epoch: 0,
        }
    }

    fn reset(&mut self, epoch: u64) {
        self.last_timestamp = None;
        self.gaps.clear();
        self.epoch = epoch;
    }

    /// Feed one timestamp; true when the jump indicates a skip.
    fn observe(&mut self, timestamp_us: u64) -> bool {
        let Some(last) = self.last_timestamp.replace(timestamp_us) else {
            return false;
        };
        let gap = timestamp_us.saturating_sub(last);
        let skipped = match self.median() {
            Some(median) if median > 0 => gap > median * 2,
            _ => false,
        };
        if self.gaps.len() == GAP_WINDOW {
            self.gaps.pop_front();
        }
        self.gaps.push_back(gap);
        skipped
    }

    fn median(&self) -> Option<u64> {
        if self.gaps.is_empty() {
            return None;
        }
        let mut sorted: Vec<u64> = self.gaps.iter().copied().collect();
        sorted.sort_unstable();
        Some(sorted[sorted.len() / 2])
    }
}

async fn run_reader(
    mut incoming: mpsc::Receiver<TransportMessage>,
    frames: broadcast::Sender<BinaryFrame>,
    counters: Arc<Counters>,
    status: Arc<StatusStore>,
    bus: EventBus,
) {
    let mut gaps = GapTracker::new();
    while let Some(message) = incoming.recv().await {
        match message {
            TransportMessage::Frame(frame) => {
                status.note_seen().await;

                let epoch = counters.epoch.load(Ordering::Relaxed);
                if gaps.epoch != epoch {
                    gaps.reset(epoch);
                }

                if frame.is_drop_marker() {
                    counters.dropped.fetch_add(1, Ordering::Relaxed);
                } else {
                    if frame.kind == FrameKind::Stacked {
                        counters.stacked.fetch_add(1, Ordering::Relaxed);
                    }
                    if gaps.observe(frame.timestamp_us) {
                        counters.skipped.fetch_add(1, Ordering::Relaxed);
                    }
                    // Fan-out never blocks this loop; slow subscribers
                    // lose frames from their own queue instead.
                    let _ = frames.send(frame);
                }

                status
                    .update_stack(
                        counters.stacked.load(Ordering::Relaxed),
                        counters.dropped.load(Ordering::Relaxed),
                        counters.skipped.load(Ordering::Relaxed),
                    )
                    .await;
            }
            TransportMessage::Down => {
                // The frame that was cut off mid-transfer is gone.
                if counters.is_streaming.swap(false, Ordering::Relaxed) {
                    counters.dropped.fetch_add(1, Ordering::Relaxed);
                    status
                        .update_stack(
                            counters.stacked.load(Ordering::Relaxed),
                            counters.dropped.load(Ordering::Relaxed),
                            counters.skipped.load(Ordering::Relaxed),
                        )
                        .await;
                }
                status.set_imaging_connected(false).await;
                bus.publish(Event::internal(
                    kind::INTERNAL_DISCONNECTED,
                    json!({"channel": "imaging"}),
                ));
            }
            TransportMessage::Up => {
                // Streaming stays off until the caller restarts it.
                status.set_imaging_connected(true).await;
                bus.publish(Event::internal(
                    kind::INTERNAL_RECONNECTED,
                    json!({"channel": "imaging"}),
                ));
            }
            TransportMessage::Line(line) => {
                debug!(%line, "text line on imaging channel ignored");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // ========== Gap heuristic ==========

    #[test]
    fn test_gap_tracker_steady_cadence_never_skips() {
        let mut tracker = GapTracker::new();
        for i in 0..50u64 {
            assert!(!tracker.observe(i * 1_000_000));
        }
    }

    #[test]
    fn test_gap_tracker_flags_jump() {
        let mut tracker = GapTracker::new();
        for i in 0..10u64 {
            tracker.observe(i * 1_000_000);
        }
        // multi-second jump against a 1-second median
        assert!(tracker.observe(15_000_000));
    }

    #[test]
    fn test_gap_tracker_needs_history() {
        let mut tracker = GapTracker::new();
        // first two frames establish the baseline, nothing to compare
        assert!(!tracker.observe(0));
        assert!(!tracker.observe(60_000_000));
    }

    #[test]
    fn test_gap_tracker_reset_forgets_history() {
        let mut tracker = GapTracker::new();
        for i in 0..10u64 {
            tracker.observe(i * 1_000_000);
        }
        tracker.reset(1);
        // After reset, a big absolute timestamp is just the new first
        // frame.
        assert!(!tracker.observe(500_000_000));
        assert!(!tracker.observe(501_000_000));
    }

    // ========== Counters ==========

    #[test]
    fn test_reset_session_clears_counters_and_bumps_epoch() {
        let counters = Counters::new();
        counters.stacked.store(10, Ordering::Relaxed);
        counters.dropped.store(2, Ordering::Relaxed);
        counters.skipped.store(1, Ordering::Relaxed);
        let epoch = counters.epoch.load(Ordering::Relaxed);

        counters.reset_session();
        assert_eq!(counters.stacked.load(Ordering::Relaxed), 0);
        assert_eq!(counters.dropped.load(Ordering::Relaxed), 0);
        assert_eq!(counters.skipped.load(Ordering::Relaxed), 0);
        assert_eq!(counters.epoch.load(Ordering::Relaxed), epoch + 1);
    }
}

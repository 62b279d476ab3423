//! Request/response correlation
//!
//! Allocates monotonically increasing request ids, parks one waiter per
//! id, and guarantees every issued request resolves exactly once:
//! with the device's response, with `Timeout` via the reaper, with
//! `Disconnected` when the link drops, or with `Cancelled` at shutdown.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tokio::sync::{oneshot, Mutex};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, trace};

use crate::error::{Error, Result};
use crate::protocol::text::{encode_envelope, CommandResponse};
use crate::transport::TransportHandle;

/// How often the reaper scans for expired entries
const REAPER_TICK: Duration = Duration::from_millis(100);

struct PendingEntry {
    deadline: Instant,
    completer: oneshot::Sender<Result<CommandResponse>>,
}

/// Pending-request table shared between issuers, the reader loop and
/// the reaper. All access goes through one short-lived lock; no other
/// lock is ever held across it.
pub struct Correlator {
    pending: Mutex<HashMap<u64, PendingEntry>>,
    next_id: AtomicU64,
}

impl Default for Correlator {
    fn default() -> Self {
        Self::new()
    }
}

impl Correlator {
    pub fn new() -> Self {
        Self {
            pending: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
        }
    }

    /// Allocate the next request id.
    pub fn next_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    /// Restart the id space for a fresh session. Only called once the
    /// pending table has been drained, so no caller can observe a
    /// duplicate id.
    pub fn reset_ids(&self) {
        self.next_id.store(1, Ordering::Relaxed);
    }

    /// Encode, submit and await one request on `transport`.
    pub async fn issue(
        &self,
        transport: &TransportHandle,
        method: &str,
        params: &Value,
        timeout: Duration,
    ) -> Result<CommandResponse> {
        let id = self.next_id();
        let rx = self.register(id, timeout).await;
        trace!(id, method, "issuing request");

        let line = encode_envelope(id, method, params);
        if let Err(e) = transport.send(line).await {
            self.remove(id).await;
            return Err(e);
        }

        match rx.await {
            Ok(outcome) => outcome,
            // The whole table was dropped without completing us; that
            // only happens when the owner is torn down.
            Err(_) => Err(Error::Cancelled),
        }
    }

    /// Park a waiter for `id` with the given deadline.
    pub async fn register(
        &self,
        id: u64,
        timeout: Duration,
    ) -> oneshot::Receiver<Result<CommandResponse>> {
        let (tx, rx) = oneshot::channel();
        let entry = PendingEntry {
            deadline: Instant::now() + timeout,
            completer: tx,
        };
        self.pending.lock().await.insert(id, entry);
        rx
    }

    /// Forget a waiter without completing it (issue-path cleanup after
    /// a failed submit).
    pub async fn remove(&self, id: u64) {
        self.pending.lock().await.remove(&id);
    }

    /// Deliver a response to its waiter. Returns false when no entry
    /// matches — a reply that raced the reaper, or a stale id from
    /// before a reconnect.
    pub async fn complete(&self, response: CommandResponse) -> bool {
        let entry = self.pending.lock().await.remove(&response.id);
        match entry {
            Some(entry) => {
                let _ = entry.completer.send(Ok(response));
                true
            }
            None => {
                debug!(id = response.id, "response for unknown request");
                false
            }
        }
    }

    /// Fail every pending request with errors from `make_err`. The
    /// table is emptied in a single critical section, so a caller
    /// retrying after the failure observes nothing in flight.
    pub async fn fail_all(&self, make_err: impl Fn() -> Error) {
        let drained: Vec<PendingEntry> = {
            let mut pending = self.pending.lock().await;
            pending.drain().map(|(_, entry)| entry).collect()
        };
        if !drained.is_empty() {
            debug!(count = drained.len(), "failing all pending requests");
        }
        for entry in drained {
            let _ = entry.completer.send(Err(make_err()));
        }
    }

    /// Complete entries past their deadline with `Timeout`. Returns how
    /// many were reaped.
    pub async fn reap_expired(&self) -> usize {
        let now = Instant::now();
        let expired: Vec<PendingEntry> = {
            let mut pending = self.pending.lock().await;
            let due: Vec<u64> = pending
                .iter()
                .filter(|(_, entry)| entry.deadline <= now)
                .map(|(id, _)| *id)
                .collect();
            due.into_iter()
                .filter_map(|id| pending.remove(&id))
                .collect()
        };
        let count = expired.len();
        for entry in expired {
            let _ = entry.completer.send(Err(Error::Timeout));
        }
        count
    }

    /// Number of requests currently in flight.
    pub async fn pending_len(&self) -> usize {
        self.pending.lock().await.len()
    }

    /// Spawn the deadline reaper; it stops when `cancel` fires.
    pub fn spawn_reaper(self: &Arc<Self>, tracker: &TaskTracker, cancel: CancellationToken) {
        let correlator = Arc::clone(self);
        tracker.spawn(async move {
            let mut tick = tokio::time::interval(REAPER_TICK);
            tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tick.tick() => {
                        let reaped = correlator.reap_expired().await;
                        if reaped > 0 {
                            debug!(reaped, "requests timed out");
                        }
                    }
                }
            }
        });
    }
}

//! Publish/subscribe hub for device events and connection lifecycle
//!
//! Fan-out never blocks the publisher. Every subscriber drains its own
//! bounded queue; a subscriber that falls behind loses the oldest
//! events and its `dropped` counter records how many. Handler failures
//! stay inside the handler's task — one broken subscriber cannot stall
//! delivery to the others or unwind into the publisher.

use std::future::Future;
use std::time::{Duration, Instant};

use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, warn};

use crate::event::Event;

/// Minimum spacing between slow-subscriber warnings
const DROP_WARN_INTERVAL: Duration = Duration::from_secs(5);

/// The hub. Cheap to clone; clones publish into the same stream.
#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<Event>,
}

impl EventBus {
    /// Create a bus whose subscribers each buffer up to
    /// `subscriber_queue_size` events.
    pub fn new(subscriber_queue_size: usize) -> Self {
        let (tx, _) = broadcast::channel(subscriber_queue_size.max(1));
        Self { tx }
    }

    /// Deliver an event to every live subscriber.
    pub fn publish(&self, event: Event) {
        match self.tx.send(event) {
            Ok(n) => debug!(subscribers = n, "event published"),
            Err(_) => debug!("event published with no subscribers"),
        }
    }

    /// Subscribe to one kind, or to everything with `None`.
    pub fn subscribe(&self, kind: Option<&str>) -> Subscription {
        Subscription {
            rx: self.tx.subscribe(),
            kind: kind.map(str::to_string),
            dropped: 0,
            last_drop_warn: None,
        }
    }

    /// Spawn a task that feeds matching events to `handler`.
    ///
    /// Each invocation runs in its own task, so a panic inside the
    /// handler is logged and the subscription survives.
    pub fn subscribe_handler<F, Fut>(
        &self,
        kind: Option<&str>,
        handler: F,
        tracker: &TaskTracker,
        cancel: CancellationToken,
    ) where
        F: Fn(Event) -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let mut subscription = self.subscribe(kind);
        tracker.spawn(async move {
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    event = subscription.recv() => {
                        let Some(event) = event else { break };
                        let kind = event.kind.clone();
                        if let Err(e) = tokio::spawn(handler(event)).await {
                            if e.is_panic() {
                                warn!(kind = %kind, "event handler panicked");
                            }
                        }
                    }
                }
            }
        });
    }
}

/// One subscriber's view of the bus.
pub struct Subscription {
    rx: broadcast::Receiver<Event>,
    kind: Option<String>,
    dropped: u64,
    last_drop_warn: Option<Instant>,
}

impl Subscription {
    /// Receive the next matching event, in publish order. Returns
    /// `None` once the bus is gone.
    pub async fn recv(&mut self) -> Option<Event> {
        loop {
            match self.rx.recv().await {
                Ok(event) => {
                    let matches = self
                        .kind
                        .as_deref()
                        .map_or(true, |kind| kind == event.kind);
                    if matches {
                        return Some(event);
                    }
                }
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    self.dropped += n;
                    let due = self
                        .last_drop_warn
                        .map_or(true, |at| at.elapsed() >= DROP_WARN_INTERVAL);
                    if due {
                        warn!(
                            missed = n,
                            total_dropped = self.dropped,
                            "subscriber too slow, oldest events dropped"
                        );
                        self.last_drop_warn = Some(Instant::now());
                    }
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }

    /// Events this subscriber lost to overflow.
    pub fn dropped(&self) -> u64 {
        self.dropped
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::kind;
    use serde_json::json;
    use std::sync::atomic::{AtomicU64, Ordering};
    use std::sync::Arc;

    fn event(kind: &str, seq: u64) -> Event {
        Event::internal(kind, json!({"seq": seq}))
    }

    // ========== Delivery ==========

    #[tokio::test]
    async fn test_publish_reaches_subscriber() {
        let bus = EventBus::new(16);
        let mut sub = bus.subscribe(None);

        bus.publish(event(kind::PI_STATUS, 1));
        let received = sub.recv().await.unwrap();
        assert_eq!(received.kind, "PiStatus");
        assert_eq!(received.payload["seq"], 1);
    }

    #[tokio::test]
    async fn test_kind_filter() {
        let bus = EventBus::new(16);
        let mut sub = bus.subscribe(Some(kind::FOCUSER_MOVE));

        bus.publish(event(kind::PI_STATUS, 1));
        bus.publish(event(kind::FOCUSER_MOVE, 2));

        let received = sub.recv().await.unwrap();
        assert_eq!(received.kind, "FocuserMove");
    }

    #[tokio::test]
    async fn test_fanout_to_multiple_subscribers() {
        let bus = EventBus::new(16);
        let mut sub_a = bus.subscribe(None);
        let mut sub_b = bus.subscribe(None);

        bus.publish(event(kind::PI_STATUS, 7));
        assert_eq!(sub_a.recv().await.unwrap().payload["seq"], 7);
        assert_eq!(sub_b.recv().await.unwrap().payload["seq"], 7);
    }

    #[tokio::test]
    async fn test_publish_with_no_subscribers_is_fine() {
        let bus = EventBus::new(16);
        bus.publish(event(kind::PI_STATUS, 1));
    }

    // ========== Ordering ==========

    #[tokio::test]
    async fn test_per_kind_order_matches_publish_order() {
        let bus = EventBus::new(16_384);
        let mut sub = bus.subscribe(Some(kind::STACKING_STATUS));

        for seq in 0..10_000u64 {
            bus.publish(event(kind::STACKING_STATUS, seq));
        }
        for expected in 0..10_000u64 {
            let received = sub.recv().await.unwrap();
            assert_eq!(received.payload["seq"], expected);
        }
    }

    // ========== Overflow ==========

    #[tokio::test]
    async fn test_slow_subscriber_drops_oldest() {
        let bus = EventBus::new(4);
        let mut sub = bus.subscribe(None);

        for seq in 0..12u64 {
            bus.publish(event(kind::PI_STATUS, seq));
        }

        // The first recv surfaces the lag, then newest events flow.
        let first = sub.recv().await.unwrap();
        assert!(first.payload["seq"].as_u64().unwrap() >= 8);
        assert!(sub.dropped() >= 8);
    }

    // ========== Handler isolation ==========

    #[tokio::test]
    async fn test_panicking_handler_stays_enrolled() {
        let bus = EventBus::new(16);
        let tracker = TaskTracker::new();
        let cancel = CancellationToken::new();
        let seen = Arc::new(AtomicU64::new(0));

        let seen_clone = Arc::clone(&seen);
        bus.subscribe_handler(
            Some(kind::PI_STATUS),
            move |event| {
                let seen = Arc::clone(&seen_clone);
                async move {
                    if event.payload["seq"] == 1 {
                        panic!("boom");
                    }
                    seen.fetch_add(1, Ordering::SeqCst);
                }
            },
            &tracker,
            cancel.clone(),
        );

        bus.publish(event(kind::PI_STATUS, 1)); // panics
        bus.publish(event(kind::PI_STATUS, 2)); // still delivered

        tokio::time::timeout(Duration::from_secs(1), async {
            while seen.load(Ordering::SeqCst) == 0 {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("handler should keep receiving after a panic");

        cancel.cancel();
        tracker.close();
        tracker.wait().await;
    }

    #[tokio::test]
    async fn test_handler_failure_does_not_affect_other_subscribers() {
        let bus = EventBus::new(16);
        let tracker = TaskTracker::new();
        let cancel = CancellationToken::new();

        bus.subscribe_handler(
            None,
            |_| async { panic!("always fails") },
            &tracker,
            cancel.clone(),
        );
        let mut healthy = bus.subscribe(None);

        bus.publish(event(kind::PI_STATUS, 1));
        let received = tokio::time::timeout(Duration::from_secs(1), healthy.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(received.payload["seq"], 1);

        cancel.cancel();
        tracker.close();
        tracker.wait().await;
    }
}

//! Cluster event facts and the multi-consumer fan-out queue.
//!
//! Two delivery mechanisms exist, layered:
//!
//! - [`EventHandler`]: a synchronous direct-dispatch seam. Each `Engine`
//!   forwards to exactly one handler (the `Cluster`), which fans out to its
//!   own ordered handler list (the API queue, the watchdog, ...).
//! - [`EventQueue`]: the bounded broadcast behind `/events` watchers. Any
//!   number of consumers may subscribe and unsubscribe; a consumer whose
//!   queue stays full past a timeout is evicted instead of blocking
//!   publication.

use crate::engine::EngineInfo;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tracing::{debug, warn};

/// Event source tag for cluster-synthesized events.
pub const CLUSTER_EVENT_SOURCE: &str = "armada";

/// Status of a cluster-synthesized event emitted when an engine is added.
pub const STATUS_ENGINE_CONNECT: &str = "engine_connect";
/// Status emitted once on the healthy-to-unhealthy edge of an engine.
pub const STATUS_ENGINE_DISCONNECT: &str = "engine_disconnect";
/// Status emitted once on the unhealthy-to-healthy edge of an engine.
pub const STATUS_ENGINE_RECONNECT: &str = "engine_reconnect";

/// An immutable cluster event.
///
/// Produced either by an engine's remote event stream (container lifecycle,
/// image pull/delete) or synthesized by the cluster itself (engine connect,
/// disconnect, reconnect).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    /// Event status (`start`, `die`, `pull`, `engine_disconnect`, ...).
    pub status: String,
    /// Subject ID (container or image ID; engine ID for synthetic events).
    pub id: String,
    /// Origin: the image name for container events, or
    /// [`CLUSTER_EVENT_SOURCE`] for cluster-synthesized events.
    pub from: String,
    /// Unix timestamp, seconds.
    pub time: i64,
    /// The engine the event concerns.
    pub engine: EngineInfo,
}

impl Event {
    /// Creates a cluster-synthesized event for `engine`.
    #[must_use]
    pub fn cluster(status: &str, engine: EngineInfo) -> Self {
        Self {
            status: status.to_string(),
            id: engine.id.clone(),
            from: CLUSTER_EVENT_SOURCE.to_string(),
            time: chrono::Utc::now().timestamp(),
            engine,
        }
    }
}

/// Synchronous event sink.
///
/// Handlers must not block: anything long-running belongs on a spawned task.
/// A handler that fails only logs; it never stops delivery to other handlers.
pub trait EventHandler: Send + Sync {
    /// Delivers one event.
    fn handle(&self, event: &Event);
}

struct Watcher {
    tx: mpsc::Sender<Event>,
    /// When the last successful delivery left the queue full. A watcher
    /// still full past the queue timeout loses the event and is evicted.
    blocked_since: Option<Instant>,
}

/// Bounded multi-consumer event broadcast.
///
/// Publishers never block: delivery to each consumer is a `try_send` into
/// that consumer's private bounded channel. Within one consumer, delivery
/// order matches publish order; no ordering is guaranteed across consumers.
pub struct EventQueue {
    watchers: Mutex<HashMap<u64, Watcher>>,
    next_id: AtomicU64,
    capacity: usize,
    timeout: Duration,
}

/// Default per-consumer queue depth.
const DEFAULT_CAPACITY: usize = 256;
/// Default time a consumer may stay saturated before eviction.
const DEFAULT_TIMEOUT: Duration = Duration::from_secs(10);

impl EventQueue {
    /// Creates a queue with default capacity and eviction timeout.
    #[must_use]
    pub fn new() -> Self {
        Self::with_options(DEFAULT_CAPACITY, DEFAULT_TIMEOUT)
    }

    /// Creates a queue with explicit per-consumer capacity and eviction
    /// timeout.
    #[must_use]
    pub fn with_options(capacity: usize, timeout: Duration) -> Self {
        Self {
            watchers: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
            capacity: capacity.max(1),
            timeout,
        }
    }

    /// Registers a new consumer.
    ///
    /// Returns the consumer's receiving channel and a handle that
    /// deregisters the consumer when cancelled or dropped.
    pub fn watch(self: &Arc<Self>) -> (mpsc::Receiver<Event>, WatchHandle) {
        let (tx, rx) = mpsc::channel(self.capacity);
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.watchers.lock().expect("watcher lock").insert(
            id,
            Watcher {
                tx,
                blocked_since: None,
            },
        );
        debug!(watcher = id, "event watcher registered");
        (
            rx,
            WatchHandle {
                queue: Arc::clone(self),
                id,
            },
        )
    }

    /// Delivers `event` to every registered consumer.
    ///
    /// A consumer whose channel has been continuously full for longer than
    /// the configured timeout is dropped (its channel is closed); this is
    /// the deliberate slow-consumer data-loss policy.
    pub fn publish(&self, event: &Event) {
        let mut watchers = self.watchers.lock().expect("watcher lock");
        let mut evict = Vec::new();

        for (id, watcher) in watchers.iter_mut() {
            match watcher.tx.try_send(event.clone()) {
                Ok(()) => {
                    // The saturation clock starts the moment a delivery
                    // fills the queue; any accepted delivery restarts it.
                    watcher.blocked_since = if watcher.tx.capacity() == 0 {
                        Some(Instant::now())
                    } else {
                        None
                    };
                }
                Err(mpsc::error::TrySendError::Full(_)) => {
                    let since = *watcher.blocked_since.get_or_insert_with(Instant::now);
                    if since.elapsed() >= self.timeout {
                        evict.push(*id);
                    }
                }
                Err(mpsc::error::TrySendError::Closed(_)) => evict.push(*id),
            }
        }

        for id in evict {
            watchers.remove(&id);
            warn!(watcher = id, "event watcher dropped (queue saturated or closed)");
        }
    }

    /// Deregisters and closes every outstanding consumer.
    pub fn close(&self) {
        self.watchers.lock().expect("watcher lock").clear();
    }

    /// Number of currently registered consumers.
    #[must_use]
    pub fn watcher_count(&self) -> usize {
        self.watchers.lock().expect("watcher lock").len()
    }

    fn deregister(&self, id: u64) {
        if self
            .watchers
            .lock()
            .expect("watcher lock")
            .remove(&id)
            .is_some()
        {
            debug!(watcher = id, "event watcher cancelled");
        }
    }
}

impl Default for EventQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl EventHandler for EventQueue {
    fn handle(&self, event: &Event) {
        self.publish(event);
    }
}

/// Cancellation handle for one [`EventQueue`] consumer.
///
/// Dropping the handle deregisters the consumer and closes its channel.
pub struct WatchHandle {
    queue: Arc<EventQueue>,
    id: u64,
}

impl WatchHandle {
    /// Explicitly deregisters the consumer.
    pub fn cancel(self) {
        // Drop does the work.
    }
}

impl Drop for WatchHandle {
    fn drop(&mut self) {
        self.queue.deregister(self.id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn engine_info() -> EngineInfo {
        EngineInfo {
            id: "engine-1".to_string(),
            name: "node-1".to_string(),
            addr: "10.0.0.1:2375".to_string(),
        }
    }

    fn event(status: &str) -> Event {
        Event::cluster(status, engine_info())
    }

    #[tokio::test]
    async fn delivers_to_all_watchers() {
        let queue = Arc::new(EventQueue::new());
        let (mut rx1, _h1) = queue.watch();
        let (mut rx2, _h2) = queue.watch();

        queue.publish(&event("start"));

        assert_eq!(rx1.recv().await.unwrap().status, "start");
        assert_eq!(rx2.recv().await.unwrap().status, "start");
    }

    #[tokio::test]
    async fn cancelled_watcher_stops_receiving() {
        let queue = Arc::new(EventQueue::new());
        let (mut rx1, h1) = queue.watch();
        let (mut rx2, _h2) = queue.watch();

        h1.cancel();
        queue.publish(&event("die"));

        // rx1's sender side is gone; the channel yields None.
        assert!(rx1.recv().await.is_none());
        assert_eq!(rx2.recv().await.unwrap().status, "die");
        assert_eq!(queue.watcher_count(), 1);
    }

    #[tokio::test]
    async fn preserves_order_per_watcher() {
        let queue = Arc::new(EventQueue::new());
        let (mut rx, _h) = queue.watch();

        for status in ["create", "start", "die"] {
            queue.publish(&event(status));
        }
        assert_eq!(rx.recv().await.unwrap().status, "create");
        assert_eq!(rx.recv().await.unwrap().status, "start");
        assert_eq!(rx.recv().await.unwrap().status, "die");
    }

    #[tokio::test]
    async fn slow_watcher_is_evicted_without_blocking_others() {
        let queue = Arc::new(EventQueue::with_options(1, Duration::from_millis(20)));
        let (slow_rx, _slow_handle) = queue.watch();
        let (mut fast_rx, _fast_handle) = queue.watch();

        // Fill the slow watcher's single-slot queue.
        queue.publish(&event("e1"));
        // Still registered: saturation only just began.
        assert_eq!(queue.watcher_count(), 2);
        // The fast watcher keeps up.
        assert_eq!(fast_rx.recv().await.unwrap().status, "e1");

        tokio::time::sleep(Duration::from_millis(40)).await;
        queue.publish(&event("e2"));

        // The slow watcher has been saturated past the timeout and is gone;
        // the fast watcher saw both events.
        assert_eq!(queue.watcher_count(), 1);
        assert_eq!(fast_rx.recv().await.unwrap().status, "e2");

        // The evicted watcher's channel still yields the buffered event,
        // then reports closure.
        let mut slow_rx = slow_rx;
        assert_eq!(slow_rx.recv().await.unwrap().status, "e1");
        assert!(slow_rx.recv().await.is_none());
    }

    #[tokio::test]
    async fn accepted_delivery_restarts_the_saturation_clock() {
        let queue = Arc::new(EventQueue::with_options(1, Duration::from_millis(20)));
        let (mut rx, _h) = queue.watch();

        queue.publish(&event("e1"));
        tokio::time::sleep(Duration::from_millis(40)).await;
        // Drained before anything needed delivering: no eviction, and the
        // next accepted event starts a fresh clock.
        assert_eq!(rx.recv().await.unwrap().status, "e1");
        queue.publish(&event("e2"));
        queue.publish(&event("e3"));

        // e3 was dropped, but the watcher has only been full an instant.
        assert_eq!(queue.watcher_count(), 1);
        assert_eq!(rx.recv().await.unwrap().status, "e2");
    }

    #[tokio::test]
    async fn close_drops_every_watcher() {
        let queue = Arc::new(EventQueue::new());
        let (mut rx1, _h1) = queue.watch();
        let (mut rx2, _h2) = queue.watch();

        queue.close();

        assert!(rx1.recv().await.is_none());
        assert!(rx2.recv().await.is_none());
        assert_eq!(queue.watcher_count(), 0);
    }
}

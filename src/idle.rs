//! Process-wide in-flight request counter and idle-shutdown signal
//! (spec section 4.8 and testable property 3).

use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tokio::sync::watch;
use tracing::{debug, info};

/// `requestStarted`/`requestFinished` bookkeeping plus a background watcher
/// that fires once when the process has been fully idle for at least
/// `threshold`. The watcher fires a single time; callers that want another
/// notification after activity resumes call `rearm`.
pub struct IdleTracker {
    in_flight: AtomicI64,
    last_activity: Mutex<Instant>,
    idle_tx: watch::Sender<bool>,
    idle_rx: watch::Receiver<bool>,
}

impl IdleTracker {
    pub fn new() -> Arc<Self> {
        let (idle_tx, idle_rx) = watch::channel(false);
        Arc::new(Self {
            in_flight: AtomicI64::new(0),
            last_activity: Mutex::new(Instant::now()),
            idle_tx,
            idle_rx,
        })
    }

    /// Call at the start of every request's HTTP phase.
    pub fn request_started(&self) {
        self.in_flight.fetch_add(1, Ordering::SeqCst);
        *self.last_activity.lock() = Instant::now();
    }

    /// Call exactly once per `request_started`, including on WebSocket
    /// hijack (spec 4.5: the HTTP phase is "done" once hijacked) and on
    /// early-return/cancellation paths. Idempotent: never goes negative.
    pub fn request_finished(&self) {
        let prev = self.in_flight.fetch_update(Ordering::SeqCst, Ordering::SeqCst, |v| {
            if v > 0 {
                Some(v - 1)
            } else {
                Some(0)
            }
        });
        let _ = prev;
        *self.last_activity.lock() = Instant::now();
    }

    pub fn in_flight_count(&self) -> i64 {
        self.in_flight.load(Ordering::SeqCst)
    }

    /// A cheap guard that calls `request_finished` on drop, so every call
    /// site (including early returns) balances its start/finish pair.
    pub fn track(self: &Arc<Self>) -> IdleGuard {
        self.request_started();
        IdleGuard { tracker: self.clone(), released: false }
    }

    fn is_idle(&self, threshold: Duration) -> bool {
        self.in_flight.load(Ordering::SeqCst) == 0
            && self.last_activity.lock().elapsed() >= threshold
    }

    /// Spawns the background watcher. Resolves the returned receiver's
    /// value to `true` exactly once, the first time the process has been
    /// idle for `threshold` continuously, checked every `poll_interval`.
    pub fn watch_for_idle(
        self: &Arc<Self>,
        threshold: Duration,
        poll_interval: Duration,
    ) -> watch::Receiver<bool> {
        let tracker = self.clone();
        let rx = self.idle_rx.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(poll_interval);
            loop {
                interval.tick().await;
                if tracker.is_idle(threshold) {
                    info!("process idle for >= {:?}, signaling idle watchers", threshold);
                    let _ = tracker.idle_tx.send(true);
                    return;
                }
                debug!(in_flight = tracker.in_flight_count(), "idle watcher tick");
            }
        });
        rx
    }
}

impl Default for IdleTracker {
    fn default() -> Self {
        let (idle_tx, idle_rx) = watch::channel(false);
        Self {
            in_flight: AtomicI64::new(0),
            last_activity: Mutex::new(Instant::now()),
            idle_tx,
            idle_rx,
        }
    }
}

/// RAII guard pairing one `request_started` with exactly one
/// `request_finished`, even across early returns inside the pipeline.
pub struct IdleGuard {
    tracker: Arc<IdleTracker>,
    released: bool,
}

impl IdleGuard {
    /// Release the debit early (WebSocket hijack: spec 4.5 says the HTTP
    /// phase ends the moment the connection is hijacked).
    pub fn release(mut self) {
        self.released = true;
        self.tracker.request_finished();
    }
}

impl Drop for IdleGuard {
    fn drop(&mut self) {
        if !self.released {
            self.tracker.request_finished();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counter_never_goes_negative() {
        let tracker = IdleTracker::new();
        tracker.request_finished();
        tracker.request_finished();
        assert_eq!(tracker.in_flight_count(), 0);
    }

    #[test]
    fn start_finish_pairs_balance() {
        let tracker = IdleTracker::new();
        tracker.request_started();
        tracker.request_started();
        assert_eq!(tracker.in_flight_count(), 2);
        tracker.request_finished();
        assert_eq!(tracker.in_flight_count(), 1);
        tracker.request_finished();
        assert_eq!(tracker.in_flight_count(), 0);
    }

    #[test]
    fn guard_releases_on_drop() {
        let tracker = IdleTracker::new();
        {
            let _guard = tracker.track();
            assert_eq!(tracker.in_flight_count(), 1);
        }
        assert_eq!(tracker.in_flight_count(), 0);
    }

    #[test]
    fn guard_release_is_idempotent_with_drop() {
        let tracker = IdleTracker::new();
        let guard = tracker.track();
        assert_eq!(tracker.in_flight_count(), 1);
        guard.release();
        assert_eq!(tracker.in_flight_count(), 0);
    }

    #[tokio::test]
    async fn watcher_fires_after_threshold_once_idle() {
        let tracker = IdleTracker::new();
        let mut rx = tracker.watch_for_idle(Duration::from_millis(20), Duration::from_millis(5));
        tokio::time::timeout(Duration::from_secs(1), async {
            loop {
                rx.changed().await.unwrap();
                if *rx.borrow() {
                    break;
                }
            }
        })
        .await
        .expect("idle signal should fire");
    }
}

//! Accrual failure detector.
//!
//! Heartbeat arrivals per peer feed a bounded window of inter-arrival
//! intervals; `phi = elapsed_since_last / mean_interval` grows without
//! bound as a peer stays silent, and crossing the scaled convict
//! threshold fans out to every registered listener.

use dashmap::DashMap;
use parking_lot::RwLock;
use std::collections::VecDeque;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use tempest_common::prelude::*;
use tracing::{debug, trace, warn};

/// Scaling applied to raw phi before comparing against the convict
/// threshold; 1 / ln(10), so the threshold reads in decades.
pub const PHI_FACTOR: f64 = 0.434_294_481_903_251_8;

/// Receives convictions. Implementations must be idempotent: the
/// detector may convict the same silent peer on consecutive sweeps
/// until a listener resets its state.
pub trait FailureDetectionEventListener: Send + Sync {
    fn convict(&self, endpoint: SocketAddr, phi: f64);
}

/// Bounded sliding window of inter-arrival intervals with a running
/// sum, so the mean is O(1).
#[derive(Debug)]
struct ArrivalWindow {
    intervals: VecDeque<i64>,
    sum: i64,
    capacity: usize,
    last_nanos: Option<i64>,
}

impl ArrivalWindow {
    fn new(capacity: usize) -> Self {
        Self {
            intervals: VecDeque::with_capacity(capacity),
            sum: 0,
            capacity,
            last_nanos: None,
        }
    }

    fn push(&mut self, interval: i64) {
        if self.intervals.len() == self.capacity {
            if let Some(evicted) = self.intervals.pop_front() {
                self.sum -= evicted;
            }
        }
        self.intervals.push_back(interval);
        self.sum += interval;
    }

    fn add(&mut self, now: i64, initial_interval: i64, max_interval: i64) {
        match self.last_nanos {
            None => {
                // first arrival: seed a generous interval instead of a
                // degenerate sample
                self.push(initial_interval);
            }
            Some(last) => {
                let interval = now - last;
                if interval <= max_interval {
                    self.push(interval);
                } else {
                    trace!(interval_nanos = interval, "discarding pathological inter-arrival sample");
                }
            }
        }
        self.last_nanos = Some(now);
    }

    fn mean(&self) -> f64 {
        debug_assert!(!self.intervals.is_empty());
        self.sum as f64 / self.intervals.len() as f64
    }

    fn phi(&self, now: i64) -> f64 {
        match self.last_nanos {
            Some(last) if !self.intervals.is_empty() => (now - last) as f64 / self.mean(),
            _ => 0.0,
        }
    }

    fn is_empty(&self) -> bool {
        self.intervals.is_empty()
    }
}

/// Phi-accrual failure detector.
///
/// Unknown peers are no-ops everywhere except `report`, which is the
/// only entry point that creates state.
pub struct FailureDetector {
    windows: DashMap<SocketAddr, ArrivalWindow>,
    listeners: RwLock<Vec<Arc<dyn FailureDetectionEventListener>>>,
    config: FailureDetectorConfig,
    initial_interval_nanos: i64,
    max_interval_nanos: i64,
    max_local_pause_nanos: i64,
    /// Monotonic nanos of the previous interpret call; 0 before the first.
    last_interpret: AtomicI64,
    /// Monotonic nanos at which the last local pause was detected.
    last_paused: AtomicI64,
}

impl FailureDetector {
    pub fn new(config: FailureDetectorConfig) -> Self {
        Self {
            windows: DashMap::new(),
            listeners: RwLock::new(Vec::new()),
            initial_interval_nanos: config.initial_interval.as_nanos() as i64,
            max_interval_nanos: config.max_interval.as_nanos() as i64,
            max_local_pause_nanos: config.max_local_pause.as_nanos() as i64,
            config,
            last_interpret: AtomicI64::new(0),
            last_paused: AtomicI64::new(0),
        }
    }

    pub fn register_listener(&self, listener: Arc<dyn FailureDetectionEventListener>) {
        self.listeners.write().push(listener);
    }

    pub fn unregister_listeners(&self) {
        self.listeners.write().clear();
    }

    /// Record a heartbeat arrival for a peer at monotonic time `now`.
    pub fn report(&self, endpoint: SocketAddr, now_nanos: i64) {
        trace!(%endpoint, "reporting heartbeat arrival");
        let mut window = self
            .windows
            .entry(endpoint)
            .or_insert_with(|| ArrivalWindow::new(self.config.sample_window));
        window.add(now_nanos, self.initial_interval_nanos, self.max_interval_nanos);
    }

    /// Evaluate a peer's suspicion level and convict if warranted.
    ///
    /// A large gap since the previous interpret call means the local
    /// process paused (not that peers failed); convictions are
    /// suppressed for the pause window rather than mass-fired.
    pub fn interpret(&self, endpoint: SocketAddr, now_nanos: i64) {
        let last = self.last_interpret.swap(now_nanos, Ordering::SeqCst);
        if last > 0 && now_nanos - last > self.max_local_pause_nanos {
            warn!(
                gap_ms = (now_nanos - last) / 1_000_000,
                "local pause detected, suppressing failure detection"
            );
            self.last_paused.store(now_nanos, Ordering::SeqCst);
            return;
        }
        let paused_at = self.last_paused.load(Ordering::SeqCst);
        if paused_at > 0 && now_nanos - paused_at < self.max_local_pause_nanos {
            debug!(%endpoint, "still in local-pause cooldown, skipping interpret");
            return;
        }

        let phi = {
            let Some(window) = self.windows.get(&endpoint) else {
                return;
            };
            if window.is_empty() {
                return;
            }
            window.phi(now_nanos)
        };

        if phi * PHI_FACTOR > self.config.phi_convict_threshold {
            trace!(%endpoint, phi, "phi crossed convict threshold");
            // window guard dropped above: listeners may call back into
            // remove() for the same endpoint
            for listener in self.listeners.read().iter() {
                listener.convict(endpoint, phi);
            }
        }
    }

    /// Raw phi for diagnostics; `None` for unknown or sample-less peers.
    pub fn phi(&self, endpoint: SocketAddr, now_nanos: i64) -> Option<f64> {
        let window = self.windows.get(&endpoint)?;
        if window.is_empty() {
            return None;
        }
        Some(window.phi(now_nanos))
    }

    /// Drop all arrival state for a peer (restart detected or evicted).
    pub fn remove(&self, endpoint: SocketAddr) {
        self.windows.remove(&endpoint);
    }

    /// Administrative override: convict regardless of phi.
    pub fn force_conviction(&self, endpoint: SocketAddr) {
        debug!(%endpoint, "forcing conviction");
        for listener in self.listeners.read().iter() {
            listener.convict(endpoint, self.config.phi_convict_threshold);
        }
    }

    pub fn is_monitoring(&self, endpoint: SocketAddr) -> bool {
        self.windows.contains_key(&endpoint)
    }
}

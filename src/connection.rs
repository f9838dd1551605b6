use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

/// Warn once active tunnels pass this share of the cap (percent).
const BACKLOG_PERCENT: usize = 75;

/// Counts live tunnels against a fixed cap.
#[derive(Debug)]
pub struct TunnelTracker {
    active: AtomicUsize,
    max: usize,
    next_id: AtomicUsize,
}

impl TunnelTracker {
    pub fn new(max: usize) -> Arc<Self> {
        Arc::new(Self {
            active: AtomicUsize::new(0),
            max,
            next_id: AtomicUsize::new(0),
        })
    }

    /// Process-unique tunnel number for log lines, starting at 1.
    pub fn next_tunnel_id(&self) -> usize {
        self.next_id.fetch_add(1, Ordering::Relaxed) + 1
    }

    /// Get the current active tunnel count
    pub fn active_count(&self) -> usize {
        self.active.load(Ordering::Relaxed)
    }

    pub fn is_backlog_threshold_exceeded(&self) -> bool {
        self.active_count() * 100 > self.max * BACKLOG_PERCENT
    }
}

/// RAII guard to ensure the tunnel count is properly decremented
#[derive(Debug)]
pub struct ConnectionGuard {
    tracker: Arc<TunnelTracker>,
    decremented: bool,
}

impl ConnectionGuard {
    /// Attempt to take a tunnel slot.
    ///
    /// Returns `None` if acquiring a new slot would exceed the tracker's cap.
    pub fn try_new(tracker: &Arc<TunnelTracker>) -> Option<Self> {
        let mut current = tracker.active.load(Ordering::Relaxed);

        loop {
            if current >= tracker.max {
                return None;
            }

            match tracker.active.compare_exchange_weak(
                current,
                current + 1,
                Ordering::AcqRel,
                Ordering::Relaxed,
            ) {
                Ok(_) => {
                    return Some(Self {
                        tracker: Arc::clone(tracker),
                        decremented: false,
                    })
                }
                Err(observed) => current = observed,
            }
        }
    }

    /// Manually decrement the tunnel counter
    pub fn decrement(&mut self) {
        if !self.decremented {
            self.tracker.active.fetch_sub(1, Ordering::Relaxed);
            self.decremented = true;
        }
    }
}

impl Drop for ConnectionGuard {
    fn drop(&mut self) {
        self.decrement();
    }
}

/// Whether every backend listener currently accepts connections.
///
/// Written only by the supervisor: set once per run after the readiness
/// probe succeeds, cleared when the child exits.
#[derive(Debug, Default)]
pub struct BackendHealth {
    ready: AtomicBool,
}

impl BackendHealth {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn is_ready(&self) -> bool {
        self.ready.load(Ordering::Acquire)
    }

    pub(crate) fn set_ready(&self, ready: bool) {
        self.ready.store(ready, Ordering::Release);
    }
}

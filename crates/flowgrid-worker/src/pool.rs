//! Idle tracking for the worker's exec pool.
//!
//! The pool counts live execs and remembers when it last went idle.
//! [`Pool::stop_if_idle_for`] is the single decision point for both
//! the periodic self-termination check and the image-install
//! handler's idleness gate; once it fires, the pool refuses new work.

use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use flow_core::Resources;

struct Inner {
    busy: usize,
    idle_since: Instant,
    stopped: bool,
}

/// The worker's exec pool, reduced to its admission and idleness
/// surface.
pub struct Pool {
    resources: Resources,
    inner: Mutex<Inner>,
}

impl Pool {
    pub fn new(resources: Resources) -> Arc<Self> {
        Arc::new(Pool {
            resources,
            inner: Mutex::new(Inner {
                busy: 0,
                idle_since: Instant::now(),
                stopped: false,
            }),
        })
    }

    /// The pool's total resources.
    pub fn resources(&self) -> &Resources {
        &self.resources
    }

    /// Begin an exec. Returns `None` once the pool has stopped.
    pub fn begin(self: &Arc<Self>) -> Option<ExecGuard> {
        let mut inner = self.inner.lock().unwrap();
        if inner.stopped {
            return None;
        }
        inner.busy += 1;
        Some(ExecGuard {
            pool: Arc::clone(self),
        })
    }

    /// Stop the pool iff it has no live execs and has been idle for
    /// at least `expiry`. Returns whether the pool is (now) stopped.
    pub fn stop_if_idle_for(&self, expiry: Duration) -> bool {
        let mut inner = self.inner.lock().unwrap();
        if inner.stopped {
            return true;
        }
        if inner.busy == 0 && inner.idle_since.elapsed() >= expiry {
            inner.stopped = true;
        }
        inner.stopped
    }

    pub fn busy(&self) -> usize {
        self.inner.lock().unwrap().busy
    }

    pub fn stopped(&self) -> bool {
        self.inner.lock().unwrap().stopped
    }

    fn end(&self) {
        let mut inner = self.inner.lock().unwrap();
        inner.busy -= 1;
        if inner.busy == 0 {
            inner.idle_since = Instant::now();
        }
    }
}

/// Releases its exec slot on drop.
pub struct ExecGuard {
    pool: Arc<Pool>,
}

impl Drop for ExecGuard {
    fn drop(&mut self) {
        self.pool.end();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn busy_pool_never_stops() {
        let pool = Pool::new(Resources::new());
        let _guard = pool.begin().unwrap();
        assert!(!pool.stop_if_idle_for(Duration::ZERO));
        assert!(!pool.stopped());
    }

    #[test]
    fn idle_pool_stops_immediately_with_zero_expiry() {
        let pool = Pool::new(Resources::new());
        assert!(pool.stop_if_idle_for(Duration::ZERO));
        assert!(pool.stopped());
        // A stopped pool refuses new work.
        assert!(pool.begin().is_none());
    }

    #[test]
    fn expiry_counts_from_last_idle_transition() {
        let pool = Pool::new(Resources::new());
        {
            let _guard = pool.begin().unwrap();
        }
        // Just went idle; a one-hour expiry cannot have elapsed.
        assert!(!pool.stop_if_idle_for(Duration::from_secs(3600)));

        std::thread::sleep(Duration::from_millis(30));
        assert!(pool.stop_if_idle_for(Duration::from_millis(10)));
    }

    #[test]
    fn stop_is_sticky() {
        let pool = Pool::new(Resources::new());
        assert!(pool.stop_if_idle_for(Duration::ZERO));
        // Subsequent checks report stopped regardless of expiry.
        assert!(pool.stop_if_idle_for(Duration::from_secs(3600)));
    }

    #[test]
    fn guards_track_busy_count() {
        let pool = Pool::new(Resources::new());
        let a = pool.begin().unwrap();
        let b = pool.begin().unwrap();
        assert_eq!(pool.busy(), 2);
        drop(a);
        assert_eq!(pool.busy(), 1);
        drop(b);
        assert_eq!(pool.busy(), 0);
    }
}

use std::sync::atomic::{AtomicI64, Ordering};

/// Adaptive estimate of the filesystem's mtime granularity in milliseconds.
///
/// Starts at the coarsest value and tightens monotonically as observed mtimes
/// rule out coarser granularities. One estimator per `FileSystemInfo`
/// instance rather than per process, so tests and independent caches don't
/// interfere with each other.
#[derive(Debug)]
pub struct AccuracyEstimator {
    millis: AtomicI64,
}

pub(crate) const INITIAL_ACCURACY_MS: i64 = 2000;

impl AccuracyEstimator {
    pub fn new() -> Self {
        Self {
            millis: AtomicI64::new(INITIAL_ACCURACY_MS),
        }
    }

    /// Current estimate; one of `{1, 10, 100, 1000, 2000}`.
    pub fn millis(&self) -> i64 {
        self.millis.load(Ordering::Relaxed)
    }

    /// Tighten the estimate from an observed nonzero mtime.
    pub fn observe(&self, mtime_ms: i64) {
        if mtime_ms == 0 {
            return;
        }
        loop {
            let current = self.millis.load(Ordering::Relaxed);
            let tightened = Self::tighten(current, mtime_ms);
            if tightened >= current {
                return;
            }
            if self
                .millis
                .compare_exchange(current, tightened, Ordering::Relaxed, Ordering::Relaxed)
                .is_ok()
            {
                return;
            }
        }
    }

    fn tighten(current: i64, mtime_ms: i64) -> i64 {
        if current > 1 && mtime_ms % 2 != 0 {
            1
        } else if current > 10 && mtime_ms % 20 != 0 {
            10
        } else if current > 100 && mtime_ms % 200 != 0 {
            100
        } else if current > 1000 && mtime_ms % 2000 != 0 {
            1000
        } else {
            current
        }
    }
}

impl Default for AccuracyEstimator {
    fn default() -> Self {
        Self::new()
    }
}

use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;

/// Exponential moving average of per-interval event counts.
///
/// `increment` is lock free and may be called from any thread; intervals are
/// closed by a single evaluator with `start_new_interval`.
#[derive(Debug)]
pub struct ExponentialMovingAverageCounter {
    ratio: f64,
    current: AtomicU64,
    average: Mutex<Option<f64>>,
}

impl ExponentialMovingAverageCounter {
    /// `ratio` is the weight of the most recent interval.
    pub fn new(ratio: f64) -> Self {
        Self {
            ratio,
            current: AtomicU64::new(0),
            average: Mutex::new(None),
        }
    }

    pub fn ratio(&self) -> f64 {
        self.ratio
    }

    pub fn increment(&self) -> u64 {
        self.current.fetch_add(1, Ordering::Relaxed) + 1
    }

    /// The smoothed count per interval, or the raw running count before the
    /// first interval closed.
    pub fn average(&self) -> f64 {
        match *self.average.lock() {
            Some(average) => average,
            None => self.current.load(Ordering::Relaxed) as f64,
        }
    }

    /// Folds the current interval into the average and returns the new average.
    pub fn start_new_interval(&self) -> f64 {
        let count = self.current.swap(0, Ordering::Relaxed) as f64;
        let mut average = self.average.lock();
        let next = match *average {
            Some(previous) => previous * (1.0 - self.ratio) + count * self.ratio,
            None => count,
        };
        *average = Some(next);
        next
    }

    /// Forgets all history.
    pub fn reset(&self) {
        let mut average = self.average.lock();
        *average = None;
        self.current.store(0, Ordering::Relaxed);
    }
}

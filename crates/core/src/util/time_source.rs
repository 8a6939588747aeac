use std::time::Instant;

#[cfg(test)]
use std::{sync::Arc, time::Duration};

pub trait TimeSource: Send + Sync {
    fn now(&self) -> Instant;
}

/// A simple time source that returns the current time using `Instant::now()`.
#[derive(Clone, Copy, Default)]
pub struct InstantTimeSrc(());

impl InstantTimeSrc {
    pub fn new() -> Self {
        InstantTimeSrc(())
    }
}

impl TimeSource for InstantTimeSrc {
    fn now(&self) -> Instant {
        Instant::now()
    }
}

/// A manually advanced clock. Clones share the same current instant, so a
/// test can keep one handle and hand another to the component under test.
#[cfg(test)]
#[derive(Clone)]
pub struct MockTimeSource {
    current_instant: Arc<parking_lot::Mutex<Instant>>,
}

#[cfg(test)]
impl MockTimeSource {
    pub fn new(start_instant: Instant) -> Self {
        MockTimeSource {
            current_instant: Arc::new(parking_lot::Mutex::new(start_instant)),
        }
    }

    pub fn advance_time(&self, duration: Duration) {
        *self.current_instant.lock() += duration;
    }
}

#[cfg(test)]
impl TimeSource for MockTimeSource {
    fn now(&self) -> Instant {
        *self.current_instant.lock()
    }
}

pub(crate) mod time_source;

use std::{future::Future, time::Duration};

use parking_lot::Mutex;
use tokio::task::JoinHandle;

use crate::config::GlobalExecutor;

pub use time_source::{InstantTimeSrc, TimeSource};

/// A restartable, single-shot delayed task.
///
/// Only the most recently scheduled run is honored: starting the timer again,
/// or cancelling it, aborts the pending one. Cancellation only ever interrupts
/// the wait; once the delay elapsed the callback runs detached to completion.
pub struct TaskTimer {
    delay: Mutex<Duration>,
    pending: Mutex<Option<JoinHandle<()>>>,
}

impl TaskTimer {
    pub fn new(delay: Duration) -> Self {
        Self {
            delay: Mutex::new(delay),
            pending: Mutex::new(None),
        }
    }

    pub fn delay(&self) -> Duration {
        *self.delay.lock()
    }

    /// Takes effect on the next `start`.
    pub fn set_delay(&self, delay: Duration) {
        *self.delay.lock() = delay;
    }

    pub fn is_started(&self) -> bool {
        self.pending
            .lock()
            .as_ref()
            .is_some_and(|handle| !handle.is_finished())
    }

    pub fn start<F, Fut>(&self, elapsed: F)
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let delay = self.delay();
        let mut pending = self.pending.lock();
        let handle = GlobalExecutor::spawn(async move {
            tokio::time::sleep(delay).await;
            GlobalExecutor::spawn(elapsed());
        });
        if let Some(previous) = pending.replace(handle) {
            previous.abort();
        }
    }

    pub fn cancel(&self) {
        if let Some(handle) = self.pending.lock().take() {
            handle.abort();
        }
    }
}

impl Drop for TaskTimer {
    fn drop(&mut self) {
        self.cancel();
    }
}

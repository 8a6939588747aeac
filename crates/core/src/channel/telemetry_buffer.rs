use std::{
    sync::{
        atomic::{AtomicBool, AtomicUsize, Ordering},
        Arc, Weak,
    },
    time::Duration,
};

use futures::future::BoxFuture;
use parking_lot::Mutex;
use tokio::task::JoinHandle;

use crate::{
    config::{
        GlobalExecutor, DEFAULT_BACKLOG_SIZE, DEFAULT_MAX_TRANSMISSION_DELAY,
        DEFAULT_TELEMETRY_BUFFER_CAPACITY,
    },
    diagnostics::{DiagnosticEvent, SharedDiagnostics},
    item::{TelemetryItem, TelemetryProcessor},
    util::TaskTimer,
    ChannelError,
};

/// Receives every batch the buffer lets go of.
pub type FlushHandler = Arc<dyn Fn(Vec<TelemetryItem>) -> BoxFuture<'static, ()> + Send + Sync>;

/// Accumulates telemetry items and hands them off in batches, either when
/// `capacity` items are pending or `max_transmission_delay` after the first
/// item of a batch arrived.
///
/// The lock is only held to append or swap out the pending list; batches are
/// always handed off outside of it.
pub struct TelemetryBuffer {
    items: Mutex<Vec<TelemetryItem>>,
    capacity: AtomicUsize,
    backlog_size: AtomicUsize,
    backlog_full_reported: AtomicBool,
    stopping: AtomicBool,
    flush_timer: TaskTimer,
    in_flight: Mutex<Vec<JoinHandle<()>>>,
    on_flush: FlushHandler,
    diagnostics: SharedDiagnostics,
    this: Weak<Self>,
}

impl TelemetryBuffer {
    pub fn new(on_flush: FlushHandler, diagnostics: SharedDiagnostics) -> Arc<Self> {
        Arc::new_cyclic(|this| Self {
            items: Mutex::new(Vec::new()),
            capacity: AtomicUsize::new(DEFAULT_TELEMETRY_BUFFER_CAPACITY),
            backlog_size: AtomicUsize::new(DEFAULT_BACKLOG_SIZE),
            backlog_full_reported: AtomicBool::new(false),
            stopping: AtomicBool::new(false),
            flush_timer: TaskTimer::new(DEFAULT_MAX_TRANSMISSION_DELAY),
            in_flight: Mutex::new(Vec::new()),
            on_flush,
            diagnostics,
            this: this.clone(),
        })
    }

    pub fn capacity(&self) -> usize {
        self.capacity.load(Ordering::SeqCst)
    }

    /// Number of pending items that triggers a flush. Must be positive and
    /// not above the backlog size.
    pub fn set_capacity(&self, capacity: usize) -> Result<(), ChannelError> {
        if capacity == 0 {
            return Err(ChannelError::invalid_argument(
                "capacity",
                "must be greater than zero",
            ));
        }
        let backlog_size = self.backlog_size();
        if capacity > backlog_size {
            return Err(ChannelError::invalid_argument(
                "capacity",
                format!("{capacity} is above the backlog size {backlog_size}"),
            ));
        }
        self.capacity.store(capacity, Ordering::SeqCst);
        Ok(())
    }

    pub fn backlog_size(&self) -> usize {
        self.backlog_size.load(Ordering::SeqCst)
    }

    /// Hard limit on pending items; anything beyond it is dropped.
    pub fn set_backlog_size(&self, backlog_size: usize) -> Result<(), ChannelError> {
        let capacity = self.capacity();
        if backlog_size < capacity {
            return Err(ChannelError::invalid_argument(
                "backlog_size",
                format!("{backlog_size} is below the capacity {capacity}"),
            ));
        }
        self.backlog_size.store(backlog_size, Ordering::SeqCst);
        Ok(())
    }

    pub fn max_transmission_delay(&self) -> Duration {
        self.flush_timer.delay()
    }

    pub fn set_max_transmission_delay(&self, delay: Duration) {
        self.flush_timer.set_delay(delay);
    }

    pub fn len(&self) -> usize {
        self.items.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.lock().is_empty()
    }

    /// Flushes whatever is pending and waits until the batch was handed off.
    pub async fn flush(&self) {
        self.flush_timer.cancel();
        let batch = self.take_all();
        if batch.is_empty() {
            return;
        }
        (self.on_flush)(batch).await;
    }

    /// Stops scheduling flushes, then flushes and waits for every batch
    /// still being handed off.
    pub async fn stop(&self) {
        self.stopping.store(true, Ordering::SeqCst);
        self.flush().await;
        let in_flight = std::mem::take(&mut *self.in_flight.lock());
        for handle in in_flight {
            if let Err(error) = handle.await {
                tracing::warn!(%error, "Telemetry flush task failed");
            }
        }
    }

    fn take_all(&self) -> Vec<TelemetryItem> {
        let batch = std::mem::take(&mut *self.items.lock());
        self.backlog_full_reported.store(false, Ordering::SeqCst);
        batch
    }

    fn start_flush_timer(&self) {
        let this = self.this.clone();
        self.flush_timer.start(move || async move {
            if let Some(buffer) = this.upgrade() {
                buffer.dispatch_pending();
            }
        });
    }

    /// Hands off whatever is pending as a tracked task. Once stopping, `stop`
    /// owns the final flush.
    fn dispatch_pending(&self) {
        if self.stopping.load(Ordering::SeqCst) {
            return;
        }
        // Held across the swap so `stop` either sees this task or finds the
        // items still pending.
        let mut in_flight = self.in_flight.lock();
        let batch = self.take_all();
        if batch.is_empty() {
            return;
        }
        in_flight.retain(|handle| !handle.is_finished());
        in_flight.push(GlobalExecutor::spawn((self.on_flush)(batch)));
    }

    fn dispatch(&self, batch: Vec<TelemetryItem>) {
        let handle = GlobalExecutor::spawn((self.on_flush)(batch));
        let mut in_flight = self.in_flight.lock();
        in_flight.retain(|handle| !handle.is_finished());
        in_flight.push(handle);
    }
}

impl TelemetryProcessor for TelemetryBuffer {
    fn process(&self, item: TelemetryItem) {
        let stopping = self.stopping.load(Ordering::SeqCst);
        let (full_batch, first) = {
            let mut items = self.items.lock();
            let backlog_size = self.backlog_size();
            if items.len() >= backlog_size {
                drop(items);
                if !self.backlog_full_reported.swap(true, Ordering::SeqCst) {
                    self.diagnostics
                        .report(DiagnosticEvent::ItemDroppedBacklogFull { backlog_size });
                }
                return;
            }
            items.push(item);
            let first = items.len() == 1;
            if !stopping && items.len() >= self.capacity() {
                (Some(std::mem::take(&mut *items)), first)
            } else {
                (None, first)
            }
        };

        match full_batch {
            Some(batch) => {
                self.flush_timer.cancel();
                self.backlog_full_reported.store(false, Ordering::SeqCst);
                self.dispatch(batch);
            }
            None if first && !stopping => self.start_flush_timer(),
            None => {}
        }
    }
}

use std::sync::{
    atomic::{AtomicUsize, Ordering},
    Arc,
};

use tokio::sync::mpsc;

use super::{Transmission, TransmissionProcessed, Transport};
use crate::{
    config::{GlobalExecutor, DEFAULT_SENDER_CAPACITY},
    diagnostics::{DiagnosticEvent, SharedDiagnostics},
};

/// Bounded-concurrency network dispatcher.
///
/// At most `capacity` attempts are in flight. A slot is reserved on the
/// calling thread; building the transmission and the attempt itself happen on
/// a background task. Every completed attempt is published on the event
/// channel after its slot was released.
pub struct TransmissionSender {
    capacity: AtomicUsize,
    in_flight: Arc<AtomicUsize>,
    transport: Arc<dyn Transport>,
    events: mpsc::UnboundedSender<TransmissionProcessed>,
    diagnostics: SharedDiagnostics,
}

impl TransmissionSender {
    pub fn new(
        transport: Arc<dyn Transport>,
        events: mpsc::UnboundedSender<TransmissionProcessed>,
        diagnostics: SharedDiagnostics,
    ) -> Self {
        Self {
            capacity: AtomicUsize::new(DEFAULT_SENDER_CAPACITY),
            in_flight: Arc::new(AtomicUsize::new(0)),
            transport,
            events,
            diagnostics,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity.load(Ordering::SeqCst)
    }

    /// Zero halts sending; attempts already in flight complete normally.
    pub fn set_capacity(&self, capacity: usize) {
        self.capacity.store(capacity, Ordering::SeqCst);
    }

    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::SeqCst)
    }

    pub fn available_slots(&self) -> usize {
        self.capacity().saturating_sub(self.in_flight())
    }

    fn reserve(&self) -> bool {
        let capacity = self.capacity();
        self.in_flight
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |current| {
                (current < capacity).then_some(current + 1)
            })
            .is_ok()
    }

    /// Starts sending the transmission the factory produces.
    ///
    /// Returns `false` without invoking the factory when every slot is taken.
    pub fn enqueue<F>(&self, factory: F) -> bool
    where
        F: FnOnce() -> Option<Transmission> + Send + 'static,
    {
        if !self.reserve() {
            return false;
        }

        let in_flight = self.in_flight.clone();
        let transport = self.transport.clone();
        let events = self.events.clone();
        let diagnostics = self.diagnostics.clone();
        GlobalExecutor::spawn(async move {
            let transmission = match GlobalExecutor::spawn_blocking(factory).await {
                Ok(Some(transmission)) => transmission,
                Ok(None) => {
                    in_flight.fetch_sub(1, Ordering::SeqCst);
                    return;
                }
                Err(error) => {
                    tracing::error!(%error, "Transmission factory panicked");
                    in_flight.fetch_sub(1, Ordering::SeqCst);
                    return;
                }
            };

            diagnostics.report(DiagnosticEvent::TransmissionSendStarted {
                id: transmission.id(),
            });
            let result = transport.send(&transmission).await;
            in_flight.fetch_sub(1, Ordering::SeqCst);

            let processed = match result {
                Ok(response) => {
                    diagnostics.report(DiagnosticEvent::TransmissionSent {
                        id: transmission.id(),
                        status: response.status,
                    });
                    TransmissionProcessed {
                        transmission,
                        response: Some(response),
                        error: None,
                    }
                }
                Err(error) => {
                    diagnostics.report(DiagnosticEvent::TransmissionSendFailed {
                        id: transmission.id(),
                        error: error.to_string(),
                    });
                    TransmissionProcessed {
                        transmission,
                        response: None,
                        error: Some(error),
                    }
                }
            };
            if events.send(processed).is_err() {
                tracing::debug!("Transmission outcome dropped, no listener");
            }
        });
        true
    }
}

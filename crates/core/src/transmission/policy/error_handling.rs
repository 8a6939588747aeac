use std::sync::Arc;

use super::{update, update_blocking, PolicyCapacities, TransmissionPolicy, PAUSED};
use crate::{
    transmission::{
        backoff::status, transmitter::Capacities, TransmissionProcessed, Transmitter,
    },
    util::TaskTimer,
};

const NAME: &str = "error-handling";

/// Retries transmissions that failed for transient reasons.
///
/// A retryable failure pauses sending and buffering, puts the transmission
/// back into the pipeline and lifts the pause once the backoff delay elapsed.
pub struct ErrorHandlingPolicy {
    capacities: Arc<PolicyCapacities>,
    timer: TaskTimer,
}

impl Default for ErrorHandlingPolicy {
    fn default() -> Self {
        Self::new()
    }
}

impl ErrorHandlingPolicy {
    pub fn new() -> Self {
        Self {
            capacities: Arc::new(PolicyCapacities::default()),
            timer: TaskTimer::new(Default::default()),
        }
    }
}

impl TransmissionPolicy for ErrorHandlingPolicy {
    fn name(&self) -> &'static str {
        NAME
    }

    fn capacities(&self) -> Capacities {
        self.capacities.get()
    }

    fn on_transmission_processed(
        &self,
        transmitter: &Arc<Transmitter>,
        event: &TransmissionProcessed,
    ) -> anyhow::Result<()> {
        let Some(code) = event.status_code() else {
            return Ok(());
        };
        let backoff = transmitter.backoff();

        if code == status::SUCCESS {
            backoff.record_success(code);
            backoff.report_backoff_disabled();
            return Ok(());
        }
        if !status::is_retryable(code) {
            return Ok(());
        }

        let consecutive_errors = backoff.record_failure(code);
        let delay = backoff.compute_delay(event.retry_after());
        backoff.report_backoff_enabled(code, delay);
        tracing::debug!(
            id = %event.transmission.id(),
            status = code,
            consecutive_errors,
            delay_secs = delay.as_secs(),
            "Retrying transmission after backoff"
        );

        update(transmitter, NAME, &self.capacities, PAUSED);
        transmitter.enqueue(event.transmission.clone());

        let capacities = self.capacities.clone();
        let transmitter = Arc::downgrade(transmitter);
        self.timer.set_delay(delay);
        self.timer.start(move || async move {
            if let Some(transmitter) = transmitter.upgrade() {
                update_blocking(transmitter, NAME, capacities, Capacities::UNCONSTRAINED).await;
            }
        });
        Ok(())
    }
}

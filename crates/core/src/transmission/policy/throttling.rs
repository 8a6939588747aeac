use std::sync::Arc;

use super::{update, update_blocking, PolicyCapacities, TransmissionPolicy};
use crate::{
    transmission::{
        backoff::status, transmitter::Capacities, TransmissionProcessed, Transmitter,
    },
    util::TaskTimer,
};

const NAME: &str = "throttling";

/// Honors server throttling.
///
/// 429 pauses sending until `Retry-After`. 439 additionally stops buffering
/// and storing, so nothing piles up while the quota is exhausted.
pub struct ThrottlingPolicy {
    capacities: Arc<PolicyCapacities>,
    timer: TaskTimer,
}

impl Default for ThrottlingPolicy {
    fn default() -> Self {
        Self::new()
    }
}

impl ThrottlingPolicy {
    pub fn new() -> Self {
        Self {
            capacities: Arc::new(PolicyCapacities::default()),
            timer: TaskTimer::new(Default::default()),
        }
    }
}

impl TransmissionPolicy for ThrottlingPolicy {
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
        let throttled = match event.status_code() {
            Some(status::TOO_MANY_REQUESTS) => Capacities {
                sender: Some(0),
                buffer: None,
                storage: None,
            },
            Some(status::TOO_MANY_REQUESTS_OVER_EXTENDED_TIME) => Capacities {
                sender: Some(0),
                buffer: Some(0),
                storage: Some(0),
            },
            _ => return Ok(()),
        };

        let delay = transmitter.backoff().compute_delay(event.retry_after());
        tracing::info!(
            id = %event.transmission.id(),
            status = ?event.status_code(),
            delay_secs = delay.as_secs(),
            "Throttled by the ingestion endpoint"
        );

        update(transmitter, NAME, &self.capacities, throttled);
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

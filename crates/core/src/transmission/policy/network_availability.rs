use std::sync::{Arc, Weak};

use super::{update, PolicyCapacities, TransmissionPolicy, PAUSED};
use crate::{
    config::GlobalExecutor,
    diagnostics::DiagnosticEvent,
    platform::NetworkStatus,
    transmission::{transmitter::Capacities, Transmitter},
};

const NAME: &str = "network-availability";

/// Pauses sending and buffering while the host is offline.
pub struct NetworkAvailabilityPolicy {
    network: Arc<dyn NetworkStatus>,
    capacities: PolicyCapacities,
}

impl NetworkAvailabilityPolicy {
    pub fn new(network: Arc<dyn NetworkStatus>) -> Self {
        Self {
            network,
            capacities: PolicyCapacities::default(),
        }
    }

    fn evaluate(&self, transmitter: &Transmitter) {
        let available = match self.network.is_available() {
            Ok(available) => available,
            Err(error) => {
                transmitter
                    .diagnostics()
                    .report(DiagnosticEvent::NetworkProbeFailed {
                        error: format!("{error:#}"),
                    });
                true
            }
        };
        let capacities = if available {
            Capacities::UNCONSTRAINED
        } else {
            PAUSED
        };
        update(transmitter, NAME, &self.capacities, capacities);
    }
}

impl TransmissionPolicy for NetworkAvailabilityPolicy {
    fn name(&self) -> &'static str {
        NAME
    }

    fn capacities(&self) -> Capacities {
        self.capacities.get()
    }

    fn initialize(self: Arc<Self>, transmitter: &Arc<Transmitter>) {
        let changes = self.network.subscribe();
        self.evaluate(transmitter);

        let Some(mut changes) = changes else {
            return;
        };
        let policy: Weak<Self> = Arc::downgrade(&self);
        let transmitter = Arc::downgrade(transmitter);
        GlobalExecutor::spawn(async move {
            while changes.changed().await.is_ok() {
                let (Some(policy), Some(transmitter)) = (policy.upgrade(), transmitter.upgrade())
                else {
                    break;
                };
                let evaluated =
                    GlobalExecutor::spawn_blocking(move || policy.evaluate(&transmitter));
                if let Err(error) = evaluated.await {
                    tracing::error!(%error, "Network availability evaluation failed");
                }
            }
        });
    }
}

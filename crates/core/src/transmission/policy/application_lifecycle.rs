use std::sync::Arc;

use super::{update_blocking, PolicyCapacities, TransmissionPolicy, PAUSED};
use crate::{
    platform::ApplicationLifecycle,
    transmission::{transmitter::Capacities, Transmitter},
};

const NAME: &str = "application-lifecycle";

/// Stops sending and buffering once the application is stopping, so that
/// whatever is still pending is persisted instead of lost with the process.
pub struct ApplicationLifecyclePolicy {
    lifecycle: Arc<ApplicationLifecycle>,
    capacities: Arc<PolicyCapacities>,
}

impl ApplicationLifecyclePolicy {
    pub fn new(lifecycle: Arc<ApplicationLifecycle>) -> Self {
        Self {
            lifecycle,
            capacities: Arc::new(PolicyCapacities::default()),
        }
    }
}

impl TransmissionPolicy for ApplicationLifecyclePolicy {
    fn name(&self) -> &'static str {
        NAME
    }

    fn capacities(&self) -> Capacities {
        self.capacities.get()
    }

    fn initialize(self: Arc<Self>, transmitter: &Arc<Transmitter>) {
        let capacities = self.capacities.clone();
        let transmitter = Arc::downgrade(transmitter);
        self.lifecycle.on_stopping(move || async move {
            if let Some(transmitter) = transmitter.upgrade() {
                update_blocking(transmitter, NAME, capacities, PAUSED).await;
            }
        });
    }
}

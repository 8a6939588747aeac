//! Reactive rules that observe send outcomes or the environment and limit
//! what the pipeline may do.

use std::sync::Arc;

use parking_lot::Mutex;

use super::{transmitter::Capacities, TransmissionProcessed, Transmitter};
use crate::config::GlobalExecutor;

mod application_lifecycle;
mod error_handling;
mod network_availability;
mod partial_success;
mod throttling;

pub use application_lifecycle::ApplicationLifecyclePolicy;
pub use error_handling::ErrorHandlingPolicy;
pub use network_availability::NetworkAvailabilityPolicy;
pub use partial_success::PartialSuccessPolicy;
pub use throttling::ThrottlingPolicy;

pub trait TransmissionPolicy: Send + Sync + 'static {
    fn name(&self) -> &'static str;

    /// The limits this policy currently imposes.
    fn capacities(&self) -> Capacities;

    /// Called once when the policy joins a transmitter.
    fn initialize(self: Arc<Self>, _transmitter: &Arc<Transmitter>) {}

    /// Called for every completed network attempt, before the transmitter
    /// re-applies capacities.
    fn on_transmission_processed(
        &self,
        _transmitter: &Arc<Transmitter>,
        _event: &TransmissionProcessed,
    ) -> anyhow::Result<()> {
        Ok(())
    }
}

/// The capacity triple a policy owns, shareable with its scheduled tasks.
#[derive(Debug, Default)]
pub struct PolicyCapacities(Mutex<Capacities>);

impl PolicyCapacities {
    pub fn get(&self) -> Capacities {
        *self.0.lock()
    }

    /// Returns whether the value changed.
    pub fn set(&self, capacities: Capacities) -> bool {
        let mut current = self.0.lock();
        let changed = *current != capacities;
        *current = capacities;
        changed
    }

    pub fn clear(&self) -> bool {
        self.set(Capacities::UNCONSTRAINED)
    }
}

/// Updates the policy's limits and, when they changed, has the transmitter
/// re-apply them.
pub(crate) fn update(
    transmitter: &Transmitter,
    policy: &'static str,
    capacities: &PolicyCapacities,
    new: Capacities,
) {
    if capacities.set(new) {
        transmitter.policy_changed(policy, new);
    }
}

/// [`update`] from async code. Re-applying capacities moves transmissions in
/// and out of storage, so it runs on the blocking pool.
pub(crate) async fn update_blocking(
    transmitter: Arc<Transmitter>,
    policy: &'static str,
    capacities: Arc<PolicyCapacities>,
    new: Capacities,
) {
    let applied =
        GlobalExecutor::spawn_blocking(move || update(&transmitter, policy, &capacities, new));
    if let Err(error) = applied.await {
        tracing::error!(%error, policy, "Applying policy capacities failed");
    }
}

/// Halts sending and buffering; whatever is pending lands in storage.
pub(crate) const PAUSED: Capacities = Capacities {
    sender: Some(0),
    buffer: Some(0),
    storage: None,
};

#[cfg(test)]
pub(crate) mod test {
    use std::{path::Path, time::Duration};

    use super::*;
    use crate::{
        config::ChannelConfig,
        diagnostics::test::RecordingDiagnostics,
        platform::DirectoryFolderProvider,
        transmission::{transport::test::MockTransport, HttpResponse, Transmission},
    };

    pub(crate) struct Harness {
        pub transmitter: Arc<Transmitter>,
        pub transport: Arc<MockTransport>,
        pub diagnostics: Arc<RecordingDiagnostics>,
    }

    impl Harness {
        pub fn new(dir: &Path) -> Self {
            let transport = Arc::new(MockTransport::new());
            let diagnostics = RecordingDiagnostics::shared();
            let transmitter = Transmitter::new(
                &ChannelConfig::default(),
                transport.clone(),
                Arc::new(DirectoryFolderProvider::new(dir)),
                diagnostics.clone(),
            );
            Self {
                transmitter,
                transport,
                diagnostics,
            }
        }

        /// Everything the transmitter holds that has not been sent yet.
        pub fn pending(&self) -> usize {
            let stored = usize::from(self.transmitter.storage().size() > 0);
            self.transmitter.buffer().len() + stored
        }

        pub fn processed(transmission: Transmission, response: HttpResponse) -> TransmissionProcessed {
            TransmissionProcessed {
                transmission,
                response: Some(response),
                error: None,
            }
        }
    }

    pub(crate) async fn wait_for(mut condition: impl FnMut() -> bool) {
        for _ in 0..200 {
            if condition() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("condition not reached");
    }

    #[test]
    fn test_policy_capacities_change_detection() {
        let capacities = PolicyCapacities::default();
        assert!(!capacities.clear());
        assert!(capacities.set(PAUSED));
        assert!(!capacities.set(PAUSED));
        assert!(capacities.clear());
        assert_eq!(capacities.get(), Capacities::UNCONSTRAINED);
    }
}

//! Routes transmissions through sender, buffer and storage, and keeps the
//! three capacities in line with what the policies currently allow.

use std::sync::{Arc, Weak};

use parking_lot::{Mutex, RwLock};
use tokio::sync::mpsc;

use super::{
    policy::TransmissionPolicy, BackoffLogicManager, Transmission, TransmissionBuffer,
    TransmissionProcessed, TransmissionSender, TransmissionStorage, Transport,
};
use crate::{
    config::{ChannelConfig, GlobalExecutor},
    diagnostics::{DiagnosticEvent, SharedDiagnostics},
    platform::FolderProvider,
};

/// Limits one policy places on the pipeline. `None` leaves a resource
/// unconstrained by that policy.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Capacities {
    pub sender: Option<usize>,
    pub buffer: Option<usize>,
    pub storage: Option<u64>,
}

impl Capacities {
    pub const UNCONSTRAINED: Capacities = Capacities {
        sender: None,
        buffer: None,
        storage: None,
    };
}

#[derive(Debug, Clone, Copy)]
struct Defaults {
    sender: usize,
    buffer: usize,
    storage: u64,
}

pub struct Transmitter {
    sender: TransmissionSender,
    buffer: TransmissionBuffer,
    storage: Arc<TransmissionStorage>,
    backoff: Arc<BackoffLogicManager>,
    policies: RwLock<Vec<Arc<dyn TransmissionPolicy>>>,
    defaults: Defaults,
    apply_lock: Mutex<()>,
    diagnostics: SharedDiagnostics,
}

impl Transmitter {
    /// Builds the pipeline and starts listening for send outcomes.
    pub fn new(
        config: &ChannelConfig,
        transport: Arc<dyn Transport>,
        folder_provider: Arc<dyn FolderProvider>,
        diagnostics: SharedDiagnostics,
    ) -> Arc<Self> {
        let backoff = Arc::new(BackoffLogicManager::new(diagnostics.clone()));
        Self::with_backoff(config, transport, folder_provider, backoff, diagnostics)
    }

    pub fn with_backoff(
        config: &ChannelConfig,
        transport: Arc<dyn Transport>,
        folder_provider: Arc<dyn FolderProvider>,
        backoff: Arc<BackoffLogicManager>,
        diagnostics: SharedDiagnostics,
    ) -> Arc<Self> {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let defaults = Defaults {
            sender: config.max_sender_capacity,
            buffer: config.max_transmission_buffer_capacity,
            storage: config.max_storage_capacity,
        };

        let sender = TransmissionSender::new(transport, events_tx, diagnostics.clone());
        sender.set_capacity(defaults.sender);
        let buffer = TransmissionBuffer::new();
        buffer.set_capacity(defaults.buffer);
        let storage = Arc::new(TransmissionStorage::new(folder_provider, diagnostics.clone()));
        storage.set_capacity(defaults.storage);

        let transmitter = Arc::new(Self {
            sender,
            buffer,
            storage,
            backoff,
            policies: RwLock::new(Vec::new()),
            defaults,
            apply_lock: Mutex::new(()),
            diagnostics,
        });
        GlobalExecutor::spawn(process_outcomes(Arc::downgrade(&transmitter), events_rx));
        transmitter
    }

    pub fn sender(&self) -> &TransmissionSender {
        &self.sender
    }

    pub fn buffer(&self) -> &TransmissionBuffer {
        &self.buffer
    }

    pub fn storage(&self) -> &TransmissionStorage {
        &self.storage
    }

    pub fn backoff(&self) -> &Arc<BackoffLogicManager> {
        &self.backoff
    }

    pub fn diagnostics(&self) -> &SharedDiagnostics {
        &self.diagnostics
    }

    /// Registers a policy and lets it subscribe to whatever it observes.
    pub fn add_policy(self: &Arc<Self>, policy: Arc<dyn TransmissionPolicy>) {
        self.policies.write().push(policy.clone());
        policy.initialize(self);
    }

    /// Hands a transmission to the first stage with room for it: sender,
    /// then buffer, then storage. Dropped with a diagnostic otherwise.
    pub fn enqueue(&self, transmission: Transmission) {
        let for_sender = transmission.clone();
        if self.sender.enqueue(move || Some(for_sender)) {
            return;
        }
        if self.buffer.enqueue(|| Some(transmission.clone())) {
            return;
        }
        if self.storage.enqueue(|| Some(transmission.clone())) {
            return;
        }
        self.diagnostics.report(DiagnosticEvent::TransmissionDropped {
            id: transmission.id(),
            bytes: transmission.len(),
        });
    }

    /// Effective limits: per resource, the smallest value any policy sets,
    /// or the configured default when none does.
    pub fn effective_capacities(&self) -> (usize, usize, u64) {
        let policies = self.policies.read();
        let constrained = policies.iter().map(|policy| policy.capacities());
        let (mut sender, mut buffer, mut storage) = (None::<usize>, None::<usize>, None::<u64>);
        for capacities in constrained {
            sender = min_option(sender, capacities.sender);
            buffer = min_option(buffer, capacities.buffer);
            storage = min_option(storage, capacities.storage);
        }
        (
            sender.unwrap_or(self.defaults.sender),
            buffer.unwrap_or(self.defaults.buffer),
            storage.unwrap_or(self.defaults.storage),
        )
    }

    /// Called by a policy after it changed its limits.
    pub fn policy_changed(&self, policy: &'static str, capacities: Capacities) {
        self.diagnostics
            .report(DiagnosticEvent::TransmissionPolicyCapacityChanged {
                policy,
                sender: capacities.sender,
                buffer: capacities.buffer,
                storage: capacities.storage,
            });
        self.apply_policies();
    }

    /// Pushes the effective limits to the three stages, moves whatever no
    /// longer fits into the buffer to storage, then restarts sending.
    pub fn apply_policies(&self) {
        {
            let _guard = self.apply_lock.lock();
            let (sender, buffer, storage) = self.effective_capacities();
            tracing::trace!(sender, buffer, storage, "Applying transmission capacities");
            self.sender.set_capacity(sender);
            self.buffer.set_capacity(buffer);
            self.storage.set_capacity(storage);

            let mut rejected = Vec::new();
            for transmission in self.buffer.take_excess() {
                if !self.storage.enqueue(|| Some(transmission.clone())) {
                    rejected.push(transmission);
                }
            }
            for transmission in rejected.into_iter().rev() {
                self.buffer.push_front(transmission);
            }
        }
        self.move_transmissions_and_start_sending();
    }

    /// Moves work forward: buffer to sender, storage to sender, storage to
    /// buffer.
    pub fn move_transmissions_and_start_sending(&self) {
        while self.sender.available_slots() > 0 {
            let Some(transmission) = self.buffer.dequeue() else {
                break;
            };
            let for_sender = transmission.clone();
            if !self.sender.enqueue(move || Some(for_sender)) {
                self.buffer.push_front(transmission);
                break;
            }
        }

        let mut sending_from_storage = false;
        if self.storage.size() > 0 {
            for _ in 0..self.sender.available_slots() {
                let storage = self.storage.clone();
                if !self.sender.enqueue(move || storage.dequeue()) {
                    break;
                }
                sending_from_storage = true;
            }
        }
        // Pending sender factories read from storage; the next outcome drains the rest.
        if sending_from_storage {
            return;
        }

        while self.buffer.size() < self.buffer.capacity() && self.storage.size() > 0 {
            if !self.buffer.enqueue(|| self.storage.dequeue()) {
                break;
            }
        }
    }

    fn on_transmission_processed(self: &Arc<Self>, event: TransmissionProcessed) {
        let policies = self.policies.read().clone();
        for policy in policies {
            if let Err(error) = policy.on_transmission_processed(self, &event) {
                self.diagnostics.report(DiagnosticEvent::PolicyFailure {
                    policy: policy.name(),
                    error: format!("{error:#}"),
                });
            }
        }
        self.apply_policies();
    }
}

async fn process_outcomes(
    transmitter: Weak<Transmitter>,
    mut events: mpsc::UnboundedReceiver<TransmissionProcessed>,
) {
    while let Some(event) = events.recv().await {
        let Some(transmitter) = transmitter.upgrade() else {
            break;
        };
        let processed =
            GlobalExecutor::spawn_blocking(move || transmitter.on_transmission_processed(event));
        if let Err(error) = processed.await {
            tracing::error!(%error, "Handling a transmission outcome failed");
        }
    }
    tracing::debug!("Transmission outcome listener stopped");
}

fn min_option<T: Ord>(current: Option<T>, candidate: Option<T>) -> Option<T> {
    match (current, candidate) {
        (Some(a), Some(b)) => Some(a.min(b)),
        (a, b) => a.or(b),
    }
}

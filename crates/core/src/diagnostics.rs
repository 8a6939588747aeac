//! Structured diagnostics for the delivery pipeline.
//!
//! Components never log free text about their decisions; they report a
//! [`DiagnosticEvent`] to the [`DiagnosticsSink`] they were constructed with.
//! The default sink, [`TracingDiagnostics`], forwards every event to `tracing`
//! with typed fields, so host applications see them through their usual
//! subscriber. Tests plug in a recording sink instead.

use std::{path::PathBuf, sync::Arc, time::Duration};

use crate::transmission::TransmissionId;

#[derive(Debug, Clone, PartialEq)]
pub enum DiagnosticEvent {
    ItemDroppedBacklogFull {
        backlog_size: usize,
    },
    TransmissionSendStarted {
        id: TransmissionId,
    },
    TransmissionSent {
        id: TransmissionId,
        status: u16,
    },
    TransmissionSendFailed {
        id: TransmissionId,
        error: String,
    },
    TransmissionDropped {
        id: TransmissionId,
        bytes: usize,
    },
    TransmissionPolicyCapacityChanged {
        policy: &'static str,
        sender: Option<usize>,
        buffer: Option<usize>,
        storage: Option<u64>,
    },
    BackoffEnabled {
        status: u16,
        delay: Duration,
    },
    BackoffDisabled,
    BackoffRetryAfterUnparsable {
        value: String,
    },
    StorageUnavailable,
    StorageFull {
        capacity: u64,
        size: u64,
    },
    StorageWriteFailed {
        error: String,
    },
    StorageReadFailed {
        path: PathBuf,
        error: String,
    },
    StorageFileCorrupt {
        path: PathBuf,
        error: String,
    },
    StorageFileExpired {
        path: PathBuf,
    },
    PartialSuccessUnexpectedIndex {
        index: i64,
        batch_len: usize,
    },
    PolicyFailure {
        policy: &'static str,
        error: String,
    },
    NetworkProbeFailed {
        error: String,
    },
    SamplingPercentageChanged {
        from: f64,
        to: f64,
    },
    ItemSampledOut {
        percentage: f64,
    },
}

impl DiagnosticEvent {
    pub fn name(&self) -> &'static str {
        match self {
            DiagnosticEvent::ItemDroppedBacklogFull { .. } => "item_dropped_backlog_full",
            DiagnosticEvent::TransmissionSendStarted { .. } => "transmission_send_started",
            DiagnosticEvent::TransmissionSent { .. } => "transmission_sent",
            DiagnosticEvent::TransmissionSendFailed { .. } => "transmission_send_failed",
            DiagnosticEvent::TransmissionDropped { .. } => "transmission_dropped",
            DiagnosticEvent::TransmissionPolicyCapacityChanged { .. } => {
                "transmission_policy_capacity_changed"
            }
            DiagnosticEvent::BackoffEnabled { .. } => "backoff_enabled",
            DiagnosticEvent::BackoffDisabled => "backoff_disabled",
            DiagnosticEvent::BackoffRetryAfterUnparsable { .. } => "backoff_retry_after_unparsable",
            DiagnosticEvent::StorageUnavailable => "storage_unavailable",
            DiagnosticEvent::StorageFull { .. } => "storage_full",
            DiagnosticEvent::StorageWriteFailed { .. } => "storage_write_failed",
            DiagnosticEvent::StorageReadFailed { .. } => "storage_read_failed",
            DiagnosticEvent::StorageFileCorrupt { .. } => "storage_file_corrupt",
            DiagnosticEvent::StorageFileExpired { .. } => "storage_file_expired",
            DiagnosticEvent::PartialSuccessUnexpectedIndex { .. } => {
                "partial_success_unexpected_index"
            }
            DiagnosticEvent::PolicyFailure { .. } => "policy_failure",
            DiagnosticEvent::NetworkProbeFailed { .. } => "network_probe_failed",
            DiagnosticEvent::SamplingPercentageChanged { .. } => "sampling_percentage_changed",
            DiagnosticEvent::ItemSampledOut { .. } => "item_sampled_out",
        }
    }
}

pub trait DiagnosticsSink: Send + Sync {
    fn report(&self, event: DiagnosticEvent);
}

pub type SharedDiagnostics = Arc<dyn DiagnosticsSink>;

/// Forwards diagnostic events to `tracing`.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingDiagnostics;

impl TracingDiagnostics {
    pub fn shared() -> SharedDiagnostics {
        Arc::new(TracingDiagnostics)
    }
}

impl DiagnosticsSink for TracingDiagnostics {
    fn report(&self, event: DiagnosticEvent) {
        let event_name = event.name();
        match event {
            DiagnosticEvent::ItemDroppedBacklogFull { backlog_size } => {
                tracing::warn!(event_name, backlog_size, "Telemetry item dropped, backlog is full");
            }
            DiagnosticEvent::TransmissionSendStarted { id } => {
                tracing::trace!(event_name, %id, "Transmission send started");
            }
            DiagnosticEvent::TransmissionSent { id, status } => {
                tracing::debug!(event_name, %id, status, "Transmission sent");
            }
            DiagnosticEvent::TransmissionSendFailed { id, error } => {
                tracing::warn!(event_name, %id, %error, "Transmission send failed");
            }
            DiagnosticEvent::TransmissionDropped { id, bytes } => {
                tracing::warn!(event_name, %id, bytes, "Transmission dropped, no stage had capacity");
            }
            DiagnosticEvent::TransmissionPolicyCapacityChanged {
                policy,
                sender,
                buffer,
                storage,
            } => {
                tracing::info!(
                    event_name,
                    policy,
                    ?sender,
                    ?buffer,
                    ?storage,
                    "Transmission policy changed capacity"
                );
            }
            DiagnosticEvent::BackoffEnabled { status, delay } => {
                tracing::warn!(
                    event_name,
                    status,
                    delay_secs = delay.as_secs(),
                    "Exponential backoff enabled"
                );
            }
            DiagnosticEvent::BackoffDisabled => {
                tracing::info!(event_name, "Exponential backoff disabled");
            }
            DiagnosticEvent::BackoffRetryAfterUnparsable { value } => {
                tracing::debug!(event_name, %value, "Ignoring unparsable Retry-After header");
            }
            DiagnosticEvent::StorageUnavailable => {
                tracing::warn!(event_name, "Transmission storage folder is unavailable");
            }
            DiagnosticEvent::StorageFull { capacity, size } => {
                tracing::debug!(event_name, capacity, size, "Transmission storage is full");
            }
            DiagnosticEvent::StorageWriteFailed { error } => {
                tracing::warn!(event_name, %error, "Failed to persist transmission");
            }
            DiagnosticEvent::StorageReadFailed { path, error } => {
                tracing::warn!(event_name, ?path, %error, "Failed reading transmission file, kept for a later attempt");
            }
            DiagnosticEvent::StorageFileCorrupt { path, error } => {
                tracing::warn!(event_name, ?path, %error, "Deleted unreadable transmission file");
            }
            DiagnosticEvent::StorageFileExpired { path } => {
                tracing::info!(event_name, ?path, "Deleted expired transmission file");
            }
            DiagnosticEvent::PartialSuccessUnexpectedIndex { index, batch_len } => {
                tracing::warn!(
                    event_name,
                    index,
                    batch_len,
                    "Partial success response references an item outside the batch"
                );
            }
            DiagnosticEvent::PolicyFailure { policy, error } => {
                tracing::error!(event_name, policy, %error, "Transmission policy failed");
            }
            DiagnosticEvent::NetworkProbeFailed { error } => {
                tracing::warn!(
                    event_name,
                    %error,
                    "Network availability probe failed, assuming the network is available"
                );
            }
            DiagnosticEvent::SamplingPercentageChanged { from, to } => {
                tracing::info!(event_name, from, to, "Sampling percentage changed");
            }
            DiagnosticEvent::ItemSampledOut { percentage } => {
                tracing::trace!(event_name, percentage, "Telemetry item sampled out");
            }
        }
    }
}

#[cfg(feature = "trace")]
pub use tracer::init_tracer;

#[cfg(feature = "trace")]
pub mod tracer {
    use tracing::level_filters::LevelFilter;
    use tracing_subscriber::{layer::SubscriberExt, Layer, Registry};

    /// Installs a global `tracing` subscriber for host applications that do
    /// not configure their own.
    ///
    /// `RUST_LOG` overrides `level`; `TELEMETRY_CHANNEL_LOG_FORMAT=json`
    /// switches to JSON output.
    pub fn init_tracer(level: Option<LevelFilter>) -> anyhow::Result<()> {
        let default_filter = if cfg!(any(test, debug_assertions)) {
            LevelFilter::DEBUG
        } else {
            LevelFilter::INFO
        };
        let default_filter = level.unwrap_or(default_filter);
        let filter_layer = tracing_subscriber::EnvFilter::builder()
            .with_default_directive(default_filter.into())
            .from_env_lossy()
            .add_directive("hyper=warn".parse()?)
            .add_directive("reqwest=warn".parse()?);

        let use_json = std::env::var("TELEMETRY_CHANNEL_LOG_FORMAT")
            .map(|v| v.to_lowercase() == "json")
            .unwrap_or(false);

        let fmt_layer = if use_json {
            tracing_subscriber::fmt::layer()
                .with_level(true)
                .json()
                .with_file(cfg!(any(test, debug_assertions)))
                .with_line_number(cfg!(any(test, debug_assertions)))
                .boxed()
        } else {
            tracing_subscriber::fmt::layer()
                .with_level(true)
                .pretty()
                .with_file(cfg!(any(test, debug_assertions)))
                .with_line_number(cfg!(any(test, debug_assertions)))
                .boxed()
        };

        let subscriber = Registry::default().with(fmt_layer.with_filter(filter_layer));
        tracing::subscriber::set_global_default(subscriber)?;
        Ok(())
    }
}

#[cfg(test)]
pub(crate) mod test {
    use parking_lot::Mutex;

    use super::*;

    /// Keeps every reported event for later assertions.
    #[derive(Default)]
    pub(crate) struct RecordingDiagnostics {
        events: Mutex<Vec<DiagnosticEvent>>,
    }

    impl RecordingDiagnostics {
        pub fn shared() -> Arc<Self> {
            Arc::new(Self::default())
        }

        pub fn events(&self) -> Vec<DiagnosticEvent> {
            self.events.lock().clone()
        }

        pub fn count(&self, name: &str) -> usize {
            self.events.lock().iter().filter(|e| e.name() == name).count()
        }
    }

    impl DiagnosticsSink for RecordingDiagnostics {
        fn report(&self, event: DiagnosticEvent) {
            self.events.lock().push(event);
        }
    }

    #[test]
    fn test_event_names_are_stable() {
        assert_eq!(DiagnosticEvent::BackoffDisabled.name(), "backoff_disabled");
        assert_eq!(
            DiagnosticEvent::StorageFull {
                capacity: 1,
                size: 2
            }
            .name(),
            "storage_full"
        );
    }

    #[test]
    fn test_recording_sink_counts_by_name() {
        let sink = RecordingDiagnostics::shared();
        sink.report(DiagnosticEvent::StorageUnavailable);
        sink.report(DiagnosticEvent::StorageUnavailable);
        sink.report(DiagnosticEvent::BackoffDisabled);
        assert_eq!(sink.count("storage_unavailable"), 2);
        assert_eq!(sink.events().len(), 3);
    }

    #[test]
    fn test_tracing_sink_accepts_every_event() {
        let sink = TracingDiagnostics;
        sink.report(DiagnosticEvent::BackoffEnabled {
            status: 503,
            delay: Duration::from_secs(10),
        });
        sink.report(DiagnosticEvent::PolicyFailure {
            policy: "network-availability",
            error: "boom".into(),
        });
    }
}

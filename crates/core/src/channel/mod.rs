//! The assembled channel: sampling, item buffering and the transmitter wired
//! together the way a host application uses them.

use std::sync::{Arc, Weak};

use futures::FutureExt;

use crate::{
    config::{ChannelConfig, GlobalExecutor},
    diagnostics::{SharedDiagnostics, TracingDiagnostics},
    item::{TelemetryItem, TelemetryProcessor},
    platform::{
        AlwaysAvailable, ApplicationLifecycle, DirectoryFolderProvider, FolderProvider,
        NetworkStatus,
    },
    sampling::{
        AdaptiveSamplingTelemetryProcessor, EvaluationCallback, SamplingPercentageEstimator,
    },
    serializer::{JsonLinesSerializer, PayloadSerializer, SerializeError},
    transmission::{
        policy::{
            ApplicationLifecyclePolicy, ErrorHandlingPolicy, NetworkAvailabilityPolicy,
            PartialSuccessPolicy, ThrottlingPolicy,
        },
        HttpTransport, Transmission, Transmitter, Transport,
    },
    ChannelError,
};

mod telemetry_buffer;

pub use telemetry_buffer::{FlushHandler, TelemetryBuffer};

/// Entry point for host applications. Items handed to [`TelemetryChannel::send`]
/// are sampled (when configured), batched, serialized and delivered with
/// retries, throttling and on-disk overflow handled internally.
pub struct TelemetryChannel {
    config: ChannelConfig,
    head: Arc<dyn TelemetryProcessor>,
    buffer: Arc<TelemetryBuffer>,
    transmitter: Arc<Transmitter>,
    lifecycle: Arc<ApplicationLifecycle>,
    sampling: Option<Arc<SamplingPercentageEstimator>>,
}

impl TelemetryChannel {
    pub fn new(config: ChannelConfig) -> Result<Self, ChannelError> {
        Self::builder(config).build()
    }

    pub fn builder(config: ChannelConfig) -> TelemetryChannelBuilder {
        TelemetryChannelBuilder::new(config)
    }

    pub fn config(&self) -> &ChannelConfig {
        &self.config
    }

    /// Never blocks on network or disk work. Ignored while the channel is
    /// disabled.
    pub fn send(&self, item: TelemetryItem) {
        if !self.config.enabled {
            return;
        }
        self.head.process(item);
    }

    /// Hands everything buffered so far to the transmitter.
    pub async fn flush(&self) {
        self.buffer.flush().await;
    }

    /// Runs the stopping handlers: sending and in-memory buffering are
    /// suspended, then pending items are flushed so they end up on disk.
    pub async fn shutdown(&self) {
        self.lifecycle.stop().await;
    }

    pub fn buffer(&self) -> &Arc<TelemetryBuffer> {
        &self.buffer
    }

    pub fn transmitter(&self) -> &Arc<Transmitter> {
        &self.transmitter
    }

    pub fn sampling_estimator(&self) -> Option<&Arc<SamplingPercentageEstimator>> {
        self.sampling.as_ref()
    }
}

impl TelemetryProcessor for TelemetryChannel {
    fn process(&self, item: TelemetryItem) {
        self.send(item);
    }
}

/// Replaces the collaborators a [`TelemetryChannel`] uses by default.
pub struct TelemetryChannelBuilder {
    config: ChannelConfig,
    transport: Option<Arc<dyn Transport>>,
    folder_provider: Option<Arc<dyn FolderProvider>>,
    network_status: Option<Arc<dyn NetworkStatus>>,
    lifecycle: Option<Arc<ApplicationLifecycle>>,
    serializer: Option<Arc<dyn PayloadSerializer>>,
    diagnostics: Option<SharedDiagnostics>,
    evaluation_callback: Option<EvaluationCallback>,
}

impl TelemetryChannelBuilder {
    pub fn new(config: ChannelConfig) -> Self {
        Self {
            config,
            transport: None,
            folder_provider: None,
            network_status: None,
            lifecycle: None,
            serializer: None,
            diagnostics: None,
            evaluation_callback: None,
        }
    }

    pub fn transport(mut self, transport: Arc<dyn Transport>) -> Self {
        self.transport = Some(transport);
        self
    }

    pub fn folder_provider(mut self, folder_provider: Arc<dyn FolderProvider>) -> Self {
        self.folder_provider = Some(folder_provider);
        self
    }

    pub fn network_status(mut self, network_status: Arc<dyn NetworkStatus>) -> Self {
        self.network_status = Some(network_status);
        self
    }

    pub fn lifecycle(mut self, lifecycle: Arc<ApplicationLifecycle>) -> Self {
        self.lifecycle = Some(lifecycle);
        self
    }

    pub fn serializer(mut self, serializer: Arc<dyn PayloadSerializer>) -> Self {
        self.serializer = Some(serializer);
        self
    }

    pub fn diagnostics(mut self, diagnostics: SharedDiagnostics) -> Self {
        self.diagnostics = Some(diagnostics);
        self
    }

    /// Called after every adaptive sampling evaluation.
    pub fn sampling_evaluation_callback(mut self, callback: EvaluationCallback) -> Self {
        self.evaluation_callback = Some(callback);
        self
    }

    pub fn build(self) -> Result<TelemetryChannel, ChannelError> {
        let config = self.config;
        config.validate()?;

        let diagnostics = self.diagnostics.unwrap_or_else(TracingDiagnostics::shared);
        let transport: Arc<dyn Transport> = match self.transport {
            Some(transport) => transport,
            None => Arc::new(HttpTransport::new(config.request_timeout())?),
        };
        let folder_provider: Arc<dyn FolderProvider> = match self.folder_provider {
            Some(provider) => provider,
            None => match &config.storage_folder {
                Some(folder) => Arc::new(DirectoryFolderProvider::new(folder.clone())),
                None => Arc::new(DirectoryFolderProvider::platform_default()),
            },
        };
        let network_status = self
            .network_status
            .unwrap_or_else(|| Arc::new(AlwaysAvailable));
        let lifecycle = self
            .lifecycle
            .unwrap_or_else(|| Arc::new(ApplicationLifecycle::new()));
        let serializer = self
            .serializer
            .unwrap_or_else(|| Arc::new(JsonLinesSerializer));

        let transmitter = Transmitter::new(&config, transport, folder_provider, diagnostics.clone());
        // Registered first so the pipeline is paused before the final flush lands.
        transmitter.add_policy(Arc::new(ApplicationLifecyclePolicy::new(lifecycle.clone())));
        transmitter.add_policy(Arc::new(ErrorHandlingPolicy::new()));
        transmitter.add_policy(Arc::new(ThrottlingPolicy::new()));
        transmitter.add_policy(Arc::new(PartialSuccessPolicy::new()));
        transmitter.add_policy(Arc::new(NetworkAvailabilityPolicy::new(network_status)));
        // Picks up whatever an earlier process left in storage.
        transmitter.apply_policies();

        let buffer = TelemetryBuffer::new(
            flush_to_transmitter(Arc::downgrade(&transmitter), serializer, config.endpoint.clone()),
            diagnostics.clone(),
        );
        if config.max_telemetry_buffer_capacity <= buffer.backlog_size() {
            buffer.set_capacity(config.max_telemetry_buffer_capacity)?;
            buffer.set_backlog_size(config.max_backlog_size)?;
        } else {
            buffer.set_backlog_size(config.max_backlog_size)?;
            buffer.set_capacity(config.max_telemetry_buffer_capacity)?;
        }
        buffer.set_max_transmission_delay(config.max_transmission_delay());
        let stopping = Arc::downgrade(&buffer);
        lifecycle.on_stopping(move || async move {
            if let Some(buffer) = stopping.upgrade() {
                buffer.stop().await;
            }
        });

        let (head, sampling) = match config.adaptive_sampling.clone() {
            Some(settings) => {
                let mut estimator = SamplingPercentageEstimator::new(settings, diagnostics.clone());
                if let Some(callback) = self.evaluation_callback {
                    estimator = estimator.with_callback(callback);
                }
                let processor =
                    AdaptiveSamplingTelemetryProcessor::new(estimator, diagnostics, buffer.clone());
                let estimator = processor.estimator().clone();
                (Arc::new(processor) as Arc<dyn TelemetryProcessor>, Some(estimator))
            }
            None => (buffer.clone() as Arc<dyn TelemetryProcessor>, None),
        };

        tracing::info!(
            endpoint = %config.endpoint,
            enabled = config.enabled,
            sampling = sampling.is_some(),
            "Telemetry channel started"
        );
        Ok(TelemetryChannel {
            config,
            head,
            buffer,
            transmitter,
            lifecycle,
            sampling,
        })
    }
}

/// Serializes each batch into one transmission for the transmitter.
fn flush_to_transmitter(
    transmitter: Weak<Transmitter>,
    serializer: Arc<dyn PayloadSerializer>,
    endpoint: String,
) -> FlushHandler {
    Arc::new(move |items: Vec<TelemetryItem>| {
        let transmitter = transmitter.clone();
        let serializer = serializer.clone();
        let endpoint = endpoint.clone();
        async move {
            let payload = match serializer.serialize(&items) {
                Ok(payload) => payload,
                Err(SerializeError::Empty) => return,
                Err(error) => {
                    tracing::error!(%error, items = items.len(), "Failed serializing telemetry batch");
                    return;
                }
            };
            let transmission = Transmission::new(
                endpoint,
                payload.content,
                payload.content_type,
                payload.content_encoding,
            );
            // Storage writes happen inside enqueue.
            let enqueued = GlobalExecutor::spawn_blocking(move || {
                if let Some(transmitter) = transmitter.upgrade() {
                    transmitter.enqueue(transmission);
                }
            })
            .await;
            if let Err(error) = enqueued {
                tracing::error!(%error, "Failed enqueuing telemetry batch");
            }
        }
        .boxed()
    })
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::{
        diagnostics::test::RecordingDiagnostics,
        item::TelemetryKind,
        platform::ManualNetworkStatus,
        transmission::{policy::test::wait_for, transport::test::MockTransport, HttpResponse},
    };

    fn config(folder: &std::path::Path) -> ChannelConfig {
        ChannelConfig {
            storage_folder: Some(folder.to_path_buf()),
            max_telemetry_buffer_capacity: 2,
            ..Default::default()
        }
    }

    #[tokio::test]
    #[test_log::test]
    async fn test_full_buffer_is_sent_as_one_transmission() {
        let dir = tempfile::tempdir().unwrap();
        let transport = Arc::new(MockTransport::new());
        let channel = TelemetryChannel::builder(config(dir.path()))
            .transport(transport.clone())
            .diagnostics(RecordingDiagnostics::shared())
            .build()
            .unwrap();

        channel.send(TelemetryItem::new(TelemetryKind::Event, "a"));
        channel.send(TelemetryItem::new(TelemetryKind::Event, "b"));

        wait_for(|| transport.sent().len() == 1).await;
        let sent = &transport.sent()[0];
        assert_eq!(sent.content_type(), crate::serializer::JSON_LINES_CONTENT_TYPE);
        assert_eq!(crate::serializer::split_lines(sent.content()).len(), 2);
    }

    #[tokio::test]
    #[test_log::test]
    async fn test_disabled_channel_ignores_items() {
        let dir = tempfile::tempdir().unwrap();
        let transport = Arc::new(MockTransport::new());
        let channel = TelemetryChannel::builder(ChannelConfig {
            enabled: false,
            ..config(dir.path())
        })
        .transport(transport.clone())
        .build()
        .unwrap();

        channel.send(TelemetryItem::new(TelemetryKind::Event, "a"));
        assert!(channel.buffer().is_empty());
    }

    #[tokio::test]
    #[test_log::test]
    async fn test_invalid_config_is_rejected() {
        let result = TelemetryChannel::builder(ChannelConfig {
            max_telemetry_buffer_capacity: 10,
            max_backlog_size: 5,
            ..Default::default()
        })
        .transport(Arc::new(MockTransport::new()))
        .build();
        assert!(matches!(result, Err(ChannelError::InvalidArgument { .. })));
    }

    #[tokio::test]
    #[test_log::test]
    async fn test_shutdown_persists_pending_items() {
        let dir = tempfile::tempdir().unwrap();
        let transport = Arc::new(MockTransport::new());
        let network = Arc::new(ManualNetworkStatus::new(false));
        let channel = TelemetryChannel::builder(ChannelConfig {
            max_telemetry_buffer_capacity: 100,
            ..config(dir.path())
        })
        .transport(transport.clone())
        .network_status(network)
        .build()
        .unwrap();

        channel.send(TelemetryItem::new(TelemetryKind::Trace, "pending"));
        channel.shutdown().await;

        assert!(channel.buffer().is_empty());
        assert!(channel.transmitter().buffer().is_empty());
        assert!(channel.transmitter().storage().size() > 0);
        assert!(transport.sent().is_empty());
    }

    #[tokio::test]
    #[test_log::test]
    async fn test_throttled_batch_is_retried() {
        let dir = tempfile::tempdir().unwrap();
        let transport = Arc::new(MockTransport::with_responses([
            Ok(HttpResponse::new(429).with_retry_after("1")),
        ]));
        let channel = TelemetryChannel::builder(config(dir.path()))
            .transport(transport.clone())
            .build()
            .unwrap();

        channel.send(TelemetryItem::new(TelemetryKind::Event, "a"));
        channel.flush().await;

        wait_for(|| transport.sent().len() == 2).await;
        let sent = transport.sent();
        assert_eq!(sent[0].content(), sent[1].content());
    }

    #[tokio::test(start_paused = true)]
    async fn test_sampling_callback_is_wired() {
        let dir = tempfile::tempdir().unwrap();
        let evaluations = Arc::new(parking_lot::Mutex::new(0));
        let counter = evaluations.clone();
        let channel = TelemetryChannel::builder(ChannelConfig {
            adaptive_sampling: Some(crate::sampling::SamplingPercentageEstimatorSettings {
                evaluation_interval: Duration::from_secs(1),
                ..Default::default()
            }),
            ..config(dir.path())
        })
        .transport(Arc::new(MockTransport::new()))
        .sampling_evaluation_callback(Arc::new(move |_: &crate::sampling::SamplingEvaluation| {
            *counter.lock() += 1;
        }))
        .build()
        .unwrap();

        assert!(channel.sampling_estimator().is_some());
        tokio::time::sleep(Duration::from_millis(1_500)).await;
        assert_eq!(*evaluations.lock(), 1);
    }
}

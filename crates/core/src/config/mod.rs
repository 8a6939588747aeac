use std::{
    future::Future,
    path::{Path, PathBuf},
    sync::LazyLock,
    time::Duration,
};

use serde::{Deserialize, Serialize};
use tokio::runtime::Runtime;

use crate::{error::ChannelError, sampling::SamplingPercentageEstimatorSettings};

/// Default ingestion endpoint the channel posts transmissions to.
pub const DEFAULT_ENDPOINT: &str = "http://localhost:4318/v2/track";
/// Default number of items that triggers a flush of the telemetry buffer.
pub const DEFAULT_TELEMETRY_BUFFER_CAPACITY: usize = 500;
/// Default maximum number of items held by the telemetry buffer before dropping.
pub const DEFAULT_BACKLOG_SIZE: usize = 1_000_000;
/// Default maximum time an item waits in the telemetry buffer.
pub const DEFAULT_MAX_TRANSMISSION_DELAY: Duration = Duration::from_secs(30);
/// Default number of concurrent network sends.
pub const DEFAULT_SENDER_CAPACITY: usize = 10;
/// Default byte capacity of the in-memory transmission buffer.
pub const DEFAULT_TRANSMISSION_BUFFER_CAPACITY: usize = 1024 * 1024;
/// Default byte capacity of the on-disk transmission storage.
pub const DEFAULT_STORAGE_CAPACITY: u64 = 50 * 1024 * 1024;
/// Default timeout for a single HTTP attempt.
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(100);

// Initialize the executor once.
static ASYNC_RT: LazyLock<Option<Runtime>> = LazyLock::new(GlobalExecutor::initialize_async_rt);

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChannelConfig {
    /// Whether telemetry is delivered at all. A disabled channel drops every item.
    #[serde(default = "default_enabled")]
    pub enabled: bool,

    /// Ingestion endpoint URL.
    #[serde(default = "default_endpoint")]
    pub endpoint: String,

    #[serde(
        default = "default_telemetry_buffer_capacity",
        rename = "max-telemetry-buffer-capacity"
    )]
    pub max_telemetry_buffer_capacity: usize,

    #[serde(default = "default_backlog_size", rename = "max-backlog-size")]
    pub max_backlog_size: usize,

    #[serde(
        default = "default_max_transmission_delay_ms",
        rename = "max-transmission-delay-ms"
    )]
    pub max_transmission_delay_ms: u64,

    #[serde(default = "default_sender_capacity", rename = "max-sender-capacity")]
    pub max_sender_capacity: usize,

    #[serde(
        default = "default_transmission_buffer_capacity",
        rename = "max-transmission-buffer-capacity"
    )]
    pub max_transmission_buffer_capacity: usize,

    #[serde(default = "default_storage_capacity", rename = "max-storage-capacity")]
    pub max_storage_capacity: u64,

    /// Overrides the platform data directory used for the overflow storage.
    #[serde(
        default,
        rename = "storage-folder",
        skip_serializing_if = "Option::is_none"
    )]
    pub storage_folder: Option<PathBuf>,

    #[serde(default = "default_request_timeout_ms", rename = "request-timeout-ms")]
    pub request_timeout_ms: u64,

    /// Adaptive sampling is enabled when this table is present.
    #[serde(
        default,
        rename = "adaptive-sampling",
        skip_serializing_if = "Option::is_none"
    )]
    pub adaptive_sampling: Option<SamplingPercentageEstimatorSettings>,
}

fn default_enabled() -> bool {
    true
}

fn default_endpoint() -> String {
    DEFAULT_ENDPOINT.to_string()
}

fn default_telemetry_buffer_capacity() -> usize {
    DEFAULT_TELEMETRY_BUFFER_CAPACITY
}

fn default_backlog_size() -> usize {
    DEFAULT_BACKLOG_SIZE
}

fn default_max_transmission_delay_ms() -> u64 {
    DEFAULT_MAX_TRANSMISSION_DELAY.as_millis() as u64
}

fn default_sender_capacity() -> usize {
    DEFAULT_SENDER_CAPACITY
}

fn default_transmission_buffer_capacity() -> usize {
    DEFAULT_TRANSMISSION_BUFFER_CAPACITY
}

fn default_storage_capacity() -> u64 {
    DEFAULT_STORAGE_CAPACITY
}

fn default_request_timeout_ms() -> u64 {
    DEFAULT_REQUEST_TIMEOUT.as_millis() as u64
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            endpoint: default_endpoint(),
            max_telemetry_buffer_capacity: DEFAULT_TELEMETRY_BUFFER_CAPACITY,
            max_backlog_size: DEFAULT_BACKLOG_SIZE,
            max_transmission_delay_ms: default_max_transmission_delay_ms(),
            max_sender_capacity: DEFAULT_SENDER_CAPACITY,
            max_transmission_buffer_capacity: DEFAULT_TRANSMISSION_BUFFER_CAPACITY,
            max_storage_capacity: DEFAULT_STORAGE_CAPACITY,
            storage_folder: None,
            request_timeout_ms: default_request_timeout_ms(),
            adaptive_sampling: None,
        }
    }
}

impl ChannelConfig {
    pub fn from_toml_str(s: &str) -> Result<Self, ChannelError> {
        let config: ChannelConfig = toml::from_str(s)?;
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self, ChannelError> {
        let contents = std::fs::read_to_string(path.as_ref())?;
        Self::from_toml_str(&contents)
    }

    pub fn validate(&self) -> Result<(), ChannelError> {
        if self.max_telemetry_buffer_capacity == 0 {
            return Err(ChannelError::invalid_argument(
                "max-telemetry-buffer-capacity",
                "must be greater than zero",
            ));
        }
        if self.max_backlog_size < self.max_telemetry_buffer_capacity {
            return Err(ChannelError::invalid_argument(
                "max-backlog-size",
                format!(
                    "{} is below the telemetry buffer capacity {}",
                    self.max_backlog_size, self.max_telemetry_buffer_capacity
                ),
            ));
        }
        if self.max_transmission_delay_ms == 0 {
            return Err(ChannelError::invalid_argument(
                "max-transmission-delay-ms",
                "must be greater than zero",
            ));
        }
        Ok(())
    }

    pub fn max_transmission_delay(&self) -> Duration {
        Duration::from_millis(self.max_transmission_delay_ms)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }
}

/// (De)serializes a `Duration` as whole milliseconds.
pub(crate) mod serde_duration_ms {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_u64(duration.as_millis() as u64)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        Ok(Duration::from_millis(u64::deserialize(deserializer)?))
    }
}

/// Global async executor abstraction for spawning tasks.
///
/// Host applications call into the channel from arbitrary threads, not
/// necessarily inside a tokio runtime. Work is spawned on the current runtime
/// when there is one, and on a lazily built fallback runtime otherwise.
pub struct GlobalExecutor;

impl GlobalExecutor {
    /// Returns the runtime handle if it was initialized or none if it was already
    /// running on the background.
    pub(crate) fn initialize_async_rt() -> Option<Runtime> {
        if tokio::runtime::Handle::try_current().is_ok() {
            tracing::debug!("GlobalExecutor: runtime exists");
            None
        } else {
            tracing::debug!("GlobalExecutor: creating fallback runtime");
            let mut builder = tokio::runtime::Builder::new_multi_thread();
            builder
                .enable_all()
                .worker_threads(2)
                .thread_name("telemetry-channel");
            Some(builder.build().expect("failed to build tokio runtime"))
        }
    }

    #[inline]
    pub fn spawn<R: Send + 'static>(
        f: impl Future<Output = R> + Send + 'static,
    ) -> tokio::task::JoinHandle<R> {
        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            handle.spawn(f)
        } else if let Some(rt) = &*ASYNC_RT {
            rt.spawn(f)
        } else {
            unreachable!("ASYNC_RT should be initialized if Handle::try_current fails")
        }
    }

    #[inline]
    pub fn spawn_blocking<R: Send + 'static>(
        f: impl FnOnce() -> R + Send + 'static,
    ) -> tokio::task::JoinHandle<R> {
        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            handle.spawn_blocking(f)
        } else if let Some(rt) = &*ASYNC_RT {
            rt.spawn_blocking(f)
        } else {
            unreachable!("ASYNC_RT should be initialized if Handle::try_current fails")
        }
    }
}

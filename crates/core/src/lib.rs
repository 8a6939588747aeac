/// Channel configuration and the shared async executor.
pub mod config;

/// Structured diagnostic events and the tracing-backed sink.
pub mod diagnostics;

mod error;
pub use error::ChannelError;

/// Telemetry items and the processor chain contract.
pub mod item;

/// Host collaborators: storage folder, network status and application lifecycle.
pub mod platform;

/// Adaptive sampling admission control placed in front of the channel.
pub mod sampling;

/// Payload encoding for batches of telemetry items.
pub mod serializer;

/// The reliable delivery pipeline: buffering, sending, persistence and policies.
pub mod transmission;

pub mod util;

mod channel;
pub use channel::{FlushHandler, TelemetryBuffer, TelemetryChannel, TelemetryChannelBuilder};

pub use item::{TelemetryItem, TelemetryKind, TelemetryProcessor};
pub use transmission::{Transmission, TransmissionId};

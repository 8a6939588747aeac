use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Broad category of a telemetry item.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TelemetryKind {
    Request,
    Dependency,
    Event,
    Exception,
    Trace,
    PageView,
    Availability,
    Metric,
}

impl TelemetryKind {
    /// Pre-aggregated metrics already represent every observation and are never sampled.
    pub fn supports_sampling(self) -> bool {
        !matches!(self, TelemetryKind::Metric)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            TelemetryKind::Request => "request",
            TelemetryKind::Dependency => "dependency",
            TelemetryKind::Event => "event",
            TelemetryKind::Exception => "exception",
            TelemetryKind::Trace => "trace",
            TelemetryKind::PageView => "page-view",
            TelemetryKind::Availability => "availability",
            TelemetryKind::Metric => "metric",
        }
    }
}

impl std::fmt::Display for TelemetryKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A single unit of telemetry produced by the instrumented process.
///
/// The payload itself is opaque to the pipeline; only the correlation
/// identifiers are inspected (by sampling) and the sampling percentage is
/// stamped onto items that survive sampling.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TelemetryItem {
    pub kind: TelemetryKind,
    pub name: String,
    pub time: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub operation_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sampling_percentage: Option<f64>,
    #[serde(default, skip_serializing_if = "serde_json::Value::is_null")]
    pub data: serde_json::Value,
}

impl TelemetryItem {
    pub fn new(kind: TelemetryKind, name: impl Into<String>) -> Self {
        Self {
            kind,
            name: name.into(),
            time: Utc::now(),
            user_id: None,
            operation_id: None,
            sampling_percentage: None,
            data: serde_json::Value::Null,
        }
    }

    pub fn with_user_id(mut self, user_id: impl Into<String>) -> Self {
        self.user_id = Some(user_id.into());
        self
    }

    pub fn with_operation_id(mut self, operation_id: impl Into<String>) -> Self {
        self.operation_id = Some(operation_id.into());
        self
    }

    pub fn with_data(mut self, data: serde_json::Value) -> Self {
        self.data = data;
        self
    }
}

/// A stage of the telemetry processing chain.
///
/// Implementations must return quickly: the caller is a host application
/// thread and is never blocked on network or disk work.
pub trait TelemetryProcessor: Send + Sync {
    fn process(&self, item: TelemetryItem);
}

impl<T: TelemetryProcessor + ?Sized> TelemetryProcessor for std::sync::Arc<T> {
    fn process(&self, item: TelemetryItem) {
        (**self).process(item)
    }
}

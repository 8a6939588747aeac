use std::fmt;

use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use ulid::Ulid;

pub mod backoff;
pub mod buffer;
pub mod policy;
pub mod sender;
pub mod storage;
pub mod transmitter;
pub mod transport;

pub use backoff::{BackendResponse, BackoffLogicManager, ItemError};
pub use buffer::TransmissionBuffer;
pub use sender::TransmissionSender;
pub use storage::TransmissionStorage;
pub use transmitter::{Capacities, Transmitter};
pub use transport::{HttpResponse, HttpTransport, Transport, TransportError};

/// Opaque transmission identifier. Ordered by creation time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TransmissionId(Ulid);

impl TransmissionId {
    pub fn new() -> Self {
        Self(Ulid::new())
    }
}

impl Default for TransmissionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for TransmissionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl std::str::FromStr for TransmissionId {
    type Err = ulid::DecodeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ulid::from_string(s).map(Self)
    }
}

/// One serialized, addressed batch of telemetry ready for network delivery.
///
/// Never mutated after creation. The payload is reference counted, so handing
/// a clone to a stage that may refuse it costs nothing and loses nothing.
#[derive(Debug, Clone, PartialEq)]
pub struct Transmission {
    id: TransmissionId,
    endpoint: String,
    content: Bytes,
    content_type: String,
    content_encoding: String,
    created_at: DateTime<Utc>,
}

impl Transmission {
    pub fn new(
        endpoint: impl Into<String>,
        content: impl Into<Bytes>,
        content_type: impl Into<String>,
        content_encoding: impl Into<String>,
    ) -> Self {
        Self {
            id: TransmissionId::new(),
            endpoint: endpoint.into(),
            content: content.into(),
            content_type: content_type.into(),
            content_encoding: content_encoding.into(),
            created_at: Utc::now(),
        }
    }

    pub(crate) fn from_parts(
        id: TransmissionId,
        endpoint: String,
        content: Bytes,
        content_type: String,
        content_encoding: String,
        created_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id,
            endpoint,
            content,
            content_type,
            content_encoding,
            created_at,
        }
    }

    /// A new transmission to the same destination carrying different content.
    pub fn with_content(&self, content: impl Into<Bytes>) -> Self {
        Self {
            id: TransmissionId::new(),
            endpoint: self.endpoint.clone(),
            content: content.into(),
            content_type: self.content_type.clone(),
            content_encoding: self.content_encoding.clone(),
            created_at: Utc::now(),
        }
    }

    pub fn id(&self) -> TransmissionId {
        self.id
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    pub fn content(&self) -> &Bytes {
        &self.content
    }

    pub fn content_type(&self) -> &str {
        &self.content_type
    }

    pub fn content_encoding(&self) -> &str {
        &self.content_encoding
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn len(&self) -> usize {
        self.content.len()
    }

    pub fn is_empty(&self) -> bool {
        self.content.is_empty()
    }
}

/// Outcome of one network attempt, raised by the sender once the attempt
/// completed and its slot was released.
#[derive(Debug, Clone)]
pub struct TransmissionProcessed {
    pub transmission: Transmission,
    pub response: Option<HttpResponse>,
    pub error: Option<TransportError>,
}

impl TransmissionProcessed {
    /// The status code that drives policy decisions: the HTTP status when a
    /// response arrived, otherwise the one the transport error maps to.
    pub fn status_code(&self) -> Option<u16> {
        match (&self.response, &self.error) {
            (Some(response), _) => Some(response.status),
            (None, Some(error)) => Some(error.status_code()),
            (None, None) => None,
        }
    }

    pub fn retry_after(&self) -> Option<&str> {
        self.response.as_ref()?.retry_after.as_deref()
    }
}

#[cfg(test)]
pub(crate) fn test_transmission(content: &'static str) -> Transmission {
    Transmission::new(
        "http://localhost/v2/track",
        Bytes::from_static(content.as_bytes()),
        crate::serializer::JSON_LINES_CONTENT_TYPE,
        "",
    )
}

use bytes::{BufMut, Bytes, BytesMut};

use crate::item::TelemetryItem;

pub const JSON_LINES_CONTENT_TYPE: &str = "application/x-json-stream";

#[derive(Debug, thiserror::Error)]
pub enum SerializeError {
    #[error("nothing to serialize")]
    Empty,
    #[error("failed encoding telemetry item: {0}")]
    Json(#[from] serde_json::Error),
}

/// An encoded batch, ready to become a transmission.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SerializedPayload {
    pub content: Bytes,
    pub content_type: String,
    pub content_encoding: String,
}

pub trait PayloadSerializer: Send + Sync {
    fn serialize(&self, items: &[TelemetryItem]) -> Result<SerializedPayload, SerializeError>;
}

/// One JSON document per line, no compression. Line `n` of the payload is
/// item `n` of the batch, which is what partial success responses index into.
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonLinesSerializer;

impl PayloadSerializer for JsonLinesSerializer {
    fn serialize(&self, items: &[TelemetryItem]) -> Result<SerializedPayload, SerializeError> {
        if items.is_empty() {
            return Err(SerializeError::Empty);
        }
        let mut content = BytesMut::new().writer();
        for (i, item) in items.iter().enumerate() {
            if i > 0 {
                content.get_mut().put_u8(b'\n');
            }
            serde_json::to_writer(&mut content, item)?;
        }
        Ok(SerializedPayload {
            content: content.into_inner().freeze(),
            content_type: JSON_LINES_CONTENT_TYPE.to_owned(),
            content_encoding: String::new(),
        })
    }
}

/// Splits a newline delimited payload into its lines. Empty lines are kept so
/// indexes stay aligned with the batch.
pub fn split_lines(content: &Bytes) -> Vec<Bytes> {
    if content.is_empty() {
        return Vec::new();
    }
    content
        .split(|byte| *byte == b'\n')
        .map(|line| content.slice_ref(line))
        .collect()
}

pub fn join_lines(lines: impl IntoIterator<Item = Bytes>) -> Bytes {
    let mut joined = BytesMut::new();
    for (i, line) in lines.into_iter().enumerate() {
        if i > 0 {
            joined.put_u8(b'\n');
        }
        joined.extend_from_slice(&line);
    }
    joined.freeze()
}

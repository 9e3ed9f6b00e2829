//! Wire envelope shared by every message on the multiplexed connection.
//!
//! Both directions use the same JSON shape:
//!
//! ```json
//! {"stream": "<stream name>", "type": "<message type>", "data": <payload>}
//! ```
//!
//! `stream` and `data` are optional. Connection-level control messages
//! (`connected`, `keep-alive`, `disconnected`, `ready`) carry no `stream`
//! field and are reserved regardless of stream.

use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

use crate::error::{PanelLinkError, Result};

use super::stream_kind::StreamKind;

/// Control type: the socket was accepted by the panel.
pub const CONTROL_CONNECTED: &str = "connected";
/// Control type: periodic liveness signal from the panel.
pub const CONTROL_KEEP_ALIVE: &str = "keep-alive";
/// Control type: the panel is about to close the socket.
pub const CONTROL_DISCONNECTED: &str = "disconnected";
/// Control type: outbound traffic may now flow; queued writes are flushed.
pub const CONTROL_READY: &str = "ready";

/// A single message on the shared connection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    /// Logical stream this message belongs to. Absent on control messages.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stream: Option<String>,

    /// Message type within the stream (or a reserved control type).
    #[serde(rename = "type")]
    pub kind: String,

    /// Optional payload. Shape depends on `stream` and `kind`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<JsonValue>,
}

impl Envelope {
    /// Build an outbound command without a payload, e.g. a stream `start`.
    pub fn command(stream: StreamKind, kind: impl Into<String>) -> Self {
        Self {
            stream: Some(stream.wire_name().to_string()),
            kind: kind.into(),
            data: None,
        }
    }

    /// Build an outbound command with a payload.
    pub fn command_with_data(
        stream: StreamKind,
        kind: impl Into<String>,
        data: JsonValue,
    ) -> Self {
        Self {
            stream: Some(stream.wire_name().to_string()),
            kind: kind.into(),
            data: Some(data),
        }
    }

    /// Decode an inbound text frame.
    ///
    /// A malformed frame yields [`PanelLinkError::SerializationError`]; the
    /// read loop logs and drops such frames rather than terminating.
    pub fn parse(text: &str) -> Result<Self> {
        serde_json::from_str(text).map_err(|e| {
            PanelLinkError::SerializationError(format!("Failed to parse envelope: {}", e))
        })
    }

    /// Encode for the wire.
    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string(self).map_err(|e| {
            PanelLinkError::SerializationError(format!("Failed to serialize envelope: {}", e))
        })
    }

    /// Whether this is a reserved connection-level control message.
    pub fn is_control(&self) -> bool {
        self.stream.is_none()
            && matches!(
                self.kind.as_str(),
                CONTROL_CONNECTED | CONTROL_KEEP_ALIVE | CONTROL_DISCONNECTED | CONTROL_READY
            )
    }
}

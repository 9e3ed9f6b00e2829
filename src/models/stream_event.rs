//! Events delivered to stream subscribers.

use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

use super::server_info::ServerInfo;
use super::stream_kind::StreamKind;

/// Heap usage sample from the heap stream.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct HeapUsage {
    /// Bytes currently allocated on the server process heap.
    #[serde(default)]
    pub usage: u64,
}

/// Memory portion of a stats sample.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MemoryStats {
    /// Memory usage as a percentage of the allowed maximum.
    #[serde(default)]
    pub percent: f64,
    /// Memory usage in bytes.
    #[serde(default)]
    pub usage: u64,
}

/// Performance statistics sample from the stats stream.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StatsData {
    /// Memory usage of the server process.
    #[serde(default)]
    pub memory: MemoryStats,
}

/// Tick timing sample from the tick stream.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TickData {
    /// Average milliseconds per tick over the sampling window.
    #[serde(default)]
    pub average_tick_time: f64,
    /// Ticks per second derived from the average tick time.
    #[serde(default)]
    pub tps: f64,
}

/// A single event dispatched to the subscribers of one stream.
///
/// Each subscriber receives its own clone, so one inbound frame is always
/// delivered whole to every subscriber registered at dispatch time.
#[derive(Debug, Clone, PartialEq)]
pub enum StreamEvent {
    /// The server status changed; both the previous and the new snapshot.
    StatusChanged {
        /// Snapshot before this status frame was applied.
        old: ServerInfo,
        /// Snapshot after this status frame was applied.
        new: ServerInfo,
    },
    /// One line of console output.
    ConsoleLine(String),
    /// Heap usage sample.
    Heap(HeapUsage),
    /// Performance statistics sample.
    Stats(StatsData),
    /// Tick timing sample.
    Tick(TickData),
    /// Unsolicited notification on the management stream.
    Notification {
        /// Notification name.
        name: String,
        /// Notification payload.
        data: JsonValue,
    },
}

impl StreamEvent {
    /// Decode an inbound data message for `kind` into a subscriber event.
    ///
    /// Status frames are not handled here; the connection task applies them
    /// to its snapshot to produce [`StreamEvent::StatusChanged`]. Returns
    /// `None` for message types the stream does not recognize (logged and
    /// dropped by the router).
    pub(crate) fn decode(kind: StreamKind, msg_type: &str, data: Option<&JsonValue>) -> Option<Self> {
        match (kind, msg_type) {
            (StreamKind::Console, "line") => {
                Some(StreamEvent::ConsoleLine(data?.as_str()?.to_string()))
            },
            (StreamKind::Heap, "heap") => {
                serde_json::from_value(data?.clone()).ok().map(StreamEvent::Heap)
            },
            (StreamKind::Stats, "stats") => {
                serde_json::from_value(data?.clone()).ok().map(StreamEvent::Stats)
            },
            (StreamKind::Tick, "tick") => {
                serde_json::from_value(data?.clone()).ok().map(StreamEvent::Tick)
            },
            (StreamKind::Management, "notification") => {
                let obj = data?.as_object()?;
                Some(StreamEvent::Notification {
                    name: obj.get("name")?.as_str()?.to_string(),
                    data: obj.get("data").cloned().unwrap_or(JsonValue::Null),
                })
            },
            _ => None,
        }
    }
}

//! The closed set of logical streams multiplexed over one connection.

use serde::{Deserialize, Serialize};
use std::fmt;

use super::envelope::Envelope;
use super::server_status::ServerStatus;

/// One logical data/command channel on the shared connection.
///
/// Every stream kind is known at compile time; the registry looks streams up
/// through this enum rather than any dynamic type machinery.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StreamKind {
    /// Full server snapshots on every status change. Always eligible; exists
    /// for the whole lifetime of a connection.
    Status,
    /// Console output lines; accepts outbound `command` messages.
    Console,
    /// Heap usage samples.
    Heap,
    /// Performance statistics samples.
    Stats,
    /// Tick timing samples.
    Tick,
    /// Request/response channel to the server's management process, plus
    /// unsolicited notifications.
    Management,
}

/// Statuses during which a server process exists and produces output.
const PROCESS_STATUSES: &[ServerStatus] = &[
    ServerStatus::Starting,
    ServerStatus::Online,
    ServerStatus::Stopping,
    ServerStatus::Restarting,
    ServerStatus::Saving,
    ServerStatus::Loading,
];

/// Statuses during which the management process accepts requests.
const ONLINE_ONLY: &[ServerStatus] = &[ServerStatus::Online];

impl StreamKind {
    /// Every stream kind, in a fixed order (used by the registry sweep).
    pub const ALL: [StreamKind; 6] = [
        StreamKind::Status,
        StreamKind::Console,
        StreamKind::Heap,
        StreamKind::Stats,
        StreamKind::Tick,
        StreamKind::Management,
    ];

    /// Name used in the envelope `stream` field.
    pub fn wire_name(self) -> &'static str {
        match self {
            StreamKind::Status => "status",
            StreamKind::Console => "console",
            StreamKind::Heap => "heap",
            StreamKind::Stats => "stats",
            StreamKind::Tick => "tick",
            StreamKind::Management => "management",
        }
    }

    /// Resolve a wire stream name. Unknown names return `None` and are
    /// dropped by the router.
    pub fn from_wire(name: &str) -> Option<StreamKind> {
        match name {
            "status" => Some(StreamKind::Status),
            "console" => Some(StreamKind::Console),
            "heap" => Some(StreamKind::Heap),
            "stats" => Some(StreamKind::Stats),
            "tick" => Some(StreamKind::Tick),
            "management" => Some(StreamKind::Management),
            _ => None,
        }
    }

    /// Statuses under which this stream may run. Empty means always eligible.
    pub fn eligible_statuses(self) -> &'static [ServerStatus] {
        match self {
            StreamKind::Status => &[],
            StreamKind::Console => PROCESS_STATUSES,
            StreamKind::Heap | StreamKind::Stats | StreamKind::Tick | StreamKind::Management => {
                ONLINE_ONLY
            },
        }
    }

    /// Whether this stream may run while the server has `status`.
    pub fn eligible_under(self, status: ServerStatus) -> bool {
        let set = self.eligible_statuses();
        set.is_empty() || set.contains(&status)
    }

    /// The status stream can never be removed once a connection exists.
    pub fn is_status(self) -> bool {
        matches!(self, StreamKind::Status)
    }

    /// Outbound envelope asking the panel to begin emitting this stream.
    pub fn start_command(self) -> Envelope {
        Envelope::command(self, "start")
    }

    /// Outbound envelope asking the panel to stop emitting this stream.
    pub fn stop_command(self) -> Envelope {
        Envelope::command(self, "stop")
    }
}

impl fmt::Display for StreamKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.wire_name())
    }
}

//! Remote server lifecycle statuses reported by the status stream.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Status of the tracked game server, as reported by the panel.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ServerStatus {
    /// No process exists for the server. Initial state before the first
    /// status frame arrives.
    #[default]
    Offline,
    /// The panel is allocating resources for a start.
    Preparing,
    /// The server process is booting.
    Starting,
    /// The server is running and reachable.
    Online,
    /// The server process is shutting down.
    Stopping,
    /// The server is restarting (stop followed by start).
    Restarting,
    /// A world save is in progress.
    Saving,
    /// The server is loading world data.
    Loading,
    /// The server process exited abnormally.
    Crashed,
    /// A start/stop action is queued but not yet begun.
    Pending,
}

impl ServerStatus {
    /// Statuses in which no server process exists.
    pub fn is_offline_like(self) -> bool {
        matches!(self, ServerStatus::Offline | ServerStatus::Crashed)
    }

    /// Statuses in which a live server process exists (possibly mid-transition).
    /// Streams that read process output are only eligible in these states.
    pub fn has_process(self) -> bool {
        matches!(
            self,
            ServerStatus::Starting
                | ServerStatus::Online
                | ServerStatus::Stopping
                | ServerStatus::Restarting
                | ServerStatus::Saving
                | ServerStatus::Loading
        )
    }
}

impl fmt::Display for ServerStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ServerStatus::Offline => "offline",
            ServerStatus::Preparing => "preparing",
            ServerStatus::Starting => "starting",
            ServerStatus::Online => "online",
            ServerStatus::Stopping => "stopping",
            ServerStatus::Restarting => "restarting",
            ServerStatus::Saving => "saving",
            ServerStatus::Loading => "loading",
            ServerStatus::Crashed => "crashed",
            ServerStatus::Pending => "pending",
        };
        write!(f, "{}", name)
    }
}

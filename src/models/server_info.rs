//! Immutable snapshot of the tracked server.
//!
//! The connection task keeps the latest snapshot and, on every status frame,
//! clones it before merging the new payload so status subscribers always see
//! an `(old, new)` pair.

use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

use super::server_status::ServerStatus;

/// Player slot usage reported alongside the server status.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PlayerCount {
    /// Maximum player slots.
    #[serde(default)]
    pub max: u32,
    /// Currently connected players.
    #[serde(default)]
    pub count: u32,
    /// Names of connected players, when the panel exposes them.
    #[serde(default)]
    pub list: Vec<String>,
}

/// Snapshot of the tracked server's publicly visible state.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ServerInfo {
    /// Panel-assigned server id.
    #[serde(default)]
    pub id: String,
    /// Display name.
    #[serde(default)]
    pub name: String,
    /// Connection address players use.
    #[serde(default)]
    pub address: String,
    /// Message of the day.
    #[serde(default)]
    pub motd: String,
    /// Current lifecycle status.
    #[serde(default)]
    pub status: ServerStatus,
    /// Player slot usage.
    #[serde(default)]
    pub players: PlayerCount,
}

impl ServerInfo {
    /// Merge a (possibly partial) status-frame payload over this snapshot and
    /// return the result. Fields absent from the payload keep their current
    /// values; fields that fail to decode are ignored.
    pub fn apply_status_payload(&self, data: &JsonValue) -> ServerInfo {
        let mut next = self.clone();
        let Some(obj) = data.as_object() else {
            return next;
        };

        if let Some(v) = obj.get("id").and_then(|v| v.as_str()) {
            next.id = v.to_string();
        }
        if let Some(v) = obj.get("name").and_then(|v| v.as_str()) {
            next.name = v.to_string();
        }
        if let Some(v) = obj.get("address").and_then(|v| v.as_str()) {
            next.address = v.to_string();
        }
        if let Some(v) = obj.get("motd").and_then(|v| v.as_str()) {
            next.motd = v.to_string();
        }
        if let Some(v) = obj.get("status") {
            if let Ok(status) = serde_json::from_value::<ServerStatus>(v.clone()) {
                next.status = status;
            }
        }
        if let Some(v) = obj.get("players") {
            if let Ok(players) = serde_json::from_value::<PlayerCount>(v.clone()) {
                next.players = players;
            }
        }

        next
    }
}

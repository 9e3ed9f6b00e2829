//! Connection-level behavior options.

use serde::{Deserialize, Serialize};

/// Options controlling connection lifecycle behavior.
///
/// Separate from [`PanelLinkTimeouts`](crate::timeouts::PanelLinkTimeouts),
/// which bounds individual operations.
///
/// # Example
///
/// ```rust
/// use panel_link::ConnectionOptions;
///
/// let options = ConnectionOptions::default()
///     .with_auto_reconnect(true)
///     .with_reconnect_interval_ms(5000);
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectionOptions {
    /// Automatically reconnect after the connection drops.
    /// Default: true.
    #[serde(default = "default_auto_reconnect")]
    pub auto_reconnect: bool,

    /// Fixed interval between reconnection attempts, in milliseconds.
    /// Default: 5000.
    ///
    /// There is no backoff and no attempt cap; every interval either
    /// reconnects or tries again one interval later. Callers that need a
    /// different recovery policy should disable auto-reconnect and drive
    /// reconnection themselves.
    #[serde(default = "default_reconnect_interval_ms")]
    pub reconnect_interval_ms: u64,
}

fn default_auto_reconnect() -> bool {
    true
}

fn default_reconnect_interval_ms() -> u64 {
    5000
}

impl Default for ConnectionOptions {
    fn default() -> Self {
        Self {
            auto_reconnect: true,
            reconnect_interval_ms: 5000,
        }
    }
}

impl ConnectionOptions {
    /// Create options with defaults.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set whether to automatically reconnect on connection loss.
    /// Takes effect on the next close event.
    pub fn with_auto_reconnect(mut self, enabled: bool) -> Self {
        self.auto_reconnect = enabled;
        self
    }

    /// Set the fixed interval between reconnection attempts, in milliseconds.
    pub fn with_reconnect_interval_ms(mut self, interval_ms: u64) -> Self {
        self.reconnect_interval_ms = interval_ms;
        self
    }
}

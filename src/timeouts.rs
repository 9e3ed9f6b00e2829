//! Timeout configuration for panel-link client operations.
//!
//! Centralizes the bounds applied to connection establishment, the ready
//! handshake, and management requests.

use std::time::Duration;

/// Timeout configuration for panel-link client operations.
///
/// # Examples
///
/// ```rust
/// use panel_link::PanelLinkTimeouts;
/// use std::time::Duration;
///
/// // Defaults are fine for most deployments.
/// let timeouts = PanelLinkTimeouts::default();
///
/// // Custom bounds for high-latency environments.
/// let timeouts = PanelLinkTimeouts::builder()
///     .connection_timeout(Duration::from_secs(30))
///     .request_timeout(Duration::from_secs(60))
///     .build();
/// ```
#[derive(Debug, Clone)]
pub struct PanelLinkTimeouts {
    /// Timeout for establishing the WebSocket connection (TCP + TLS +
    /// upgrade). Default: 10 seconds.
    pub connection_timeout: Duration,

    /// Timeout for management requests when no per-call deadline is given.
    /// Set to 0 to wait indefinitely. Default: 30 seconds.
    pub request_timeout: Duration,
}

impl Default for PanelLinkTimeouts {
    fn default() -> Self {
        Self {
            connection_timeout: Duration::from_secs(10),
            request_timeout: Duration::from_secs(30),
        }
    }
}

impl PanelLinkTimeouts {
    /// Create a builder for custom timeout configuration.
    pub fn builder() -> PanelLinkTimeoutsBuilder {
        PanelLinkTimeoutsBuilder::new()
    }

    /// Timeouts suited to fast local development against a nearby panel.
    pub fn fast() -> Self {
        Self {
            connection_timeout: Duration::from_secs(2),
            request_timeout: Duration::from_secs(5),
        }
    }

    /// Check whether a duration means "no timeout" (zero or absurdly large).
    pub fn is_no_timeout(duration: Duration) -> bool {
        duration.is_zero() || duration > Duration::from_secs(86400 * 365)
    }
}

/// Builder for [`PanelLinkTimeouts`].
#[derive(Debug, Clone)]
pub struct PanelLinkTimeoutsBuilder {
    timeouts: PanelLinkTimeouts,
}

impl PanelLinkTimeoutsBuilder {
    fn new() -> Self {
        Self {
            timeouts: PanelLinkTimeouts::default(),
        }
    }

    /// Set the connection establishment timeout.
    pub fn connection_timeout(mut self, timeout: Duration) -> Self {
        self.timeouts.connection_timeout = timeout;
        self
    }

    /// Set the connection establishment timeout in seconds.
    pub fn connection_timeout_secs(self, secs: u64) -> Self {
        self.connection_timeout(Duration::from_secs(secs))
    }

    /// Set the default management request timeout.
    /// Set to 0 to wait indefinitely.
    pub fn request_timeout(mut self, timeout: Duration) -> Self {
        self.timeouts.request_timeout = timeout;
        self
    }

    /// Set the default management request timeout in seconds.
    /// Set to 0 to wait indefinitely.
    pub fn request_timeout_secs(self, secs: u64) -> Self {
        self.request_timeout(Duration::from_secs(secs))
    }

    /// Build the timeout configuration.
    pub fn build(self) -> PanelLinkTimeouts {
        self.timeouts
    }
}

//! Connection lifecycle event handlers.
//!
//! Callback hooks for observing the shared connection:
//!
//! - [`on_connect`](EventHandlers::on_connect): socket established and authenticated
//! - [`on_ready`](EventHandlers::on_ready): ready handshake completed, outbound traffic flows
//! - [`on_disconnect`](EventHandlers::on_disconnect): connection closed (intentionally or not)
//! - [`on_error`](EventHandlers::on_error): connection or protocol error
//! - [`on_receive`](EventHandlers::on_receive) / [`on_send`](EventHandlers::on_send):
//!   debug hooks for raw frames
//!
//! # Example
//!
//! ```rust
//! use panel_link::EventHandlers;
//!
//! let handlers = EventHandlers::new()
//!     .on_ready(|| println!("ready, queued commands flushed"))
//!     .on_disconnect(|reason| println!("disconnected: {}", reason))
//!     .on_error(|error| eprintln!("connection error: {}", error));
//! ```

use std::fmt;
use std::sync::Arc;

/// Reason for a disconnect event.
#[derive(Debug, Clone)]
pub struct DisconnectReason {
    /// Human-readable description of why the connection closed.
    pub message: String,
    /// WebSocket close code, if available (1000 = normal, 1006 = abnormal).
    pub code: Option<u16>,
    /// Whether the remote side initiated the close.
    pub remote: bool,
}

impl DisconnectReason {
    /// A client-initiated disconnect.
    pub fn local(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            code: None,
            remote: false,
        }
    }

    /// A remote-initiated disconnect, optionally with a close code.
    pub fn remote(message: impl Into<String>, code: Option<u16>) -> Self {
        Self {
            message: message.into(),
            code,
            remote: true,
        }
    }
}

impl fmt::Display for DisconnectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.code {
            Some(code) => write!(f, "{} (code: {})", self.message, code),
            None => write!(f, "{}", self.message),
        }
    }
}

/// Error information passed to the `on_error` handler.
#[derive(Debug, Clone)]
pub struct ConnectionError {
    /// Human-readable error message.
    pub message: String,
    /// Whether auto-reconnect may recover from this error.
    pub recoverable: bool,
}

impl ConnectionError {
    /// Create a new connection error.
    pub fn new(message: impl Into<String>, recoverable: bool) -> Self {
        Self {
            message: message.into(),
            recoverable,
        }
    }
}

impl fmt::Display for ConnectionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

type OnConnectCallback = Arc<dyn Fn() + Send + Sync>;
type OnReadyCallback = Arc<dyn Fn() + Send + Sync>;
type OnDisconnectCallback = Arc<dyn Fn(DisconnectReason) + Send + Sync>;
type OnErrorCallback = Arc<dyn Fn(ConnectionError) + Send + Sync>;
type OnFrameCallback = Arc<dyn Fn(&str) + Send + Sync>;

/// Connection lifecycle event handlers.
///
/// All handlers are optional and `Send + Sync`; they are invoked from the
/// background connection task, so they must not block.
#[derive(Clone, Default)]
pub struct EventHandlers {
    pub(crate) on_connect: Option<OnConnectCallback>,
    pub(crate) on_ready: Option<OnReadyCallback>,
    pub(crate) on_disconnect: Option<OnDisconnectCallback>,
    pub(crate) on_error: Option<OnErrorCallback>,
    pub(crate) on_receive: Option<OnFrameCallback>,
    pub(crate) on_send: Option<OnFrameCallback>,
}

impl fmt::Debug for EventHandlers {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventHandlers")
            .field("on_connect", &self.on_connect.is_some())
            .field("on_ready", &self.on_ready.is_some())
            .field("on_disconnect", &self.on_disconnect.is_some())
            .field("on_error", &self.on_error.is_some())
            .field("on_receive", &self.on_receive.is_some())
            .field("on_send", &self.on_send.is_some())
            .finish()
    }
}

impl EventHandlers {
    /// Create an empty `EventHandlers` (no callbacks registered).
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a callback invoked when the socket is established.
    ///
    /// At this point the connection is still in the not-ready state; outbound
    /// commands continue to queue until `on_ready` fires.
    pub fn on_connect(mut self, f: impl Fn() + Send + Sync + 'static) -> Self {
        self.on_connect = Some(Arc::new(f));
        self
    }

    /// Register a callback invoked when the ready handshake completes and
    /// queued outbound messages have been flushed.
    pub fn on_ready(mut self, f: impl Fn() + Send + Sync + 'static) -> Self {
        self.on_ready = Some(Arc::new(f));
        self
    }

    /// Register a callback invoked when the connection closes.
    pub fn on_disconnect(mut self, f: impl Fn(DisconnectReason) + Send + Sync + 'static) -> Self {
        self.on_disconnect = Some(Arc::new(f));
        self
    }

    /// Register a callback invoked on connection or protocol errors.
    pub fn on_error(mut self, f: impl Fn(ConnectionError) + Send + Sync + 'static) -> Self {
        self.on_error = Some(Arc::new(f));
        self
    }

    /// Debug hook: receives the raw JSON of every inbound frame.
    pub fn on_receive(mut self, f: impl Fn(&str) + Send + Sync + 'static) -> Self {
        self.on_receive = Some(Arc::new(f));
        self
    }

    /// Debug hook: receives the raw JSON of every outbound frame.
    pub fn on_send(mut self, f: impl Fn(&str) + Send + Sync + 'static) -> Self {
        self.on_send = Some(Arc::new(f));
        self
    }

    pub(crate) fn emit_connect(&self) {
        if let Some(cb) = &self.on_connect {
            cb();
        }
    }

    pub(crate) fn emit_ready(&self) {
        if let Some(cb) = &self.on_ready {
            cb();
        }
    }

    pub(crate) fn emit_disconnect(&self, reason: DisconnectReason) {
        if let Some(cb) = &self.on_disconnect {
            cb(reason);
        }
    }

    pub(crate) fn emit_error(&self, error: ConnectionError) {
        if let Some(cb) = &self.on_error {
            cb(error);
        }
    }

    pub(crate) fn emit_receive(&self, raw: &str) {
        if let Some(cb) = &self.on_receive {
            cb(raw);
        }
    }

    pub(crate) fn emit_send(&self, raw: &str) {
        if let Some(cb) = &self.on_send {
            cb(raw);
        }
    }
}

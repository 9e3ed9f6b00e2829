//! # panel-link
//!
//! Client library for the hosting panel's real-time WebSocket layer. One
//! connection per tracked game server carries every logical stream: status
//! snapshots, console output, heap samples, performance stats, tick timings,
//! and a request/response channel to the server's management process.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use panel_link::{PanelLinkClient, StreamEvent, StreamKind};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let client = PanelLinkClient::builder()
//!         .url("https://panel.example.com/servers/1a2b/ws")
//!         .token("api-token")
//!         .build()?;
//!
//!     // The first subscription creates the shared connection.
//!     let mut console = client.subscribe(StreamKind::Console).await?;
//!
//!     // Safe to call immediately: queued until the panel signals readiness.
//!     client.send_console_command("say hello").await?;
//!
//!     while let Some(event) = console.next().await {
//!         if let StreamEvent::ConsoleLine(line) = event {
//!             println!("{}", line);
//!         }
//!     }
//!     Ok(())
//! }
//! ```
//!
//! ## Streams
//!
//! Streams are created lazily on first subscription and removed when their
//! last subscriber leaves. All of them except status are gated on the server
//! status: console runs whenever a server process exists, the rest only while
//! the server is online. Subscriptions to an ineligible stream stay
//! registered and resume automatically once the status allows it.
//!
//! ## Reconnection
//!
//! When the connection drops, the client reconnects on a fixed interval
//! (5 seconds by default, see [`ConnectionOptions`]). Subscriptions survive
//! reconnects; pending management requests fail with
//! [`PanelLinkError::ConnectionLost`] and queued console commands go out
//! after the next ready handshake.

mod client;
mod connection;
mod error;
mod event_handlers;
mod mailbox;
mod management;
pub mod models;
mod registry;
mod status_wait;
mod subscription;
mod timeouts;

pub use client::{PanelLinkClient, PanelLinkClientBuilder};
pub use error::{PanelLinkError, Result};
pub use event_handlers::{ConnectionError, DisconnectReason, EventHandlers};
pub use models::{
    ConnectionOptions, Envelope, HeapUsage, MemoryStats, PlayerCount, ServerInfo, ServerStatus,
    StatsData, StreamEvent, StreamKind, TickData,
};
pub use status_wait::StatusWaiter;
pub use subscription::StreamSubscription;
pub use timeouts::{PanelLinkTimeouts, PanelLinkTimeoutsBuilder};

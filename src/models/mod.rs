//! Data models for the panel-link client library.
//!
//! Defines the wire envelope, server snapshot types, the closed set of
//! stream kinds, subscriber events, and connection options.

pub mod connection_options;
pub mod envelope;
pub mod server_info;
pub mod server_status;
pub mod stream_event;
pub mod stream_kind;

pub use connection_options::ConnectionOptions;
pub use envelope::Envelope;
pub use server_info::{PlayerCount, ServerInfo};
pub use server_status::ServerStatus;
pub use stream_event::{HeapUsage, MemoryStats, StatsData, StreamEvent, TickData};
pub use stream_kind::StreamKind;

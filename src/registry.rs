//! Stream registry: subscriber bookkeeping and stream lifecycle gating.
//!
//! Owns the set of active streams on one connection. Streams are created
//! lazily on first subscription, started and stopped according to subscriber
//! presence and the server's current status, and reaped once their last
//! subscriber leaves. The status stream is special: it exists for the whole
//! lifetime of the registry and is never removed.
//!
//! Registry methods return the control envelopes (`start`/`stop`) that the
//! connection task must transmit; the registry itself never touches the
//! socket, which keeps every lifecycle rule unit-testable.

use std::collections::HashMap;
use tokio::sync::mpsc;

use crate::models::{Envelope, ServerStatus, StreamEvent, StreamKind};

/// Identifies one subscriber within a registry.
pub(crate) type SubscriberId = u64;

/// Per-subscriber event channel capacity. When a subscriber falls this far
/// behind, further events for it are dropped with a warning.
const SUBSCRIBER_CHANNEL_CAPACITY: usize = 256;

/// Lifecycle phase of one stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum StreamPhase {
    /// Registered but not running (ineligible, or nothing started it yet).
    Dormant,
    /// A `start` command has been sent; inbound data is expected.
    Started,
}

/// State for one active stream.
struct StreamState {
    phase: StreamPhase,
    subscribers: HashMap<SubscriberId, mpsc::Sender<StreamEvent>>,
}

impl StreamState {
    fn new() -> Self {
        Self {
            phase: StreamPhase::Dormant,
            subscribers: HashMap::new(),
        }
    }
}

/// The set of active streams for one connection.
pub(crate) struct StreamRegistry {
    streams: HashMap<StreamKind, StreamState>,
    next_subscriber_id: SubscriberId,
}

impl StreamRegistry {
    /// Create a registry with the always-present status stream.
    pub fn new() -> Self {
        let mut streams = HashMap::new();
        streams.insert(StreamKind::Status, StreamState::new());
        Self {
            streams,
            next_subscriber_id: 1,
        }
    }

    /// Recommended capacity for subscriber channels.
    pub fn subscriber_channel_capacity() -> usize {
        SUBSCRIBER_CHANNEL_CAPACITY
    }

    /// Register a subscriber, creating the stream entry if absent.
    ///
    /// Returns the subscriber id and, when the stream is status-gated,
    /// currently eligible and not yet running, the `start` command to send.
    /// Otherwise the stream stays dormant until [`on_status_changed`]
    /// (`Self::on_status_changed`) makes it eligible.
    pub fn add_subscriber(
        &mut self,
        kind: StreamKind,
        event_tx: mpsc::Sender<StreamEvent>,
        current: ServerStatus,
    ) -> (SubscriberId, Option<Envelope>) {
        let id = self.next_subscriber_id;
        self.next_subscriber_id += 1;

        let state = self.streams.entry(kind).or_insert_with(StreamState::new);
        state.subscribers.insert(id, event_tx);

        let start = if !kind.eligible_statuses().is_empty()
            && kind.eligible_under(current)
            && state.phase == StreamPhase::Dormant
        {
            state.phase = StreamPhase::Started;
            Some(kind.start_command())
        } else {
            None
        };

        (id, start)
    }

    /// Unregister a subscriber. A no-op when the stream does not exist.
    ///
    /// Stopping and removal of now-empty streams happens in [`reap_empty`]
    /// (`Self::reap_empty`); the status stream is never stopped here.
    pub fn remove_subscriber(&mut self, kind: StreamKind, id: SubscriberId) {
        if let Some(state) = self.streams.get_mut(&kind) {
            state.subscribers.remove(&id);
        }
    }

    /// Re-evaluate every stream against a new server status.
    ///
    /// Returns `start` commands for streams that just became eligible and
    /// have subscribers, and `stop` commands for running streams that became
    /// ineligible. Stream entries and their subscribers are kept either way,
    /// ready for when eligibility returns.
    pub fn on_status_changed(&mut self, new_status: ServerStatus) -> Vec<Envelope> {
        let mut commands = Vec::new();
        for kind in StreamKind::ALL {
            let Some(state) = self.streams.get_mut(&kind) else {
                continue;
            };
            if kind.eligible_statuses().is_empty() {
                continue;
            }
            let eligible = kind.eligible_under(new_status);
            match state.phase {
                StreamPhase::Dormant if eligible && !state.subscribers.is_empty() => {
                    state.phase = StreamPhase::Started;
                    commands.push(kind.start_command());
                },
                StreamPhase::Started if !eligible => {
                    state.phase = StreamPhase::Dormant;
                    commands.push(kind.stop_command());
                },
                _ => {},
            }
        }
        commands
    }

    /// Remove non-status streams with no subscribers left.
    ///
    /// Returns the `stop` commands for reaped streams that were running, and
    /// a flag that is true when only the empty status stream remains, i.e.
    /// the whole connection should be torn down.
    pub fn reap_empty(&mut self) -> (Vec<Envelope>, bool) {
        let mut commands = Vec::new();
        self.streams.retain(|kind, state| {
            if kind.is_status() || !state.subscribers.is_empty() {
                return true;
            }
            if state.phase == StreamPhase::Started {
                commands.push(kind.stop_command());
            }
            false
        });

        let teardown = self.streams.len() == 1
            && self
                .streams
                .get(&StreamKind::Status)
                .is_some_and(|s| s.subscribers.is_empty());
        (commands, teardown)
    }

    /// Mark every stream dormant (the connection dropped; any server-side
    /// stream state is gone). Eligible streams are restarted through
    /// [`resume_commands`](Self::resume_commands) after the next ready
    /// handshake.
    pub fn mark_all_dormant(&mut self) {
        for state in self.streams.values_mut() {
            state.phase = StreamPhase::Dormant;
        }
    }

    /// Start commands for every gated stream that has subscribers and is
    /// eligible under `current`. Used after a reconnect completes its ready
    /// handshake.
    pub fn resume_commands(&mut self, current: ServerStatus) -> Vec<Envelope> {
        self.on_status_changed(current)
    }

    /// Deliver an event to every current subscriber of `kind`.
    ///
    /// Each subscriber gets its own clone; a subscriber whose channel is full
    /// or closed misses the event (logged, never blocks the inbound path).
    pub fn dispatch(&self, kind: StreamKind, event: StreamEvent) {
        let Some(state) = self.streams.get(&kind) else {
            return;
        };
        for (id, tx) in &state.subscribers {
            if let Err(e) = tx.try_send(event.clone()) {
                log::warn!(
                    "[panel-link] Dropping {} event for subscriber {}: {}",
                    kind,
                    id,
                    e
                );
            }
        }
    }

    /// Whether a stream entry exists for `kind`.
    #[cfg(test)]
    pub fn has_stream(&self, kind: StreamKind) -> bool {
        self.streams.contains_key(&kind)
    }

    /// Number of subscribers currently registered for `kind`.
    #[cfg(test)]
    pub fn subscriber_count(&self, kind: StreamKind) -> usize {
        self.streams.get(&kind).map_or(0, |s| s.subscribers.len())
    }
}

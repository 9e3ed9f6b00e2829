//! Subscriber handle for one stream.
//!
//! A [`StreamSubscription`] is the receiving end of one subscriber slot in
//! the stream registry. Events arrive through [`next`](StreamSubscription::next)
//! in dispatch order; dropping or closing the handle unregisters the
//! subscriber, which may stop the underlying stream and, when nothing is left
//! subscribed anywhere, tear the whole connection down.

use tokio::sync::mpsc;

use crate::models::{StreamEvent, StreamKind};
use crate::registry::SubscriberId;

/// A live subscription to one stream.
///
/// Multiple subscriptions to the same stream are independent: each receives
/// its own copy of every event, and closing one leaves the others running.
pub struct StreamSubscription {
    kind: StreamKind,
    subscriber_id: SubscriberId,
    event_rx: mpsc::Receiver<StreamEvent>,
    unsub_tx: mpsc::Sender<(StreamKind, SubscriberId)>,
    closed: bool,
}

impl StreamSubscription {
    pub(crate) fn new(
        kind: StreamKind,
        subscriber_id: SubscriberId,
        event_rx: mpsc::Receiver<StreamEvent>,
        unsub_tx: mpsc::Sender<(StreamKind, SubscriberId)>,
    ) -> Self {
        Self {
            kind,
            subscriber_id,
            event_rx,
            unsub_tx,
            closed: false,
        }
    }

    /// The stream this subscription listens to.
    pub fn kind(&self) -> StreamKind {
        self.kind
    }

    /// Receive the next event.
    ///
    /// Returns `None` once the subscription is closed or the connection task
    /// has gone away. While the server status makes the stream ineligible no
    /// events arrive, but the subscription stays registered and events resume
    /// when eligibility returns.
    pub async fn next(&mut self) -> Option<StreamEvent> {
        if self.closed {
            return None;
        }
        self.event_rx.recv().await
    }

    /// Receive an already-buffered event without waiting, if any.
    pub fn try_next(&mut self) -> Option<StreamEvent> {
        if self.closed {
            return None;
        }
        self.event_rx.try_recv().ok()
    }

    /// Unregister this subscriber. Idempotent.
    pub fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        self.event_rx.close();
        // Fire-and-forget; the connection task reaps the slot.
        if let Err(e) = self.unsub_tx.try_send((self.kind, self.subscriber_id)) {
            log::debug!(
                "[panel-link] Failed to send unsubscribe for {} subscriber {}: {}",
                self.kind,
                self.subscriber_id,
                e
            );
        }
    }

    /// Whether [`close`](Self::close) has been called.
    pub fn is_closed(&self) -> bool {
        self.closed
    }
}

impl Drop for StreamSubscription {
    fn drop(&mut self) {
        self.close();
    }
}

//! Outbound mailbox: serialized messages waiting for connection readiness.
//!
//! Messages queue here whenever the connection is not in the ready state and
//! are flushed in enqueue order, exactly once, when the `ready` control frame
//! arrives. Each message may carry a delivery signal; the mailbox also offers
//! a queue-drained signal completed at the end of each flush and replaced
//! with a fresh one afterwards.

use std::collections::VecDeque;
use tokio::sync::oneshot;

use crate::error::Result;

/// One queued outbound message with its optional delivery signal.
pub(crate) struct QueuedMessage {
    /// Serialized wire payload.
    pub payload: String,
    /// Fired with the write outcome once the payload hits the transport.
    pub delivered_tx: Option<oneshot::Sender<Result<()>>>,
}

/// FIFO of serialized messages awaiting a ready connection.
#[derive(Default)]
pub(crate) struct OutboundMailbox {
    queue: VecDeque<QueuedMessage>,
    drained: Vec<oneshot::Sender<()>>,
}

impl OutboundMailbox {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a message to the queue.
    pub fn enqueue(&mut self, payload: String, delivered_tx: Option<oneshot::Sender<Result<()>>>) {
        self.queue.push_back(QueuedMessage {
            payload,
            delivered_tx,
        });
    }

    /// Take every queued message, in enqueue order, for writing.
    ///
    /// The caller writes them out and then calls [`signal_drained`]
    /// (`Self::signal_drained`) so drained-signal holders observe the flush.
    pub fn take_all(&mut self) -> Vec<QueuedMessage> {
        self.queue.drain(..).collect()
    }

    /// A signal completed at the end of the next flush.
    #[cfg(test)]
    pub fn drained_signal(&mut self) -> oneshot::Receiver<()> {
        let (tx, rx) = oneshot::channel();
        self.drained.push(tx);
        rx
    }

    /// Complete all current drained signals; subsequent callers get a fresh
    /// uncompleted signal.
    pub fn signal_drained(&mut self) {
        for tx in self.drained.drain(..) {
            let _ = tx.send(());
        }
    }

    #[cfg(test)]
    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.queue.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_take_all_preserves_enqueue_order() {
        let mut mailbox = OutboundMailbox::new();
        mailbox.enqueue("first".to_string(), None);
        mailbox.enqueue("second".to_string(), None);
        mailbox.enqueue("third".to_string(), None);

        let flushed: Vec<String> = mailbox.take_all().into_iter().map(|m| m.payload).collect();
        assert_eq!(flushed, vec!["first", "second", "third"]);
        assert!(mailbox.is_empty(), "a flush must consume every message");
    }

    #[test]
    fn test_messages_are_flushed_exactly_once() {
        let mut mailbox = OutboundMailbox::new();
        mailbox.enqueue("only".to_string(), None);
        assert_eq!(mailbox.take_all().len(), 1);
        assert_eq!(mailbox.take_all().len(), 0);
    }

    #[tokio::test]
    async fn test_drained_signal_fires_on_flush() {
        let mut mailbox = OutboundMailbox::new();
        mailbox.enqueue("msg".to_string(), None);
        let signal = mailbox.drained_signal();

        let _ = mailbox.take_all();
        mailbox.signal_drained();

        signal.await.expect("drained signal should fire after flush");
    }

    #[tokio::test]
    async fn test_drained_signal_is_replaced_after_flush() {
        let mut mailbox = OutboundMailbox::new();
        let first = mailbox.drained_signal();
        mailbox.signal_drained();
        first.await.expect("first signal fires on first flush");

        // A signal requested after the flush stays pending until the next one.
        let mut second = mailbox.drained_signal();
        assert!(second.try_recv().is_err());
        mailbox.signal_drained();
        second.await.expect("second signal fires on second flush");
    }

    #[tokio::test]
    async fn test_delivery_signal_travels_with_message() {
        let mut mailbox = OutboundMailbox::new();
        let (tx, rx) = oneshot::channel();
        mailbox.enqueue("payload".to_string(), Some(tx));

        let mut flushed = mailbox.take_all();
        let msg = flushed.pop().unwrap();
        msg.delivered_tx.unwrap().send(Ok(())).unwrap();
        assert!(rx.await.unwrap().is_ok());
    }
}

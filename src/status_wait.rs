//! One-shot bridge from "a future status update" to an awaitable result.
//!
//! A [`StatusWaiter`] is handed out by
//! [`wait_for_status`](crate::client::PanelLinkClient::wait_for_status). When
//! the server already has a target status the waiter is born resolved and no
//! subscriber is registered at all. Otherwise a transient wait entry rides
//! the connection task's status handling and resolves the waiter with the
//! first snapshot whose status lands in the target set, then unregisters
//! itself. Cancellation, timeout, and connection loss each resolve the
//! waiter with a distinct error.

use std::time::Duration;
use tokio::sync::{mpsc, oneshot};

use crate::connection::ConnCmd;
use crate::error::{PanelLinkError, Result};
use crate::models::{ServerInfo, ServerStatus};

/// Task-side state for one in-flight status wait.
pub(crate) struct StatusWaitEntry {
    pub id: u64,
    pub targets: Vec<ServerStatus>,
    pub tx: oneshot::Sender<Result<ServerInfo>>,
}

impl StatusWaitEntry {
    fn matches(&self, status: ServerStatus) -> bool {
        self.targets.contains(&status)
    }
}

/// Resolve and remove every wait entry matched by the new snapshot.
///
/// Each entry resolves at most once, with the first matching update; entries
/// waiting on other statuses stay registered.
pub(crate) fn resolve_matching(entries: &mut Vec<StatusWaitEntry>, info: &ServerInfo) {
    entries.retain_mut(|entry| {
        if !entry.matches(info.status) {
            return true;
        }
        // A failed send means the waiter is gone; drop the entry either way.
        let tx = std::mem::replace(&mut entry.tx, oneshot::channel().0);
        let _ = tx.send(Ok(info.clone()));
        false
    });
}

/// Awaitable handle for a single status wait.
///
/// Obtained from [`wait_for_status`](crate::client::PanelLinkClient::wait_for_status).
/// Resolves exactly once; the outcome is cached, so repeated `get` calls
/// return the same result.
pub struct StatusWaiter {
    entry_id: u64,
    rx: Option<oneshot::Receiver<Result<ServerInfo>>>,
    outcome: Option<Result<ServerInfo>>,
    cmd_tx: Option<mpsc::Sender<ConnCmd>>,
}

impl StatusWaiter {
    /// A waiter born resolved (the fast path: the current status already
    /// satisfies the target set, so no subscriber was registered).
    pub(crate) fn resolved(info: ServerInfo) -> Self {
        Self {
            entry_id: 0,
            rx: None,
            outcome: Some(Ok(info)),
            cmd_tx: None,
        }
    }

    /// A waiter backed by a registered wait entry in the connection task.
    pub(crate) fn pending(
        entry_id: u64,
        rx: oneshot::Receiver<Result<ServerInfo>>,
        cmd_tx: mpsc::Sender<ConnCmd>,
    ) -> Self {
        Self {
            entry_id,
            rx: Some(rx),
            outcome: None,
            cmd_tx: Some(cmd_tx),
        }
    }

    /// Whether the waiter already has an outcome (including error outcomes).
    pub fn is_resolved(&self) -> bool {
        self.outcome.is_some()
    }

    /// Wait until the target status is reached.
    ///
    /// Returns the server snapshot taken at the resolving update. Fails with
    /// [`PanelLinkError::Cancelled`] after [`cancel`](Self::cancel) and with
    /// [`PanelLinkError::ConnectionLost`] when the connection task exits
    /// before the wait resolves.
    pub async fn get(&mut self) -> Result<ServerInfo> {
        if let Some(outcome) = &self.outcome {
            return outcome.clone();
        }

        let outcome = match self.rx.take() {
            Some(rx) => match rx.await {
                Ok(result) => result,
                Err(_) => Err(PanelLinkError::ConnectionLost(
                    "Connection closed while waiting for status".to_string(),
                )),
            },
            None => Err(PanelLinkError::InternalError(
                "Status waiter has no pending receiver".to_string(),
            )),
        };
        self.detach();
        self.outcome = Some(outcome.clone());
        outcome
    }

    /// Wait up to `timeout` for the target status.
    ///
    /// On expiry the waiter unregisters its wait entry and resolves with
    /// [`PanelLinkError::TimeoutError`]; it will not resolve later.
    pub async fn get_timeout(&mut self, timeout: Duration) -> Result<ServerInfo> {
        if let Some(outcome) = &self.outcome {
            return outcome.clone();
        }
        let Some(mut rx) = self.rx.take() else {
            return Err(PanelLinkError::InternalError(
                "Status waiter has no pending receiver".to_string(),
            ));
        };

        let outcome = match tokio::time::timeout(timeout, &mut rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(PanelLinkError::ConnectionLost(
                "Connection closed while waiting for status".to_string(),
            )),
            Err(_) => Err(PanelLinkError::TimeoutError(format!(
                "Status not reached within {:?}",
                timeout
            ))),
        };
        self.detach();
        self.outcome = Some(outcome.clone());
        outcome
    }

    /// Cancel the wait.
    ///
    /// Returns true when the wait was still pending and is now cancelled;
    /// false when an outcome already exists (a no-op in that case). After a
    /// successful cancel, `get` returns [`PanelLinkError::Cancelled`].
    pub fn cancel(&mut self) -> bool {
        if self.outcome.is_some() {
            return false;
        }
        // The resolving update may have raced us; honor it if it did.
        if let Some(rx) = self.rx.as_mut() {
            if let Ok(result) = rx.try_recv() {
                self.rx = None;
                self.detach();
                self.outcome = Some(result);
                return false;
            }
        }
        self.rx = None;
        self.detach();
        self.outcome = Some(Err(PanelLinkError::Cancelled(
            "Status wait cancelled".to_string(),
        )));
        true
    }

    /// Tell the connection task to drop the wait entry so it never lingers.
    fn detach(&mut self) {
        let Some(cmd_tx) = self.cmd_tx.take() else {
            return;
        };
        let id = self.entry_id;
        match cmd_tx.try_send(ConnCmd::CancelStatusWait { id }) {
            Ok(()) => {},
            // Channel congestion: retry off the hot path when a runtime is
            // around, otherwise the next disconnect reaps the entry anyway.
            Err(mpsc::error::TrySendError::Full(cmd)) => {
                match tokio::runtime::Handle::try_current() {
                    Ok(handle) => {
                        handle.spawn(async move {
                            let _ = cmd_tx.send(cmd).await;
                        });
                    },
                    Err(_) => log::warn!(
                        "[panel-link] Could not cancel status wait {}: command channel full",
                        id
                    ),
                }
            },
            // The connection task is gone; nothing left to cancel.
            Err(mpsc::error::TrySendError::Closed(_)) => {},
        }
    }
}

impl Drop for StatusWaiter {
    fn drop(&mut self) {
        self.detach();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::PlayerCount;

    fn online_info() -> ServerInfo {
        ServerInfo {
            id: "srv".to_string(),
            status: ServerStatus::Online,
            players: PlayerCount {
                max: 20,
                count: 1,
                list: vec!["alice".to_string()],
            },
            ..Default::default()
        }
    }

    fn cmd_channel() -> (mpsc::Sender<ConnCmd>, mpsc::Receiver<ConnCmd>) {
        mpsc::channel(8)
    }

    #[tokio::test]
    async fn test_resolved_waiter_returns_immediately() {
        let mut waiter = StatusWaiter::resolved(online_info());
        assert!(waiter.is_resolved());
        let info = waiter.get().await.unwrap();
        assert_eq!(info.status, ServerStatus::Online);
        // The outcome is cached.
        assert_eq!(waiter.get().await.unwrap(), info);
    }

    #[tokio::test]
    async fn test_pending_waiter_resolves_via_entry() {
        let (cmd_tx, _cmd_rx) = cmd_channel();
        let (tx, rx) = oneshot::channel();
        let mut waiter = StatusWaiter::pending(1, rx, cmd_tx);
        assert!(!waiter.is_resolved());

        let mut entries = vec![StatusWaitEntry {
            id: 1,
            targets: vec![ServerStatus::Online, ServerStatus::Crashed],
            tx,
        }];
        resolve_matching(&mut entries, &online_info());
        assert!(entries.is_empty(), "resolved entries must self-unregister");

        let info = waiter.get().await.unwrap();
        assert_eq!(info.status, ServerStatus::Online);
    }

    #[tokio::test]
    async fn test_only_matching_entries_resolve() {
        let (tx_online, rx_online) = oneshot::channel();
        let (tx_crashed, mut rx_crashed) = oneshot::channel();
        let mut entries = vec![
            StatusWaitEntry {
                id: 1,
                targets: vec![ServerStatus::Online],
                tx: tx_online,
            },
            StatusWaitEntry {
                id: 2,
                targets: vec![ServerStatus::Crashed],
                tx: tx_crashed,
            },
        ];

        resolve_matching(&mut entries, &online_info());
        assert_eq!(entries.len(), 1, "the crashed waiter stays registered");
        assert_eq!(entries[0].id, 2);
        assert!(rx_online.await.unwrap().is_ok());
        assert!(rx_crashed.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_resolves_exactly_once() {
        let (tx, _rx) = oneshot::channel();
        let mut entries = vec![StatusWaitEntry {
            id: 1,
            targets: vec![ServerStatus::Online, ServerStatus::Crashed],
            tx,
        }];
        resolve_matching(&mut entries, &online_info());

        // A later update to another member of the set finds no entry.
        let crashed = ServerInfo {
            status: ServerStatus::Crashed,
            ..Default::default()
        };
        resolve_matching(&mut entries, &crashed);
        assert!(entries.is_empty());
    }

    #[tokio::test]
    async fn test_cancel_before_resolution() {
        let (cmd_tx, mut cmd_rx) = cmd_channel();
        let (_tx, rx) = oneshot::channel();
        let mut waiter = StatusWaiter::pending(7, rx, cmd_tx);

        assert!(waiter.cancel());
        assert!(matches!(
            waiter.get().await.unwrap_err(),
            PanelLinkError::Cancelled(_)
        ));
        // The wait entry is detached promptly.
        match cmd_rx.try_recv().unwrap() {
            ConnCmd::CancelStatusWait { id } => assert_eq!(id, 7),
            _ => panic!("unexpected command"),
        }
    }

    #[tokio::test]
    async fn test_cancel_survives_a_full_command_channel() {
        let (cmd_tx, mut cmd_rx) = mpsc::channel(1);
        cmd_tx.try_send(ConnCmd::Shutdown).unwrap(); // fills the channel
        let (_tx, rx) = oneshot::channel();
        let mut waiter = StatusWaiter::pending(5, rx, cmd_tx);

        assert!(waiter.cancel());

        // Drain the blocking command; the cancel arrives right behind it
        // instead of being dropped.
        assert!(matches!(cmd_rx.recv().await.unwrap(), ConnCmd::Shutdown));
        match cmd_rx.recv().await.unwrap() {
            ConnCmd::CancelStatusWait { id } => assert_eq!(id, 5),
            _ => panic!("unexpected command"),
        }
    }

    #[tokio::test]
    async fn test_cancel_after_resolution_is_a_no_op() {
        let mut waiter = StatusWaiter::resolved(online_info());
        assert!(!waiter.cancel());
        assert!(waiter.get().await.is_ok());
    }

    #[tokio::test]
    async fn test_cancel_races_with_resolution() {
        let (cmd_tx, _cmd_rx) = cmd_channel();
        let (tx, rx) = oneshot::channel();
        let mut waiter = StatusWaiter::pending(1, rx, cmd_tx);

        tx.send(Ok(online_info())).unwrap();
        // The update won the race; cancel honors it.
        assert!(!waiter.cancel());
        assert!(waiter.get().await.is_ok());
    }

    #[tokio::test]
    async fn test_get_timeout_expires() {
        let (cmd_tx, mut cmd_rx) = cmd_channel();
        let (_tx, rx) = oneshot::channel();
        let mut waiter = StatusWaiter::pending(3, rx, cmd_tx);

        let err = waiter.get_timeout(Duration::from_millis(20)).await.unwrap_err();
        assert!(matches!(err, PanelLinkError::TimeoutError(_)));
        // Expiry detaches the wait entry.
        assert!(matches!(
            cmd_rx.try_recv().unwrap(),
            ConnCmd::CancelStatusWait { id: 3 }
        ));
        // And the outcome sticks.
        assert!(matches!(
            waiter.get().await.unwrap_err(),
            PanelLinkError::TimeoutError(_)
        ));
    }

    #[tokio::test]
    async fn test_connection_loss_surfaces_distinctly() {
        let (cmd_tx, _cmd_rx) = cmd_channel();
        let (tx, rx) = oneshot::channel::<Result<ServerInfo>>();
        let mut waiter = StatusWaiter::pending(1, rx, cmd_tx);

        drop(tx); // connection task went away
        assert!(matches!(
            waiter.get().await.unwrap_err(),
            PanelLinkError::ConnectionLost(_)
        ));
    }

    #[tokio::test]
    async fn test_drop_detaches_entry() {
        let (cmd_tx, mut cmd_rx) = cmd_channel();
        let (_tx, rx) = oneshot::channel();
        drop(StatusWaiter::pending(9, rx, cmd_tx));
        assert!(matches!(
            cmd_rx.try_recv().unwrap(),
            ConnCmd::CancelStatusWait { id: 9 }
        ));
    }
}

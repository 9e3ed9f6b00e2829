//! Shared WebSocket connection manager.
//!
//! One background task per tracked server owns the physical socket and every
//! piece of connection-scoped state. It handles:
//!
//! - A single connection multiplexed across all streams (no per-stream sockets)
//! - The ready handshake: outbound messages queue until the panel sends `ready`
//! - Routing inbound data messages to the stream registry by stream name
//! - Management request/response correlation and failure on disconnect
//! - Automatic reconnection on a fixed interval (no backoff)
//! - Teardown once nothing remains subscribed anywhere
//!
//! Public API calls travel to the task over an `mpsc` command channel and get
//! their results back through `oneshot` channels, so the task is the only
//! place that ever touches the socket, the mailbox, the registry, or the
//! pending-request map. Inbound frames are processed strictly in arrival
//! order.

use futures_util::{SinkExt, StreamExt};
use serde_json::Value as JsonValue;
use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc, RwLock,
};
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_tungstenite::{
    connect_async,
    tungstenite::{
        client::IntoClientRequest,
        error::Error as WsError,
        http::header::{HeaderValue, AUTHORIZATION},
        protocol::Message,
    },
};

use crate::{
    error::{PanelLinkError, Result},
    event_handlers::{ConnectionError, DisconnectReason, EventHandlers},
    mailbox::{OutboundMailbox, QueuedMessage},
    management::{request_envelope, PendingRequests},
    models::{
        envelope::CONTROL_READY,
        Envelope, ServerInfo, ServerStatus, StreamEvent, StreamKind,
    },
    registry::{StreamRegistry, SubscriberId},
    status_wait::{resolve_matching, StatusWaitEntry, StatusWaiter},
    timeouts::PanelLinkTimeouts,
};

type WebSocketStream =
    tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<TcpStream>>;

/// Maximum accepted text frame size (64 MiB).
const MAX_WS_TEXT_MESSAGE_BYTES: usize = 64 << 20;

/// Connection lifecycle states.
///
/// Transitions are monotonic within one connection attempt:
/// `Disconnected → Connecting → OpenNotReady → Ready → Closing`. The
/// not-ready state is never skipped; only the inbound `ready` control frame
/// promotes a connection to `Ready`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ConnectionState {
    Disconnected,
    Connecting,
    OpenNotReady,
    Ready,
    Closing,
}

// ── Commands ────────────────────────────────────────────────────────────────

/// Commands sent from the public API to the background connection task.
pub(crate) enum ConnCmd {
    /// Register a subscriber on a stream (creating the stream lazily).
    Subscribe {
        kind: StreamKind,
        event_tx: mpsc::Sender<StreamEvent>,
        result_tx: oneshot::Sender<Result<SubscriberId>>,
    },
    /// Remove a subscriber from a stream.
    Unsubscribe {
        kind: StreamKind,
        subscriber_id: SubscriberId,
    },
    /// Send an outbound envelope; the signal fires once it hits the transport.
    SendCommand {
        envelope: Envelope,
        delivered_tx: oneshot::Sender<Result<()>>,
    },
    /// Issue a management request and receive `(correlation id, result slot)`.
    ManagementRequest {
        method: String,
        params: JsonValue,
        #[allow(clippy::type_complexity)]
        result_tx: oneshot::Sender<Result<(u64, oneshot::Receiver<Result<JsonValue>>)>>,
    },
    /// Drop a pending management request (caller timed out).
    CancelManagementRequest { id: u64 },
    /// Register a status wait and receive `(entry id, result slot)`.
    WaitForStatus {
        targets: Vec<ServerStatus>,
        #[allow(clippy::type_complexity)]
        result_tx: oneshot::Sender<(u64, oneshot::Receiver<Result<ServerInfo>>)>,
    },
    /// Drop a status wait entry (cancelled, timed out, or waiter dropped).
    CancelStatusWait { id: u64 },
    /// Gracefully shut the connection down.
    Shutdown,
}

// ── Connection core ─────────────────────────────────────────────────────────

/// Immediate writes and lifecycle outcomes produced by one core step.
struct Effects {
    /// Payloads to write to the transport now (empty while not ready).
    writes: Vec<QueuedMessage>,
    /// The mailbox was flushed into `writes`; complete the flush afterwards.
    ready_flush: bool,
    /// Nothing is subscribed anywhere; the connection should be torn down.
    teardown: bool,
}

impl Effects {
    fn none() -> Self {
        Self {
            writes: Vec::new(),
            ready_flush: false,
            teardown: false,
        }
    }
}

/// Connection-scoped state, separated from the socket so every routing and
/// lifecycle rule can be driven directly in tests.
struct ConnCore {
    registry: StreamRegistry,
    mailbox: OutboundMailbox,
    pending: PendingRequests,
    status_waits: Vec<StatusWaitEntry>,
    next_wait_id: u64,
    /// Shared snapshot of the tracked server, readable from any thread.
    server: Arc<RwLock<ServerInfo>>,
    /// Mirrors `state == Ready` for cheap `is_connected()` checks.
    ready_flag: Arc<AtomicBool>,
    state: ConnectionState,
    handlers: EventHandlers,
}

impl ConnCore {
    fn new(
        server: Arc<RwLock<ServerInfo>>,
        ready_flag: Arc<AtomicBool>,
        handlers: EventHandlers,
    ) -> Self {
        Self {
            registry: StreamRegistry::new(),
            mailbox: OutboundMailbox::new(),
            pending: PendingRequests::new(),
            status_waits: Vec::new(),
            next_wait_id: 1,
            server,
            ready_flag,
            state: ConnectionState::Disconnected,
            handlers,
        }
    }

    fn set_state(&mut self, next: ConnectionState) {
        if self.state != next {
            log::debug!("[panel-link] Connection state {:?} -> {:?}", self.state, next);
        }
        self.state = next;
        self.ready_flag
            .store(next == ConnectionState::Ready, Ordering::SeqCst);
    }

    fn current_status(&self) -> ServerStatus {
        self.server.read().unwrap().status
    }

    /// Write now when ready, otherwise park in the mailbox. The delivery
    /// signal follows the message either way.
    fn send_or_queue(
        &mut self,
        envelope: &Envelope,
        delivered_tx: Option<oneshot::Sender<Result<()>>>,
        out: &mut Vec<QueuedMessage>,
    ) {
        match envelope.to_json() {
            Ok(payload) => {
                if self.state == ConnectionState::Ready {
                    out.push(QueuedMessage {
                        payload,
                        delivered_tx,
                    });
                } else {
                    self.mailbox.enqueue(payload, delivered_tx);
                }
            },
            Err(e) => {
                if let Some(tx) = delivered_tx {
                    let _ = tx.send(Err(e));
                } else {
                    log::warn!("[panel-link] Failed to serialize outbound message: {}", e);
                }
            },
        }
    }

    /// Write a registry control command (`start`/`stop`) when ready.
    ///
    /// While not ready these are dropped rather than queued: server-side
    /// stream state does not survive a reconnect, and the ready handshake
    /// regenerates start commands from the registry via `resume_commands`.
    fn control_write(&mut self, envelope: Envelope, out: &mut Vec<QueuedMessage>) {
        if self.state != ConnectionState::Ready {
            return;
        }
        match envelope.to_json() {
            Ok(payload) => out.push(QueuedMessage {
                payload,
                delivered_tx: None,
            }),
            Err(e) => log::warn!("[panel-link] Failed to serialize stream control: {}", e),
        }
    }

    /// Process one inbound text frame, in arrival order.
    fn on_inbound_text(&mut self, text: &str) -> Effects {
        self.handlers.emit_receive(text);

        let envelope = match Envelope::parse(text) {
            Ok(envelope) => envelope,
            Err(e) => {
                log::warn!("[panel-link] Dropping undecodable frame: {}", e);
                return Effects::none();
            },
        };

        if envelope.is_control() {
            return self.on_control(&envelope.kind);
        }

        let kind = match envelope.stream.as_deref() {
            Some(name) => match StreamKind::from_wire(name) {
                Some(kind) => kind,
                None => {
                    log::warn!("[panel-link] Dropping message for unknown stream '{}'", name);
                    return Effects::none();
                },
            },
            // Status frames may arrive without a stream tag.
            None if envelope.kind == "status" => StreamKind::Status,
            None => {
                log::debug!("[panel-link] Dropping untagged message type '{}'", envelope.kind);
                return Effects::none();
            },
        };

        match kind {
            StreamKind::Status if envelope.kind == "status" => {
                self.on_status_frame(envelope.data.as_ref())
            },
            StreamKind::Management if envelope.kind == "response" => {
                if let Some(data) = envelope.data.as_ref() {
                    self.pending.handle_response(data);
                }
                Effects::none()
            },
            _ => {
                match StreamEvent::decode(kind, &envelope.kind, envelope.data.as_ref()) {
                    Some(event) => self.registry.dispatch(kind, event),
                    None => log::debug!(
                        "[panel-link] Dropping unrecognized {} message type '{}'",
                        kind,
                        envelope.kind
                    ),
                }
                Effects::none()
            },
        }
    }

    /// Handle a reserved connection-level control type.
    fn on_control(&mut self, kind: &str) -> Effects {
        if kind == CONTROL_READY {
            return self.on_ready();
        }
        // connected / keep-alive / disconnected need no reaction.
        log::debug!("[panel-link] Control message '{}'", kind);
        Effects::none()
    }

    /// The ready handshake completed: flush the mailbox in enqueue order and
    /// restart eligible streams that have subscribers.
    fn on_ready(&mut self) -> Effects {
        self.set_state(ConnectionState::Ready);

        let mut effects = Effects::none();
        effects.ready_flush = true;
        effects.writes = self.mailbox.take_all();

        let current = self.current_status();
        for command in self.registry.resume_commands(current) {
            self.control_write(command, &mut effects.writes);
        }
        effects
    }

    /// Complete a successful mailbox flush: signal drained watchers and give
    /// them a fresh uncompleted signal, then announce readiness.
    fn after_flush(&mut self) {
        self.mailbox.signal_drained();
        self.handlers.emit_ready();
    }

    /// Apply a status frame: update the snapshot, fan out the `(old, new)`
    /// pair, resolve matching status waits, and re-gate streams.
    fn on_status_frame(&mut self, data: Option<&JsonValue>) -> Effects {
        let Some(data) = data else {
            log::debug!("[panel-link] Dropping status frame without data");
            return Effects::none();
        };

        let old = self.server.read().unwrap().clone();
        let new = old.apply_status_payload(data);
        *self.server.write().unwrap() = new.clone();

        self.registry.dispatch(
            StreamKind::Status,
            StreamEvent::StatusChanged {
                old: old.clone(),
                new: new.clone(),
            },
        );
        resolve_matching(&mut self.status_waits, &new);

        let mut effects = Effects::none();
        if old.status != new.status {
            log::info!("[panel-link] Server status {} -> {}", old.status, new.status);
            for command in self.registry.on_status_changed(new.status) {
                self.control_write(command, &mut effects.writes);
            }
            let (stops, teardown) = self.registry.reap_empty();
            for command in stops {
                self.control_write(command, &mut effects.writes);
            }
            effects.teardown = teardown;
        }
        effects
    }

    /// Process one public-API command.
    fn handle_cmd(&mut self, cmd: ConnCmd) -> Effects {
        let mut effects = Effects::none();
        match cmd {
            ConnCmd::Subscribe {
                kind,
                event_tx,
                result_tx,
            } => {
                // Gated streams only start over a ready connection; the ready
                // handshake starts anything subscribed earlier.
                let gating_status = if self.state == ConnectionState::Ready {
                    self.current_status()
                } else {
                    ServerStatus::Offline
                };
                let (id, start) = self.registry.add_subscriber(kind, event_tx, gating_status);
                if let Some(command) = start {
                    self.control_write(command, &mut effects.writes);
                }
                let _ = result_tx.send(Ok(id));
            },
            ConnCmd::Unsubscribe {
                kind,
                subscriber_id,
            } => {
                self.registry.remove_subscriber(kind, subscriber_id);
                let (stops, teardown) = self.registry.reap_empty();
                for command in stops {
                    self.control_write(command, &mut effects.writes);
                }
                effects.teardown = teardown;
            },
            ConnCmd::SendCommand {
                envelope,
                delivered_tx,
            } => {
                self.send_or_queue(&envelope, Some(delivered_tx), &mut effects.writes);
            },
            ConnCmd::ManagementRequest {
                method,
                params,
                result_tx,
            } => {
                let status = self.current_status();
                if !StreamKind::Management.eligible_under(status) {
                    let _ = result_tx.send(Err(PanelLinkError::Unavailable(format!(
                        "Management process is not reachable while the server is {}",
                        status
                    ))));
                } else {
                    let (id, response_rx) = self.pending.register();
                    let envelope = request_envelope(id, &method, params);
                    match envelope.to_json() {
                        Ok(_) => {
                            self.send_or_queue(&envelope, None, &mut effects.writes);
                            let _ = result_tx.send(Ok((id, response_rx)));
                        },
                        Err(e) => {
                            self.pending.forget(id);
                            let _ = result_tx.send(Err(e));
                        },
                    }
                }
            },
            ConnCmd::CancelManagementRequest { id } => {
                self.pending.forget(id);
            },
            ConnCmd::WaitForStatus { targets, result_tx } => {
                let (tx, rx) = oneshot::channel();
                let current = self.server.read().unwrap().clone();
                if targets.contains(&current.status) {
                    // Already satisfied: resolve without registering anything.
                    let _ = tx.send(Ok(current));
                    let _ = result_tx.send((0, rx));
                } else {
                    let id = self.next_wait_id;
                    self.next_wait_id += 1;
                    self.status_waits.push(StatusWaitEntry { id, targets, tx });
                    let _ = result_tx.send((id, rx));
                }
            },
            ConnCmd::CancelStatusWait { id } => {
                self.status_waits.retain(|entry| entry.id != id);
            },
            ConnCmd::Shutdown => {
                // Handled by the task loop; never reaches the core.
            },
        }
        effects
    }

    /// The connection dropped (remote close, read error, or send failure).
    ///
    /// Pending management requests are failed in this same step so none is
    /// ever left unresolved; subscriber registrations, queued sends, and
    /// status waits all survive for the next connection.
    fn on_disconnected(&mut self, reason: DisconnectReason) {
        self.set_state(ConnectionState::Disconnected);
        self.pending
            .fail_all(PanelLinkError::ConnectionLost(reason.message.clone()));
        self.registry.mark_all_dormant();
        self.handlers.emit_disconnect(reason);
    }

    /// Explicit client-initiated shutdown. Pending management requests are
    /// failed here too, so no caller is left waiting on a closed connection.
    fn on_shutdown(&mut self) {
        self.set_state(ConnectionState::Closing);
        self.pending.fail_all(PanelLinkError::ConnectionLost(
            "Client closed the connection".to_string(),
        ));
        for entry in self.status_waits.drain(..) {
            let _ = entry.tx.send(Err(PanelLinkError::ConnectionLost(
                "Client closed the connection".to_string(),
            )));
        }
    }
}

// ── PanelConnection (public handle) ─────────────────────────────────────────

/// Handle to one shared connection. Cloned senders reach the background task;
/// dropping the handle requests shutdown.
pub(crate) struct PanelConnection {
    cmd_tx: mpsc::Sender<ConnCmd>,
    /// Fire-and-forget unsubscribe channel used by subscription handles in
    /// `close()` / `Drop`; a bridge task forwards entries as
    /// [`ConnCmd::Unsubscribe`].
    unsub_tx: mpsc::Sender<(StreamKind, SubscriberId)>,
    ready: Arc<AtomicBool>,
    server: Arc<RwLock<ServerInfo>>,
    _task: JoinHandle<()>,
    _unsub_bridge: JoinHandle<()>,
}

impl PanelConnection {
    /// Spawn the background connection task and wait for the initial connect
    /// attempt. An initial failure is logged, not fatal: the task stays alive
    /// and auto-reconnect (when enabled) keeps trying.
    pub async fn connect(
        ws_url: String,
        token: String,
        timeouts: PanelLinkTimeouts,
        options: crate::models::ConnectionOptions,
        handlers: EventHandlers,
    ) -> Result<Self> {
        let (cmd_tx, cmd_rx) = mpsc::channel::<ConnCmd>(256);
        let ready = Arc::new(AtomicBool::new(false));
        let server = Arc::new(RwLock::new(ServerInfo::default()));

        let (init_tx, init_rx) = oneshot::channel::<Result<()>>();
        let ready_clone = ready.clone();
        let server_clone = server.clone();
        let task = tokio::spawn(async move {
            connection_task(
                cmd_rx,
                ws_url,
                token,
                timeouts,
                options,
                handlers,
                ready_clone,
                server_clone,
                Some(init_tx),
            )
            .await;
        });

        match init_rx.await {
            Ok(Ok(())) => {},
            Ok(Err(e)) => {
                log::warn!("[panel-link] Initial connection failed: {}", e);
            },
            Err(_) => {
                log::warn!("[panel-link] Connection task exited before signalling readiness");
            },
        }

        let (unsub_tx, mut unsub_rx) = mpsc::channel::<(StreamKind, SubscriberId)>(256);
        let cmd_tx_bridge = cmd_tx.clone();
        let unsub_bridge = tokio::spawn(async move {
            while let Some((kind, subscriber_id)) = unsub_rx.recv().await {
                let _ = cmd_tx_bridge
                    .send(ConnCmd::Unsubscribe {
                        kind,
                        subscriber_id,
                    })
                    .await;
            }
        });

        Ok(Self {
            cmd_tx,
            unsub_tx,
            ready,
            server,
            _task: task,
            _unsub_bridge: unsub_bridge,
        })
    }

    /// Register a subscriber on `kind`, creating the stream if needed.
    pub async fn subscribe(
        &self,
        kind: StreamKind,
    ) -> Result<(SubscriberId, mpsc::Receiver<StreamEvent>)> {
        let (event_tx, event_rx) =
            mpsc::channel(StreamRegistry::subscriber_channel_capacity());
        let (result_tx, result_rx) = oneshot::channel();

        self.cmd_tx
            .send(ConnCmd::Subscribe {
                kind,
                event_tx,
                result_tx,
            })
            .await
            .map_err(|_| {
                PanelLinkError::WebSocketError("Connection task is not running".to_string())
            })?;

        let id = result_rx.await.map_err(|_| {
            PanelLinkError::WebSocketError(
                "Connection task exited before confirming subscription".to_string(),
            )
        })??;

        Ok((id, event_rx))
    }

    /// Clone the fire-and-forget unsubscribe sender for subscription handles.
    pub fn unsubscribe_tx(&self) -> mpsc::Sender<(StreamKind, SubscriberId)> {
        self.unsub_tx.clone()
    }

    /// Send an outbound envelope; resolves once it has hit the transport
    /// (immediately when ready, after the flush that follows `ready`
    /// otherwise).
    pub async fn send_command(&self, envelope: Envelope) -> Result<()> {
        let (delivered_tx, delivered_rx) = oneshot::channel();
        self.cmd_tx
            .send(ConnCmd::SendCommand {
                envelope,
                delivered_tx,
            })
            .await
            .map_err(|_| {
                PanelLinkError::WebSocketError("Connection task is not running".to_string())
            })?;
        delivered_rx.await.map_err(|_| {
            PanelLinkError::ConnectionLost(
                "Connection closed before the message was delivered".to_string(),
            )
        })?
    }

    /// Issue a management request and await the correlated response.
    ///
    /// `timeout` bounds the wait for the response; on expiry the pending
    /// entry is dropped and [`PanelLinkError::TimeoutError`] is returned.
    pub async fn management_request(
        &self,
        method: &str,
        params: JsonValue,
        timeout: Option<Duration>,
    ) -> Result<JsonValue> {
        let (result_tx, result_rx) = oneshot::channel();
        self.cmd_tx
            .send(ConnCmd::ManagementRequest {
                method: method.to_string(),
                params,
                result_tx,
            })
            .await
            .map_err(|_| {
                PanelLinkError::WebSocketError("Connection task is not running".to_string())
            })?;

        let (id, response_rx) = result_rx.await.map_err(|_| {
            PanelLinkError::WebSocketError(
                "Connection task exited before accepting the request".to_string(),
            )
        })??;

        let lost = || {
            PanelLinkError::ConnectionLost(
                "Connection closed before the response arrived".to_string(),
            )
        };

        match timeout {
            Some(bound) if !PanelLinkTimeouts::is_no_timeout(bound) => {
                match tokio::time::timeout(bound, response_rx).await {
                    Ok(Ok(result)) => result,
                    Ok(Err(_)) => Err(lost()),
                    Err(_) => {
                        // Awaited off the hot path so the pending entry is
                        // dropped even when the command channel is full.
                        let cmd_tx = self.cmd_tx.clone();
                        tokio::spawn(async move {
                            let _ = cmd_tx.send(ConnCmd::CancelManagementRequest { id }).await;
                        });
                        Err(PanelLinkError::TimeoutError(format!(
                            "No management response within {:?}",
                            bound
                        )))
                    },
                }
            },
            _ => response_rx.await.map_err(|_| lost())?,
        }
    }

    /// Wait for the server to reach any status in `targets`.
    pub async fn wait_for_status(&self, targets: &[ServerStatus]) -> Result<StatusWaiter> {
        // Fast path: no subscriber or wait entry is registered at all.
        let current = self.server.read().unwrap().clone();
        if targets.contains(&current.status) {
            return Ok(StatusWaiter::resolved(current));
        }

        let (result_tx, result_rx) = oneshot::channel();
        self.cmd_tx
            .send(ConnCmd::WaitForStatus {
                targets: targets.to_vec(),
                result_tx,
            })
            .await
            .map_err(|_| {
                PanelLinkError::WebSocketError("Connection task is not running".to_string())
            })?;

        let (id, rx) = result_rx.await.map_err(|_| {
            PanelLinkError::WebSocketError(
                "Connection task exited before registering the wait".to_string(),
            )
        })?;
        Ok(StatusWaiter::pending(id, rx, self.cmd_tx.clone()))
    }

    /// Latest snapshot of the tracked server.
    pub fn server_info(&self) -> ServerInfo {
        self.server.read().unwrap().clone()
    }

    /// Whether the connection is currently ready for outbound traffic.
    pub fn is_connected(&self) -> bool {
        self.ready.load(Ordering::Relaxed)
    }

    /// Whether the background task is still running.
    pub fn is_alive(&self) -> bool {
        !self.cmd_tx.is_closed()
    }

    /// Gracefully shut down the connection and its background task.
    pub async fn close(&self) {
        let _ = self.cmd_tx.send(ConnCmd::Shutdown).await;
    }
}

impl Drop for PanelConnection {
    fn drop(&mut self) {
        // Best-effort shutdown signal.
        let _ = self.cmd_tx.try_send(ConnCmd::Shutdown);
    }
}

// ── Background connection task ──────────────────────────────────────────────

/// Establish the WebSocket connection with the bearer token attached.
async fn establish_ws(
    ws_url: &str,
    token: &str,
    timeouts: &PanelLinkTimeouts,
    handlers: &EventHandlers,
) -> Result<WebSocketStream> {
    log::debug!("[panel-link] Establishing WebSocket connection to {}", ws_url);

    let mut request = ws_url.into_client_request().map_err(|e| {
        PanelLinkError::WebSocketError(format!("Failed to build WebSocket request: {}", e))
    })?;
    let header = HeaderValue::from_str(&format!("Bearer {}", token)).map_err(|e| {
        PanelLinkError::AuthenticationError(format!(
            "Token is not usable in an Authorization header: {}",
            e
        ))
    })?;
    request.headers_mut().insert(AUTHORIZATION, header);

    let connect_result = if !PanelLinkTimeouts::is_no_timeout(timeouts.connection_timeout) {
        tokio::time::timeout(timeouts.connection_timeout, connect_async(request)).await
    } else {
        Ok(connect_async(request).await)
    };

    match connect_result {
        Ok(Ok((stream, _response))) => Ok(stream),
        Ok(Err(WsError::Http(response))) => {
            let status = response.status();
            let message = match status.as_u16() {
                401 => "Unauthorized: the panel rejected the token".to_string(),
                403 => "Forbidden: access to this server denied".to_string(),
                code => format!("WebSocket HTTP error: {}", code),
            };
            handlers.emit_error(ConnectionError::new(&message, false));
            if matches!(status.as_u16(), 401 | 403) {
                Err(PanelLinkError::AuthenticationError(message))
            } else {
                Err(PanelLinkError::WebSocketError(message))
            }
        },
        Ok(Err(e)) => {
            let message = format!("Connection failed: {}", e);
            handlers.emit_error(ConnectionError::new(&message, true));
            Err(PanelLinkError::WebSocketError(message))
        },
        Err(_) => {
            let message = format!("Connection timeout ({:?})", timeouts.connection_timeout);
            handlers.emit_error(ConnectionError::new(&message, true));
            Err(PanelLinkError::TimeoutError(message))
        },
    }
}

/// Write a batch of messages, firing delivery signals as they go out.
///
/// On a send failure the unwritten remainder (including the failing message)
/// is re-queued in order, so it goes out after the next ready handshake.
async fn flush_writes(
    core: &mut ConnCore,
    ws: &mut WebSocketStream,
    writes: Vec<QueuedMessage>,
) -> std::result::Result<(), String> {
    let mut iter = writes.into_iter();
    while let Some(message) = iter.next() {
        match ws.send(Message::Text(message.payload.clone().into())).await {
            Ok(()) => {
                core.handlers.emit_send(&message.payload);
                if let Some(tx) = message.delivered_tx {
                    let _ = tx.send(Ok(()));
                }
            },
            Err(e) => {
                let reason = e.to_string();
                log::warn!("[panel-link] WebSocket send failed: {}", reason);
                core.mailbox.enqueue(message.payload, message.delivered_tx);
                for rest in iter {
                    core.mailbox.enqueue(rest.payload, rest.delivered_tx);
                }
                return Err(reason);
            },
        }
    }
    Ok(())
}

/// The background task owning the socket and all connection-scoped state.
///
/// Lifecycle:
/// 1. Connect (with the bearer token) and wait for the `ready` control frame
/// 2. Event loop: read frames in arrival order + process API commands
/// 3. On disconnect: fail pending management requests, then retry on a fixed
///    interval while auto-reconnect is enabled
/// 4. Exit when nothing remains subscribed or on explicit shutdown
#[allow(clippy::too_many_arguments)]
async fn connection_task(
    mut cmd_rx: mpsc::Receiver<ConnCmd>,
    ws_url: String,
    token: String,
    timeouts: PanelLinkTimeouts,
    options: crate::models::ConnectionOptions,
    handlers: EventHandlers,
    ready_flag: Arc<AtomicBool>,
    server: Arc<RwLock<ServerInfo>>,
    init_tx: Option<oneshot::Sender<Result<()>>>,
) {
    let mut core = ConnCore::new(server, ready_flag, handlers);
    let mut ws: Option<WebSocketStream> = None;
    let mut shutdown_requested = false;

    core.set_state(ConnectionState::Connecting);
    match establish_ws(&ws_url, &token, &timeouts, &core.handlers).await {
        Ok(stream) => {
            ws = Some(stream);
            core.set_state(ConnectionState::OpenNotReady);
            core.handlers.emit_connect();
            if let Some(tx) = init_tx {
                let _ = tx.send(Ok(()));
            }
        },
        Err(e) => {
            core.set_state(ConnectionState::Disconnected);
            if let Some(tx) = init_tx {
                let _ = tx.send(Err(e));
            }
        },
    }

    loop {
        if shutdown_requested {
            core.on_shutdown();
            if let Some(mut stream) = ws.take() {
                let _ = stream.close(None).await;
                core.handlers
                    .emit_disconnect(DisconnectReason::local("Client closed the connection"));
            }
            core.set_state(ConnectionState::Disconnected);
            return;
        }

        if let Some(mut stream) = ws.take() {
            // A dropped connection is recorded here and applied once the
            // stream borrow held by the select is released.
            let mut lost: Option<DisconnectReason> = None;
            tokio::select! {
                biased;

                // Commands from the public API
                cmd = cmd_rx.recv() => {
                    match cmd {
                        Some(ConnCmd::Shutdown) | None => {
                            shutdown_requested = true;
                        },
                        Some(cmd) => {
                            let effects = core.handle_cmd(cmd);
                            match flush_writes(&mut core, &mut stream, effects.writes).await {
                                Ok(()) => {
                                    if effects.teardown {
                                        log::debug!("[panel-link] Nothing subscribed, tearing the connection down");
                                        shutdown_requested = true;
                                    }
                                },
                                Err(reason) => {
                                    lost = Some(DisconnectReason::local(format!("Send failed: {}", reason)));
                                },
                            }
                        },
                    }
                }

                // Inbound frames, strictly in arrival order
                frame = stream.next() => {
                    match frame {
                        Some(Ok(Message::Text(text))) => {
                            if text.len() > MAX_WS_TEXT_MESSAGE_BYTES {
                                log::warn!("[panel-link] Text frame too large ({} bytes)", text.len());
                            } else {
                                let effects = core.on_inbound_text(&text);
                                match flush_writes(&mut core, &mut stream, effects.writes).await {
                                    Ok(()) => {
                                        if effects.ready_flush {
                                            core.after_flush();
                                        }
                                        if effects.teardown {
                                            shutdown_requested = true;
                                        }
                                    },
                                    Err(reason) => {
                                        lost = Some(DisconnectReason::local(format!("Send failed: {}", reason)));
                                    },
                                }
                            }
                        },
                        Some(Ok(Message::Binary(_))) => {
                            log::debug!("[panel-link] Dropping unexpected binary frame");
                        },
                        Some(Ok(Message::Ping(payload))) => {
                            let _ = stream.send(Message::Pong(payload)).await;
                        },
                        Some(Ok(Message::Pong(_) | Message::Frame(_))) => {},
                        Some(Ok(Message::Close(frame))) => {
                            lost = Some(match frame {
                                Some(f) => DisconnectReason::remote(
                                    f.reason.to_string(),
                                    Some(f.code.into()),
                                ),
                                None => DisconnectReason::remote("Server closed the connection", None),
                            });
                        },
                        Some(Err(e)) => {
                            let message = e.to_string();
                            core.handlers.emit_error(ConnectionError::new(&message, true));
                            lost = Some(DisconnectReason::remote(
                                format!("WebSocket error: {}", message),
                                None,
                            ));
                        },
                        None => {
                            lost = Some(DisconnectReason::remote("WebSocket stream ended", None));
                        },
                    }
                }
            }

            match lost {
                Some(reason) => core.on_disconnected(reason),
                None => ws = Some(stream),
            }
        } else {
            // ── Disconnected ────────────────────────────────────────────────

            if !options.auto_reconnect {
                // Keep serving bookkeeping commands; nothing will be
                // delivered until the caller tears the client down.
                match cmd_rx.recv().await {
                    Some(ConnCmd::Shutdown) | None => {
                        shutdown_requested = true;
                    },
                    Some(ConnCmd::Subscribe { result_tx, .. }) => {
                        let _ = result_tx.send(Err(PanelLinkError::WebSocketError(
                            "Not connected and auto-reconnect is disabled".to_string(),
                        )));
                    },
                    Some(cmd) => {
                        let effects = core.handle_cmd(cmd);
                        if effects.teardown {
                            shutdown_requested = true;
                        }
                    },
                }
                continue;
            }

            // Fixed-interval reconnection: one attempt per interval, no
            // backoff, no attempt cap. Commands keep flowing while we wait.
            let interval = Duration::from_millis(options.reconnect_interval_ms.max(1));
            log::info!("[panel-link] Reconnecting in {:?}", interval);

            let sleep_fut = tokio::time::sleep(interval);
            tokio::pin!(sleep_fut);
            loop {
                tokio::select! {
                    biased;
                    cmd = cmd_rx.recv() => {
                        match cmd {
                            Some(ConnCmd::Shutdown) | None => {
                                shutdown_requested = true;
                                break;
                            },
                            Some(cmd) => {
                                let effects = core.handle_cmd(cmd);
                                if effects.teardown {
                                    shutdown_requested = true;
                                    break;
                                }
                            },
                        }
                    }
                    _ = &mut sleep_fut => break,
                }
            }
            if shutdown_requested {
                continue;
            }

            core.set_state(ConnectionState::Connecting);
            match establish_ws(&ws_url, &token, &timeouts, &core.handlers).await {
                Ok(stream) => {
                    log::info!("[panel-link] Reconnected, awaiting ready handshake");
                    ws = Some(stream);
                    core.set_state(ConnectionState::OpenNotReady);
                    core.handlers.emit_connect();
                },
                Err(e) => {
                    core.set_state(ConnectionState::Disconnected);
                    log::warn!("[panel-link] Reconnection attempt failed: {}", e);
                },
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn test_core() -> ConnCore {
        ConnCore::new(
            Arc::new(RwLock::new(ServerInfo::default())),
            Arc::new(AtomicBool::new(false)),
            EventHandlers::new(),
        )
    }

    /// Drive the core to the ready state, discarding the (empty) flush.
    fn ready_core() -> ConnCore {
        let mut core = test_core();
        core.set_state(ConnectionState::OpenNotReady);
        let effects = core.on_inbound_text(r#"{"type":"ready"}"#);
        assert!(effects.ready_flush);
        core.after_flush();
        core
    }

    fn subscribe(core: &mut ConnCore, kind: StreamKind) -> mpsc::Receiver<StreamEvent> {
        let (event_tx, event_rx) = mpsc::channel(StreamRegistry::subscriber_channel_capacity());
        let (result_tx, _result_rx) = oneshot::channel();
        core.handle_cmd(ConnCmd::Subscribe {
            kind,
            event_tx,
            result_tx,
        });
        event_rx
    }

    fn send_command(core: &mut ConnCore, envelope: Envelope) -> (Effects, oneshot::Receiver<Result<()>>) {
        let (delivered_tx, delivered_rx) = oneshot::channel();
        let effects = core.handle_cmd(ConnCmd::SendCommand {
            envelope,
            delivered_tx,
        });
        (effects, delivered_rx)
    }

    #[tokio::test]
    async fn test_pre_ready_sends_flush_in_enqueue_order() {
        let mut core = test_core();
        core.set_state(ConnectionState::OpenNotReady);

        let say_hi = Envelope::command_with_data(StreamKind::Console, "command", json!("say hi"));
        let save = Envelope::command_with_data(StreamKind::Console, "command", json!("save-all"));
        let (effects, _rx_a) = send_command(&mut core, say_hi);
        assert!(effects.writes.is_empty(), "nothing is written before ready");
        let (effects, _rx_b) = send_command(&mut core, save);
        assert!(effects.writes.is_empty());
        assert_eq!(core.mailbox.len(), 2);

        let effects = core.on_inbound_text(r#"{"type":"ready"}"#);
        assert!(effects.ready_flush);
        let payloads: Vec<&str> = effects.writes.iter().map(|w| w.payload.as_str()).collect();
        assert_eq!(payloads.len(), 2, "exactly one write per queued send");
        assert!(payloads[0].contains("say hi"));
        assert!(payloads[1].contains("save-all"));
        assert!(core.mailbox.is_empty(), "the flush consumes the mailbox");
    }

    #[tokio::test]
    async fn test_ready_sends_write_immediately() {
        let mut core = ready_core();
        let envelope = Envelope::command_with_data(StreamKind::Console, "command", json!("stop"));
        let (effects, _rx) = send_command(&mut core, envelope);
        assert_eq!(effects.writes.len(), 1);
        assert!(core.mailbox.is_empty());
    }

    #[tokio::test]
    async fn test_status_frame_fans_out_old_and_new() {
        let mut core = ready_core();
        let mut status_rx = subscribe(&mut core, StreamKind::Status);

        core.on_inbound_text(r#"{"type":"status","data":{"status":"starting"}}"#);

        match status_rx.try_recv().unwrap() {
            StreamEvent::StatusChanged { old, new } => {
                assert_eq!(old.status, ServerStatus::Offline);
                assert_eq!(new.status, ServerStatus::Starting);
            },
            other => panic!("unexpected event: {:?}", other),
        }
        assert_eq!(core.current_status(), ServerStatus::Starting);
    }

    #[tokio::test]
    async fn test_status_change_starts_gated_streams() {
        let mut core = ready_core();
        let _tick_rx = subscribe(&mut core, StreamKind::Tick);

        // Tick is gated on Online, so subscribing while offline stays dormant.
        let effects = core.on_inbound_text(r#"{"stream":"status","type":"status","data":{"status":"online"}}"#);
        let payloads: Vec<&str> = effects.writes.iter().map(|w| w.payload.as_str()).collect();
        assert_eq!(payloads, vec![r#"{"stream":"tick","type":"start"}"#]);

        // Going back offline stops it without dropping the subscriber.
        let effects = core.on_inbound_text(r#"{"type":"status","data":{"status":"offline"}}"#);
        let payloads: Vec<&str> = effects.writes.iter().map(|w| w.payload.as_str()).collect();
        assert_eq!(payloads, vec![r#"{"stream":"tick","type":"stop"}"#]);
        assert_eq!(core.registry.subscriber_count(StreamKind::Tick), 1);
    }

    #[tokio::test]
    async fn test_console_lines_reach_subscribers() {
        let mut core = ready_core();
        let mut console_rx = subscribe(&mut core, StreamKind::Console);

        core.on_inbound_text(r#"{"stream":"console","type":"line","data":"[INFO] joined"}"#);
        assert_eq!(
            console_rx.try_recv().unwrap(),
            StreamEvent::ConsoleLine("[INFO] joined".to_string())
        );
    }

    #[tokio::test]
    async fn test_unknown_stream_and_malformed_frames_are_dropped() {
        let mut core = ready_core();
        let effects = core.on_inbound_text(r#"{"stream":"telemetry","type":"sample","data":1}"#);
        assert!(effects.writes.is_empty());
        let effects = core.on_inbound_text("not even json");
        assert!(effects.writes.is_empty());
        // The core is still usable afterwards.
        assert_eq!(core.state, ConnectionState::Ready);
    }

    #[tokio::test]
    async fn test_management_request_when_ineligible_fails_immediately() {
        let mut core = ready_core();
        let (result_tx, result_rx) = oneshot::channel();
        core.handle_cmd(ConnCmd::ManagementRequest {
            method: "restart".to_string(),
            params: json!({}),
            result_tx,
        });

        let err = result_rx.await.unwrap().unwrap_err();
        assert!(matches!(err, PanelLinkError::Unavailable(_)));
        assert!(core.pending.is_empty(), "no pending entry may be leaked");
    }

    #[tokio::test]
    async fn test_management_round_trip() {
        let mut core = ready_core();
        core.on_inbound_text(r#"{"type":"status","data":{"status":"online"}}"#);

        let (result_tx, result_rx) = oneshot::channel();
        let effects = core.handle_cmd(ConnCmd::ManagementRequest {
            method: "players".to_string(),
            params: json!({}),
            result_tx,
        });
        assert_eq!(effects.writes.len(), 1, "eligible requests go out immediately");

        let (id, response_rx) = result_rx.await.unwrap().unwrap();
        core.on_inbound_text(&format!(
            r#"{{"stream":"management","type":"response","data":{{"id":{},"data":["alice"]}}}}"#,
            id
        ));
        assert_eq!(response_rx.await.unwrap().unwrap(), json!(["alice"]));
        assert!(core.pending.is_empty());
    }

    #[tokio::test]
    async fn test_disconnect_fails_all_pending_requests() {
        let mut core = ready_core();
        core.on_inbound_text(r#"{"type":"status","data":{"status":"online"}}"#);

        let mut response_rxs = Vec::new();
        for method in ["restart", "players"] {
            let (result_tx, result_rx) = oneshot::channel();
            core.handle_cmd(ConnCmd::ManagementRequest {
                method: method.to_string(),
                params: json!({}),
                result_tx,
            });
            let (_id, response_rx) = result_rx.await.unwrap().unwrap();
            response_rxs.push(response_rx);
        }
        assert_eq!(core.pending.len(), 2);

        core.on_disconnected(DisconnectReason::remote("socket reset", None));
        assert!(core.pending.is_empty(), "disconnect must leave nothing pending");
        for rx in response_rxs {
            assert!(matches!(
                rx.await.unwrap().unwrap_err(),
                PanelLinkError::ConnectionLost(_)
            ));
        }
    }

    #[tokio::test]
    async fn test_wait_for_status_already_satisfied_registers_nothing() {
        let mut core = ready_core();
        let (result_tx, result_rx) = oneshot::channel();
        core.handle_cmd(ConnCmd::WaitForStatus {
            targets: vec![ServerStatus::Offline],
            result_tx,
        });

        let (_id, rx) = result_rx.await.unwrap();
        assert_eq!(rx.await.unwrap().unwrap().status, ServerStatus::Offline);
        assert!(core.status_waits.is_empty(), "fast path must not register a wait");
    }

    #[tokio::test]
    async fn test_wait_for_status_resolves_on_matching_update() {
        let mut core = ready_core();
        let (online_tx, online_rx) = oneshot::channel();
        let (crashed_tx, crashed_rx) = oneshot::channel();
        core.handle_cmd(ConnCmd::WaitForStatus {
            targets: vec![ServerStatus::Online],
            result_tx: online_tx,
        });
        core.handle_cmd(ConnCmd::WaitForStatus {
            targets: vec![ServerStatus::Crashed],
            result_tx: crashed_tx,
        });
        assert_eq!(core.status_waits.len(), 2);

        core.on_inbound_text(r#"{"type":"status","data":{"status":"online"}}"#);

        let (_id, rx) = online_rx.await.unwrap();
        assert_eq!(rx.await.unwrap().unwrap().status, ServerStatus::Online);
        // The crashed waiter stays pending.
        assert_eq!(core.status_waits.len(), 1);
        let (_id, mut rx) = crashed_rx.await.unwrap();
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_cancel_status_wait_removes_entry() {
        let mut core = ready_core();
        let (result_tx, result_rx) = oneshot::channel();
        core.handle_cmd(ConnCmd::WaitForStatus {
            targets: vec![ServerStatus::Online],
            result_tx,
        });
        let (id, _rx) = result_rx.await.unwrap();
        core.handle_cmd(ConnCmd::CancelStatusWait { id });
        assert!(core.status_waits.is_empty());
    }

    #[tokio::test]
    async fn test_unsubscribe_last_subscriber_requests_teardown() {
        let mut core = ready_core();
        let (event_tx, _event_rx) = mpsc::channel(8);
        let (result_tx, result_rx) = oneshot::channel();
        core.handle_cmd(ConnCmd::Subscribe {
            kind: StreamKind::Console,
            event_tx,
            result_tx,
        });
        let id = result_rx.await.unwrap().unwrap();

        let effects = core.handle_cmd(ConnCmd::Unsubscribe {
            kind: StreamKind::Console,
            subscriber_id: id,
        });
        assert!(effects.teardown, "an empty registry tears the connection down");
    }

    #[tokio::test]
    async fn test_reconnect_restarts_streams_after_ready() {
        let mut core = ready_core();
        let _tick_rx = subscribe(&mut core, StreamKind::Tick);
        core.on_inbound_text(r#"{"type":"status","data":{"status":"online"}}"#);

        // Connection drops: streams go dormant, the snapshot survives.
        core.on_disconnected(DisconnectReason::remote("gone", None));
        assert_eq!(core.current_status(), ServerStatus::Online);

        // Reconnect and complete the ready handshake: tick restarts.
        core.set_state(ConnectionState::OpenNotReady);
        let effects = core.on_inbound_text(r#"{"type":"ready"}"#);
        let payloads: Vec<&str> = effects.writes.iter().map(|w| w.payload.as_str()).collect();
        assert_eq!(payloads, vec![r#"{"stream":"tick","type":"start"}"#]);
    }

    #[tokio::test]
    async fn test_drained_signal_fires_after_ready_flush() {
        let mut core = test_core();
        core.set_state(ConnectionState::OpenNotReady);
        let (effects, _delivered) = send_command(
            &mut core,
            Envelope::command_with_data(StreamKind::Console, "command", json!("say hi")),
        );
        assert!(effects.writes.is_empty());
        let drained = core.mailbox.drained_signal();

        let effects = core.on_inbound_text(r#"{"type":"ready"}"#);
        assert_eq!(effects.writes.len(), 1);
        core.after_flush();
        drained.await.expect("drained signal fires once the queue flushed");
    }

    #[tokio::test]
    async fn test_shutdown_fails_pending_requests_and_waits() {
        let mut core = ready_core();
        core.on_inbound_text(r#"{"type":"status","data":{"status":"online"}}"#);

        let (result_tx, result_rx) = oneshot::channel();
        core.handle_cmd(ConnCmd::ManagementRequest {
            method: "backup".to_string(),
            params: json!({}),
            result_tx,
        });
        let (_id, response_rx) = result_rx.await.unwrap().unwrap();

        let (wait_tx, wait_rx) = oneshot::channel();
        core.handle_cmd(ConnCmd::WaitForStatus {
            targets: vec![ServerStatus::Offline],
            result_tx: wait_tx,
        });
        let (_id, wait_result_rx) = wait_rx.await.unwrap();

        core.on_shutdown();
        assert!(matches!(
            response_rx.await.unwrap().unwrap_err(),
            PanelLinkError::ConnectionLost(_)
        ));
        assert!(matches!(
            wait_result_rx.await.unwrap().unwrap_err(),
            PanelLinkError::ConnectionLost(_)
        ));
    }
}

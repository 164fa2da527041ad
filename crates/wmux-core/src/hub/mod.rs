//! The gateway hub: owns the session model, the pending-command FIFO, the
//! connected client set, and the parser handle; correlates command blocks
//! to submitted commands and fans events out to WebSocket clients.
//!
//! # Components
//! - `Hub`: the concurrency center and single owner of mutable state
//! - `SessionModel` / `StateSnapshot`: window and pane model
//! - `ServerMessage` / `ClientMessage`: the JSON wire protocol

mod model;
mod protocol;

pub use model::{
    filter_to_session, public_pane_id, Pane, SessionModel, StateSnapshot, Window, MODEL_PREFIX,
};
pub use protocol::{
    ClientMessage, CommandPayload, NotificationPayload, PaneCursorPayload, PaneStreamPayload,
    ServerMessage,
};

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use anyhow::Result;
use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{mpsc, oneshot};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::control::{
    decode_escaped_value, encode_argv_command, settle_utf8, CommandBlock, ControlEvent,
    Notification, StreamParser, EVENT_BUFFER,
};
use crate::policy::CommandPolicy;

/// Bounded per-client outbox; slow clients are dropped on overflow.
pub const CLIENT_OUTBOX_CAPACITY: usize = 256;

/// Pane record format used by state-sync queries. The hub's model parser
/// and this template are two halves of one wire contract; keep them
/// byte-identical.
pub const PANE_FORMAT: &str = "__WMUX___pane\t#{session_name}\t#{pane_id}\t#{window_id}\t#{pane_index}\t#{pane_active}\t#{pane_left}\t#{pane_top}\t#{pane_width}\t#{pane_height}\t#{pane_current_command}\t#{pane_title}";

const CURSOR_PREFIX: &str = "__WMUX_CURSOR";
const CAPTURE_TIMEOUT: Duration = Duration::from_secs(5);
const STATE_SYNC_ATTEMPTS: u32 = 10;
const STATE_SYNC_RETRY_DELAY: Duration = Duration::from_millis(300);

/// Sink for outbound command lines, implemented by the supervisor.
pub trait ControlSender: Send + Sync {
    fn send_line(&self, line: &str) -> Result<()>;
}

#[derive(Debug, Error)]
pub enum HubError {
    #[error("tmux backend unavailable")]
    BackendUnavailable,
    #[error("timed out waiting for tmux response")]
    ResponseTimeout,
    #[error("tmux restarted before response")]
    BackendRestarted,
    #[error("pane id is required")]
    MissingPaneId,
    #[error("capture-pane with escapes failed")]
    CaptureEscapedFailed,
    #[error("capture-pane without escapes failed")]
    CapturePlainFailed,
}

/// Result of one correlated command block, handed to a waiting caller.
#[derive(Debug, Clone)]
pub struct CommandOutcome {
    pub success: bool,
    pub output: Vec<String>,
}

/// One entry per submitted command line, consumed strictly in send order
/// by arriving command blocks.
#[derive(Debug, Default)]
struct PendingCommand {
    name: String,
    target_pane: Option<String>,
    emit_snapshot: bool,
    awaiter: Option<oneshot::Sender<CommandOutcome>>,
}

struct HubInner {
    model: SessionModel,
    pending: VecDeque<PendingCommand>,
    clients: HashMap<Uuid, mpsc::Sender<ServerMessage>>,
    parser: Option<Arc<StreamParser>>,
    /// Per-pane UTF-8 carry for `%output` decoding.
    carry: HashMap<String, Vec<u8>>,
}

pub struct Hub {
    policy: CommandPolicy,
    target_session: String,
    sender: RwLock<Option<Arc<dyn ControlSender>>>,
    inner: RwLock<HubInner>,
    /// Bumped on restart so an in-flight state-sync retry loop yields to
    /// the post-restart resync.
    resync_epoch: AtomicU64,
}

impl Hub {
    /// Create the hub and start its event consumer. Must be called inside
    /// a tokio runtime.
    pub fn new(policy: CommandPolicy, target_session: impl Into<String>) -> Arc<Self> {
        let hub = Arc::new(Self {
            policy,
            target_session: target_session.into(),
            sender: RwLock::new(None),
            inner: RwLock::new(HubInner {
                model: SessionModel::new(),
                pending: VecDeque::new(),
                clients: HashMap::new(),
                parser: None,
                carry: HashMap::new(),
            }),
            resync_epoch: AtomicU64::new(0),
        });
        hub.reset_parser();
        hub
    }

    /// Inject the outbound command sink.
    pub fn bind_sender(&self, sender: Arc<dyn ControlSender>) {
        *self.sender.write().unwrap_or_else(|e| e.into_inner()) = Some(sender);
    }

    /// Entry point for supervisor stdout lines. Called from the reader
    /// thread; may block on parser backpressure.
    pub fn feed_line(&self, line: &str) {
        let parser = {
            let inner = self.inner.read().unwrap_or_else(|e| e.into_inner());
            inner.parser.clone()
        };
        if let Some(parser) = parser {
            parser.feed_line(line);
        }
    }

    /// Supervisor restart notification: drop all correlation state, tell
    /// clients, and schedule a fresh model sync.
    pub fn handle_restart(self: &Arc<Self>) {
        self.resync_epoch.fetch_add(1, Ordering::SeqCst);
        self.reset_parser();

        let snapshot = {
            let mut inner = self.inner.write().unwrap_or_else(|e| e.into_inner());
            inner.model.reset();
            inner.pending.clear();
            inner.carry.clear();
            filter_to_session(inner.model.snapshot(), &self.target_session)
        };

        self.broadcast(ServerMessage::TmuxState { state: snapshot });
        self.broadcast(ServerMessage::TmuxRestarted);

        let hub = Arc::clone(self);
        tokio::spawn(async move {
            hub.request_state_sync_with_retry().await;
        });
    }

    /// Filtered view of the current model.
    pub fn current_state(&self) -> StateSnapshot {
        let inner = self.inner.read().unwrap_or_else(|e| e.into_inner());
        filter_to_session(inner.model.snapshot(), &self.target_session)
    }

    /// Resolve a public (sigil-less) pane id to the tmux pane id, within
    /// the target session only.
    pub fn target_session_pane_id_by_public_id(&self, public_id: &str) -> Option<String> {
        let normalized = public_pane_id(public_id);
        if normalized.is_empty() {
            return None;
        }
        self.current_state()
            .panes
            .into_iter()
            .find(|pane| pane.public_id == normalized)
            .map(|pane| pane.id)
    }

    /// Issue the canonical `list-panes` model query.
    pub fn request_state_sync(&self) -> Result<()> {
        self.send_command(&state_sync_argv(), None)?;
        Ok(())
    }

    /// Retry `request_state_sync` on failure, a bounded number of times.
    /// Returns early when a restart supersedes this loop.
    pub async fn request_state_sync_with_retry(&self) {
        let epoch = self.resync_epoch.load(Ordering::SeqCst);
        for attempt in 1..=STATE_SYNC_ATTEMPTS {
            if self.resync_epoch.load(Ordering::SeqCst) != epoch {
                debug!("state sync superseded by restart");
                return;
            }
            match self.request_state_sync() {
                Ok(()) => return,
                Err(e) => debug!(attempt, error = %e, "state sync failed"),
            }
            tokio::time::sleep(STATE_SYNC_RETRY_DELAY).await;
        }
        warn!("giving up on state sync after {STATE_SYNC_ATTEMPTS} attempts");
    }

    /// Capture a pane's visible content, waiting for the typed response.
    pub async fn capture_pane_content(&self, pane_id: &str, with_escapes: bool) -> Result<String> {
        let pane_id = pane_id.trim();
        if pane_id.is_empty() {
            return Err(HubError::MissingPaneId.into());
        }

        let mut argv = vec!["capture-pane".to_string(), "-p".to_string()];
        if with_escapes {
            argv.push("-e".to_string());
        }
        argv.extend(["-N".to_string(), "-t".to_string(), pane_id.to_string()]);

        let outcome = self.run_command_and_wait(&argv, CAPTURE_TIMEOUT).await?;
        if !outcome.success {
            let err = if with_escapes {
                HubError::CaptureEscapedFailed
            } else {
                HubError::CapturePlainFailed
            };
            return Err(err.into());
        }
        Ok(outcome.output.join("\n"))
    }

    /// Validate, quote, and forward one client argv. Per-client errors
    /// are returned to the caller; nothing is broadcast.
    pub fn submit_command(&self, argv: &[String]) -> Result<()> {
        let line = encode_argv_command(argv)?;
        self.policy.validate_line(&line)?;
        self.send_command_line(&line, argv, None, None)
    }

    /// Run a connection: register the client, push the current state, and
    /// pump messages both ways until the socket closes or the client is
    /// dropped for falling behind.
    pub async fn handle_ws<S>(self: &Arc<Self>, ws: WebSocketStream<S>)
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let client_id = Uuid::new_v4();
        let (outbox, mut outbound) = mpsc::channel(CLIENT_OUTBOX_CAPACITY);
        {
            // The map holds the only sender; broadcast removal drops it
            // and ends this loop via `outbound.recv() == None`.
            let mut inner = self.inner.write().unwrap_or_else(|e| e.into_inner());
            inner.clients.insert(client_id, outbox);
        }
        self.enqueue_to_client(client_id, ServerMessage::TmuxState {
            state: self.current_state(),
        });

        info!(client = %client_id, "websocket client attached");
        let (mut ws_tx, mut ws_rx) = ws.split();

        loop {
            tokio::select! {
                msg = outbound.recv() => {
                    // `None` means the broadcast path dropped this client.
                    let Some(msg) = msg else { break };
                    if send_json(&mut ws_tx, &msg).await.is_err() {
                        break;
                    }
                }
                incoming = ws_rx.next() => {
                    match incoming {
                        Some(Ok(Message::Text(text))) => self.handle_client_text(&text, client_id),
                        Some(Ok(Message::Close(_))) | None => break,
                        Some(Err(e)) => {
                            debug!(client = %client_id, error = %e, "websocket error");
                            break;
                        }
                        _ => {}
                    }
                }
            }
        }

        {
            let mut inner = self.inner.write().unwrap_or_else(|e| e.into_inner());
            inner.clients.remove(&client_id);
        }
        let _ = ws_tx.close().await;
        info!(client = %client_id, "websocket client detached");
    }

    fn handle_client_text(&self, text: &str, client_id: Uuid) {
        let msg: ClientMessage = match serde_json::from_str(text) {
            Ok(msg) => msg,
            Err(_) => {
                self.enqueue_to_client(client_id, error_message("invalid JSON"));
                return;
            }
        };
        if msg.t != "cmd" {
            self.enqueue_to_client(client_id, error_message("unsupported message type"));
            return;
        }
        if let Err(e) = self.submit_command(&msg.argv) {
            self.enqueue_to_client(client_id, error_message(&e.to_string()));
        }
    }

    /// Per-client enqueue; tolerates a client already removed or an
    /// outbox closed by a racing disconnect.
    fn enqueue_to_client(&self, client_id: Uuid, msg: ServerMessage) {
        let inner = self.inner.read().unwrap_or_else(|e| e.into_inner());
        if let Some(outbox) = inner.clients.get(&client_id) {
            let _ = outbox.try_send(msg);
        }
    }

    /// Internal command path (state sync, synchronous captures). Never
    /// emits a `pane_snapshot`, mirroring the client-facing rule that
    /// only explicitly requested captures broadcast.
    fn send_command(
        &self,
        argv: &[String],
        awaiter: Option<oneshot::Sender<CommandOutcome>>,
    ) -> Result<()> {
        let line = encode_argv_command(argv)?;
        self.send_command_line(&line, argv, awaiter, Some(false))
    }

    /// Send one encoded line and register its pending entry. The entry is
    /// appended only after a successful send; responses arrive in
    /// submission order, so the FIFO head always matches the next block.
    fn send_command_line(
        &self,
        line: &str,
        argv: &[String],
        awaiter: Option<oneshot::Sender<CommandOutcome>>,
        emit_snapshot: Option<bool>,
    ) -> Result<()> {
        let sender = {
            let guard = self.sender.read().unwrap_or_else(|e| e.into_inner());
            guard.clone().ok_or(HubError::BackendUnavailable)?
        };
        sender.send_line(line)?;

        let mut pending = pending_from_argv(argv);
        pending.awaiter = awaiter;
        if let Some(emit_snapshot) = emit_snapshot {
            pending.emit_snapshot = emit_snapshot;
        }
        let mut inner = self.inner.write().unwrap_or_else(|e| e.into_inner());
        inner.pending.push_back(pending);
        Ok(())
    }

    async fn run_command_and_wait(
        &self,
        argv: &[String],
        timeout: Duration,
    ) -> Result<CommandOutcome> {
        let (tx, rx) = oneshot::channel();
        self.send_command(argv, Some(tx))?;
        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(outcome)) => Ok(outcome),
            Ok(Err(_)) => Err(HubError::BackendRestarted.into()),
            Err(_) => Err(HubError::ResponseTimeout.into()),
        }
    }

    /// Replace the parser, spawning a consumer for the new incarnation and
    /// draining the old one to completion.
    fn reset_parser(self: &Arc<Self>) {
        let (parser, events) = StreamParser::new(EVENT_BUFFER);
        let parser = Arc::new(parser);

        let old = {
            let mut inner = self.inner.write().unwrap_or_else(|e| e.into_inner());
            std::mem::replace(&mut inner.parser, Some(parser))
        };
        if let Some(old) = old {
            old.close();
        }

        let hub = Arc::clone(self);
        tokio::spawn(async move {
            hub.consume_events(events).await;
        });
    }

    /// Single consumer per parser incarnation: drains typed events in
    /// order and dispatches. Runs until the parser closes.
    async fn consume_events(self: Arc<Self>, mut events: mpsc::Receiver<ControlEvent>) {
        while let Some(event) = events.recv().await {
            match event {
                ControlEvent::Command(block) => self.handle_command_block(block),
                ControlEvent::Notification(notification) => {
                    self.handle_notification(notification)
                }
                ControlEvent::ParseError(e) => {
                    self.broadcast(error_message(&format!("tmux parse error: {e}")));
                }
            }
        }
    }

    fn handle_command_block(&self, block: CommandBlock) {
        let (pending, changed_state) = {
            let mut inner = self.inner.write().unwrap_or_else(|e| e.into_inner());
            let pending = inner.pending.pop_front().unwrap_or_default();
            let changed_state = if inner.model.apply_output_lines(&block.output) {
                Some(filter_to_session(
                    inner.model.snapshot(),
                    &self.target_session,
                ))
            } else {
                None
            };
            (pending, changed_state)
        };

        let mut pending = pending;
        if let Some(awaiter) = pending.awaiter.take() {
            let _ = awaiter.send(CommandOutcome {
                success: block.success,
                output: block.output.clone(),
            });
        }

        self.broadcast(ServerMessage::TmuxCommand {
            command: CommandPayload {
                epoch_seconds: block.header.epoch_seconds,
                command_id: block.header.command_id,
                flags: block.header.flags,
                success: block.success,
                output: block.output.clone(),
            },
        });

        if let Some(state) = changed_state {
            self.broadcast(ServerMessage::TmuxState { state });
        }

        if let Some(target_pane) = pending.target_pane.as_deref() {
            if pending.name == "capture-pane" && pending.emit_snapshot {
                self.broadcast(ServerMessage::PaneSnapshot {
                    pane_snapshot: PaneStreamPayload {
                        pane_id: target_pane.to_string(),
                        data: block.output.join("\n"),
                    },
                });
            }
            if pending.name == "display-message" {
                if let Some((x, y)) = parse_pane_cursor(&block.output) {
                    self.broadcast(ServerMessage::PaneCursor {
                        pane_cursor: PaneCursorPayload {
                            pane_id: target_pane.to_string(),
                            x,
                            y,
                        },
                    });
                }
            }
        }
    }

    fn handle_notification(&self, notification: Notification) {
        if (notification.name == "output" || notification.name == "extended-output")
            && !notification.args.is_empty()
        {
            let pane_id = notification.args[0].clone();
            let decoded = decode_escaped_value(&notification.value);
            let data = {
                let mut inner = self.inner.write().unwrap_or_else(|e| e.into_inner());
                let carry = inner.carry.entry(pane_id.clone()).or_default();
                settle_utf8(carry, &decoded)
            };
            self.broadcast(ServerMessage::PaneOutput {
                pane_output: PaneStreamPayload { pane_id, data },
            });
            return;
        }

        self.broadcast(ServerMessage::TmuxNotification {
            notification: NotificationPayload {
                name: notification.name,
                args: notification.args,
                text: notification.text,
                value: notification.value,
            },
        });
    }

    /// Non-blocking fan-out: clients whose outbox is full or closed are
    /// removed; nobody else waits for them.
    fn broadcast(&self, msg: ServerMessage) {
        let mut stale = Vec::new();
        {
            let inner = self.inner.read().unwrap_or_else(|e| e.into_inner());
            for (id, outbox) in &inner.clients {
                if outbox.try_send(msg.clone()).is_err() {
                    stale.push(*id);
                }
            }
        }
        if stale.is_empty() {
            return;
        }
        let mut inner = self.inner.write().unwrap_or_else(|e| e.into_inner());
        for id in stale {
            if inner.clients.remove(&id).is_some() {
                debug!(client = %id, "dropping unresponsive client");
            }
        }
    }
}

fn error_message(message: &str) -> ServerMessage {
    ServerMessage::Error {
        message: message.to_string(),
    }
}

fn state_sync_argv() -> Vec<String> {
    vec![
        "list-panes".to_string(),
        "-a".to_string(),
        "-F".to_string(),
        PANE_FORMAT.to_string(),
    ]
}

fn pending_from_argv(argv: &[String]) -> PendingCommand {
    let name = argv
        .first()
        .map(|s| s.trim().to_ascii_lowercase())
        .unwrap_or_default();

    let mut target_pane = None;
    for pair in argv.windows(2).skip(1) {
        if pair[0] == "-t" {
            target_pane = Some(pair[1].clone());
            break;
        }
    }

    let emit_snapshot = name == "capture-pane" && target_pane.is_some();
    PendingCommand {
        name,
        target_pane,
        emit_snapshot,
        awaiter: None,
    }
}

fn parse_pane_cursor(output: &[String]) -> Option<(i64, i64)> {
    let line = output.first()?.trim();
    let parts: Vec<&str> = line.split('\t').collect();
    if parts.len() != 3 || parts[0] != CURSOR_PREFIX {
        return None;
    }
    let x = parts[1].parse::<i64>().ok()?;
    let y = parts[2].parse::<i64>().ok()?;
    Some((x, y))
}

async fn send_json<S>(
    ws_tx: &mut SplitSink<WebSocketStream<S>, Message>,
    msg: &ServerMessage,
) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let text = serde_json::to_string(msg)?;
    ws_tx.send(Message::Text(text)).await?;
    Ok(())
}

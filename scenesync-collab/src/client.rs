//! Session Transport: the client's connection to the relay.
//!
//! Provides:
//! - Connection lifecycle with automatic reconnect (exponential backoff)
//! - Ordered delivery of the relay's stream, deduplicated by sequence
//! - Gap detection: a missing sequence number requests a full snapshot
//! - Outbound buffer of unacknowledged operations, resent after reconnect
//! - Heartbeats with a timeout that declares the connection lost
//!
//! ```text
//!                 ┌──────────── supervisor task ────────────┐
//!  Session ──cmd──▶  Connecting ─▶ Active ─▶ Reconnecting ─┐ │
//!  (send, lock,   │      ▲                                │ │
//!   resync, …)    │      └──────── backoff ◀──────────────┘ │
//!                 │  Closed (close() or fatal handshake)    │
//!                 └───────────────────┬─────────────────────┘
//!                                     ▼ TransportEvent
//!                                  consumer
//! ```
//!
//! Sending never blocks the caller: operations go through an unbounded
//! command queue and the supervisor writes them out.
//!
//! Reference: Kleppmann, Chapter 5 — Replication

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use thiserror::Error;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, RwLock};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use uuid::Uuid;

use scenesync_core::{EntityId, Operation, Sequenced, SessionId, Snapshot};

use crate::protocol::{
    EncodeError, Handshake, Message, SessionInfo, WireCodec, DEFAULT_COMPRESSION_THRESHOLD, PROTOCOL_VERSION,
};

type ClientSink = SplitSink<WebSocketStream<MaybeTlsStream<TcpStream>>, WsMessage>;
type ClientSource = SplitStream<WebSocketStream<MaybeTlsStream<TcpStream>>>;

/// Client transport configuration.
#[derive(Debug, Clone)]
pub struct TransportConfig {
    /// Relay address, e.g. `ws://127.0.0.1:9090`
    pub url: String,
    pub heartbeat_interval: Duration,
    /// No traffic for this long means the connection is lost
    pub heartbeat_timeout: Duration,
    /// First reconnect delay, doubled per failed attempt
    pub reconnect_delay: Duration,
    pub max_reconnect_delay: Duration,
    /// Unacknowledged operations kept for resend
    pub outbound_capacity: usize,
    pub event_capacity: usize,
    pub compression_threshold: usize,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            url: "ws://127.0.0.1:9090".to_string(),
            heartbeat_interval: Duration::from_secs(5),
            heartbeat_timeout: Duration::from_secs(15),
            reconnect_delay: Duration::from_millis(250),
            max_reconnect_delay: Duration::from_secs(5),
            outbound_capacity: 10_000,
            event_capacity: 1024,
            compression_threshold: DEFAULT_COMPRESSION_THRESHOLD,
        }
    }
}

impl TransportConfig {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            ..Self::default()
        }
    }
}

/// Client connection state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Connecting,
    Active,
    Reconnecting,
    Closed,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    #[error("connection lost: {0}")]
    ConnectionLost(String),

    #[error("incompatible protocol: we speak {ours}, relay speaks {theirs}")]
    IncompatibleVersion { ours: u16, theirs: u16 },

    #[error("handshake failed: {0}")]
    HandshakeFailed(String),

    #[error("session closed")]
    Closed,

    #[error(transparent)]
    Encode(#[from] EncodeError),
}

/// Events emitted by the transport.
#[derive(Debug, Clone, PartialEq)]
pub enum TransportEvent {
    StateChanged(ConnectionState),
    /// Full state: initial join, resync, or catch-up after a long outage
    Snapshot(Snapshot),
    /// Next operation in sequence, from another session
    Remote(Sequenced),
    /// Our operation `clock` was sequenced at `seq`
    Acked { clock: u64, seq: u64 },
    LockChanged { entity: EntityId, owner: Option<SessionId> },
    PeerJoined(SessionInfo),
    PeerLeft(SessionId),
    /// Evicted from a full outbound buffer and not sequenced by the relay;
    /// it will not be resent. An evicted operation that was already written
    /// to the relay is held back until the next snapshot shows whether it
    /// was sequenced.
    Dropped(Operation),
    /// Relay's sequence and scene checksum, from a heartbeat reply
    Checkpoint { seq: u64, checksum: u64 },
    /// The session ended and will not reconnect
    Fatal(TransportError),
}

/// Unacknowledged operations, oldest first.
///
/// Bounded: pushing past capacity evicts the oldest operation.
#[derive(Debug)]
pub struct OutboundBuffer {
    ops: VecDeque<Operation>,
    capacity: usize,
    /// Highest clock written to a relay connection
    sent_through: u64,
}

impl OutboundBuffer {
    pub fn new(capacity: usize) -> Self {
        Self {
            ops: VecDeque::with_capacity(capacity.min(1024)),
            capacity: capacity.max(1),
            sent_through: 0,
        }
    }

    /// Record that every operation up to `clock` reached a socket.
    pub fn mark_sent(&mut self, clock: u64) {
        self.sent_through = self.sent_through.max(clock);
    }

    /// Whether `op` was written to the relay at least once.
    pub fn was_sent(&self, op: &Operation) -> bool {
        op.id.clock <= self.sent_through
    }

    /// Queue an operation. Returns the evicted one when full.
    pub fn push(&mut self, op: Operation) -> Option<Operation> {
        self.ops.push_back(op);
        if self.ops.len() > self.capacity {
            self.ops.pop_front()
        } else {
            None
        }
    }

    /// Forget every operation up to and including `clock`.
    pub fn ack(&mut self, clock: u64) -> usize {
        let before = self.ops.len();
        while self.ops.front().is_some_and(|op| op.id.clock <= clock) {
            self.ops.pop_front();
        }
        before - self.ops.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Operation> {
        self.ops.iter()
    }

    pub fn len(&self) -> usize {
        self.ops.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

enum Command {
    Send(Operation),
    Lock(EntityId),
    Unlock(EntityId),
    Resync,
    Reconnect,
    Close,
}

/// Why a connection attempt or an active connection ended.
enum Exit {
    Lost(String),
    Reconnect,
    Closed,
    Fatal(TransportError),
}

/// Opens sessions.
pub struct SessionTransport;

impl SessionTransport {
    /// Start a session for `info` on `scene_id`. Returns immediately; the
    /// connection is established in the background and reported through
    /// [`TransportEvent::StateChanged`]. Must be called inside a tokio runtime.
    pub fn connect(config: TransportConfig, info: SessionInfo, scene_id: Uuid) -> Session {
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let (event_tx, event_rx) = mpsc::channel(config.event_capacity.max(1));
        let state = Arc::new(RwLock::new(ConnectionState::Connecting));

        let supervisor = Supervisor {
            codec: WireCodec::new(config.compression_threshold),
            outbound: OutboundBuffer::new(config.outbound_capacity),
            config,
            info: info.clone(),
            scene_id,
            commands: cmd_rx,
            events: event_tx,
            state: state.clone(),
            last_seq: None,
            awaiting_snapshot: false,
            evicted_in_flight: Vec::new(),
            nonce: 0,
        };
        let task = tokio::spawn(supervisor.run());

        Session {
            info,
            scene_id,
            commands: cmd_tx,
            state,
            events: Some(event_rx),
            task: Some(task),
        }
    }
}

/// Handle to a running session.
pub struct Session {
    info: SessionInfo,
    scene_id: Uuid,
    commands: mpsc::UnboundedSender<Command>,
    state: Arc<RwLock<ConnectionState>>,
    events: Option<mpsc::Receiver<TransportEvent>>,
    task: Option<JoinHandle<()>>,
}

impl Session {
    pub fn info(&self) -> &SessionInfo {
        &self.info
    }

    pub fn id(&self) -> SessionId {
        self.info.id
    }

    pub fn scene_id(&self) -> Uuid {
        self.scene_id
    }

    /// Get current connection state.
    pub async fn state(&self) -> ConnectionState {
        *self.state.read().await
    }

    /// Take the event receiver (can only be called once).
    pub fn take_events(&mut self) -> Option<mpsc::Receiver<TransportEvent>> {
        self.events.take()
    }

    /// Queue an operation for the relay. Never blocks; buffered while
    /// disconnected.
    pub fn send(&self, op: Operation) -> Result<(), TransportError> {
        self.command(Command::Send(op))
    }

    pub fn acquire_lock(&self, entity: EntityId) -> Result<(), TransportError> {
        self.command(Command::Lock(entity))
    }

    pub fn release_lock(&self, entity: EntityId) -> Result<(), TransportError> {
        self.command(Command::Unlock(entity))
    }

    /// Ask the relay for a full snapshot.
    pub fn request_resync(&self) -> Result<(), TransportError> {
        self.command(Command::Resync)
    }

    /// Drop the current connection (or attempt) and start a new one.
    pub fn reconnect(&self) -> Result<(), TransportError> {
        self.command(Command::Reconnect)
    }

    /// Say goodbye and wait for the session to wind down.
    pub async fn close(&mut self) {
        let _ = self.commands.send(Command::Close);
        if let Some(task) = self.task.take() {
            let _ = task.await;
        }
    }

    fn command(&self, cmd: Command) -> Result<(), TransportError> {
        self.commands.send(cmd).map_err(|_| TransportError::Closed)
    }
}

struct Supervisor {
    config: TransportConfig,
    info: SessionInfo,
    scene_id: Uuid,
    codec: WireCodec,
    commands: mpsc::UnboundedReceiver<Command>,
    events: mpsc::Sender<TransportEvent>,
    state: Arc<RwLock<ConnectionState>>,
    outbound: OutboundBuffer,
    /// Last sequence delivered, `None` before the first snapshot
    last_seq: Option<u64>,
    /// A gap or overflow happened; drop the stream until a snapshot lands
    awaiting_snapshot: bool,
    /// Evicted after being sent; settled by the next snapshot
    evicted_in_flight: Vec<Operation>,
    nonce: u64,
}

impl Supervisor {
    async fn run(mut self) {
        let mut delay = self.config.reconnect_delay;
        let mut next_state = ConnectionState::Connecting;

        loop {
            self.set_state(next_state).await;
            next_state = ConnectionState::Reconnecting;

            let exit = match self.connect().await {
                Ok((sink, source)) => {
                    delay = self.config.reconnect_delay;
                    self.set_state(ConnectionState::Active).await;
                    log::info!("Session {} active on scene {}", self.info.id, self.scene_id);
                    self.drive(sink, source).await
                }
                Err(exit) => exit,
            };

            match exit {
                Exit::Closed => break,
                Exit::Fatal(e) => {
                    log::error!("Session {} ended: {e}", self.info.id);
                    self.emit(TransportEvent::Fatal(e)).await;
                    break;
                }
                Exit::Reconnect => {
                    log::info!("Session {} reconnecting on request", self.info.id);
                }
                Exit::Lost(reason) => {
                    log::warn!("Session {}: {reason}, retrying in {delay:?}", self.info.id);
                    if let Exit::Closed = self.backoff(delay).await {
                        break;
                    }
                    delay = (delay * 2).min(self.config.max_reconnect_delay);
                }
            }
        }

        self.set_state(ConnectionState::Closed).await;
    }

    /// Wait out a reconnect delay while still accepting commands.
    async fn backoff(&mut self, delay: Duration) -> Exit {
        let sleep = tokio::time::sleep(delay);
        tokio::pin!(sleep);
        loop {
            tokio::select! {
                _ = &mut sleep => return Exit::Reconnect,
                cmd = self.commands.recv() => match cmd {
                    None | Some(Command::Close) => return Exit::Closed,
                    Some(Command::Reconnect) => return Exit::Reconnect,
                    Some(other) => self.offline(other).await,
                }
            }
        }
    }

    /// Connect and handshake. A `reconnect()` during the attempt
    /// supersedes it.
    async fn connect(&mut self) -> Result<(ClientSink, ClientSource), Exit> {
        let last_seq = if self.awaiting_snapshot { None } else { self.last_seq };
        let hello = Handshake::new(self.info.clone(), self.scene_id, last_seq);
        let attempt = open(
            self.config.url.clone(),
            self.codec.clone(),
            hello,
            self.config.heartbeat_timeout,
        );
        tokio::pin!(attempt);

        loop {
            tokio::select! {
                result = &mut attempt => return result,
                cmd = self.commands.recv() => match cmd {
                    None | Some(Command::Close) => return Err(Exit::Closed),
                    Some(Command::Reconnect) => return Err(Exit::Reconnect),
                    Some(other) => self.offline(other).await,
                }
            }
        }
    }

    /// A command arriving while there is no connection.
    async fn offline(&mut self, cmd: Command) {
        match cmd {
            Command::Send(op) => {
                self.buffer(op).await;
            }
            Command::Lock(entity) | Command::Unlock(entity) => {
                log::debug!("lock change on {entity} dropped while disconnected");
            }
            Command::Resync => self.awaiting_snapshot = true,
            Command::Reconnect | Command::Close => {}
        }
    }

    /// Keep `op` for (re)sending. Returns whether a resync is now needed.
    async fn buffer(&mut self, op: Operation) -> bool {
        let Some(dropped) = self.outbound.push(op) else {
            return false;
        };
        log::warn!(
            "Outbound buffer full ({}), dropped {dropped}; a snapshot will be requested",
            self.outbound.capacity()
        );
        if self.outbound.was_sent(&dropped) {
            self.evicted_in_flight.push(dropped);
        } else {
            self.emit(TransportEvent::Dropped(dropped)).await;
        }
        self.awaiting_snapshot = true;
        true
    }

    async fn drive(&mut self, mut sink: ClientSink, mut source: ClientSource) -> Exit {
        let resend: Vec<Message> = self.outbound.iter().cloned().map(Message::submit).collect();
        if !resend.is_empty() {
            log::info!("Resending {} unacknowledged operations", resend.len());
        }
        for msg in &resend {
            if let Err(exit) = send(&self.codec, &mut sink, msg).await {
                return exit;
            }
        }
        if let Some(clock) = self.outbound.iter().last().map(|op| op.id.clock) {
            self.outbound.mark_sent(clock);
        }

        let period = self.config.heartbeat_interval;
        let mut heartbeat = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
        let mut last_heard = Instant::now();

        loop {
            tokio::select! {
                msg = source.next() => {
                    match msg {
                        Some(Ok(WsMessage::Binary(data))) => {
                            last_heard = Instant::now();
                            match self.codec.decode(&data) {
                                Ok(msg) => {
                                    if let Some(exit) = self.on_message(msg, &mut sink).await {
                                        return exit;
                                    }
                                }
                                Err(e) => log::warn!("Dropping malformed message from relay: {e}"),
                            }
                        }
                        Some(Ok(WsMessage::Close(_))) | None => {
                            return Exit::Lost("closed by relay".to_string());
                        }
                        Some(Ok(_)) => last_heard = Instant::now(),
                        Some(Err(e)) => return Exit::Lost(e.to_string()),
                    }
                }

                cmd = self.commands.recv() => {
                    let result = match cmd {
                        None | Some(Command::Close) => {
                            let bye = Message::Goodbye { reason: "session closed".to_string() };
                            let _ = send(&self.codec, &mut sink, &bye).await;
                            let _ = sink.close().await;
                            return Exit::Closed;
                        }
                        Some(Command::Reconnect) => return Exit::Reconnect,
                        Some(Command::Send(op)) => {
                            let clock = op.id.clock;
                            let msg = Message::submit(op.clone());
                            if self.buffer(op).await {
                                self.request_resync(&mut sink).await;
                            }
                            let sent = send(&self.codec, &mut sink, &msg).await;
                            if sent.is_ok() {
                                self.outbound.mark_sent(clock);
                            }
                            sent
                        }
                        Some(Command::Lock(entity)) => {
                            send(&self.codec, &mut sink, &Message::LockRequest { entity }).await
                        }
                        Some(Command::Unlock(entity)) => {
                            send(&self.codec, &mut sink, &Message::LockRelease { entity }).await
                        }
                        Some(Command::Resync) => {
                            self.request_resync(&mut sink).await;
                            Ok(())
                        }
                    };
                    if let Err(exit) = result {
                        return exit;
                    }
                }

                _ = heartbeat.tick() => {
                    if last_heard.elapsed() > self.config.heartbeat_timeout {
                        return Exit::Lost(format!("no traffic for {:?}", self.config.heartbeat_timeout));
                    }
                    self.nonce += 1;
                    let ping = Message::Heartbeat { nonce: self.nonce };
                    if let Err(exit) = send(&self.codec, &mut sink, &ping).await {
                        return exit;
                    }
                }
            }
        }
    }

    /// Handle one message from the relay. `Some` ends the connection.
    async fn on_message(&mut self, msg: Message, sink: &mut ClientSink) -> Option<Exit> {
        match msg {
            Message::Snapshot(snapshot) => {
                let covered = snapshot.clocks.get(&self.info.id).copied().unwrap_or(0);
                let retired = self.outbound.ack(covered);
                log::info!("Snapshot at seq {} ({} buffered operations covered)", snapshot.seq, retired);
                self.last_seq = Some(snapshot.seq);
                self.awaiting_snapshot = false;
                let lost: Vec<Operation> = std::mem::take(&mut self.evicted_in_flight)
                    .into_iter()
                    .filter(|op| op.id.clock > covered)
                    .collect();
                self.emit(TransportEvent::Snapshot(snapshot)).await;
                for op in lost {
                    self.emit(TransportEvent::Dropped(op)).await;
                }
            }
            Message::Operation(s) => {
                if self.accept(s.seq, sink).await {
                    log::trace!("seq {} from relay: {}", s.seq, s.op);
                    self.emit(TransportEvent::Remote(s)).await;
                }
            }
            Message::Ack { clock, seq } => {
                if self.accept(seq, sink).await {
                    self.outbound.ack(clock);
                    self.emit(TransportEvent::Acked { clock, seq }).await;
                }
            }
            Message::HeartbeatAck { seq, checksum, .. } => {
                self.emit(TransportEvent::Checkpoint { seq, checksum }).await;
            }
            Message::LockChanged { entity, owner } => {
                self.emit(TransportEvent::LockChanged { entity, owner }).await;
            }
            Message::PeerJoined(info) => {
                if info.id != self.info.id {
                    self.emit(TransportEvent::PeerJoined(info)).await;
                }
            }
            Message::PeerLeft(id) => self.emit(TransportEvent::PeerLeft(id)).await,
            Message::Goodbye { reason } => {
                return Some(Exit::Lost(format!("relay said goodbye: {reason}")));
            }
            Message::Unknown { tag, .. } => log::debug!("Ignoring unknown message tag {tag}"),
            other => log::debug!("Ignoring unexpected {} from relay", other.name()),
        }
        None
    }

    /// Sequence check for the relay's stream.
    async fn accept(&mut self, seq: u64, sink: &mut ClientSink) -> bool {
        if self.awaiting_snapshot {
            return false;
        }
        let Some(last) = self.last_seq else {
            log::debug!("seq {seq} arrived before any snapshot, dropped");
            return false;
        };
        if seq <= last {
            log::debug!("duplicate seq {seq} (have {last}), dropped");
            return false;
        }
        if seq > last + 1 {
            log::warn!("sequence gap: expected {}, got {seq}", last + 1);
            self.request_resync(sink).await;
            return false;
        }
        self.last_seq = Some(seq);
        true
    }

    async fn request_resync(&mut self, sink: &mut ClientSink) {
        self.awaiting_snapshot = true;
        let last_seq = self.last_seq.unwrap_or(0);
        log::info!("Requesting resync from seq {last_seq}");
        if send(&self.codec, sink, &Message::ResyncRequest { last_seq }).await.is_err() {
            // the reconnect handshake asks for a snapshot instead
            log::debug!("resync request not sent, connection is going down");
        }
    }

    async fn set_state(&mut self, next: ConnectionState) {
        {
            let mut state = self.state.write().await;
            if *state == next {
                return;
            }
            *state = next;
        }
        self.emit(TransportEvent::StateChanged(next)).await;
    }

    async fn emit(&self, event: TransportEvent) {
        if self.events.send(event).await.is_err() {
            log::trace!("event receiver gone");
        }
    }
}

async fn send(codec: &WireCodec, sink: &mut ClientSink, msg: &Message) -> Result<(), Exit> {
    let encoded = codec
        .encode(msg)
        .map_err(|e| Exit::Fatal(TransportError::Encode(e)))?;
    sink.send(WsMessage::Binary(encoded.into()))
        .await
        .map_err(|e| Exit::Lost(e.to_string()))
}

/// Open a socket and exchange handshakes.
async fn open(url: String, codec: WireCodec, hello: Handshake, timeout: Duration) -> Result<(ClientSink, ClientSource), Exit> {
    let (ws, _) = match tokio::time::timeout(timeout, tokio_tungstenite::connect_async(url.as_str())).await {
        Ok(Ok(ok)) => ok,
        Ok(Err(e)) => return Err(Exit::Lost(format!("connect to {url} failed: {e}"))),
        Err(_) => return Err(Exit::Lost(format!("connect to {url} timed out"))),
    };
    let (mut sink, mut source) = ws.split();
    send(&codec, &mut sink, &Message::Handshake(hello.clone())).await?;

    let reply = async {
        loop {
            match source.next().await {
                Some(Ok(WsMessage::Binary(data))) => return Ok(data),
                Some(Ok(WsMessage::Close(_))) | None => {
                    return Err(Exit::Lost("closed during handshake".to_string()));
                }
                Some(Ok(_)) => continue,
                Some(Err(e)) => return Err(Exit::Lost(e.to_string())),
            }
        }
    };
    let data = match tokio::time::timeout(timeout, reply).await {
        Ok(result) => result?,
        Err(_) => return Err(Exit::Lost("no handshake reply".to_string())),
    };

    match codec.decode(&data) {
        Ok(Message::Handshake(theirs)) => {
            if !hello.is_compatible(&theirs) {
                return Err(Exit::Fatal(TransportError::IncompatibleVersion {
                    ours: PROTOCOL_VERSION,
                    theirs: theirs.version,
                }));
            }
            log::debug!("Relay at seq {:?} for scene {}", theirs.last_seq, theirs.scene_id);
        }
        Ok(Message::Goodbye { reason }) => {
            return Err(Exit::Fatal(TransportError::HandshakeFailed(reason)));
        }
        Ok(other) => {
            return Err(Exit::Fatal(TransportError::HandshakeFailed(format!(
                "expected a handshake, got {}",
                other.name()
            ))));
        }
        Err(e) => {
            return Err(Exit::Fatal(TransportError::HandshakeFailed(format!(
                "malformed handshake reply: {e}"
            ))));
        }
    }
    Ok((sink, source))
}

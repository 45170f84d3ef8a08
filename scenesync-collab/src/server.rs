//! WebSocket relay server with per-scene rooms.
//!
//! Architecture:
//! ```text
//! Session A ──┐                       ┌── SceneState (authoritative fold)
//!             ├── SceneRoom (scene) ──┼── SequenceHistory (replay window)
//! Session B ──┘        │              └── LockManager
//!                      │
//!               BroadcastGroup
//!          ┌───────────┼───────────┐
//!          ▼           ▼           ▼
//!      Session A   Session B   Session C
//!       (Ack)      (Operation) (Operation)
//! ```
//!
//! Connection lifecycle:
//! 1. Client sends `Handshake`; incompatible versions get `Goodbye`
//! 2. Relay answers with its own `Handshake` (carrying its sequence)
//! 3. Catch-up: replay from history, or a full `Snapshot`
//! 4. Current peers and locks
//! 5. Steady state: operations in, frames out, heartbeats, lock traffic
//!
//! Reference: Kleppmann — Designing Data-Intensive Applications, Chapters 8 & 9

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::RwLock;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_tungstenite::WebSocketStream;

use scenesync_core::{ConflictPolicy, DefaultPolicy, SessionId, DEFAULT_LOG_CAPACITY};

use crate::history::DEFAULT_HISTORY_CAPACITY;
use crate::protocol::{
    Handshake, Message, SessionInfo, WireCodec, DEFAULT_COMPRESSION_THRESHOLD, MIN_PROTOCOL_VERSION,
    PROTOCOL_VERSION,
};
use crate::room::{CatchUp, Joined, RoomConfig, RoomManager, SceneRoom, Submitted};

type WsSink = SplitSink<WebSocketStream<TcpStream>, WsMessage>;
type WsSource = SplitStream<WebSocketStream<TcpStream>>;
type ConnResult = Result<(), Box<dyn std::error::Error + Send + Sync>>;

/// Server configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Address to bind to
    pub bind_addr: String,
    /// Maximum sessions per scene
    pub max_sessions_per_scene: usize,
    /// Broadcast channel capacity per scene
    pub broadcast_capacity: usize,
    /// Connections silent for this long are closed
    pub heartbeat_timeout_secs: u64,
    /// Sequenced operations kept for replay on reconnect
    pub history_capacity: usize,
    /// Operation-log window used for conflict resolution
    pub log_capacity: usize,
    /// Advisory locks expire after this much holder inactivity
    pub lock_timeout_secs: u64,
    /// Message bodies at least this large are compressed
    pub compression_threshold: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:9090".to_string(),
            max_sessions_per_scene: 64,
            broadcast_capacity: 1024,
            heartbeat_timeout_secs: 30,
            history_capacity: DEFAULT_HISTORY_CAPACITY,
            log_capacity: DEFAULT_LOG_CAPACITY,
            lock_timeout_secs: 60,
            compression_threshold: DEFAULT_COMPRESSION_THRESHOLD,
        }
    }
}

impl ServerConfig {
    pub fn room_config(&self) -> RoomConfig {
        RoomConfig {
            max_sessions: self.max_sessions_per_scene,
            broadcast_capacity: self.broadcast_capacity,
            history_capacity: self.history_capacity,
            log_capacity: self.log_capacity,
            lock_timeout: Duration::from_secs(self.lock_timeout_secs),
        }
    }

    pub fn heartbeat_timeout(&self) -> Duration {
        Duration::from_secs(self.heartbeat_timeout_secs)
    }
}

/// Server statistics.
#[derive(Debug, Clone, Default)]
pub struct ServerStats {
    pub total_connections: u64,
    pub active_connections: u64,
    pub total_messages: u64,
    pub total_bytes: u64,
    pub active_rooms: usize,
    pub sequenced_ops: u64,
    pub rejected_ops: u64,
    pub duplicate_ops: u64,
    pub snapshots_sent: u64,
    pub decode_errors: u64,
}

/// The relay server.
pub struct RelayServer {
    config: ServerConfig,
    rooms: Arc<RoomManager>,
    stats: Arc<RwLock<ServerStats>>,
    codec: WireCodec,
}

impl RelayServer {
    /// Create a relay using the default conflict policy.
    pub fn new(config: ServerConfig) -> Self {
        Self::with_policy(config, Arc::new(DefaultPolicy))
    }

    pub fn with_policy(config: ServerConfig, policy: Arc<dyn ConflictPolicy>) -> Self {
        let codec = WireCodec::new(config.compression_threshold);
        let rooms = Arc::new(RoomManager::new(config.room_config(), policy, codec.clone()));
        Self {
            config,
            rooms,
            stats: Arc::new(RwLock::new(ServerStats::default())),
            codec,
        }
    }

    pub fn with_defaults() -> Self {
        Self::new(ServerConfig::default())
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    pub fn rooms(&self) -> &Arc<RoomManager> {
        &self.rooms
    }

    /// Get server statistics.
    pub async fn stats(&self) -> ServerStats {
        let mut stats = self.stats.read().await.clone();
        stats.active_rooms = self.rooms.room_count().await;
        stats
    }

    /// Bind `config.bind_addr` and serve until the listener fails.
    pub async fn run(&self) -> Result<(), Box<dyn std::error::Error>> {
        let listener = TcpListener::bind(&self.config.bind_addr).await?;
        log::info!("Relay listening on {}", self.config.bind_addr);
        self.serve(listener).await
    }

    /// Serve connections from an already bound listener.
    pub async fn serve(&self, listener: TcpListener) -> Result<(), Box<dyn std::error::Error>> {
        loop {
            let (stream, addr) = listener.accept().await?;
            log::debug!("New TCP connection from {addr}");

            let conn = Connection {
                addr,
                rooms: self.rooms.clone(),
                stats: self.stats.clone(),
                codec: self.codec.clone(),
                heartbeat_timeout: self.config.heartbeat_timeout(),
            };
            tokio::spawn(async move {
                if let Err(e) = conn.handle(stream).await {
                    log::error!("Connection error from {addr}: {e}");
                }
            });
        }
    }
}

/// Per-connection context.
struct Connection {
    addr: SocketAddr,
    rooms: Arc<RoomManager>,
    stats: Arc<RwLock<ServerStats>>,
    codec: WireCodec,
    heartbeat_timeout: Duration,
}

impl Connection {
    async fn handle(self, stream: TcpStream) -> ConnResult {
        let ws_stream = tokio_tungstenite::accept_async(stream).await?;
        let (mut ws_sender, mut ws_receiver) = ws_stream.split();
        log::info!("WebSocket connection established from {}", self.addr);

        {
            let mut s = self.stats.write().await;
            s.total_connections += 1;
            s.active_connections += 1;
        }

        let result = self.session(&mut ws_sender, &mut ws_receiver).await;
        let _ = ws_sender.close().await;

        self.stats.write().await.active_connections -= 1;
        log::info!("Connection from {} closed", self.addr);
        result
    }

    async fn send(&self, ws_sender: &mut WsSink, msg: &Message) -> ConnResult {
        let encoded = self.codec.encode(msg)?;
        ws_sender.send(WsMessage::Binary(encoded.into())).await?;
        Ok(())
    }

    async fn goodbye(&self, ws_sender: &mut WsSink, reason: String) -> ConnResult {
        log::warn!("Refusing {}: {reason}", self.addr);
        self.send(ws_sender, &Message::Goodbye { reason }).await
    }

    /// Wait for the client's handshake. `None` if the socket closed or the
    /// client was refused.
    async fn handshake(&self, ws_sender: &mut WsSink, ws_receiver: &mut WsSource) -> Result<Option<Handshake>, Box<dyn std::error::Error + Send + Sync>> {
        let first = tokio::time::timeout(self.heartbeat_timeout, async {
            loop {
                match ws_receiver.next().await {
                    Some(Ok(WsMessage::Binary(data))) => return Some(data),
                    Some(Ok(WsMessage::Close(_))) | Some(Err(_)) | None => return None,
                    Some(Ok(_)) => continue,
                }
            }
        })
        .await;

        let data = match first {
            Ok(Some(data)) => data,
            Ok(None) => return Ok(None),
            Err(_) => {
                log::warn!("No handshake from {} within {:?}", self.addr, self.heartbeat_timeout);
                return Ok(None);
            }
        };

        let theirs = match self.codec.decode(&data) {
            Ok(Message::Handshake(h)) => h,
            Ok(other) => {
                self.goodbye(ws_sender, format!("expected a handshake, got {}", other.name()))
                    .await?;
                return Ok(None);
            }
            Err(e) => {
                self.stats.write().await.decode_errors += 1;
                self.goodbye(ws_sender, format!("malformed handshake: {e}")).await?;
                return Ok(None);
            }
        };

        let probe = Handshake::new(relay_info(), theirs.scene_id, None);
        if !probe.is_compatible(&theirs) {
            self.goodbye(
                ws_sender,
                format!(
                    "protocol version {} (min {}) is not supported, relay speaks {PROTOCOL_VERSION} (min {MIN_PROTOCOL_VERSION})",
                    theirs.version, theirs.min_version
                ),
            )
            .await?;
            return Ok(None);
        }
        Ok(Some(theirs))
    }

    async fn session(&self, ws_sender: &mut WsSink, ws_receiver: &mut WsSource) -> ConnResult {
        let Some(hello) = self.handshake(ws_sender, ws_receiver).await? else {
            return Ok(());
        };
        let me = hello.session.id;
        let room = self.rooms.get_or_create(hello.scene_id).await;

        let mut joined = match room.join(hello.session.clone(), hello.last_seq).await {
            Ok(joined) => joined,
            Err(e) => return self.goodbye(ws_sender, e.to_string()).await,
        };

        let result = self.steady_state(&room, me, &mut joined, ws_sender, ws_receiver).await;
        room.leave(me, joined.connection).await;
        result
    }

    async fn steady_state(
        &self,
        room: &SceneRoom,
        me: SessionId,
        joined: &mut Joined,
        ws_sender: &mut WsSink,
        ws_receiver: &mut WsSource,
    ) -> ConnResult {
        let reply = Handshake::new(relay_info(), room.scene_id(), Some(joined.seq));
        self.send(ws_sender, &Message::Handshake(reply)).await?;

        match std::mem::replace(&mut joined.catch_up, CatchUp::Replay(Vec::new())) {
            CatchUp::Replay(ops) => {
                log::debug!("replaying {} operations to {me}", ops.len());
                for s in ops {
                    let msg = if s.op.origin() == me {
                        Message::Ack {
                            clock: s.op.id.clock,
                            seq: s.seq,
                        }
                    } else {
                        Message::Operation(s)
                    };
                    self.send(ws_sender, &msg).await?;
                }
            }
            CatchUp::Snapshot(snapshot) => {
                self.send(ws_sender, &Message::Snapshot(snapshot)).await?;
                self.stats.write().await.snapshots_sent += 1;
            }
        }
        let mut last_sent = joined.seq;

        for peer in joined.peers.drain(..) {
            self.send(ws_sender, &Message::PeerJoined(peer)).await?;
        }
        for (entity, owner) in std::mem::take(&mut joined.locks) {
            let msg = Message::LockChanged {
                entity,
                owner: Some(owner),
            };
            self.send(ws_sender, &msg).await?;
        }

        let mut last_heard = Instant::now();
        let mut tick = tokio::time::interval((self.heartbeat_timeout / 4).max(Duration::from_millis(50)));

        loop {
            tokio::select! {
                msg = ws_receiver.next() => {
                    match msg {
                        Some(Ok(WsMessage::Binary(data))) => {
                            last_heard = Instant::now();
                            {
                                let mut s = self.stats.write().await;
                                s.total_messages += 1;
                                s.total_bytes += data.len() as u64;
                            }
                            let msg = match self.codec.decode(&data) {
                                Ok(msg) => msg,
                                Err(e) => {
                                    log::warn!("Dropping malformed message from {me}: {e}");
                                    self.stats.write().await.decode_errors += 1;
                                    continue;
                                }
                            };
                            if !self.on_message(room, me, msg, &mut last_sent, ws_sender).await? {
                                break;
                            }
                        }
                        Some(Ok(WsMessage::Close(_))) | None => {
                            log::info!("Session {me} disconnected");
                            break;
                        }
                        Some(Ok(_)) => {
                            // ping/pong are answered by tungstenite
                            last_heard = Instant::now();
                        }
                        Some(Err(e)) => {
                            log::warn!("WebSocket error from {me}: {e}");
                            break;
                        }
                    }
                }

                frame = joined.receiver.recv() => {
                    match frame {
                        Ok(frame) => {
                            if let Some(seq) = frame.seq {
                                if seq <= last_sent {
                                    continue;
                                }
                                last_sent = seq;
                            }
                            if let Some(bytes) = frame.for_session(me) {
                                ws_sender.send(WsMessage::Binary(bytes.to_vec().into())).await?;
                            }
                        }
                        Err(RecvError::Lagged(n)) => {
                            log::warn!("Session {me} lagged by {n} frames, sending a snapshot");
                            room.broadcast().record_lag(n);
                            let snapshot = room.snapshot().await;
                            last_sent = snapshot.seq;
                            self.send(ws_sender, &Message::Snapshot(snapshot)).await?;
                            self.stats.write().await.snapshots_sent += 1;
                            for (entity, owner) in room.locks().await {
                                let msg = Message::LockChanged { entity, owner: Some(owner) };
                                self.send(ws_sender, &msg).await?;
                            }
                        }
                        Err(RecvError::Closed) => break,
                    }
                }

                _ = tick.tick() => {
                    if last_heard.elapsed() > self.heartbeat_timeout {
                        log::info!("Session {me} silent for {:?}, closing", self.heartbeat_timeout);
                        break;
                    }
                    room.expire_locks().await;
                }
            }
        }
        Ok(())
    }

    /// Handle one decoded client message. Returns `false` to end the session.
    async fn on_message(
        &self,
        room: &SceneRoom,
        me: SessionId,
        msg: Message,
        last_sent: &mut u64,
        ws_sender: &mut WsSink,
    ) -> Result<bool, Box<dyn std::error::Error + Send + Sync>> {
        match msg {
            Message::Operation(s) => {
                if s.op.origin() != me {
                    log::warn!("Session {me} submitted an operation for {}, dropped", s.op.origin());
                    return Ok(true);
                }
                log::trace!("submit {}", s.op);
                let outcome = room.submit(me, s.op).await;
                let mut stats = self.stats.write().await;
                match outcome {
                    Submitted::Duplicate => stats.duplicate_ops += 1,
                    Submitted::Sequenced { applied, .. } => {
                        stats.sequenced_ops += 1;
                        if !applied {
                            stats.rejected_ops += 1;
                        }
                    }
                }
            }
            Message::Heartbeat { nonce } => {
                let (seq, checksum) = room.checkpoint().await;
                self.send(ws_sender, &Message::HeartbeatAck { nonce, seq, checksum })
                    .await?;
            }
            Message::ResyncRequest { last_seq } => {
                log::info!("Session {me} requested a resync from seq {last_seq}");
                let snapshot = room.snapshot().await;
                *last_sent = snapshot.seq;
                self.send(ws_sender, &Message::Snapshot(snapshot)).await?;
                self.stats.write().await.snapshots_sent += 1;
            }
            Message::LockRequest { entity } => {
                if let Err(owner) = room.acquire_lock(me, entity).await {
                    let msg = Message::LockChanged {
                        entity,
                        owner: Some(owner),
                    };
                    self.send(ws_sender, &msg).await?;
                }
            }
            Message::LockRelease { entity } => {
                room.release_lock(me, entity).await;
            }
            Message::Goodbye { reason } => {
                log::info!("Session {me} said goodbye: {reason}");
                return Ok(false);
            }
            Message::Unknown { tag, .. } => {
                log::debug!("Ignoring unknown message tag {tag} from {me}");
            }
            other => {
                log::debug!("Ignoring unexpected {} from {me}", other.name());
            }
        }
        Ok(true)
    }
}

/// The relay's identity in handshakes.
fn relay_info() -> SessionInfo {
    SessionInfo::with_id(SessionId::from_u128(0), "relay")
}

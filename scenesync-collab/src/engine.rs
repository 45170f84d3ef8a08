//! Sync engine: one task that owns a scene mirror, the advisory lock
//! table and the host, and feeds them from the session transport.
//!
//! ```text
//!   EngineHandle ──commands──▶ ┌──────────────────────┐ ──ops──▶ Session
//!   (edit, lock, snapshot)     │ engine task          │
//!                              │  SceneMirror         │ ◀─events── Session
//!   host callbacks ◀────────── │  LockManager         │
//!                              └──────────────────────┘
//! ```
//!
//! All mirror mutations happen on the engine task, so the host only ever
//! sees callbacks from that one task. The engine recovers from sequence
//! gaps, unknown acks and checksum mismatches by asking for a snapshot.

use std::collections::BTreeMap;
use std::time::Duration;

use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use uuid::Uuid;

use scenesync_core::{
    DefaultPolicy, ConflictPolicy, EntityId, HostAdapter, LockManager, MirrorUpdate, OpKind, Operation,
    RejectReason, SceneMirror, SceneTree, SessionId, SyncError, DEFAULT_LOCK_TIMEOUT, DEFAULT_LOG_CAPACITY,
};

use crate::client::{ConnectionState, Session, SessionTransport, TransportConfig, TransportError, TransportEvent};
use crate::protocol::SessionInfo;

/// Engine configuration.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub transport: TransportConfig,
    /// Per-entity operation window kept by the mirror
    pub log_capacity: usize,
    /// Expiry applied to locks reported by the relay
    pub lock_timeout: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            transport: TransportConfig::default(),
            log_capacity: DEFAULT_LOG_CAPACITY,
            lock_timeout: DEFAULT_LOCK_TIMEOUT,
        }
    }
}

impl EngineConfig {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            transport: TransportConfig::new(url),
            ..Self::default()
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum EngineError {
    #[error("sync engine has stopped")]
    Stopped,
}

/// Point-in-time view of a running engine.
#[derive(Debug, Clone, PartialEq)]
pub struct EngineStatus {
    pub state: ConnectionState,
    pub last_seq: u64,
    pub pending: usize,
    pub entities: usize,
    pub peers: Vec<SessionInfo>,
    pub locks: Vec<(EntityId, SessionId)>,
    /// Set when the transport gave up for good
    pub fatal: Option<TransportError>,
}

enum EngineCommand {
    Edit {
        entity: EntityId,
        kind: OpKind,
        reply: oneshot::Sender<Operation>,
    },
    AcquireLock {
        entity: EntityId,
        reply: oneshot::Sender<bool>,
    },
    ReleaseLock(EntityId),
    Snapshot(oneshot::Sender<SceneTree>),
    Status(oneshot::Sender<EngineStatus>),
    Shutdown,
}

/// Cheap, cloneable handle to a running engine.
#[derive(Debug, Clone)]
pub struct EngineHandle {
    session: SessionId,
    commands: mpsc::UnboundedSender<EngineCommand>,
}

impl EngineHandle {
    pub fn session(&self) -> SessionId {
        self.session
    }

    /// Apply a local edit optimistically and send it. Returns the
    /// operation as issued.
    pub async fn edit(&self, entity: EntityId, kind: OpKind) -> Result<Operation, EngineError> {
        self.request(|reply| EngineCommand::Edit { entity, kind, reply }).await
    }

    /// Ask for the advisory lock on `entity`. Returns `false` when another
    /// session already holds it or one of its ancestors; the final word
    /// arrives through [`HostAdapter::lock_changed`].
    pub async fn acquire_lock(&self, entity: EntityId) -> Result<bool, EngineError> {
        self.request(|reply| EngineCommand::AcquireLock { entity, reply }).await
    }

    pub fn release_lock(&self, entity: EntityId) -> Result<(), EngineError> {
        self.command(EngineCommand::ReleaseLock(entity))
    }

    /// Copy of the tree the local user sees.
    pub async fn snapshot(&self) -> Result<SceneTree, EngineError> {
        self.request(EngineCommand::Snapshot).await
    }

    pub async fn status(&self) -> Result<EngineStatus, EngineError> {
        self.request(EngineCommand::Status).await
    }

    /// Close the session. The engine's join handle then yields the host.
    pub fn shutdown(&self) -> Result<(), EngineError> {
        self.command(EngineCommand::Shutdown)
    }

    fn command(&self, cmd: EngineCommand) -> Result<(), EngineError> {
        self.commands.send(cmd).map_err(|_| EngineError::Stopped)
    }

    async fn request<T>(&self, make: impl FnOnce(oneshot::Sender<T>) -> EngineCommand) -> Result<T, EngineError> {
        let (tx, rx) = oneshot::channel();
        self.command(make(tx))?;
        rx.await.map_err(|_| EngineError::Stopped)
    }
}

/// Starts engines.
pub struct SyncEngine;

impl SyncEngine {
    /// Connect `host` to `scene_id` as `info`. Must be called inside a
    /// tokio runtime. The join handle returns the host once the engine
    /// stops.
    pub fn start<H: HostAdapter + 'static>(
        config: EngineConfig,
        info: SessionInfo,
        scene_id: Uuid,
        host: H,
    ) -> (EngineHandle, JoinHandle<H>) {
        Self::start_with_policy(config, info, scene_id, host, Box::new(DefaultPolicy))
    }

    pub fn start_with_policy<H: HostAdapter + 'static>(
        config: EngineConfig,
        info: SessionInfo,
        scene_id: Uuid,
        host: H,
        policy: Box<dyn ConflictPolicy>,
    ) -> (EngineHandle, JoinHandle<H>) {
        let session_id = info.id;
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let session = SessionTransport::connect(config.transport.clone(), info, scene_id);

        let task = EngineTask {
            mirror: SceneMirror::with_policy(session_id, config.log_capacity, policy),
            locks: LockManager::new(config.lock_timeout),
            host,
            session,
            peers: BTreeMap::new(),
            state: ConnectionState::Connecting,
            fatal: None,
            seeded: false,
        };
        let join = tokio::spawn(task.run(cmd_rx));

        (
            EngineHandle {
                session: session_id,
                commands: cmd_tx,
            },
            join,
        )
    }
}

struct EngineTask<H> {
    mirror: SceneMirror,
    locks: LockManager,
    host: H,
    session: Session,
    peers: BTreeMap<SessionId, SessionInfo>,
    state: ConnectionState,
    fatal: Option<TransportError>,
    /// The first snapshot has been seen
    seeded: bool,
}

impl<H: HostAdapter> EngineTask<H> {
    async fn run(mut self, mut commands: mpsc::UnboundedReceiver<EngineCommand>) -> H {
        let Some(mut events) = self.session.take_events() else {
            return self.host;
        };
        let mut transport_open = true;

        loop {
            tokio::select! {
                cmd = commands.recv() => match cmd {
                    None | Some(EngineCommand::Shutdown) => break,
                    Some(cmd) => self.on_command(cmd),
                },
                event = events.recv(), if transport_open => match event {
                    Some(event) => self.on_event(event),
                    None => {
                        log::debug!("transport for {} ended", self.mirror.session());
                        transport_open = false;
                    }
                },
            }
        }

        self.session.close().await;
        log::info!(
            "Engine for {} stopped at seq {} with {} pending",
            self.mirror.session(),
            self.mirror.last_seq(),
            self.mirror.pending_len()
        );
        self.host
    }

    fn on_command(&mut self, cmd: EngineCommand) {
        match cmd {
            EngineCommand::Edit { entity, kind, reply } => {
                let op = self.mirror.on_local_edit(entity, kind);
                self.send(op.clone());
                let _ = reply.send(op);
            }
            EngineCommand::AcquireLock { entity, reply } => {
                let me = self.mirror.session();
                let held_elsewhere = self
                    .locks
                    .effective_owner(entity, self.mirror.visible())
                    .is_some_and(|(_, owner)| owner != me);
                if !held_elsewhere {
                    if let Err(e) = self.session.acquire_lock(entity) {
                        log::debug!("lock request for {entity} not sent: {e}");
                    }
                }
                let _ = reply.send(!held_elsewhere);
            }
            EngineCommand::ReleaseLock(entity) => {
                if let Err(e) = self.session.release_lock(entity) {
                    log::debug!("lock release for {entity} not sent: {e}");
                }
            }
            EngineCommand::Snapshot(reply) => {
                let _ = reply.send(self.mirror.snapshot());
            }
            EngineCommand::Status(reply) => {
                let _ = reply.send(self.status());
            }
            EngineCommand::Shutdown => {}
        }
    }

    fn on_event(&mut self, event: TransportEvent) {
        match event {
            TransportEvent::StateChanged(state) => {
                log::debug!("{} is {state:?}", self.mirror.session());
                self.state = state;
            }
            TransportEvent::Snapshot(snapshot) => {
                let empty_scene = snapshot.seq == 0 && snapshot.tree.is_empty();
                let first = !self.seeded;
                self.seeded = true;
                let update = self.mirror.apply_snapshot(snapshot);
                self.deliver(update);
                if first && empty_scene {
                    self.seed_scene();
                }
            }
            TransportEvent::Remote(s) => {
                let result = self.mirror.apply_remote(s);
                self.absorb(result);
            }
            TransportEvent::Acked { clock, seq } => {
                let result = self.mirror.acknowledge(clock, seq);
                self.absorb(result);
            }
            TransportEvent::LockChanged { entity, owner } => {
                self.locks.record(entity, owner);
                self.host.lock_changed(entity, owner);
            }
            TransportEvent::PeerJoined(info) => {
                log::info!("{} ({}) joined", info.name, info.id);
                self.peers.insert(info.id, info);
            }
            TransportEvent::PeerLeft(id) => {
                self.peers.remove(&id);
                for entity in self.locks.release_session(id) {
                    self.host.lock_changed(entity, None);
                }
            }
            TransportEvent::Dropped(op) => {
                let update = self.mirror.reject_pending(op.id, RejectReason::BufferOverflow);
                self.deliver(update);
            }
            TransportEvent::Checkpoint { seq, checksum } => {
                let ours = self.mirror.confirmed().checksum();
                if seq == self.mirror.last_seq() && checksum != ours {
                    log::warn!("checksum mismatch at seq {seq}: relay {checksum:016x}, local {ours:016x}");
                    self.resync();
                }
            }
            TransportEvent::Fatal(e) => {
                log::error!("transport for {} failed: {e}", self.mirror.session());
                self.fatal = Some(e);
            }
        }
    }

    /// Push the host's existing scene into an empty shared scene, parents
    /// before children.
    fn seed_scene(&mut self) {
        let entities = self.host.enumerate_scene();
        if entities.is_empty() {
            return;
        }
        log::info!("Seeding empty scene with {} entities", entities.len());
        for entity in entities {
            let kind = OpKind::Create {
                parent: entity.parent,
                index: None,
                properties: entity.properties,
                components: entity.components,
            };
            let op = self.mirror.on_local_edit(entity.id, kind);
            self.send(op);
        }
    }

    fn absorb(&mut self, result: Result<MirrorUpdate, SyncError>) {
        match result {
            Ok(update) => self.deliver(update),
            Err(e) => {
                log::warn!("{}: {e}", self.mirror.session());
                self.resync();
            }
        }
    }

    fn deliver(&mut self, update: MirrorUpdate) {
        update.deliver(&mut self.host);
    }

    fn send(&self, op: Operation) {
        if let Err(e) = self.session.send(op) {
            log::debug!("operation not sent: {e}");
        }
    }

    fn resync(&self) {
        if let Err(e) = self.session.request_resync() {
            log::debug!("resync not requested: {e}");
        }
    }

    fn status(&self) -> EngineStatus {
        EngineStatus {
            state: self.state,
            last_seq: self.mirror.last_seq(),
            pending: self.mirror.pending_len(),
            entities: self.mirror.visible().len(),
            peers: self.peers.values().cloned().collect(),
            locks: self.locks.held(),
            fatal: self.fatal.clone(),
        }
    }
}

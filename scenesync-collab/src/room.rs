//! Scene rooms: the relay's authoritative copy of each shared scene.
//!
//! ```text
//!  submit(op) ──▶ ┌──────────── SceneRoom (one per scene id) ───────────┐
//!                 │  Mutex<RoomState>                                   │
//!                 │    SceneState ── sequence + fold (same as clients)  │
//!                 │    SequenceHistory ── replay window                 │
//!                 │    LockManager ── advisory locks                    │
//!                 │  BroadcastGroup ── one encoded frame per change ────┼──▶ connections
//!                 └─────────────────────────────────────────────────────┘
//! ```
//!
//! Every change is sequenced and broadcast while the room lock is held,
//! so the broadcast channel carries frames in sequence order and a
//! subscriber created under the same lock never misses or repeats one.
//!
//! Reference: Kleppmann — DDIA, Chapter 9 (Total Order Broadcast)

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{broadcast, Mutex, RwLock};
use uuid::Uuid;

use scenesync_core::{ConflictPolicy, EntityId, Folded, LockManager, Operation, SceneState, Sequenced, SessionId, Snapshot};

use crate::broadcast::{BroadcastGroup, RoomFrame};
use crate::history::SequenceHistory;
use crate::protocol::{Message, SessionInfo, WireCodec};

/// Limits applied to every room.
#[derive(Debug, Clone)]
pub struct RoomConfig {
    pub max_sessions: usize,
    pub broadcast_capacity: usize,
    pub history_capacity: usize,
    pub log_capacity: usize,
    pub lock_timeout: Duration,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RoomError {
    #[error("scene {scene} is full ({max} sessions)")]
    Full { scene: Uuid, max: usize },
}

/// How a joining session catches up.
#[derive(Debug, Clone, PartialEq)]
pub enum CatchUp {
    /// Operations after the session's last known sequence
    Replay(Vec<Sequenced>),
    Snapshot(Snapshot),
}

/// Everything a connection needs after joining.
pub struct Joined {
    /// Identifies this connection among reconnects of the same session
    pub connection: u64,
    pub receiver: broadcast::Receiver<Arc<RoomFrame>>,
    /// Room sequence at join time; frames up to here are covered by `catch_up`
    pub seq: u64,
    pub catch_up: CatchUp,
    /// Other sessions already in the room
    pub peers: Vec<SessionInfo>,
    pub locks: Vec<(EntityId, SessionId)>,
}

/// What happened to a submitted operation.
#[derive(Debug, Clone, PartialEq)]
pub enum Submitted {
    /// Already sequenced earlier, dropped
    Duplicate,
    Sequenced { seq: u64, applied: bool },
}

struct RoomState {
    scene: SceneState,
    history: SequenceHistory,
    locks: LockManager,
    /// Live connection per session
    connections: HashMap<SessionId, u64>,
    next_connection: u64,
}

pub struct SceneRoom {
    scene_id: Uuid,
    inner: Mutex<RoomState>,
    broadcast: BroadcastGroup,
    policy: Arc<dyn ConflictPolicy>,
    codec: WireCodec,
    max_sessions: usize,
}

impl SceneRoom {
    pub fn new(scene_id: Uuid, config: &RoomConfig, policy: Arc<dyn ConflictPolicy>, codec: WireCodec) -> Self {
        Self {
            scene_id,
            inner: Mutex::new(RoomState {
                scene: SceneState::new(config.log_capacity),
                history: SequenceHistory::new(config.history_capacity),
                locks: LockManager::new(config.lock_timeout),
                connections: HashMap::new(),
                next_connection: 1,
            }),
            broadcast: BroadcastGroup::new(config.broadcast_capacity),
            policy,
            codec,
            max_sessions: config.max_sessions,
        }
    }

    pub fn scene_id(&self) -> Uuid {
        self.scene_id
    }

    pub fn broadcast(&self) -> &BroadcastGroup {
        &self.broadcast
    }

    /// Register a session and work out its catch-up.
    ///
    /// A session reconnecting before its old connection timed out takes
    /// over; the old connection's later `leave` is ignored.
    pub async fn join(&self, info: SessionInfo, last_seq: Option<u64>) -> Result<Joined, RoomError> {
        let mut state = self.inner.lock().await;
        let rejoin = state.connections.contains_key(&info.id);
        if !rejoin && state.connections.len() >= self.max_sessions {
            return Err(RoomError::Full {
                scene: self.scene_id,
                max: self.max_sessions,
            });
        }

        let connection = state.next_connection;
        state.next_connection += 1;
        state.connections.insert(info.id, connection);

        let peers: Vec<SessionInfo> = self
            .broadcast
            .peers()
            .await
            .into_iter()
            .filter(|p| p.id != info.id)
            .collect();
        let receiver = self.broadcast.add_peer(info.clone()).await;

        let seq = state.scene.seq();
        let catch_up = match last_seq.and_then(|n| state.history.since(n)) {
            Some(ops) => CatchUp::Replay(ops),
            None => CatchUp::Snapshot(state.scene.snapshot()),
        };
        let locks = state.locks.held();

        if !rejoin {
            let joined = info.id;
            self.send(|b| RoomFrame::to_others(joined, b), Message::PeerJoined(info.clone()));
        }
        log::info!(
            "session {} ({}) joined scene {} at seq {seq}{}",
            info.id,
            info.name,
            self.scene_id,
            if rejoin { ", replacing its old connection" } else { "" }
        );

        Ok(Joined {
            connection,
            receiver,
            seq,
            catch_up,
            peers,
            locks,
        })
    }

    /// Remove a session's connection, releasing its locks.
    pub async fn leave(&self, session: SessionId, connection: u64) {
        let mut state = self.inner.lock().await;
        if state.connections.get(&session) != Some(&connection) {
            log::debug!("stale connection {connection} of {session} left scene {}", self.scene_id);
            return;
        }
        state.connections.remove(&session);
        self.broadcast.remove_peer(&session).await;

        for entity in state.locks.release_session(session) {
            self.send(|b| RoomFrame::to_all(None, b), Message::LockChanged { entity, owner: None });
        }
        self.send(|b| RoomFrame::to_others(session, b), Message::PeerLeft(session));
        log::info!("session {session} left scene {}", self.scene_id);
    }

    /// Sequence, fold, record and broadcast an operation from `origin`.
    pub async fn submit(&self, origin: SessionId, op: Operation) -> Submitted {
        let mut state = self.inner.lock().await;
        let target = op.target;
        let Some((s, folded)) = state.scene.sequence(op, self.policy.as_ref()) else {
            log::debug!("duplicate operation from {origin} dropped");
            return Submitted::Duplicate;
        };
        let seq = s.seq;
        let applied = matches!(folded, Folded::Applied { .. });
        if applied {
            state.locks.touch(target, origin);
        }
        state.history.push(s.clone());
        let clock = s.op.id.clock;

        let encoded = self.codec.encode(&Message::Operation(s));
        let ack = self.codec.encode(&Message::Ack { clock, seq });
        match (encoded, ack) {
            (Ok(encoded), Ok(ack)) => {
                self.broadcast.broadcast(RoomFrame::sequenced(origin, seq, encoded, ack));
            }
            (Err(e), _) | (_, Err(e)) => {
                // peers will hit a gap at `seq` and resync from a snapshot
                log::error!("seq {seq} in scene {} could not be encoded: {e}", self.scene_id);
            }
        }
        Submitted::Sequenced { seq, applied }
    }

    /// Try to lock `entity` for `session`. A grant is broadcast; a denial
    /// returns the current owner.
    pub async fn acquire_lock(&self, session: SessionId, entity: EntityId) -> Result<(), SessionId> {
        let mut state = self.inner.lock().await;
        if state.locks.acquire(entity, session) {
            self.send(
                |b| RoomFrame::to_all(Some(session), b),
                Message::LockChanged {
                    entity,
                    owner: Some(session),
                },
            );
            Ok(())
        } else {
            Err(state.locks.owner(entity).unwrap_or(session))
        }
    }

    pub async fn release_lock(&self, session: SessionId, entity: EntityId) -> bool {
        let mut state = self.inner.lock().await;
        let released = state.locks.release(entity, session);
        if released {
            self.send(
                |b| RoomFrame::to_all(Some(session), b),
                Message::LockChanged { entity, owner: None },
            );
        }
        released
    }

    /// Drop locks whose holders went quiet. Returns how many expired.
    pub async fn expire_locks(&self) -> usize {
        let mut state = self.inner.lock().await;
        let expired = state.locks.expire();
        for (entity, owner) in &expired {
            log::debug!("lock on {entity} held by {owner} expired");
            self.send(
                |b| RoomFrame::to_all(None, b),
                Message::LockChanged {
                    entity: *entity,
                    owner: None,
                },
            );
        }
        expired.len()
    }

    pub async fn snapshot(&self) -> Snapshot {
        self.inner.lock().await.scene.snapshot()
    }

    pub async fn locks(&self) -> Vec<(EntityId, SessionId)> {
        self.inner.lock().await.locks.held()
    }

    /// Current sequence and scene checksum.
    pub async fn checkpoint(&self) -> (u64, u64) {
        let state = self.inner.lock().await;
        (state.scene.seq(), state.scene.checksum())
    }

    pub async fn session_count(&self) -> usize {
        self.broadcast.peer_count().await
    }

    fn send(&self, frame: impl FnOnce(Vec<u8>) -> RoomFrame, msg: Message) {
        match self.codec.encode(&msg) {
            Ok(bytes) => {
                self.broadcast.broadcast(frame(bytes));
            }
            Err(e) => log::error!("{} for scene {} could not be encoded: {e}", msg.name(), self.scene_id),
        }
    }
}

/// Maps scene ids to rooms.
///
/// Rooms outlive their sessions: the relay holds the only authoritative
/// copy of a scene, so an empty room is kept for the next session.
pub struct RoomManager {
    rooms: Arc<RwLock<HashMap<Uuid, Arc<SceneRoom>>>>,
    config: RoomConfig,
    policy: Arc<dyn ConflictPolicy>,
    codec: WireCodec,
}

impl RoomManager {
    pub fn new(config: RoomConfig, policy: Arc<dyn ConflictPolicy>, codec: WireCodec) -> Self {
        Self {
            rooms: Arc::new(RwLock::new(HashMap::new())),
            config,
            policy,
            codec,
        }
    }

    /// Get or create the room for `scene_id`.
    pub async fn get_or_create(&self, scene_id: Uuid) -> Arc<SceneRoom> {
        // Fast path: read lock
        {
            let rooms = self.rooms.read().await;
            if let Some(room) = rooms.get(&scene_id) {
                return room.clone();
            }
        }

        // Slow path: write lock to create
        let mut rooms = self.rooms.write().await;
        // Double-check after acquiring write lock
        if let Some(room) = rooms.get(&scene_id) {
            return room.clone();
        }

        log::info!("opening scene {scene_id}");
        let room = Arc::new(SceneRoom::new(
            scene_id,
            &self.config,
            self.policy.clone(),
            self.codec.clone(),
        ));
        rooms.insert(scene_id, room.clone());
        room
    }

    pub async fn get(&self, scene_id: &Uuid) -> Option<Arc<SceneRoom>> {
        self.rooms.read().await.get(scene_id).cloned()
    }

    pub async fn room_count(&self) -> usize {
        self.rooms.read().await.len()
    }

    pub async fn active_scenes(&self) -> Vec<Uuid> {
        self.rooms.read().await.keys().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use scenesync_core::{DefaultPolicy, OpId, OpKind};

    const A: SessionId = SessionId::from_u128(0xA);
    const B: SessionId = SessionId::from_u128(0xB);
    const CUBE: EntityId = EntityId::from_u128(1);

    fn config() -> RoomConfig {
        RoomConfig {
            max_sessions: 2,
            broadcast_capacity: 64,
            history_capacity: 4,
            log_capacity: 64,
            lock_timeout: Duration::from_secs(60),
        }
    }

    fn room() -> SceneRoom {
        SceneRoom::new(Uuid::nil(), &config(), Arc::new(DefaultPolicy), WireCodec::default())
    }

    fn op(session: SessionId, clock: u64, base: u64, kind: OpKind) -> Operation {
        Operation::new(OpId { session, clock }, CUBE, base, kind)
    }

    async fn next(codec: &WireCodec, rx: &mut broadcast::Receiver<Arc<RoomFrame>>, me: SessionId) -> Message {
        loop {
            let frame = rx.recv().await.unwrap();
            if let Some(bytes) = frame.for_session(me) {
                return codec.decode(bytes).unwrap();
            }
        }
    }

    #[tokio::test]
    async fn test_submit_sequences_and_acks() {
        let room = room();
        let codec = WireCodec::default();
        let mut a = room.join(SessionInfo::with_id(A, "A"), None).await.unwrap();
        let mut b = room.join(SessionInfo::with_id(B, "B"), None).await.unwrap();
        assert!(matches!(a.catch_up, CatchUp::Snapshot(ref s) if s.seq == 0));

        let create = op(A, 1, 0, OpKind::create_root());
        assert_eq!(
            room.submit(A, create.clone()).await,
            Submitted::Sequenced { seq: 1, applied: true }
        );
        assert_eq!(room.submit(A, create.clone()).await, Submitted::Duplicate);

        // A sees B join, then its own ack
        assert_eq!(next(&codec, &mut a.receiver, A).await, Message::PeerJoined(SessionInfo::with_id(B, "B")));
        assert_eq!(next(&codec, &mut a.receiver, A).await, Message::Ack { clock: 1, seq: 1 });
        assert_eq!(
            next(&codec, &mut b.receiver, B).await,
            Message::Operation(Sequenced::new(1, create))
        );
        assert_eq!(room.checkpoint().await.0, 1);
    }

    #[tokio::test]
    async fn test_rejoin_replays_or_snapshots() {
        let room = room();
        room.join(SessionInfo::with_id(A, "A"), None).await.unwrap();
        room.submit(A, op(A, 1, 0, OpKind::create_root())).await;
        for clock in 2..=3 {
            room.submit(A, op(A, clock, clock - 1, OpKind::set_property("x", clock as i64)))
                .await;
        }

        let b = room.join(SessionInfo::with_id(B, "B"), Some(1)).await.unwrap();
        let CatchUp::Replay(ops) = b.catch_up else { panic!("expected replay") };
        assert_eq!(ops.iter().map(|s| s.seq).collect::<Vec<_>>(), vec![2, 3]);

        for clock in 4..=8 {
            room.submit(A, op(A, clock, clock - 1, OpKind::set_property("x", clock as i64)))
                .await;
        }
        let again = room.join(SessionInfo::with_id(B, "B"), Some(3)).await.unwrap();
        assert!(matches!(again.catch_up, CatchUp::Snapshot(ref s) if s.seq == 8));
        assert!(again.connection > b.connection);
    }

    #[tokio::test]
    async fn test_room_full() {
        let room = room();
        room.join(SessionInfo::with_id(A, "A"), None).await.unwrap();
        room.join(SessionInfo::with_id(B, "B"), None).await.unwrap();
        let err = room
            .join(SessionInfo::with_id(SessionId::from_u128(0xC), "C"), None)
            .await
            .err();
        assert!(matches!(err, Some(RoomError::Full { max: 2, .. })));
    }

    #[tokio::test]
    async fn test_locks_released_on_leave() {
        let room = room();
        let codec = WireCodec::default();
        let a = room.join(SessionInfo::with_id(A, "A"), None).await.unwrap();
        let mut b = room.join(SessionInfo::with_id(B, "B"), None).await.unwrap();

        assert_eq!(room.acquire_lock(A, CUBE).await, Ok(()));
        assert_eq!(room.acquire_lock(B, CUBE).await, Err(A));
        assert_eq!(
            next(&codec, &mut b.receiver, B).await,
            Message::LockChanged { entity: CUBE, owner: Some(A) }
        );

        // a stale connection id does nothing
        room.leave(A, a.connection + 100).await;
        assert_eq!(room.locks().await, vec![(CUBE, A)]);

        room.leave(A, a.connection).await;
        assert!(room.locks().await.is_empty());
        assert_eq!(
            next(&codec, &mut b.receiver, B).await,
            Message::LockChanged { entity: CUBE, owner: None }
        );
        assert_eq!(next(&codec, &mut b.receiver, B).await, Message::PeerLeft(A));
        assert_eq!(room.session_count().await, 1);
    }

    #[tokio::test]
    async fn test_room_manager_get_or_create() {
        let manager = RoomManager::new(config(), Arc::new(DefaultPolicy), WireCodec::default());
        let scene = Uuid::new_v4();
        let room1 = manager.get_or_create(scene).await;
        let room2 = manager.get_or_create(scene).await;
        assert!(Arc::ptr_eq(&room1, &room2));
        manager.get_or_create(Uuid::new_v4()).await;
        assert_eq!(manager.room_count().await, 2);
        assert!(manager.active_scenes().await.contains(&scene));
        assert!(manager.get(&scene).await.is_some());
    }
}

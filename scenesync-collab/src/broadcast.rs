//! Fan-out of room traffic to every connected session.
//!
//! Uses tokio broadcast channels for O(1) send to all subscribers. Frames
//! are encoded once by the room; each connection only picks the bytes
//! meant for it (peers get the operation, its origin gets an Ack).
//!
//! A receiver that falls more than `capacity` frames behind lags; its
//! connection recovers by sending a snapshot instead of the lost frames.
//!
//! Performance target: 1,000 frames to 100 sessions < 10ms
//! Reference: Patterson & Hennessy, Section 6.4 — Interconnection Networks

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{broadcast, RwLock};

use scenesync_core::SessionId;

use crate::protocol::SessionInfo;

/// One pre-encoded message for a whole room.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoomFrame {
    /// Session whose action produced the frame, `None` for the relay itself
    pub origin: Option<SessionId>,
    /// Sequence number of the operation carried, if any
    pub seq: Option<u64>,
    /// What every other session receives
    pub encoded: Vec<u8>,
    /// What the origin receives instead; `None` skips it
    pub to_origin: Option<Vec<u8>>,
}

impl RoomFrame {
    /// A sequenced operation: peers see the operation, the origin its Ack.
    pub fn sequenced(origin: SessionId, seq: u64, operation: Vec<u8>, ack: Vec<u8>) -> Self {
        Self {
            origin: Some(origin),
            seq: Some(seq),
            encoded: operation,
            to_origin: Some(ack),
        }
    }

    /// Delivered to everyone, origin included.
    pub fn to_all(origin: Option<SessionId>, encoded: Vec<u8>) -> Self {
        Self {
            origin,
            seq: None,
            to_origin: Some(encoded.clone()),
            encoded,
        }
    }

    /// Delivered to everyone except the origin.
    pub fn to_others(origin: SessionId, encoded: Vec<u8>) -> Self {
        Self {
            origin: Some(origin),
            seq: None,
            encoded,
            to_origin: None,
        }
    }

    /// The bytes `session` should receive, if any.
    pub fn for_session(&self, session: SessionId) -> Option<&[u8]> {
        if self.origin == Some(session) {
            self.to_origin.as_deref()
        } else {
            Some(&self.encoded)
        }
    }
}

/// Statistics for monitoring broadcast health.
#[derive(Debug, Clone, Default)]
pub struct BroadcastStats {
    pub frames_sent: u64,
    pub frames_lagged: u64,
    pub active_peers: usize,
}

/// Atomic broadcast stats, lock-free on the hot path.
struct AtomicBroadcastStats {
    frames_sent: AtomicU64,
    frames_lagged: AtomicU64,
}

impl AtomicBroadcastStats {
    fn new() -> Self {
        Self {
            frames_sent: AtomicU64::new(0),
            frames_lagged: AtomicU64::new(0),
        }
    }
}

/// The broadcast group of a single scene room.
pub struct BroadcastGroup {
    sender: broadcast::Sender<Arc<RoomFrame>>,

    /// Connected sessions in this room
    peers: Arc<RwLock<HashMap<SessionId, SessionInfo>>>,

    /// Frames buffered per receiver before it lags
    capacity: usize,

    atomic_stats: Arc<AtomicBroadcastStats>,
}

impl BroadcastGroup {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self {
            sender,
            peers: Arc::new(RwLock::new(HashMap::new())),
            capacity,
            atomic_stats: Arc::new(AtomicBroadcastStats::new()),
        }
    }

    /// Add a session to this group.
    ///
    /// Returns a receiver for the session to consume frames.
    pub async fn add_peer(&self, info: SessionInfo) -> broadcast::Receiver<Arc<RoomFrame>> {
        let mut peers = self.peers.write().await;
        peers.insert(info.id, info);
        self.sender.subscribe()
    }

    pub async fn remove_peer(&self, id: &SessionId) -> Option<SessionInfo> {
        self.peers.write().await.remove(id)
    }

    /// Send a frame to every subscriber. Filtering by origin is the
    /// receiver's job. Returns the number of receivers.
    pub fn broadcast(&self, frame: RoomFrame) -> usize {
        let count = self.sender.send(Arc::new(frame)).unwrap_or(0);
        self.atomic_stats.frames_sent.fetch_add(1, Ordering::Relaxed);
        count
    }

    /// A receiver reported it skipped `n` frames.
    pub fn record_lag(&self, n: u64) {
        self.atomic_stats.frames_lagged.fetch_add(n, Ordering::Relaxed);
    }

    pub async fn peer_count(&self) -> usize {
        self.peers.read().await.len()
    }

    /// All connected sessions, sorted by id.
    pub async fn peers(&self) -> Vec<SessionInfo> {
        let mut peers: Vec<SessionInfo> = self.peers.read().await.values().cloned().collect();
        peers.sort_by_key(|p| p.id);
        peers
    }

    pub async fn has_peer(&self, id: &SessionId) -> bool {
        self.peers.read().await.contains_key(id)
    }

    /// Get broadcast statistics.
    pub async fn stats(&self) -> BroadcastStats {
        BroadcastStats {
            frames_sent: self.atomic_stats.frames_sent.load(Ordering::Relaxed),
            frames_lagged: self.atomic_stats.frames_lagged.load(Ordering::Relaxed),
            active_peers: self.peers.read().await.len(),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

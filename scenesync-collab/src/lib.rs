//! # scenesync-collab — networking for shared scene editing
//!
//! A relay that totally orders every session's operations, and the client
//! side that keeps a [`SceneMirror`](scenesync_core::SceneMirror) in step
//! with it.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────┐     WebSocket      ┌──────────────┐
//! │ SyncEngine  │ ◄─────────────────► │ RelayServer  │
//! │ (per user)  │    Binary Frames    │ (central)    │
//! └──────┬──────┘                     └──────┬───────┘
//!        │                                   │
//!        ▼                                   ▼
//! ┌─────────────┐                     ┌──────────────┐
//! │ SceneMirror │                     │ SceneRoom    │
//! │ (optimistic)│                     │ SceneState + │
//! └─────────────┘                     │ history      │
//!                                     └──────┬───────┘
//!                                    ┌───────┴───────┐
//!                                    │ BroadcastGroup│
//!                                    │ (fan-out)     │
//!                                    └───────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`protocol`] — versioned binary frames (bincode, LZ4 above a threshold)
//! - [`compression`] — pluggable block compressor
//! - [`history`] — recent sequenced operations for cheap catch-up
//! - [`broadcast`] — per-room fan-out with lag detection
//! - [`room`] — the authoritative per-scene sequencer
//! - [`server`] — WebSocket relay
//! - [`client`] — session transport with reconnect and gap recovery
//! - [`engine`] — mirror + locks + host driven by the transport
//!
//! ## Performance Targets
//!
//! | Metric | Target |
//! |--------|--------|
//! | Operation encode | <1µs |
//! | Broadcast 1K frames × 100 sessions | <10ms |
//! | Snapshot of 10K entities (LZ4) | <20ms |

pub mod broadcast;
pub mod client;
pub mod compression;
pub mod engine;
pub mod history;
pub mod protocol;
pub mod room;
pub mod server;

// Re-exports for convenience
pub use broadcast::{BroadcastGroup, BroadcastStats, RoomFrame};
pub use client::{
    ConnectionState, OutboundBuffer, Session, SessionTransport, TransportConfig, TransportError, TransportEvent,
};
pub use compression::{BlockCompressor, Lz4Compressor};
pub use engine::{EngineConfig, EngineError, EngineHandle, EngineStatus, SyncEngine};
pub use history::{SequenceHistory, DEFAULT_HISTORY_CAPACITY};
pub use protocol::{
    DecodeError, EncodeError, Handshake, Message, SessionInfo, WireCodec, MIN_PROTOCOL_VERSION, PROTOCOL_VERSION,
};
pub use room::{RoomConfig, RoomError, RoomManager, SceneRoom};
pub use server::{RelayServer, ServerConfig, ServerStats};

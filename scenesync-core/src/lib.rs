//! # scenesync-core — deterministic scene-graph synchronization core
//!
//! Neutral scene model plus everything needed to keep several editors'
//! copies of one scene convergent. No I/O lives here; the networking layer
//! is `scenesync-collab`.
//!
//! ## Architecture
//!
//! ```text
//!  Host editor ──on_local_edit──▶ ┌──────────────┐ ──pending ops──▶ transport
//!       ▲                         │ SceneMirror  │
//!       │ apply_to_host           │  confirmed ◀─┼── sequenced ops, acks,
//!       │ notify_rejected         │  + pending   │   snapshots
//!       └─────────────────────────┤  = visible   │
//!                                 └──────┬───────┘
//!                                        │ fold
//!                                 ┌──────▼───────┐     ┌──────────────┐
//!                                 │ SceneState   │────▶│ OperationLog │
//!                                 │ (same fold   │     └──────────────┘
//!                                 │  as relay)   │────▶ ConflictPolicy
//!                                 └──────┬───────┘
//!                                        ▼
//!                                    SceneTree
//! ```
//!
//! ## Modules
//!
//! - [`entity`] — ids, typed values, component kinds, entities
//! - [`operation`] — operations and their server sequence numbers
//! - [`tree`] — the forest and its raw mutation rules
//! - [`oplog`] — per-entity window of applied operations
//! - [`resolver`] — pluggable conflict policy
//! - [`state`] — authoritative fold and snapshots
//! - [`mirror`] — optimistic client mirror
//! - [`locks`] — advisory edit locks
//! - [`host`] — host adapter boundary
//!
//! Reference: Kleppmann, Chapter 9 — Consistency and Consensus (total order broadcast)

pub mod entity;
pub mod error;
pub mod host;
pub mod locks;
pub mod mirror;
pub mod operation;
pub mod oplog;
pub mod resolver;
pub mod state;
pub mod tree;

pub use entity::{ComponentKind, Entity, EntityId, SessionId, Value};
pub use error::{RejectReason, StructuralViolation, SyncError};
pub use host::{HostAdapter, RecordingHost};
pub use locks::{Lock, LockManager, DEFAULT_LOCK_TIMEOUT};
pub use mirror::{MirrorUpdate, SceneMirror};
pub use operation::{OpId, OpKind, Operation, Sequenced};
pub use oplog::{LogEntry, OperationLog, DEFAULT_LOG_CAPACITY};
pub use resolver::{ConflictPolicy, DefaultPolicy, MergeOutcome};
pub use state::{Folded, SceneState, Snapshot};
pub use tree::SceneTree;

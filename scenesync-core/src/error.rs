//! Error taxonomy for the synchronization core.
//!
//! ```text
//! SyncError
//!   ├── ResyncRequired      sequence gap, fetch a full snapshot
//!   ├── UnknownAck          ack for an operation we no longer hold
//!   └── Rejected(RejectReason)
//!          ├── ConflictRejected      lost conflict resolution
//!          ├── StructuralViolation   cycle / deleted parent / unknown entity
//!          └── BufferOverflow        dropped from a full outbound buffer
//! ```
//!
//! Decode and transport failures live next to the wire codec and the
//! transport in `scenesync-collab`.

use thiserror::Error;

use crate::entity::EntityId;
use crate::operation::OpId;

/// An operation that would break the forest invariant or acts on an
/// entity that is not there.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StructuralViolation {
    #[error("moving {entity} under {parent} would create a cycle")]
    Cycle { entity: EntityId, parent: EntityId },

    #[error("parent {parent} of {entity} was deleted")]
    ParentDeleted { entity: EntityId, parent: EntityId },

    #[error("parent {parent} of {entity} does not exist")]
    UnknownParent { entity: EntityId, parent: EntityId },

    #[error("entity {0} was deleted")]
    EntityDeleted(EntityId),

    #[error("entity {0} does not exist")]
    UnknownEntity(EntityId),

    #[error("entity id {0} is already in use")]
    DuplicateEntity(EntityId),

    #[error("operation on {entity} is based on revision {base}, before the entity existed")]
    StaleBase { entity: EntityId, base: u64 },
}

/// Why an operation was not applied. Always reported to the
/// originating host, never dropped silently.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RejectReason {
    #[error("lost conflict resolution against {winner}")]
    ConflictRejected { winner: OpId },

    #[error(transparent)]
    StructuralViolation(#[from] StructuralViolation),

    #[error("dropped from a full outbound buffer")]
    BufferOverflow,
}

/// Errors raised by the scene mirror while consuming the server stream.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SyncError {
    #[error("sequence gap: expected {expected}, got {got}")]
    ResyncRequired { expected: u64, got: u64 },

    #[error("ack for clock {clock} does not match any pending operation")]
    UnknownAck { clock: u64 },

    #[error(transparent)]
    Rejected(#[from] RejectReason),
}

impl From<StructuralViolation> for SyncError {
    fn from(v: StructuralViolation) -> Self {
        SyncError::Rejected(RejectReason::StructuralViolation(v))
    }
}

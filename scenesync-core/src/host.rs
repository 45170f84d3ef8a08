//! Host Adapter boundary: how a native editor plugs into the engine.
//!
//! The host translates its own object graph (meshes, landscapes, foliage,
//! whatever inheritance it uses) to and from the neutral [`Entity`] model.
//! Local edits enter through [`SceneMirror::on_local_edit`]; everything
//! the engine wants reflected back comes through this trait.
//!
//! [`SceneMirror::on_local_edit`]: crate::mirror::SceneMirror::on_local_edit

use crate::entity::{Entity, EntityId, SessionId};
use crate::error::RejectReason;
use crate::operation::Operation;

pub trait HostAdapter: Send {
    /// Reflect a change into the native scene. Called for remote
    /// operations, cascades, and corrections after a rebase.
    fn apply_to_host(&mut self, op: &Operation);

    /// One of our operations was not applied. The host reverts it
    /// visually; the matching corrections arrive through `apply_to_host`.
    fn notify_rejected(&mut self, op: &Operation, reason: &RejectReason);

    /// The native scene as it stands, parents before children. Used to
    /// seed an empty shared scene.
    fn enumerate_scene(&self) -> Vec<Entity> {
        Vec::new()
    }

    /// Advisory lock ownership changed.
    fn lock_changed(&mut self, _entity: EntityId, _owner: Option<SessionId>) {}
}

/// A host that only records what it was told. Useful for headless tools
/// and tests.
#[derive(Debug, Default, Clone)]
pub struct RecordingHost {
    pub seed: Vec<Entity>,
    pub applied: Vec<Operation>,
    pub rejected: Vec<(Operation, RejectReason)>,
    pub locks: Vec<(EntityId, Option<SessionId>)>,
}

impl RecordingHost {
    pub fn with_seed(seed: Vec<Entity>) -> Self {
        Self {
            seed,
            ..Self::default()
        }
    }
}

impl HostAdapter for RecordingHost {
    fn apply_to_host(&mut self, op: &Operation) {
        self.applied.push(op.clone());
    }

    fn notify_rejected(&mut self, op: &Operation, reason: &RejectReason) {
        self.rejected.push((op.clone(), reason.clone()));
    }

    fn enumerate_scene(&self) -> Vec<Entity> {
        self.seed.clone()
    }

    fn lock_changed(&mut self, entity: EntityId, owner: Option<SessionId>) {
        self.locks.push((entity, owner));
    }
}

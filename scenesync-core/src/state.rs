//! Authoritative fold of the server-sequenced operation stream.
//!
//! The relay and every client run the same [`SceneState::fold`] over the
//! same stream, so they hold identical trees at identical sequence numbers.
//! Clients keep one of these as their confirmed state and layer their own
//! unacknowledged edits on top (see [`SceneMirror`](crate::mirror::SceneMirror)).
//!
//! ```text
//!   Sequenced(seq, op)
//!        │
//!        ▼
//!   duplicate? ── yes ──▶ Duplicate
//!        │ gap? ───────▶ Err(ResyncRequired)
//!        ▼
//!   opaque? ───── yes ──▶ Skipped
//!        ▼
//!   deleted / unknown / base 0 ──▶ Rejected
//!        ▼
//!   base == revision? ── no ──▶ resolver vs. logged concurrent ops
//!        ▼                               │ Reject ─▶ Rejected
//!   SceneTree::apply ◀───────────────────┘
//!        │ structural error ─▶ Rejected
//!        ▼
//!   Applied { cascades, superseded }  + logged
//! ```

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::entity::SessionId;
use crate::error::{RejectReason, StructuralViolation, SyncError};
use crate::oplog::{OperationLog, DEFAULT_LOG_CAPACITY};
use crate::operation::{OpKind, Operation, Sequenced};
use crate::resolver::{ConflictPolicy, MergeOutcome};
use crate::tree::SceneTree;

/// Everything a peer needs to continue folding from `seq`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Snapshot {
    pub seq: u64,
    pub tree: SceneTree,
    pub log: OperationLog,
    /// Highest sequenced clock per session
    pub clocks: BTreeMap<SessionId, u64>,
}

impl Snapshot {
    pub fn empty() -> Self {
        SceneState::default().snapshot()
    }
}

/// What folding one sequenced operation did.
#[derive(Debug, Clone, PartialEq)]
pub enum Folded {
    /// Already folded, ignored
    Duplicate,
    /// Unknown kind, sequenced but not applied
    Skipped,
    Applied {
        /// Implicit deletes of the target's descendants, deepest first
        cascades: Vec<Operation>,
        /// Earlier concurrent operations this one overrode
        superseded: Vec<Operation>,
    },
    Rejected(RejectReason),
}

impl Folded {
    pub fn is_applied(&self) -> bool {
        matches!(self, Folded::Applied { .. })
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct SceneState {
    seq: u64,
    tree: SceneTree,
    log: OperationLog,
    clocks: BTreeMap<SessionId, u64>,
}

impl Default for SceneState {
    fn default() -> Self {
        Self::new(DEFAULT_LOG_CAPACITY)
    }
}

impl From<Snapshot> for SceneState {
    fn from(s: Snapshot) -> Self {
        Self {
            seq: s.seq,
            tree: s.tree,
            log: s.log,
            clocks: s.clocks,
        }
    }
}

impl SceneState {
    pub fn new(log_capacity: usize) -> Self {
        Self {
            seq: 0,
            tree: SceneTree::new(),
            log: OperationLog::new(log_capacity),
            clocks: BTreeMap::new(),
        }
    }

    /// Last folded sequence number.
    pub fn seq(&self) -> u64 {
        self.seq
    }

    pub fn tree(&self) -> &SceneTree {
        &self.tree
    }

    pub fn log(&self) -> &OperationLog {
        &self.log
    }

    /// Highest sequenced clock of `session`, 0 if none.
    pub fn clock_of(&self, session: &SessionId) -> u64 {
        self.clocks.get(session).copied().unwrap_or(0)
    }

    pub fn checksum(&self) -> u64 {
        self.tree.checksum()
    }

    pub fn snapshot(&self) -> Snapshot {
        Snapshot {
            seq: self.seq,
            tree: self.tree.clone(),
            log: self.log.clone(),
            clocks: self.clocks.clone(),
        }
    }

    /// Assign the next sequence number to `op` and fold it. Server side.
    ///
    /// Returns `None` when the session already had this clock sequenced,
    /// which happens when a client resends after a reconnect.
    pub fn sequence(&mut self, op: Operation, policy: &dyn ConflictPolicy) -> Option<(Sequenced, Folded)> {
        if op.id.clock <= self.clock_of(&op.origin()) {
            return None;
        }
        let s = Sequenced::new(self.seq + 1, op);
        let folded = self.fold_next(&s, policy);
        Some((s, folded))
    }

    /// Fold an operation sequenced elsewhere.
    pub fn fold(&mut self, s: &Sequenced, policy: &dyn ConflictPolicy) -> Result<Folded, SyncError> {
        if s.seq <= self.seq {
            return Ok(Folded::Duplicate);
        }
        if s.seq != self.seq + 1 {
            return Err(SyncError::ResyncRequired {
                expected: self.seq + 1,
                got: s.seq,
            });
        }
        Ok(self.fold_next(s, policy))
    }

    fn fold_next(&mut self, s: &Sequenced, policy: &dyn ConflictPolicy) -> Folded {
        self.seq = s.seq;
        let clock = self.clocks.entry(s.op.origin()).or_insert(0);
        *clock = (*clock).max(s.op.id.clock);

        if matches!(s.op.kind, OpKind::Opaque { .. }) {
            log::debug!("seq {} carries an unknown operation kind, skipped", s.seq);
            return Folded::Skipped;
        }

        let superseded = match self.resolve(s, policy) {
            Ok(superseded) => superseded,
            Err(reason) => {
                log::debug!("seq {} rejected: {reason}", s.seq);
                return Folded::Rejected(reason);
            }
        };

        let target = s.op.target;
        let revision_before = self.tree.revision(&target);
        match self.tree.apply(&s.op) {
            Ok(cascades) => {
                for c in &cascades {
                    self.log.push(s.seq, c.base_revision + 1, c.clone());
                }
                let revision_after = match s.op.kind {
                    OpKind::Delete => revision_before + 1,
                    _ => self.tree.revision(&target),
                };
                self.log.push(s.seq, revision_after, s.op.clone());
                log::trace!("seq {} applied: {}", s.seq, s.op);
                Folded::Applied { cascades, superseded }
            }
            Err(v) => {
                log::debug!("seq {} rejected: {v}", s.seq);
                Folded::Rejected(v.into())
            }
        }
    }

    /// Check `s` against deletion and the concurrent operations it did
    /// not see. Returns the operations it overrides.
    fn resolve(&self, s: &Sequenced, policy: &dyn ConflictPolicy) -> Result<Vec<Operation>, RejectReason> {
        let op = &s.op;
        if matches!(op.kind, OpKind::Create { .. }) {
            return Ok(Vec::new());
        }
        if self.tree.is_deleted(&op.target) {
            return Err(match self.log.last_delete(&op.target) {
                Some(del) => RejectReason::ConflictRejected { winner: del.op.id },
                None => StructuralViolation::EntityDeleted(op.target).into(),
            });
        }
        if !self.tree.contains(&op.target) {
            return Err(StructuralViolation::UnknownEntity(op.target).into());
        }
        if op.base_revision == 0 {
            return Err(StructuralViolation::StaleBase {
                entity: op.target,
                base: 0,
            }
            .into());
        }
        if op.base_revision == self.tree.revision(&op.target) {
            return Ok(Vec::new());
        }
        if !self.log.covers(&op.target, op.base_revision) {
            log::debug!("{op} is based on a revision older than the log window");
        }

        let mut superseded = Vec::new();
        for entry in self.log.concurrent_with(op) {
            let earlier = Sequenced::new(entry.seq, entry.op.clone());
            let outcome = policy.resolve(&earlier, s);
            if !outcome.applies() {
                return Err(RejectReason::ConflictRejected { winner: entry.op.id });
            }
            if outcome == MergeOutcome::Supersede {
                superseded.push(entry.op.clone());
            }
        }
        Ok(superseded)
    }
}

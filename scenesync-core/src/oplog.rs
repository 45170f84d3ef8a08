//! Operation Log: the recent sequenced history, grouped per entity.
//!
//! Every applied operation is recorded with the revision it produced. When
//! an incoming operation was based on an older revision, the entries with a
//! higher `revision_after` are exactly the edits its author had not seen;
//! those are the candidates handed to the conflict resolver.
//!
//! ```text
//!   entity 7:  r1 create ─ r2 set name ─ r3 reparent ─ r4 set name
//!                                    ▲
//!   incoming op based on r2 ─────────┘  concurrent with r3 and r4
//! ```
//!
//! The log is a sliding window over the last `capacity` entries across all
//! entities. Snapshots carry it so a peer that joins late folds later
//! operations exactly like peers that saw the whole stream.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, VecDeque};

use crate::entity::EntityId;
use crate::operation::{OpKind, Operation};

/// Default number of retained entries.
pub const DEFAULT_LOG_CAPACITY: usize = 1024;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogEntry {
    pub seq: u64,
    /// Target revision after this operation was applied
    pub revision_after: u64,
    pub op: Operation,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OperationLog {
    capacity: usize,
    /// Global insertion order, used for eviction
    order: VecDeque<(u64, EntityId)>,
    by_entity: BTreeMap<EntityId, VecDeque<LogEntry>>,
}

impl Default for OperationLog {
    fn default() -> Self {
        Self::new(DEFAULT_LOG_CAPACITY)
    }
}

impl OperationLog {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            order: VecDeque::new(),
            by_entity: BTreeMap::new(),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    /// Sequence number of the oldest retained entry.
    pub fn first_seq(&self) -> Option<u64> {
        self.order.front().map(|(seq, _)| *seq)
    }

    pub fn last_seq(&self) -> Option<u64> {
        self.order.back().map(|(seq, _)| *seq)
    }

    /// Append an entry, evicting the oldest one when full.
    pub fn push(&mut self, seq: u64, revision_after: u64, op: Operation) {
        let target = op.target;
        self.order.push_back((seq, target));
        self.by_entity.entry(target).or_default().push_back(LogEntry {
            seq,
            revision_after,
            op,
        });

        while self.order.len() > self.capacity {
            let Some((_, evicted)) = self.order.pop_front() else { break };
            if let Some(entries) = self.by_entity.get_mut(&evicted) {
                entries.pop_front();
                if entries.is_empty() {
                    self.by_entity.remove(&evicted);
                }
            }
        }
    }

    /// Retained entries for one entity, oldest first.
    pub fn entries(&self, target: &EntityId) -> impl Iterator<Item = &LogEntry> {
        self.by_entity.get(target).into_iter().flatten()
    }

    /// Entries the author of `op` had not seen when it was made: same
    /// target, produced a revision above `op.base_revision`, and came
    /// from another session. A session's own earlier operations are
    /// causally before its later ones and never conflict with them.
    pub fn concurrent_with<'a>(&'a self, op: &'a Operation) -> impl Iterator<Item = &'a LogEntry> + 'a {
        self.entries(&op.target)
            .filter(move |e| e.revision_after > op.base_revision && e.op.origin() != op.origin())
    }

    /// The retained Delete that removed `target`, if any.
    pub fn last_delete(&self, target: &EntityId) -> Option<&LogEntry> {
        self.by_entity
            .get(target)?
            .iter()
            .rev()
            .find(|e| matches!(e.op.kind, OpKind::Delete))
    }

    /// Whether the window still covers every revision of `target` above `base`.
    pub fn covers(&self, target: &EntityId, base: u64) -> bool {
        match self.by_entity.get(target).and_then(|e| e.front()) {
            Some(oldest) => oldest.revision_after <= base + 1,
            None => false,
        }
    }
}

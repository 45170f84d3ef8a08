//! Conflict Resolver: decides what happens when two operations touched the
//! same entity without seeing each other.
//!
//! The resolver only ever compares two sequenced operations; the earlier
//! one is already applied, the later one is about to be. Outcomes must be a
//! pure function of the two inputs, so every peer folding the same stream
//! reaches the same tree.
//!
//! Default policy by kind pair (earlier, later):
//!
//! | earlier \ later      | SetProperty/SetComponent | Reparent | Reorder | Delete    |
//! |----------------------|--------------------------|----------|---------|-----------|
//! | SetProperty (same k) | last writer wins         | indep.   | indep.  | supersede |
//! | SetComponent (same)  | last writer wins         | indep.   | indep.  | supersede |
//! | Reparent             | indep.                   | LWW      | merge   | supersede |
//! | Reorder              | indep.                   | merge    | merge   | supersede |
//! | Delete               | reject                   | reject   | reject  | reject    |
//!
//! Last writer is decided by `(seq, session)`, the server's total order.

use crate::operation::{OpKind, Sequenced};

/// Result of comparing an applied operation with a later concurrent one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MergeOutcome {
    /// The two touch different state
    Independent,
    /// Both contribute; apply the later one on top of the earlier
    Merge,
    /// The later one wins and overrides the earlier one's effect
    Supersede,
    /// The earlier one wins; the later one must not be applied
    Reject,
}

impl MergeOutcome {
    /// Whether the later operation gets applied.
    pub fn applies(self) -> bool {
        !matches!(self, MergeOutcome::Reject)
    }
}

/// Pluggable conflict policy.
pub trait ConflictPolicy: Send + Sync {
    fn resolve(&self, earlier: &Sequenced, later: &Sequenced) -> MergeOutcome;
}

/// The stock policy described in the module docs.
#[derive(Debug, Clone, Copy, Default)]
pub struct DefaultPolicy;

impl DefaultPolicy {
    /// Last-writer-wins between two operations on the same field.
    fn last_writer(earlier: &Sequenced, later: &Sequenced) -> MergeOutcome {
        if later.order_key() > earlier.order_key() {
            MergeOutcome::Supersede
        } else {
            MergeOutcome::Reject
        }
    }
}

impl ConflictPolicy for DefaultPolicy {
    fn resolve(&self, earlier: &Sequenced, later: &Sequenced) -> MergeOutcome {
        if earlier.op.target != later.op.target {
            return MergeOutcome::Independent;
        }
        match (&earlier.op.kind, &later.op.kind) {
            (OpKind::Opaque { .. }, _) | (_, OpKind::Opaque { .. }) => MergeOutcome::Independent,

            // Delete wins in both directions
            (OpKind::Delete, _) => MergeOutcome::Reject,
            (_, OpKind::Delete) => MergeOutcome::Supersede,

            (OpKind::SetProperty { key: a, .. }, OpKind::SetProperty { key: b, .. }) if a == b => {
                Self::last_writer(earlier, later)
            }
            (OpKind::SetComponent { kind: a, .. }, OpKind::SetComponent { kind: b, .. }) if a == b => {
                Self::last_writer(earlier, later)
            }

            (OpKind::Reparent { .. }, OpKind::Reparent { .. }) => Self::last_writer(earlier, later),
            (OpKind::Reorder { .. } | OpKind::Reparent { .. }, OpKind::Reorder { .. } | OpKind::Reparent { .. }) => {
                MergeOutcome::Merge
            }

            _ => MergeOutcome::Independent,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entity::{ComponentKind, EntityId, SessionId};
    use crate::operation::{OpId, Operation};

    fn seq(seq: u64, session: u128, target: u128, kind: OpKind) -> Sequenced {
        Sequenced::new(
            seq,
            Operation::new(
                OpId {
                    session: SessionId::from_u128(session),
                    clock: 1,
                },
                EntityId::from_u128(target),
                1,
                kind,
            ),
        )
    }

    #[test]
    fn test_same_property_last_writer_wins() {
        let p = DefaultPolicy;
        let a = seq(5, 1, 9, OpKind::set_property("color", "red"));
        let b = seq(6, 2, 9, OpKind::set_property("color", "blue"));
        assert_eq!(p.resolve(&a, &b), MergeOutcome::Supersede);
        assert_eq!(p.resolve(&b, &a), MergeOutcome::Reject);
    }

    #[test]
    fn test_ties_broken_by_session() {
        let p = DefaultPolicy;
        let a = seq(5, 1, 9, OpKind::set_property("x", 1i64));
        let b = seq(5, 2, 9, OpKind::set_property("x", 2i64));
        assert_eq!(p.resolve(&a, &b), MergeOutcome::Supersede);
        assert_eq!(p.resolve(&b, &a), MergeOutcome::Reject);
    }

    #[test]
    fn test_different_fields_independent() {
        let p = DefaultPolicy;
        let a = seq(1, 1, 9, OpKind::set_property("x", 1i64));
        let b = seq(2, 2, 9, OpKind::set_property("y", 1i64));
        assert_eq!(p.resolve(&a, &b), MergeOutcome::Independent);

        let c = seq(3, 2, 9, OpKind::set_component(ComponentKind::Mesh, vec![]));
        let d = seq(4, 1, 9, OpKind::set_component(ComponentKind::Light, vec![]));
        assert_eq!(p.resolve(&c, &d), MergeOutcome::Independent);

        let other = seq(5, 1, 10, OpKind::set_property("x", 2i64));
        assert_eq!(p.resolve(&a, &other), MergeOutcome::Independent);
    }

    #[test]
    fn test_delete_wins() {
        let p = DefaultPolicy;
        let set = seq(1, 1, 9, OpKind::set_property("x", 1i64));
        let del = seq(2, 2, 9, OpKind::Delete);
        assert_eq!(p.resolve(&set, &del), MergeOutcome::Supersede);
        assert_eq!(p.resolve(&del, &set), MergeOutcome::Reject);
        assert!(!MergeOutcome::Reject.applies());
    }

    #[test]
    fn test_structural_pairs() {
        let p = DefaultPolicy;
        let r1 = seq(1, 1, 9, OpKind::reparent(None));
        let r2 = seq(2, 2, 9, OpKind::reparent(Some(EntityId::from_u128(3))));
        assert_eq!(p.resolve(&r1, &r2), MergeOutcome::Supersede);

        let o1 = seq(3, 1, 9, OpKind::Reorder { index: 0 });
        let o2 = seq(4, 2, 9, OpKind::Reorder { index: 2 });
        assert_eq!(p.resolve(&o1, &o2), MergeOutcome::Merge);
        assert_eq!(p.resolve(&r1, &o2), MergeOutcome::Merge);
        assert_eq!(p.resolve(&o1, &r2), MergeOutcome::Merge);
    }
}

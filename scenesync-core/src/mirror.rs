//! Scene Graph Mirror: the client's converging copy of the shared scene.
//!
//! ```text
//!                     ┌─────────────────────────────┐
//!   server stream ──▶ │ confirmed: SceneState       │  same fold as the relay
//!   (remote + acks)   └──────────────┬──────────────┘
//!                                    │ + replay pending
//!   local edits ─────▶ pending ──────┤
//!   (optimistic)                     ▼
//!                     ┌─────────────────────────────┐
//!                     │ visible: SceneTree          │  what the host shows
//!                     └─────────────────────────────┘
//! ```
//!
//! Local edits mutate `visible` immediately and queue as pending. Remote
//! operations fold into `confirmed`; when nothing is pending the same
//! operation patches `visible`, otherwise `visible` is rebuilt as
//! confirmed + pending and the difference goes to the host as corrective
//! operations. Because `confirmed` folds exactly the server's stream,
//! every mirror converges once its pending queue drains.
//!
//! The mirror is synchronous and owns no I/O; the engine feeds it from a
//! single task.

use std::collections::VecDeque;

use crate::entity::{EntityId, SessionId};
use crate::error::{RejectReason, StructuralViolation, SyncError};
use crate::host::HostAdapter;
use crate::oplog::DEFAULT_LOG_CAPACITY;
use crate::operation::{OpId, OpKind, Operation, Sequenced};
use crate::resolver::{ConflictPolicy, DefaultPolicy};
use crate::state::{Folded, SceneState, Snapshot};
use crate::tree::SceneTree;

/// What the host has to hear about after feeding the mirror.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct MirrorUpdate {
    /// Changes to reflect, in order
    pub host_ops: Vec<Operation>,
    /// Our own operations that did not survive
    pub rejected: Vec<(Operation, RejectReason)>,
}

impl MirrorUpdate {
    pub fn is_empty(&self) -> bool {
        self.host_ops.is_empty() && self.rejected.is_empty()
    }

    /// Hand everything to the host: rejections first, then corrections.
    pub fn deliver<H: HostAdapter + ?Sized>(&self, host: &mut H) {
        for (op, reason) in &self.rejected {
            host.notify_rejected(op, reason);
        }
        for op in &self.host_ops {
            host.apply_to_host(op);
        }
    }
}

pub struct SceneMirror {
    session: SessionId,
    /// Last issued clock
    clock: u64,
    confirmed: SceneState,
    pending: VecDeque<Operation>,
    visible: SceneTree,
    policy: Box<dyn ConflictPolicy>,
}

impl std::fmt::Debug for SceneMirror {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SceneMirror")
            .field("session", &self.session)
            .field("clock", &self.clock)
            .field("seq", &self.confirmed.seq())
            .field("pending", &self.pending.len())
            .field("entities", &self.visible.len())
            .finish()
    }
}

impl SceneMirror {
    pub fn new(session: SessionId) -> Self {
        Self::with_policy(session, DEFAULT_LOG_CAPACITY, Box::new(DefaultPolicy))
    }

    pub fn with_policy(session: SessionId, log_capacity: usize, policy: Box<dyn ConflictPolicy>) -> Self {
        Self {
            session,
            clock: 0,
            confirmed: SceneState::new(log_capacity),
            pending: VecDeque::new(),
            visible: SceneTree::new(),
            policy,
        }
    }

    pub fn session(&self) -> SessionId {
        self.session
    }

    /// Last server sequence number folded into the confirmed state.
    pub fn last_seq(&self) -> u64 {
        self.confirmed.seq()
    }

    pub fn confirmed(&self) -> &SceneState {
        &self.confirmed
    }

    /// The tree the local user sees, including unacknowledged edits.
    pub fn visible(&self) -> &SceneTree {
        &self.visible
    }

    /// Full copy of the visible tree.
    pub fn snapshot(&self) -> SceneTree {
        self.visible.clone()
    }

    pub fn pending(&self) -> impl Iterator<Item = &Operation> {
        self.pending.iter()
    }

    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    fn next_id(&mut self) -> OpId {
        self.clock += 1;
        OpId {
            session: self.session,
            clock: self.clock,
        }
    }

    /// Turn a host edit into an operation and apply it optimistically.
    ///
    /// Never fails from the caller's point of view: an edit that does not
    /// fit the visible tree is still sent, and the server's verdict comes
    /// back as a rejection.
    pub fn on_local_edit(&mut self, entity: EntityId, kind: OpKind) -> Operation {
        let base = match kind {
            OpKind::Create { .. } => 0,
            _ => self.visible.revision(&entity),
        };
        let id = self.next_id();
        let op = Operation::new(id, entity, base, kind);
        if let Err(e) = self.apply_local(op.clone()) {
            log::debug!("local {op} does not apply to the visible scene: {e}");
        }
        op
    }

    /// Apply one of our operations to the visible tree and queue it.
    ///
    /// The operation is queued even when the visible tree refuses it.
    /// Returns the cascade deletes it produced.
    pub fn apply_local(&mut self, op: Operation) -> Result<Vec<Operation>, StructuralViolation> {
        self.clock = self.clock.max(op.id.clock);
        let result = self.visible.apply(&op);
        self.pending.push_back(op);
        result
    }

    /// Fold a sequenced operation from another session.
    pub fn apply_remote(&mut self, s: Sequenced) -> Result<MirrorUpdate, SyncError> {
        if s.op.origin() == self.session {
            return self.acknowledge(s.op.id.clock, s.seq);
        }

        let folded = self.confirmed.fold(&s, self.policy.as_ref())?;
        let mut update = MirrorUpdate::default();
        let Folded::Applied { cascades, superseded } = folded else {
            return Ok(update);
        };

        for lost in superseded.into_iter().filter(|op| op.origin() == self.session) {
            update
                .rejected
                .push((lost, RejectReason::ConflictRejected { winner: s.op.id }));
        }

        if self.pending.is_empty() {
            match self.visible.apply(&s.op) {
                Ok(_) => {
                    update.host_ops = cascades;
                    update.host_ops.push(s.op);
                }
                Err(e) => {
                    log::warn!("visible scene diverged at seq {}: {e}, rebuilding", s.seq);
                    update.host_ops = self.rebuild();
                }
            }
        } else {
            update.host_ops = self.rebuild();
        }
        Ok(update)
    }

    /// The server sequenced our operation `clock` at `seq`.
    pub fn acknowledge(&mut self, clock: u64, seq: u64) -> Result<MirrorUpdate, SyncError> {
        let last = self.confirmed.seq();
        if seq <= last {
            return Ok(MirrorUpdate::default());
        }
        if seq != last + 1 {
            return Err(SyncError::ResyncRequired {
                expected: last + 1,
                got: seq,
            });
        }
        let op = match self.pending.front() {
            Some(front) if front.id.clock == clock => self.pending.pop_front(),
            _ => None,
        };
        let Some(op) = op else {
            return Err(SyncError::UnknownAck { clock });
        };

        let mut update = MirrorUpdate::default();
        // visible already holds this edit unless the fold disagrees
        let folded = self
            .confirmed
            .fold(&Sequenced::new(seq, op.clone()), self.policy.as_ref())?;
        if let Folded::Rejected(reason) = folded {
            update.rejected.push((op, reason));
            update.host_ops = self.rebuild();
        }
        Ok(update)
    }

    /// Replace the confirmed state with a server snapshot.
    ///
    /// Pending operations the snapshot already covers are retired; the
    /// rest carry over onto the new state.
    pub fn apply_snapshot(&mut self, snapshot: Snapshot) -> MirrorUpdate {
        let covered = snapshot.clocks.get(&self.session).copied().unwrap_or(0);
        let before = self.pending.len();
        self.pending.retain(|op| op.id.clock > covered);
        self.clock = self.clock.max(covered);
        log::info!(
            "snapshot at seq {}: {} entities, {} pending retired, {} carried over",
            snapshot.seq,
            snapshot.tree.len(),
            before - self.pending.len(),
            self.pending.len()
        );
        self.confirmed = SceneState::from(snapshot);
        MirrorUpdate {
            host_ops: self.rebuild(),
            rejected: Vec::new(),
        }
    }

    /// Drop a pending operation that will never reach the server.
    pub fn reject_pending(&mut self, id: OpId, reason: RejectReason) -> MirrorUpdate {
        let mut update = MirrorUpdate::default();
        if let Some(pos) = self.pending.iter().position(|op| op.id == id) {
            if let Some(op) = self.pending.remove(pos) {
                update.rejected.push((op, reason));
                update.host_ops = self.rebuild();
            }
        }
        update
    }

    /// Recompute `visible` as confirmed + pending and return the
    /// corrections that take the host from the old view to the new one.
    ///
    /// Corrections carry clock 0 for this session.
    fn rebuild(&mut self) -> Vec<Operation> {
        let mut next = self.confirmed.tree().clone();
        for op in &self.pending {
            if let Err(e) = next.apply(op) {
                log::debug!("pending {op} no longer applies: {e}");
            }
        }
        let corrections = SceneTree::diff(
            &self.visible,
            &next,
            OpId {
                session: self.session,
                clock: 0,
            },
        );
        self.visible = next;
        corrections
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entity::{ComponentKind, Entity, Value};
    use crate::host::RecordingHost;
    use std::collections::BTreeMap;

    const A: SessionId = SessionId::from_u128(0xA);
    const B: SessionId = SessionId::from_u128(0xB);
    const C: SessionId = SessionId::from_u128(0xC);
    const SERVER: SessionId = SessionId::from_u128(0x5);

    const ROOT: EntityId = EntityId::from_u128(1);
    const X: EntityId = EntityId::from_u128(2);
    const Y: EntityId = EntityId::from_u128(3);
    const Z: EntityId = EntityId::from_u128(4);

    type Shape = (
        Vec<EntityId>,
        Vec<(EntityId, Option<EntityId>, Vec<EntityId>, BTreeMap<String, Value>, BTreeMap<ComponentKind, Vec<u8>>)>,
    );

    fn shape(tree: &SceneTree) -> Shape {
        (
            tree.roots().to_vec(),
            tree.iter()
                .map(|e: &Entity| (e.id, e.parent, e.children.clone(), e.properties.clone(), e.components.clone()))
                .collect(),
        )
    }

    /// Host-side scene rebuilt from nothing but local edits and callbacks.
    struct HostScene {
        tree: SceneTree,
        host: RecordingHost,
    }

    impl HostScene {
        fn new(tree: SceneTree) -> Self {
            Self {
                tree,
                host: RecordingHost::default(),
            }
        }

        fn edit(&mut self, op: &Operation) {
            self.replay(op);
        }

        fn replay(&mut self, op: &Operation) {
            if matches!(op.kind, OpKind::Delete) && !self.tree.contains(&op.target) {
                return;
            }
            if matches!(op.kind, OpKind::Create { .. }) {
                self.tree.revive(&op.target);
            }
            let mut op = op.clone();
            op.base_revision = self.tree.revision(&op.target);
            let _ = self.tree.apply(&op);
        }

        fn take(&mut self, update: MirrorUpdate) {
            update.deliver(&mut self.host);
            for op in &update.host_ops {
                self.replay(op);
            }
        }
    }

    /// Server state with ROOT holding X, Y, Z.
    fn base_state() -> SceneState {
        let mut state = SceneState::default();
        for (clock, (id, kind)) in [
            (ROOT, OpKind::create_root()),
            (X, OpKind::create_under(ROOT)),
            (Y, OpKind::create_under(ROOT)),
            (Z, OpKind::create_under(ROOT)),
        ]
        .into_iter()
        .enumerate()
        {
            let op = Operation::new(
                OpId {
                    session: SERVER,
                    clock: clock as u64 + 1,
                },
                id,
                0,
                kind,
            );
            state.sequence(op, &DefaultPolicy);
        }
        state
    }

    fn mirror_at(session: SessionId, state: &SceneState) -> SceneMirror {
        let mut m = SceneMirror::new(session);
        let update = m.apply_snapshot(state.snapshot());
        assert_eq!(update.host_ops.len(), state.tree().len());
        m
    }

    fn permutations(n: usize) -> Vec<Vec<usize>> {
        if n == 0 {
            return vec![Vec::new()];
        }
        let mut out = Vec::new();
        for rest in permutations(n - 1) {
            for at in 0..=rest.len() {
                let mut p = rest.clone();
                p.insert(at, n - 1);
                out.push(p);
            }
        }
        out
    }

    #[test]
    fn test_concurrent_edits_converge_in_every_order() {
        let base = base_state();
        let edits: Vec<(SessionId, EntityId, OpKind)> = vec![
            (A, X, OpKind::set_property("color", "red")),
            (A, Y, OpKind::reparent(Some(X))),
            (B, X, OpKind::set_property("color", "blue")),
            (B, Z, OpKind::Delete),
            (B, X, OpKind::Reorder { index: 0 }),
            (C, Y, OpKind::reparent(Some(Z))),
            (C, Y, OpKind::set_property("name", "lamp")),
        ];

        let mut checked = 0;
        for order in permutations(edits.len()) {
            // each session's edits reach the server in issue order
            let in_issue_order = [A, B, C].iter().all(|s| {
                let positions: Vec<usize> = order.iter().copied().filter(|i| edits[*i].0 == *s).collect();
                positions.windows(2).all(|w| w[0] < w[1])
            });
            if !in_issue_order {
                continue;
            }
            checked += 1;

            let mut mirrors: Vec<(SceneMirror, HostScene)> = [A, B, C]
                .iter()
                .map(|s| (mirror_at(*s, &base), HostScene::new(base.tree().clone())))
                .collect();

            // everyone edits optimistically before hearing from anyone
            let mut ops = Vec::new();
            for (session, target, kind) in &edits {
                let (mirror, host) = mirrors.iter_mut().find(|(m, _)| m.session() == *session).unwrap();
                let op = mirror.on_local_edit(*target, kind.clone());
                host.edit(&op);
                ops.push(op);
            }

            let mut server = base.clone();
            let stream: Vec<Sequenced> = order
                .iter()
                .filter_map(|i| server.sequence(ops[*i].clone(), &DefaultPolicy).map(|(s, _)| s))
                .collect();

            for (mirror, host) in mirrors.iter_mut() {
                for s in &stream {
                    let update = mirror.apply_remote(s.clone()).unwrap();
                    host.take(update);
                }
                assert_eq!(mirror.pending_len(), 0);
                assert_eq!(mirror.confirmed(), &server, "order {order:?}");
                assert_eq!(shape(mirror.visible()), shape(server.tree()), "order {order:?}");
                assert_eq!(shape(&host.tree), shape(server.tree()), "host view, order {order:?}");
                mirror.visible().validate().unwrap();
            }
        }
        assert_eq!(checked, 7 * 6 * 5 * 4 * 3 * 2 / (2 * 6 * 2));
    }

    #[test]
    fn test_property_set_before_create_is_reported() {
        let cube = EntityId::from_u128(100);
        let base = SceneState::default();
        let mut a = mirror_at(A, &base);
        let mut b = mirror_at(B, &base);
        let mut b_host = HostScene::new(SceneTree::new());

        let create = a.on_local_edit(cube, OpKind::create_root());
        // B never saw the create and edits against revision 0
        let set = b.on_local_edit(cube, OpKind::set_property("name", "renamed"));
        assert_eq!(set.base_revision, 0);

        let mut server = base.clone();
        let (s1, _) = server.sequence(create, &DefaultPolicy).unwrap();
        let (s2, folded) = server.sequence(set.clone(), &DefaultPolicy).unwrap();
        assert!(matches!(folded, Folded::Rejected(RejectReason::StructuralViolation(_))));

        b_host.take(b.apply_remote(s1.clone()).unwrap());
        b_host.take(b.apply_remote(s2.clone()).unwrap());
        a.apply_remote(s1).unwrap();
        a.apply_remote(s2).unwrap();

        assert_eq!(b_host.host.rejected.len(), 1);
        assert_eq!(b_host.host.rejected[0].0.id, set.id);
        for m in [&a, &b] {
            let e = m.visible().get(&cube).unwrap();
            assert!(e.properties.is_empty());
        }
        assert!(b_host.tree.get(&cube).is_some_and(|e| e.properties.is_empty()));
    }

    #[test]
    fn test_last_writer_wins_on_every_peer() {
        let base = base_state();
        let mut a = mirror_at(A, &base);
        let mut b = mirror_at(B, &base);
        let mut c = mirror_at(C, &base);

        let red = a.on_local_edit(X, OpKind::set_property("color", "red"));
        let blue = b.on_local_edit(X, OpKind::set_property("color", "blue"));

        let mut server = base.clone();
        let (s5, _) = server.sequence(red.clone(), &DefaultPolicy).unwrap();
        let (s6, _) = server.sequence(blue, &DefaultPolicy).unwrap();
        assert_eq!((s5.seq, s6.seq), (5, 6));

        let mut a_update = MirrorUpdate::default();
        for m in [&mut a, &mut b, &mut c] {
            for s in [&s5, &s6] {
                let u = m.apply_remote(s.clone()).unwrap();
                if m.session() == A {
                    a_update.rejected.extend(u.rejected);
                }
            }
            let x = m.visible().get(&X).unwrap();
            assert_eq!(x.property("color"), Some(&Value::String("blue".into())));
        }
        // A is told its write was overridden
        assert_eq!(a_update.rejected.len(), 1);
        assert_eq!(a_update.rejected[0].0.id, red.id);
    }

    #[test]
    fn test_cascade_delete_reaches_every_peer() {
        let mut base = base_state();
        let leaf = EntityId::from_u128(50);
        base.sequence(
            Operation::new(OpId { session: SERVER, clock: 10 }, leaf, 0, OpKind::create_under(Y)),
            &DefaultPolicy,
        );
        let mut a = mirror_at(A, &base);
        let mut b = mirror_at(B, &base);
        let mut b_host = HostScene::new(base.tree().clone());

        let del = a.on_local_edit(ROOT, OpKind::Delete);
        assert!(a.visible().is_empty());

        let mut server = base.clone();
        let (s, _) = server.sequence(del, &DefaultPolicy).unwrap();
        let update = b.apply_remote(s.clone()).unwrap();
        let deleted: Vec<EntityId> = update.host_ops.iter().map(|o| o.target).collect();
        assert_eq!(deleted, vec![X, leaf, Y, Z, ROOT]);
        b_host.take(update);
        a.apply_remote(s).unwrap();

        for tree in [a.visible(), b.visible(), &b_host.tree] {
            assert!(tree.is_empty());
            for id in [ROOT, X, Y, Z, leaf] {
                assert!(!tree.contains(&id));
            }
        }
    }

    #[test]
    fn test_random_reparents_never_cycle() {
        let base = base_state();
        let mut mirror = mirror_at(A, &base);
        let ids = [ROOT, X, Y, Z];
        // xorshift, fixed seed
        let mut seed: u64 = 0x2545_F491_4F6C_DD1D;
        let mut next = || {
            seed ^= seed << 13;
            seed ^= seed >> 7;
            seed ^= seed << 17;
            seed
        };
        for _ in 0..500 {
            let target = ids[(next() % 4) as usize];
            let parent = match next() % 5 {
                4 => None,
                i => Some(ids[i as usize]),
            };
            mirror.on_local_edit(target, OpKind::reparent(parent));
            mirror.visible().validate().unwrap();
        }
    }

    #[test]
    fn test_gap_requires_resync_and_snapshot_recovers() {
        let base = base_state();
        let mut a = mirror_at(A, &base);
        let mut server = base.clone();

        let local = a.on_local_edit(X, OpKind::set_property("name", "mine"));
        let other = |clock| Operation::new(OpId { session: B, clock }, Y, 1, OpKind::set_property("k", clock as i64));
        let (_s5, _) = server.sequence(other(1), &DefaultPolicy).unwrap();
        let (s6, _) = server.sequence(other(2), &DefaultPolicy).unwrap();

        // s5 lost in transit
        assert_eq!(
            a.apply_remote(s6),
            Err(SyncError::ResyncRequired { expected: 5, got: 6 })
        );
        assert_eq!(a.last_seq(), 4);

        let mut host = HostScene::new(a.visible().clone());
        host.take(a.apply_snapshot(server.snapshot()));
        assert_eq!(a.last_seq(), server.seq());
        // our edit was never sequenced and survives the resync
        assert_eq!(a.pending_len(), 1);
        assert_eq!(
            a.visible().get(&X).unwrap().property("name"),
            Some(&Value::String("mine".into()))
        );
        assert_eq!(shape(&host.tree), shape(a.visible()));

        let (s7, _) = server.sequence(local, &DefaultPolicy).unwrap();
        a.acknowledge(s7.op.id.clock, s7.seq).unwrap();
        assert_eq!(a.pending_len(), 0);
        assert_eq!(shape(a.visible()), shape(server.tree()));
    }

    #[test]
    fn test_snapshot_retires_sequenced_pending() {
        let base = base_state();
        let mut a = mirror_at(A, &base);
        let first = a.on_local_edit(X, OpKind::set_property("n", 1i64));
        a.on_local_edit(X, OpKind::set_property("n", 2i64));

        let mut server = base.clone();
        server.sequence(first, &DefaultPolicy).unwrap();
        a.apply_snapshot(server.snapshot());
        assert_eq!(a.pending_len(), 1);
        assert_eq!(a.visible().get(&X).unwrap().property("n"), Some(&Value::Int(2)));
    }

    #[test]
    fn test_unknown_ack() {
        let base = base_state();
        let mut a = mirror_at(A, &base);
        assert_eq!(a.acknowledge(1, 5), Err(SyncError::UnknownAck { clock: 1 }));
        // duplicates are ignored
        assert_eq!(a.acknowledge(1, 3), Ok(MirrorUpdate::default()));
    }

    #[test]
    fn test_reject_pending_reverts_visible() {
        let base = base_state();
        let mut a = mirror_at(A, &base);
        let mut host = HostScene::new(base.tree().clone());
        let op = a.on_local_edit(Z, OpKind::Delete);
        host.edit(&op);
        assert!(!a.visible().contains(&Z));

        let update = a.reject_pending(op.id, RejectReason::BufferOverflow);
        assert_eq!(update.rejected.len(), 1);
        host.take(update);
        assert!(a.visible().contains(&Z));
        assert_eq!(shape(&host.tree), shape(base.tree()));
        assert_eq!(host.host.rejected[0].1, RejectReason::BufferOverflow);
    }
}

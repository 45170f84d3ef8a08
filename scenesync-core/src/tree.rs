//! In-memory scene forest and the raw mutation rules.
//!
//! [`SceneTree::apply`] is the single place where an operation touches the
//! forest. It enforces the structural invariants (no cycles, at most one
//! parent, ids never reused) but knows nothing about concurrency; conflict
//! handling sits one level up in [`SceneState`](crate::state::SceneState).
//!
//! ```text
//!   roots: [A, D]
//!
//!   A ── B ── C          parent links are relations only,
//!   │                    the tree owns every entity by id
//!   └─ E
//!   D
//! ```

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

use crate::entity::{Entity, EntityId, Value};
use crate::error::StructuralViolation;
use crate::operation::{OpId, OpKind, Operation};

/// The scene forest.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SceneTree {
    entities: BTreeMap<EntityId, Entity>,
    /// Ordered top-level entities
    roots: Vec<EntityId>,
    /// Ids of deleted entities; never reused
    tombstones: BTreeSet<EntityId>,
}

impl SceneTree {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, id: &EntityId) -> Option<&Entity> {
        self.entities.get(id)
    }

    pub fn contains(&self, id: &EntityId) -> bool {
        self.entities.contains_key(id)
    }

    pub fn is_deleted(&self, id: &EntityId) -> bool {
        self.tombstones.contains(id)
    }

    pub fn len(&self) -> usize {
        self.entities.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entities.is_empty()
    }

    pub fn roots(&self) -> &[EntityId] {
        &self.roots
    }

    pub fn tombstones(&self) -> impl Iterator<Item = &EntityId> {
        self.tombstones.iter()
    }

    /// Entities in id order.
    pub fn iter(&self) -> impl Iterator<Item = &Entity> {
        self.entities.values()
    }

    /// Current revision, 0 for unknown or deleted entities.
    pub fn revision(&self, id: &EntityId) -> u64 {
        self.entities.get(id).map_or(0, |e| e.revision)
    }

    /// Children of `parent`, or the roots for `None`.
    pub fn children_of(&self, parent: Option<&EntityId>) -> &[EntityId] {
        match parent {
            Some(p) => self.entities.get(p).map_or(&[], |e| e.children.as_slice()),
            None => &self.roots,
        }
    }

    /// Is `ancestor` a strict ancestor of `id`?
    pub fn is_ancestor(&self, ancestor: &EntityId, id: &EntityId) -> bool {
        let mut cursor = self.entities.get(id).and_then(|e| e.parent);
        while let Some(p) = cursor {
            if p == *ancestor {
                return true;
            }
            cursor = self.entities.get(&p).and_then(|e| e.parent);
        }
        false
    }

    /// Number of ancestors.
    pub fn depth(&self, id: &EntityId) -> usize {
        let mut depth = 0;
        let mut cursor = self.entities.get(id).and_then(|e| e.parent);
        while let Some(p) = cursor {
            depth += 1;
            cursor = self.entities.get(&p).and_then(|e| e.parent);
        }
        depth
    }

    /// Ancestors from the direct parent up to the root.
    pub fn ancestors(&self, id: &EntityId) -> Vec<EntityId> {
        let mut out = Vec::new();
        let mut cursor = self.entities.get(id).and_then(|e| e.parent);
        while let Some(p) = cursor {
            out.push(p);
            cursor = self.entities.get(&p).and_then(|e| e.parent);
        }
        out
    }

    /// All descendants of `id`, deepest first, excluding `id` itself.
    pub fn descendants_post_order(&self, id: &EntityId) -> Vec<EntityId> {
        let mut out = Vec::new();
        // (entity, index of the next child to visit)
        let mut stack = vec![(*id, 0usize)];
        while let Some(frame) = stack.last_mut() {
            let (node, next) = *frame;
            let child = self.entities.get(&node).and_then(|e| e.children.get(next)).copied();
            match child {
                Some(c) => {
                    frame.1 += 1;
                    stack.push((c, 0));
                }
                None => {
                    stack.pop();
                    if !stack.is_empty() {
                        out.push(node);
                    }
                }
            }
        }
        out
    }

    /// Apply one operation.
    ///
    /// Returns the implicit cascade deletes produced by a Delete (deepest
    /// first), empty for every other kind. The tree is unchanged on error.
    pub fn apply(&mut self, op: &Operation) -> Result<Vec<Operation>, StructuralViolation> {
        let target = op.target;

        if let OpKind::Create {
            parent,
            index,
            properties,
            components,
        } = &op.kind
        {
            if self.entities.contains_key(&target) || self.tombstones.contains(&target) {
                return Err(StructuralViolation::DuplicateEntity(target));
            }
            if let Some(p) = parent {
                self.check_parent(target, *p)?;
            }
            let mut entity = Entity::new(target);
            entity.parent = *parent;
            entity.properties = properties.clone();
            entity.components = components.clone();
            entity.revision = 1;
            self.entities.insert(target, entity);
            self.attach(target, *parent, *index);
            return Ok(Vec::new());
        }

        if self.tombstones.contains(&target) {
            return Err(StructuralViolation::EntityDeleted(target));
        }
        if !self.entities.contains_key(&target) {
            return Err(StructuralViolation::UnknownEntity(target));
        }
        if op.base_revision == 0 {
            return Err(StructuralViolation::StaleBase {
                entity: target,
                base: op.base_revision,
            });
        }

        match &op.kind {
            OpKind::Create { .. } => unreachable!("handled above"),

            OpKind::Delete => {
                let doomed = self.descendants_post_order(&target);
                let cascades = doomed
                    .iter()
                    .map(|d| Operation::new(op.id, *d, self.revision(d), OpKind::Delete))
                    .collect();
                self.detach(target);
                for id in doomed.iter().chain(std::iter::once(&target)) {
                    self.entities.remove(id);
                    self.tombstones.insert(*id);
                }
                return Ok(cascades);
            }

            OpKind::Reparent { parent, index } => {
                if let Some(p) = parent {
                    self.check_parent(target, *p)?;
                    if *p == target || self.is_ancestor(&target, p) {
                        return Err(StructuralViolation::Cycle {
                            entity: target,
                            parent: *p,
                        });
                    }
                }
                self.detach(target);
                if let Some(e) = self.entities.get_mut(&target) {
                    e.parent = *parent;
                }
                self.attach(target, *parent, *index);
            }

            OpKind::Reorder { index } => {
                let parent = self.entities.get(&target).and_then(|e| e.parent);
                self.detach(target);
                self.attach(target, parent, Some(*index));
            }

            OpKind::SetComponent { kind, data } => {
                if let Some(e) = self.entities.get_mut(&target) {
                    match data {
                        Some(bytes) => {
                            e.components.insert(*kind, bytes.clone());
                        }
                        None => {
                            e.components.remove(kind);
                        }
                    }
                }
            }

            OpKind::SetProperty { key, value } => {
                if let Some(e) = self.entities.get_mut(&target) {
                    match value {
                        Some(v) => {
                            e.properties.insert(key.clone(), v.clone());
                        }
                        None => {
                            e.properties.remove(key);
                        }
                    }
                }
            }

            // Unknown kinds leave the tree and the revision alone
            OpKind::Opaque { .. } => return Ok(Vec::new()),
        }

        if let Some(e) = self.entities.get_mut(&target) {
            e.revision += 1;
        }
        Ok(Vec::new())
    }

    fn check_parent(&self, entity: EntityId, parent: EntityId) -> Result<(), StructuralViolation> {
        if self.tombstones.contains(&parent) {
            return Err(StructuralViolation::ParentDeleted { entity, parent });
        }
        if !self.entities.contains_key(&parent) {
            return Err(StructuralViolation::UnknownParent { entity, parent });
        }
        Ok(())
    }

    /// Remove `id` from its parent's child list (or the roots).
    fn detach(&mut self, id: EntityId) {
        let parent = self.entities.get(&id).and_then(|e| e.parent);
        let siblings = match parent {
            Some(p) => match self.entities.get_mut(&p) {
                Some(e) => &mut e.children,
                None => return,
            },
            None => &mut self.roots,
        };
        siblings.retain(|c| *c != id);
    }

    /// Insert `id` into the child list of `parent` at a clamped index.
    fn attach(&mut self, id: EntityId, parent: Option<EntityId>, index: Option<u32>) {
        let siblings = match parent {
            Some(p) => match self.entities.get_mut(&p) {
                Some(e) => &mut e.children,
                None => return,
            },
            None => &mut self.roots,
        };
        let at = index.map_or(siblings.len(), |i| (i as usize).min(siblings.len()));
        siblings.insert(at, id);
    }

    /// Forget that `id` was deleted so it can be created again. Only for
    /// replaying corrections onto a host-side copy after a reverted delete.
    pub fn revive(&mut self, id: &EntityId) {
        self.tombstones.remove(id);
    }

    /// Check the forest invariants. Used by tests and debug assertions.
    pub fn validate(&self) -> Result<(), String> {
        let mut seen = BTreeSet::new();
        for root in &self.roots {
            match self.entities.get(root) {
                Some(e) if e.parent.is_none() => {}
                _ => return Err(format!("root {root} is missing or has a parent")),
            }
        }
        for e in self.entities.values() {
            if self.tombstones.contains(&e.id) {
                return Err(format!("{} is both live and deleted", e.id));
            }
            let listed = self.children_of(e.parent.as_ref()).iter().filter(|c| **c == e.id).count();
            if listed != 1 {
                return Err(format!("{} listed {listed} times under its parent", e.id));
            }
            for child in &e.children {
                match self.entities.get(child) {
                    Some(c) if c.parent == Some(e.id) => {}
                    _ => return Err(format!("child {child} of {} has a different parent", e.id)),
                }
            }
            seen.insert(e.id);
        }
        // A cycle never hangs off a root, so it shows up as unreachable
        let reachable = self.roots.len()
            + self.roots.iter().map(|r| self.descendants_post_order(r).len()).sum::<usize>();
        if reachable != seen.len() {
            return Err(format!("{} entities, {reachable} reachable from roots", seen.len()));
        }
        Ok(())
    }

    /// Order-sensitive checksum of the whole forest.
    ///
    /// Two running sums over every field in id order, so equal trees give
    /// equal checksums on every peer.
    pub fn checksum(&self) -> u64 {
        let mut sum = Checksum::default();
        for root in &self.roots {
            sum.id(root);
        }
        for e in self.entities.values() {
            sum.id(&e.id);
            sum.add(e.revision);
            match &e.parent {
                Some(p) => sum.id(p),
                None => sum.add(0),
            }
            for child in &e.children {
                sum.id(child);
            }
            for (kind, data) in &e.components {
                sum.add(u16::from(*kind) as u64);
                sum.bytes(data);
            }
            for (key, value) in &e.properties {
                sum.bytes(key.as_bytes());
                sum.value(value);
            }
        }
        for t in &self.tombstones {
            sum.id(t);
        }
        sum.finish()
    }

    /// Corrective operations that turn `old` into `new`, in host order:
    /// detach moved entities, deletes, creates, reparents, field updates,
    /// then sibling moves.
    ///
    /// An entity deleted in `old` but live in `new` (a reverted delete) is
    /// re-created.
    ///
    /// Every emitted operation carries `id`; revisions are those of the
    /// intermediate state so a host could replay them through [`apply`].
    ///
    /// [`apply`]: SceneTree::apply
    pub fn diff(old: &SceneTree, new: &SceneTree, id: OpId) -> Vec<Operation> {
        fn emit(work: &mut SceneTree, out: &mut Vec<Operation>, op: Operation) {
            match work.apply(&op) {
                Ok(_) => out.push(op),
                Err(e) => log::debug!("diff skipped {op}: {e}"),
            }
        }

        let mut work = old.clone();
        let mut out = Vec::new();

        // Detach moved entities first: deleting their old parent must not take
        // them along, and reparenting from the roots can never form a cycle
        let mut moved: Vec<EntityId> = new
            .entities
            .values()
            .filter(|e| work.get(&e.id).is_some_and(|w| w.parent != e.parent))
            .map(|e| e.id)
            .collect();
        moved.sort_by_key(|id| new.depth(id));
        for target in &moved {
            let op = Operation::new(id, *target, work.revision(target), OpKind::reparent(None));
            emit(&mut work, &mut out, op);
        }

        // Deletes: top-most removed entities; cascades cover their subtrees
        let mut removed: Vec<EntityId> = old
            .entities
            .keys()
            .filter(|id| !new.entities.contains_key(id))
            .copied()
            .collect();
        removed.sort_by_key(|id| old.depth(id));
        for target in removed {
            if !work.contains(&target) {
                continue;
            }
            let op = Operation::new(id, target, work.revision(&target), OpKind::Delete);
            let cascades = work.descendants_post_order(&target);
            for d in cascades {
                out.push(Operation::new(id, d, work.revision(&d), OpKind::Delete));
            }
            emit(&mut work, &mut out, op);
        }

        // Creates, parents first
        let mut created: Vec<&Entity> = new
            .entities
            .values()
            .filter(|e| !work.contains(&e.id))
            .collect();
        created.sort_by_key(|e| new.depth(&e.id));
        for e in created {
            work.revive(&e.id);
            let index = new
                .children_of(e.parent.as_ref())
                .iter()
                .position(|c| *c == e.id)
                .map(|i| i as u32);
            let kind = OpKind::Create {
                parent: e.parent,
                index,
                properties: e.properties.clone(),
                components: e.components.clone(),
            };
            emit(&mut work, &mut out, Operation::new(id, e.id, 0, kind));
        }

        for target in &moved {
            if let Some(parent) = new.get(target).and_then(|e| e.parent) {
                let op = Operation::new(id, *target, work.revision(target), OpKind::reparent(Some(parent)));
                emit(&mut work, &mut out, op);
            }
        }

        // Field updates
        for e in new.entities.values() {
            let Some(before) = old.get(&e.id) else { continue };
            let keys: BTreeSet<&String> = before.properties.keys().chain(e.properties.keys()).collect();
            for key in keys {
                let now = e.properties.get(key);
                if before.properties.get(key) != now {
                    let kind = OpKind::SetProperty {
                        key: key.clone(),
                        value: now.cloned(),
                    };
                    let op = Operation::new(id, e.id, work.revision(&e.id), kind);
                    emit(&mut work, &mut out, op);
                }
            }
            let kinds: BTreeSet<_> = before.components.keys().chain(e.components.keys()).copied().collect();
            for kind in kinds {
                let now = e.components.get(&kind);
                if before.components.get(&kind) != now {
                    let k = OpKind::SetComponent {
                        kind,
                        data: now.cloned(),
                    };
                    let op = Operation::new(id, e.id, work.revision(&e.id), k);
                    emit(&mut work, &mut out, op);
                }
            }
        }

        // Sibling order
        let parents: Vec<Option<EntityId>> = std::iter::once(None)
            .chain(new.entities.keys().map(|k| Some(*k)))
            .collect();
        for parent in parents {
            let wanted = new.children_of(parent.as_ref()).to_vec();
            if work.children_of(parent.as_ref()) == wanted.as_slice() {
                continue;
            }
            for (i, child) in wanted.iter().enumerate() {
                let kind = OpKind::Reorder { index: i as u32 };
                let op = Operation::new(id, *child, work.revision(child), kind);
                emit(&mut work, &mut out, op);
            }
        }

        out
    }
}

#[derive(Default)]
struct Checksum {
    a: u64,
    b: u64,
}

impl Checksum {
    fn add(&mut self, v: u64) {
        self.a = (self.a + (v % u32::MAX as u64)) % u32::MAX as u64;
        self.b = (self.b + self.a) % u32::MAX as u64;
    }

    fn bytes(&mut self, data: &[u8]) {
        self.add(data.len() as u64);
        for chunk in data.chunks(4) {
            let mut word = [0u8; 4];
            word[..chunk.len()].copy_from_slice(chunk);
            self.add(u32::from_le_bytes(word) as u64);
        }
    }

    fn id(&mut self, id: &EntityId) {
        let (hi, lo) = id.0.as_u64_pair();
        self.add(hi >> 32);
        self.add(hi & 0xFFFF_FFFF);
        self.add(lo >> 32);
        self.add(lo & 0xFFFF_FFFF);
    }

    fn value(&mut self, value: &Value) {
        self.add(value.type_tag() as u64);
        match value {
            Value::Null => {}
            Value::Bool(b) => self.add(*b as u64),
            Value::Int(i) => self.bytes(&i.to_le_bytes()),
            Value::Float(f) => self.bytes(&f.to_bits().to_le_bytes()),
            Value::String(s) => self.bytes(s.as_bytes()),
            Value::Bytes(b) => self.bytes(b),
            Value::Vec3(v) => v.iter().for_each(|f| self.add(f.to_bits() as u64)),
            Value::Quat(v) | Value::Color(v) => v.iter().for_each(|f| self.add(f.to_bits() as u64)),
            Value::Reference(id) => self.id(id),
            Value::List(items) => items.iter().for_each(|v| self.value(v)),
            Value::Map(map) => {
                for (k, v) in map {
                    self.bytes(k.as_bytes());
                    self.value(v);
                }
            }
        }
    }

    fn finish(&self) -> u64 {
        (self.b << 32) | self.a
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entity::{ComponentKind, SessionId};

    fn oid() -> OpId {
        OpId {
            session: SessionId::from_u128(1),
            clock: 1,
        }
    }

    fn e(n: u128) -> EntityId {
        EntityId::from_u128(n)
    }

    fn apply(tree: &mut SceneTree, target: EntityId, kind: OpKind) -> Result<Vec<Operation>, StructuralViolation> {
        let rev = tree.revision(&target);
        tree.apply(&Operation::new(oid(), target, rev, kind))
    }

    /// 1 ── 2 ── 3
    ///      └── 4
    fn sample() -> SceneTree {
        let mut t = SceneTree::new();
        apply(&mut t, e(1), OpKind::create_root()).unwrap();
        apply(&mut t, e(2), OpKind::create_under(e(1))).unwrap();
        apply(&mut t, e(3), OpKind::create_under(e(2))).unwrap();
        apply(&mut t, e(4), OpKind::create_under(e(2))).unwrap();
        t
    }

    #[test]
    fn test_create_and_structure() {
        let t = sample();
        assert_eq!(t.len(), 4);
        assert_eq!(t.roots(), &[e(1)]);
        assert_eq!(t.get(&e(2)).unwrap().children, vec![e(3), e(4)]);
        assert_eq!(t.depth(&e(3)), 2);
        assert!(t.is_ancestor(&e(1), &e(4)));
        assert!(!t.is_ancestor(&e(4), &e(1)));
        assert_eq!(t.revision(&e(1)), 1);
        t.validate().unwrap();
    }

    #[test]
    fn test_create_duplicate_rejected() {
        let mut t = sample();
        let err = apply(&mut t, e(2), OpKind::create_root()).unwrap_err();
        assert_eq!(err, StructuralViolation::DuplicateEntity(e(2)));
    }

    #[test]
    fn test_create_under_unknown_parent() {
        let mut t = SceneTree::new();
        let err = apply(&mut t, e(2), OpKind::create_under(e(9))).unwrap_err();
        assert!(matches!(err, StructuralViolation::UnknownParent { .. }));
        assert!(t.is_empty());
    }

    #[test]
    fn test_delete_cascades_deepest_first() {
        let mut t = sample();
        let cascades = apply(&mut t, e(2), OpKind::Delete).unwrap();
        let targets: Vec<EntityId> = cascades.iter().map(|o| o.target).collect();
        assert_eq!(targets, vec![e(3), e(4)]);
        assert_eq!(t.len(), 1);
        assert!(t.is_deleted(&e(2)) && t.is_deleted(&e(3)) && t.is_deleted(&e(4)));
        assert!(t.get(&e(1)).unwrap().children.is_empty());
        t.validate().unwrap();
    }

    #[test]
    fn test_delete_deep_chain() {
        let n = 100_000u128;
        let mut t = SceneTree::new();
        apply(&mut t, e(1), OpKind::create_root()).unwrap();
        for i in 2..=n {
            apply(&mut t, e(i), OpKind::create_under(e(i - 1))).unwrap();
        }
        assert_eq!(t.depth(&e(n)), (n - 1) as usize);
        t.validate().unwrap();

        let cascades = apply(&mut t, e(1), OpKind::Delete).unwrap();
        assert_eq!(cascades.len(), (n - 1) as usize);
        assert_eq!(cascades[0].target, e(n));
        assert_eq!(cascades[cascades.len() - 1].target, e(2));
        assert!(t.is_empty());
        assert!(t.is_deleted(&e(n)));
    }

    #[test]
    fn test_deleted_id_never_reused() {
        let mut t = sample();
        apply(&mut t, e(4), OpKind::Delete).unwrap();
        let err = apply(&mut t, e(4), OpKind::create_root()).unwrap_err();
        assert_eq!(err, StructuralViolation::DuplicateEntity(e(4)));
    }

    #[test]
    fn test_reparent_cycle_rejected() {
        let mut t = sample();
        let err = apply(&mut t, e(1), OpKind::reparent(Some(e(3)))).unwrap_err();
        assert_eq!(err, StructuralViolation::Cycle { entity: e(1), parent: e(3) });
        let err = apply(&mut t, e(2), OpKind::reparent(Some(e(2)))).unwrap_err();
        assert!(matches!(err, StructuralViolation::Cycle { .. }));
        t.validate().unwrap();
    }

    #[test]
    fn test_reparent_under_deleted_parent() {
        let mut t = sample();
        apply(&mut t, e(3), OpKind::Delete).unwrap();
        let err = apply(&mut t, e(4), OpKind::reparent(Some(e(3)))).unwrap_err();
        assert_eq!(err, StructuralViolation::ParentDeleted { entity: e(4), parent: e(3) });
    }

    #[test]
    fn test_reparent_to_root_and_back() {
        let mut t = sample();
        apply(&mut t, e(3), OpKind::reparent(None)).unwrap();
        assert_eq!(t.roots(), &[e(1), e(3)]);
        assert_eq!(t.revision(&e(3)), 2);
        apply(&mut t, e(3), OpKind::Reparent { parent: Some(e(1)), index: Some(0) }).unwrap();
        assert_eq!(t.get(&e(1)).unwrap().children, vec![e(3), e(2)]);
        t.validate().unwrap();
    }

    #[test]
    fn test_reorder_clamps_index() {
        let mut t = sample();
        apply(&mut t, e(3), OpKind::Reorder { index: 99 }).unwrap();
        assert_eq!(t.get(&e(2)).unwrap().children, vec![e(4), e(3)]);
        apply(&mut t, e(3), OpKind::Reorder { index: 0 }).unwrap();
        assert_eq!(t.get(&e(2)).unwrap().children, vec![e(3), e(4)]);
    }

    #[test]
    fn test_set_and_remove_fields() {
        let mut t = sample();
        apply(&mut t, e(3), OpKind::set_property("name", "cube")).unwrap();
        apply(&mut t, e(3), OpKind::set_component(ComponentKind::Mesh, vec![9])).unwrap();
        let ent = t.get(&e(3)).unwrap();
        assert_eq!(ent.property("name"), Some(&Value::String("cube".into())));
        assert_eq!(ent.revision, 3);

        apply(&mut t, e(3), OpKind::SetProperty { key: "name".into(), value: None }).unwrap();
        apply(&mut t, e(3), OpKind::SetComponent { kind: ComponentKind::Mesh, data: None }).unwrap();
        let ent = t.get(&e(3)).unwrap();
        assert!(ent.properties.is_empty());
        assert!(ent.components.is_empty());
    }

    #[test]
    fn test_stale_base_zero_rejected() {
        let mut t = sample();
        let op = Operation::new(oid(), e(3), 0, OpKind::set_property("x", 1i64));
        assert!(matches!(t.apply(&op), Err(StructuralViolation::StaleBase { .. })));
    }

    #[test]
    fn test_opaque_leaves_revision() {
        let mut t = sample();
        let before = t.clone();
        apply(&mut t, e(3), OpKind::Opaque { tag: 200, body: vec![1] }).unwrap();
        assert_eq!(t, before);
    }

    #[test]
    fn test_checksum_tracks_changes() {
        let a = sample();
        let mut b = sample();
        assert_eq!(a.checksum(), b.checksum());
        apply(&mut b, e(4), OpKind::set_property("visible", false)).unwrap();
        assert_ne!(a.checksum(), b.checksum());

        let mut c = sample();
        apply(&mut c, e(4), OpKind::Reorder { index: 0 }).unwrap();
        assert_ne!(a.checksum(), c.checksum());
    }

    #[test]
    fn test_diff_replays_to_target() {
        let old = sample();
        let mut new = sample();
        apply(&mut new, e(4), OpKind::Delete).unwrap();
        apply(&mut new, e(5), OpKind::create_under(e(3))).unwrap();
        apply(&mut new, e(2), OpKind::reparent(None)).unwrap();
        apply(&mut new, e(1), OpKind::reparent(Some(e(3)))).unwrap();
        apply(&mut new, e(5), OpKind::set_property("name", "lamp")).unwrap();

        let ops = SceneTree::diff(&old, &new, oid());
        assert!(!ops.is_empty());

        let mut replay = old.clone();
        for op in &ops {
            // cascades are reported alongside their delete
            if matches!(op.kind, OpKind::Delete) && !replay.contains(&op.target) {
                continue;
            }
            let rev = replay.revision(&op.target);
            let mut op = op.clone();
            op.base_revision = rev;
            let _ = replay.apply(&op);
        }
        replay.validate().unwrap();

        let shape = |t: &SceneTree| -> Vec<(EntityId, Option<EntityId>, Vec<EntityId>, BTreeMap<String, Value>)> {
            t.iter().map(|e| (e.id, e.parent, e.children.clone(), e.properties.clone())).collect()
        };
        assert_eq!(shape(&replay), shape(&new));
        assert_eq!(replay.roots(), new.roots());
    }

    #[test]
    fn test_diff_identical_is_empty() {
        let t = sample();
        assert!(SceneTree::diff(&t, &t, oid()).is_empty());
    }
}

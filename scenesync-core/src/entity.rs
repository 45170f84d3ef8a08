//! Neutral scene model: entities, typed property values and component kinds.
//!
//! Host engines map their object graphs onto this model through a
//! [`HostAdapter`](crate::host::HostAdapter). Inheritance hierarchies on the
//! host side become a [`ComponentKind`] tag plus an opaque payload here.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use uuid::Uuid;

/// Stable entity identifier. Assigned once, never reused after deletion.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct EntityId(pub Uuid);

impl EntityId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Deterministic id, mostly for tests and fixtures.
    pub const fn from_u128(v: u128) -> Self {
        Self(Uuid::from_u128(v))
    }
}

impl Default for EntityId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for EntityId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "entity:{}", self.0)
    }
}

/// Identifier of a connected participant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct SessionId(pub Uuid);

impl SessionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub const fn from_u128(v: u128) -> Self {
        Self(Uuid::from_u128(v))
    }
}

impl Default for SessionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "session:{}", self.0)
    }
}

/// Typed property value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Value {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    String(String),
    Bytes(Vec<u8>),
    Vec3([f32; 3]),
    Quat([f32; 4]),
    Color([f32; 4]),
    /// Weak reference to another entity
    Reference(EntityId),
    List(Vec<Value>),
    Map(BTreeMap<String, Value>),
}

impl Value {
    /// Stable type tag, used by the scene checksum.
    pub fn type_tag(&self) -> u32 {
        match self {
            Value::Null => 0,
            Value::Bool(_) => 1,
            Value::Int(_) => 2,
            Value::Float(_) => 3,
            Value::String(_) => 4,
            Value::Bytes(_) => 5,
            Value::Vec3(_) => 6,
            Value::Quat(_) => 7,
            Value::Color(_) => 8,
            Value::Reference(_) => 9,
            Value::List(_) => 10,
            Value::Map(_) => 11,
        }
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Value::Bool(v)
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::Int(v)
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Value::Float(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::String(v.to_string())
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Value::String(v)
    }
}

/// Component kind tag.
///
/// Serialized as its `u16` tag. Tags this build does not know decode to
/// [`ComponentKind::Opaque`] so mixed-version peers keep working.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(from = "u16", into = "u16")]
pub enum ComponentKind {
    Transform,
    Mesh,
    Material,
    Light,
    Camera,
    Landscape,
    Foliage,
    Sequencer,
    Script,
    /// A kind introduced by a newer peer
    Opaque(u16),
}

impl From<u16> for ComponentKind {
    fn from(tag: u16) -> Self {
        match tag {
            1 => ComponentKind::Transform,
            2 => ComponentKind::Mesh,
            3 => ComponentKind::Material,
            4 => ComponentKind::Light,
            5 => ComponentKind::Camera,
            6 => ComponentKind::Landscape,
            7 => ComponentKind::Foliage,
            8 => ComponentKind::Sequencer,
            9 => ComponentKind::Script,
            other => ComponentKind::Opaque(other),
        }
    }
}

impl From<ComponentKind> for u16 {
    fn from(kind: ComponentKind) -> Self {
        match kind {
            ComponentKind::Transform => 1,
            ComponentKind::Mesh => 2,
            ComponentKind::Material => 3,
            ComponentKind::Light => 4,
            ComponentKind::Camera => 5,
            ComponentKind::Landscape => 6,
            ComponentKind::Foliage => 7,
            ComponentKind::Sequencer => 8,
            ComponentKind::Script => 9,
            ComponentKind::Opaque(tag) => tag,
        }
    }
}

/// A node in the scene graph.
///
/// `parent` is a relation only; the tree owns entities by id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Entity {
    pub id: EntityId,
    pub parent: Option<EntityId>,
    pub children: Vec<EntityId>,
    pub components: BTreeMap<ComponentKind, Vec<u8>>,
    pub properties: BTreeMap<String, Value>,
    /// Only ever increases. 0 means "does not exist yet".
    pub revision: u64,
}

impl Entity {
    /// A fresh, parentless entity at revision 0.
    pub fn new(id: EntityId) -> Self {
        Self {
            id,
            parent: None,
            children: Vec::new(),
            components: BTreeMap::new(),
            properties: BTreeMap::new(),
            revision: 0,
        }
    }

    pub fn with_property(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.properties.insert(key.into(), value.into());
        self
    }

    pub fn with_component(mut self, kind: ComponentKind, data: Vec<u8>) -> Self {
        self.components.insert(kind, data);
        self
    }

    pub fn with_parent(mut self, parent: EntityId) -> Self {
        self.parent = Some(parent);
        self
    }

    pub fn property(&self, key: &str) -> Option<&Value> {
        self.properties.get(key)
    }

    pub fn component(&self, kind: ComponentKind) -> Option<&[u8]> {
        self.components.get(&kind).map(Vec::as_slice)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_component_kind_tags() {
        for tag in 1..=9u16 {
            let kind = ComponentKind::from(tag);
            assert!(!matches!(kind, ComponentKind::Opaque(_)));
            assert_eq!(u16::from(kind), tag);
        }
        assert_eq!(ComponentKind::from(4711), ComponentKind::Opaque(4711));
        assert_eq!(u16::from(ComponentKind::Opaque(4711)), 4711);
    }

    #[test]
    fn test_entity_builder() {
        let id = EntityId::from_u128(7);
        let parent = EntityId::from_u128(1);
        let e = Entity::new(id)
            .with_property("name", "cube1")
            .with_component(ComponentKind::Mesh, vec![1, 2, 3])
            .with_parent(parent);

        assert_eq!(e.property("name"), Some(&Value::String("cube1".into())));
        assert_eq!(e.component(ComponentKind::Mesh), Some(&[1u8, 2, 3][..]));
        assert_eq!(e.parent, Some(parent));
        assert_eq!(e.revision, 0);
    }

    #[test]
    fn test_value_type_tags_distinct() {
        let values = vec![
            Value::Null,
            Value::Bool(true),
            Value::Int(1),
            Value::Float(1.0),
            Value::String("s".into()),
            Value::Bytes(vec![]),
            Value::Vec3([0.0; 3]),
            Value::Quat([0.0; 4]),
            Value::Color([0.0; 4]),
            Value::Reference(EntityId::from_u128(1)),
            Value::List(vec![]),
            Value::Map(BTreeMap::new()),
        ];
        let mut tags: Vec<u32> = values.iter().map(Value::type_tag).collect();
        tags.dedup();
        assert_eq!(tags.len(), values.len());
    }

    #[test]
    fn test_ids_order_by_uuid() {
        assert!(SessionId::from_u128(1) < SessionId::from_u128(2));
        assert!(EntityId::from_u128(1) < EntityId::from_u128(2));
    }
}

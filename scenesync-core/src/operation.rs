//! Operations: immutable records of one atomic scene change.
//!
//! Operations are causally ordered per entity by `base_revision` and
//! totally ordered by the server-assigned sequence number carried in
//! [`Sequenced`].

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

use crate::entity::{ComponentKind, EntityId, SessionId, Value};

/// Origin session plus its logical timestamp.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct OpId {
    pub session: SessionId,
    /// Monotonic per session, starts at 1
    pub clock: u64,
}

impl fmt::Display for OpId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}", self.session, self.clock)
    }
}

/// What an operation does to its target.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum OpKind {
    Create {
        parent: Option<EntityId>,
        /// Position among the parent's children; `None` appends
        index: Option<u32>,
        properties: BTreeMap<String, Value>,
        components: BTreeMap<ComponentKind, Vec<u8>>,
    },
    /// Deletes the target and, implicitly, all of its descendants
    Delete,
    Reparent {
        parent: Option<EntityId>,
        index: Option<u32>,
    },
    /// Move within the current parent's children
    Reorder { index: u32 },
    /// `None` removes the component
    SetComponent {
        kind: ComponentKind,
        data: Option<Vec<u8>>,
    },
    /// `None` removes the property
    SetProperty { key: String, value: Option<Value> },
    /// A kind introduced by a newer peer. Sequenced and relayed, never
    /// applied or logged.
    Opaque { tag: u8, body: Vec<u8> },
}

impl OpKind {
    pub fn name(&self) -> &'static str {
        match self {
            OpKind::Create { .. } => "create",
            OpKind::Delete => "delete",
            OpKind::Reparent { .. } => "reparent",
            OpKind::Reorder { .. } => "reorder",
            OpKind::SetComponent { .. } => "set-component",
            OpKind::SetProperty { .. } => "set-property",
            OpKind::Opaque { .. } => "opaque",
        }
    }

    /// Plain create with no parent and no data.
    pub fn create_root() -> Self {
        OpKind::Create {
            parent: None,
            index: None,
            properties: BTreeMap::new(),
            components: BTreeMap::new(),
        }
    }

    pub fn create_under(parent: EntityId) -> Self {
        OpKind::Create {
            parent: Some(parent),
            index: None,
            properties: BTreeMap::new(),
            components: BTreeMap::new(),
        }
    }

    pub fn set_property(key: impl Into<String>, value: impl Into<Value>) -> Self {
        OpKind::SetProperty {
            key: key.into(),
            value: Some(value.into()),
        }
    }

    pub fn set_component(kind: ComponentKind, data: Vec<u8>) -> Self {
        OpKind::SetComponent {
            kind,
            data: Some(data),
        }
    }

    pub fn reparent(parent: Option<EntityId>) -> Self {
        OpKind::Reparent { parent, index: None }
    }
}

/// One atomic change to one entity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Operation {
    pub id: OpId,
    pub target: EntityId,
    /// Revision of the target this change was made against
    pub base_revision: u64,
    pub kind: OpKind,
}

impl Operation {
    pub fn new(id: OpId, target: EntityId, base_revision: u64, kind: OpKind) -> Self {
        Self {
            id,
            target,
            base_revision,
            kind,
        }
    }

    pub fn origin(&self) -> SessionId {
        self.id.session
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} {} on {} @r{}",
            self.id,
            self.kind.name(),
            self.target,
            self.base_revision
        )
    }
}

/// An operation with its final server sequence number.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Sequenced {
    pub seq: u64,
    pub op: Operation,
}

impl Sequenced {
    pub fn new(seq: u64, op: Operation) -> Self {
        Self { seq, op }
    }

    /// Total order key: server sequence, ties broken by session id.
    pub fn order_key(&self) -> (u64, SessionId) {
        (self.seq, self.op.id.session)
    }
}

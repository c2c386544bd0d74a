//! The entity contract and shared entity handles.
//!
//! The relation engine never sees concrete record types. It works with
//! `dyn Entity` trait objects: attribute access by name, validation, identity
//! and the owner's cache of populated relations.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use crate::error::ValidationError;
use crate::value::Value;

/// Attribute name to value mapping.
pub type AttributeMap = BTreeMap<String, Value>;

/// Foreign-key correspondence: target-side attribute -> owner-side attribute.
pub type LinkMap = BTreeMap<String, String>;

/// A persistable record with dynamic attribute access.
///
/// Implementations own their attribute storage, validation rules and the
/// cache of populated relation values. Everything here is synchronous.
pub trait Entity: Send + Sync + fmt::Debug {
    /// The entity type identifier (table name for SQL-backed stores).
    fn entity_type(&self) -> &str;

    /// Primary key attribute names, in declaration order.
    fn primary_key(&self) -> Vec<String>;

    /// Read an attribute. Unknown attributes read as `Value::Null`.
    fn get(&self, attribute: &str) -> Value;

    /// Write an attribute.
    fn set(&mut self, attribute: &str, value: Value);

    /// Snapshot of all attributes.
    fn attributes(&self) -> AttributeMap;

    /// Bulk-assign attributes. Returns `false` if there was nothing to load.
    fn load(&mut self, data: &AttributeMap) -> bool {
        if data.is_empty() {
            return false;
        }
        for (name, value) in data {
            self.set(name, value.clone());
        }
        true
    }

    /// Whether this entity has not been persisted yet.
    fn is_new(&self) -> bool;

    /// Mark the entity as new (not persisted) or existing.
    fn set_new(&mut self, is_new: bool);

    /// Run validation rules, replacing the current error list.
    fn validate(&mut self) -> bool;

    /// Validation errors recorded on this entity.
    fn errors(&self) -> &ValidationError;

    /// Mutable access to the error list, used to copy namespaced errors in.
    fn errors_mut(&mut self) -> &mut ValidationError;

    fn has_errors(&self) -> bool {
        !self.errors().is_empty()
    }

    /// Primary key values, in the order of [`Entity::primary_key`].
    fn primary_key_value(&self) -> Vec<Value> {
        self.primary_key().iter().map(|pk| self.get(pk)).collect()
    }

    /// Identity comparison: same entity type, both persisted, equal non-null keys.
    fn equals(&self, other: &dyn Entity) -> bool {
        if self.entity_type() != other.entity_type() || self.is_new() || other.is_new() {
            return false;
        }
        let mine = self.primary_key_value();
        let theirs = other.primary_key_value();
        !mine.is_empty()
            && mine.len() == theirs.len()
            && mine
                .iter()
                .zip(&theirs)
                .all(|(a, b)| !a.is_null() && a.loose_eq(b))
    }

    /// Cache a relation value as if it had been loaded.
    fn populate_relation(&mut self, name: &str, value: RelationValue);

    fn is_relation_populated(&self, name: &str) -> bool;

    /// The cached value of a populated relation.
    fn populated_relation(&self, name: &str) -> Option<RelationValue>;

    /// Drop a cached relation value.
    fn unpopulate_relation(&mut self, name: &str);

    /// Drop every cached relation value.
    fn reset_relations(&mut self);
}

/// Shared, lockable handle to an entity.
///
/// A staged relation value, the owner's populated relation cache and the
/// caller all hold clones of the same handle, so writes through one are
/// visible through the others.
#[derive(Clone)]
pub struct EntityRef(Arc<RwLock<dyn Entity>>);

impl EntityRef {
    pub fn new<E: Entity + 'static>(entity: E) -> Self {
        Self(Arc::new(RwLock::new(entity)))
    }

    /// Acquire a read guard. A poisoned lock is recovered.
    pub fn read(&self) -> RwLockReadGuard<'_, dyn Entity + 'static> {
        self.0.read().unwrap_or_else(PoisonError::into_inner)
    }

    /// Acquire a write guard. A poisoned lock is recovered.
    pub fn write(&self) -> RwLockWriteGuard<'_, dyn Entity + 'static> {
        self.0.write().unwrap_or_else(PoisonError::into_inner)
    }

    /// Whether both handles point at the same instance.
    pub fn ptr_eq(&self, other: &EntityRef) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }

    /// Identity comparison of the referenced entities.
    pub fn equals(&self, other: &EntityRef) -> bool {
        if self.ptr_eq(other) {
            return true;
        }
        let other = other.read();
        self.read().equals(&*other)
    }

    /// Convenience attribute read.
    pub fn get(&self, attribute: &str) -> Value {
        self.read().get(attribute)
    }

    /// Convenience attribute write.
    pub fn set(&self, attribute: &str, value: impl Into<Value>) {
        self.write().set(attribute, value.into());
    }
}

impl fmt::Debug for EntityRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.0.try_read() {
            Ok(entity) => f
                .debug_struct("EntityRef")
                .field("type", &entity.entity_type())
                .field("key", &entity.primary_key_value())
                .finish(),
            Err(_) => f.write_str("EntityRef(<locked>)"),
        }
    }
}

/// The value of a relation: one optional entity or an ordered collection.
#[derive(Debug, Clone)]
pub enum RelationValue {
    One(Option<EntityRef>),
    Many(Vec<EntityRef>),
}

impl RelationValue {
    /// Whether the value holds no entity at all.
    pub fn is_empty(&self) -> bool {
        match self {
            RelationValue::One(one) => one.is_none(),
            RelationValue::Many(many) => many.is_empty(),
        }
    }

    pub fn len(&self) -> usize {
        match self {
            RelationValue::One(one) => usize::from(one.is_some()),
            RelationValue::Many(many) => many.len(),
        }
    }

    /// The single entity, if this is a to-one value.
    pub fn as_one(&self) -> Option<&EntityRef> {
        match self {
            RelationValue::One(one) => one.as_ref(),
            RelationValue::Many(_) => None,
        }
    }

    /// The collection, if this is a to-many value.
    pub fn as_many(&self) -> Option<&[EntityRef]> {
        match self {
            RelationValue::Many(many) => Some(many),
            RelationValue::One(_) => None,
        }
    }

    /// All referenced entities, in order.
    pub fn entities(&self) -> Vec<EntityRef> {
        match self {
            RelationValue::One(one) => one.iter().cloned().collect(),
            RelationValue::Many(many) => many.clone(),
        }
    }

    /// Whether both values reference the same instances in the same order.
    pub fn same_instances(&self, other: &RelationValue) -> bool {
        let mine = self.entities();
        let theirs = other.entities();
        mine.len() == theirs.len() && mine.iter().zip(&theirs).all(|(a, b)| a.ptr_eq(b))
    }
}

/// What a caller assigns to a relation before it is resolved into entities.
#[derive(Debug, Clone)]
pub enum RawValue {
    /// No value: clears a to-one relation, empties a to-many relation.
    Empty,
    /// A bare scalar. Not resolvable into an entity.
    Scalar(Value),
    /// Attribute data for one entity.
    Attributes(AttributeMap),
    /// An already-constructed entity.
    Entity(EntityRef),
    /// A collection of raw items.
    List(Vec<RawValue>),
}

impl RawValue {
    /// Build attribute data from `(name, value)` pairs.
    pub fn attributes<I, K, V>(pairs: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<Value>,
    {
        RawValue::Attributes(
            pairs
                .into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        )
    }

    pub fn is_empty(&self) -> bool {
        match self {
            RawValue::Empty => true,
            RawValue::Scalar(v) => v.is_null(),
            RawValue::List(items) => items.is_empty(),
            RawValue::Attributes(_) | RawValue::Entity(_) => false,
        }
    }
}

impl From<serde_json::Value> for RawValue {
    fn from(json: serde_json::Value) -> Self {
        match json {
            serde_json::Value::Null => RawValue::Empty,
            serde_json::Value::Array(items) => {
                RawValue::List(items.into_iter().map(RawValue::from).collect())
            }
            serde_json::Value::Object(map) => RawValue::Attributes(
                map.iter()
                    .map(|(k, v)| (k.clone(), Value::from_json(v)))
                    .collect(),
            ),
            scalar => RawValue::Scalar(Value::from_json(&scalar)),
        }
    }
}

impl From<Value> for RawValue {
    fn from(value: Value) -> Self {
        RawValue::Scalar(value)
    }
}

impl From<EntityRef> for RawValue {
    fn from(entity: EntityRef) -> Self {
        RawValue::Entity(entity)
    }
}

impl From<AttributeMap> for RawValue {
    fn from(attrs: AttributeMap) -> Self {
        RawValue::Attributes(attrs)
    }
}

impl From<Vec<RawValue>> for RawValue {
    fn from(items: Vec<RawValue>) -> Self {
        RawValue::List(items)
    }
}

impl From<Vec<EntityRef>> for RawValue {
    fn from(items: Vec<EntityRef>) -> Self {
        RawValue::List(items.into_iter().map(RawValue::Entity).collect())
    }
}

impl<T: Into<RawValue>> From<Option<T>> for RawValue {
    fn from(value: Option<T>) -> Self {
        value.map_or(RawValue::Empty, Into::into)
    }
}

//! `Owner<E>`: an entity with its relations reachable like attributes.

use std::fmt;
use std::sync::Arc;

use relmodel_core::{
    Connection, Entity, Error, RawValue, RelationErrorKind, RelationQuery, RelationValue, Result,
    TypeError, ValidationError, Value, save_with_hooks,
};

use crate::behavior::RelationBehavior;
use crate::registry::AccessorMode;

/// What a property read produced.
#[derive(Debug, Clone)]
pub enum Property {
    Attribute(Value),
    Relation(RelationValue),
}

impl Property {
    pub fn into_attribute(self) -> Option<Value> {
        match self {
            Property::Attribute(value) => Some(value),
            Property::Relation(_) => None,
        }
    }

    pub fn into_relation(self) -> Option<RelationValue> {
        match self {
            Property::Relation(value) => Some(value),
            Property::Attribute(_) => None,
        }
    }
}

/// An entity bundled with its relation behavior and connection.
///
/// Property names of declared relations (and their aliases) read and write
/// staged relation values; every other name is an ordinary attribute.
/// [`save`](Owner::save) persists the owner together with every staged relation.
pub struct Owner<E: Entity> {
    entity: E,
    behavior: RelationBehavior,
    conn: Arc<dyn Connection>,
}

impl<E: Entity> Owner<E> {
    pub fn new(entity: E, behavior: RelationBehavior, conn: Arc<dyn Connection>) -> Self {
        Self {
            entity,
            behavior,
            conn,
        }
    }

    pub fn entity(&self) -> &E {
        &self.entity
    }

    pub fn entity_mut(&mut self) -> &mut E {
        &mut self.entity
    }

    pub fn into_inner(self) -> E {
        self.entity
    }

    pub fn behavior(&self) -> &RelationBehavior {
        &self.behavior
    }

    pub fn connection(&self) -> &dyn Connection {
        &*self.conn
    }

    /// The relation a property-style name refers to, if any.
    fn property_relation(&self, name: &str) -> Option<String> {
        self.behavior
            .registry()
            .resolve(name)
            .filter(|accessor| accessor.mode == AccessorMode::Property)
            .map(|accessor| accessor.relation.clone())
    }

    /// Property-style read.
    pub fn read(&mut self, name: &str) -> Result<Property> {
        match self.property_relation(name) {
            Some(relation) => self
                .behavior
                .get(&*self.conn, &self.entity, &relation)
                .map(Property::Relation),
            None => Ok(Property::Attribute(self.entity.get(name))),
        }
    }

    /// Property-style write.
    pub fn write(&mut self, name: &str, value: impl Into<RawValue>) -> Result<()> {
        let raw = value.into();
        if let Some(relation) = self.property_relation(name) {
            self.behavior
                .set(&*self.conn, &mut self.entity, &relation, raw)?;
            return Ok(());
        }
        let value = match raw {
            RawValue::Empty => Value::Null,
            RawValue::Scalar(value) => value,
            other => {
                return Err(Error::Type(TypeError {
                    expected: "a scalar value",
                    actual: format!("{other:?}"),
                    attribute: Some(name.to_string()),
                }));
            }
        };
        self.entity.set(name, value);
        Ok(())
    }

    /// Method-style access: `getFoo()` reads, `setFoo(value)` writes.
    pub fn call(&mut self, method: &str, argument: Option<RawValue>) -> Result<RelationValue> {
        let Some(accessor) = self.behavior.registry().resolve(method).cloned() else {
            return Err(Error::relation(
                RelationErrorKind::Unknown,
                method,
                format!("no relation accessor named `{method}`"),
            ));
        };
        match (accessor.mode, argument) {
            (AccessorMode::Getter, None) => {
                self.behavior
                    .get(&*self.conn, &self.entity, &accessor.relation)
            }
            (AccessorMode::Setter, Some(raw)) => {
                self.behavior
                    .set(&*self.conn, &mut self.entity, &accessor.relation, raw)
            }
            (AccessorMode::Setter, None) => Err(Error::relation(
                RelationErrorKind::InvalidValue,
                accessor.relation,
                format!("`{method}` needs a value"),
            )),
            (AccessorMode::Getter, Some(_)) => Err(Error::relation(
                RelationErrorKind::InvalidValue,
                accessor.relation,
                format!("`{method}` takes no value"),
            )),
            (AccessorMode::Property, _) => Err(Error::relation(
                RelationErrorKind::Unknown,
                accessor.relation,
                format!("`{method}` is a property, not a method"),
            )),
        }
    }

    /// Typed handle on one relation.
    pub fn relation(&mut self, name: &str) -> Result<RelationHandle<'_, E>> {
        let relation = self.behavior.registry().spec(name)?.name().to_string();
        Ok(RelationHandle {
            owner: self,
            relation,
        })
    }

    /// Save the owner and cascade every staged relation.
    ///
    /// Returns `Ok(false)` when the owner or a related entity failed
    /// validation; see [`errors`](Owner::errors).
    pub fn save(&mut self, run_validation: bool) -> Result<bool> {
        save_with_hooks(&*self.conn, &mut self.entity, &mut self.behavior, run_validation)
    }

    /// Like [`save`](Owner::save), but a rejected save is an
    /// [`Error::Validation`] carrying the owner's errors.
    pub fn try_save(&mut self, run_validation: bool) -> Result<()> {
        if self.save(run_validation)? {
            Ok(())
        } else {
            Err(Error::Validation(self.entity.errors().clone()))
        }
    }

    /// Reload the owner's attributes from storage.
    pub fn refresh(&mut self) -> Result<bool> {
        self.conn.refresh(&mut self.entity)
    }

    pub fn errors(&self) -> &ValidationError {
        self.entity.errors()
    }

    pub fn is_new(&self) -> bool {
        self.entity.is_new()
    }
}

impl<E: Entity> fmt::Debug for Owner<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Owner")
            .field("entity", &self.entity)
            .field("behavior", &self.behavior)
            .finish_non_exhaustive()
    }
}

/// A borrowed view of one declared relation on an [`Owner`].
#[derive(Debug)]
pub struct RelationHandle<'a, E: Entity> {
    owner: &'a mut Owner<E>,
    relation: String,
}

impl<E: Entity> RelationHandle<'_, E> {
    pub fn name(&self) -> &str {
        &self.relation
    }

    pub fn get(&mut self) -> Result<RelationValue> {
        let owner = &mut *self.owner;
        owner
            .behavior
            .get(&*owner.conn, &owner.entity, &self.relation)
    }

    pub fn set(&mut self, value: impl Into<RawValue>) -> Result<RelationValue> {
        let owner = &mut *self.owner;
        owner
            .behavior
            .set(&*owner.conn, &mut owner.entity, &self.relation, value.into())
    }

    pub fn clear(&mut self) -> Result<()> {
        let owner = &mut *self.owner;
        owner.behavior.clear(&mut owner.entity, &self.relation)
    }

    pub fn query(&self) -> Result<RelationQuery> {
        self.owner.behavior.query(&self.owner.entity, &self.relation)
    }
}

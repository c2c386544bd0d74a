//! The staged value store: pending relation assignments since the last flush.

use relmodel_core::{
    AttributeMap, Connection, Entity, EntityRef, Error, RawValue, RelationErrorKind,
    RelationValue, Result,
};

use crate::builder::build_query;
use crate::spec::RelationSpec;

/// Pending relation values of one owner, in assignment order.
#[derive(Debug, Default)]
pub struct StagedValues {
    entries: Vec<(String, RelationValue)>,
}

fn invalid_value(spec: &RelationSpec, message: impl Into<String>) -> Error {
    Error::relation(RelationErrorKind::InvalidValue, spec.name(), message)
}

impl StagedValues {
    pub fn new() -> Self {
        Self::default()
    }

    /// Resolve `raw` into target entities, stage it and populate it on the owner.
    #[tracing::instrument(level = "debug", skip(self, conn, owner, spec, raw), fields(relation = %spec.name()))]
    pub fn set(
        &mut self,
        conn: &dyn Connection,
        owner: &mut dyn Entity,
        spec: &RelationSpec,
        raw: RawValue,
    ) -> Result<RelationValue> {
        let value = if spec.is_multiple() {
            RelationValue::Many(resolve_many(conn, owner, spec, raw)?)
        } else {
            RelationValue::One(resolve_one(conn, spec, raw)?)
        };
        tracing::debug!(items = value.len(), "staging relation value");

        self.insert(spec.name(), value.clone());
        owner.populate_relation(spec.name(), value.clone());
        Ok(value)
    }

    /// The staged value if the owner still reports it populated, else the live relation.
    pub fn get(
        &mut self,
        conn: &dyn Connection,
        owner: &dyn Entity,
        spec: &RelationSpec,
    ) -> Result<RelationValue> {
        if owner.is_relation_populated(spec.name()) {
            if let Some(value) = self.peek(spec.name()) {
                return Ok(value);
            }
        }
        if self.remove(spec.name()).is_some() {
            tracing::debug!(relation = spec.name(), "discarding stale staged value");
        }

        let found = conn.query(&build_query(owner, spec))?;
        Ok(if spec.is_multiple() {
            RelationValue::Many(found)
        } else {
            RelationValue::One(found.into_iter().next())
        })
    }

    /// Forget the staged value and the owner's populated copy.
    pub fn clear(&mut self, owner: &mut dyn Entity, name: &str) {
        self.remove(name);
        owner.unpopulate_relation(name);
    }

    pub fn peek(&self, name: &str) -> Option<RelationValue> {
        self.entries
            .iter()
            .find(|(staged, _)| staged == name)
            .map(|(_, value)| value.clone())
    }

    pub fn remove(&mut self, name: &str) -> Option<RelationValue> {
        let pos = self.entries.iter().position(|(staged, _)| staged == name)?;
        Some(self.entries.remove(pos).1)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.entries.iter().any(|(staged, _)| staged == name)
    }

    /// Staged relation names, in assignment order.
    pub fn names(&self) -> Vec<String> {
        self.entries.iter().map(|(name, _)| name.clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn insert(&mut self, name: &str, value: RelationValue) {
        match self.entries.iter_mut().find(|(staged, _)| staged == name) {
            Some((_, slot)) => *slot = value,
            None => self.entries.push((name.to_string(), value)),
        }
    }
}

/// Find an existing target for `data` or construct a new one, then load `data` onto it.
fn resolve_attributes(
    conn: &dyn Connection,
    spec: &RelationSpec,
    data: &AttributeMap,
) -> Result<EntityRef> {
    let entity = match spec.find_existing(conn, data)? {
        Some(existing) => existing,
        None => conn.instantiate(spec.target())?,
    };
    entity.write().load(data);
    Ok(entity)
}

fn resolve_one(
    conn: &dyn Connection,
    spec: &RelationSpec,
    raw: RawValue,
) -> Result<Option<EntityRef>> {
    match raw {
        RawValue::Empty => Ok(None),
        RawValue::Scalar(value) if value.is_null() => Ok(None),
        RawValue::Scalar(value) => Err(invalid_value(
            spec,
            format!("cannot resolve {} into a `{}` entity", value.type_name(), spec.target()),
        )),
        RawValue::Attributes(data) => resolve_attributes(conn, spec, &data).map(Some),
        RawValue::Entity(entity) => Ok(Some(entity)),
        RawValue::List(_) => Err(invalid_value(
            spec,
            format!("`{}` is a to-one relation and cannot take a list", spec.name()),
        )),
    }
}

fn resolve_many(
    conn: &dyn Connection,
    owner: &dyn Entity,
    spec: &RelationSpec,
    raw: RawValue,
) -> Result<Vec<EntityRef>> {
    let items = match raw {
        RawValue::Empty => return Ok(Vec::new()),
        RawValue::Scalar(value) if value.is_null() => return Ok(Vec::new()),
        RawValue::List(items) => items,
        other => {
            return Err(invalid_value(
                spec,
                format!(
                    "`{}` is a to-many relation and needs a list, got {}",
                    spec.name(),
                    raw_kind(&other)
                ),
            ));
        }
    };

    // Direct links carry the owner's key on every item before lookup.
    let stamps: Vec<(String, relmodel_core::Value)> = if spec.is_direct() {
        spec.link()
            .iter()
            .map(|(target_attr, owner_attr)| (target_attr.clone(), owner.get(owner_attr)))
            .collect()
    } else {
        Vec::new()
    };

    items
        .into_iter()
        .enumerate()
        .map(|(index, item)| match item {
            RawValue::Attributes(mut data) => {
                for (target_attr, value) in &stamps {
                    data.insert(target_attr.clone(), value.clone());
                }
                resolve_attributes(conn, spec, &data)
            }
            RawValue::Entity(entity) => {
                {
                    let mut target = entity.write();
                    for (target_attr, value) in &stamps {
                        target.set(target_attr, value.clone());
                    }
                }
                Ok(entity)
            }
            other => Err(invalid_value(
                spec,
                format!("item {index} of `{}` is {}, not an entity", spec.name(), raw_kind(&other)),
            )),
        })
        .collect()
}

fn raw_kind(raw: &RawValue) -> &'static str {
    match raw {
        RawValue::Empty => "empty",
        RawValue::Scalar(_) => "a scalar",
        RawValue::Attributes(_) => "an attribute map",
        RawValue::Entity(_) => "an entity",
        RawValue::List(_) => "a list",
    }
}

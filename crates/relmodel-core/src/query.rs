//! Relation queries: the description of "which targets belong to this owner".
//!
//! A [`RelationQuery`] is a plain value. It carries the target type, the key
//! correspondence, a snapshot of the owner's attributes (the local anchor) and
//! the filters to apply. Connections interpret it for `query`, `link`,
//! `unlink` and `unlink_all`.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::condition::Condition;
use crate::entity::{AttributeMap, Entity, LinkMap};
use crate::value::Value;

/// An intermediate association (junction table) a relation is routed through.
///
/// With `via` set, the relation's `link` maps target attributes to junction
/// columns, and `owner_link` maps junction columns to owner attributes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Via {
    /// Junction table name.
    pub table: String,
    /// Junction column -> owner attribute.
    #[serde(rename = "ownerLink", alias = "owner_link")]
    pub owner_link: BTreeMap<String, String>,
}

impl Via {
    pub fn new(table: impl Into<String>) -> Self {
        Self {
            table: table.into(),
            owner_link: BTreeMap::new(),
        }
    }

    /// Map a junction column to an owner attribute.
    pub fn owner_key(mut self, junction_column: impl Into<String>, owner_attr: impl Into<String>) -> Self {
        self.owner_link
            .insert(junction_column.into(), owner_attr.into());
        self
    }
}

/// A to-one or to-many query for one relation of one owner.
#[derive(Debug, Clone, PartialEq)]
pub struct RelationQuery {
    target: String,
    link: LinkMap,
    multiple: bool,
    owner_type: String,
    owner_attributes: AttributeMap,
    on: Vec<Condition>,
    filters: Vec<Condition>,
    via: Option<Via>,
}

impl RelationQuery {
    /// Anchor a new query on `owner`.
    pub fn new(owner: &dyn Entity, target: impl Into<String>, link: LinkMap, multiple: bool) -> Self {
        Self {
            target: target.into(),
            link,
            multiple,
            owner_type: owner.entity_type().to_string(),
            owner_attributes: owner.attributes(),
            on: Vec::new(),
            filters: Vec::new(),
            via: None,
        }
    }

    /// Add a permanent condition. `on` conditions survive [`clear_where`](Self::clear_where).
    pub fn on_condition(&mut self, condition: Condition) -> &mut Self {
        self.on.push(condition);
        self
    }

    /// Add a refinable filter.
    pub fn and_where(&mut self, condition: Condition) -> &mut Self {
        self.filters.push(condition);
        self
    }

    /// Remove every refinable filter. Permanent conditions stay.
    pub fn clear_where(&mut self) -> &mut Self {
        self.filters.clear();
        self
    }

    /// Route the query through an association.
    pub fn via(&mut self, via: Via) -> &mut Self {
        self.via = Some(via);
        self
    }

    pub fn target(&self) -> &str {
        &self.target
    }

    pub fn link(&self) -> &LinkMap {
        &self.link
    }

    pub fn is_multiple(&self) -> bool {
        self.multiple
    }

    pub fn owner_type(&self) -> &str {
        &self.owner_type
    }

    pub fn owner_attributes(&self) -> &AttributeMap {
        &self.owner_attributes
    }

    /// The owner attribute value for `name` in the anchored snapshot.
    pub fn owner_value(&self, name: &str) -> Value {
        self.owner_attributes
            .get(name)
            .cloned()
            .unwrap_or(Value::Null)
    }

    pub fn on_conditions(&self) -> &[Condition] {
        &self.on
    }

    pub fn where_conditions(&self) -> &[Condition] {
        &self.filters
    }

    pub fn via_association(&self) -> Option<&Via> {
        self.via.as_ref()
    }

    pub fn is_via(&self) -> bool {
        self.via.is_some()
    }

    /// Key pairs the query is anchored on.
    ///
    /// Direct relations yield `(target attribute, owner value)`. Relations
    /// routed through an association yield `(junction column, owner value)`.
    pub fn anchor(&self) -> Vec<(String, Value)> {
        match &self.via {
            Some(via) => via
                .owner_link
                .iter()
                .map(|(column, owner_attr)| (column.clone(), self.owner_value(owner_attr)))
                .collect(),
            None => self
                .link
                .iter()
                .map(|(target_attr, owner_attr)| {
                    (target_attr.clone(), self.owner_value(owner_attr))
                })
                .collect(),
        }
    }

    /// Whether any anchor value is NULL (nothing can be related yet).
    pub fn has_null_anchor(&self) -> bool {
        self.anchor().iter().any(|(_, value)| value.is_null())
    }

    /// Evaluate `on` and `where` conditions against a target's attributes.
    pub fn filters_match(&self, target: &AttributeMap) -> bool {
        self.on.iter().chain(&self.filters).all(|c| c.matches(target))
    }

    /// Whether a target row directly satisfies the key correspondence.
    ///
    /// Only meaningful for direct relations; an array-valued owner attribute
    /// matches when it contains the target's value.
    pub fn links_directly(&self, target: &AttributeMap) -> bool {
        !self.link.is_empty()
            && self.link.iter().all(|(target_attr, owner_attr)| {
                let actual = target.get(target_attr).cloned().unwrap_or(Value::Null);
                if actual.is_null() {
                    return false;
                }
                match self.owner_value(owner_attr) {
                    Value::Array(items) => items.iter().any(|v| v.loose_eq(&actual)),
                    expected => expected.loose_eq(&actual),
                }
            })
    }
}

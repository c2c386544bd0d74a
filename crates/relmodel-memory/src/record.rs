//! A schema-driven dynamic record.

use std::collections::BTreeMap;
use std::sync::Arc;

use relmodel_core::{AttributeMap, Entity, RelationValue, ValidationError, Value};

use crate::schema::EntitySchema;

/// An entity whose attributes are a free-form map checked against an [`EntitySchema`].
#[derive(Debug, Clone)]
pub struct Record {
    schema: Arc<EntitySchema>,
    attributes: AttributeMap,
    is_new: bool,
    errors: ValidationError,
    related: BTreeMap<String, RelationValue>,
}

impl Record {
    /// A new, unsaved record with the schema's default values.
    pub fn new(schema: Arc<EntitySchema>) -> Self {
        let attributes = schema.defaults().clone();
        Self {
            schema,
            attributes,
            is_new: true,
            errors: ValidationError::new(),
            related: BTreeMap::new(),
        }
    }

    /// A persisted record built from a stored row.
    pub(crate) fn from_row(schema: Arc<EntitySchema>, row: AttributeMap) -> Self {
        Self {
            schema,
            attributes: row,
            is_new: false,
            errors: ValidationError::new(),
            related: BTreeMap::new(),
        }
    }

    /// Builder-style attribute assignment.
    pub fn with(mut self, attribute: &str, value: impl Into<Value>) -> Self {
        self.attributes.insert(attribute.to_string(), value.into());
        self
    }

    pub fn schema(&self) -> &EntitySchema {
        &self.schema
    }

    /// Attributes as a JSON object.
    pub fn to_json(&self) -> serde_json::Value {
        serde_json::Value::Object(
            self.attributes
                .iter()
                .map(|(k, v)| (k.clone(), v.to_json()))
                .collect(),
        )
    }
}

impl Entity for Record {
    fn entity_type(&self) -> &str {
        self.schema.name()
    }

    fn primary_key(&self) -> Vec<String> {
        self.schema.primary_key_columns().to_vec()
    }

    fn get(&self, attribute: &str) -> Value {
        self.attributes
            .get(attribute)
            .cloned()
            .unwrap_or(Value::Null)
    }

    fn set(&mut self, attribute: &str, value: Value) {
        self.attributes.insert(attribute.to_string(), value);
    }

    fn attributes(&self) -> AttributeMap {
        self.attributes.clone()
    }

    fn is_new(&self) -> bool {
        self.is_new
    }

    fn set_new(&mut self, is_new: bool) {
        self.is_new = is_new;
    }

    fn validate(&mut self) -> bool {
        self.errors.clear();
        self.schema.validate(&self.attributes, &mut self.errors);
        self.errors.is_empty()
    }

    fn errors(&self) -> &ValidationError {
        &self.errors
    }

    fn errors_mut(&mut self) -> &mut ValidationError {
        &mut self.errors
    }

    fn populate_relation(&mut self, name: &str, value: RelationValue) {
        self.related.insert(name.to_string(), value);
    }

    fn is_relation_populated(&self, name: &str) -> bool {
        self.related.contains_key(name)
    }

    fn populated_relation(&self, name: &str) -> Option<RelationValue> {
        self.related.get(name).cloned()
    }

    fn unpopulate_relation(&mut self, name: &str) {
        self.related.remove(name);
    }

    fn reset_relations(&mut self) {
        self.related.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::Rule;

    fn schema() -> Arc<EntitySchema> {
        Arc::new(
            EntitySchema::new("customers")
                .rule("name", Rule::Required)
                .default_value("status", 1i64),
        )
    }

    #[test]
    fn new_record_has_defaults() {
        let record = Record::new(schema());
        assert!(record.is_new());
        assert_eq!(record.get("status"), Value::BigInt(1));
        assert_eq!(record.get("missing"), Value::Null);
        assert_eq!(record.entity_type(), "customers");
    }

    #[test]
    fn validate_replaces_errors() {
        let mut record = Record::new(schema());
        assert!(!record.validate());
        assert!(record.errors().has_field("name"));

        record.set("name", Value::from("Ada"));
        assert!(record.validate());
        assert!(!record.has_errors());
    }

    #[test]
    fn populated_relations() {
        let mut record = Record::new(schema());
        record.populate_relation("orders", RelationValue::Many(Vec::new()));
        assert!(record.is_relation_populated("orders"));
        record.unpopulate_relation("orders");
        assert!(!record.is_relation_populated("orders"));
        record.populate_relation("a", RelationValue::One(None));
        record.reset_relations();
        assert!(record.populated_relation("a").is_none());
    }

    #[test]
    fn json_view() {
        let record = Record::new(schema()).with("name", "Ada");
        assert_eq!(
            record.to_json(),
            serde_json::json!({"name": "Ada", "status": 1})
        );
    }
}

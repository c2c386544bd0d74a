//! relmodel - declarative relations persisted transactionally with their owner.
//!
//! An owner record declares to-one and to-many relations. Assigning a
//! relation stages the related records; saving the owner validates, saves,
//! links and unlinks them in one transaction, and rolls everything back if
//! any of it fails.
//!
//! # Quick Start
//!
//! ```ignore
//! use std::sync::Arc;
//! use relmodel::prelude::*;
//! use serde_json::json;
//!
//! let conn = MemoryConnection::new()
//!     .with_schema(EntitySchema::new("orders"))
//!     .with_schema(EntitySchema::new("customers").rule("name", Rule::Required))
//!     .with_schema(EntitySchema::new("items").rule("sku", Rule::Required));
//!
//! let behavior = RelationBehavior::from_configs([
//!     ("customer", RelationConfig::has_one("customers", [("id", "customer_id")])),
//!     ("items", RelationConfig::has_many("items", [("order_id", "id")])),
//! ])?;
//!
//! let mut order = Owner::new(conn.create("orders")?, behavior, Arc::new(conn.clone()));
//! order.write("customer", json!({"name": "Ada"}))?;
//! order.write("items", json!([{"sku": "A"}, {"sku": "B"}]))?;
//!
//! if !order.save(true)? {
//!     for err in &order.errors().errors {
//!         eprintln!("{}: {}", err.field, err.message);
//!     }
//! }
//! ```
//!
//! # Crates
//!
//! - `relmodel-core`: values, errors, the entity and connection contracts
//! - `relmodel-relation`: the relation registry and save cascades
//! - `relmodel-memory`: an in-memory connection for tests and prototyping

pub use relmodel_core::{
    AttributeMap, Condition, Connection, Entity, EntityRef, Error, FieldValidationError, LinkMap,
    NoHooks, PersistEvent, PersistHooks, RawValue, RelationErrorKind, RelationQuery,
    RelationValue, Result, StorageErrorKind, TransactionErrorKind, TransactionOps,
    ValidationError, ValidationErrorKind, Value, Via, save_with_hooks,
};
pub use relmodel_memory::{
    EntitySchema, FailPoint, MemoryConnection, MemoryTransaction, Operation, Record, Rule,
};
pub use relmodel_relation::{
    AccessorMode, Filter, Lookup, OnRemove, Owner, Property, RelationBehavior, RelationConfig,
    RelationHandle, RelationRegistry, RelationSpec, build_query,
};

/// Commonly used types.
pub mod prelude {
    pub use crate::{
        Condition, Connection, Entity, EntityRef, EntitySchema, Error, MemoryConnection, OnRemove,
        Owner, RawValue, Record, RelationBehavior, RelationConfig, RelationValue, Result, Rule,
        Value, Via,
    };
}

//! Core types and contracts for relmodel.
//!
//! This crate provides the abstractions the relation engine consumes:
//!
//! - `Value` for dynamically typed attribute values
//! - `Entity` / `EntityRef` for records with attribute access, validation and identity
//! - `RelationQuery` and `Condition` for describing related sets
//! - `Connection` / `TransactionOps` for storage and transactions
//! - `PersistHooks` and `save_with_hooks` for the save lifecycle
//! - `Error` / `ValidationError` for fatal and recoverable failures

pub mod condition;
pub mod connection;
pub mod entity;
pub mod error;
pub mod hooks;
pub mod query;
pub mod value;

pub use condition::Condition;
pub use connection::{Connection, TransactionOps};
pub use entity::{AttributeMap, Entity, EntityRef, LinkMap, RawValue, RelationValue};
pub use error::{
    ConfigError, Error, FieldValidationError, RelationError, RelationErrorKind, Result,
    StorageError, StorageErrorKind, TransactionError, TransactionErrorKind, TypeError,
    ValidationError, ValidationErrorKind,
};
pub use hooks::{NoHooks, PersistEvent, PersistHooks, save_with_hooks};
pub use query::{RelationQuery, Via};
pub use value::Value;

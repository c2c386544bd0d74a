//! In-memory storage driver for relmodel.
//!
//! `MemoryConnection` implements every collaborator contract the relation
//! engine needs: schema-driven [`Record`] entities with validation rules,
//! generated keys and uniqueness constraints, association tables, nested
//! snapshot transactions, an operation [`journal`](MemoryConnection::journal)
//! and failure injection through [`FailPoint`]s.

pub mod connection;
pub mod record;
pub mod schema;
pub mod store;

pub use connection::{MemoryConnection, MemoryTransaction};
pub use record::Record;
pub use schema::{EntitySchema, Rule, matches_pattern};
pub use store::{FailPoint, Operation};

//! Storage connection and transaction contracts.
//!
//! These are the narrow capabilities the relation engine consumes: finding
//! and instantiating entities, saving and refreshing them, running relation
//! queries and maintaining links. Every method is synchronous and takes
//! `&self`; implementations use interior mutability.

use crate::entity::{AttributeMap, Entity, EntityRef};
use crate::error::Result;
use crate::query::RelationQuery;

/// Operations on an open transaction.
///
/// Both operations consume the handle, so a transaction is finished at most once.
pub trait TransactionOps: Send {
    /// Commit the transaction.
    fn commit(self: Box<Self>) -> Result<()>;

    /// Roll back the transaction.
    fn rollback(self: Box<Self>) -> Result<()>;
}

/// A storage connection.
pub trait Connection: Send + Sync {
    /// Begin a transaction.
    fn begin(&self) -> Result<Box<dyn TransactionOps>>;

    /// Primary key attribute names of an entity type.
    fn primary_key(&self, entity_type: &str) -> Result<Vec<String>>;

    /// Construct a new, unsaved entity of the given type.
    fn instantiate(&self, entity_type: &str) -> Result<EntityRef>;

    /// Find an existing entity by key values (a subset of its attributes).
    fn find(&self, entity_type: &str, key: &AttributeMap) -> Result<Option<EntityRef>>;

    /// Insert or update an entity.
    ///
    /// Returns `Ok(false)` when validation was requested and failed; the
    /// entity's error list then says why. Storage failures are `Err`.
    fn save(&self, entity: &mut dyn Entity, run_validation: bool) -> Result<bool>;

    /// Reload an entity's attributes from storage.
    ///
    /// Returns `Ok(false)` if the entity no longer exists.
    fn refresh(&self, entity: &mut dyn Entity) -> Result<bool>;

    /// Run a relation query.
    fn query(&self, query: &RelationQuery) -> Result<Vec<EntityRef>>;

    /// Establish the relation between `owner` and `target`.
    ///
    /// Depending on which side holds the key, this writes the target's
    /// foreign key, the owner's foreign key, or an association row carrying
    /// `extra_columns`.
    fn link(
        &self,
        query: &RelationQuery,
        owner: &mut dyn Entity,
        target: &mut dyn Entity,
        extra_columns: &AttributeMap,
    ) -> Result<()>;

    /// Remove the relation between `owner` and `target`.
    ///
    /// With `delete`, the target row (or the association row) is deleted;
    /// otherwise the foreign key is cleared.
    fn unlink(
        &self,
        query: &RelationQuery,
        owner: &mut dyn Entity,
        target: &mut dyn Entity,
        delete: bool,
    ) -> Result<()>;

    /// Remove every relation of `owner` matched by `query`.
    fn unlink_all(&self, query: &RelationQuery, owner: &mut dyn Entity, delete: bool)
    -> Result<()>;
}

//! Cascade dispatch across one owner save.
//!
//! The pre-persist phase opens the transaction, runs every to-one cascade and
//! queues the to-many values. The post-persist phase runs the queued
//! collection cascades and commits. Everything that spans the two phases
//! lives in a [`SaveCycle`], never on the long-lived behavior.

use relmodel_core::{AttributeMap, Connection, Entity, Error, PersistEvent, RelationValue, Result};

use crate::collection::{DeferredLink, restore_owner, save_collection};
use crate::registry::RelationRegistry;
use crate::single::save_single;
use crate::staged::StagedValues;
use crate::transaction::TransactionCoordinator;

/// State of one in-flight owner save.
#[derive(Debug)]
pub struct SaveCycle {
    event: PersistEvent,
    transaction: TransactionCoordinator,
    deferred: Vec<DeferredLink>,
    /// The owner's attributes before anything in this cycle touched them.
    snapshot: AttributeMap,
    was_new: bool,
}

impl SaveCycle {
    /// Pre-persist phase. Returns the cycle and whether the owner's save may proceed.
    ///
    /// Errors left on the owner by an earlier save are cleared first, so only
    /// failures of this cycle gate it. Consumed relations are removed from
    /// `staged` and unpopulated on the owner.
    #[tracing::instrument(level = "debug", skip_all, fields(event = event.as_str(), staged = staged.len()))]
    pub fn dispatch(
        conn: &dyn Connection,
        owner: &mut dyn Entity,
        registry: &RelationRegistry,
        staged: &mut StagedValues,
        event: PersistEvent,
    ) -> Result<(Self, bool)> {
        if owner.has_errors() {
            tracing::debug!(errors = owner.errors().len(), "clearing errors from a previous save");
            owner.errors_mut().clear();
        }
        let was_new = owner.is_new();
        let mut cycle = SaveCycle {
            event,
            transaction: TransactionCoordinator::new(),
            deferred: Vec::new(),
            snapshot: owner.attributes(),
            was_new,
        };
        cycle.transaction.begin(conn)?;
        let mut valid = true;

        for name in staged.names() {
            if !owner.is_relation_populated(&name) {
                tracing::debug!(relation = %name, "relation no longer populated, dropping staged value");
                staged.remove(&name);
                continue;
            }
            let spec = match registry.spec(&name) {
                Ok(spec) => spec,
                Err(e) => return Err(cycle.fail(owner, e)),
            };
            let value = staged.peek(&name).unwrap_or(RelationValue::One(None));

            if spec.is_multiple() {
                let snapshot = was_new.then(|| cycle.snapshot.clone());
                cycle.deferred.push(DeferredLink {
                    relation: name.clone(),
                    items: value.entities(),
                    snapshot,
                });
            } else {
                match save_single(conn, owner, spec, value.as_one(), &mut cycle.transaction) {
                    Ok(true) => {}
                    Ok(false) => valid = false,
                    Err(e) => return Err(cycle.fail(owner, e)),
                }
            }

            owner.unpopulate_relation(&name);
            staged.remove(&name);
        }

        Ok((cycle, valid))
    }

    /// Post-persist phase: run the queued collection cascades, then commit.
    ///
    /// Returns `Ok(false)` when a collection failed validation. On any error
    /// the owner is put back into its pre-save state, since its own write was
    /// rolled back with the transaction.
    #[tracing::instrument(level = "debug", skip_all, fields(event = self.event.as_str(), deferred = self.deferred.len()))]
    pub fn complete(
        mut self,
        conn: &dyn Connection,
        owner: &mut dyn Entity,
        registry: &RelationRegistry,
    ) -> Result<bool> {
        let mut valid = true;
        for deferred in std::mem::take(&mut self.deferred) {
            let spec = match registry.spec(&deferred.relation) {
                Ok(spec) => spec,
                Err(e) => return Err(self.fail(owner, e)),
            };
            match save_collection(conn, owner, spec, deferred, &mut self.transaction) {
                Ok(true) => {}
                Ok(false) => valid = false,
                Err(e) => return Err(self.fail(owner, e)),
            }
        }
        if let Err(e) = self.transaction.commit() {
            restore_owner(owner, &self.snapshot, self.was_new);
            return Err(e);
        }
        Ok(valid)
    }

    /// Roll back whatever the cycle has written and restore the owner's
    /// pre-save attributes.
    pub fn abort(mut self, owner: &mut dyn Entity) -> Result<()> {
        tracing::debug!(event = self.event.as_str(), "aborting save cycle");
        let rolled_back = self.transaction.rollback();
        restore_owner(owner, &self.snapshot, self.was_new);
        rolled_back
    }

    /// Roll back after a fatal error, keeping `err` as the reported cause.
    fn fail(&mut self, owner: &mut dyn Entity, err: Error) -> Error {
        let err = self.transaction.abort(err);
        restore_owner(owner, &self.snapshot, self.was_new);
        err
    }

    pub fn event(&self) -> PersistEvent {
        self.event
    }

    /// Relations queued for the post-persist phase.
    pub fn deferred(&self) -> impl Iterator<Item = &str> {
        self.deferred.iter().map(|d| d.relation.as_str())
    }

    pub fn is_active(&self) -> bool {
        self.transaction.is_active()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::spec::RelationConfig;
    use relmodel_core::{RawValue, TransactionErrorKind, Value};
    use relmodel_memory::{EntitySchema, FailPoint, MemoryConnection, Rule};

    fn conn() -> MemoryConnection {
        MemoryConnection::new()
            .with_schema(EntitySchema::new("orders"))
            .with_schema(EntitySchema::new("customers").rule("name", Rule::Required))
            .with_schema(EntitySchema::new("items").rule("sku", Rule::Required))
    }

    fn registry() -> RelationRegistry {
        RelationRegistry::new([
            (
                "customer",
                RelationConfig::has_one("customers", [("id", "customer_id")]),
            ),
            ("items", RelationConfig::has_many("items", [("order_id", "id")])),
        ])
        .unwrap()
    }

    #[test]
    fn routes_single_now_and_collections_later() {
        let conn = conn();
        let registry = registry();
        let mut order = conn.create("orders").unwrap();
        let mut staged = StagedValues::new();
        staged
            .set(
                &conn,
                &mut order,
                registry.spec("customer").unwrap(),
                RawValue::attributes([("name", "Ada")]),
            )
            .unwrap();
        staged
            .set(
                &conn,
                &mut order,
                registry.spec("items").unwrap(),
                RawValue::from(serde_json::json!([{"sku": "A"}])),
            )
            .unwrap();

        let (cycle, valid) = SaveCycle::dispatch(
            &conn,
            &mut order,
            &registry,
            &mut staged,
            PersistEvent::Insert,
        )
        .unwrap();
        assert!(valid);
        assert!(staged.is_empty());
        assert!(!order.is_relation_populated("customer"));
        assert_eq!(cycle.deferred().collect::<Vec<_>>(), ["items"]);
        assert_eq!(order.get("customer_id"), Value::BigInt(1));
        assert_eq!(conn.count("items"), 0);

        conn.save(&mut order, false).unwrap();
        assert!(cycle.complete(&conn, &mut order, &registry).unwrap());
        assert_eq!(conn.count("items"), 1);
        assert_eq!(conn.rows("items")[0].get("order_id"), Some(&Value::BigInt(1)));
        assert_eq!(conn.open_transactions(), 0);
    }

    #[test]
    fn invalid_single_marks_save_invalid() {
        let conn = conn();
        let registry = registry();
        let mut order = conn.create("orders").unwrap();
        let mut staged = StagedValues::new();
        staged
            .set(
                &conn,
                &mut order,
                registry.spec("customer").unwrap(),
                RawValue::attributes([("email", "x@example.com")]),
            )
            .unwrap();

        let (cycle, valid) = SaveCycle::dispatch(
            &conn,
            &mut order,
            &registry,
            &mut staged,
            PersistEvent::Insert,
        )
        .unwrap();
        assert!(!valid);
        assert!(!cycle.is_active());
        assert!(order.errors().has_field("customer.name"));
        cycle.abort(&mut order).unwrap();
        assert_eq!(conn.open_transactions(), 0);
    }

    #[test]
    fn drops_values_the_owner_no_longer_reports() {
        let conn = conn();
        let registry = registry();
        let mut order = conn.create("orders").unwrap();
        let mut staged = StagedValues::new();
        staged
            .set(
                &conn,
                &mut order,
                registry.spec("customer").unwrap(),
                RawValue::attributes([("name", "Ada")]),
            )
            .unwrap();
        order.unpopulate_relation("customer");

        let (cycle, valid) = SaveCycle::dispatch(
            &conn,
            &mut order,
            &registry,
            &mut staged,
            PersistEvent::Insert,
        )
        .unwrap();
        assert!(valid);
        assert!(staged.is_empty());
        assert_eq!(conn.count("customers"), 0);
        cycle.abort(&mut order).unwrap();
    }

    #[test]
    fn begin_failure_aborts_dispatch() {
        let conn = conn();
        let registry = registry();
        let mut order = conn.create("orders").unwrap();
        let mut staged = StagedValues::new();
        staged
            .set(
                &conn,
                &mut order,
                registry.spec("customer").unwrap(),
                RawValue::attributes([("name", "Ada")]),
            )
            .unwrap();
        conn.fail_on(FailPoint::Begin);

        let err = SaveCycle::dispatch(
            &conn,
            &mut order,
            &registry,
            &mut staged,
            PersistEvent::Insert,
        )
        .unwrap_err();
        assert!(matches!(
            err,
            relmodel_core::Error::Transaction(ref t) if t.kind == TransactionErrorKind::Begin
        ));
        assert!(staged.contains("customer"));
        assert_eq!(conn.count("customers"), 0);
        assert_eq!(conn.open_transactions(), 0);
    }

    #[test]
    fn stale_owner_errors_are_cleared_when_a_cycle_starts() {
        let conn = conn();
        let registry = registry();
        let mut order = conn.create("orders").unwrap();
        order.errors_mut().add_required("customer.name");
        let mut staged = StagedValues::new();
        staged
            .set(
                &conn,
                &mut order,
                registry.spec("customer").unwrap(),
                RawValue::attributes([("name", "Ada")]),
            )
            .unwrap();

        let (cycle, valid) = SaveCycle::dispatch(
            &conn,
            &mut order,
            &registry,
            &mut staged,
            PersistEvent::Insert,
        )
        .unwrap();
        assert!(valid);
        assert!(order.errors().is_empty());
        assert_eq!(order.get("customer_id"), Value::BigInt(1));
        conn.save(&mut order, false).unwrap();
        assert!(cycle.complete(&conn, &mut order, &registry).unwrap());
        assert_eq!(conn.count("customers"), 1);
    }

    #[test]
    fn fatal_completion_restores_new_owner() {
        let conn = conn();
        let registry = registry();
        let mut order = conn.create("orders").unwrap();
        let mut staged = StagedValues::new();
        staged
            .set(
                &conn,
                &mut order,
                registry.spec("customer").unwrap(),
                RawValue::attributes([("name", "Ada")]),
            )
            .unwrap();
        staged
            .set(
                &conn,
                &mut order,
                registry.spec("items").unwrap(),
                RawValue::from(serde_json::json!([{"sku": "A"}])),
            )
            .unwrap();

        let (cycle, valid) = SaveCycle::dispatch(
            &conn,
            &mut order,
            &registry,
            &mut staged,
            PersistEvent::Insert,
        )
        .unwrap();
        assert!(valid);
        conn.save(&mut order, false).unwrap();
        assert_eq!(order.get("id"), Value::BigInt(1));
        conn.fail_on(FailPoint::Link);

        let err = cycle.complete(&conn, &mut order, &registry).unwrap_err();
        assert!(err.is_fatal());
        assert!(order.is_new());
        assert_eq!(order.get("id"), Value::Null);
        assert_eq!(order.get("customer_id"), Value::Null);
        assert_eq!(conn.count("orders"), 0);
        assert_eq!(conn.count("customers"), 0);
        assert_eq!(conn.open_transactions(), 0);
    }

    #[test]
    fn dropped_cycle_rolls_back() {
        let conn = conn();
        let registry = registry();
        let mut order = conn.create("orders").unwrap();
        let mut staged = StagedValues::new();
        staged
            .set(
                &conn,
                &mut order,
                registry.spec("customer").unwrap(),
                RawValue::attributes([("name", "Ada")]),
            )
            .unwrap();
        let (cycle, _) = SaveCycle::dispatch(
            &conn,
            &mut order,
            &registry,
            &mut staged,
            PersistEvent::Insert,
        )
        .unwrap();
        assert_eq!(conn.count("customers"), 1);
        drop(cycle);
        assert_eq!(conn.count("customers"), 0);
        assert_eq!(conn.open_transactions(), 0);
    }
}

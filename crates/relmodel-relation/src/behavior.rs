//! The relation behavior attached to one owner instance.

use std::sync::Arc;

use relmodel_core::{
    Connection, Entity, PersistEvent, PersistHooks, RawValue, RelationQuery, RelationValue, Result,
};

use crate::builder::build_query;
use crate::dispatch::SaveCycle;
use crate::registry::RelationRegistry;
use crate::spec::{RelationConfig, RelationSpec};
use crate::staged::StagedValues;

/// Relation state of one owner: the shared registry, the staged values and
/// the save cycle between the pre- and post-persist hooks.
///
/// Plug it into [`save_with_hooks`](relmodel_core::save_with_hooks) to have
/// staged relations persisted together with the owner.
#[derive(Debug)]
pub struct RelationBehavior {
    registry: Arc<RelationRegistry>,
    staged: StagedValues,
    cycle: Option<SaveCycle>,
}

/// Resolve a relation name or accessor alias.
fn resolve<'r>(registry: &'r RelationRegistry, name: &str) -> Result<&'r RelationSpec> {
    match registry.resolve(name) {
        Some(accessor) => registry.spec(&accessor.relation),
        None => registry.spec(name),
    }
}

impl RelationBehavior {
    pub fn new(registry: Arc<RelationRegistry>) -> Self {
        Self {
            registry,
            staged: StagedValues::new(),
            cycle: None,
        }
    }

    /// Declare and normalize `configs` for a single owner.
    pub fn from_configs<I, S>(configs: I) -> Result<Self>
    where
        I: IntoIterator<Item = (S, RelationConfig)>,
        S: Into<String>,
    {
        Ok(Self::new(Arc::new(RelationRegistry::new(configs)?)))
    }

    pub fn registry(&self) -> &RelationRegistry {
        &self.registry
    }

    fn spec(&self, name: &str) -> Result<&RelationSpec> {
        resolve(&self.registry, name)
    }

    /// Current value of a relation: staged if assigned, otherwise live.
    pub fn get(&mut self, conn: &dyn Connection, owner: &dyn Entity, name: &str) -> Result<RelationValue> {
        let spec = resolve(&self.registry, name)?;
        self.staged.get(conn, owner, spec)
    }

    /// Stage a new value for a relation.
    pub fn set(
        &mut self,
        conn: &dyn Connection,
        owner: &mut dyn Entity,
        name: &str,
        raw: RawValue,
    ) -> Result<RelationValue> {
        let spec = resolve(&self.registry, name)?;
        self.staged.set(conn, owner, spec, raw)
    }

    /// Drop any staged value for a relation.
    pub fn clear(&mut self, owner: &mut dyn Entity, name: &str) -> Result<()> {
        let relation = self.spec(name)?.name().to_string();
        self.staged.clear(owner, &relation);
        Ok(())
    }

    /// The query for a relation, anchored on `owner`.
    pub fn query(&self, owner: &dyn Entity, name: &str) -> Result<RelationQuery> {
        Ok(build_query(owner, self.spec(name)?))
    }

    pub fn is_staged(&self, name: &str) -> bool {
        self.spec(name)
            .is_ok_and(|spec| self.staged.contains(spec.name()))
    }

    pub fn staged_names(&self) -> Vec<String> {
        self.staged.names()
    }

    /// Whether a save cycle is waiting for its post-persist phase.
    pub fn has_open_cycle(&self) -> bool {
        self.cycle.is_some()
    }

    fn abort_cycle(&mut self, owner: &mut dyn Entity) -> Result<()> {
        match self.cycle.take() {
            Some(cycle) => cycle.abort(owner),
            None => Ok(()),
        }
    }
}

impl PersistHooks for RelationBehavior {
    fn before_persist(
        &mut self,
        conn: &dyn Connection,
        entity: &mut dyn Entity,
        event: PersistEvent,
    ) -> Result<bool> {
        if self.cycle.is_some() {
            tracing::warn!("previous save cycle never completed; rolling it back");
            self.abort_cycle(entity)?;
        }
        let (cycle, valid) =
            SaveCycle::dispatch(conn, entity, &self.registry, &mut self.staged, event)?;
        if valid {
            self.cycle = Some(cycle);
        } else {
            cycle.abort(entity)?;
        }
        Ok(valid)
    }

    fn after_persist(
        &mut self,
        conn: &dyn Connection,
        entity: &mut dyn Entity,
        _event: PersistEvent,
    ) -> Result<bool> {
        match self.cycle.take() {
            Some(cycle) => cycle.complete(conn, entity, &self.registry),
            None => Ok(true),
        }
    }

    fn persist_aborted(
        &mut self,
        _conn: &dyn Connection,
        entity: &mut dyn Entity,
        _event: PersistEvent,
    ) -> Result<()> {
        self.abort_cycle(entity)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use relmodel_core::{NoHooks, Value, save_with_hooks};
    use relmodel_memory::{EntitySchema, FailPoint, MemoryConnection, Rule};

    fn conn() -> MemoryConnection {
        MemoryConnection::new()
            .with_schema(EntitySchema::new("orders").rule("number", Rule::Required))
            .with_schema(EntitySchema::new("customers").rule("name", Rule::Required))
            .with_schema(EntitySchema::new("items").rule("sku", Rule::Required))
    }

    fn behavior() -> RelationBehavior {
        RelationBehavior::from_configs([
            (
                "customer",
                RelationConfig::has_one("customers", [("id", "customer_id")]),
            ),
            (
                "orderItems",
                RelationConfig::has_many("items", [("order_id", "id")]),
            ),
        ])
        .unwrap()
    }

    #[test]
    fn aliases_reach_the_same_relation() {
        let conn = conn();
        let mut behavior = behavior();
        let mut order = conn.create("orders").unwrap();
        behavior
            .set(&conn, &mut order, "setOrderItems", RawValue::List(Vec::new()))
            .unwrap();
        assert!(behavior.is_staged("orderItems"));
        assert!(behavior.is_staged("OrderItems"));
        assert_eq!(behavior.staged_names(), ["orderItems"]);
        behavior.clear(&mut order, "OrderItems").unwrap();
        assert!(!behavior.is_staged("orderItems"));
        assert!(behavior.get(&conn, &order, "nope").is_err());
    }

    #[test]
    fn saves_staged_relations_with_owner() {
        let conn = conn();
        let mut behavior = behavior();
        let mut order = conn.create("orders").unwrap().with("number", "A-1");
        behavior
            .set(&conn, &mut order, "customer", RawValue::attributes([("name", "Ada")]))
            .unwrap();
        behavior
            .set(
                &conn,
                &mut order,
                "orderItems",
                RawValue::from(serde_json::json!([{"sku": "X"}, {"sku": "Y"}])),
            )
            .unwrap();

        assert!(save_with_hooks(&conn, &mut order, &mut behavior, true).unwrap());
        assert!(!behavior.has_open_cycle());
        assert_eq!(order.get("customer_id"), Value::BigInt(1));
        assert_eq!(conn.count("items"), 2);
        assert_eq!(conn.open_transactions(), 0);
        assert_eq!(conn.max_open_transactions(), 1);

        let live = behavior.get(&conn, &order, "orderItems").unwrap();
        assert_eq!(live.len(), 2);
    }

    #[test]
    fn owner_validation_failure_opens_no_transaction() {
        let conn = conn();
        let mut behavior = behavior();
        let mut order = conn.create("orders").unwrap();
        behavior
            .set(&conn, &mut order, "customer", RawValue::attributes([("name", "Ada")]))
            .unwrap();
        assert!(!save_with_hooks(&conn, &mut order, &mut behavior, true).unwrap());
        assert_eq!(conn.max_open_transactions(), 0);
        assert!(behavior.is_staged("customer"));
    }

    #[test]
    fn owner_write_failure_rolls_back_cycle() {
        let conn = conn();
        conn.fail_on(FailPoint::Save("orders".into()));
        let mut behavior = behavior();
        let mut order = conn.create("orders").unwrap().with("number", "A-1");
        behavior
            .set(&conn, &mut order, "customer", RawValue::attributes([("name", "Ada")]))
            .unwrap();
        assert!(save_with_hooks(&conn, &mut order, &mut behavior, true).is_err());
        assert!(!behavior.has_open_cycle());
        assert_eq!(conn.count("customers"), 0);
        assert_eq!(conn.open_transactions(), 0);
        // The key copied from the rolled-back customer is gone again.
        assert_eq!(order.get("customer_id"), Value::Null);
        assert!(order.is_new());
    }

    #[test]
    fn reentrant_cycle_rolls_back_the_stale_one() {
        let conn = conn();
        let mut behavior = behavior();
        let mut order = conn.create("orders").unwrap().with("number", "A-1");
        behavior
            .set(&conn, &mut order, "customer", RawValue::attributes([("name", "Ada")]))
            .unwrap();

        assert!(behavior.before_persist(&conn, &mut order, PersistEvent::Insert).unwrap());
        assert!(behavior.has_open_cycle());
        assert_eq!(conn.count("customers"), 1);

        assert!(behavior.before_persist(&conn, &mut order, PersistEvent::Insert).unwrap());
        assert_eq!(conn.max_open_transactions(), 1);
        assert_eq!(conn.count("customers"), 0);
        assert!(behavior.after_persist(&conn, &mut order, PersistEvent::Insert).unwrap());
        assert_eq!(conn.open_transactions(), 0);
    }

    #[test]
    fn plain_hooks_leave_relations_alone() {
        let conn = conn();
        let mut behavior = behavior();
        let mut order = conn.create("orders").unwrap().with("number", "A-1");
        behavior
            .set(&conn, &mut order, "customer", RawValue::attributes([("name", "Ada")]))
            .unwrap();
        assert!(save_with_hooks(&conn, &mut order, &mut NoHooks, true).unwrap());
        assert_eq!(conn.count("customers"), 0);
        assert!(behavior.is_staged("customer"));
    }
}

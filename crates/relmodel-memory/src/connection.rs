//! In-memory connection implementing `relmodel_core::Connection`.
//!
//! All state lives in one `Arc<Mutex<MemoryInner>>`. Transactions snapshot
//! the tables on begin and restore the snapshot on rollback; they nest as a
//! stack and must be finished innermost first.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard};

use relmodel_core::{
    AttributeMap, Connection, Entity, EntityRef, Error, LinkMap, RelationErrorKind,
    RelationQuery, Result, StorageErrorKind, TransactionErrorKind, TransactionOps, Value,
};

use crate::record::Record;
use crate::schema::EntitySchema;
use crate::store::{FailPoint, Operation, Tables, key_of, row_matches};

/// Inner state guarded by a mutex.
#[derive(Debug, Default)]
struct MemoryInner {
    schemas: BTreeMap<String, Arc<EntitySchema>>,
    tables: Tables,
    /// One snapshot per open transaction, outermost first.
    snapshots: Vec<Tables>,
    max_open: usize,
    journal: Vec<Operation>,
    fail_points: BTreeSet<FailPoint>,
}

/// An in-memory store with entity schemas, association tables, snapshot
/// transactions, an operation journal and failure injection.
///
/// Clones share the same state.
#[derive(Clone, Default)]
pub struct MemoryConnection {
    inner: Arc<Mutex<MemoryInner>>,
}

impl MemoryConnection {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder-style schema registration.
    pub fn with_schema(self, schema: EntitySchema) -> Self {
        self.register(schema);
        self
    }

    /// Register (or replace) the schema of an entity type.
    pub fn register(&self, schema: EntitySchema) {
        let mut inner = self.state();
        inner
            .schemas
            .insert(schema.name().to_string(), Arc::new(schema));
    }

    pub fn schema(&self, entity_type: &str) -> Result<Arc<EntitySchema>> {
        self.state().schema(entity_type)
    }

    /// A new, unsaved record of a registered type.
    pub fn create(&self, entity_type: &str) -> Result<Record> {
        Ok(Record::new(self.schema(entity_type)?))
    }

    /// Insert a raw row, bypassing validation. Returns the primary key.
    pub fn insert(&self, table: &str, row: AttributeMap) -> Result<Vec<Value>> {
        self.state().insert_into(table, row)
    }

    /// Snapshot of a table's rows.
    pub fn rows(&self, table: &str) -> Vec<AttributeMap> {
        self.state().tables.rows(table).to_vec()
    }

    pub fn count(&self, table: &str) -> usize {
        self.state().tables.rows(table).len()
    }

    /// Load a persisted record by primary key.
    pub fn load(&self, entity_type: &str, key: &[Value]) -> Result<Option<Record>> {
        let inner = self.state();
        let schema = inner.schema(entity_type)?;
        Ok(inner
            .tables
            .position(entity_type, schema.primary_key_columns(), key)
            .map(|pos| {
                let row = inner.tables.rows(entity_type)[pos].clone();
                Record::from_row(schema, row)
            }))
    }

    /// Every operation recorded so far.
    pub fn journal(&self) -> Vec<Operation> {
        self.state().journal.clone()
    }

    pub fn clear_journal(&self) {
        self.state().journal.clear();
    }

    /// Number of transactions currently open.
    pub fn open_transactions(&self) -> usize {
        self.state().snapshots.len()
    }

    /// Highest number of simultaneously open transactions seen.
    pub fn max_open_transactions(&self) -> usize {
        self.state().max_open
    }

    /// Make the given operation fail until [`clear_failures`](Self::clear_failures).
    pub fn fail_on(&self, point: FailPoint) {
        self.state().fail_points.insert(point);
    }

    pub fn clear_failures(&self) {
        self.state().fail_points.clear();
    }

    /// All tables as a JSON object of row arrays.
    pub fn dump(&self) -> serde_json::Value {
        let inner = self.state();
        serde_json::Value::Object(
            inner
                .tables
                .table_names()
                .map(|table| {
                    let rows = inner
                        .tables
                        .rows(table)
                        .iter()
                        .map(|row| {
                            serde_json::Value::Object(
                                row.iter().map(|(k, v)| (k.clone(), v.to_json())).collect(),
                            )
                        })
                        .collect();
                    (table.clone(), serde_json::Value::Array(rows))
                })
                .collect(),
        )
    }

    fn state(&self) -> MutexGuard<'_, MemoryInner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn to_records(&self, entity_type: &str, rows: Vec<AttributeMap>) -> Result<Vec<EntityRef>> {
        let schema = self.schema(entity_type)?;
        Ok(rows
            .into_iter()
            .map(|row| EntityRef::new(Record::from_row(Arc::clone(&schema), row)))
            .collect())
    }
}

impl fmt::Debug for MemoryConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let inner = self.state();
        f.debug_struct("MemoryConnection")
            .field("schemas", &inner.schemas.keys().collect::<Vec<_>>())
            .field("open_transactions", &inner.snapshots.len())
            .field("journal_len", &inner.journal.len())
            .finish()
    }
}

fn injected(point: &FailPoint) -> Error {
    Error::storage(
        StorageErrorKind::Unavailable,
        None,
        format!("injected failure at {point:?}"),
    )
}

fn missing_key(query: &RelationQuery, attribute: &str) -> Error {
    Error::relation(
        RelationErrorKind::MissingKey,
        query.target(),
        format!("unable to link models: `{attribute}` is null"),
    )
}

/// Whether the owner holds the foreign key: the link points at the target's primary key.
fn owner_holds_key(link: &LinkMap, target_schema: &EntitySchema) -> bool {
    let pk: BTreeSet<&str> = target_schema
        .primary_key_columns()
        .iter()
        .map(String::as_str)
        .collect();
    let linked: BTreeSet<&str> = link.keys().map(String::as_str).collect();
    !linked.is_empty() && linked == pk
}

impl MemoryInner {
    fn check(&self, point: &FailPoint) -> Result<()> {
        if self.fail_points.contains(point) {
            tracing::debug!(?point, "injecting storage failure");
            return Err(injected(point));
        }
        Ok(())
    }

    fn schema(&self, entity_type: &str) -> Result<Arc<EntitySchema>> {
        self.schemas.get(entity_type).cloned().ok_or_else(|| {
            Error::storage(
                StorageErrorKind::NotFound,
                Some(entity_type),
                "no schema registered",
            )
        })
    }

    fn check_unique(
        &self,
        schema: &EntitySchema,
        row: &AttributeMap,
        skip: Option<usize>,
    ) -> Result<()> {
        for columns in schema.unique_constraints() {
            let key = key_of(row, columns);
            if key.iter().any(Value::is_null) {
                continue;
            }
            let conflict = self
                .tables
                .rows(schema.name())
                .iter()
                .enumerate()
                .any(|(i, other)| Some(i) != skip && row_matches(other, columns, &key));
            if conflict {
                return Err(Error::storage(
                    StorageErrorKind::Constraint,
                    Some(schema.name()),
                    format!("duplicate value for unique ({})", columns.join(", ")),
                ));
            }
        }
        Ok(())
    }

    /// Insert a row into a schema-backed table, generating the key if needed.
    fn insert_row(&mut self, schema: &EntitySchema, row: &mut AttributeMap) -> Result<Vec<Value>> {
        let table = schema.name();
        if let Some(column) = schema.auto_increment_column() {
            match row.get(column).and_then(Value::as_i64) {
                Some(id) => self.tables.observe_id(table, id),
                None => {
                    let id = self.tables.next_id(table);
                    row.insert(column.to_string(), Value::BigInt(id));
                }
            }
        }

        let pk = schema.primary_key_columns();
        let key = key_of(row, pk);
        if key.iter().any(Value::is_null) {
            return Err(Error::storage(
                StorageErrorKind::Constraint,
                Some(table),
                format!("primary key ({}) must not be null", pk.join(", ")),
            ));
        }
        if self.tables.position(table, pk, &key).is_some() {
            return Err(Error::storage(
                StorageErrorKind::Constraint,
                Some(table),
                format!("duplicate primary key {}", Value::Array(key)),
            ));
        }
        self.check_unique(schema, row, None)?;

        self.tables.rows_mut(table).push(row.clone());
        self.journal.push(Operation::Insert {
            table: table.to_string(),
            key: key.clone(),
        });
        Ok(key)
    }

    fn update_row(&mut self, schema: &EntitySchema, row: AttributeMap) -> Result<()> {
        let table = schema.name();
        let pk = schema.primary_key_columns();
        let key = key_of(&row, pk);
        let Some(pos) = self.tables.position(table, pk, &key) else {
            return Err(Error::storage(
                StorageErrorKind::NotFound,
                Some(table),
                format!("no row with primary key {}", Value::Array(key)),
            ));
        };
        self.check_unique(schema, &row, Some(pos))?;
        self.tables.rows_mut(table)[pos] = row;
        self.journal.push(Operation::Update {
            table: table.to_string(),
            key,
        });
        Ok(())
    }

    fn delete_row(&mut self, table: &str, columns: &[String], key: &[Value]) -> bool {
        let Some(pos) = self.tables.position(table, columns, key) else {
            return false;
        };
        self.tables.rows_mut(table).remove(pos);
        self.journal.push(Operation::Delete {
            table: table.to_string(),
            key: key.to_vec(),
        });
        true
    }

    /// Insert into any table: schema-backed tables get keys and constraints,
    /// bare association tables just store the row.
    fn insert_into(&mut self, table: &str, mut row: AttributeMap) -> Result<Vec<Value>> {
        if let Some(schema) = self.schemas.get(table).cloned() {
            return self.insert_row(&schema, &mut row);
        }
        let key: Vec<Value> = row.values().cloned().collect();
        self.tables.rows_mut(table).push(row);
        self.journal.push(Operation::Insert {
            table: table.to_string(),
            key: key.clone(),
        });
        Ok(key)
    }

    /// Insert or update an entity without validating it.
    fn write_entity(&mut self, entity: &mut dyn Entity) -> Result<()> {
        let schema = self.schema(entity.entity_type())?;
        let mut row = entity.attributes();
        if entity.is_new() {
            let key = self.insert_row(&schema, &mut row)?;
            for (column, value) in schema.primary_key_columns().iter().zip(key) {
                entity.set(column, value);
            }
            entity.set_new(false);
        } else {
            self.update_row(&schema, row)?;
        }
        Ok(())
    }

    /// Target rows related through `query`.
    fn select(&self, query: &RelationQuery) -> Result<Vec<AttributeMap>> {
        self.schema(query.target())?;
        if query.has_null_anchor() {
            return Ok(Vec::new());
        }
        let targets = self.tables.rows(query.target());

        let mut selected: Vec<AttributeMap> = match query.via_association() {
            Some(via) => {
                let junction_rows = self.tables.rows(&via.table).iter().filter(|row| {
                    via.owner_link.iter().all(|(column, owner_attr)| {
                        row.get(column).is_some_and(|v| {
                            !v.is_null() && v.loose_eq(&query.owner_value(owner_attr))
                        })
                    })
                });
                let mut out: Vec<AttributeMap> = Vec::new();
                for junction in junction_rows {
                    for target in targets {
                        let linked = query.link().iter().all(|(target_attr, column)| {
                            match (target.get(target_attr), junction.get(column)) {
                                (Some(a), Some(b)) => !a.is_null() && a.loose_eq(b),
                                _ => false,
                            }
                        });
                        if linked && !out.iter().any(|seen| seen == target) {
                            out.push(target.clone());
                        }
                    }
                }
                out
            }
            None => targets
                .iter()
                .filter(|row| query.links_directly(row))
                .cloned()
                .collect(),
        };

        selected.retain(|row| query.filters_match(row));
        if !query.is_multiple() {
            selected.truncate(1);
        }
        Ok(selected)
    }

    /// Positions of association rows joining the owner and the target.
    fn junction_positions(
        &self,
        query: &RelationQuery,
        table: &str,
        owner_link: &BTreeMap<String, String>,
        owner: &dyn Entity,
        target: &dyn Entity,
    ) -> Vec<usize> {
        let wanted: Vec<(String, Value)> = owner_link
            .iter()
            .map(|(column, owner_attr)| (column.clone(), owner.get(owner_attr)))
            .chain(
                query
                    .link()
                    .iter()
                    .map(|(target_attr, column)| (column.clone(), target.get(target_attr))),
            )
            .collect();
        self.tables
            .rows(table)
            .iter()
            .enumerate()
            .filter(|(_, row)| {
                wanted.iter().all(|(column, value)| {
                    row.get(column)
                        .is_some_and(|v| !v.is_null() && v.loose_eq(value))
                })
            })
            .map(|(i, _)| i)
            .collect()
    }

    fn link(
        &mut self,
        query: &RelationQuery,
        owner: &mut dyn Entity,
        target: &mut dyn Entity,
        extra_columns: &AttributeMap,
    ) -> Result<()> {
        self.check(&FailPoint::Link)?;
        self.journal.push(Operation::Link {
            target: query.target().to_string(),
            key: target.primary_key_value(),
        });

        if let Some(via) = query.via_association() {
            let mut row = extra_columns.clone();
            for (column, owner_attr) in &via.owner_link {
                let value = owner.get(owner_attr);
                if value.is_null() {
                    return Err(missing_key(query, owner_attr));
                }
                row.insert(column.clone(), value);
            }
            for (target_attr, column) in query.link() {
                let value = target.get(target_attr);
                if value.is_null() {
                    return Err(missing_key(query, target_attr));
                }
                row.insert(column.clone(), value);
            }
            let existing =
                self.junction_positions(query, &via.table, &via.owner_link, owner, target);
            if existing.is_empty() {
                self.insert_into(&via.table, row)?;
            }
            return Ok(());
        }

        let schema = self.schema(query.target())?;
        if owner_holds_key(query.link(), &schema) {
            for (target_attr, owner_attr) in query.link() {
                let value = target.get(target_attr);
                if value.is_null() {
                    return Err(missing_key(query, target_attr));
                }
                match owner.get(owner_attr) {
                    Value::Array(mut items) => {
                        if !items.iter().any(|v| v.loose_eq(&value)) {
                            items.push(value);
                        }
                        owner.set(owner_attr, Value::Array(items));
                    }
                    _ => owner.set(owner_attr, value),
                }
            }
            if !owner.is_new() {
                self.write_entity(owner)?;
            }
        } else {
            for (target_attr, owner_attr) in query.link() {
                let value = owner.get(owner_attr);
                if value.is_null() {
                    return Err(missing_key(query, owner_attr));
                }
                target.set(target_attr, value);
            }
            self.write_entity(target)?;
        }
        Ok(())
    }

    fn unlink(
        &mut self,
        query: &RelationQuery,
        owner: &mut dyn Entity,
        target: &mut dyn Entity,
        delete: bool,
    ) -> Result<()> {
        self.check(&FailPoint::Unlink)?;
        self.journal.push(Operation::Unlink {
            target: query.target().to_string(),
            key: target.primary_key_value(),
            delete,
        });

        if let Some(via) = query.via_association() {
            let positions =
                self.junction_positions(query, &via.table, &via.owner_link, owner, target);
            let columns: Vec<String> = via
                .owner_link
                .keys()
                .chain(query.link().values())
                .cloned()
                .collect();
            for pos in positions.into_iter().rev() {
                let row = &mut self.tables.rows_mut(&via.table)[pos];
                let key = key_of(row, &columns);
                if delete {
                    self.tables.rows_mut(&via.table).remove(pos);
                    self.journal.push(Operation::Delete {
                        table: via.table.clone(),
                        key,
                    });
                } else {
                    for column in &columns {
                        row.insert(column.clone(), Value::Null);
                    }
                    self.journal.push(Operation::Update {
                        table: via.table.clone(),
                        key,
                    });
                }
            }
            return Ok(());
        }

        let schema = self.schema(query.target())?;
        if owner_holds_key(query.link(), &schema) {
            for (target_attr, owner_attr) in query.link() {
                match owner.get(owner_attr) {
                    Value::Array(mut items) => {
                        let value = target.get(target_attr);
                        items.retain(|v| !v.loose_eq(&value));
                        owner.set(owner_attr, Value::Array(items));
                    }
                    _ => owner.set(owner_attr, Value::Null),
                }
            }
            if !owner.is_new() {
                self.write_entity(owner)?;
            }
            if delete {
                self.delete_row(
                    schema.name(),
                    schema.primary_key_columns(),
                    &target.primary_key_value(),
                );
            }
        } else if delete {
            self.delete_row(
                schema.name(),
                schema.primary_key_columns(),
                &target.primary_key_value(),
            );
        } else {
            for target_attr in query.link().keys() {
                target.set(target_attr, Value::Null);
            }
            self.write_entity(target)?;
        }
        Ok(())
    }

    /// Finish the transaction at `depth` (1-based), committing or rolling back.
    fn finish(&mut self, depth: usize, commit: bool) -> Result<()> {
        let open = self.snapshots.len();
        if open != depth {
            return Err(Error::transaction(
                TransactionErrorKind::OutOfOrder,
                format!("transaction {depth} finished while {open} are open"),
            ));
        }

        if commit {
            if let Err(e) = self.check(&FailPoint::Commit) {
                if let Some(snapshot) = self.snapshots.pop() {
                    self.tables = snapshot;
                }
                self.journal.push(Operation::Rollback);
                return Err(Error::transaction(
                    TransactionErrorKind::Commit,
                    e.to_string(),
                ));
            }
            self.snapshots.pop();
            self.journal.push(Operation::Commit);
        } else {
            if let Some(snapshot) = self.snapshots.pop() {
                self.tables = snapshot;
            }
            self.journal.push(Operation::Rollback);
            // The transaction is discarded either way; the failure is still reported.
            if let Err(e) = self.check(&FailPoint::Rollback) {
                return Err(Error::transaction(
                    TransactionErrorKind::Rollback,
                    e.to_string(),
                ));
            }
        }
        Ok(())
    }
}

impl Connection for MemoryConnection {
    fn begin(&self) -> Result<Box<dyn TransactionOps>> {
        let mut inner = self.state();
        if let Err(e) = inner.check(&FailPoint::Begin) {
            return Err(Error::transaction(TransactionErrorKind::Begin, e.to_string()));
        }
        let snapshot = inner.tables.clone();
        inner.snapshots.push(snapshot);
        let depth = inner.snapshots.len();
        inner.max_open = inner.max_open.max(depth);
        inner.journal.push(Operation::Begin);
        tracing::trace!(depth, "memory transaction begun");
        Ok(Box::new(MemoryTransaction {
            inner: Arc::clone(&self.inner),
            depth,
            finished: false,
        }))
    }

    fn primary_key(&self, entity_type: &str) -> Result<Vec<String>> {
        Ok(self.schema(entity_type)?.primary_key_columns().to_vec())
    }

    fn instantiate(&self, entity_type: &str) -> Result<EntityRef> {
        Ok(EntityRef::new(self.create(entity_type)?))
    }

    fn find(&self, entity_type: &str, key: &AttributeMap) -> Result<Option<EntityRef>> {
        if key.is_empty() || key.values().any(Value::is_null) {
            return Ok(None);
        }
        let columns: Vec<String> = key.keys().cloned().collect();
        let values: Vec<Value> = key.values().cloned().collect();
        let row = {
            let inner = self.state();
            inner.schema(entity_type)?;
            inner
                .tables
                .position(entity_type, &columns, &values)
                .map(|pos| inner.tables.rows(entity_type)[pos].clone())
        };
        Ok(self.to_records(entity_type, row.into_iter().collect())?.pop())
    }

    fn save(&self, entity: &mut dyn Entity, run_validation: bool) -> Result<bool> {
        if run_validation && !entity.validate() {
            return Ok(false);
        }
        let mut inner = self.state();
        inner.check(&FailPoint::Save(entity.entity_type().to_string()))?;
        inner.write_entity(entity)?;
        Ok(true)
    }

    fn refresh(&self, entity: &mut dyn Entity) -> Result<bool> {
        let inner = self.state();
        inner.check(&FailPoint::Refresh)?;
        let schema = inner.schema(entity.entity_type())?;
        let key = entity.primary_key_value();
        let Some(pos) = inner
            .tables
            .position(schema.name(), schema.primary_key_columns(), &key)
        else {
            return Ok(false);
        };
        let row = inner.tables.rows(schema.name())[pos].clone();
        drop(inner);

        for name in entity.attributes().keys() {
            if !row.contains_key(name) {
                entity.set(name, Value::Null);
            }
        }
        for (name, value) in row {
            entity.set(&name, value);
        }
        entity.set_new(false);
        entity.reset_relations();
        Ok(true)
    }

    fn query(&self, query: &RelationQuery) -> Result<Vec<EntityRef>> {
        let rows = {
            let mut inner = self.state();
            inner.journal.push(Operation::Query {
                target: query.target().to_string(),
            });
            inner.select(query)?
        };
        self.to_records(query.target(), rows)
    }

    fn link(
        &self,
        query: &RelationQuery,
        owner: &mut dyn Entity,
        target: &mut dyn Entity,
        extra_columns: &AttributeMap,
    ) -> Result<()> {
        self.state().link(query, owner, target, extra_columns)
    }

    fn unlink(
        &self,
        query: &RelationQuery,
        owner: &mut dyn Entity,
        target: &mut dyn Entity,
        delete: bool,
    ) -> Result<()> {
        self.state().unlink(query, owner, target, delete)
    }

    fn unlink_all(
        &self,
        query: &RelationQuery,
        owner: &mut dyn Entity,
        delete: bool,
    ) -> Result<()> {
        for target in self.query(query)? {
            let mut target = target.write();
            self.unlink(query, owner, &mut *target, delete)?;
        }
        Ok(())
    }
}

/// A snapshot transaction on a [`MemoryConnection`].
///
/// Dropping an unfinished transaction rolls it back.
pub struct MemoryTransaction {
    inner: Arc<Mutex<MemoryInner>>,
    depth: usize,
    finished: bool,
}

impl MemoryTransaction {
    fn finish(&mut self, commit: bool) -> Result<()> {
        self.finished = true;
        self.inner
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .finish(self.depth, commit)
    }
}

impl fmt::Debug for MemoryTransaction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MemoryTransaction")
            .field("depth", &self.depth)
            .field("finished", &self.finished)
            .finish()
    }
}

impl Drop for MemoryTransaction {
    fn drop(&mut self) {
        if !self.finished {
            if let Err(e) = self.finish(false) {
                tracing::warn!(error = %e, depth = self.depth, "dropped transaction could not roll back");
            }
        }
    }
}

impl TransactionOps for MemoryTransaction {
    fn commit(mut self: Box<Self>) -> Result<()> {
        self.finish(true)
    }

    fn rollback(mut self: Box<Self>) -> Result<()> {
        self.finish(false)
    }
}

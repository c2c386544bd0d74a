//! Table storage, the operation journal and failure injection.

use std::collections::BTreeMap;
use std::fmt;

use relmodel_core::{AttributeMap, Value};

/// Row storage for every table, plus key sequences.
///
/// Cloned wholesale to snapshot a transaction's starting point.
#[derive(Debug, Clone, Default)]
pub(crate) struct Tables {
    rows: BTreeMap<String, Vec<AttributeMap>>,
    sequences: BTreeMap<String, i64>,
}

impl Tables {
    pub(crate) fn rows(&self, table: &str) -> &[AttributeMap] {
        self.rows.get(table).map_or(&[], Vec::as_slice)
    }

    pub(crate) fn rows_mut(&mut self, table: &str) -> &mut Vec<AttributeMap> {
        self.rows.entry(table.to_string()).or_default()
    }

    /// Next generated key for `table`.
    pub(crate) fn next_id(&mut self, table: &str) -> i64 {
        let seq = self.sequences.entry(table.to_string()).or_insert(0);
        *seq += 1;
        *seq
    }

    /// Keep the sequence ahead of an explicitly assigned key.
    pub(crate) fn observe_id(&mut self, table: &str, id: i64) {
        let seq = self.sequences.entry(table.to_string()).or_insert(0);
        if id > *seq {
            *seq = id;
        }
    }

    /// Index of the row whose `columns` equal `key`.
    pub(crate) fn position(&self, table: &str, columns: &[String], key: &[Value]) -> Option<usize> {
        self.rows(table)
            .iter()
            .position(|row| row_matches(row, columns, key))
    }

    pub(crate) fn table_names(&self) -> impl Iterator<Item = &String> {
        self.rows.keys()
    }
}

/// Whether `row` holds non-null values equal to `key` in `columns`.
pub(crate) fn row_matches(row: &AttributeMap, columns: &[String], key: &[Value]) -> bool {
    !columns.is_empty()
        && columns.len() == key.len()
        && columns.iter().zip(key).all(|(column, expected)| {
            row.get(column)
                .is_some_and(|actual| !actual.is_null() && actual.loose_eq(expected))
        })
}

/// Values of `columns` in `row`, NULL where absent.
pub(crate) fn key_of(row: &AttributeMap, columns: &[String]) -> Vec<Value> {
    columns
        .iter()
        .map(|c| row.get(c).cloned().unwrap_or(Value::Null))
        .collect()
}

/// One recorded storage operation.
#[derive(Debug, Clone, PartialEq)]
pub enum Operation {
    Begin,
    Commit,
    Rollback,
    Insert { table: String, key: Vec<Value> },
    Update { table: String, key: Vec<Value> },
    Delete { table: String, key: Vec<Value> },
    /// A relation link between an owner and a target.
    Link { target: String, key: Vec<Value> },
    /// A relation unlink; `delete` tells whether rows were removed.
    Unlink {
        target: String,
        key: Vec<Value>,
        delete: bool,
    },
    Query { target: String },
}

impl Operation {
    /// Whether this operation writes rows.
    pub fn is_write(&self) -> bool {
        matches!(
            self,
            Operation::Insert { .. } | Operation::Update { .. } | Operation::Delete { .. }
        )
    }

    /// The table or target type the operation touched, if any.
    pub fn table(&self) -> Option<&str> {
        match self {
            Operation::Insert { table, .. }
            | Operation::Update { table, .. }
            | Operation::Delete { table, .. } => Some(table),
            Operation::Link { target, .. }
            | Operation::Unlink { target, .. }
            | Operation::Query { target } => Some(target),
            Operation::Begin | Operation::Commit | Operation::Rollback => None,
        }
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let key = |key: &[Value]| Value::Array(key.to_vec()).to_string();
        match self {
            Operation::Begin => write!(f, "BEGIN"),
            Operation::Commit => write!(f, "COMMIT"),
            Operation::Rollback => write!(f, "ROLLBACK"),
            Operation::Insert { table, key: k } => write!(f, "INSERT {table} {}", key(k)),
            Operation::Update { table, key: k } => write!(f, "UPDATE {table} {}", key(k)),
            Operation::Delete { table, key: k } => write!(f, "DELETE {table} {}", key(k)),
            Operation::Link { target, key: k } => write!(f, "LINK {target} {}", key(k)),
            Operation::Unlink {
                target,
                key: k,
                delete,
            } => write!(
                f,
                "UNLINK {target} {}{}",
                key(k),
                if *delete { " (delete)" } else { "" }
            ),
            Operation::Query { target } => write!(f, "QUERY {target}"),
        }
    }
}

/// A point where the store can be told to fail.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub enum FailPoint {
    /// Saving an entity of this type.
    Save(String),
    Link,
    Unlink,
    Begin,
    Commit,
    Rollback,
    Refresh,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sequences_skip_explicit_ids() {
        let mut tables = Tables::default();
        assert_eq!(tables.next_id("items"), 1);
        tables.observe_id("items", 10);
        assert_eq!(tables.next_id("items"), 11);
        tables.observe_id("items", 3);
        assert_eq!(tables.next_id("items"), 12);
    }

    #[test]
    fn row_matching_ignores_nulls() {
        let mut row = AttributeMap::new();
        row.insert("id".into(), Value::BigInt(1));
        row.insert("owner".into(), Value::Null);
        let id = vec!["id".to_string()];
        assert!(row_matches(&row, &id, &[Value::Int(1)]));
        assert!(!row_matches(&row, &["owner".to_string()], &[Value::Null]));
        assert!(!row_matches(&row, &[], &[]));
        assert_eq!(key_of(&row, &id), vec![Value::BigInt(1)]);
    }

    #[test]
    fn operation_display() {
        let op = Operation::Unlink {
            target: "items".into(),
            key: vec![Value::BigInt(2)],
            delete: true,
        };
        assert_eq!(op.to_string(), "UNLINK items [2] (delete)");
        assert!(!op.is_write());
        assert_eq!(op.table(), Some("items"));
    }
}

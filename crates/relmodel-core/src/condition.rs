//! Attribute predicates used for relation `on` conditions and filters.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::entity::AttributeMap;
use crate::error::{Error, Result};
use crate::value::Value;

/// A boolean predicate over an entity's attributes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Condition {
    /// `column = value`
    Eq(String, Value),
    /// `column <> value`
    Ne(String, Value),
    /// `column IN (values)`
    In(String, Vec<Value>),
    /// `column IS NULL`
    IsNull(String),
    /// `NOT condition`
    Not(Box<Condition>),
    /// All conditions hold (an empty list is true)
    And(Vec<Condition>),
    /// Any condition holds (an empty list is false)
    Or(Vec<Condition>),
}

impl Condition {
    pub fn eq(column: impl Into<String>, value: impl Into<Value>) -> Self {
        Condition::Eq(column.into(), value.into())
    }

    pub fn ne(column: impl Into<String>, value: impl Into<Value>) -> Self {
        Condition::Ne(column.into(), value.into())
    }

    pub fn is_in<I, V>(column: impl Into<String>, values: I) -> Self
    where
        I: IntoIterator<Item = V>,
        V: Into<Value>,
    {
        Condition::In(column.into(), values.into_iter().map(Into::into).collect())
    }

    pub fn is_null(column: impl Into<String>) -> Self {
        Condition::IsNull(column.into())
    }

    #[allow(clippy::should_implement_trait)]
    pub fn not(condition: Condition) -> Self {
        Condition::Not(Box::new(condition))
    }

    /// Combine with another condition using AND, flattening nested ANDs.
    pub fn and(self, other: Condition) -> Self {
        match (self, other) {
            (Condition::And(mut left), Condition::And(right)) => {
                left.extend(right);
                Condition::And(left)
            }
            (Condition::And(mut left), right) => {
                left.push(right);
                Condition::And(left)
            }
            (left, right) => Condition::And(vec![left, right]),
        }
    }

    /// Combine with another condition using OR.
    pub fn or(self, other: Condition) -> Self {
        match self {
            Condition::Or(mut left) => {
                left.push(other);
                Condition::Or(left)
            }
            left => Condition::Or(vec![left, other]),
        }
    }

    /// Evaluate against an attribute map. Missing attributes read as NULL.
    pub fn matches(&self, attributes: &AttributeMap) -> bool {
        let lookup = |column: &str| attributes.get(column).cloned().unwrap_or(Value::Null);
        match self {
            Condition::Eq(column, value) => {
                let actual = lookup(column);
                !actual.is_null() && actual.loose_eq(value)
            }
            Condition::Ne(column, value) => {
                let actual = lookup(column);
                !actual.is_null() && !actual.loose_eq(value)
            }
            Condition::In(column, values) => {
                let actual = lookup(column);
                !actual.is_null() && values.iter().any(|v| actual.loose_eq(v))
            }
            Condition::IsNull(column) => lookup(column).is_null(),
            Condition::Not(inner) => !inner.matches(attributes),
            Condition::And(all) => all.iter().all(|c| c.matches(attributes)),
            Condition::Or(any) => any.iter().any(|c| c.matches(attributes)),
        }
    }

    /// Parse a hash-format condition: `{"status": 1, "kind": ["a", "b"], "deleted_at": null}`.
    ///
    /// Each entry becomes `Eq`, `In` (for arrays) or `IsNull` (for null);
    /// entries are joined with AND.
    pub fn from_json(json: &serde_json::Value) -> Result<Self> {
        let serde_json::Value::Object(map) = json else {
            return Err(Error::Serde(format!(
                "condition must be an object in hash format, got {json}"
            )));
        };
        let mut parts = map
            .iter()
            .map(|(column, value)| match value {
                serde_json::Value::Null => Condition::is_null(column.as_str()),
                serde_json::Value::Array(items) => Condition::In(
                    column.clone(),
                    items.iter().map(Value::from_json).collect(),
                ),
                other => Condition::Eq(column.clone(), Value::from_json(other)),
            })
            .collect::<Vec<_>>();
        Ok(if parts.len() == 1 {
            parts.remove(0)
        } else {
            Condition::And(parts)
        })
    }
}

fn write_joined(f: &mut fmt::Formatter<'_>, parts: &[Condition], sep: &str) -> fmt::Result {
    write!(f, "(")?;
    for (i, part) in parts.iter().enumerate() {
        if i > 0 {
            write!(f, " {sep} ")?;
        }
        write!(f, "{part}")?;
    }
    write!(f, ")")
}

impl fmt::Display for Condition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Condition::Eq(c, v) => write!(f, "{c} = {v}"),
            Condition::Ne(c, v) => write!(f, "{c} <> {v}"),
            Condition::In(c, vs) => {
                write!(f, "{c} IN ")?;
                write!(f, "{}", Value::Array(vs.clone()))
            }
            Condition::IsNull(c) => write!(f, "{c} IS NULL"),
            Condition::Not(inner) => write!(f, "NOT ({inner})"),
            Condition::And(parts) if parts.is_empty() => write!(f, "TRUE"),
            Condition::Or(parts) if parts.is_empty() => write!(f, "FALSE"),
            Condition::And(parts) => write_joined(f, parts, "AND"),
            Condition::Or(parts) => write_joined(f, parts, "OR"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn attrs(pairs: &[(&str, Value)]) -> AttributeMap {
        pairs
            .iter()
            .map(|(k, v)| ((*k).to_string(), v.clone()))
            .collect()
    }

    #[test]
    fn eq_and_in_use_loose_comparison() {
        let row = attrs(&[("status", Value::Int(1)), ("kind", Value::from("a"))]);
        assert!(Condition::eq("status", 1i64).matches(&row));
        assert!(Condition::is_in("kind", ["a", "b"]).matches(&row));
        assert!(!Condition::is_in("kind", ["c"]).matches(&row));
        assert!(Condition::ne("status", 2i64).matches(&row));
    }

    #[test]
    fn null_never_equals() {
        let row = attrs(&[("deleted_at", Value::Null)]);
        assert!(!Condition::eq("deleted_at", Value::Null).matches(&row));
        assert!(Condition::is_null("deleted_at").matches(&row));
        assert!(Condition::is_null("missing").matches(&row));
    }

    #[test]
    fn combinators() {
        let row = attrs(&[("a", Value::Int(1)), ("b", Value::Int(2))]);
        let both = Condition::eq("a", 1).and(Condition::eq("b", 2));
        assert!(both.matches(&row));
        let flattened = both.clone().and(Condition::eq("c", 3));
        assert!(matches!(&flattened, Condition::And(parts) if parts.len() == 3));
        assert!(!flattened.matches(&row));
        assert!(Condition::eq("a", 9).or(Condition::eq("b", 2)).matches(&row));
        assert!(Condition::not(Condition::eq("a", 9)).matches(&row));
        assert!(Condition::And(vec![]).matches(&row));
        assert!(!Condition::Or(vec![]).matches(&row));
    }

    #[test]
    fn parses_hash_format() {
        let cond = Condition::from_json(&serde_json::json!({"status": 1})).unwrap();
        assert_eq!(cond, Condition::Eq("status".into(), Value::BigInt(1)));

        let cond =
            Condition::from_json(&serde_json::json!({"kind": ["a", "b"], "gone": null})).unwrap();
        let row = attrs(&[("kind", Value::from("b"))]);
        assert!(cond.matches(&row));

        assert!(Condition::from_json(&serde_json::json!("status = 1")).is_err());
    }

    #[test]
    fn display() {
        let cond = Condition::eq("a", 1).and(Condition::is_null("b"));
        assert_eq!(cond.to_string(), "(a = 1 AND b IS NULL)");
    }
}

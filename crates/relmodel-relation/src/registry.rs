//! The relation registry and its accessor aliases.

use std::collections::BTreeMap;

use relmodel_core::{Error, RelationErrorKind, Result};

use crate::spec::{RelationConfig, RelationSpec};

/// How an accessor name reaches its relation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccessorMode {
    /// Property-style read/write (`orderItems`, `OrderItems`).
    Property,
    /// Method-style read (`getOrderItems`).
    Getter,
    /// Method-style write (`setOrderItems`).
    Setter,
}

/// A resolved accessor alias.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Accessor {
    pub relation: String,
    pub mode: AccessorMode,
}

/// Every relation declared for one owner type, normalized once at attach time.
#[derive(Debug, Clone, Default)]
pub struct RelationRegistry {
    specs: Vec<RelationSpec>,
    index: BTreeMap<String, usize>,
    accessors: BTreeMap<String, Accessor>,
}

fn upper_first(name: &str) -> String {
    let mut chars = name.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().chain(chars).collect(),
        None => String::new(),
    }
}

/// Accessor aliases derived from a relation name.
fn aliases(name: &str) -> Vec<(String, AccessorMode)> {
    let upper = upper_first(name);
    let mut out = vec![
        (name.to_string(), AccessorMode::Property),
        (upper.clone(), AccessorMode::Property),
        (format!("get{name}"), AccessorMode::Getter),
        (format!("get{upper}"), AccessorMode::Getter),
        (format!("set{name}"), AccessorMode::Setter),
        (format!("set{upper}"), AccessorMode::Setter),
    ];
    out.dedup();
    out
}

impl RelationRegistry {
    /// Normalize every declaration, failing on the first configuration error.
    pub fn new<I, S>(configs: I) -> Result<Self>
    where
        I: IntoIterator<Item = (S, RelationConfig)>,
        S: Into<String>,
    {
        let mut registry = Self::default();
        for (name, config) in configs {
            registry.declare(RelationSpec::from_config(name, config)?)?;
        }
        tracing::debug!(relations = registry.specs.len(), "relation registry built");
        Ok(registry)
    }

    /// Build from the declarative mapping form: `{ "name": { "target": .., "link": {..} } }`.
    pub fn from_json(json: &serde_json::Value) -> Result<Self> {
        let Some(map) = json.as_object() else {
            return Err(Error::config(None, "`relations` must be a mapping"));
        };
        let configs = map
            .iter()
            .map(|(name, config)| -> Result<(String, RelationConfig)> {
                Ok((name.clone(), RelationConfig::from_json(name, config)?))
            })
            .collect::<Result<Vec<_>>>()?;
        Self::new(configs)
    }

    fn declare(&mut self, spec: RelationSpec) -> Result<()> {
        let name = spec.name().to_string();
        if name.is_empty() {
            return Err(Error::config(None, "relation name must not be empty"));
        }
        if self.index.contains_key(&name) {
            return Err(Error::config(
                Some(name.as_str()),
                format!("relation `{name}` is declared twice"),
            ));
        }
        for (alias, mode) in aliases(&name) {
            if let Some(existing) = self.accessors.get(&alias) {
                if existing.relation != name {
                    return Err(Error::config(
                        Some(name.as_str()),
                        format!(
                            "accessor `{alias}` of `{name}` collides with relation `{}`",
                            existing.relation
                        ),
                    ));
                }
            }
            self.accessors.insert(
                alias,
                Accessor {
                    relation: name.clone(),
                    mode,
                },
            );
        }
        self.index.insert(name, self.specs.len());
        self.specs.push(spec);
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<&RelationSpec> {
        self.index.get(name).map(|&i| &self.specs[i])
    }

    /// The normalized declaration of `name`, or an unknown-relation error.
    pub fn spec(&self, name: &str) -> Result<&RelationSpec> {
        self.get(name).ok_or_else(|| {
            Error::relation(
                RelationErrorKind::Unknown,
                name,
                format!("no relation named `{name}` is declared"),
            )
        })
    }

    pub fn contains(&self, name: &str) -> bool {
        self.index.contains_key(name)
    }

    /// Resolve an accessor alias (property or method name).
    pub fn resolve(&self, alias: &str) -> Option<&Accessor> {
        self.accessors.get(alias)
    }

    /// Relation names in declaration order.
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.specs.iter().map(RelationSpec::name)
    }

    pub fn specs(&self) -> &[RelationSpec] {
        &self.specs
    }

    pub fn len(&self) -> usize {
        self.specs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.specs.is_empty()
    }
}

//! Relation declarations: partial configuration and the normalized spec.

use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use relmodel_core::{
    AttributeMap, Condition, Connection, EntityRef, Error, LinkMap, RelationQuery, Result, Value,
    Via,
};

/// Custom lookup: resolve an existing target from raw attribute data.
pub type LookupFn =
    Arc<dyn Fn(&dyn Connection, &AttributeMap) -> Result<Option<EntityRef>> + Send + Sync>;

/// Custom query refinement.
pub type RefineFn = Arc<dyn Fn(&mut RelationQuery) + Send + Sync>;

/// How an assigned raw value is matched to an existing target entity.
#[derive(Clone, Default)]
pub enum Lookup {
    /// Find by the target's primary key, when every key attribute is present.
    #[default]
    ByPrimaryKey,
    /// Caller-supplied finder.
    Custom(LookupFn),
}

impl fmt::Debug for Lookup {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Lookup::ByPrimaryKey => f.write_str("ByPrimaryKey"),
            Lookup::Custom(_) => f.write_str("Custom(<fn>)"),
        }
    }
}

/// Query-time filter of a relation.
#[derive(Clone, Default)]
pub enum Filter {
    #[default]
    None,
    /// Added to the query's refinable `where` conditions.
    Predicate(Condition),
    /// Receives the query for arbitrary refinement.
    Refine(RefineFn),
}

impl fmt::Debug for Filter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Filter::None => f.write_str("None"),
            Filter::Predicate(c) => f.debug_tuple("Predicate").field(c).finish(),
            Filter::Refine(_) => f.write_str("Refine(<fn>)"),
        }
    }
}

/// What happens to a to-many item that is no longer in the desired set.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OnRemove {
    /// Delete the target row, or the association row for `via` relations.
    #[default]
    Delete,
    /// Clear the foreign key, or null the association row's key columns.
    Detach,
}

impl OnRemove {
    pub fn deletes(self) -> bool {
        matches!(self, OnRemove::Delete)
    }
}

/// A partial relation declaration, before normalization.
///
/// ```ignore
/// let items = RelationConfig::has_many("items", [("order_id", "id")])
///     .on_condition(Condition::eq("archived", false))
///     .on_remove(OnRemove::Detach);
/// ```
#[derive(Debug, Clone, Default)]
pub struct RelationConfig {
    pub target: Option<String>,
    pub link: Option<LinkMap>,
    pub multiple: bool,
    pub on_condition: Option<Condition>,
    pub filter: Filter,
    pub via: Option<Via>,
    pub extra_columns: AttributeMap,
    pub lookup: Lookup,
    pub on_remove: OnRemove,
}

fn link_map<I, K, V>(pairs: I) -> LinkMap
where
    I: IntoIterator<Item = (K, V)>,
    K: Into<String>,
    V: Into<String>,
{
    pairs
        .into_iter()
        .map(|(k, v)| (k.into(), v.into()))
        .collect()
}

impl RelationConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// A to-one relation. `link` pairs are `(target attribute, owner attribute)`.
    pub fn has_one<I, K, V>(target: impl Into<String>, link: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        Self {
            target: Some(target.into()),
            link: Some(link_map(link)),
            ..Self::default()
        }
    }

    /// A to-many relation. `link` pairs are `(target attribute, owner attribute)`,
    /// or `(target attribute, junction column)` when routed through [`via`](Self::via).
    pub fn has_many<I, K, V>(target: impl Into<String>, link: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        Self {
            multiple: true,
            ..Self::has_one(target, link)
        }
    }

    pub fn target(mut self, target: impl Into<String>) -> Self {
        self.target = Some(target.into());
        self
    }

    /// Add one `target attribute -> owner attribute` pair to the link.
    pub fn link(mut self, target_attr: impl Into<String>, owner_attr: impl Into<String>) -> Self {
        self.link
            .get_or_insert_with(LinkMap::new)
            .insert(target_attr.into(), owner_attr.into());
        self
    }

    pub fn multiple(mut self, multiple: bool) -> Self {
        self.multiple = multiple;
        self
    }

    /// A permanent condition, combined with AND when called repeatedly.
    pub fn on_condition(mut self, condition: Condition) -> Self {
        self.on_condition = Some(match self.on_condition.take() {
            Some(existing) => existing.and(condition),
            None => condition,
        });
        self
    }

    /// A value filter applied as a refinable `where` condition.
    pub fn filter(mut self, condition: Condition) -> Self {
        self.filter = Filter::Predicate(condition);
        self
    }

    /// A filter function receiving the query.
    pub fn refine<F>(mut self, refine: F) -> Self
    where
        F: Fn(&mut RelationQuery) + Send + Sync + 'static,
    {
        self.filter = Filter::Refine(Arc::new(refine));
        self
    }

    pub fn via(mut self, via: Via) -> Self {
        self.via = Some(via);
        self
    }

    /// A column written onto the association row when linking.
    pub fn extra_column(mut self, column: impl Into<String>, value: impl Into<Value>) -> Self {
        self.extra_columns.insert(column.into(), value.into());
        self
    }

    /// Replace the default primary-key lookup.
    pub fn lookup<F>(mut self, lookup: F) -> Self
    where
        F: Fn(&dyn Connection, &AttributeMap) -> Result<Option<EntityRef>> + Send + Sync + 'static,
    {
        self.lookup = Lookup::Custom(Arc::new(lookup));
        self
    }

    pub fn on_remove(mut self, on_remove: OnRemove) -> Self {
        self.on_remove = on_remove;
        self
    }

    /// Parse the declarative mapping form of one relation.
    ///
    /// Recognised keys: `target`, `link`, `multiple`, `onCondition`, `filter`,
    /// `via`, `extraColumns`, `onRemove`.
    pub fn from_json(name: &str, json: &serde_json::Value) -> Result<Self> {
        let Some(map) = json.as_object() else {
            return Err(Error::config(Some(name), format!("`{name}` must be a mapping")));
        };

        let target = match map.get("target") {
            None | Some(serde_json::Value::Null) => {
                return Err(Error::config(Some(name), format!("`{name}` must have `target`")));
            }
            Some(serde_json::Value::String(target)) => target.clone(),
            Some(_) => {
                return Err(Error::config(
                    Some(name),
                    format!("`target` for `{name}` must be a string"),
                ));
            }
        };

        let link = match map.get("link") {
            None | Some(serde_json::Value::Null) => {
                return Err(Error::config(Some(name), format!("`{name}` must have `link`")));
            }
            Some(serde_json::Value::Object(link)) => {
                let mut out = LinkMap::new();
                for (target_attr, owner_attr) in link {
                    let Some(owner_attr) = owner_attr.as_str() else {
                        return Err(Error::config(
                            Some(name),
                            format!("`link` for `{name}` must map attribute names to attribute names"),
                        ));
                    };
                    out.insert(target_attr.clone(), owner_attr.to_string());
                }
                out
            }
            Some(_) => {
                return Err(Error::config(
                    Some(name),
                    format!("`link` for `{name}` must be a mapping"),
                ));
            }
        };

        let mut config = RelationConfig {
            target: Some(target),
            link: Some(link),
            ..RelationConfig::default()
        };

        for (key, value) in map {
            match key.as_str() {
                "target" | "link" => {}
                "multiple" => {
                    config.multiple = value.as_bool().ok_or_else(|| {
                        Error::config(Some(name), format!("`multiple` for `{name}` must be a boolean"))
                    })?;
                }
                "onCondition" if !value.is_null() => {
                    config.on_condition = Some(parse_condition(name, "onCondition", value)?);
                }
                "filter" if !value.is_null() => {
                    config.filter = Filter::Predicate(parse_condition(name, "filter", value)?);
                }
                "via" if !value.is_null() => {
                    config.via = Some(serde_json::from_value(value.clone()).map_err(|e| {
                        Error::config(Some(name), format!("`via` for `{name}` is invalid: {e}"))
                    })?);
                }
                "extraColumns" => {
                    let Some(columns) = value.as_object() else {
                        return Err(Error::config(
                            Some(name),
                            format!("`extraColumns` for `{name}` must be a mapping"),
                        ));
                    };
                    config.extra_columns = columns
                        .iter()
                        .map(|(k, v)| (k.clone(), Value::from_json(v)))
                        .collect();
                }
                "onRemove" => {
                    config.on_remove = serde_json::from_value(value.clone()).map_err(|e| {
                        Error::config(Some(name), format!("`onRemove` for `{name}` is invalid: {e}"))
                    })?;
                }
                "onCondition" | "filter" | "via" => {}
                other => {
                    return Err(Error::config(
                        Some(name),
                        format!("unknown option `{other}` for `{name}`"),
                    ));
                }
            }
        }
        Ok(config)
    }
}

fn parse_condition(name: &str, key: &str, value: &serde_json::Value) -> Result<Condition> {
    Condition::from_json(value)
        .map_err(|e| Error::config(Some(name), format!("`{key}` for `{name}` is invalid: {e}")))
}

/// A normalized, immutable relation declaration.
#[derive(Debug, Clone)]
pub struct RelationSpec {
    name: String,
    target: String,
    link: LinkMap,
    multiple: bool,
    on_condition: Option<Condition>,
    filter: Filter,
    via: Option<Via>,
    extra_columns: AttributeMap,
    lookup: Lookup,
    on_remove: OnRemove,
}

impl RelationSpec {
    /// Normalize a partial declaration, rejecting a missing `target` or `link`.
    pub fn from_config(name: impl Into<String>, config: RelationConfig) -> Result<Self> {
        let name = name.into();
        let Some(target) = config.target.filter(|t| !t.is_empty()) else {
            return Err(Error::config(Some(name.as_str()), format!("`{name}` must have `target`")));
        };
        let Some(link) = config.link else {
            return Err(Error::config(Some(name.as_str()), format!("`{name}` must have `link`")));
        };
        if link.is_empty() {
            return Err(Error::config(
                Some(name.as_str()),
                format!("`link` for `{name}` must not be empty"),
            ));
        }
        if let Some(via) = &config.via {
            if via.table.is_empty() || via.owner_link.is_empty() {
                return Err(Error::config(
                    Some(name.as_str()),
                    format!("`via` for `{name}` needs a table and at least one owner key"),
                ));
            }
        }

        Ok(Self {
            name,
            target,
            link,
            multiple: config.multiple,
            on_condition: config.on_condition,
            filter: config.filter,
            via: config.via,
            extra_columns: config.extra_columns,
            lookup: config.lookup,
            on_remove: config.on_remove,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn target(&self) -> &str {
        &self.target
    }

    /// Target attribute -> owner attribute (or junction column with `via`).
    pub fn link(&self) -> &LinkMap {
        &self.link
    }

    pub fn is_multiple(&self) -> bool {
        self.multiple
    }

    pub fn on_condition(&self) -> Option<&Condition> {
        self.on_condition.as_ref()
    }

    pub fn filter(&self) -> &Filter {
        &self.filter
    }

    pub fn via(&self) -> Option<&Via> {
        self.via.as_ref()
    }

    /// Whether the link is a direct foreign key (no association table).
    pub fn is_direct(&self) -> bool {
        self.via.is_none()
    }

    pub fn extra_columns(&self) -> &AttributeMap {
        &self.extra_columns
    }

    pub fn lookup(&self) -> &Lookup {
        &self.lookup
    }

    pub fn on_remove(&self) -> OnRemove {
        self.on_remove
    }

    /// Resolve an existing target from raw attribute data.
    pub fn find_existing(
        &self,
        conn: &dyn Connection,
        data: &AttributeMap,
    ) -> Result<Option<EntityRef>> {
        match &self.lookup {
            Lookup::Custom(find) => find(conn, data),
            Lookup::ByPrimaryKey => {
                let mut key = AttributeMap::new();
                for pk in conn.primary_key(&self.target)? {
                    match data.get(&pk) {
                        Some(value) if !value.is_null() => {
                            key.insert(pk, value.clone());
                        }
                        _ => return Ok(None),
                    }
                }
                if key.is_empty() {
                    return Ok(None);
                }
                conn.find(&self.target, &key)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config_message(err: &Error) -> String {
        match err {
            Error::Config(c) => c.message.clone(),
            other => panic!("expected a config error, got {other:?}"),
        }
    }

    #[test]
    fn missing_target_or_link_is_rejected() {
        let err = RelationSpec::from_config("customer", RelationConfig::new().link("id", "customer_id"))
            .unwrap_err();
        assert_eq!(config_message(&err), "`customer` must have `target`");

        let err = RelationSpec::from_config("customer", RelationConfig::new().target("customers"))
            .unwrap_err();
        assert_eq!(config_message(&err), "`customer` must have `link`");

        let empty = RelationConfig {
            target: Some("customers".into()),
            link: Some(LinkMap::new()),
            ..RelationConfig::default()
        };
        assert!(RelationSpec::from_config("customer", empty).unwrap_err().is_config_error());
    }

    #[test]
    fn builders_normalize() {
        let spec = RelationSpec::from_config(
            "items",
            RelationConfig::has_many("items", [("order_id", "id")])
                .on_condition(Condition::eq("archived", false))
                .on_condition(Condition::is_null("deleted_at"))
                .on_remove(OnRemove::Detach),
        )
        .unwrap();
        assert!(spec.is_multiple());
        assert!(spec.is_direct());
        assert_eq!(spec.link().get("order_id").map(String::as_str), Some("id"));
        assert!(matches!(spec.on_condition(), Some(Condition::And(parts)) if parts.len() == 2));
        assert_eq!(spec.on_remove(), OnRemove::Detach);
        assert!(matches!(spec.lookup(), Lookup::ByPrimaryKey));
    }

    #[test]
    fn json_declaration() {
        let json = serde_json::json!({
            "target": "tags",
            "link": {"id": "tag_id"},
            "multiple": true,
            "via": {"table": "order_tags", "ownerLink": {"order_id": "id"}},
            "extraColumns": {"source": "import"},
            "filter": {"visible": true},
            "onRemove": "detach"
        });
        let config = RelationConfig::from_json("tags", &json).unwrap();
        let spec = RelationSpec::from_config("tags", config).unwrap();
        assert!(!spec.is_direct());
        assert_eq!(spec.via().map(|v| v.table.as_str()), Some("order_tags"));
        assert_eq!(spec.extra_columns().get("source"), Some(&Value::from("import")));
        assert!(matches!(spec.filter(), Filter::Predicate(_)));
        assert_eq!(spec.on_remove(), OnRemove::Detach);
    }

    #[test]
    fn json_errors() {
        let err = RelationConfig::from_json("a", &serde_json::json!([1])).unwrap_err();
        assert_eq!(config_message(&err), "`a` must be a mapping");

        let err = RelationConfig::from_json("a", &serde_json::json!({"link": {"id": "a_id"}}))
            .unwrap_err();
        assert_eq!(config_message(&err), "`a` must have `target`");

        let err = RelationConfig::from_json("a", &serde_json::json!({"target": "x"})).unwrap_err();
        assert_eq!(config_message(&err), "`a` must have `link`");

        let err = RelationConfig::from_json("a", &serde_json::json!({"target": "x", "link": "id"}))
            .unwrap_err();
        assert_eq!(config_message(&err), "`link` for `a` must be a mapping");

        let err = RelationConfig::from_json(
            "a",
            &serde_json::json!({"target": "x", "link": {"id": "a_id"}, "cascade": true}),
        )
        .unwrap_err();
        assert!(config_message(&err).contains("unknown option `cascade`"));
    }

    #[test]
    fn debug_hides_closures() {
        let config = RelationConfig::has_one("customers", [("id", "customer_id")])
            .refine(|q| {
                q.and_where(Condition::eq("active", true));
            })
            .lookup(|_, _| Ok(None));
        let rendered = format!("{config:?}");
        assert!(rendered.contains("Refine(<fn>)"));
        assert!(rendered.contains("Custom(<fn>)"));
    }
}

//! Relation query construction.

use relmodel_core::{Entity, RelationQuery};

use crate::spec::{Filter, RelationSpec};

/// Build the query for a declared relation, anchored on `owner`.
///
/// Applies the permanent `on` condition, then the filter, then the
/// association routing. Building never touches staged state.
pub fn build_query(owner: &dyn Entity, spec: &RelationSpec) -> RelationQuery {
    let mut query = RelationQuery::new(
        owner,
        spec.target(),
        spec.link().clone(),
        spec.is_multiple(),
    );

    if let Some(condition) = spec.on_condition() {
        query.on_condition(condition.clone());
    }

    match spec.filter() {
        Filter::None => {}
        Filter::Predicate(condition) => {
            query.and_where(condition.clone());
        }
        Filter::Refine(refine) => refine(&mut query),
    }

    if let Some(via) = spec.via() {
        query.via(via.clone());
    }

    query
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::spec::RelationConfig;
    use relmodel_core::{Condition, Via};
    use relmodel_memory::{EntitySchema, MemoryConnection};

    fn owner() -> relmodel_memory::Record {
        MemoryConnection::new()
            .with_schema(EntitySchema::new("orders"))
            .create("orders")
            .unwrap()
            .with("id", 3i64)
    }

    #[test]
    fn applies_on_filter_and_via_in_order() {
        let spec = RelationSpec::from_config(
            "tags",
            RelationConfig::has_many("tags", [("id", "tag_id")])
                .on_condition(Condition::eq("visible", true))
                .filter(Condition::eq("kind", "label"))
                .via(Via::new("order_tags").owner_key("order_id", "id")),
        )
        .unwrap();
        let query = build_query(&owner(), &spec);

        assert_eq!(query.target(), "tags");
        assert!(query.is_multiple());
        assert_eq!(query.on_conditions(), &[Condition::eq("visible", true)]);
        assert_eq!(query.where_conditions(), &[Condition::eq("kind", "label")]);
        assert_eq!(query.via_association().map(|v| v.table.as_str()), Some("order_tags"));
    }

    #[test]
    fn refine_cannot_drop_on_condition() {
        let spec = RelationSpec::from_config(
            "items",
            RelationConfig::has_many("items", [("order_id", "id")])
                .on_condition(Condition::eq("archived", false))
                .refine(|q| {
                    q.clear_where().and_where(Condition::eq("kind", "gift"));
                }),
        )
        .unwrap();
        let query = build_query(&owner(), &spec);
        assert_eq!(query.on_conditions().len(), 1);
        assert_eq!(query.where_conditions(), &[Condition::eq("kind", "gift")]);
    }

    #[test]
    fn building_is_repeatable() {
        let spec = RelationSpec::from_config(
            "customer",
            RelationConfig::has_one("customers", [("id", "customer_id")]),
        )
        .unwrap();
        let owner = owner();
        assert_eq!(build_query(&owner, &spec), build_query(&owner, &spec));
    }
}

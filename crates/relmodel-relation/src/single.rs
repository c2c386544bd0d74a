//! To-one cascade: validate, save and copy the target's key onto the owner.

use relmodel_core::{Connection, Entity, EntityRef, Error, RelationErrorKind, Result, Value};

use crate::builder::build_query;
use crate::spec::RelationSpec;
use crate::transaction::TransactionCoordinator;

/// Persist one staged to-one value inside the open cascade transaction.
///
/// Returns `Ok(false)` when the target failed validation: its errors are
/// copied onto the owner as `relation.field` and the transaction is rolled
/// back. Storage failures and unlinkable keys roll back and return `Err`.
#[tracing::instrument(level = "debug", skip_all, fields(relation = %spec.name()))]
pub fn save_single(
    conn: &dyn Connection,
    owner: &mut dyn Entity,
    spec: &RelationSpec,
    value: Option<&EntityRef>,
    tx: &mut TransactionCoordinator,
) -> Result<bool> {
    // An earlier relation already failed.
    if owner.has_errors() {
        tracing::debug!("owner has errors, skipping relation");
        return Ok(true);
    }

    let Some(target) = value else {
        if !owner.is_new() {
            detach_current(conn, owner, spec).map_err(|e| tx.abort(e))?;
        }
        return Ok(true);
    };

    let mut target = target.write();
    if !target.validate() {
        tracing::debug!(errors = target.errors().len(), "related entity failed validation");
        owner.errors_mut().merge_prefixed(spec.name(), target.errors());
        tx.rollback()?;
        return Ok(false);
    }

    match conn.save(&mut *target, false) {
        Ok(true) => {}
        Ok(false) => {
            return Err(tx.abort(Error::relation(
                RelationErrorKind::SaveFailed,
                spec.name(),
                format!("error at saving `{}`", spec.name()),
            )));
        }
        Err(e) => return Err(tx.abort(e)),
    }

    for (target_attr, owner_attr) in spec.link() {
        let key = target.get(target_attr);
        if key.is_null() {
            return Err(tx.abort(Error::relation(
                RelationErrorKind::MissingKey,
                spec.name(),
                format!(
                    "unable to link models: `{target_attr}` of `{}` is null",
                    target.entity_type()
                ),
            )));
        }
        match owner.get(owner_attr) {
            Value::Array(mut keys) => {
                if !keys.iter().any(|k| k.loose_eq(&key)) {
                    keys.push(key);
                }
                owner.set(owner_attr, Value::Array(keys));
            }
            _ => owner.set(owner_attr, key),
        }
    }
    tracing::debug!("related entity saved and linked");
    Ok(true)
}

/// Unlink whatever target is currently stored for a cleared to-one relation.
fn detach_current(conn: &dyn Connection, owner: &mut dyn Entity, spec: &RelationSpec) -> Result<()> {
    let query = build_query(owner, spec);
    let Some(current) = conn.query(&query)?.into_iter().next() else {
        return Ok(());
    };
    tracing::debug!("unlinking cleared relation");
    let mut current = current.write();
    conn.unlink(&query, owner, &mut *current, false)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::spec::RelationConfig;
    use relmodel_core::AttributeMap;
    use relmodel_memory::{EntitySchema, FailPoint, MemoryConnection, Record, Rule};

    fn conn() -> MemoryConnection {
        MemoryConnection::new()
            .with_schema(EntitySchema::new("orders"))
            .with_schema(EntitySchema::new("customers").rule("name", Rule::Required))
    }

    fn spec() -> RelationSpec {
        RelationSpec::from_config(
            "customer",
            RelationConfig::has_one("customers", [("id", "customer_id")]),
        )
        .unwrap()
    }

    fn customer(conn: &MemoryConnection, name: Option<&str>) -> EntityRef {
        let mut record = conn.create("customers").unwrap();
        if let Some(name) = name {
            record = record.with("name", name);
        }
        EntityRef::new(record)
    }

    fn begun(conn: &MemoryConnection) -> TransactionCoordinator {
        let mut tx = TransactionCoordinator::new();
        tx.begin(conn).unwrap();
        tx
    }

    #[test]
    fn saves_target_and_copies_key() {
        let conn = conn();
        let mut order = conn.create("orders").unwrap();
        let ada = customer(&conn, Some("Ada"));
        let mut tx = begun(&conn);

        assert!(save_single(&conn, &mut order, &spec(), Some(&ada), &mut tx).unwrap());
        assert!(tx.is_active());
        assert_eq!(order.get("customer_id"), Value::BigInt(1));
        assert!(!ada.read().is_new());
        tx.commit().unwrap();
        assert_eq!(conn.count("customers"), 1);
    }

    #[test]
    fn invalid_target_rolls_back_with_prefixed_errors() {
        let conn = conn();
        let mut order = conn.create("orders").unwrap();
        let nameless = customer(&conn, None);
        let mut tx = begun(&conn);

        assert!(!save_single(&conn, &mut order, &spec(), Some(&nameless), &mut tx).unwrap());
        assert!(!tx.is_active());
        assert!(order.errors().has_field("customer.name"));
        assert_eq!(conn.count("customers"), 0);
        assert_eq!(conn.open_transactions(), 0);
    }

    #[test]
    fn skips_when_owner_already_has_errors() {
        let conn = conn();
        let mut order = conn.create("orders").unwrap();
        order.errors_mut().add_custom("other.name", "bad");
        let ada = customer(&conn, Some("Ada"));
        let mut tx = begun(&conn);

        assert!(save_single(&conn, &mut order, &spec(), Some(&ada), &mut tx).unwrap());
        assert_eq!(conn.count("customers"), 0);
        assert!(ada.read().is_new());
    }

    #[test]
    fn storage_failure_is_fatal() {
        let conn = conn();
        conn.fail_on(FailPoint::Save("customers".into()));
        let mut order = conn.create("orders").unwrap();
        let ada = customer(&conn, Some("Ada"));
        let mut tx = begun(&conn);

        let err = save_single(&conn, &mut order, &spec(), Some(&ada), &mut tx).unwrap_err();
        assert!(err.is_fatal());
        assert!(!tx.is_active());
        assert_eq!(conn.open_transactions(), 0);
    }

    #[test]
    fn null_key_after_save_is_fatal() {
        let conn = MemoryConnection::new()
            .with_schema(EntitySchema::new("orders"))
            .with_schema(EntitySchema::new("profiles"));
        let spec = RelationSpec::from_config(
            "profile",
            RelationConfig::has_one("profiles", [("code", "profile_code")]),
        )
        .unwrap();
        let mut order = conn.create("orders").unwrap();
        let profile = EntityRef::new(conn.create("profiles").unwrap());
        let mut tx = begun(&conn);

        let err = save_single(&conn, &mut order, &spec, Some(&profile), &mut tx).unwrap_err();
        assert_eq!(err.relation_kind(), Some(RelationErrorKind::MissingKey));
        assert_eq!(conn.count("profiles"), 0);
    }

    #[test]
    fn appends_to_array_foreign_key() {
        let conn = conn();
        let mut order: Record = conn
            .create("orders")
            .unwrap()
            .with("customer_id", Value::Array(vec![Value::BigInt(7)]));
        let ada = customer(&conn, Some("Ada"));
        let mut tx = begun(&conn);

        assert!(save_single(&conn, &mut order, &spec(), Some(&ada), &mut tx).unwrap());
        assert_eq!(
            order.get("customer_id"),
            Value::Array(vec![Value::BigInt(7), Value::BigInt(1)])
        );
    }

    #[test]
    fn cleared_value_unlinks_current_target() {
        let conn = conn();
        conn.insert(
            "customers",
            [("name".to_string(), Value::from("Ada"))]
                .into_iter()
                .collect::<AttributeMap>(),
        )
        .unwrap();
        let mut order = conn.create("orders").unwrap().with("customer_id", 1i64);
        conn.save(&mut order, false).unwrap();
        let mut tx = begun(&conn);

        assert!(save_single(&conn, &mut order, &spec(), None, &mut tx).unwrap());
        assert_eq!(order.get("customer_id"), Value::Null);
        tx.commit().unwrap();
        assert_eq!(conn.count("customers"), 1);
        let stored = conn.load("orders", &[Value::BigInt(1)]).unwrap().unwrap();
        assert_eq!(stored.get("customer_id"), Value::Null);
    }
}

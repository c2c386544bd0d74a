//! To-many cascade: reconcile the desired set against the linked set.
//!
//! Runs after the owner itself was written, so the owner's key exists. The
//! diff unlinks removed items first, then updates matched items in place,
//! then saves and links new ones. Validation errors are collected for the
//! whole set under `relation.index.field` before anything is decided.

use relmodel_core::{
    AttributeMap, Connection, Entity, EntityRef, Error, RelationErrorKind, Result, Value,
};

use crate::builder::build_query;
use crate::spec::RelationSpec;
use crate::transaction::TransactionCoordinator;

/// A to-many value queued for the post-persist phase.
#[derive(Debug, Clone)]
pub struct DeferredLink {
    pub relation: String,
    pub items: Vec<EntityRef>,
    /// The owner's attributes before its insert; `None` when the owner
    /// already existed.
    pub snapshot: Option<AttributeMap>,
}

/// Counts reported once a diff finishes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DiffSummary {
    pub unlinked: usize,
    pub updated: usize,
    pub linked: usize,
    pub invalid: usize,
}

fn save_failed(spec: &RelationSpec, index: usize) -> Error {
    Error::relation(
        RelationErrorKind::SaveFailed,
        spec.name(),
        format!("error at saving `{}.{index}`", spec.name()),
    )
}

/// Put `owner` back into the state it had before a rolled-back save.
///
/// Attributes written during the save, such as a generated key or a foreign
/// key copied from a to-one target, revert to `snapshot`. Errors are kept.
pub(crate) fn restore_owner(owner: &mut dyn Entity, snapshot: &AttributeMap, is_new: bool) {
    for name in owner.attributes().keys() {
        if !snapshot.contains_key(name) {
            owner.set(name, Value::Null);
        }
    }
    owner.load(snapshot);
    owner.set_new(is_new);
}

/// Validate `item`, copying failures onto the owner under `relation.index`.
fn check_item(owner: &mut dyn Entity, spec: &RelationSpec, index: usize, item: &mut dyn Entity) -> bool {
    if item.validate() {
        return true;
    }
    owner
        .errors_mut()
        .merge_prefixed(&format!("{}.{index}", spec.name()), item.errors());
    false
}

fn save_item(
    conn: &dyn Connection,
    spec: &RelationSpec,
    index: usize,
    item: &mut dyn Entity,
) -> Result<()> {
    if conn.save(item, false)? {
        Ok(())
    } else {
        Err(save_failed(spec, index))
    }
}

/// Run one deferred to-many cascade.
///
/// Returns `Ok(false)` when any item failed validation; the transaction has
/// then been rolled back and the owner reconciled with storage.
#[tracing::instrument(level = "debug", skip_all, fields(relation = %spec.name(), items = deferred.items.len()))]
pub fn save_collection(
    conn: &dyn Connection,
    owner: &mut dyn Entity,
    spec: &RelationSpec,
    deferred: DeferredLink,
    tx: &mut TransactionCoordinator,
) -> Result<bool> {
    if !tx.is_active() {
        tracing::debug!("transaction already rolled back, skipping relation");
        return Ok(true);
    }

    let summary = match diff(conn, owner, spec, deferred.items) {
        Ok(summary) => summary,
        Err(e) => return Err(tx.abort(e)),
    };

    if summary.invalid > 0 {
        tracing::debug!(invalid = summary.invalid, "related items failed validation");
        tx.rollback()?;
        match &deferred.snapshot {
            // The owner's own insert was undone with the transaction.
            Some(snapshot) => restore_owner(owner, snapshot, true),
            None => {
                conn.refresh(owner)?;
            }
        }
        return Ok(false);
    }

    tracing::info!(
        relation = spec.name(),
        unlinked = summary.unlinked,
        updated = summary.updated,
        linked = summary.linked,
        "relation reconciled"
    );
    Ok(true)
}

fn diff(
    conn: &dyn Connection,
    owner: &mut dyn Entity,
    spec: &RelationSpec,
    items: Vec<EntityRef>,
) -> Result<DiffSummary> {
    let delete = spec.on_remove().deletes();
    let mut summary = DiffSummary::default();

    if items.is_empty() {
        let query = build_query(owner, spec);
        let current = conn.query(&query)?.len();
        conn.unlink_all(&query, owner, delete)?;
        summary.unlinked = current;
        tracing::info!(relation = spec.name(), unlinked = current, "relation detached");
        return Ok(summary);
    }

    if spec.is_direct() {
        for item in &items {
            let mut item = item.write();
            for (target_attr, owner_attr) in spec.link() {
                item.set(target_attr, owner.get(owner_attr));
            }
        }
    }

    let query = build_query(owner, spec);
    let mut pending: Vec<(usize, EntityRef)> = items.into_iter().enumerate().collect();

    for existing in conn.query(&query)? {
        let matched = pending
            .iter()
            .position(|(_, item)| item.equals(&existing));
        match matched {
            None => {
                let mut existing = existing.write();
                conn.unlink(&query, owner, &mut *existing, delete)?;
                summary.unlinked += 1;
            }
            Some(pos) => {
                let (index, item) = pending.remove(pos);
                let mut item = item.write();
                if check_item(owner, spec, index, &mut *item) {
                    save_item(conn, spec, index, &mut *item)?;
                    summary.updated += 1;
                } else {
                    summary.invalid += 1;
                }
            }
        }
    }

    for (index, item) in pending {
        let mut item = item.write();
        if check_item(owner, spec, index, &mut *item) {
            save_item(conn, spec, index, &mut *item)?;
        } else {
            summary.invalid += 1;
        }
        if !owner.has_errors() {
            conn.link(&query, owner, &mut *item, spec.extra_columns())?;
            summary.linked += 1;
        }
    }

    Ok(summary)
}

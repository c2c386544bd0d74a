//! Relation persistence for relmodel.
//!
//! Relations are declared once per owner type. Assigning a relation stages
//! the related entities on the owner; saving the owner persists them in the
//! same transaction:
//!
//! - to-one values are validated and saved before the owner, and their key is
//!   copied onto the owner's foreign key
//! - to-many values are reconciled after the owner is written: removed items
//!   are unlinked, kept items updated in place, new items saved and linked
//!
//! Validation failures of related entities land on the owner under
//! `relation.field` (or `relation.index.field`) and make the save return
//! `false`. Storage failures roll back and propagate as errors.
//!
//! ```ignore
//! let behavior = RelationBehavior::from_configs([
//!     ("customer", RelationConfig::has_one("customers", [("id", "customer_id")])),
//!     ("items", RelationConfig::has_many("items", [("order_id", "id")])),
//! ])?;
//! let mut order = Owner::new(conn.create("orders")?, behavior, Arc::new(conn.clone()));
//! order.write("customer", json!({"name": "Ada"}))?;
//! order.write("items", json!([{"sku": "A"}, {"sku": "B"}]))?;
//! assert!(order.save(true)?);
//! ```

pub mod behavior;
pub mod builder;
pub mod collection;
pub mod dispatch;
pub mod owner;
pub mod registry;
pub mod single;
pub mod spec;
pub mod staged;
pub mod transaction;

pub use behavior::RelationBehavior;
pub use builder::build_query;
pub use collection::{DeferredLink, DiffSummary, save_collection};
pub use dispatch::SaveCycle;
pub use owner::{Owner, Property, RelationHandle};
pub use registry::{Accessor, AccessorMode, RelationRegistry};
pub use single::save_single;
pub use spec::{Filter, Lookup, LookupFn, OnRemove, RefineFn, RelationConfig, RelationSpec};
pub use staged::StagedValues;
pub use transaction::TransactionCoordinator;

//! Persist lifecycle hooks.
//!
//! [`save_with_hooks`] is the lifecycle driver: it validates the entity, runs
//! the pre-insert/pre-update hook, saves the entity itself and then runs the
//! post-insert/post-update hook. Hook implementations never dispatch events
//! themselves; they are called in this fixed order.

use crate::connection::Connection;
use crate::entity::Entity;
use crate::error::Result;

/// Which kind of write a save cycle performs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PersistEvent {
    Insert,
    Update,
}

impl PersistEvent {
    /// The event for saving `entity` in its current state.
    pub fn for_entity(entity: &dyn Entity) -> Self {
        if entity.is_new() {
            PersistEvent::Insert
        } else {
            PersistEvent::Update
        }
    }

    pub const fn as_str(self) -> &'static str {
        match self {
            PersistEvent::Insert => "insert",
            PersistEvent::Update => "update",
        }
    }
}

/// Callbacks around an entity's own save.
///
/// All methods default to no-ops that let the save proceed.
pub trait PersistHooks {
    /// Called before the entity is written. Returning `Ok(false)` marks the
    /// save invalid; the entity is then not written.
    #[allow(unused_variables)]
    fn before_persist(
        &mut self,
        conn: &dyn Connection,
        entity: &mut dyn Entity,
        event: PersistEvent,
    ) -> Result<bool> {
        Ok(true)
    }

    /// Called after the entity was written. Returning `Ok(false)` reports the
    /// save as failed even though the entity's own write succeeded.
    #[allow(unused_variables)]
    fn after_persist(
        &mut self,
        conn: &dyn Connection,
        entity: &mut dyn Entity,
        event: PersistEvent,
    ) -> Result<bool> {
        Ok(true)
    }

    /// Called when `before_persist` succeeded but the entity's own write did not.
    #[allow(unused_variables)]
    fn persist_aborted(
        &mut self,
        conn: &dyn Connection,
        entity: &mut dyn Entity,
        event: PersistEvent,
    ) -> Result<()> {
        Ok(())
    }
}

/// Hooks that do nothing.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoHooks;

impl PersistHooks for NoHooks {}

/// Save `entity` through `conn`, running `hooks` around the write.
///
/// Returns `Ok(false)` when validation failed (on the entity itself or as
/// reported by a hook); the entity's error list says why.
#[tracing::instrument(level = "debug", skip(conn, entity, hooks), fields(entity_type = %entity.entity_type()))]
pub fn save_with_hooks(
    conn: &dyn Connection,
    entity: &mut dyn Entity,
    hooks: &mut dyn PersistHooks,
    run_validation: bool,
) -> Result<bool> {
    if run_validation && !entity.validate() {
        tracing::debug!(errors = entity.errors().len(), "entity validation failed");
        return Ok(false);
    }

    let event = PersistEvent::for_entity(entity);
    if !hooks.before_persist(conn, entity, event)? {
        tracing::debug!(event = event.as_str(), "before-persist hook marked save invalid");
        return Ok(false);
    }

    let saved = match conn.save(entity, false) {
        Ok(saved) => saved,
        Err(e) => {
            hooks.persist_aborted(conn, entity, event)?;
            return Err(e);
        }
    };
    if !saved {
        hooks.persist_aborted(conn, entity, event)?;
        return Ok(false);
    }

    hooks.after_persist(conn, entity, event)
}

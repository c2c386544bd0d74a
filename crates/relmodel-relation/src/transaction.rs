//! Transaction coordinator: at most one cascade transaction per save cycle.

use std::fmt;

use relmodel_core::{Connection, Error, Result, TransactionOps};

/// Owns the single open cascade transaction, if any.
///
/// `commit` and `rollback` are no-ops when nothing is open, so repeated calls
/// are harmless. Dropping a coordinator with an open transaction rolls it back.
#[derive(Default)]
pub struct TransactionCoordinator {
    current: Option<Box<dyn TransactionOps>>,
}

impl TransactionCoordinator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start a fresh transaction, rolling back a stale one first.
    pub fn begin(&mut self, conn: &dyn Connection) -> Result<()> {
        if let Some(stale) = self.current.take() {
            tracing::warn!("rolling back stale cascade transaction before begin");
            stale.rollback()?;
        }
        self.current = Some(conn.begin()?);
        tracing::debug!("cascade transaction begun");
        Ok(())
    }

    pub fn commit(&mut self) -> Result<()> {
        match self.current.take() {
            Some(tx) => {
                tx.commit()?;
                tracing::debug!("cascade transaction committed");
                Ok(())
            }
            None => Ok(()),
        }
    }

    pub fn rollback(&mut self) -> Result<()> {
        match self.current.take() {
            Some(tx) => {
                tx.rollback()?;
                tracing::debug!("cascade transaction rolled back");
                Ok(())
            }
            None => Ok(()),
        }
    }

    /// Roll back and hand back `err`. A rollback failure is logged, not returned,
    /// so the caller sees the error that caused the abort.
    pub fn abort(&mut self, err: Error) -> Error {
        if let Err(rollback_err) = self.rollback() {
            tracing::error!(error = %rollback_err, cause = %err, "rollback after fatal cascade error failed");
        }
        err
    }

    pub fn is_active(&self) -> bool {
        self.current.is_some()
    }
}

impl fmt::Debug for TransactionCoordinator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TransactionCoordinator")
            .field("active", &self.is_active())
            .finish()
    }
}

impl Drop for TransactionCoordinator {
    fn drop(&mut self) {
        if let Some(tx) = self.current.take() {
            tracing::warn!("dropping open cascade transaction; rolling back");
            if let Err(e) = tx.rollback() {
                tracing::warn!(error = %e, "dropped cascade transaction could not roll back");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use relmodel_core::{AttributeMap, TransactionErrorKind};
    use relmodel_memory::{EntitySchema, FailPoint, MemoryConnection, Operation};

    fn conn() -> MemoryConnection {
        MemoryConnection::new().with_schema(EntitySchema::new("orders"))
    }

    #[test]
    fn commit_and_rollback_are_idempotent() {
        let conn = conn();
        let mut tx = TransactionCoordinator::new();
        tx.commit().unwrap();
        tx.rollback().unwrap();

        tx.begin(&conn).unwrap();
        assert!(tx.is_active());
        tx.commit().unwrap();
        tx.commit().unwrap();
        tx.rollback().unwrap();
        assert!(!tx.is_active());
        assert_eq!(
            conn.journal(),
            [Operation::Begin, Operation::Commit]
        );
    }

    #[test]
    fn begin_rolls_back_stale_transaction() {
        let conn = conn();
        let mut tx = TransactionCoordinator::new();
        tx.begin(&conn).unwrap();
        conn.insert("orders", AttributeMap::new()).unwrap();
        tx.begin(&conn).unwrap();

        assert_eq!(conn.max_open_transactions(), 1);
        assert_eq!(conn.open_transactions(), 1);
        assert_eq!(conn.count("orders"), 0);
        tx.rollback().unwrap();
        assert_eq!(conn.open_transactions(), 0);
    }

    #[test]
    fn drop_rolls_back() {
        let conn = conn();
        {
            let mut tx = TransactionCoordinator::new();
            tx.begin(&conn).unwrap();
            conn.insert("orders", AttributeMap::new()).unwrap();
        }
        assert_eq!(conn.count("orders"), 0);
        assert_eq!(conn.open_transactions(), 0);
    }

    #[test]
    fn abort_returns_cause() {
        let conn = conn();
        let mut tx = TransactionCoordinator::new();
        tx.begin(&conn).unwrap();
        let err = tx.abort(Error::Custom("boom".into()));
        assert!(matches!(err, Error::Custom(ref m) if m == "boom"));
        assert!(!tx.is_active());
        assert_eq!(conn.open_transactions(), 0);
    }

    #[test]
    fn rollback_failure_propagates() {
        let conn = conn();
        let mut tx = TransactionCoordinator::new();
        tx.begin(&conn).unwrap();
        conn.fail_on(FailPoint::Rollback);
        let err = tx.rollback().unwrap_err();
        assert!(matches!(
            err,
            Error::Transaction(ref t) if t.kind == TransactionErrorKind::Rollback
        ));
        assert!(!tx.is_active());
        assert_eq!(conn.open_transactions(), 0);
    }

    #[test]
    fn abort_keeps_cause_when_rollback_fails() {
        let conn = conn();
        let mut tx = TransactionCoordinator::new();
        tx.begin(&conn).unwrap();
        conn.fail_on(FailPoint::Rollback);
        let err = tx.abort(Error::Custom("boom".into()));
        assert!(matches!(err, Error::Custom(ref m) if m == "boom"));
        assert!(!tx.is_active());
    }

    #[test]
    fn begin_failure_leaves_nothing_open() {
        let conn = conn();
        conn.fail_on(FailPoint::Begin);
        let mut tx = TransactionCoordinator::new();
        let err = tx.begin(&conn).unwrap_err();
        assert!(matches!(
            err,
            Error::Transaction(ref t) if t.kind == TransactionErrorKind::Begin
        ));
        assert!(!tx.is_active());
    }

    #[test]
    fn commit_failure_propagates() {
        let conn = conn();
        let mut tx = TransactionCoordinator::new();
        tx.begin(&conn).unwrap();
        conn.fail_on(FailPoint::Commit);
        let err = tx.commit().unwrap_err();
        assert!(matches!(
            err,
            Error::Transaction(ref t) if t.kind == TransactionErrorKind::Commit
        ));
        assert!(!tx.is_active());
    }
}

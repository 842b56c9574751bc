// ============================================================================
// Database Context Collaborator Interface
// ============================================================================
//
// The scope engine never talks to a database directly. It drives an
// object mapper's unit-of-work handle through the traits below:
//
// - DbContextFactory: creates one handle per unit of work
// - DbContext:        transaction control, saving, connection reset
// - ContextInterceptor: lifecycle hooks the handle must invoke
//
// A handle must support several interceptors at once and call every one of
// them, in registration order, at each hook point.
//
// ============================================================================

use crate::core::{DbError, EntityState, IsolationLevel, Result, TransactionId};
use async_trait::async_trait;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// Creates database context handles
pub trait DbContextFactory<C>: Send + Sync {
    fn create_db_context(&self) -> Result<C>;
}

impl<C, F> DbContextFactory<C> for F
where
    F: Fn() -> Result<C> + Send + Sync,
{
    fn create_db_context(&self) -> Result<C> {
        self()
    }
}

/// Read-only view of a context's state, handed to interceptors
pub trait ContextProbe: Send + Sync {
    /// The transaction the context's commands are currently enlisted in
    fn current_transaction(&self) -> Option<TransactionId>;

    /// Whether saving would write anything, including implicit modifications
    fn has_pending_changes(&self) -> bool;
}

/// A unit-of-work handle of an object mapper
#[async_trait]
pub trait DbContext: ContextProbe + 'static {
    /// Begin a transaction; fails if one is already active
    fn begin_transaction(&self, isolation_level: Option<IsolationLevel>) -> Result<TransactionId>;

    /// Commit the current transaction
    fn commit_transaction(&self) -> Result<()>;

    /// Roll back the current transaction
    fn rollback_transaction(&self) -> Result<()>;

    /// Write all pending changes, returning the number of affected entities
    fn save_changes(&self) -> Result<usize>;

    /// Forget every tracked entity
    fn clear_tracked_state(&self);

    /// Close the underlying connection, discarding any open transaction.
    /// The connection reopens on next use.
    fn close_connection(&self) -> Result<()>;

    fn add_interceptor(&self, interceptor: Arc<dyn ContextInterceptor>) -> Result<()>;

    fn remove_interceptor(&self, interceptor: &Arc<dyn ContextInterceptor>) -> Result<()>;

    fn has_active_transaction(&self) -> bool {
        self.current_transaction().is_some()
    }

    /// Fails with [`DbError::Cancelled`] once `cancellation` fires. Only
    /// rollback ignores cancellation.
    async fn begin_transaction_async(
        &self,
        isolation_level: Option<IsolationLevel>,
        cancellation: &CancellationToken,
    ) -> Result<TransactionId> {
        ensure_not_cancelled(cancellation)?;
        self.begin_transaction(isolation_level)
    }

    async fn commit_transaction_async(&self, cancellation: &CancellationToken) -> Result<()> {
        ensure_not_cancelled(cancellation)?;
        self.commit_transaction()
    }

    async fn rollback_transaction_async(&self, _cancellation: &CancellationToken) -> Result<()> {
        self.rollback_transaction()
    }

    async fn save_changes_async(&self, cancellation: &CancellationToken) -> Result<usize> {
        ensure_not_cancelled(cancellation)?;
        self.save_changes()
    }

    async fn close_connection_async(&self) -> Result<()> {
        self.close_connection()
    }
}

pub(crate) fn ensure_not_cancelled(cancellation: &CancellationToken) -> Result<()> {
    if cancellation.is_cancelled() {
        return Err(DbError::Cancelled);
    }
    Ok(())
}

/// Which transaction operation failed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionAction {
    Begin,
    Commit,
    Rollback,
}

/// What the context must do with a command after `non_query_executing`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandEnlistment {
    /// The command stays in the transaction it was created for
    Unchanged,
    /// A transaction was started by the hook; enlist the command in it
    Reenlist,
}

/// Hooks into a context's save, command and transaction lifecycle.
///
/// Every method has a no-op default, so implementors only override the
/// hook points they care about. Returning an error from a `*ing` hook
/// prevents the operation.
#[async_trait]
pub trait ContextInterceptor: Send + Sync {
    fn transaction_starting(&self) -> Result<()> {
        Ok(())
    }

    /// Called with the error of a failed transaction operation. The
    /// returned error is the one the context surfaces.
    fn transaction_failed(&self, _action: TransactionAction, error: DbError) -> DbError {
        error
    }

    fn command_creating(&self) -> Result<()> {
        Ok(())
    }

    /// A query is about to read data
    fn reader_executing(&self, _context: &dyn ContextProbe) -> Result<()> {
        Ok(())
    }

    async fn reader_executing_async(
        &self,
        context: &dyn ContextProbe,
        _cancellation: &CancellationToken,
    ) -> Result<()> {
        self.reader_executing(context)
    }

    /// A raw command that is not part of a save is about to run
    fn non_query_executing(&self, _context: &dyn ContextProbe) -> Result<CommandEnlistment> {
        Ok(CommandEnlistment::Unchanged)
    }

    async fn non_query_executing_async(
        &self,
        context: &dyn ContextProbe,
        _cancellation: &CancellationToken,
    ) -> Result<CommandEnlistment> {
        self.non_query_executing(context)
    }

    fn saving_changes(&self) -> Result<()> {
        Ok(())
    }

    async fn saving_changes_async(&self, _cancellation: &CancellationToken) -> Result<()> {
        self.saving_changes()
    }

    fn saved_changes(&self, _affected: usize) {}

    fn save_changes_failed(&self) {}

    /// An entity started being tracked, by a query or by an explicit add
    fn entity_tracked(&self, _from_query: bool) {}

    /// An explicit call changed an entity's state
    fn entity_state_changed(&self, _state: EntityState) {}
}

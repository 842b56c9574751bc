// Transaction control of a unit of work.
//
// Each operation checks its precondition, takes the exclusive lock and
// checks again, so a second caller observes the first caller's work
// instead of repeating it. The context is always resolved before locking.

use super::unit_of_work::UnitOfWork;
use crate::ambient::ExternalTransactionScope;
use crate::context::DbContext;
use crate::core::Result;
use log::debug;
use tokio_util::sync::CancellationToken;

impl<C: DbContext> UnitOfWork<C> {
    /// Begins a transaction unless one is already active.
    ///
    /// Returns whether a transaction was started.
    pub fn try_start_transaction(&self) -> Result<bool> {
        let context = self.db_context()?;
        if context.has_active_transaction() {
            return Ok(false);
        }

        let _guard = self.lock.acquire()?;
        if context.has_active_transaction() {
            return Ok(false);
        }

        ExternalTransactionScope::ensure_inactive()?;

        let isolation_level = self.isolation_level()?;
        let id = context.begin_transaction(isolation_level)?;
        debug!("Started transaction {} (isolation: {:?})", id, isolation_level);
        Ok(true)
    }

    pub async fn try_start_transaction_async(
        &self,
        cancellation: &CancellationToken,
    ) -> Result<bool> {
        let context = self.db_context()?;
        if context.has_active_transaction() {
            return Ok(false);
        }

        let _guard = self.lock.acquire()?;
        if context.has_active_transaction() {
            return Ok(false);
        }

        ExternalTransactionScope::ensure_inactive()?;

        let isolation_level = self.isolation_level()?;
        let id = context
            .begin_transaction_async(isolation_level, cancellation)
            .await?;
        debug!("Started transaction {} (isolation: {:?})", id, isolation_level);
        Ok(true)
    }

    /// Commits the active transaction, if any.
    ///
    /// Returns whether a transaction was committed.
    pub fn try_commit_transaction(&self) -> Result<bool> {
        let context = self.db_context()?;
        if !context.has_active_transaction() {
            return Ok(false);
        }

        let _guard = self.lock.acquire()?;
        let Some(id) = context.current_transaction() else {
            return Ok(false);
        };

        context.commit_transaction()?;
        debug!("Committed transaction {}", id);
        Ok(true)
    }

    /// A cancelled commit fails with [`DbError::Cancelled`](crate::DbError::Cancelled)
    /// and leaves the transaction active.
    pub async fn try_commit_transaction_async(
        &self,
        cancellation: &CancellationToken,
    ) -> Result<bool> {
        let context = self.db_context()?;
        if !context.has_active_transaction() {
            return Ok(false);
        }

        let _guard = self.lock.acquire()?;
        let Some(id) = context.current_transaction() else {
            return Ok(false);
        };

        context.commit_transaction_async(cancellation).await?;
        debug!("Committed transaction {}", id);
        Ok(true)
    }

    /// Rolls back the active transaction, if any.
    ///
    /// Returns whether a transaction was rolled back.
    pub fn try_rollback_transaction(&self) -> Result<bool> {
        let context = self.db_context()?;
        if !context.has_active_transaction() {
            return Ok(false);
        }

        let _guard = self.lock.acquire()?;
        let Some(id) = context.current_transaction() else {
            return Ok(false);
        };

        context.rollback_transaction()?;
        debug!("Rolled back transaction {}", id);
        Ok(true)
    }

    pub async fn try_rollback_transaction_async(
        &self,
        cancellation: &CancellationToken,
    ) -> Result<bool> {
        let context = self.db_context()?;
        if !context.has_active_transaction() {
            return Ok(false);
        }

        let _guard = self.lock.acquire()?;
        let Some(id) = context.current_transaction() else {
            return Ok(false);
        };

        context.rollback_transaction_async(cancellation).await?;
        debug!("Rolled back transaction {}", id);
        Ok(true)
    }

    /// Rolls back the active transaction, if any, and invalidates the unit
    /// of work: every later transaction start or command fails with
    /// [`DbError::TransactionAborted`](crate::DbError::TransactionAborted)
    /// until [`undo_invalidation`](Self::undo_invalidation) is called.
    pub fn try_rollback_transaction_and_invalidate(&self) -> Result<bool> {
        self.invalidate()?;
        self.try_rollback_transaction()
    }

    pub async fn try_rollback_transaction_and_invalidate_async(
        &self,
        cancellation: &CancellationToken,
    ) -> Result<bool> {
        self.invalidate()?;
        self.try_rollback_transaction_async(cancellation).await
    }
}

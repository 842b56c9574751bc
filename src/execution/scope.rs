use crate::context::DbContext;
use crate::core::{IsolationLevel, Result};
use crate::scope::UnitOfWork;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio_util::sync::CancellationToken;

/// Handle passed to work run through scoped execution.
///
/// A fresh one is created for every attempt. Cloning is cheap and every
/// clone refers to the same attempt.
pub struct ExecutionScope<C: DbContext, S = ()> {
    inner: Arc<Inner<C, S>>,
}

struct Inner<C: DbContext, S> {
    unit_of_work: Arc<UnitOfWork<C>>,
    db_context: Arc<C>,
    is_nested: bool,
    state: S,
    cancellation: CancellationToken,
    completed: AtomicBool,
    disposed: AtomicBool,
}

impl<C: DbContext, S> Clone for ExecutionScope<C, S> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<C: DbContext, S> ExecutionScope<C, S> {
    pub(crate) fn new(
        unit_of_work: Arc<UnitOfWork<C>>,
        db_context: Arc<C>,
        is_nested: bool,
        state: S,
        cancellation: CancellationToken,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                unit_of_work,
                db_context,
                is_nested,
                state,
                cancellation,
                completed: AtomicBool::new(true),
                disposed: AtomicBool::new(false),
            }),
        }
    }

    pub fn db_context(&self) -> &C {
        &self.inner.db_context
    }

    pub fn shared_db_context(&self) -> Arc<C> {
        self.inner.db_context.clone()
    }

    pub fn state(&self) -> &S {
        &self.inner.state
    }

    /// Whether this scope joined an enclosing scoped execution
    pub fn is_nested(&self) -> bool {
        self.inner.is_nested
    }

    pub fn cancellation_token(&self) -> &CancellationToken {
        &self.inner.cancellation
    }

    pub fn is_cancelled(&self) -> bool {
        self.inner.cancellation.is_cancelled()
    }

    /// Marks the work as failed. When the scope ends, the transaction is
    /// rolled back and the unit of work invalidated.
    ///
    /// May be called at any time, any number of times; it cannot be undone.
    pub fn abort(&self) {
        self.inner.completed.store(false, Ordering::Release);
    }

    /// Whether the scope will end without rolling back
    pub fn is_completed(&self) -> bool {
        self.inner.completed.load(Ordering::Acquire)
    }

    pub fn isolation_level(&self) -> Result<Option<IsolationLevel>> {
        self.inner.unit_of_work.isolation_level()
    }

    /// Sets the isolation level of the shared unit of work. See
    /// [`UnitOfWork::set_isolation_level`].
    pub fn set_isolation_level(&self, level: Option<IsolationLevel>) -> Result<()> {
        self.inner.unit_of_work.set_isolation_level(level)
    }

    pub(crate) fn unit_of_work(&self) -> &Arc<UnitOfWork<C>> {
        &self.inner.unit_of_work
    }

    fn begin_dispose(&self) -> bool {
        !self.inner.disposed.swap(true, Ordering::AcqRel)
    }

    /// Ends the attempt, rolling back and invalidating if it was aborted
    pub(crate) fn dispose(&self) -> Result<()> {
        if self.begin_dispose() && !self.is_completed() {
            self.inner.unit_of_work.try_rollback_transaction_and_invalidate()?;
        }
        Ok(())
    }

    pub(crate) async fn dispose_async(&self) -> Result<()> {
        if self.begin_dispose() && !self.is_completed() {
            self.inner
                .unit_of_work
                .try_rollback_transaction_and_invalidate_async(&self.inner.cancellation)
                .await?;
        }
        Ok(())
    }
}

impl<C: DbContext, S: fmt::Debug> fmt::Debug for ExecutionScope<C, S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExecutionScope")
            .field("is_nested", &self.inner.is_nested)
            .field("completed", &self.is_completed())
            .field("state", &self.inner.state)
            .finish()
    }
}

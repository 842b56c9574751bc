use super::ScopedExecutor;
use crate::config::DbContextScopeOptions;
use crate::context::DbContext;
use crate::core::{DbError, Result, ScopeOption};
use crate::execution::ExecutionScope;
use crate::scope::{DbContextScope, UnitOfWork};
use log::debug;
use std::future::Future;
use std::marker::PhantomData;
use std::sync::{Arc, Mutex, Weak};
use tokio_util::sync::CancellationToken;

const SIMULATED_CONFLICT: &str = "This is a simulated optimistic concurrency conflict.";

/// Wraps a provider and fails the first execution of every unit of work
/// with a simulated concurrency conflict.
///
/// Used in tests to prove that work survives being retried. With
/// `after_commit` the transaction is committed before the conflict is
/// raised, which exposes work whose effects are not idempotent.
pub struct ConcurrencyConflictProvider<C: DbContext, P: ScopedExecutor<C>> {
    inner: P,
    after_commit: bool,
    last_seen: Mutex<Option<Weak<UnitOfWork<C>>>>,
    _context: PhantomData<fn() -> C>,
}

impl<C: DbContext, P: ScopedExecutor<C>> ConcurrencyConflictProvider<C, P> {
    pub fn new(inner: P) -> Self {
        Self {
            inner,
            after_commit: false,
            last_seen: Mutex::new(None),
            _context: PhantomData,
        }
    }

    /// Commit the transaction before raising the simulated conflict
    pub fn after_commit(mut self, after_commit: bool) -> Self {
        self.after_commit = after_commit;
        self
    }

    pub fn inner(&self) -> &P {
        &self.inner
    }

    /// True the first time a unit of work is seen
    fn should_fail(
        last_seen: &Mutex<Option<Weak<UnitOfWork<C>>>>,
        unit_of_work: &Arc<UnitOfWork<C>>,
    ) -> Result<bool> {
        let current = Arc::downgrade(unit_of_work);
        let mut last_seen = last_seen.lock()?;

        let seen = last_seen
            .as_ref()
            .is_some_and(|previous| Weak::ptr_eq(previous, &current));
        if seen {
            return Ok(false);
        }

        *last_seen = Some(current);
        Ok(true)
    }

    fn conflict(unit_of_work: &UnitOfWork<C>, after_commit: bool) -> Result<DbError> {
        if after_commit {
            unit_of_work.try_commit_transaction()?;
        }
        debug!("Raising simulated concurrency conflict");
        Ok(DbError::ConcurrencyConflict(SIMULATED_CONFLICT.to_string()))
    }
}

impl<C: DbContext, P: ScopedExecutor<C>> ScopedExecutor<C> for ConcurrencyConflictProvider<C, P> {
    fn options(&self) -> &DbContextScopeOptions {
        self.inner.options()
    }

    fn create_scope(&self, option: Option<ScopeOption>) -> Result<DbContextScope<C>> {
        self.inner.create_scope(option)
    }

    fn execute_scoped_with_state<S, T, F>(&self, option: ScopeOption, state: S, mut work: F) -> Result<T>
    where
        S: Clone,
        F: FnMut(ExecutionScope<C, S>) -> Result<T>,
    {
        let after_commit = self.after_commit;
        let last_seen = &self.last_seen;

        self.inner.execute_scoped_with_state(option, state, move |scope| {
            let unit_of_work = scope.unit_of_work().clone();
            let should_fail = Self::should_fail(last_seen, &unit_of_work)?;

            let value = work(scope)?;
            if should_fail {
                return Err(Self::conflict(&unit_of_work, after_commit)?);
            }
            Ok(value)
        })
    }

    fn execute_scoped_async_with_state<S, T, F, Fut>(
        &self,
        option: ScopeOption,
        state: S,
        cancellation: CancellationToken,
        mut work: F,
    ) -> impl Future<Output = Result<T>> + Send
    where
        S: Clone + Send + Sync,
        T: Send,
        F: FnMut(ExecutionScope<C, S>) -> Fut + Send,
        Fut: Future<Output = Result<T>> + Send,
    {
        let after_commit = self.after_commit;
        let last_seen = &self.last_seen;

        self.inner
            .execute_scoped_async_with_state(option, state, cancellation, move |scope| {
                let unit_of_work = scope.unit_of_work().clone();
                let should_fail = Self::should_fail(last_seen, &unit_of_work);
                let cancellation = scope.cancellation_token().clone();
                let pending = work(scope);

                async move {
                    let should_fail = should_fail?;
                    let value = pending.await?;
                    if should_fail {
                        if after_commit {
                            unit_of_work.try_commit_transaction_async(&cancellation).await?;
                        }
                        return Err(Self::conflict(&unit_of_work, false)?);
                    }
                    Ok::<T, DbError>(value)
                }
            })
    }
}

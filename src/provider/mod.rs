// ============================================================================
// Database Context Providers
// ============================================================================
//
// Entry points for application code. `ScopedExecutor` declares the two
// primitive operations (sync and async scoped execution with explicit
// policy and state) and derives the shorter overloads from them.
//
// ============================================================================

mod conflict;

pub use conflict::ConcurrencyConflictProvider;

use crate::config::DbContextScopeOptions;
use crate::context::{DbContext, DbContextFactory};
use crate::core::{DbError, Result, ScopeOption};
use crate::execution::ExecutionScope;
use crate::execution::executor;
use crate::scope::DbContextScope;
use std::future::Future;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// Runs work in database context scopes.
///
/// # Examples
///
/// ```ignore
/// use dbscope::prelude::*;
///
/// let database = MemoryDatabase::new();
/// let provider = DbContextProvider::new(database.clone());
///
/// provider.execute_scoped(|scope| {
///     scope.db_context().add("orders", 1, "pending")?;
///     scope.db_context().save_changes()?;
///     Ok(())
/// })?;
/// ```
pub trait ScopedExecutor<C: DbContext>: Send + Sync {
    fn options(&self) -> &DbContextScopeOptions;

    /// Creates a manually managed scope. `None` uses the configured default
    /// join policy.
    fn create_scope(&self, option: Option<ScopeOption>) -> Result<DbContextScope<C>>;

    /// Runs `work` in a scope joined or created per `option`.
    ///
    /// A root execution runs in a transaction that starts lazily with the
    /// first write and commits after `work` succeeds without aborting.
    /// Nested executions share the root's transaction.
    fn execute_scoped_with_state<S, T, F>(&self, option: ScopeOption, state: S, work: F) -> Result<T>
    where
        S: Clone,
        F: FnMut(ExecutionScope<C, S>) -> Result<T>;

    fn execute_scoped_async_with_state<S, T, F, Fut>(
        &self,
        option: ScopeOption,
        state: S,
        cancellation: CancellationToken,
        work: F,
    ) -> impl Future<Output = Result<T>> + Send
    where
        S: Clone + Send + Sync,
        T: Send,
        F: FnMut(ExecutionScope<C, S>) -> Fut + Send,
        Fut: Future<Output = Result<T>> + Send;

    fn execute_scoped<T, F>(&self, work: F) -> Result<T>
    where
        F: FnMut(ExecutionScope<C>) -> Result<T>,
    {
        self.execute_scoped_with_state(self.options().default_scope_option, (), work)
    }

    fn execute_scoped_with_option<T, F>(&self, option: ScopeOption, work: F) -> Result<T>
    where
        F: FnMut(ExecutionScope<C>) -> Result<T>,
    {
        self.execute_scoped_with_state(option, (), work)
    }

    fn execute_scoped_async<T, F, Fut>(&self, work: F) -> impl Future<Output = Result<T>> + Send
    where
        T: Send,
        F: FnMut(ExecutionScope<C>) -> Fut + Send,
        Fut: Future<Output = Result<T>> + Send,
    {
        self.execute_scoped_async_with_state(
            self.options().default_scope_option,
            (),
            CancellationToken::new(),
            work,
        )
    }

    fn execute_scoped_async_with_option<T, F, Fut>(
        &self,
        option: ScopeOption,
        work: F,
    ) -> impl Future<Output = Result<T>> + Send
    where
        T: Send,
        F: FnMut(ExecutionScope<C>) -> Fut + Send,
        Fut: Future<Output = Result<T>> + Send,
    {
        self.execute_scoped_async_with_state(option, (), CancellationToken::new(), work)
    }
}

/// Provides scopes over contexts created by a [`DbContextFactory`]
pub struct DbContextProvider<C: DbContext> {
    factory: Arc<dyn DbContextFactory<C>>,
    options: Arc<DbContextScopeOptions>,
}

impl<C: DbContext> Clone for DbContextProvider<C> {
    fn clone(&self) -> Self {
        Self {
            factory: self.factory.clone(),
            options: self.options.clone(),
        }
    }
}

impl<C: DbContext> DbContextProvider<C> {
    /// Create a provider with default options
    pub fn new(factory: impl DbContextFactory<C> + 'static) -> Self {
        Self {
            factory: Arc::new(factory),
            options: Arc::new(DbContextScopeOptions::default()),
        }
    }

    /// Create a provider with the given options
    ///
    /// # Errors
    /// Returns error if the options are invalid
    pub fn with_options(
        factory: impl DbContextFactory<C> + 'static,
        options: DbContextScopeOptions,
    ) -> Result<Self> {
        options
            .validate()
            .map_err(|msg| DbError::InvalidOperation(format!("Invalid scope options: {}", msg)))?;

        Ok(Self {
            factory: Arc::new(factory),
            options: Arc::new(options),
        })
    }
}

impl<C: DbContext> ScopedExecutor<C> for DbContextProvider<C> {
    fn options(&self) -> &DbContextScopeOptions {
        &self.options
    }

    fn create_scope(&self, option: Option<ScopeOption>) -> Result<DbContextScope<C>> {
        let option = option.unwrap_or(self.options.default_scope_option);
        DbContextScope::create(&self.factory, &self.options, option)
    }

    fn execute_scoped_with_state<S, T, F>(&self, option: ScopeOption, state: S, work: F) -> Result<T>
    where
        S: Clone,
        F: FnMut(ExecutionScope<C, S>) -> Result<T>,
    {
        executor::execute_scoped(self, option, state, work)
    }

    fn execute_scoped_async_with_state<S, T, F, Fut>(
        &self,
        option: ScopeOption,
        state: S,
        cancellation: CancellationToken,
        work: F,
    ) -> impl Future<Output = Result<T>> + Send
    where
        S: Clone + Send + Sync,
        T: Send,
        F: FnMut(ExecutionScope<C, S>) -> Fut + Send,
        Fut: Future<Output = Result<T>> + Send,
    {
        executor::execute_scoped_async(self, option, state, cancellation, work)
    }
}

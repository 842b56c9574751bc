// ============================================================================
// dbscope Library
// ============================================================================
//
// Scoped execution of database work over an object mapper's unit-of-work
// handles:
//
// - ambient scopes that nested code joins implicitly
// - lazily started transactions committed by the outermost scope
// - save-before-query (auto-flush) while scoped execution drives a context
// - retries on optimistic concurrency conflicts and transient faults
//
// ============================================================================

//! Scoped execution and unit-of-work management for database contexts.
//!
//! ```ignore
//! use dbscope::prelude::*;
//!
//! let database = MemoryDatabase::new();
//! let options = DbContextScopeOptions::new().retry_on_optimistic_concurrency_failure(true);
//! let provider = DbContextProvider::with_options(database.clone(), options)?;
//!
//! provider.execute_scoped(|scope| {
//!     let context = scope.db_context();
//!     context.add("orders", 1, "pending")?;
//!     context.save_changes()?;
//!     Ok(())
//! })?;
//! ```

pub mod accessor;
pub mod ambient;
pub mod config;
pub mod context;
pub mod core;
pub mod execution;
pub mod memory;
pub mod observer;
pub mod prelude;
pub mod provider;
pub mod scope;

// Re-export main types for convenience
pub use accessor::{AmbientDbContextAccessor, DbContextAccessor, FixedDbContextAccessor};
pub use ambient::{AmbientContext, ExternalTransactionScope};
pub use config::{AutoFlushMode, DbContextScopeOptions, ExecutionStrategyOptions, TransientRetryPolicy};
pub use context::{
    CommandEnlistment, ContextInterceptor, ContextProbe, DbContext, DbContextFactory,
    TransactionAction,
};
pub use core::{DbError, EntityState, IsolationLevel, Result, ScopeOption, TransactionId, Value};
pub use execution::{ExecutionScope, ExecutionStrategy, RetryOnConflictStrategy};
pub use provider::{ConcurrencyConflictProvider, DbContextProvider, ScopedExecutor};
pub use scope::{DbContextScope, UnitOfWork, UnitOfWorkMode};

//! Everything needed to run scoped work, in one import.
//!
//! Bringing [`ScopedExecutor`] and [`DbContext`] into scope makes the
//! execute overloads and the context's save methods callable.

pub use crate::accessor::{AmbientDbContextAccessor, DbContextAccessor, FixedDbContextAccessor};
pub use crate::config::{AutoFlushMode, DbContextScopeOptions, TransientRetryPolicy};
pub use crate::context::{ContextProbe, DbContext, DbContextFactory};
pub use crate::core::{DbError, IsolationLevel, Result, ScopeOption, Value};
pub use crate::execution::ExecutionScope;
pub use crate::memory::{Change, CommitFailure, MemoryContext, MemoryDatabase};
pub use crate::provider::{ConcurrencyConflictProvider, DbContextProvider, ScopedExecutor};
pub use crate::scope::DbContextScope;
pub use tokio_util::sync::CancellationToken;

// ============================================================================
// Scoped Execution
// ============================================================================
//
// Root execution:
//
//   create/join scope ─> promote unit of work ─> attach observer
//        │
//        └─> strategy ─┬─> attempt: new ExecutionScope ─> work ─> dispose
//                      │            └─ completed? commit
//                      └─< on failure: clear tracked state, close
//                          connection, undo invalidation, rethrow
//
// Nested execution runs the work once inside the root's unit of work and
// leaves the commit decision to the root. Scope disposal always runs.
//
// ============================================================================

use super::ExecutionScope;
use super::retry::RetryOnConflictStrategy;
use super::strategy::{DefaultExecutionStrategy, ExecutionStrategy};
use crate::ambient::{self, ExternalTransactionScope};
use crate::config::DbContextScopeOptions;
use crate::context::DbContext;
use crate::core::{DbError, Result, ScopeOption};
use crate::provider::{DbContextProvider, ScopedExecutor};
use crate::scope::{DbContextScope, UnitOfWork, UnitOfWorkMode};
use log::{debug, warn};
use std::future::Future;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug_span};

pub(crate) fn execute_scoped<C, S, T, F>(
    provider: &DbContextProvider<C>,
    option: ScopeOption,
    state: S,
    mut work: F,
) -> Result<T>
where
    C: DbContext,
    S: Clone,
    F: FnMut(ExecutionScope<C, S>) -> Result<T>,
{
    ExternalTransactionScope::ensure_inactive()?;

    let scope = provider.create_scope(Some(option))?;
    let span = debug_span!("scoped_execution", nested = !scope.is_root_scope());
    let _entered = span.enter();

    let outcome = if scope.is_root_scope() {
        execute_root(&scope, provider.options(), state, &mut work)
    } else {
        execute_nested(&scope, state, &mut work)
    };

    settle(outcome, scope.dispose())
}

pub(crate) async fn execute_scoped_async<C, S, T, F, Fut>(
    provider: &DbContextProvider<C>,
    option: ScopeOption,
    state: S,
    cancellation: CancellationToken,
    mut work: F,
) -> Result<T>
where
    C: DbContext,
    S: Clone + Send + Sync,
    T: Send,
    F: FnMut(ExecutionScope<C, S>) -> Fut + Send,
    Fut: Future<Output = Result<T>> + Send,
{
    let execution = async move {
        ExternalTransactionScope::ensure_inactive()?;

        let scope = provider.create_scope(Some(option))?;
        tracing::Span::current().record("nested", !scope.is_root_scope());

        let outcome = if scope.is_root_scope() {
            execute_root_async(&scope, provider.options(), state, &cancellation, &mut work).await
        } else {
            execute_nested_async(&scope, state, &cancellation, &mut work).await
        };

        settle(outcome, scope.dispose_async().await)
    };

    let span = debug_span!("scoped_execution", nested = tracing::field::Empty);
    ambient::flow(execution).instrument(span).await
}

/// Nested execution is only defined inside another scoped execution
fn ensure_scoped_parent<C: DbContext>(unit_of_work: &UnitOfWork<C>) -> Result<()> {
    if unit_of_work.mode()? != UnitOfWorkMode::ScopedExecution {
        return Err(DbError::InvalidOperation(
            "Scoped execution inside a parent scope that does not use scoped execution results in undefined behavior.".to_string(),
        ));
    }
    Ok(())
}

fn prepare_root<C: DbContext>(unit_of_work: &UnitOfWork<C>) -> Result<Arc<C>> {
    unit_of_work.promote_to_mode(UnitOfWorkMode::ScopedExecution)?;
    // Hooks must be attached before any work touches the context
    unit_of_work.observer()?;
    unit_of_work.try_add_auto_flush_behavior()?;
    unit_of_work.db_context()
}

fn execute_nested<C, S, T, F>(scope: &DbContextScope<C>, state: S, work: &mut F) -> Result<T>
where
    C: DbContext,
    F: FnMut(ExecutionScope<C, S>) -> Result<T>,
{
    let unit_of_work = scope.unit_of_work();
    ensure_scoped_parent(unit_of_work)?;

    let execution_scope = ExecutionScope::new(
        unit_of_work.clone(),
        unit_of_work.db_context()?,
        true,
        state,
        CancellationToken::new(),
    );
    run_work(&execution_scope, work).map(|(value, _)| value)
}

async fn execute_nested_async<C, S, T, F, Fut>(
    scope: &DbContextScope<C>,
    state: S,
    cancellation: &CancellationToken,
    work: &mut F,
) -> Result<T>
where
    C: DbContext,
    S: Send + Sync,
    T: Send,
    F: FnMut(ExecutionScope<C, S>) -> Fut + Send,
    Fut: Future<Output = Result<T>> + Send,
{
    let unit_of_work = scope.unit_of_work();
    ensure_scoped_parent(unit_of_work)?;

    let execution_scope = ExecutionScope::new(
        unit_of_work.clone(),
        unit_of_work.db_context()?,
        true,
        state,
        cancellation.clone(),
    );
    let pending = work(execution_scope.clone());
    run_work_async(&execution_scope, pending)
        .await
        .map(|(value, _)| value)
}

fn execute_root<C, S, T, F>(
    scope: &DbContextScope<C>,
    options: &DbContextScopeOptions,
    state: S,
    work: &mut F,
) -> Result<T>
where
    C: DbContext,
    S: Clone,
    F: FnMut(ExecutionScope<C, S>) -> Result<T>,
{
    let unit_of_work = scope.unit_of_work();
    let context = prepare_root(unit_of_work)?;

    let attempt = || {
        let execution_scope = ExecutionScope::new(
            unit_of_work.clone(),
            context.clone(),
            false,
            state.clone(),
            CancellationToken::new(),
        );
        let result = run_work(&execution_scope, &mut *work).and_then(|(value, completed)| {
            if completed {
                unit_of_work
                    .try_commit_transaction()
                    .map_err(|err| commit_error(options, err))?;
            }
            Ok(value)
        });

        if let Err(err) = &result {
            reset_after_failure(unit_of_work, &context, err);
        }
        result
    };

    let base = DefaultExecutionStrategy::from_options(options);
    if options.execution_strategy.retry_on_optimistic_concurrency_failure {
        RetryOnConflictStrategy::new(base).execute(attempt)
    } else {
        let mut base = base;
        base.execute(attempt)
    }
}

async fn execute_root_async<C, S, T, F, Fut>(
    scope: &DbContextScope<C>,
    options: &DbContextScopeOptions,
    state: S,
    cancellation: &CancellationToken,
    work: &mut F,
) -> Result<T>
where
    C: DbContext,
    S: Clone + Send + Sync,
    T: Send,
    F: FnMut(ExecutionScope<C, S>) -> Fut + Send,
    Fut: Future<Output = Result<T>> + Send,
{
    let unit_of_work = scope.unit_of_work();
    let context = prepare_root(unit_of_work)?;
    let context = &context;
    let state = &state;

    let attempt = || {
        let execution_scope = ExecutionScope::new(
            unit_of_work.clone(),
            context.clone(),
            false,
            state.clone(),
            cancellation.clone(),
        );
        let pending = work(execution_scope.clone());

        async move {
            let result = match run_work_async(&execution_scope, pending).await {
                Ok((value, true)) => unit_of_work
                    .try_commit_transaction_async(cancellation)
                    .await
                    .map_err(|err| commit_error(options, err))
                    .map(|_| value),
                Ok((value, false)) => Ok(value),
                Err(err) => Err(err),
            };

            if let Err(err) = &result {
                reset_after_failure_async(unit_of_work, context, err).await;
            }
            result
        }
    };

    let base = DefaultExecutionStrategy::from_options(options);
    if options.execution_strategy.retry_on_optimistic_concurrency_failure {
        RetryOnConflictStrategy::new(base)
            .execute_async(cancellation, attempt)
            .await
    } else {
        let mut base = base;
        base.execute_async(cancellation, attempt).await
    }
}

/// Runs the work of one attempt and ends its execution scope.
///
/// Returns the value and whether the scope ended completed.
fn run_work<C, S, T, F>(execution_scope: &ExecutionScope<C, S>, work: &mut F) -> Result<(T, bool)>
where
    C: DbContext,
    F: FnMut(ExecutionScope<C, S>) -> Result<T>,
{
    let result = work(execution_scope.clone());
    if result.is_err() {
        execution_scope.abort();
    }

    let completed = execution_scope.is_completed();
    settle(result, execution_scope.dispose()).map(|value| (value, completed))
}

async fn run_work_async<C, S, T, Fut>(
    execution_scope: &ExecutionScope<C, S>,
    pending: Fut,
) -> Result<(T, bool)>
where
    C: DbContext,
    Fut: Future<Output = Result<T>>,
{
    let result = if execution_scope.is_cancelled() {
        Err(DbError::Cancelled)
    } else {
        match pending.await {
            Ok(_) if execution_scope.is_cancelled() => Err(DbError::Cancelled),
            other => other,
        }
    };

    if result.is_err() {
        execution_scope.abort();
    }

    let completed = execution_scope.is_completed();
    let disposed = execution_scope.dispose_async().await;
    settle(result, disposed).map(|value| (value, completed))
}

/// A cancelled commit never reached the database and is not wrapped
fn commit_error(options: &DbContextScopeOptions, err: DbError) -> DbError {
    if options.avoid_failure_on_commit_retries
        && !err.is_commit_failure()
        && !matches!(err, DbError::Cancelled)
    {
        return DbError::CommitFailed(Box::new(err));
    }
    err
}

/// Resets per-attempt state so that a retry starts clean
fn reset_after_failure<C: DbContext>(unit_of_work: &UnitOfWork<C>, context: &C, cause: &DbError) {
    debug!("Resetting the unit of work after a failed attempt: {}", cause);
    context.clear_tracked_state();
    reset_change_detection(unit_of_work);
    if let Err(err) = context.close_connection() {
        warn!("Failed to close the connection after a failed attempt: {}", err);
    }
    if let Err(err) = unit_of_work.undo_invalidation() {
        warn!("Failed to undo invalidation after a failed attempt: {}", err);
    }
}

async fn reset_after_failure_async<C: DbContext>(
    unit_of_work: &UnitOfWork<C>,
    context: &C,
    cause: &DbError,
) {
    debug!("Resetting the unit of work after a failed attempt: {}", cause);
    context.clear_tracked_state();
    reset_change_detection(unit_of_work);
    if let Err(err) = context.close_connection_async().await {
        warn!("Failed to close the connection after a failed attempt: {}", err);
    }
    if let Err(err) = unit_of_work.undo_invalidation() {
        warn!("Failed to undo invalidation after a failed attempt: {}", err);
    }
}

fn reset_change_detection<C: DbContext>(unit_of_work: &UnitOfWork<C>) {
    match unit_of_work.observer() {
        Ok(observer) => observer.reset_change_detection(),
        Err(err) => warn!("Failed to reset change detection after a failed attempt: {}", err),
    }
}

/// Combines an outcome with the result of the cleanup that followed it.
/// The outcome's error wins; a cleanup error after success is returned.
fn settle<T>(outcome: Result<T>, cleanup: Result<()>) -> Result<T> {
    match (outcome, cleanup) {
        (Ok(value), Ok(())) => Ok(value),
        (Ok(_), Err(err)) => Err(err),
        (Err(err), Ok(())) => Err(err),
        (Err(err), Err(cleanup_err)) => {
            warn!("Cleanup failed after an error ({}): {}", err, cleanup_err);
            Err(err)
        }
    }
}

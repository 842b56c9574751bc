/// Retry tests
///
/// Optimistic concurrency retries, transient fault retries, commit failure
/// handling and cancellation.
/// Run with: cargo test --test retry_tests

use dbscope::prelude::*;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

fn conflict() -> DbError {
    DbError::ConcurrencyConflict("The row was modified by another user".to_string())
}

fn retrying_provider(database: &MemoryDatabase) -> DbContextProvider<MemoryContext> {
    let options = DbContextScopeOptions::new().retry_on_optimistic_concurrency_failure(true);
    DbContextProvider::with_options(database.clone(), options).unwrap()
}

fn quick_policy(max_retries: usize) -> TransientRetryPolicy {
    TransientRetryPolicy {
        max_retries,
        base_backoff_ms: 1,
        max_backoff_ms: 2,
    }
}

#[test]
fn test_endless_conflicts_hit_the_retry_limit() {
    let database = MemoryDatabase::new();
    let provider = retrying_provider(&database);
    let mut attempts = 0;

    let result: Result<()> = provider.execute_scoped(|_| {
        attempts += 1;
        Err(conflict())
    });

    assert_eq!(attempts, 3);
    match result {
        Err(DbError::RetryLimitExceeded { attempts, source }) => {
            assert_eq!(attempts, 3);
            assert!(source.is_concurrency_conflict());
        }
        other => panic!("unexpected result: {:?}", other),
    }
}

#[test]
fn test_conflicts_are_not_retried_by_default() {
    let database = MemoryDatabase::new();
    let provider = DbContextProvider::new(database.clone());
    let mut attempts = 0;

    let result: Result<()> = provider.execute_scoped(|_| {
        attempts += 1;
        Err(conflict())
    });

    assert_eq!(attempts, 1);
    assert!(result.unwrap_err().is_concurrency_conflict());
}

#[test]
fn test_only_the_successful_attempt_is_committed() {
    let database = MemoryDatabase::new();
    let provider = retrying_provider(&database);
    let mut attempts = 0;

    provider
        .execute_scoped(|scope| {
            attempts += 1;
            scope.db_context().add("items", attempts, "row")?;
            scope.db_context().save_changes()?;
            if attempts == 1 {
                return Err(conflict());
            }
            Ok(())
        })
        .unwrap();

    assert_eq!(attempts, 2);
    assert_eq!(database.get("items", 1), None);
    assert_eq!(database.get("items", 2), Some(Value::from("row")));
}

#[test]
fn test_retry_starts_with_fresh_tracked_state() {
    let database = MemoryDatabase::new();
    let provider = retrying_provider(&database);
    let mut attempts = 0;

    provider
        .execute_scoped(|scope| {
            attempts += 1;
            // Tracking the same key twice would fail on a stale tracker
            scope.db_context().add("items", 1, "one")?;
            if attempts == 1 {
                return Err(conflict());
            }
            scope.db_context().save_changes()?;
            Ok(())
        })
        .unwrap();

    assert_eq!(attempts, 2);
    assert_eq!(database.row_count("items"), 1);
}

#[test]
fn test_real_conflict_is_retried_with_fresh_data() {
    let database = MemoryDatabase::new();
    database.seed("counters", 1, 0i64).unwrap();
    let provider = retrying_provider(&database);
    let outsider = database.create_context();
    let mut attempts = 0;

    provider
        .execute_scoped(|scope| {
            attempts += 1;
            let context = scope.db_context();
            let value = context
                .find("counters", 1)?
                .and_then(|value| value.as_i64())
                .unwrap_or_default();

            if attempts == 1 {
                // Someone else updates the counter in the meantime
                outsider.find("counters", 1)?;
                outsider.update("counters", 1, 100i64)?;
                outsider.save_changes()?;
            }

            context.update("counters", 1, value + 1)?;
            context.save_changes()?;
            Ok(())
        })
        .unwrap();

    assert_eq!(attempts, 2);
    assert_eq!(database.get("counters", 1), Some(Value::from(101i64)));
}

#[test]
fn test_aborted_attempt_is_discarded_before_retry() {
    let database = MemoryDatabase::new();
    let provider = retrying_provider(&database);
    let mut attempts = 0;

    provider
        .execute_scoped(|scope| {
            attempts += 1;
            if attempts == 1 {
                scope.db_context().add("items", 1, "aborted")?;
                scope.db_context().save_changes()?;
                scope.abort();
                return Err(conflict());
            }

            // The retry is no longer invalidated by the earlier abort
            scope.db_context().add("items", 2, "retried")?;
            scope.db_context().save_changes()?;
            Ok(())
        })
        .unwrap();

    assert_eq!(database.get("items", 1), None);
    assert_eq!(database.get("items", 2), Some(Value::from("retried")));
}

#[test]
fn test_commit_failure_is_not_retried() {
    let database = MemoryDatabase::new();
    let options = DbContextScopeOptions::new()
        .retry_on_optimistic_concurrency_failure(true)
        .transient_retry(quick_policy(3));
    let provider = DbContextProvider::with_options(database.clone(), options).unwrap();
    database.inject_commit_failure(CommitFailure::BeforeApply).unwrap();
    let mut attempts = 0;

    let result = provider.execute_scoped(|scope| {
        attempts += 1;
        scope.db_context().add("items", 1, "one")?;
        scope.db_context().save_changes()?;
        Ok(())
    });

    assert_eq!(attempts, 1);
    let err = result.unwrap_err();
    assert!(err.is_commit_failure());
    assert!(err.to_string().contains("The operation failed on commit."));
    assert_eq!(database.row_count("items"), 0);
}

#[test]
fn test_commit_failure_may_have_succeeded() {
    let database = MemoryDatabase::new();
    let provider = retrying_provider(&database);
    database.inject_commit_failure(CommitFailure::AfterApply).unwrap();
    let mut attempts = 0;

    let result = provider.execute_scoped(|scope| {
        attempts += 1;
        scope.db_context().add("items", 1, "one")?;
        scope.db_context().save_changes()?;
        Ok(())
    });

    // Retrying here would have inserted the row twice
    assert!(result.unwrap_err().is_commit_failure());
    assert_eq!(attempts, 1);
    assert_eq!(database.row_count("items"), 1);
}

#[test]
fn test_commit_failure_is_retried_when_allowed() {
    let database = MemoryDatabase::new();
    let options = DbContextScopeOptions::new()
        .avoid_failure_on_commit_retries(false)
        .transient_retry(quick_policy(3));
    let provider = DbContextProvider::with_options(database.clone(), options).unwrap();
    database.inject_commit_failure(CommitFailure::BeforeApply).unwrap();
    let mut attempts = 0;

    provider
        .execute_scoped(|scope| {
            attempts += 1;
            scope.db_context().add("items", 1, "one")?;
            scope.db_context().save_changes()?;
            Ok(())
        })
        .unwrap();

    assert_eq!(attempts, 2);
    assert_eq!(database.row_count("items"), 1);
}

#[test]
fn test_transient_faults_are_retried() {
    let database = MemoryDatabase::new();
    let options = DbContextScopeOptions::new().transient_retry(quick_policy(3));
    let provider = DbContextProvider::with_options(database.clone(), options).unwrap();
    database.inject_transient_faults(2);
    let mut attempts = 0;

    provider
        .execute_scoped(|scope| {
            attempts += 1;
            scope.db_context().add("items", 1, "one")?;
            scope.db_context().save_changes()?;
            Ok(())
        })
        .unwrap();

    assert_eq!(attempts, 3);
    assert_eq!(database.row_count("items"), 1);
    assert_eq!(database.transactions_started(), 1);
}

#[test]
fn test_transient_faults_surface_without_a_policy() {
    let database = MemoryDatabase::new();
    let provider = retrying_provider(&database);
    database.inject_transient_faults(1);

    let result = provider.execute_scoped(|scope| {
        scope.db_context().add("items", 1, "one")?;
        scope.db_context().save_changes()
    });

    assert!(result.unwrap_err().is_transient());
}

#[test]
fn test_simulated_conflicts_prove_work_is_retry_safe() {
    let database = MemoryDatabase::new();
    let provider = ConcurrencyConflictProvider::new(retrying_provider(&database));
    let mut attempts = 0;

    provider
        .execute_scoped(|_| {
            attempts += 1;
            // Nested executions belong to the same unit of work
            provider.execute_scoped(|inner| {
                inner.db_context().add("items", 1, "one")?;
                inner.db_context().save_changes()?;
                Ok(())
            })
        })
        .unwrap();

    assert_eq!(attempts, 2);
    assert_eq!(database.row_count("items"), 1);
}

#[tokio::test]
async fn test_async_endless_conflicts_hit_the_retry_limit() {
    let database = MemoryDatabase::new();
    let provider = retrying_provider(&database);
    let attempts = Arc::new(AtomicUsize::new(0));

    let result: Result<()> = provider
        .execute_scoped_async(|_| {
            let attempts = attempts.clone();
            async move {
                attempts.fetch_add(1, Ordering::SeqCst);
                Err(conflict())
            }
        })
        .await;

    assert_eq!(attempts.load(Ordering::SeqCst), 3);
    assert!(matches!(result, Err(DbError::RetryLimitExceeded { attempts: 3, .. })));
}

#[tokio::test]
async fn test_async_transient_faults_are_retried() {
    let database = MemoryDatabase::new();
    let options = DbContextScopeOptions::new().transient_retry(quick_policy(2));
    let provider = DbContextProvider::with_options(database.clone(), options).unwrap();
    database.inject_transient_faults(1);

    provider
        .execute_scoped_async(|scope| async move {
            scope.db_context().add("items", 1, "one")?;
            scope.db_context().save_changes_async(scope.cancellation_token()).await?;
            Ok::<_, DbError>(())
        })
        .await
        .unwrap();

    assert_eq!(database.row_count("items"), 1);
}

#[tokio::test]
async fn test_cancelled_execution_never_runs_work() {
    let database = MemoryDatabase::new();
    let provider = retrying_provider(&database);
    let cancellation = CancellationToken::new();
    cancellation.cancel();
    let attempts = Arc::new(AtomicUsize::new(0));

    let result = provider
        .execute_scoped_async_with_state(ScopeOption::JoinExisting, (), cancellation, |_| {
            let attempts = attempts.clone();
            async move {
                attempts.fetch_add(1, Ordering::SeqCst);
                Ok::<_, DbError>(())
            }
        })
        .await;

    assert!(matches!(result, Err(DbError::Cancelled)));
    assert_eq!(attempts.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_cancellation_during_work_rolls_back() {
    let database = MemoryDatabase::new();
    let provider = retrying_provider(&database);

    let result = provider
        .execute_scoped_async_with_state(
            ScopeOption::JoinExisting,
            (),
            CancellationToken::new(),
            |scope| async move {
                scope.db_context().add("items", 1, "one")?;
                scope.db_context().save_changes_async(scope.cancellation_token()).await?;
                scope.cancellation_token().cancel();
                Ok::<_, DbError>(())
            },
        )
        .await;

    assert!(matches!(result, Err(DbError::Cancelled)));
    assert_eq!(database.row_count("items"), 0);
    assert_eq!(database.active_transactions(), 0);
}

#[test]
fn test_read_only_retry_does_not_flush_changes_of_failed_attempt() {
    let database = MemoryDatabase::new();
    let provider = retrying_provider(&database);
    let mut attempts = 0;

    let count = provider
        .execute_scoped(|scope| {
            attempts += 1;
            if attempts == 1 {
                scope.db_context().add("items", 1, "one")?;
                return Err(conflict());
            }
            scope.db_context().count("items")
        })
        .unwrap();

    assert_eq!(attempts, 2);
    assert_eq!(count, 0);
    assert_eq!(database.transactions_started(), 0);
}

#[test]
fn test_read_only_retry_with_explicit_detection_starts_no_transaction() {
    let database = MemoryDatabase::new();
    let options = DbContextScopeOptions::new()
        .retry_on_optimistic_concurrency_failure(true)
        .auto_flush_mode(AutoFlushMode::DetectExplicitChanges);
    let provider = DbContextProvider::with_options(database.clone(), options).unwrap();
    let mut attempts = 0;

    provider
        .execute_scoped(|scope| {
            attempts += 1;
            if attempts == 1 {
                scope.db_context().add("items", 1, "one")?;
                return Err(conflict());
            }
            scope.db_context().count("items")
        })
        .unwrap();

    assert_eq!(attempts, 2);
    assert_eq!(database.transactions_started(), 0);
}

#[tokio::test]
async fn test_async_read_only_retry_starts_no_transaction() {
    let database = MemoryDatabase::new();
    let provider = retrying_provider(&database);
    let attempts = Arc::new(AtomicUsize::new(0));

    let count = provider
        .execute_scoped_async(|scope| {
            let attempts = attempts.clone();
            async move {
                if attempts.fetch_add(1, Ordering::SeqCst) == 0 {
                    scope.db_context().add("items", 1, "one")?;
                    return Err(conflict());
                }
                scope
                    .db_context()
                    .count_async("items", scope.cancellation_token())
                    .await
            }
        })
        .await
        .unwrap();

    assert_eq!(attempts.load(Ordering::SeqCst), 2);
    assert_eq!(count, 0);
    assert_eq!(database.transactions_started(), 0);
}

#[tokio::test]
async fn test_commit_cancelled_in_flight_is_not_retried() {
    let database = MemoryDatabase::new();
    let options = DbContextScopeOptions::new()
        .retry_on_optimistic_concurrency_failure(true)
        .transient_retry(quick_policy(3));
    let provider = DbContextProvider::with_options(database.clone(), options).unwrap();
    let attempts = Arc::new(AtomicUsize::new(0));

    let result = provider
        .execute_scoped_async_with_state(
            ScopeOption::JoinExisting,
            (),
            CancellationToken::new(),
            |scope| {
                let attempts = attempts.clone();
                async move {
                    attempts.fetch_add(1, Ordering::SeqCst);
                    scope.db_context().add("items", 1, "one")?;
                    scope
                        .db_context()
                        .save_changes_async(scope.cancellation_token())
                        .await?;

                    // Runs once the commit waits on the database
                    let trigger = scope.cancellation_token().clone();
                    tokio::spawn(async move { trigger.cancel() });
                    Ok::<_, DbError>(())
                }
            },
        )
        .await;

    assert!(matches!(result, Err(DbError::Cancelled)));
    assert_eq!(attempts.load(Ordering::SeqCst), 1);
    assert_eq!(database.transactions_started(), 1);
    assert_eq!(database.row_count("items"), 0);
    assert_eq!(database.active_transactions(), 0);
}

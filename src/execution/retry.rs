use super::strategy::ExecutionStrategy;
use crate::core::{DbError, Result};
use log::warn;
use std::future::Future;
use tokio_util::sync::CancellationToken;

/// Decorates a strategy with a bounded retry on optimistic concurrency
/// conflicts.
///
/// The wrapped strategy keeps handling its own failures and its own
/// counters. This decorator's counter only ever grows: once it reaches
/// [`MAX_RETRY_COUNT`](Self::MAX_RETRY_COUNT), a conflict becomes
/// [`DbError::RetryLimitExceeded`].
#[derive(Debug)]
pub struct RetryOnConflictStrategy<S: ExecutionStrategy> {
    inner: S,
    retry_count: usize,
}

impl<S: ExecutionStrategy> RetryOnConflictStrategy<S> {
    /// Retries after the first attempt
    pub const MAX_RETRY_COUNT: usize = 2;

    pub fn new(inner: S) -> Self {
        Self {
            inner,
            retry_count: 0,
        }
    }

    pub fn retry_count(&self) -> usize {
        self.retry_count
    }

    pub fn into_inner(self) -> S {
        self.inner
    }

    /// Decides what to do with a failure of the wrapped strategy.
    ///
    /// `Ok` means retry.
    fn on_failure(&mut self, err: DbError) -> Result<()> {
        if !err.is_concurrency_conflict() {
            return Err(err);
        }

        if self.retry_count >= Self::MAX_RETRY_COUNT {
            return Err(DbError::RetryLimitExceeded {
                attempts: self.retry_count + 1,
                source: Box::new(err),
            });
        }

        self.retry_count += 1;
        warn!(
            "Retrying after an optimistic concurrency conflict (retry {} of {}): {}",
            self.retry_count,
            Self::MAX_RETRY_COUNT,
            err
        );
        Ok(())
    }
}

impl<S: ExecutionStrategy> ExecutionStrategy for RetryOnConflictStrategy<S> {
    fn retries_on_failure(&self) -> bool {
        self.inner.retries_on_failure() || self.retry_count < Self::MAX_RETRY_COUNT
    }

    fn execute<T, F>(&mut self, mut operation: F) -> Result<T>
    where
        F: FnMut() -> Result<T>,
    {
        loop {
            match self.inner.execute(&mut operation) {
                Ok(value) => return Ok(value),
                Err(err) => self.on_failure(err)?,
            }
        }
    }

    fn execute_async<'a, T, F, Fut>(
        &'a mut self,
        cancellation: &'a CancellationToken,
        mut operation: F,
    ) -> impl Future<Output = Result<T>> + Send + 'a
    where
        T: Send + 'a,
        F: FnMut() -> Fut + Send + 'a,
        Fut: Future<Output = Result<T>> + Send + 'a,
    {
        async move {
            loop {
                let outcome = self.inner.execute_async(cancellation, &mut operation).await;
                match outcome {
                    Ok(value) => return Ok(value),
                    Err(err) => self.on_failure(err)?,
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::execution::strategy::NoRetryStrategy;

    type Strategy = RetryOnConflictStrategy<NoRetryStrategy>;

    #[test]
    fn test_endless_conflicts_hit_the_limit() {
        let mut strategy = Strategy::new(NoRetryStrategy);
        let mut attempts = 0;

        let result: Result<()> = strategy.execute(|| {
            attempts += 1;
            Err(DbError::ConcurrencyConflict("row changed".into()))
        });

        assert_eq!(attempts, Strategy::MAX_RETRY_COUNT + 1);
        match result {
            Err(DbError::RetryLimitExceeded { attempts, source }) => {
                assert_eq!(attempts, 3);
                assert!(source.is_concurrency_conflict());
            }
            other => panic!("unexpected result: {:?}", other),
        }
    }

    #[test]
    fn test_single_conflict_is_absorbed() {
        let mut strategy = Strategy::new(NoRetryStrategy);
        let mut attempts = 0;

        let result = strategy.execute(|| {
            attempts += 1;
            if attempts == 1 {
                Err(DbError::ConcurrencyConflict("row changed".into()))
            } else {
                Ok("done")
            }
        });

        assert_eq!(result.unwrap(), "done");
        assert_eq!(strategy.retry_count(), 1);
    }

    #[test]
    fn test_counter_is_never_reset() {
        let mut strategy = Strategy::new(NoRetryStrategy);
        let mut first = true;
        strategy
            .execute(|| {
                if std::mem::take(&mut first) {
                    Err(DbError::ConcurrencyConflict("row changed".into()))
                } else {
                    Ok(())
                }
            })
            .unwrap();

        let mut attempts = 0;
        let result: Result<()> = strategy.execute(|| {
            attempts += 1;
            Err(DbError::ConcurrencyConflict("row changed".into()))
        });

        assert!(matches!(result, Err(DbError::RetryLimitExceeded { .. })));
        assert_eq!(attempts, 2);
    }

    #[test]
    fn test_other_errors_pass_through() {
        let mut strategy = Strategy::new(NoRetryStrategy);
        let mut attempts = 0;

        let result: Result<()> = strategy.execute(|| {
            attempts += 1;
            Err(DbError::TransactionAborted)
        });

        assert!(matches!(result, Err(DbError::TransactionAborted)));
        assert_eq!(attempts, 1);
    }

    #[test]
    fn test_retries_on_failure() {
        let mut strategy = Strategy::new(NoRetryStrategy);
        assert!(strategy.retries_on_failure());

        let _: Result<()> = strategy.execute(|| Err(DbError::ConcurrencyConflict("row".into())));
        assert!(!strategy.retries_on_failure());
    }

    #[tokio::test]
    async fn test_async_conflicts_hit_the_limit() {
        let mut strategy = Strategy::new(NoRetryStrategy);
        let cancellation = CancellationToken::new();
        let mut attempts = 0;

        let result: Result<()> = strategy
            .execute_async(&cancellation, || {
                attempts += 1;
                async { Err(DbError::ConcurrencyConflict("row changed".into())) }
            })
            .await;

        assert!(matches!(result, Err(DbError::RetryLimitExceeded { attempts: 3, .. })));
        assert_eq!(attempts, 3);
    }

    #[tokio::test]
    async fn test_async_cancellation_is_not_retried() {
        let mut strategy = Strategy::new(NoRetryStrategy);
        let cancellation = CancellationToken::new();
        cancellation.cancel();

        let result: Result<()> = strategy
            .execute_async(&cancellation, || async { Ok(()) })
            .await;

        assert!(matches!(result, Err(DbError::Cancelled)));
    }
}

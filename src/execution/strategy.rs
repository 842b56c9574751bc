// ============================================================================
// Execution Strategies
// ============================================================================
//
// A strategy runs an operation, possibly several times. Strategies compose
// by wrapping: the retry-on-conflict decorator wraps whichever base strategy
// handles transient faults.
//
// Operations are closures producing a fresh result (or future) per attempt.
// Per-attempt cleanup belongs to the operation, not to the strategy.
//
// ============================================================================

use crate::config::{DbContextScopeOptions, TransientRetryPolicy};
use crate::core::{DbError, Result};
use log::warn;
use std::future::Future;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

pub trait ExecutionStrategy: Send {
    /// Whether this strategy might run an operation more than once
    fn retries_on_failure(&self) -> bool;

    fn execute<T, F>(&mut self, operation: F) -> Result<T>
    where
        F: FnMut() -> Result<T>;

    /// Runs `operation` until it succeeds or the strategy gives up.
    ///
    /// A cancelled token stops further attempts with [`DbError::Cancelled`].
    fn execute_async<'a, T, F, Fut>(
        &'a mut self,
        cancellation: &'a CancellationToken,
        operation: F,
    ) -> impl Future<Output = Result<T>> + Send + 'a
    where
        T: Send + 'a,
        F: FnMut() -> Fut + Send + 'a,
        Fut: Future<Output = Result<T>> + Send + 'a;
}

/// Runs every operation exactly once
#[derive(Debug, Clone, Copy, Default)]
pub struct NoRetryStrategy;

impl ExecutionStrategy for NoRetryStrategy {
    fn retries_on_failure(&self) -> bool {
        false
    }

    fn execute<T, F>(&mut self, mut operation: F) -> Result<T>
    where
        F: FnMut() -> Result<T>,
    {
        operation()
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
            if cancellation.is_cancelled() {
                return Err(DbError::Cancelled);
            }
            operation().await
        }
    }
}

/// Retries [`DbError::Transient`] failures with capped exponential backoff.
///
/// The retry counter starts over for every `execute` call.
#[derive(Debug, Clone, Copy)]
pub struct TransientRetryStrategy {
    policy: TransientRetryPolicy,
}

impl TransientRetryStrategy {
    pub fn new(policy: TransientRetryPolicy) -> Self {
        Self { policy }
    }

    pub fn policy(&self) -> &TransientRetryPolicy {
        &self.policy
    }

    fn should_retry(&self, retries: usize, err: &DbError) -> bool {
        retries < self.policy.max_retries && err.is_transient()
    }

    fn log_retry(&self, retries: usize, err: &DbError, backoff_ms: u64) {
        warn!(
            "Retrying after a transient failure (retry {} of {}): {} (backoff={}ms)",
            retries, self.policy.max_retries, err, backoff_ms
        );
    }
}

impl ExecutionStrategy for TransientRetryStrategy {
    fn retries_on_failure(&self) -> bool {
        self.policy.max_retries > 0
    }

    fn execute<T, F>(&mut self, mut operation: F) -> Result<T>
    where
        F: FnMut() -> Result<T>,
    {
        let mut retries = 0;
        loop {
            match operation() {
                Ok(value) => return Ok(value),
                Err(err) => {
                    if !self.should_retry(retries, &err) {
                        return Err(err);
                    }

                    retries += 1;
                    let backoff_ms = self.policy.backoff_ms(retries);
                    self.log_retry(retries, &err, backoff_ms);
                    std::thread::sleep(Duration::from_millis(backoff_ms));
                }
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
            let mut retries = 0;
            loop {
                if cancellation.is_cancelled() {
                    return Err(DbError::Cancelled);
                }

                match operation().await {
                    Ok(value) => return Ok(value),
                    Err(err) => {
                        if !self.should_retry(retries, &err) {
                            return Err(err);
                        }

                        retries += 1;
                        let backoff_ms = self.policy.backoff_ms(retries);
                        self.log_retry(retries, &err, backoff_ms);
                        tokio::select! {
                            _ = cancellation.cancelled() => return Err(DbError::Cancelled),
                            _ = tokio::time::sleep(Duration::from_millis(backoff_ms)) => {}
                        }
                    }
                }
            }
        }
    }
}

/// The base strategy selected by [`DbContextScopeOptions::transient_retry`]
#[derive(Debug, Clone, Copy)]
pub enum DefaultExecutionStrategy {
    NoRetry(NoRetryStrategy),
    Transient(TransientRetryStrategy),
}

impl DefaultExecutionStrategy {
    pub fn from_options(options: &DbContextScopeOptions) -> Self {
        match options.transient_retry {
            Some(policy) => Self::Transient(TransientRetryStrategy::new(policy)),
            None => Self::NoRetry(NoRetryStrategy),
        }
    }
}

impl ExecutionStrategy for DefaultExecutionStrategy {
    fn retries_on_failure(&self) -> bool {
        match self {
            Self::NoRetry(strategy) => strategy.retries_on_failure(),
            Self::Transient(strategy) => strategy.retries_on_failure(),
        }
    }

    fn execute<T, F>(&mut self, operation: F) -> Result<T>
    where
        F: FnMut() -> Result<T>,
    {
        match self {
            Self::NoRetry(strategy) => strategy.execute(operation),
            Self::Transient(strategy) => strategy.execute(operation),
        }
    }

    fn execute_async<'a, T, F, Fut>(
        &'a mut self,
        cancellation: &'a CancellationToken,
        operation: F,
    ) -> impl Future<Output = Result<T>> + Send + 'a
    where
        T: Send + 'a,
        F: FnMut() -> Fut + Send + 'a,
        Fut: Future<Output = Result<T>> + Send + 'a,
    {
        async move {
            match self {
                Self::NoRetry(strategy) => strategy.execute_async(cancellation, operation).await,
                Self::Transient(strategy) => strategy.execute_async(cancellation, operation).await,
            }
        }
    }
}

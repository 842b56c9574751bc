use crate::core::ScopeOption;
use serde::{Deserialize, Serialize};

/// Controls flushing pending changes to the database when a query runs
/// while there are unsaved changes.
///
/// Only applies to units of work driven by scoped execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
pub enum AutoFlushMode {
    /// No changes are observed. Queries never see unsaved changes.
    None,

    /// Only explicit changes (add, update, remove) are observed.
    ///
    /// Property modifications on tracked entities without an explicit
    /// update are not flushed. Neither are changes to the membership of
    /// an entity's child collections.
    DetectExplicitChanges,

    /// All changes are observed, at the cost of asking the context for
    /// pending changes before queries.
    #[default]
    DetectExplicitAndImplicitChanges,
}

/// Retry configuration for ordinary transient faults
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TransientRetryPolicy {
    /// Maximum number of retries after the first attempt
    pub max_retries: usize,
    /// Base duration in milliseconds for backoff calculation.
    pub base_backoff_ms: u64,
    /// Maximum duration in milliseconds for backoff.
    pub max_backoff_ms: u64,
}

impl Default for TransientRetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_backoff_ms: 5,
            max_backoff_ms: 100,
        }
    }
}

impl TransientRetryPolicy {
    /// Computes exponential retry backoff in milliseconds.
    pub fn backoff_ms(&self, attempt: usize) -> u64 {
        let base = self.base_backoff_ms.max(1);
        let cap = self.max_backoff_ms.max(base);

        let mut backoff = base;
        for _ in 1..attempt {
            backoff = backoff.saturating_mul(2).min(cap);
        }
        backoff
    }
}

/// Options for the execution strategy wrapped around scoped execution
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ExecutionStrategyOptions {
    /// Retry the whole unit of work (at most twice) when it fails with an
    /// optimistic concurrency conflict.
    ///
    /// Work that performs non-transactional side effects must be safe to
    /// repeat when this is enabled.
    pub retry_on_optimistic_concurrency_failure: bool,
}

/// Configuration consumed by [`DbContextProvider`](crate::provider::DbContextProvider)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DbContextScopeOptions {
    /// Auto-flush behavior for scoped execution
    pub auto_flush_mode: AutoFlushMode,

    /// Execution strategy configuration
    pub execution_strategy: ExecutionStrategyOptions,

    /// Join policy used when a caller does not name one
    pub default_scope_option: ScopeOption,

    /// Wrap commit failures in [`DbError::CommitFailed`](crate::DbError::CommitFailed)
    /// so that no strategy retries them
    pub avoid_failure_on_commit_retries: bool,

    /// Transient-fault retry policy of the base strategy; `None` never retries
    pub transient_retry: Option<TransientRetryPolicy>,
}

impl Default for DbContextScopeOptions {
    fn default() -> Self {
        Self {
            auto_flush_mode: AutoFlushMode::default(),
            execution_strategy: ExecutionStrategyOptions::default(),
            default_scope_option: ScopeOption::JoinExisting,
            avoid_failure_on_commit_retries: true,
            transient_retry: None,
        }
    }
}

impl DbContextScopeOptions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the auto-flush mode
    pub fn auto_flush_mode(mut self, mode: AutoFlushMode) -> Self {
        self.auto_flush_mode = mode;
        self
    }

    /// Enable or disable retries on optimistic concurrency conflicts
    pub fn retry_on_optimistic_concurrency_failure(mut self, enabled: bool) -> Self {
        self.execution_strategy.retry_on_optimistic_concurrency_failure = enabled;
        self
    }

    /// Set the default join policy
    pub fn default_scope_option(mut self, option: ScopeOption) -> Self {
        self.default_scope_option = option;
        self
    }

    /// Enable or disable wrapping of commit failures
    pub fn avoid_failure_on_commit_retries(mut self, enabled: bool) -> Self {
        self.avoid_failure_on_commit_retries = enabled;
        self
    }

    /// Retry transient faults with the given policy
    pub fn transient_retry(mut self, policy: TransientRetryPolicy) -> Self {
        self.transient_retry = Some(policy);
        self
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<(), String> {
        if let Some(policy) = &self.transient_retry {
            if policy.max_backoff_ms < policy.base_backoff_ms {
                return Err("max_backoff_ms cannot be lower than base_backoff_ms".to_string());
            }
        }

        Ok(())
    }
}

pub(crate) mod executor;
pub mod retry;
pub mod scope;
pub mod strategy;

pub use retry::RetryOnConflictStrategy;
pub use scope::ExecutionScope;
pub use strategy::{DefaultExecutionStrategy, ExecutionStrategy, NoRetryStrategy, TransientRetryStrategy};

// ============================================================================
// Database Context Observer
// ============================================================================
//
// Interceptor attached to every context owned by a unit of work:
//
// - before a transaction starts or a command is created: fail with
//   TransactionAborted once the unit of work was invalidated
// - around saves: start the unit of work's transaction first, and track
//   "saving in progress" so flushing never re-enters itself
// - before raw commands: start the transaction and ask for re-enlistment
// - before readers: flush pending changes (auto-flush)
// - on commit failure: mark the error as "outcome unknown"
//
// ============================================================================

use crate::config::{AutoFlushMode, DbContextScopeOptions};
use crate::context::{
    CommandEnlistment, ContextInterceptor, ContextProbe, DbContext, TransactionAction,
};
use crate::core::{DbError, EntityState, Result};
use async_trait::async_trait;
use log::debug;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tokio_util::sync::CancellationToken;

/// Callback run before a transaction starts or a command is created
pub type ObserverListener = Arc<dyn Fn() -> Result<()> + Send + Sync>;

/// What the observer asks of its unit of work
#[async_trait]
pub(crate) trait ObserverCallbacks: Send + Sync {
    /// Makes sure a transaction is active before a write
    fn will_save_changes(&self) -> Result<()>;

    async fn will_save_changes_async(&self, cancellation: &CancellationToken) -> Result<()>;

    /// Saves pending changes so that an upcoming read sees them
    fn save_before_load(&self) -> Result<()>;

    async fn save_before_load_async(&self, cancellation: &CancellationToken) -> Result<()>;
}

pub struct DbContextObserver {
    auto_flush_mode: AutoFlushMode,
    avoid_failure_on_commit_retries: bool,
    callbacks: Arc<dyn ObserverCallbacks>,
    will_start_transaction: Mutex<Vec<ObserverListener>>,
    will_create_command: Mutex<Vec<ObserverListener>>,
    transaction_aborted: AtomicBool,
    is_saving: AtomicBool,
    has_explicit_changes: AtomicBool,
    auto_flush_enabled: AtomicBool,
}

impl DbContextObserver {
    fn new(options: &DbContextScopeOptions, callbacks: Arc<dyn ObserverCallbacks>) -> Self {
        Self {
            auto_flush_mode: options.auto_flush_mode,
            avoid_failure_on_commit_retries: options.avoid_failure_on_commit_retries,
            callbacks,
            will_start_transaction: Mutex::new(Vec::new()),
            will_create_command: Mutex::new(Vec::new()),
            transaction_aborted: AtomicBool::new(false),
            is_saving: AtomicBool::new(false),
            has_explicit_changes: AtomicBool::new(false),
            auto_flush_enabled: AtomicBool::new(false),
        }
    }

    /// Creates an observer and registers it with `context`.
    ///
    /// A context that refuses interceptors is incompatible with scope
    /// management.
    pub(crate) fn attach<C: DbContext>(
        context: &C,
        options: &DbContextScopeOptions,
        callbacks: Arc<dyn ObserverCallbacks>,
    ) -> Result<Arc<Self>> {
        let observer = Arc::new(Self::new(options, callbacks));

        let interceptor: Arc<dyn ContextInterceptor> = observer.clone();
        context.add_interceptor(interceptor).map_err(|err| {
            DbError::IncompatibleVersion(format!(
                "the context of type {} does not accept interceptors: {}",
                std::any::type_name::<C>(),
                err
            ))
        })?;

        Ok(observer)
    }

    pub(crate) fn detach<C: DbContext>(self: &Arc<Self>, context: &C) -> Result<()> {
        let interceptor: Arc<dyn ContextInterceptor> = self.clone();
        context.remove_interceptor(&interceptor)
    }

    /// Runs `listener` before every transaction start
    pub fn on_will_start_transaction(&self, listener: ObserverListener) -> Result<()> {
        self.will_start_transaction.lock()?.push(listener);
        Ok(())
    }

    /// Runs `listener` before every command creation
    pub fn on_will_create_command(&self, listener: ObserverListener) -> Result<()> {
        self.will_create_command.lock()?.push(listener);
        Ok(())
    }

    pub fn is_transaction_aborted(&self) -> bool {
        self.transaction_aborted.load(Ordering::Acquire)
    }

    pub(crate) fn mark_as_transaction_aborted(&self) {
        self.transaction_aborted.store(true, Ordering::Release);
    }

    pub(crate) fn unmark_as_transaction_aborted(&self) {
        self.transaction_aborted.store(false, Ordering::Release);
    }

    pub(crate) fn enable_auto_flush(&self) {
        if self.auto_flush_mode != AutoFlushMode::None {
            self.auto_flush_enabled.store(true, Ordering::Release);
        }
    }

    pub(crate) fn disable_auto_flush(&self) {
        self.auto_flush_enabled.store(false, Ordering::Release);
    }

    /// Forgets explicit changes and any save in progress, so that a new
    /// attempt starts without pending flushes
    pub(crate) fn reset_change_detection(&self) {
        self.has_explicit_changes.store(false, Ordering::Release);
        self.is_saving.store(false, Ordering::Release);
    }

    pub fn is_saving(&self) -> bool {
        self.is_saving.load(Ordering::Acquire)
    }

    fn ensure_not_aborted(&self) -> Result<()> {
        if self.is_transaction_aborted() {
            return Err(DbError::TransactionAborted);
        }
        Ok(())
    }

    fn notify(listeners: &Mutex<Vec<ObserverListener>>) -> Result<()> {
        let listeners = listeners.lock()?.clone();
        for listener in listeners {
            listener()?;
        }
        Ok(())
    }

    /// Callbacks to use for a raw command outside of a save
    fn save_target(&self) -> Option<&Arc<dyn ObserverCallbacks>> {
        if self.is_saving() {
            return None;
        }
        Some(&self.callbacks)
    }

    /// Callbacks to use when a read should first flush pending changes
    fn flush_target(&self, context: &dyn ContextProbe) -> Option<&Arc<dyn ObserverCallbacks>> {
        if self.is_saving() || !self.auto_flush_enabled.load(Ordering::Acquire) {
            return None;
        }

        let has_changes = self.has_explicit_changes.load(Ordering::Acquire)
            || (self.auto_flush_mode == AutoFlushMode::DetectExplicitAndImplicitChanges
                && context.has_pending_changes());

        if !has_changes {
            return None;
        }

        debug!("Flushing pending changes before a query");
        Some(&self.callbacks)
    }

    fn observes_explicit_changes(&self) -> bool {
        self.auto_flush_mode >= AutoFlushMode::DetectExplicitChanges
    }

    fn enlistment(
        before: Option<crate::core::TransactionId>,
        context: &dyn ContextProbe,
    ) -> CommandEnlistment {
        if context.current_transaction() != before {
            CommandEnlistment::Reenlist
        } else {
            CommandEnlistment::Unchanged
        }
    }
}

#[async_trait]
impl ContextInterceptor for DbContextObserver {
    fn transaction_starting(&self) -> Result<()> {
        self.ensure_not_aborted()?;
        Self::notify(&self.will_start_transaction)
    }

    fn transaction_failed(&self, action: TransactionAction, error: DbError) -> DbError {
        if action == TransactionAction::Commit
            && self.avoid_failure_on_commit_retries
            && !error.is_commit_failure()
        {
            return DbError::CommitFailed(Box::new(error));
        }
        error
    }

    fn command_creating(&self) -> Result<()> {
        self.ensure_not_aborted()?;
        Self::notify(&self.will_create_command)
    }

    fn reader_executing(&self, context: &dyn ContextProbe) -> Result<()> {
        if let Some(callbacks) = self.flush_target(context) {
            callbacks.save_before_load()?;
        }
        Ok(())
    }

    async fn reader_executing_async(
        &self,
        context: &dyn ContextProbe,
        cancellation: &CancellationToken,
    ) -> Result<()> {
        if let Some(callbacks) = self.flush_target(context) {
            callbacks.save_before_load_async(cancellation).await?;
        }
        Ok(())
    }

    fn non_query_executing(&self, context: &dyn ContextProbe) -> Result<CommandEnlistment> {
        let Some(callbacks) = self.save_target() else {
            return Ok(CommandEnlistment::Unchanged);
        };

        let before = context.current_transaction();
        callbacks.will_save_changes()?;
        Ok(Self::enlistment(before, context))
    }

    async fn non_query_executing_async(
        &self,
        context: &dyn ContextProbe,
        cancellation: &CancellationToken,
    ) -> Result<CommandEnlistment> {
        let Some(callbacks) = self.save_target() else {
            return Ok(CommandEnlistment::Unchanged);
        };

        let before = context.current_transaction();
        callbacks.will_save_changes_async(cancellation).await?;
        Ok(Self::enlistment(before, context))
    }

    fn saving_changes(&self) -> Result<()> {
        self.is_saving.store(true, Ordering::Release);
        self.callbacks.will_save_changes()
    }

    async fn saving_changes_async(&self, cancellation: &CancellationToken) -> Result<()> {
        self.is_saving.store(true, Ordering::Release);
        self.callbacks.will_save_changes_async(cancellation).await
    }

    fn saved_changes(&self, _affected: usize) {
        self.has_explicit_changes.store(false, Ordering::Release);
        self.is_saving.store(false, Ordering::Release);
    }

    fn save_changes_failed(&self) {
        self.is_saving.store(false, Ordering::Release);
    }

    fn entity_tracked(&self, from_query: bool) {
        if !from_query && self.observes_explicit_changes() {
            self.has_explicit_changes.store(true, Ordering::Release);
        }
    }

    fn entity_state_changed(&self, state: EntityState) {
        if state.is_pending() && self.observes_explicit_changes() {
            self.has_explicit_changes.store(true, Ordering::Release);
        }
    }
}

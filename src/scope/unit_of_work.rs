// ============================================================================
// Unit Of Work
// ============================================================================
//
// Owns one database context (created lazily) and the observer attached to
// it. Shared by a root scope and every scope that joins it; disposed only
// by the root.
//
// Mode state machine:
// ```text
// Manual ──promote──> ScopedExecution
// ```
// Any other transition is unsupported.
//
// ============================================================================

use super::lock::ExclusiveLock;
use crate::config::DbContextScopeOptions;
use crate::context::{DbContext, DbContextFactory};
use crate::core::{DbError, IsolationLevel, Result};
use crate::observer::{DbContextObserver, ObserverCallbacks};
use async_trait::async_trait;
use log::{debug, warn};
use std::fmt;
use std::sync::{Arc, Mutex, Weak};
use tokio_util::sync::CancellationToken;

/// How a unit of work is being driven
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum UnitOfWorkMode {
    /// Created through a manual scope; the caller manages transactions
    Manual,

    /// Driven by scoped execution; transactions start and commit implicitly
    ScopedExecution,
}

impl UnitOfWorkMode {
    /// Returns the mode after promoting to `target`
    pub fn transition(self, target: UnitOfWorkMode) -> Result<UnitOfWorkMode> {
        match (self, target) {
            (from, to) if from == to => Ok(to),
            (UnitOfWorkMode::Manual, UnitOfWorkMode::ScopedExecution) => {
                Ok(UnitOfWorkMode::ScopedExecution)
            }
            (from, to) => Err(DbError::UnsupportedOperation(format!(
                "Transitioning a unit of work from {} to {} is not supported.",
                from, to
            ))),
        }
    }
}

impl fmt::Display for UnitOfWorkMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            UnitOfWorkMode::Manual => write!(f, "MANUAL"),
            UnitOfWorkMode::ScopedExecution => write!(f, "SCOPED_EXECUTION"),
        }
    }
}

pub struct UnitOfWork<C: DbContext> {
    factory: Arc<dyn DbContextFactory<C>>,
    options: Arc<DbContextScopeOptions>,
    db_context: Mutex<Option<Arc<C>>>,
    observer: Mutex<Option<Arc<DbContextObserver>>>,
    isolation_level: Mutex<Option<IsolationLevel>>,
    mode: Mutex<UnitOfWorkMode>,
    pub(super) lock: ExclusiveLock,
    this: Weak<UnitOfWork<C>>,
}

impl<C: DbContext> UnitOfWork<C> {
    pub(crate) fn new(
        factory: Arc<dyn DbContextFactory<C>>,
        options: Arc<DbContextScopeOptions>,
    ) -> Arc<Self> {
        Arc::new_cyclic(|this| Self {
            factory,
            options,
            db_context: Mutex::new(None),
            observer: Mutex::new(None),
            isolation_level: Mutex::new(None),
            mode: Mutex::new(UnitOfWorkMode::Manual),
            lock: ExclusiveLock::new("UnitOfWork"),
            this: this.clone(),
        })
    }

    pub fn options(&self) -> &DbContextScopeOptions {
        &self.options
    }

    pub fn is_disposed(&self) -> bool {
        self.lock.is_disposed()
    }

    /// The context of this unit of work, created on first use
    pub fn db_context(&self) -> Result<Arc<C>> {
        let existing = self.db_context.lock()?.clone();
        if let Some(context) = existing {
            return Ok(context);
        }

        let _guard = self.lock.acquire()?;
        let mut slot = self.db_context.lock()?;
        if let Some(context) = slot.as_ref() {
            return Ok(context.clone());
        }

        let context = Arc::new(self.factory.create_db_context()?);
        *slot = Some(context.clone());
        debug!("Created database context {}", std::any::type_name::<C>());
        Ok(context)
    }

    /// The observer attached to this unit of work's context, attached on
    /// first use
    pub fn observer(&self) -> Result<Arc<DbContextObserver>> {
        let existing = self.observer.lock()?.clone();
        if let Some(observer) = existing {
            return Ok(observer);
        }

        // Resolved before locking: creating the context takes the lock too
        let context = self.db_context()?;

        let _guard = self.lock.acquire()?;
        let mut slot = self.observer.lock()?;
        if let Some(observer) = slot.as_ref() {
            return Ok(observer.clone());
        }

        let callbacks: Arc<dyn ObserverCallbacks> = Arc::new(UnitOfWorkCallbacks {
            unit_of_work: self.this.clone(),
        });
        let observer = DbContextObserver::attach(context.as_ref(), &self.options, callbacks)?;
        *slot = Some(observer.clone());
        Ok(observer)
    }

    pub fn mode(&self) -> Result<UnitOfWorkMode> {
        Ok(*self.mode.lock()?)
    }

    /// Promotes the unit of work to `target`. Promoting to the current mode
    /// does nothing.
    pub fn promote_to_mode(&self, target: UnitOfWorkMode) -> Result<()> {
        self.lock.ensure_not_disposed()?;
        let mut mode = self.mode.lock()?;
        *mode = mode.transition(target)?;
        Ok(())
    }

    pub fn isolation_level(&self) -> Result<Option<IsolationLevel>> {
        Ok(*self.isolation_level.lock()?)
    }

    /// Sets the isolation level used for the transaction.
    ///
    /// The level is write-once: once set, only the same value is accepted.
    pub fn set_isolation_level(&self, level: Option<IsolationLevel>) -> Result<()> {
        let mut current = self.isolation_level.lock()?;
        if let Some(existing) = *current {
            if level != Some(existing) {
                return Err(DbError::InvalidOperation(format!(
                    "Attempted to set the isolation level to {} when it was already set to {}.",
                    level.map_or_else(|| "none".to_string(), |l| l.to_string()),
                    existing
                )));
            }
        }
        *current = level;
        Ok(())
    }

    /// Saves pending changes before queries while driven by scoped execution
    pub(crate) fn try_add_auto_flush_behavior(&self) -> Result<()> {
        self.observer()?.enable_auto_flush();
        Ok(())
    }

    /// Invalidates the unit of work until [`undo_invalidation`](Self::undo_invalidation)
    pub(crate) fn invalidate(&self) -> Result<()> {
        self.observer()?.mark_as_transaction_aborted();
        Ok(())
    }

    /// Makes an invalidated unit of work usable again, once per-attempt
    /// state has been reset
    pub fn undo_invalidation(&self) -> Result<()> {
        self.observer()?.unmark_as_transaction_aborted();
        Ok(())
    }

    pub fn is_invalidated(&self) -> Result<bool> {
        let existing = self.observer.lock()?.clone();
        Ok(existing.is_some_and(|observer| observer.is_transaction_aborted()))
    }

    /// Takes the owned context and observer out, if disposal wins the lock
    fn begin_dispose(&self) -> Result<Option<(Option<Arc<C>>, Option<Arc<DbContextObserver>>)>> {
        if !self.lock.try_dispose()? {
            return Ok(None);
        }

        let observer = self.observer.lock()?.take();
        let context = self.db_context.lock()?.take();
        Ok(Some((context, observer)))
    }

    /// Detaches the observer, rolls back any open transaction and closes
    /// the connection. Later calls do nothing.
    pub fn dispose(&self) -> Result<()> {
        let Some((context, observer)) = self.begin_dispose()? else {
            return Ok(());
        };
        let Some(context) = context else {
            return Ok(());
        };

        let mut errors = Vec::new();
        if let Some(observer) = observer {
            observer.disable_auto_flush();
            if let Err(err) = observer.detach(context.as_ref()) {
                errors.push(err);
            }
        }
        if context.has_active_transaction() {
            debug!("Rolling back the transaction of a disposed unit of work");
            if let Err(err) = context.rollback_transaction() {
                errors.push(err);
            }
        }
        if let Err(err) = context.close_connection() {
            errors.push(err);
        }

        Self::finish_dispose(errors)
    }

    pub async fn dispose_async(&self) -> Result<()> {
        let Some((context, observer)) = self.begin_dispose()? else {
            return Ok(());
        };
        let Some(context) = context else {
            return Ok(());
        };

        let mut errors = Vec::new();
        if let Some(observer) = observer {
            observer.disable_auto_flush();
            if let Err(err) = observer.detach(context.as_ref()) {
                errors.push(err);
            }
        }
        if context.has_active_transaction() {
            debug!("Rolling back the transaction of a disposed unit of work");
            let cancellation = CancellationToken::new();
            if let Err(err) = context.rollback_transaction_async(&cancellation).await {
                errors.push(err);
            }
        }
        if let Err(err) = context.close_connection_async().await {
            errors.push(err);
        }

        Self::finish_dispose(errors)
    }

    fn finish_dispose(errors: Vec<DbError>) -> Result<()> {
        match DbError::aggregate(errors) {
            Some(err) => {
                warn!("Disposing a unit of work failed: {}", err);
                Err(err)
            }
            None => Ok(()),
        }
    }
}

impl<C: DbContext> fmt::Debug for UnitOfWork<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UnitOfWork")
            .field("context", &std::any::type_name::<C>())
            .field("mode", &self.mode.lock().ok().map(|m| *m))
            .field("disposed", &self.lock.is_disposed())
            .finish()
    }
}

/// Routes observer requests back to the unit of work without keeping it alive
struct UnitOfWorkCallbacks<C: DbContext> {
    unit_of_work: Weak<UnitOfWork<C>>,
}

impl<C: DbContext> UnitOfWorkCallbacks<C> {
    fn upgrade(&self) -> Result<Arc<UnitOfWork<C>>> {
        self.unit_of_work
            .upgrade()
            .ok_or_else(|| DbError::ObjectDisposed("UnitOfWork".to_string()))
    }
}

#[async_trait]
impl<C: DbContext> ObserverCallbacks for UnitOfWorkCallbacks<C> {
    fn will_save_changes(&self) -> Result<()> {
        self.upgrade()?.try_start_transaction().map(drop)
    }

    async fn will_save_changes_async(&self, cancellation: &CancellationToken) -> Result<()> {
        let unit_of_work = self.upgrade()?;
        unit_of_work
            .try_start_transaction_async(cancellation)
            .await
            .map(drop)
    }

    fn save_before_load(&self) -> Result<()> {
        self.upgrade()?.db_context()?.save_changes().map(drop)
    }

    async fn save_before_load_async(&self, cancellation: &CancellationToken) -> Result<()> {
        let context = self.upgrade()?.db_context()?;
        context.save_changes_async(cancellation).await.map(drop)
    }
}

// ============================================================================
// Database Context Scopes
// ============================================================================
//
// A DbContextScope is an entry on the ambient chain that carries a shared
// UnitOfWork. Root scopes own their unit of work and dispose it; joined
// scopes only alias the root's.
//
// ============================================================================

mod lock;
mod transactions;
mod unit_of_work;

pub use unit_of_work::{UnitOfWork, UnitOfWorkMode};

use crate::ambient::AmbientScope;
use crate::config::DbContextScopeOptions;
use crate::context::{DbContext, DbContextFactory};
use crate::core::{DbError, Result, ScopeOption};
use log::warn;
use std::sync::Arc;

/// Manually managed scope giving a call tree ambient access to one unit of
/// work.
///
/// Dispose explicitly (or drop) in reverse order of creation. In async code
/// that creates scopes manually, run inside [`ambient::flow`](crate::ambient::flow)
/// so that the scope survives `.await` on multi-threaded runtimes.
///
/// # Examples
///
/// ```ignore
/// let scope = provider.create_scope(None)?;
/// let context = scope.db_context()?;
/// context.add("orders", 1, "pending")?;
/// context.save_changes()?;
/// scope.dispose()?;
/// ```
pub struct DbContextScope<C: DbContext> {
    ambient: AmbientScope<UnitOfWork<C>>,
}

impl<C: DbContext> DbContextScope<C> {
    pub(crate) fn create(
        factory: &Arc<dyn DbContextFactory<C>>,
        options: &Arc<DbContextScopeOptions>,
        option: ScopeOption,
    ) -> Result<Self> {
        let ambient = AmbientScope::activate(option, || {
            Ok(UnitOfWork::new(factory.clone(), options.clone()))
        })?;
        Ok(Self { ambient })
    }

    /// Whether this scope owns its unit of work
    pub fn is_root_scope(&self) -> bool {
        self.ambient.is_root()
    }

    pub fn unit_of_work(&self) -> &Arc<UnitOfWork<C>> {
        self.ambient.value()
    }

    pub fn db_context(&self) -> Result<Arc<C>> {
        self.unit_of_work().db_context()
    }

    /// The unit of work of the nearest ambient scope for `C`
    pub fn current_unit_of_work() -> Result<Arc<UnitOfWork<C>>> {
        AmbientScope::<UnitOfWork<C>>::current().ok_or_else(|| {
            DbError::InvalidOperation(format!(
                "No scope for {} is ambient. Create a scope or run inside scoped execution.",
                std::any::type_name::<C>()
            ))
        })
    }

    /// The context of the nearest ambient scope for `C`
    pub fn current_db_context() -> Result<Arc<C>> {
        Self::current_unit_of_work()?.db_context()
    }

    /// Whether a scope for `C` is ambient
    pub fn has_db_context() -> bool {
        AmbientScope::<UnitOfWork<C>>::current().is_some()
    }

    /// Leaves the ambient chain and, for a root scope, disposes its unit
    /// of work. Later calls do nothing.
    pub fn dispose(&self) -> Result<()> {
        if !self.ambient.deactivate() || !self.ambient.is_root() {
            return Ok(());
        }
        self.unit_of_work().dispose()
    }

    pub async fn dispose_async(&self) -> Result<()> {
        if !self.ambient.deactivate() || !self.ambient.is_root() {
            return Ok(());
        }
        self.unit_of_work().dispose_async().await
    }
}

impl<C: DbContext> Drop for DbContextScope<C> {
    fn drop(&mut self) {
        if let Err(err) = self.dispose() {
            warn!("Failed to dispose a database context scope: {}", err);
        }
    }
}

//! Access to the current context from code that is not handed a scope.

use crate::context::{DbContext, DbContextFactory};
use crate::core::Result;
use crate::scope::DbContextScope;
use std::marker::PhantomData;
use std::sync::{Arc, OnceLock};

pub trait DbContextAccessor<C: DbContext>: Send + Sync {
    fn has_db_context(&self) -> bool;

    /// # Errors
    /// Returns error if no context is available
    fn current_db_context(&self) -> Result<Arc<C>>;
}

/// Reads the context of the innermost active scope
pub struct AmbientDbContextAccessor<C: DbContext> {
    _context: PhantomData<fn() -> C>,
}

impl<C: DbContext> AmbientDbContextAccessor<C> {
    pub fn new() -> Self {
        Self {
            _context: PhantomData,
        }
    }
}

impl<C: DbContext> Default for AmbientDbContextAccessor<C> {
    fn default() -> Self {
        Self::new()
    }
}

impl<C: DbContext> Clone for AmbientDbContextAccessor<C> {
    fn clone(&self) -> Self {
        Self::new()
    }
}

impl<C: DbContext> DbContextAccessor<C> for AmbientDbContextAccessor<C> {
    fn has_db_context(&self) -> bool {
        DbContextScope::<C>::has_db_context()
    }

    fn current_db_context(&self) -> Result<Arc<C>> {
        DbContextScope::<C>::current_db_context()
    }
}

/// Creates one context on first access and returns it for its lifetime
pub struct FixedDbContextAccessor<C: DbContext> {
    factory: Arc<dyn DbContextFactory<C>>,
    context: OnceLock<Arc<C>>,
}

impl<C: DbContext> FixedDbContextAccessor<C> {
    pub fn new(factory: impl DbContextFactory<C> + 'static) -> Self {
        Self {
            factory: Arc::new(factory),
            context: OnceLock::new(),
        }
    }
}

impl<C: DbContext> DbContextAccessor<C> for FixedDbContextAccessor<C> {
    fn has_db_context(&self) -> bool {
        true
    }

    fn current_db_context(&self) -> Result<Arc<C>> {
        if let Some(context) = self.context.get() {
            return Ok(context.clone());
        }

        let created = Arc::new(self.factory.create_db_context()?);
        // A racing caller may have won; keep its context
        Ok(self.context.get_or_init(|| created).clone())
    }
}

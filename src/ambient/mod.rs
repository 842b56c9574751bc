// ============================================================================
// Ambient Scope Stack
// ============================================================================
//
// Gives a call tree access to the "current" scope object of a given type
// without passing it around.
//
// The chain is an immutable linked list of nodes. Each logical flow owns a
// head pointer:
//
// - inside `flow(..)` the head lives in a tokio task-local, so it survives
//   `.await` and moves with the task between worker threads
// - outside any flow the head lives in a thread-local
//
// A node is disposed exactly once. Disposing the head pops it together with
// any already-disposed ancestors; disposing a node further down only marks
// it, and lookups skip marked nodes.
//
// ============================================================================

pub mod external;

pub use external::ExternalTransactionScope;

use crate::core::{DbError, Result, ScopeOption};
use std::any::Any;
use std::cell::RefCell;
use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

struct Node {
    value: Arc<dyn Any + Send + Sync>,
    parent: Option<Arc<Node>>,
    disposed: AtomicBool,
}

#[derive(Clone, Default)]
struct Chain {
    head: Option<Arc<Node>>,
    external_transactions: usize,
}

impl Chain {
    fn pop_disposed(&mut self) {
        while let Some(head) = self.head.clone() {
            if !head.disposed.load(Ordering::Acquire) {
                break;
            }
            self.head = head.parent.clone();
        }
    }
}

tokio::task_local! {
    static TASK_CHAIN: RefCell<Chain>;
}

thread_local! {
    static THREAD_CHAIN: RefCell<Chain> = RefCell::new(Chain::default());
}

fn in_task_flow() -> bool {
    TASK_CHAIN.try_with(|_| ()).is_ok()
}

fn with_chain<R>(f: impl FnOnce(&mut Chain) -> R) -> R {
    if in_task_flow() {
        TASK_CHAIN.with(|chain| f(&mut chain.borrow_mut()))
    } else {
        THREAD_CHAIN.with(|chain| f(&mut chain.borrow_mut()))
    }
}

/// Runs `future` with its own ambient chain, seeded from the caller's.
///
/// Scopes created inside the future stay visible across `.await` points
/// even when the runtime moves the task to another thread. Nested calls
/// reuse the enclosing flow.
pub fn flow<F: Future>(future: F) -> impl Future<Output = F::Output> {
    let seed = if in_task_flow() {
        None
    } else {
        Some(THREAD_CHAIN.with(|chain| chain.borrow().clone()))
    };

    async move {
        match seed {
            Some(chain) => TASK_CHAIN.scope(RefCell::new(chain), future).await,
            None => future.await,
        }
    }
}

/// Snapshot of the caller's ambient chain, for handing to a spawned task
#[derive(Clone)]
pub struct AmbientContext {
    chain: Chain,
}

/// Captures the current ambient chain.
///
/// ```ignore
/// let ambient = dbscope::ambient::capture();
/// tokio::spawn(ambient.flow(async move { /* sees the caller's scopes */ }));
/// ```
pub fn capture() -> AmbientContext {
    AmbientContext {
        chain: with_chain(|chain| chain.clone()),
    }
}

impl AmbientContext {
    /// Runs `future` on a fresh flow seeded from this snapshot
    pub async fn flow<F: Future>(self, future: F) -> F::Output {
        TASK_CHAIN.scope(RefCell::new(self.chain), future).await
    }
}

/// An entry on the ambient chain carrying a shared value of type `T`.
///
/// A joined entry aliases its parent's value; a root entry carries a value
/// of its own.
pub struct AmbientScope<T: Send + Sync + 'static> {
    node: Arc<Node>,
    value: Arc<T>,
    is_root: bool,
}

impl<T: Send + Sync + 'static> AmbientScope<T> {
    /// Pushes a new entry, joining or creating according to `option`.
    ///
    /// `create` only runs when the entry becomes a root.
    pub fn activate(option: ScopeOption, create: impl FnOnce() -> Result<Arc<T>>) -> Result<Self> {
        let parent = Self::current();

        let (value, is_root) = match (option, parent) {
            (ScopeOption::NoNesting, Some(_)) => {
                return Err(DbError::InvalidOperation(format!(
                    "This operation does not support nesting, and it is already nested in a scope of type {}.",
                    std::any::type_name::<T>()
                )));
            }
            (ScopeOption::JoinExisting, Some(parent)) => (parent, false),
            _ => (create()?, true),
        };

        let shared: Arc<dyn Any + Send + Sync> = value.clone();
        let node = with_chain(|chain| {
            let node = Arc::new(Node {
                value: shared,
                parent: chain.head.clone(),
                disposed: AtomicBool::new(false),
            });
            chain.head = Some(node.clone());
            node
        });

        Ok(Self {
            node,
            value,
            is_root,
        })
    }

    /// The value of the nearest live entry of this type
    pub fn current() -> Option<Arc<T>> {
        with_chain(|chain| {
            let mut cursor = chain.head.clone();
            while let Some(node) = cursor {
                if !node.disposed.load(Ordering::Acquire) {
                    if let Ok(value) = node.value.clone().downcast::<T>() {
                        return Some(value);
                    }
                }
                cursor = node.parent.clone();
            }
            None
        })
    }

    pub fn value(&self) -> &Arc<T> {
        &self.value
    }

    /// Whether this entry owns its value rather than joining a parent
    pub fn is_root(&self) -> bool {
        self.is_root
    }

    pub fn is_disposed(&self) -> bool {
        self.node.disposed.load(Ordering::Acquire)
    }

    /// Removes the entry from the chain.
    ///
    /// Returns `true` only for the call that actually deactivated it.
    pub fn deactivate(&self) -> bool {
        if self.node.disposed.swap(true, Ordering::AcqRel) {
            return false;
        }

        with_chain(Chain::pop_disposed);
        true
    }
}

impl<T: Send + Sync + 'static> Drop for AmbientScope<T> {
    fn drop(&mut self) {
        self.deactivate();
    }
}

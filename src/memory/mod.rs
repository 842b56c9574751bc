// ============================================================================
// In-Memory Database
// ============================================================================
//
// A deterministic implementation of the context collaborator. Committed
// rows live in versioned tables shared by every context of a database.
// Each context owns one connection, a change tracker, and its registered
// interceptors.
//
// Fault injection makes the failure paths of scoped execution testable:
// commits can be made to fail before or after their changes are applied,
// and transaction starts can be made to fail transiently.
//
// ============================================================================

mod context;
mod tracker;
mod transaction;

pub use context::MemoryContext;
pub use transaction::{Change, Row, Transaction, TransactionManager, TransactionState};

use crate::context::DbContextFactory;
use crate::core::{DbError, IsolationLevel, Result, TransactionId, Value};
use log::{debug, warn};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

pub(crate) type Tables = BTreeMap<String, BTreeMap<i64, Row>>;

/// When an injected commit failure strikes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommitFailure {
    /// The transaction is rolled back and nothing is written
    BeforeApply,
    /// The changes are written but the commit still reports failure
    AfterApply,
}

/// Shared in-memory store. Clones refer to the same data.
#[derive(Clone)]
pub struct MemoryDatabase {
    inner: Arc<DatabaseInner>,
}

struct DatabaseInner {
    tables: Mutex<Tables>,
    transactions: TransactionManager,
    supports_interceptors: bool,
    commit_failure: Mutex<Option<CommitFailure>>,
    transient_faults: AtomicUsize,
    transactions_started: AtomicUsize,
}

impl Default for MemoryDatabase {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryDatabase {
    pub fn new() -> Self {
        Self::build(true)
    }

    /// A database whose contexts reject interceptors, like an outdated
    /// object mapper
    pub fn without_interceptor_support() -> Self {
        Self::build(false)
    }

    fn build(supports_interceptors: bool) -> Self {
        Self {
            inner: Arc::new(DatabaseInner {
                tables: Mutex::new(Tables::new()),
                transactions: TransactionManager::new(),
                supports_interceptors,
                commit_failure: Mutex::new(None),
                transient_faults: AtomicUsize::new(0),
                transactions_started: AtomicUsize::new(0),
            }),
        }
    }

    pub fn create_context(&self) -> MemoryContext {
        MemoryContext::new(self.clone())
    }

    /// Insert a committed row directly, bypassing contexts
    pub fn seed(&self, table: &str, id: i64, value: impl Into<Value>) -> Result<()> {
        let change = Change::Insert {
            table: table.to_string(),
            id,
            value: value.into(),
        };
        change.apply(&mut *self.inner.tables.lock()?)?;
        Ok(())
    }

    /// Number of committed rows in `table`
    pub fn row_count(&self, table: &str) -> usize {
        self.inner
            .tables
            .lock()
            .map(|tables| tables.get(table).map_or(0, BTreeMap::len))
            .unwrap_or(0)
    }

    /// Committed value of a row
    pub fn get(&self, table: &str, id: i64) -> Option<Value> {
        self.committed_row(table, id).map(|row| row.value)
    }

    pub fn version(&self, table: &str, id: i64) -> Option<u64> {
        self.committed_row(table, id).map(|row| row.version)
    }

    pub fn transactions_started(&self) -> usize {
        self.inner.transactions_started.load(Ordering::SeqCst)
    }

    pub fn active_transactions(&self) -> usize {
        self.inner.transactions.active_count()
    }

    /// Make the next commit fail
    pub fn inject_commit_failure(&self, failure: CommitFailure) -> Result<()> {
        *self.inner.commit_failure.lock()? = Some(failure);
        Ok(())
    }

    /// Make the next `count` transaction starts fail with a transient error
    pub fn inject_transient_faults(&self, count: usize) {
        self.inner.transient_faults.store(count, Ordering::SeqCst);
    }

    pub(crate) fn supports_interceptors(&self) -> bool {
        self.inner.supports_interceptors
    }

    pub(crate) fn begin(&self, isolation_level: Option<IsolationLevel>) -> Result<TransactionId> {
        let remaining = self.inner.transient_faults.load(Ordering::SeqCst);
        if remaining > 0
            && self
                .inner
                .transient_faults
                .compare_exchange(remaining, remaining - 1, Ordering::SeqCst, Ordering::SeqCst)
                .is_ok()
        {
            warn!("Injected transient fault on transaction start");
            return Err(DbError::Transient(
                "The connection was reset while starting a transaction".to_string(),
            ));
        }

        let id = self.inner.transactions.begin(isolation_level)?;
        self.inner.transactions_started.fetch_add(1, Ordering::SeqCst);
        debug!("Began transaction {}", id);
        Ok(id)
    }

    pub(crate) fn isolation_level(&self, id: TransactionId) -> Option<IsolationLevel> {
        self.inner.transactions.isolation_level(id)
    }

    /// Committed tables with the change log of `transaction` overlaid
    pub(crate) fn view(&self, transaction: Option<TransactionId>) -> Result<Tables> {
        let mut tables = self.inner.tables.lock()?.clone();
        if let Some(id) = transaction {
            for change in self.inner.transactions.changes(id)? {
                change.apply(&mut tables)?;
            }
        }
        Ok(tables)
    }

    /// Validate `changes` against what `transaction` sees, then record them
    pub(crate) fn write(&self, transaction: TransactionId, changes: Vec<Change>) -> Result<usize> {
        let mut view = self.view(Some(transaction))?;
        let mut affected = 0;
        for change in &changes {
            affected += change.apply(&mut view)?;
        }

        for change in changes {
            self.inner.transactions.record_change(transaction, change)?;
        }
        Ok(affected)
    }

    /// Apply the change log of `transaction` to the committed tables
    pub(crate) fn commit(&self, id: TransactionId) -> Result<()> {
        let failure = self.inner.commit_failure.lock()?.take();
        if failure == Some(CommitFailure::BeforeApply) {
            warn!("Injected commit failure before applying {}", id);
            self.inner.transactions.rollback(id)?;
            return Err(DbError::Transient(
                "The connection was lost before the commit completed".to_string(),
            ));
        }

        let mut tables = self.inner.tables.lock()?;
        let mut staged = tables.clone();
        let changes = self.inner.transactions.changes(id)?;
        for change in &changes {
            if let Err(err) = change.apply(&mut staged) {
                drop(tables);
                self.inner.transactions.rollback(id)?;
                return Err(err);
            }
        }

        self.inner.transactions.commit(id)?;
        *tables = staged;
        drop(tables);
        debug!("Committed transaction {} ({} changes)", id, changes.len());

        if failure == Some(CommitFailure::AfterApply) {
            warn!("Injected commit failure after applying {}", id);
            return Err(DbError::Transient(
                "The connection was lost while the commit was acknowledged".to_string(),
            ));
        }
        Ok(())
    }

    pub(crate) fn rollback(&self, id: TransactionId) -> Result<()> {
        self.inner.transactions.rollback(id)?;
        debug!("Rolled back transaction {}", id);
        Ok(())
    }

    fn committed_row(&self, table: &str, id: i64) -> Option<Row> {
        let tables = self.inner.tables.lock().ok()?;
        tables.get(table).and_then(|rows| rows.get(&id)).cloned()
    }
}

impl DbContextFactory<MemoryContext> for MemoryDatabase {
    fn create_db_context(&self) -> Result<MemoryContext> {
        Ok(self.create_context())
    }
}

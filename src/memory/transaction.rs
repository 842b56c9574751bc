// ============================================================================
// In-Memory Transactions
// ============================================================================
//
// Every transaction moves through Active -> Committed/Aborted and records
// its writes as a change log. Nothing touches the committed tables until
// the database applies the log on commit; until then the log is overlaid
// on reads made through the owning connection.
//
// ============================================================================

use super::Tables;
use crate::core::{DbError, IsolationLevel, Result, TransactionId, Value};
use std::collections::HashMap;
use std::sync::Mutex;

/// A committed row
#[derive(Debug, Clone, PartialEq)]
pub struct Row {
    pub value: Value,
    pub version: u64,
}

/// A single write recorded by a transaction
#[derive(Debug, Clone, PartialEq)]
pub enum Change {
    Insert {
        table: String,
        id: i64,
        value: Value,
    },

    /// `expected_version` is checked when present
    Update {
        table: String,
        id: i64,
        value: Value,
        expected_version: Option<u64>,
    },

    Delete {
        table: String,
        id: i64,
        expected_version: Option<u64>,
    },
}

impl Change {
    pub fn table_name(&self) -> &str {
        match self {
            Change::Insert { table, .. } => table,
            Change::Update { table, .. } => table,
            Change::Delete { table, .. } => table,
        }
    }

    /// Apply to `tables`, returning the number of affected rows.
    ///
    /// Versioned writes to a missing or changed row are conflicts. Raw
    /// writes to a missing row affect nothing.
    pub(crate) fn apply(&self, tables: &mut Tables) -> Result<usize> {
        match self {
            Change::Insert { table, id, value } => {
                let rows = tables.entry(table.clone()).or_default();
                if rows.contains_key(id) {
                    return Err(DbError::ConstraintViolation(format!(
                        "Duplicate key {} in table '{}'",
                        id, table
                    )));
                }
                rows.insert(
                    *id,
                    Row {
                        value: value.clone(),
                        version: 1,
                    },
                );
                Ok(1)
            }
            Change::Update {
                table,
                id,
                value,
                expected_version,
            } => {
                let Some(row) = tables.get_mut(table).and_then(|rows| rows.get_mut(id)) else {
                    return Self::missing(table, *id, *expected_version);
                };
                Self::check_version(table, *id, row, *expected_version)?;
                row.value = value.clone();
                row.version += 1;
                Ok(1)
            }
            Change::Delete {
                table,
                id,
                expected_version,
            } => {
                let Some(row) = tables.get(table).and_then(|rows| rows.get(id)) else {
                    return Self::missing(table, *id, *expected_version);
                };
                Self::check_version(table, *id, row, *expected_version)?;
                if let Some(rows) = tables.get_mut(table) {
                    rows.remove(id);
                }
                Ok(1)
            }
        }
    }

    fn missing(table: &str, id: i64, expected_version: Option<u64>) -> Result<usize> {
        match expected_version {
            Some(_) => Err(DbError::ConcurrencyConflict(format!(
                "Row {} in table '{}' no longer exists",
                id, table
            ))),
            None => Ok(0),
        }
    }

    fn check_version(table: &str, id: i64, row: &Row, expected: Option<u64>) -> Result<()> {
        match expected {
            Some(version) if version != row.version => Err(DbError::ConcurrencyConflict(format!(
                "Row {} in table '{}' was modified (expected version {}, found {})",
                id, table, version, row.version
            ))),
            _ => Ok(()),
        }
    }
}

/// Transaction lifecycle
///
/// ```text
/// Active ──commit──> Committed
///   │
///   └──rollback──> Aborted
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionState {
    Active,
    Committed,
    Aborted,
}

impl TransactionState {
    pub fn is_active(&self) -> bool {
        matches!(self, TransactionState::Active)
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, TransactionState::Committed | TransactionState::Aborted)
    }
}

impl std::fmt::Display for TransactionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TransactionState::Active => write!(f, "ACTIVE"),
            TransactionState::Committed => write!(f, "COMMITTED"),
            TransactionState::Aborted => write!(f, "ABORTED"),
        }
    }
}

#[derive(Debug)]
pub struct Transaction {
    id: TransactionId,
    state: TransactionState,
    isolation_level: Option<IsolationLevel>,
    changes: Vec<Change>,
}

impl Transaction {
    pub fn new(id: TransactionId, isolation_level: Option<IsolationLevel>) -> Self {
        Self {
            id,
            state: TransactionState::Active,
            isolation_level,
            changes: Vec::new(),
        }
    }

    pub fn id(&self) -> TransactionId {
        self.id
    }

    pub fn state(&self) -> TransactionState {
        self.state
    }

    pub fn isolation_level(&self) -> Option<IsolationLevel> {
        self.isolation_level
    }

    pub fn changes(&self) -> &[Change] {
        &self.changes
    }

    /// # Errors
    /// Returns error if transaction is not active
    pub fn record_change(&mut self, change: Change) -> Result<()> {
        if !self.state.is_active() {
            return Err(DbError::ExecutionError(format!(
                "Cannot record change: transaction {} is {}",
                self.id, self.state
            )));
        }

        self.changes.push(change);
        Ok(())
    }

    /// # Errors
    /// Returns error if transaction is not active
    pub fn commit(&mut self) -> Result<()> {
        if !self.state.is_active() {
            return Err(DbError::ExecutionError(format!(
                "Cannot commit: transaction {} is already {}",
                self.id, self.state
            )));
        }

        self.state = TransactionState::Committed;
        Ok(())
    }

    /// Mark as aborted and discard the change log
    ///
    /// # Errors
    /// Returns error if transaction is not active
    pub fn rollback(&mut self) -> Result<()> {
        if !self.state.is_active() {
            return Err(DbError::ExecutionError(format!(
                "Cannot rollback: transaction {} is already {}",
                self.id, self.state
            )));
        }

        self.changes.clear();
        self.state = TransactionState::Aborted;
        Ok(())
    }
}

/// Tracks the active transactions of one database
#[derive(Default)]
pub struct TransactionManager {
    transactions: Mutex<HashMap<TransactionId, Transaction>>,
}

impl TransactionManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn begin(&self, isolation_level: Option<IsolationLevel>) -> Result<TransactionId> {
        let id = TransactionId::new();
        self.transactions
            .lock()?
            .insert(id, Transaction::new(id, isolation_level));
        Ok(id)
    }

    pub fn record_change(&self, id: TransactionId, change: Change) -> Result<()> {
        let mut transactions = self.transactions.lock()?;
        Self::get_mut(&mut transactions, id)?.record_change(change)
    }

    pub fn changes(&self, id: TransactionId) -> Result<Vec<Change>> {
        let mut transactions = self.transactions.lock()?;
        Ok(Self::get_mut(&mut transactions, id)?.changes().to_vec())
    }

    pub fn isolation_level(&self, id: TransactionId) -> Option<IsolationLevel> {
        self.transactions
            .lock()
            .ok()
            .and_then(|transactions| transactions.get(&id).and_then(Transaction::isolation_level))
    }

    pub fn commit(&self, id: TransactionId) -> Result<Transaction> {
        let mut transactions = self.transactions.lock()?;
        Self::get_mut(&mut transactions, id)?.commit()?;
        Self::remove(&mut transactions, id)
    }

    pub fn rollback(&self, id: TransactionId) -> Result<Transaction> {
        let mut transactions = self.transactions.lock()?;
        Self::get_mut(&mut transactions, id)?.rollback()?;
        Self::remove(&mut transactions, id)
    }

    pub fn active_count(&self) -> usize {
        self.transactions
            .lock()
            .map(|transactions| transactions.len())
            .unwrap_or(0)
    }

    fn get_mut(
        transactions: &mut HashMap<TransactionId, Transaction>,
        id: TransactionId,
    ) -> Result<&mut Transaction> {
        transactions
            .get_mut(&id)
            .ok_or_else(|| DbError::ExecutionError(format!("Transaction {} not found", id)))
    }

    fn remove(
        transactions: &mut HashMap<TransactionId, Transaction>,
        id: TransactionId,
    ) -> Result<Transaction> {
        transactions
            .remove(&id)
            .ok_or_else(|| DbError::ExecutionError(format!("Transaction {} not found", id)))
    }
}

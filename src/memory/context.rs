use super::tracker::ChangeTracker;
use super::{Change, MemoryDatabase, Tables};
use crate::context::{
    CommandEnlistment, ContextInterceptor, ContextProbe, DbContext, TransactionAction,
};
use crate::core::{DbError, EntityState, IsolationLevel, Result, TransactionId, Value};
use async_trait::async_trait;
use log::{debug, trace};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tokio_util::sync::CancellationToken;

/// Unit-of-work handle over a [`MemoryDatabase`].
///
/// Entities are plain values keyed by table and id. Queries and raw
/// commands run through the connection's transaction, if any, and see its
/// uncommitted writes. Tracked changes reach the database only on save.
pub struct MemoryContext {
    database: MemoryDatabase,
    transaction: Mutex<Option<TransactionId>>,
    tracker: Mutex<ChangeTracker>,
    interceptors: Mutex<Vec<Arc<dyn ContextInterceptor>>>,
    connection_closes: AtomicUsize,
}

impl MemoryContext {
    pub(crate) fn new(database: MemoryDatabase) -> Self {
        Self {
            database,
            transaction: Mutex::new(None),
            tracker: Mutex::new(ChangeTracker::default()),
            interceptors: Mutex::new(Vec::new()),
            connection_closes: AtomicUsize::new(0),
        }
    }

    pub fn database(&self) -> &MemoryDatabase {
        &self.database
    }

    // ------------------------------------------------------------------
    // Entities
    // ------------------------------------------------------------------

    /// Start tracking a new entity
    pub fn add(&self, table: &str, id: i64, value: impl Into<Value>) -> Result<()> {
        self.tracker.lock()?.track_added(table, id, value.into())?;
        self.for_each_interceptor(|interceptor| {
            interceptor.entity_tracked(false);
            interceptor.entity_state_changed(EntityState::Added);
        })
    }

    /// Replace the value of a tracked entity and mark it modified
    pub fn update(&self, table: &str, id: i64, value: impl Into<Value>) -> Result<()> {
        let state = self.tracker.lock()?.modify(table, id, value.into())?;
        self.for_each_interceptor(|interceptor| interceptor.entity_state_changed(state))
    }

    /// Mark a tracked entity for deletion
    pub fn remove(&self, table: &str, id: i64) -> Result<()> {
        let state = self.tracker.lock()?.remove(table, id)?;
        self.for_each_interceptor(|interceptor| interceptor.entity_state_changed(state))
    }

    /// Change a tracked entity without notifying anyone. Only change
    /// detection on save or before a query notices it.
    pub fn modify_untracked(&self, table: &str, id: i64, value: impl Into<Value>) -> Result<()> {
        self.tracker.lock()?.modify_untracked(table, id, value.into())
    }

    pub fn tracked_count(&self) -> usize {
        self.tracker.lock().map(|tracker| tracker.len()).unwrap_or(0)
    }

    // ------------------------------------------------------------------
    // Queries
    // ------------------------------------------------------------------

    /// Load an entity. A tracked entity wins over the stored row.
    pub fn find(&self, table: &str, id: i64) -> Result<Option<Value>> {
        self.before_query()?;
        for interceptor in self.interceptors()? {
            interceptor.reader_executing(self)?;
        }
        self.read_entity(table, id)
    }

    pub async fn find_async(
        &self,
        table: &str,
        id: i64,
        cancellation: &CancellationToken,
    ) -> Result<Option<Value>> {
        self.before_query()?;
        for interceptor in self.interceptors()? {
            interceptor.reader_executing_async(self, cancellation).await?;
        }
        round_trip(cancellation).await?;
        self.read_entity(table, id)
    }

    /// Number of stored rows in `table`, ignoring unsaved changes
    pub fn count(&self, table: &str) -> Result<usize> {
        self.before_query()?;
        for interceptor in self.interceptors()? {
            interceptor.reader_executing(self)?;
        }
        Self::count_rows(&self.view()?, table)
    }

    pub async fn count_async(&self, table: &str, cancellation: &CancellationToken) -> Result<usize> {
        self.before_query()?;
        for interceptor in self.interceptors()? {
            interceptor.reader_executing_async(self, cancellation).await?;
        }
        round_trip(cancellation).await?;
        Self::count_rows(&self.view()?, table)
    }

    // ------------------------------------------------------------------
    // Raw commands
    // ------------------------------------------------------------------

    /// Run a write that bypasses the change tracker. Without a transaction
    /// it commits immediately.
    pub fn execute_raw(&self, change: Change) -> Result<usize> {
        self.before_query()?;
        for interceptor in self.interceptors()? {
            if interceptor.non_query_executing(self)? == CommandEnlistment::Reenlist {
                trace!("Raw command reenlisted in {:?}", self.current_transaction());
            }
        }
        self.run_raw(change)
    }

    pub async fn execute_raw_async(
        &self,
        change: Change,
        cancellation: &CancellationToken,
    ) -> Result<usize> {
        self.before_query()?;
        for interceptor in self.interceptors()? {
            let enlistment = interceptor.non_query_executing_async(self, cancellation).await?;
            if enlistment == CommandEnlistment::Reenlist {
                trace!("Raw command reenlisted in {:?}", self.current_transaction());
            }
        }
        round_trip(cancellation).await?;
        self.run_raw(change)
    }

    // ------------------------------------------------------------------
    // Introspection
    // ------------------------------------------------------------------

    pub fn transaction_isolation_level(&self) -> Option<IsolationLevel> {
        self.current_transaction()
            .and_then(|id| self.database.isolation_level(id))
    }

    pub fn connection_closes(&self) -> usize {
        self.connection_closes.load(Ordering::SeqCst)
    }

    // ------------------------------------------------------------------
    // Internals
    // ------------------------------------------------------------------

    fn interceptors(&self) -> Result<Vec<Arc<dyn ContextInterceptor>>> {
        Ok(self.interceptors.lock()?.clone())
    }

    fn for_each_interceptor(&self, f: impl Fn(&dyn ContextInterceptor)) -> Result<()> {
        for interceptor in self.interceptors()? {
            f(interceptor.as_ref());
        }
        Ok(())
    }

    fn before_query(&self) -> Result<()> {
        for interceptor in self.interceptors()? {
            interceptor.command_creating()?;
        }
        Ok(())
    }

    fn view(&self) -> Result<Tables> {
        let transaction = *self.transaction.lock()?;
        self.database.view(transaction)
    }

    fn count_rows(tables: &Tables, table: &str) -> Result<usize> {
        Ok(tables.get(table).map_or(0, |rows| rows.len()))
    }

    fn read_entity(&self, table: &str, id: i64) -> Result<Option<Value>> {
        let row = self.view()?.get(table).and_then(|rows| rows.get(&id)).cloned();

        let mut tracker = self.tracker.lock()?;
        if let Some((_, current)) = tracker.current(table, id) {
            return Ok(Some(current));
        }
        let Some(row) = row else {
            return Ok(None);
        };
        tracker.track_loaded(table, id, row.value.clone(), row.version)?;
        drop(tracker);

        self.for_each_interceptor(|interceptor| interceptor.entity_tracked(true))?;
        Ok(Some(row.value))
    }

    fn run_raw(&self, change: Change) -> Result<usize> {
        let transaction = *self.transaction.lock()?;
        match transaction {
            Some(transaction) => self.database.write(transaction, vec![change]),
            None => {
                let transaction = self.database.begin(None)?;
                self.write_and_commit(transaction, vec![change])
            }
        }
    }

    fn write_and_commit(&self, transaction: TransactionId, changes: Vec<Change>) -> Result<usize> {
        match self.database.write(transaction, changes) {
            Ok(affected) => {
                self.database.commit(transaction)?;
                Ok(affected)
            }
            Err(err) => {
                self.database.rollback(transaction)?;
                Err(err)
            }
        }
    }

    /// Write tracked changes after the saving hooks ran
    fn flush(&self) -> Result<usize> {
        let changes = self.tracker.lock()?.detect_changes();
        if changes.is_empty() {
            return Ok(0);
        }

        let transaction = *self.transaction.lock()?;
        let affected = match transaction {
            Some(transaction) => self.database.write(transaction, changes)?,
            None => {
                let transaction = self.database.begin(None)?;
                self.write_and_commit(transaction, changes)?
            }
        };

        self.tracker.lock()?.accept_changes();
        debug!("Saved {} changes", affected);
        Ok(affected)
    }

    fn finish_save(&self, result: Result<usize>) -> Result<usize> {
        let interceptors = self.interceptors()?;
        match &result {
            Ok(affected) => interceptors
                .iter()
                .for_each(|interceptor| interceptor.saved_changes(*affected)),
            Err(_) => interceptors
                .iter()
                .for_each(|interceptor| interceptor.save_changes_failed()),
        }
        result
    }

    fn take_transaction(&self) -> Result<TransactionId> {
        self.transaction
            .lock()?
            .take()
            .ok_or_else(|| DbError::InvalidOperation("No transaction is active".to_string()))
    }

    fn transaction_failed(&self, action: TransactionAction, error: DbError) -> DbError {
        match self.interceptors() {
            Ok(interceptors) => interceptors
                .iter()
                .fold(error, |error, interceptor| interceptor.transaction_failed(action, error)),
            Err(_) => error,
        }
    }

    fn begin_connection_transaction(
        &self,
        isolation_level: Option<IsolationLevel>,
    ) -> Result<TransactionId> {
        let mut current = self.transaction.lock()?;
        if current.is_some() {
            return Err(DbError::InvalidOperation(
                "The connection is already in a transaction".to_string(),
            ));
        }

        let id = self
            .database
            .begin(isolation_level)
            .map_err(|err| self.transaction_failed(TransactionAction::Begin, err))?;
        *current = Some(id);
        Ok(id)
    }
}

/// Stands in for the wait on a database reply
async fn round_trip(cancellation: &CancellationToken) -> Result<()> {
    tokio::select! {
        biased;
        _ = cancellation.cancelled() => Err(DbError::Cancelled),
        _ = tokio::task::yield_now() => Ok(()),
    }
}

impl ContextProbe for MemoryContext {
    fn current_transaction(&self) -> Option<TransactionId> {
        self.transaction.lock().ok().and_then(|transaction| *transaction)
    }

    fn has_pending_changes(&self) -> bool {
        self.tracker
            .lock()
            .map(|tracker| tracker.has_pending_changes())
            .unwrap_or(false)
    }
}

#[async_trait]
impl DbContext for MemoryContext {
    fn begin_transaction(&self, isolation_level: Option<IsolationLevel>) -> Result<TransactionId> {
        for interceptor in self.interceptors()? {
            interceptor.transaction_starting()?;
        }
        self.begin_connection_transaction(isolation_level)
    }

    fn commit_transaction(&self) -> Result<()> {
        let transaction = self.take_transaction()?;
        self.database
            .commit(transaction)
            .map_err(|err| self.transaction_failed(TransactionAction::Commit, err))
    }

    fn rollback_transaction(&self) -> Result<()> {
        let transaction = self.take_transaction()?;
        self.database
            .rollback(transaction)
            .map_err(|err| self.transaction_failed(TransactionAction::Rollback, err))
    }

    fn save_changes(&self) -> Result<usize> {
        let mut prepared = Ok(());
        for interceptor in self.interceptors()? {
            prepared = prepared.and_then(|_| interceptor.saving_changes());
        }
        let result = prepared.and_then(|_| self.flush());
        self.finish_save(result)
    }

    fn clear_tracked_state(&self) {
        if let Ok(mut tracker) = self.tracker.lock() {
            tracker.clear();
        }
    }

    fn close_connection(&self) -> Result<()> {
        self.connection_closes.fetch_add(1, Ordering::SeqCst);
        let open = self.transaction.lock()?.take();
        if let Some(transaction) = open {
            debug!("Closing connection with open transaction {}", transaction);
            self.database.rollback(transaction)?;
        }
        Ok(())
    }

    fn add_interceptor(&self, interceptor: Arc<dyn ContextInterceptor>) -> Result<()> {
        if !self.database.supports_interceptors() {
            return Err(DbError::UnsupportedOperation(
                "This context does not accept interceptors".to_string(),
            ));
        }
        self.interceptors.lock()?.push(interceptor);
        Ok(())
    }

    fn remove_interceptor(&self, interceptor: &Arc<dyn ContextInterceptor>) -> Result<()> {
        self.interceptors
            .lock()?
            .retain(|registered| !Arc::ptr_eq(registered, interceptor));
        Ok(())
    }

    async fn begin_transaction_async(
        &self,
        isolation_level: Option<IsolationLevel>,
        cancellation: &CancellationToken,
    ) -> Result<TransactionId> {
        round_trip(cancellation).await?;
        self.begin_transaction(isolation_level)
    }

    async fn commit_transaction_async(&self, cancellation: &CancellationToken) -> Result<()> {
        round_trip(cancellation).await?;
        self.commit_transaction()
    }

    async fn rollback_transaction_async(&self, _cancellation: &CancellationToken) -> Result<()> {
        tokio::task::yield_now().await;
        self.rollback_transaction()
    }

    async fn save_changes_async(&self, cancellation: &CancellationToken) -> Result<usize> {
        let mut prepared = Ok(());
        for interceptor in self.interceptors()? {
            if prepared.is_ok() {
                prepared = interceptor.saving_changes_async(cancellation).await;
            }
        }
        let result = match prepared {
            Ok(()) => round_trip(cancellation).await.and_then(|_| self.flush()),
            Err(err) => Err(err),
        };
        self.finish_save(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicBool;

    #[derive(Default)]
    struct Recorder {
        events: Mutex<Vec<String>>,
        fail_saving: AtomicBool,
    }

    impl Recorder {
        fn push(&self, event: impl Into<String>) {
            self.events.lock().unwrap().push(event.into());
        }

        fn events(&self) -> Vec<String> {
            self.events.lock().unwrap().clone()
        }
    }

    impl ContextInterceptor for Recorder {
        fn transaction_starting(&self) -> Result<()> {
            self.push("transaction_starting");
            Ok(())
        }

        fn transaction_failed(&self, action: TransactionAction, error: DbError) -> DbError {
            self.push(format!("transaction_failed:{:?}", action));
            error
        }

        fn command_creating(&self) -> Result<()> {
            self.push("command_creating");
            Ok(())
        }

        fn reader_executing(&self, _context: &dyn ContextProbe) -> Result<()> {
            self.push("reader_executing");
            Ok(())
        }

        fn non_query_executing(&self, _context: &dyn ContextProbe) -> Result<CommandEnlistment> {
            self.push("non_query_executing");
            Ok(CommandEnlistment::Unchanged)
        }

        fn saving_changes(&self) -> Result<()> {
            self.push("saving_changes");
            if self.fail_saving.load(Ordering::SeqCst) {
                return Err(DbError::TransactionAborted);
            }
            Ok(())
        }

        fn saved_changes(&self, affected: usize) {
            self.push(format!("saved_changes:{}", affected));
        }

        fn save_changes_failed(&self) {
            self.push("save_changes_failed");
        }

        fn entity_tracked(&self, from_query: bool) {
            self.push(format!("entity_tracked:{}", from_query));
        }

        fn entity_state_changed(&self, state: EntityState) {
            self.push(format!("entity_state_changed:{:?}", state));
        }
    }

    fn recorded_context(database: &MemoryDatabase) -> (MemoryContext, Arc<Recorder>) {
        let context = database.create_context();
        let recorder = Arc::new(Recorder::default());
        context.add_interceptor(recorder.clone()).unwrap();
        (context, recorder)
    }

    #[test]
    fn test_save_without_transaction_commits_implicitly() {
        let database = MemoryDatabase::new();
        let (context, recorder) = recorded_context(&database);

        context.add("items", 1, "one").unwrap();
        assert!(context.has_pending_changes());
        assert_eq!(context.save_changes().unwrap(), 1);

        assert_eq!(database.row_count("items"), 1);
        assert!(!context.has_pending_changes());
        assert_eq!(
            recorder.events(),
            vec![
                "entity_tracked:false",
                "entity_state_changed:Added",
                "saving_changes",
                "saved_changes:1",
            ]
        );
    }

    #[test]
    fn test_empty_save_still_runs_hooks() {
        let database = MemoryDatabase::new();
        let (context, recorder) = recorded_context(&database);

        assert_eq!(context.save_changes().unwrap(), 0);
        assert_eq!(recorder.events(), vec!["saving_changes", "saved_changes:0"]);
        assert_eq!(database.transactions_started(), 0);
    }

    #[test]
    fn test_failed_saving_hook_reports_failure() {
        let database = MemoryDatabase::new();
        let (context, recorder) = recorded_context(&database);
        recorder.fail_saving.store(true, Ordering::SeqCst);

        context.add("items", 1, "one").unwrap();
        assert!(matches!(context.save_changes(), Err(DbError::TransactionAborted)));
        assert_eq!(recorder.events().last().unwrap(), "save_changes_failed");
        assert_eq!(database.row_count("items"), 0);
        assert!(context.has_pending_changes());
    }

    #[test]
    fn test_query_hooks_run_before_reading() {
        let database = MemoryDatabase::new();
        database.seed("items", 1, "one").unwrap();
        let (context, recorder) = recorded_context(&database);

        assert_eq!(context.find("items", 1).unwrap(), Some(Value::from("one")));
        assert_eq!(context.find("items", 2).unwrap(), None);
        assert_eq!(
            recorder.events()[..3],
            ["command_creating", "reader_executing", "entity_tracked:true"]
        );
        assert_eq!(context.tracked_count(), 1);
    }

    #[test]
    fn test_transaction_writes_are_private_until_commit() {
        let database = MemoryDatabase::new();
        let (context, _) = recorded_context(&database);
        let other = database.create_context();

        context.begin_transaction(Some(IsolationLevel::ReadCommitted)).unwrap();
        assert_eq!(context.transaction_isolation_level(), Some(IsolationLevel::ReadCommitted));
        context.add("items", 1, "one").unwrap();
        context.save_changes().unwrap();

        assert_eq!(context.count("items").unwrap(), 1);
        assert_eq!(other.count("items").unwrap(), 0);

        context.commit_transaction().unwrap();
        assert_eq!(other.count("items").unwrap(), 1);
        assert!(!context.has_active_transaction());
    }

    #[test]
    fn test_begin_twice_fails() {
        let database = MemoryDatabase::new();
        let context = database.create_context();

        context.begin_transaction(None).unwrap();
        assert!(matches!(
            context.begin_transaction(None),
            Err(DbError::InvalidOperation(_))
        ));
    }

    #[test]
    fn test_stale_update_is_a_conflict() {
        let database = MemoryDatabase::new();
        database.seed("items", 1, "one").unwrap();
        let context = database.create_context();
        let other = database.create_context();

        context.find("items", 1).unwrap();
        other.find("items", 1).unwrap();
        other.update("items", 1, "changed elsewhere").unwrap();
        other.save_changes().unwrap();

        context.modify_untracked("items", 1, "uno").unwrap();
        let result = context.save_changes();
        assert!(result.unwrap_err().is_concurrency_conflict());
    }

    #[test]
    fn test_duplicate_insert_is_a_constraint_violation() {
        let database = MemoryDatabase::new();
        database.seed("items", 1, "one").unwrap();
        let context = database.create_context();

        context.add("items", 1, "again").unwrap();
        assert!(matches!(
            context.save_changes(),
            Err(DbError::ConstraintViolation(_))
        ));
        assert!(matches!(
            context.add("items", 1, "third"),
            Err(DbError::InvalidOperation(_))
        ));
    }

    #[test]
    fn test_failed_commit_goes_through_interceptors() {
        let database = MemoryDatabase::new();
        let (context, recorder) = recorded_context(&database);
        database.inject_commit_failure(crate::memory::CommitFailure::BeforeApply).unwrap();

        context.begin_transaction(None).unwrap();
        assert!(context.commit_transaction().unwrap_err().is_transient());
        assert!(recorder.events().contains(&"transaction_failed:Commit".to_string()));
        assert!(context.current_transaction().is_none());
    }

    #[test]
    fn test_close_connection_rolls_back() {
        let database = MemoryDatabase::new();
        let context = database.create_context();

        context.begin_transaction(None).unwrap();
        context.execute_raw(Change::Insert {
            table: "items".to_string(),
            id: 1,
            value: Value::from("raw"),
        })
        .unwrap();
        context.close_connection().unwrap();

        assert_eq!(context.connection_closes(), 1);
        assert!(context.current_transaction().is_none());
        assert_eq!(database.row_count("items"), 0);
        assert_eq!(database.active_transactions(), 0);
    }

    #[test]
    fn test_raw_command_autocommits() {
        let database = MemoryDatabase::new();
        let (context, recorder) = recorded_context(&database);

        let affected = context
            .execute_raw(Change::Insert {
                table: "items".to_string(),
                id: 1,
                value: Value::from("raw"),
            })
            .unwrap();

        assert_eq!(affected, 1);
        assert_eq!(database.row_count("items"), 1);
        assert_eq!(recorder.events(), vec!["command_creating", "non_query_executing"]);
    }

    #[test]
    fn test_interceptors_can_be_removed() {
        let database = MemoryDatabase::new();
        let (context, recorder) = recorded_context(&database);
        let registered: Arc<dyn ContextInterceptor> = recorder.clone();

        context.remove_interceptor(&registered).unwrap();
        context.save_changes().unwrap();
        assert!(recorder.events().is_empty());
    }

    #[tokio::test]
    async fn test_async_paths_match_sync_paths() {
        let database = MemoryDatabase::new();
        let (context, recorder) = recorded_context(&database);

        let cancellation = CancellationToken::new();

        context.begin_transaction_async(None, &cancellation).await.unwrap();
        context.add("items", 1, "one").unwrap();
        assert_eq!(context.save_changes_async(&cancellation).await.unwrap(), 1);
        assert_eq!(context.count_async("items", &cancellation).await.unwrap(), 1);
        assert_eq!(
            context.find_async("items", 1, &cancellation).await.unwrap(),
            Some(Value::from("one"))
        );
        context.commit_transaction_async(&cancellation).await.unwrap();

        assert_eq!(database.row_count("items"), 1);
        assert!(recorder.events().contains(&"saved_changes:1".to_string()));
    }

    #[tokio::test]
    async fn test_cancelled_async_operations_stop_before_the_database() {
        let database = MemoryDatabase::new();
        let (context, recorder) = recorded_context(&database);
        let cancellation = CancellationToken::new();
        cancellation.cancel();

        assert!(matches!(
            context.begin_transaction_async(None, &cancellation).await,
            Err(DbError::Cancelled)
        ));
        assert_eq!(database.transactions_started(), 0);

        context.add("items", 1, "one").unwrap();
        assert!(matches!(
            context.save_changes_async(&cancellation).await,
            Err(DbError::Cancelled)
        ));
        assert_eq!(recorder.events().last().unwrap(), "save_changes_failed");
        assert!(context.has_pending_changes());
        assert!(matches!(
            context.count_async("items", &cancellation).await,
            Err(DbError::Cancelled)
        ));
        assert_eq!(database.row_count("items"), 0);
    }

    #[tokio::test]
    async fn test_commit_cancelled_while_waiting_keeps_the_transaction() {
        let database = MemoryDatabase::new();
        let context = database.create_context();
        let cancellation = CancellationToken::new();

        context.begin_transaction(None).unwrap();
        context.add("items", 1, "one").unwrap();
        context.save_changes().unwrap();

        let trigger = cancellation.clone();
        tokio::spawn(async move { trigger.cancel() });

        assert!(matches!(
            context.commit_transaction_async(&cancellation).await,
            Err(DbError::Cancelled)
        ));
        assert!(context.has_active_transaction());
        assert_eq!(database.row_count("items"), 0);

        context.rollback_transaction_async(&cancellation).await.unwrap();
        assert_eq!(database.active_transactions(), 0);
    }
}

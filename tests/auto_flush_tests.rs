/// Auto-flush tests
///
/// Pending changes are saved before queries while scoped execution drives
/// the context, according to the configured detection mode.
/// Run with: cargo test --test auto_flush_tests

use dbscope::prelude::*;

fn provider_with(database: &MemoryDatabase, mode: AutoFlushMode) -> DbContextProvider<MemoryContext> {
    let options = DbContextScopeOptions::new().auto_flush_mode(mode);
    DbContextProvider::with_options(database.clone(), options).unwrap()
}

#[test]
fn test_explicit_changes_are_flushed_before_queries() {
    let database = MemoryDatabase::new();
    let provider = DbContextProvider::new(database.clone());

    provider
        .execute_scoped(|scope| {
            scope.db_context().add("items", 1, "one")?;
            assert_eq!(scope.db_context().count("items")?, 1);
            assert!(!scope.db_context().has_pending_changes());
            Ok(())
        })
        .unwrap();

    assert_eq!(database.row_count("items"), 1);
}

#[test]
fn test_implicit_changes_are_flushed_by_default() {
    let database = MemoryDatabase::new();
    database.seed("items", 1, "one").unwrap();
    let provider = DbContextProvider::new(database.clone());

    provider
        .execute_scoped(|scope| {
            let context = scope.db_context();
            context.find("items", 1)?;
            context.modify_untracked("items", 1, "uno")?;
            assert!(context.has_pending_changes());

            context.count("items")?;
            assert!(!context.has_pending_changes());
            assert!(context.has_active_transaction());
            Ok(())
        })
        .unwrap();

    assert_eq!(database.get("items", 1), Some(Value::from("uno")));
    assert_eq!(database.version("items", 1), Some(2));
}

#[test]
fn test_explicit_mode_ignores_implicit_changes() {
    let database = MemoryDatabase::new();
    database.seed("items", 1, "one").unwrap();
    database.seed("items", 2, "two").unwrap();
    let provider = provider_with(&database, AutoFlushMode::DetectExplicitChanges);

    provider
        .execute_scoped(|scope| {
            let context = scope.db_context();
            context.find("items", 1)?;
            context.modify_untracked("items", 1, "uno")?;

            context.count("items")?;
            assert!(context.has_pending_changes());
            assert!(!context.has_active_transaction());

            context.find("items", 2)?;
            context.update("items", 2, "dos")?;
            context.count("items")?;
            assert!(!context.has_pending_changes());
            Ok(())
        })
        .unwrap();

    // The explicit change flushed the implicit one with it
    assert_eq!(database.get("items", 1), Some(Value::from("uno")));
    assert_eq!(database.get("items", 2), Some(Value::from("dos")));
}

#[test]
fn test_disabled_auto_flush_leaves_changes_pending() {
    let database = MemoryDatabase::new();
    let provider = provider_with(&database, AutoFlushMode::None);

    provider
        .execute_scoped(|scope| {
            scope.db_context().add("items", 1, "one")?;
            assert_eq!(scope.db_context().count("items")?, 0);
            assert!(scope.db_context().has_pending_changes());
            Ok(())
        })
        .unwrap();

    assert_eq!(database.row_count("items"), 0);
    assert_eq!(database.transactions_started(), 0);
}

#[test]
fn test_manual_scopes_do_not_flush() {
    let database = MemoryDatabase::new();
    let provider = DbContextProvider::new(database.clone());

    let scope = provider.create_scope(None).unwrap();
    let context = scope.db_context().unwrap();
    context.add("items", 1, "one").unwrap();

    assert_eq!(context.count("items").unwrap(), 0);
    assert!(context.has_pending_changes());
    scope.dispose().unwrap();
}

#[test]
fn test_deletions_are_flushed() {
    let database = MemoryDatabase::new();
    database.seed("items", 1, "one").unwrap();
    let provider = DbContextProvider::new(database.clone());

    provider
        .execute_scoped(|scope| {
            let context = scope.db_context();
            context.find("items", 1)?;
            context.remove("items", 1)?;
            assert_eq!(context.count("items")?, 0);
            Ok(())
        })
        .unwrap();

    assert_eq!(database.row_count("items"), 0);
}

#[tokio::test]
async fn test_async_queries_flush_first() {
    let database = MemoryDatabase::new();
    let provider = DbContextProvider::new(database.clone());

    let count = provider
        .execute_scoped_async(|scope| async move {
            scope.db_context().add("items", 1, "one")?;
            scope.db_context().add("items", 2, "two")?;
            scope.db_context().count_async("items", scope.cancellation_token()).await
        })
        .await
        .unwrap();

    assert_eq!(count, 2);
    assert_eq!(database.row_count("items"), 2);
}

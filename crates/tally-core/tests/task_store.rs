use std::sync::Arc;

use tally_core::backend::{AuthProvider, Table, User};
use tally_core::error::ValidationError;
use tally_core::memory::{MemoryBackend, Op};
use tally_core::store::{
    CategoryRemoval, LOAD_FALLBACK_WARNING, StoreSettings, SyncState, TaskOrder, TaskStore,
    TextRule,
};
use tally_core::task::{Status, TaskId};
use tally_core::views::{CategoryFilter, Tab};

async fn signed_in(settings: StoreSettings) -> (Arc<MemoryBackend>, TaskStore, User) {
    let backend = Arc::new(MemoryBackend::new());
    backend.register("ada@example.com", "correct horse");
    let user = backend
        .sign_in("ada@example.com", "correct horse")
        .await
        .expect("sign in");
    let mut store = TaskStore::new(backend.clone(), settings);
    store.load(&user).await;
    (backend, store, user)
}

async fn add(store: &mut TaskStore, text: &str, category: &str) -> TaskId {
    store.set_input(text);
    store.set_category_input(category);
    store.add_task().await.expect("add task")
}

fn texts(store: &TaskStore) -> Vec<String> {
    store.visible().iter().map(|t| t.row.text.clone()).collect()
}

#[tokio::test]
async fn blank_and_short_text_never_reach_the_backend() {
    let (backend, mut store, _) = signed_in(StoreSettings::default()).await;

    store.set_input("   ");
    assert_eq!(store.add_task().await, Err(ValidationError::Blank));
    assert_eq!(store.error(), Some("Task text cannot be empty"));
    assert!(store.tasks().is_empty());

    let (strict_backend, mut strict, _) = signed_in(StoreSettings {
        rule: TextRule::LongerThanThree,
        order: TaskOrder::NewestFirst,
    })
    .await;
    strict.set_input(" abc ");
    assert_eq!(strict.add_task().await, Err(ValidationError::TooShort));
    assert_eq!(strict.input(), " abc ");
    assert!(strict.tasks().is_empty());

    assert_eq!(backend.calls(Op::Insert), 0);
    assert_eq!(strict_backend.calls(Op::Insert), 0);
}

#[tokio::test]
async fn added_task_is_stored_and_input_cleared() {
    let (backend, mut store, user) = signed_in(StoreSettings::default()).await;

    let id = add(&mut store, "  water the plants ", "").await;
    assert!(id > 0);
    assert_eq!(store.input(), "");
    assert_eq!(store.error(), None);

    let entry = store.task(id).expect("task in list");
    assert_eq!(entry.sync, SyncState::Confirmed);
    assert_eq!(entry.row.text, "water the plants");
    assert_eq!(entry.row.status, Status::NotStarted);

    let rows = backend.rows(Table::Todos);
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0]["task"], "water the plants");
    assert_eq!(rows[0]["user_id"], user.id.to_string());
}

#[tokio::test]
async fn category_is_created_once_and_reused_across_case() {
    let (backend, mut store, _) = signed_in(StoreSettings::default()).await;

    let first = add(&mut store, "write report", "Work").await;
    let second = add(&mut store, "file expenses", "work").await;

    assert_eq!(store.categories().len(), 1);
    let work = &store.categories()[0];
    assert_eq!(work.name, "Work");
    assert!(work.id > 0);
    for id in [first, second] {
        assert_eq!(store.task(id).expect("task").row.category_id, Some(work.id));
    }
    assert_eq!(backend.calls(Op::Upsert), 1);
    assert_eq!(backend.rows(Table::Categories).len(), 1);
    assert_eq!(store.count_in(CategoryFilter::Category(work.id)), 2);
}

#[tokio::test]
async fn emptied_category_is_pruned_and_revived_by_name() {
    let (backend, mut store, _) = signed_in(StoreSettings::default()).await;

    let a = add(&mut store, "mow lawn", "Home").await;
    let b = add(&mut store, "fix sink", "Home").await;
    let home = store.category_named("home").expect("category").id;
    store.set_filter(CategoryFilter::Category(home));

    store.delete_task(a).await.expect("delete");
    assert!(store.category_named("Home").is_some());

    store.delete_task(b).await.expect("delete");
    assert!(store.categories().is_empty());
    assert_eq!(store.filter(), CategoryFilter::All);

    let c = add(&mut store, "paint fence", "HOME").await;
    assert_eq!(store.task(c).expect("task").row.category_id, Some(home));
    assert_eq!(backend.calls(Op::Upsert), 1);
}

#[tokio::test]
async fn cycling_three_times_returns_to_not_started() {
    let (backend, mut store, _) = signed_in(StoreSettings::default()).await;
    let id = add(&mut store, "read a book", "").await;

    assert_eq!(store.cycle_status(id).await, Ok(Status::InProgress));
    assert_eq!(store.cycle_status(id).await, Ok(Status::Completed));
    assert!(store.task(id).expect("task").row.completed());
    let rows = backend.rows(Table::Todos);
    assert_eq!(rows[0]["status"], "completed");
    assert_eq!(rows[0]["is_complete"], true);

    assert_eq!(store.cycle_status(id).await, Ok(Status::NotStarted));
    assert!(!store.task(id).expect("task").row.completed());
    assert_eq!(backend.rows(Table::Todos)[0]["is_complete"], false);
}

#[tokio::test]
async fn category_filter_selects_matching_tasks() {
    let (_, mut store, _) = signed_in(StoreSettings::default()).await;
    add(&mut store, "loose end", "").await;
    add(&mut store, "standup", "Work").await;
    add(&mut store, "laundry", "Home").await;
    let work = store.category_named("work").expect("category").id;

    store.set_filter(CategoryFilter::Uncategorized);
    assert_eq!(texts(&store), vec!["loose end"]);

    store.set_filter(CategoryFilter::Category(work));
    assert_eq!(texts(&store), vec!["standup"]);

    store.set_filter(CategoryFilter::All);
    assert_eq!(texts(&store), vec!["laundry", "standup", "loose end"]);
}

#[tokio::test]
async fn tabs_and_clear_completed() {
    let (backend, mut store, _) = signed_in(StoreSettings::default()).await;
    add(&mut store, "A", "").await;
    let b = add(&mut store, "B", "").await;

    assert_eq!(store.toggle_complete(b).await, Ok(true));

    store.set_tab(Tab::Active);
    assert_eq!(texts(&store), vec!["A"]);
    store.set_tab(Tab::Completed);
    assert_eq!(texts(&store), vec!["B"]);

    assert_eq!(store.clear_completed().await, Ok(1));
    store.set_tab(Tab::All);
    assert_eq!(texts(&store), vec!["A"]);
    assert_eq!(store.summary().to_string(), "1 active, 0 completed");
    assert_eq!(backend.rows(Table::Todos).len(), 1);
}

#[tokio::test]
async fn oldest_first_appends_new_tasks() {
    let (_, mut store, user) = signed_in(StoreSettings {
        rule: TextRule::NonBlank,
        order: TaskOrder::OldestFirst,
    })
    .await;
    add(&mut store, "first", "").await;
    add(&mut store, "second", "").await;
    assert_eq!(texts(&store), vec!["first", "second"]);

    store.load(&user).await;
    assert_eq!(texts(&store), vec!["first", "second"]);
}

#[tokio::test]
async fn edit_keeps_mode_on_invalid_text() {
    let (backend, mut store, _) = signed_in(StoreSettings::default()).await;
    let id = add(&mut store, "call mom", "").await;

    store.start_edit(id).expect("start edit");
    assert_eq!(store.editing().expect("editing").text, "call mom");

    store.set_edit_text("  ").expect("edit text");
    assert_eq!(store.save_edit().await, Err(ValidationError::Blank));
    assert!(store.editing().is_some());

    store.set_edit_text("call mom back").expect("edit text");
    store.save_edit().await.expect("save");
    assert!(store.editing().is_none());
    assert_eq!(store.task(id).expect("task").row.text, "call mom back");
    assert_eq!(backend.rows(Table::Todos)[0]["task"], "call mom back");

    store.start_edit(id).expect("start edit");
    store.set_edit_text("discarded").expect("edit text");
    store.cancel_edit();
    assert_eq!(store.task(id).expect("task").row.text, "call mom back");
    assert_eq!(store.set_edit_text("x"), Err(ValidationError::NotEditing));
}

#[tokio::test]
async fn failed_insert_keeps_task_visible_and_can_be_retried() {
    let (backend, mut store, _) = signed_in(StoreSettings::default()).await;
    backend.fail_next(Op::Insert);

    let id = add(&mut store, "renew passport", "").await;
    assert!(id < 0);
    assert_eq!(texts(&store), vec!["renew passport"]);
    assert_eq!(store.task(id).expect("task").sync, SyncState::Failed);
    assert!(
        store
            .error()
            .expect("error")
            .starts_with("Failed to add todo")
    );
    assert!(backend.rows(Table::Todos).is_empty());

    let seq = store.failed()[0].seq;
    assert_eq!(store.retry(seq).await, Ok(true));
    assert!(store.failed().is_empty());
    assert_eq!(store.error(), None);

    let entry = &store.tasks()[0];
    assert!(entry.row.id > 0);
    assert_eq!(entry.sync, SyncState::Confirmed);
    assert_eq!(backend.rows(Table::Todos).len(), 1);
}

#[tokio::test]
async fn changes_to_unsaved_task_ride_along_with_its_insert() {
    let (backend, mut store, _) = signed_in(StoreSettings::default()).await;
    backend.fail_next(Op::Insert);
    let id = add(&mut store, "book flights", "").await;

    store.cycle_status(id).await.expect("cycle");
    assert_eq!(backend.calls(Op::Update), 0);

    let seq = store.failed()[0].seq;
    assert_eq!(store.retry(seq).await, Ok(true));
    assert_eq!(backend.rows(Table::Todos)[0]["status"], "in_progress");
}

#[tokio::test]
async fn failed_update_can_be_reverted() {
    let (backend, mut store, _) = signed_in(StoreSettings::default()).await;
    let id = add(&mut store, "sort photos", "").await;

    backend.fail_next(Op::Update);
    assert_eq!(store.cycle_status(id).await, Ok(Status::InProgress));
    assert_eq!(store.task(id).expect("task").sync, SyncState::Failed);
    assert_eq!(store.failed().len(), 1);

    let seq = store.failed()[0].seq;
    store.revert(seq).expect("revert");
    let entry = store.task(id).expect("task");
    assert_eq!(entry.row.status, Status::NotStarted);
    assert_eq!(entry.sync, SyncState::Confirmed);
    assert!(store.failed().is_empty());
    assert_eq!(backend.rows(Table::Todos)[0]["status"], "not_started");
}

#[tokio::test]
async fn repeated_update_failures_share_one_entry() {
    let (backend, mut store, _) = signed_in(StoreSettings::default()).await;
    let id = add(&mut store, "tune guitar", "").await;

    backend.fail_next(Op::Update);
    backend.fail_next(Op::Update);
    store.cycle_status(id).await.expect("cycle");
    store.cycle_status(id).await.expect("cycle");
    assert_eq!(store.failed().len(), 1);

    let seq = store.failed()[0].seq;
    store.revert(seq).expect("revert");
    assert_eq!(
        store.task(id).expect("task").row.status,
        Status::NotStarted
    );
}

#[tokio::test]
async fn failed_delete_can_be_dismissed_or_reverted() {
    let (backend, mut store, _) = signed_in(StoreSettings::default()).await;
    let keep = add(&mut store, "keep me", "Errands").await;
    let gone = add(&mut store, "gone", "").await;

    backend.fail_next(Op::Delete);
    store.delete_task(gone).await.expect("delete");
    assert!(store.task(gone).is_none());
    let seq = store.failed()[0].seq;
    store.dismiss(seq).expect("dismiss");
    assert!(store.failed().is_empty());
    assert_eq!(store.error(), None);
    assert_eq!(backend.rows(Table::Todos).len(), 2);

    backend.fail_next(Op::Delete);
    store.delete_task(keep).await.expect("delete");
    assert!(store.categories().is_empty());
    let seq = store.failed()[0].seq;
    store.revert(seq).expect("revert");
    assert!(store.task(keep).is_some());
    assert!(store.category_named("errands").is_some());
    assert_eq!(store.dismiss(seq), Err(ValidationError::UnknownSync(seq)));
}

#[tokio::test]
async fn failed_clear_is_journaled_and_revertible() {
    let (backend, mut store, _) = signed_in(StoreSettings::default()).await;
    let a = add(&mut store, "A", "").await;
    let b = add(&mut store, "B", "").await;
    store.toggle_complete(a).await.expect("toggle");
    store.toggle_complete(b).await.expect("toggle");

    backend.fail_next(Op::Delete);
    assert_eq!(store.clear_completed().await, Ok(2));
    assert!(store.tasks().is_empty());
    assert!(
        store
            .error()
            .expect("error")
            .starts_with("Failed to clear completed todos")
    );

    let seq = store.failed()[0].seq;
    store.revert(seq).expect("revert");
    assert_eq!(texts(&store), vec!["B", "A"]);
    assert_eq!(backend.rows(Table::Todos).len(), 2);
}

#[tokio::test]
async fn clearing_an_unconfirmed_completion_deletes_the_row_by_id() {
    let (backend, mut store, user) = signed_in(StoreSettings::default()).await;
    let id = add(&mut store, "finish report", "").await;

    backend.fail_next(Op::Update);
    assert_eq!(store.toggle_complete(id).await, Ok(true));
    assert_eq!(store.failed().len(), 1);
    assert_eq!(backend.rows(Table::Todos)[0]["is_complete"], false);

    assert_eq!(store.clear_completed().await, Ok(1));
    assert!(store.failed().is_empty());
    assert_eq!(store.error(), None);
    assert!(backend.rows(Table::Todos).is_empty());

    store.load(&user).await;
    assert!(store.tasks().is_empty());
}

#[tokio::test]
async fn failed_delete_of_unconfirmed_completion_is_journaled() {
    let (backend, mut store, _) = signed_in(StoreSettings::default()).await;
    let id = add(&mut store, "finish report", "").await;

    backend.fail_next(Op::Update);
    store.toggle_complete(id).await.expect("toggle");
    backend.fail_next(Op::Delete);
    backend.fail_next(Op::Delete);
    assert_eq!(store.clear_completed().await, Ok(1));
    assert!(store.tasks().is_empty());
    assert!(store.error().is_some());

    let entry = store
        .failed()
        .iter()
        .find(|f| f.action.describe() == "Failed to delete todo")
        .cloned()
        .expect("delete entry");
    assert_eq!(store.retry(entry.seq).await, Ok(true));
    assert!(backend.rows(Table::Todos).is_empty());
}

#[tokio::test]
async fn load_failure_shows_sample_tasks() {
    let backend = Arc::new(MemoryBackend::new());
    backend.register("ada@example.com", "correct horse");
    let user = backend
        .sign_in("ada@example.com", "correct horse")
        .await
        .expect("sign in");
    backend.fail_next(Op::Select);

    let mut store = TaskStore::new(backend.clone(), StoreSettings::default());
    store.load(&user).await;

    assert_eq!(store.warning(), Some(LOAD_FALLBACK_WARNING));
    assert_eq!(store.tasks().len(), 3);
    assert!(store.tasks().iter().all(|t| t.sync == SyncState::Sample));
    assert_eq!(store.summary().to_string(), "2 active, 1 completed");

    // Placeholder ids of new tasks never collide with the samples.
    backend.fail_next(Op::Insert);
    let id = add(&mut store, "real task", "").await;
    assert!(id < -3);
}

#[tokio::test]
async fn reload_restores_stored_tasks_newest_first() {
    let (_, mut store, user) = signed_in(StoreSettings::default()).await;
    add(&mut store, "older", "Work").await;
    add(&mut store, "newer", "").await;

    store.load(&user).await;
    assert_eq!(texts(&store), vec!["newer", "older"]);
    assert_eq!(store.categories().len(), 1);
    assert!(
        store
            .tasks()
            .iter()
            .all(|t| t.sync == SyncState::Confirmed)
    );
}

#[tokio::test]
async fn deleting_category_detaches_its_tasks() {
    let (backend, mut store, _) = signed_in(StoreSettings::default()).await;
    let id = add(&mut store, "quarterly review", "Work").await;
    let work = store.category_named("Work").expect("category").id;
    store.set_filter(CategoryFilter::Category(work));

    assert_eq!(
        store.delete_category(work, |_| false).await,
        Ok(CategoryRemoval::Cancelled)
    );
    assert_eq!(backend.calls(Op::Update), 0);

    backend.fail_next(Op::Update);
    assert_eq!(
        store.delete_category(work, |_| true).await,
        Ok(CategoryRemoval::Failed)
    );
    assert!(store.category_named("Work").is_some());
    assert!(
        store
            .error()
            .expect("error")
            .starts_with("Failed to delete category")
    );

    assert_eq!(
        store.delete_category(work, |c| c.name == "Work").await,
        Ok(CategoryRemoval::Removed)
    );
    assert!(store.categories().is_empty());
    assert_eq!(store.filter(), CategoryFilter::All);
    assert_eq!(store.task(id).expect("task").row.category_id, None);
    assert!(backend.rows(Table::Categories).is_empty());
    assert!(backend.rows(Table::Todos)[0]["category_id"].is_null());
}

#[tokio::test]
async fn sign_out_reset_forgets_everything() {
    let (_, mut store, _) = signed_in(StoreSettings::default()).await;
    add(&mut store, "something", "Misc").await;

    store.reset();
    assert!(store.tasks().is_empty());
    assert!(store.categories().is_empty());
    assert_eq!(store.owner(), None);
    store.set_input("after sign out");
    assert_eq!(store.add_task().await, Err(ValidationError::SignedOut));
}

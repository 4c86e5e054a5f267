//! Client-side task list with optimistic synchronisation.
//!
//! Every mutation is applied to local state first and then mirrored to the
//! table service. A remote failure never rolls the local change back on its
//! own: it is recorded as a [`FailedSync`] that the caller can retry, revert
//! or dismiss.

use std::collections::HashSet;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde_json::Value;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use crate::backend::{Filter, Order, Table, TableService, User};
use crate::error::{BackendError, ValidationError};
use crate::task::{
    Category, CategoryColor, CategoryId, NewCategory, NewTask, Status, Task, TaskId, TaskPatch,
    is_placeholder,
};
use crate::views::{self, CategoryFilter, StatusCounts, Summary, Tab};

pub const LOAD_FALLBACK_WARNING: &str = "Could not load tasks from the server; showing sample tasks";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TextRule {
    /// Trimmed text must not be empty.
    #[default]
    NonBlank,
    /// Trimmed text must also be longer than three characters.
    LongerThanThree,
}

impl TextRule {
    /// Returns the trimmed text when it is acceptable.
    pub fn check(self, text: &str) -> Result<String, ValidationError> {
        let text = text.trim();
        if text.is_empty() {
            return Err(ValidationError::Blank);
        }
        if self == TextRule::LongerThanThree && text.chars().count() <= 3 {
            return Err(ValidationError::TooShort);
        }
        Ok(text.to_string())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TaskOrder {
    #[default]
    NewestFirst,
    OldestFirst,
}

impl TaskOrder {
    fn remote(self) -> Order {
        match self {
            TaskOrder::NewestFirst => Order::desc("created_at"),
            TaskOrder::OldestFirst => Order::asc("id"),
        }
    }

    /// Position at which `task` belongs in a list already in this order;
    /// ties go first under newest-first.
    fn slot(self, tasks: &[Synced<Task>], task: &Task) -> usize {
        let after = match self {
            TaskOrder::NewestFirst => tasks
                .iter()
                .position(|t| t.row.created_at <= task.created_at),
            TaskOrder::OldestFirst => tasks
                .iter()
                .position(|t| t.row.created_at > task.created_at),
        };
        after.unwrap_or(tasks.len())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct StoreSettings {
    pub rule: TextRule,
    pub order: TaskOrder,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncState {
    /// Local change sent, no answer yet.
    Pending,
    Confirmed,
    /// The last remote call for this row failed; see the failed-sync journal.
    Failed,
    /// Offline example row shown after a failed load; never sent anywhere.
    Sample,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Synced<T> {
    pub row: T,
    pub sync: SyncState,
}

impl AsRef<Task> for Synced<Task> {
    fn as_ref(&self) -> &Task {
        &self.row
    }
}

/// Remote change that did not go through, with what is needed to re-send
/// or undo it.
#[derive(Debug, Clone, PartialEq)]
pub enum SyncAction {
    AddTask { task_id: TaskId },
    UpdateTask { task_id: TaskId, before: Task },
    DeleteTask { task: Synced<Task> },
    ClearCompleted { removed: Vec<Synced<Task>> },
}

impl SyncAction {
    pub fn describe(&self) -> &'static str {
        match self {
            SyncAction::AddTask { .. } => "Failed to add todo",
            SyncAction::UpdateTask { .. } => "Failed to update todo",
            SyncAction::DeleteTask { .. } => "Failed to delete todo",
            SyncAction::ClearCompleted { .. } => "Failed to clear completed todos",
        }
    }

    /// Task still present in the list that this entry refers to.
    pub fn task_id(&self) -> Option<TaskId> {
        match self {
            SyncAction::AddTask { task_id } | SyncAction::UpdateTask { task_id, .. } => {
                Some(*task_id)
            }
            SyncAction::DeleteTask { .. } | SyncAction::ClearCompleted { .. } => None,
        }
    }

    fn same_target(&self, other: &SyncAction) -> bool {
        match (self, other) {
            (SyncAction::AddTask { task_id: a }, SyncAction::AddTask { task_id: b }) => a == b,
            (
                SyncAction::UpdateTask { task_id: a, .. },
                SyncAction::UpdateTask { task_id: b, .. },
            ) => a == b,
            _ => false,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct FailedSync {
    pub seq: u64,
    pub action: SyncAction,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EditBuffer {
    pub task_id: TaskId,
    pub text: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CategoryRemoval {
    Cancelled,
    Removed,
    Failed,
}

pub struct TaskStore {
    tables: Arc<dyn TableService>,
    settings: StoreSettings,
    owner: Option<Uuid>,
    tasks: Vec<Synced<Task>>,
    categories: Vec<Category>,
    // Categories pruned for having no tasks; reused when the name comes back.
    pruned: Vec<Category>,
    input: String,
    category_input: String,
    editing: Option<EditBuffer>,
    filter: CategoryFilter,
    tab: Tab,
    error: Option<String>,
    warning: Option<String>,
    failed: Vec<FailedSync>,
    next_seq: u64,
    last_placeholder: i64,
}

impl TaskStore {
    pub fn new(tables: Arc<dyn TableService>, settings: StoreSettings) -> Self {
        Self {
            tables,
            settings,
            owner: None,
            tasks: vec![],
            categories: vec![],
            pruned: vec![],
            input: String::new(),
            category_input: String::new(),
            editing: None,
            filter: CategoryFilter::All,
            tab: Tab::All,
            error: None,
            warning: None,
            failed: vec![],
            next_seq: 0,
            last_placeholder: 0,
        }
    }

    pub fn settings(&self) -> StoreSettings {
        self.settings
    }

    pub fn owner(&self) -> Option<Uuid> {
        self.owner
    }

    pub fn tasks(&self) -> &[Synced<Task>] {
        &self.tasks
    }

    pub fn task(&self, id: TaskId) -> Option<&Synced<Task>> {
        self.tasks.iter().find(|t| t.row.id == id)
    }

    pub fn categories(&self) -> &[Category] {
        &self.categories
    }

    pub fn category_named(&self, name: &str) -> Option<&Category> {
        self.categories.iter().find(|c| c.matches_name(name))
    }

    pub fn category_of(&self, task: &Task) -> Option<&Category> {
        views::category_of(&self.categories, task)
    }

    pub fn input(&self) -> &str {
        &self.input
    }

    pub fn set_input(&mut self, text: impl Into<String>) {
        self.input = text.into();
    }

    pub fn category_input(&self) -> &str {
        &self.category_input
    }

    pub fn set_category_input(&mut self, name: impl Into<String>) {
        self.category_input = name.into();
    }

    /// Existing categories matching what has been typed into the category
    /// field so far.
    pub fn suggestions(&self) -> Vec<&Category> {
        views::category_suggestions(&self.categories, &self.category_input)
    }

    pub fn editing(&self) -> Option<&EditBuffer> {
        self.editing.as_ref()
    }

    pub fn filter(&self) -> CategoryFilter {
        self.filter
    }

    pub fn set_filter(&mut self, filter: CategoryFilter) {
        self.filter = filter;
    }

    pub fn tab(&self) -> Tab {
        self.tab
    }

    pub fn set_tab(&mut self, tab: Tab) {
        self.tab = tab;
    }

    pub fn error(&self) -> Option<&str> {
        self.error.as_deref()
    }

    pub fn warning(&self) -> Option<&str> {
        self.warning.as_deref()
    }

    pub fn clear_messages(&mut self) {
        self.error = None;
        self.warning = None;
    }

    pub fn failed(&self) -> &[FailedSync] {
        &self.failed
    }

    /// Tasks passing the current category filter and tab, in list order.
    pub fn visible(&self) -> Vec<&Synced<Task>> {
        views::visible(&self.tasks, self.filter, self.tab)
    }

    /// Counts over the whole list, independent of filter and tab.
    pub fn summary(&self) -> Summary {
        views::summary(&self.tasks)
    }

    pub fn count_in(&self, scope: CategoryFilter) -> usize {
        views::count_in(&self.tasks, scope)
    }

    pub fn status_counts(&self, scope: CategoryFilter) -> StatusCounts {
        views::status_counts(&self.tasks, scope)
    }

    /// Drops everything tied to the previous user.
    pub fn reset(&mut self) {
        self.owner = None;
        self.tasks.clear();
        self.categories.clear();
        self.pruned.clear();
        self.input.clear();
        self.category_input.clear();
        self.editing = None;
        self.filter = CategoryFilter::All;
        self.tab = Tab::All;
        self.error = None;
        self.warning = None;
        self.failed.clear();
        self.last_placeholder = 0;
    }

    /// Replaces local state with `user`'s rows. When the service cannot be
    /// reached the list falls back to a few sample tasks and a warning.
    #[instrument(skip(self, user), fields(owner = %user.id))]
    pub async fn load(&mut self, user: &User) {
        self.reset();
        self.owner = Some(user.id);

        let order = self.settings.order.remote();
        match fetch_rows(self.tables.as_ref(), user.id, &order).await {
            Ok((categories, tasks)) => {
                info!(
                    tasks = tasks.len(),
                    categories = categories.len(),
                    "loaded task list"
                );
                self.categories = categories;
                self.tasks = tasks
                    .into_iter()
                    .map(|row| Synced {
                        row,
                        sync: SyncState::Confirmed,
                    })
                    .collect();
                self.prune_categories();
            }
            Err(err) => {
                warn!(error = %err, "failed to load tasks; showing samples");
                self.tasks = sample_tasks(user.id, Utc::now())
                    .into_iter()
                    .map(|row| Synced {
                        row,
                        sync: SyncState::Sample,
                    })
                    .collect();
                self.last_placeholder = self.tasks.iter().map(|t| t.row.id).min().unwrap_or(0);
                self.warning = Some(LOAD_FALLBACK_WARNING.to_string());
            }
        }
    }

    /// Adds the text in the input buffer as a new task, creating the typed
    /// category if no category of that name exists yet.
    #[instrument(skip(self))]
    pub async fn add_task(&mut self) -> Result<TaskId, ValidationError> {
        let owner = self.require_owner()?;
        let text = match self.settings.rule.check(&self.input) {
            Ok(text) => text,
            Err(err) => return self.reject(err),
        };
        self.error = None;

        let now = Utc::now();
        let category_name = self.category_input.trim().to_string();
        let category_id = if category_name.is_empty() {
            None
        } else {
            Some(self.resolve_category(owner, &category_name, now))
        };

        let task = Task {
            id: self.next_placeholder(now),
            user_id: owner,
            text,
            status: Status::NotStarted,
            category_id,
            created_at: now,
            updated_at: now,
        };
        let id = task.id;
        debug!(task_id = id, "task added locally");
        self.insert_sorted(Synced {
            row: task,
            sync: SyncState::Pending,
        });
        self.input.clear();
        self.category_input.clear();

        Ok(self.push_new_task(id).await)
    }

    /// Advances not_started -> in_progress -> completed -> not_started.
    #[instrument(skip(self))]
    pub async fn cycle_status(&mut self, id: TaskId) -> Result<Status, ValidationError> {
        let current = match self.task(id) {
            Some(task) => task.row.status,
            None => return self.reject(ValidationError::UnknownTask(id)),
        };
        let status = current.next();
        self.set_status(id, status).await?;
        Ok(status)
    }

    /// Flips between completed and not_started; returns whether the task is
    /// now completed.
    #[instrument(skip(self))]
    pub async fn toggle_complete(&mut self, id: TaskId) -> Result<bool, ValidationError> {
        let completed = match self.task(id) {
            Some(task) => task.row.completed(),
            None => return self.reject(ValidationError::UnknownTask(id)),
        };
        let status = if completed {
            Status::NotStarted
        } else {
            Status::Completed
        };
        self.set_status(id, status).await?;
        Ok(status.is_completed())
    }

    async fn set_status(&mut self, id: TaskId, status: Status) -> Result<(), ValidationError> {
        self.require_owner()?;
        let now = Utc::now();
        let Some(entry) = self.task_mut(id) else {
            return self.reject(ValidationError::UnknownTask(id));
        };
        let before = entry.row.clone();
        entry.row.status = status;
        entry.row.updated_at = now;
        debug!(task_id = id, status = status.as_str(), "status changed locally");

        self.push_update(id, before, TaskPatch::status(status, now))
            .await;
        Ok(())
    }

    pub fn start_edit(&mut self, id: TaskId) -> Result<(), ValidationError> {
        let Some(text) = self.task(id).map(|t| t.row.text.clone()) else {
            return self.reject(ValidationError::UnknownTask(id));
        };
        self.editing = Some(EditBuffer { task_id: id, text });
        Ok(())
    }

    pub fn set_edit_text(&mut self, text: impl Into<String>) -> Result<(), ValidationError> {
        match self.editing.as_mut() {
            Some(edit) => {
                edit.text = text.into();
                Ok(())
            }
            None => self.reject(ValidationError::NotEditing),
        }
    }

    pub fn cancel_edit(&mut self) {
        self.editing = None;
    }

    /// Stores the edit buffer as the task text. Unacceptable text keeps the
    /// task in edit mode.
    #[instrument(skip(self))]
    pub async fn save_edit(&mut self) -> Result<(), ValidationError> {
        self.require_owner()?;
        let Some(edit) = self.editing.clone() else {
            return self.reject(ValidationError::NotEditing);
        };
        let text = match self.settings.rule.check(&edit.text) {
            Ok(text) => text,
            Err(err) => return self.reject(err),
        };
        self.error = None;

        let now = Utc::now();
        let Some(entry) = self.task_mut(edit.task_id) else {
            self.editing = None;
            return self.reject(ValidationError::UnknownTask(edit.task_id));
        };
        let before = entry.row.clone();
        entry.row.text = text.clone();
        entry.row.updated_at = now;
        self.editing = None;

        self.push_update(edit.task_id, before, TaskPatch::text(text, now))
            .await;
        Ok(())
    }

    #[instrument(skip(self))]
    pub async fn delete_task(&mut self, id: TaskId) -> Result<(), ValidationError> {
        let owner = self.require_owner()?;
        let Some(idx) = self.tasks.iter().position(|t| t.row.id == id) else {
            return self.reject(ValidationError::UnknownTask(id));
        };
        let removed = self.tasks.remove(idx);
        self.forget_task(id);
        debug!(task_id = id, "task removed locally");

        if !is_placeholder(id) {
            let result = self
                .tables
                .delete(Table::Todos, &row_filter(owner, id))
                .await;
            match result {
                Ok(()) => self.error = None,
                Err(err) => {
                    self.record_failure(SyncAction::DeleteTask { task: removed }, err);
                }
            }
        }
        self.prune_categories();
        Ok(())
    }

    /// Removes every completed task; returns how many were removed locally.
    #[instrument(skip(self))]
    pub async fn clear_completed(&mut self) -> Result<usize, ValidationError> {
        let owner = self.require_owner()?;
        let (removed, kept): (Vec<_>, Vec<_>) = std::mem::take(&mut self.tasks)
            .into_iter()
            .partition(|t| t.row.completed());
        self.tasks = kept;
        let count = removed.len();
        // A completion the service never confirmed is not matched by the
        // is_complete filter, so those rows are deleted by id instead.
        let (unconfirmed, removed): (Vec<_>, Vec<_>) = removed
            .into_iter()
            .partition(|t| !is_placeholder(t.row.id) && self.has_failed_update(t.row.id));
        for task in removed.iter().chain(&unconfirmed) {
            self.forget_task(task.row.id);
        }
        debug!(count, unconfirmed = unconfirmed.len(), "completed tasks removed locally");

        let filter = Filter::new()
            .eq("user_id", owner.to_string())
            .eq("is_complete", true);
        let result = self.tables.delete(Table::Todos, &filter).await;
        let mut synced = match result {
            Ok(()) => true,
            Err(err) => {
                self.record_failure(SyncAction::ClearCompleted { removed }, err);
                false
            }
        };
        for task in unconfirmed {
            let result = self
                .tables
                .delete(Table::Todos, &row_filter(owner, task.row.id))
                .await;
            if let Err(err) = result {
                self.record_failure(SyncAction::DeleteTask { task }, err);
                synced = false;
            }
        }
        if synced {
            self.error = None;
        }
        self.prune_categories();
        Ok(count)
    }

    /// Deletes a category after `confirm` agrees. Its tasks stay and become
    /// uncategorized. Unlike task changes this waits for the service and
    /// only mirrors the steps that succeeded.
    #[instrument(skip(self, confirm))]
    pub async fn delete_category<F>(
        &mut self,
        id: CategoryId,
        confirm: F,
    ) -> Result<CategoryRemoval, ValidationError>
    where
        F: FnOnce(&Category) -> bool,
    {
        let owner = self.require_owner()?;
        let Some(category) = self.categories.iter().find(|c| c.id == id).cloned() else {
            return self.reject(ValidationError::UnknownCategory(id));
        };
        if !confirm(&category) {
            debug!(category = %category.name, "category deletion cancelled");
            return Ok(CategoryRemoval::Cancelled);
        }

        if !is_placeholder(id) {
            let result = detach_category(self.tables.as_ref(), owner, id).await;
            if let Err(err) = result {
                self.remote_error("Failed to delete category", &err);
                return Ok(CategoryRemoval::Failed);
            }
            self.detach_local(id);

            let result = self
                .tables
                .delete(Table::Categories, &row_filter(owner, id))
                .await;
            if let Err(err) = result {
                self.remote_error("Failed to delete category", &err);
                return Ok(CategoryRemoval::Failed);
            }
        } else {
            self.detach_local(id);
        }

        self.categories.retain(|c| c.id != id);
        if self.filter == CategoryFilter::Category(id) {
            self.filter = CategoryFilter::All;
        }
        self.error = None;
        info!(category = %category.name, "category deleted");
        Ok(CategoryRemoval::Removed)
    }

    /// Sends a failed change again. Returns whether it went through this
    /// time; a repeated failure is journaled under a new number.
    #[instrument(skip(self))]
    pub async fn retry(&mut self, seq: u64) -> Result<bool, ValidationError> {
        let owner = self.require_owner()?;
        let Some(idx) = self.failed.iter().position(|f| f.seq == seq) else {
            return self.reject(ValidationError::UnknownSync(seq));
        };
        let entry = self.failed.remove(idx);
        info!(seq, action = entry.action.describe(), "retrying failed change");
        let seq_before = self.next_seq;

        match entry.action {
            SyncAction::AddTask { task_id } => {
                if self.task(task_id).is_some() {
                    self.push_new_task(task_id).await;
                }
            }
            SyncAction::UpdateTask { task_id, before } => {
                if let Some(current) = self.task(task_id).map(|t| t.row.clone()) {
                    self.push_update(task_id, before, TaskPatch::from_task(&current))
                        .await;
                }
            }
            SyncAction::DeleteTask { task } => {
                let result = self
                    .tables
                    .delete(Table::Todos, &row_filter(owner, task.row.id))
                    .await;
                if let Err(err) = result {
                    self.record_failure(SyncAction::DeleteTask { task }, err);
                }
            }
            SyncAction::ClearCompleted { removed } => {
                let filter = Filter::new()
                    .eq("user_id", owner.to_string())
                    .eq("is_complete", true);
                let result = self.tables.delete(Table::Todos, &filter).await;
                if let Err(err) = result {
                    self.record_failure(SyncAction::ClearCompleted { removed }, err);
                }
            }
        }

        let synced = self.next_seq == seq_before;
        if synced {
            self.error = None;
        }
        Ok(synced)
    }

    /// Undoes the local side of a failed change so the list matches what the
    /// service still holds.
    #[instrument(skip(self))]
    pub fn revert(&mut self, seq: u64) -> Result<(), ValidationError> {
        let Some(idx) = self.failed.iter().position(|f| f.seq == seq) else {
            return self.reject(ValidationError::UnknownSync(seq));
        };
        let entry = self.failed.remove(idx);
        info!(seq, action = entry.action.describe(), "reverting failed change");

        match entry.action {
            SyncAction::AddTask { task_id } => {
                self.tasks.retain(|t| t.row.id != task_id);
                self.forget_task(task_id);
                self.prune_categories();
            }
            SyncAction::UpdateTask { task_id, before } => {
                if let Some(entry) = self.task_mut(task_id) {
                    entry.row = before;
                    entry.sync = SyncState::Confirmed;
                }
                if self.editing.as_ref().is_some_and(|e| e.task_id == task_id) {
                    self.editing = None;
                }
            }
            SyncAction::DeleteTask { task } => self.restore(task),
            SyncAction::ClearCompleted { removed } => {
                for task in removed {
                    self.restore(task);
                }
            }
        }
        self.error = None;
        Ok(())
    }

    /// Forgets a failed change and keeps the local state as it is.
    pub fn dismiss(&mut self, seq: u64) -> Result<(), ValidationError> {
        let Some(idx) = self.failed.iter().position(|f| f.seq == seq) else {
            return self.reject(ValidationError::UnknownSync(seq));
        };
        let entry = self.failed.remove(idx);
        if self.error.as_deref() == Some(entry.message.as_str()) {
            self.error = None;
        }
        debug!(seq, "dismissed failed change");
        Ok(())
    }

    fn require_owner(&mut self) -> Result<Uuid, ValidationError> {
        match self.owner {
            Some(owner) => Ok(owner),
            None => self.reject(ValidationError::SignedOut),
        }
    }

    fn reject<T>(&mut self, err: ValidationError) -> Result<T, ValidationError> {
        debug!(error = %err, "action rejected");
        self.error = Some(err.to_string());
        Err(err)
    }

    fn remote_error(&mut self, context: &str, err: &BackendError) {
        warn!(error = %err, "{context}");
        self.error = Some(format!("{context}: {err}"));
    }

    fn task_mut(&mut self, id: TaskId) -> Option<&mut Synced<Task>> {
        self.tasks.iter_mut().find(|t| t.row.id == id)
    }

    fn insert_sorted(&mut self, task: Synced<Task>) {
        let idx = self.settings.order.slot(&self.tasks, &task.row);
        self.tasks.insert(idx, task);
    }

    /// Millisecond-based negative id, strictly below every id handed out
    /// before.
    fn next_placeholder(&mut self, now: DateTime<Utc>) -> i64 {
        let id = (-now.timestamp_millis()).min(self.last_placeholder - 1);
        self.last_placeholder = id;
        id
    }

    fn resolve_category(&mut self, owner: Uuid, name: &str, now: DateTime<Utc>) -> CategoryId {
        if let Some(category) = self.category_named(name) {
            return category.id;
        }
        if let Some(idx) = self.pruned.iter().position(|c| c.matches_name(name)) {
            let category = self.pruned.remove(idx);
            let id = category.id;
            self.categories.push(category);
            return id;
        }

        let category = Category {
            id: self.next_placeholder(now),
            user_id: owner,
            name: name.to_string(),
            color: CategoryColor::random(),
        };
        debug!(category = %category.name, color = category.color.as_str(), "new category");
        let id = category.id;
        self.categories.push(category);
        id
    }

    /// Inserts a locally added task remotely, creating its category first
    /// when that one is new too. Returns the id the task ends up with.
    async fn push_new_task(&mut self, id: TaskId) -> TaskId {
        let Some(task) = self.task(id).map(|t| t.row.clone()) else {
            return id;
        };
        if let Some(entry) = self.task_mut(id) {
            entry.sync = SyncState::Pending;
        }

        let mut payload = NewTask::from(&task);
        if let Some(category_id) = task.category_id
            && is_placeholder(category_id)
        {
            match self.push_category(category_id).await {
                Ok(stored) => payload.category_id = stored,
                Err(err) => {
                    self.record_failure(SyncAction::AddTask { task_id: id }, err);
                    return id;
                }
            }
        }

        match insert_task(self.tables.as_ref(), &payload).await {
            Ok(stored) => {
                let stored_id = stored.id;
                debug!(placeholder = id, task_id = stored_id, "task stored");
                if let Some(entry) = self.task_mut(id) {
                    entry.row = stored;
                    entry.sync = SyncState::Confirmed;
                }
                if let Some(edit) = self.editing.as_mut()
                    && edit.task_id == id
                {
                    edit.task_id = stored_id;
                }
                self.failed
                    .retain(|f| f.action.task_id() != Some(id));
                self.error = None;
                stored_id
            }
            Err(err) => {
                self.record_failure(SyncAction::AddTask { task_id: id }, err);
                id
            }
        }
    }

    /// Upserts a placeholder category and switches every local reference to
    /// the stored id.
    async fn push_category(
        &mut self,
        placeholder: CategoryId,
    ) -> Result<Option<CategoryId>, BackendError> {
        let Some(category) = self
            .categories
            .iter()
            .find(|c| c.id == placeholder)
            .cloned()
        else {
            warn!(category_id = placeholder, "category vanished before it was stored");
            return Ok(None);
        };

        let stored: Category =
            upsert_category(self.tables.as_ref(), &NewCategory::from(&category)).await?;
        let stored_id = stored.id;
        debug!(placeholder, category_id = stored_id, "category stored");

        if self.categories.iter().any(|c| c.id == stored_id) {
            self.categories.retain(|c| c.id != placeholder);
        } else if let Some(slot) = self.categories.iter_mut().find(|c| c.id == placeholder) {
            *slot = stored;
        }
        for task in &mut self.tasks {
            if task.row.category_id == Some(placeholder) {
                task.row.category_id = Some(stored_id);
            }
        }
        if self.filter == CategoryFilter::Category(placeholder) {
            self.filter = CategoryFilter::Category(stored_id);
        }
        Ok(Some(stored_id))
    }

    async fn push_update(&mut self, id: TaskId, before: Task, patch: TaskPatch) {
        let Some(owner) = self.owner else {
            return;
        };
        if is_placeholder(id) {
            // Not stored yet; the eventual insert carries the current row.
            debug!(task_id = id, "change kept local until the task is stored");
            return;
        }

        // An earlier change to this row never arrived, so send all of it.
        let patch = match self.task(id) {
            Some(current) if self.has_failed_update(id) => TaskPatch::from_task(&current.row),
            _ => patch,
        };
        if let Some(entry) = self.task_mut(id) {
            entry.sync = SyncState::Pending;
        }

        match update_task(self.tables.as_ref(), owner, id, &patch).await {
            Ok(()) => {
                if let Some(entry) = self.task_mut(id) {
                    entry.sync = SyncState::Confirmed;
                }
                self.failed.retain(|f| {
                    !matches!(&f.action, SyncAction::UpdateTask { task_id, .. } if *task_id == id)
                });
                self.error = None;
            }
            Err(err) => {
                self.record_failure(SyncAction::UpdateTask { task_id: id, before }, err);
            }
        }
    }

    fn has_failed_update(&self, id: TaskId) -> bool {
        self.failed
            .iter()
            .any(|f| matches!(&f.action, SyncAction::UpdateTask { task_id, .. } if *task_id == id))
    }

    fn record_failure(&mut self, action: SyncAction, err: BackendError) {
        let message = format!("{}: {err}", action.describe());
        warn!(error = %err, action = action.describe(), "remote change failed; keeping local state");
        if let Some(id) = action.task_id()
            && let Some(entry) = self.task_mut(id)
        {
            entry.sync = SyncState::Failed;
        }
        self.error = Some(message.clone());
        self.push_journal(action, message);
    }

    fn push_journal(&mut self, action: SyncAction, message: String) {
        self.next_seq += 1;
        let seq = self.next_seq;
        // Repeated failures of the same row keep the oldest `before`.
        if let Some(existing) = self
            .failed
            .iter_mut()
            .find(|f| f.action.same_target(&action))
        {
            existing.seq = seq;
            existing.message = message;
            return;
        }
        self.failed.push(FailedSync {
            seq,
            action,
            message,
        });
    }

    /// Drops edit state and journal entries of a task that left the list.
    fn forget_task(&mut self, id: TaskId) {
        if self.editing.as_ref().is_some_and(|e| e.task_id == id) {
            self.editing = None;
        }
        self.failed.retain(|f| f.action.task_id() != Some(id));
    }

    fn restore(&mut self, task: Synced<Task>) {
        if self.task(task.row.id).is_some() {
            return;
        }
        if let Some(category_id) = task.row.category_id
            && !self.categories.iter().any(|c| c.id == category_id)
            && let Some(idx) = self.pruned.iter().position(|c| c.id == category_id)
        {
            let category = self.pruned.remove(idx);
            self.categories.push(category);
        }

        let id = task.row.id;
        let never_stored = is_placeholder(id) && task.sync == SyncState::Failed;
        self.insert_sorted(task);
        if never_stored {
            let action = SyncAction::AddTask { task_id: id };
            let message = format!("{}: not stored yet", action.describe());
            self.push_journal(action, message);
        }
    }

    fn detach_local(&mut self, id: CategoryId) {
        for task in &mut self.tasks {
            if task.row.category_id == Some(id) {
                task.row.category_id = None;
            }
        }
    }

    /// Moves categories no task refers to into the stash. Local only: the
    /// service keeps the rows.
    fn prune_categories(&mut self) {
        let referenced: HashSet<CategoryId> =
            self.tasks.iter().filter_map(|t| t.row.category_id).collect();
        let (kept, empty): (Vec<_>, Vec<_>) = std::mem::take(&mut self.categories)
            .into_iter()
            .partition(|c| referenced.contains(&c.id));
        self.categories = kept;
        if empty.is_empty() {
            return;
        }

        if let CategoryFilter::Category(id) = self.filter
            && empty.iter().any(|c| c.id == id)
        {
            self.filter = CategoryFilter::All;
        }
        debug!(count = empty.len(), "pruned empty categories");
        self.pruned
            .extend(empty.into_iter().filter(|c| !is_placeholder(c.id)));
    }
}

/// Offline examples, one per status.
pub fn sample_tasks(owner: Uuid, now: DateTime<Utc>) -> Vec<Task> {
    [
        ("Add your first task", Status::NotStarted),
        ("Cycle a task to start working on it", Status::InProgress),
        ("Clear completed tasks to tidy up", Status::Completed),
    ]
    .into_iter()
    .zip(1..)
    .map(|((text, status), n): ((&str, Status), i64)| Task {
        id: -n,
        user_id: owner,
        text: text.to_string(),
        status,
        category_id: None,
        created_at: now,
        updated_at: now,
    })
    .collect()
}

fn row_filter(owner: Uuid, id: i64) -> Filter {
    Filter::new().eq("id", id).eq("user_id", owner.to_string())
}

async fn fetch_rows(
    tables: &dyn TableService,
    owner: Uuid,
    order: &Order,
) -> Result<(Vec<Category>, Vec<Task>), BackendError> {
    let by_owner = Filter::new().eq("user_id", owner.to_string());
    let categories: Vec<Category> = decode_rows(
        tables
            .select(Table::Categories, &by_owner, None)
            .await?,
    )?;
    let tasks: Vec<Task> = decode_rows(
        tables
            .select(Table::Todos, &by_owner, Some(order))
            .await?,
    )?;

    let categories = categories
        .into_iter()
        .filter(|c| {
            let own = c.user_id == owner;
            if !own {
                warn!(category_id = c.id, "ignoring category of another user");
            }
            own
        })
        .collect();
    let tasks = tasks
        .into_iter()
        .filter(|t| {
            let own = t.user_id == owner;
            if !own {
                warn!(task_id = t.id, "ignoring task of another user");
            }
            own
        })
        .collect();
    Ok((categories, tasks))
}

async fn insert_task(tables: &dyn TableService, payload: &NewTask) -> Result<Task, BackendError> {
    let rows = tables
        .insert(Table::Todos, vec![serde_json::to_value(payload)?])
        .await?;
    first_row(rows)
}

async fn upsert_category(
    tables: &dyn TableService,
    payload: &NewCategory,
) -> Result<Category, BackendError> {
    let rows = tables
        .upsert(
            Table::Categories,
            vec![serde_json::to_value(payload)?],
            &["user_id", "name_key"],
        )
        .await?;
    first_row(rows)
}

async fn update_task(
    tables: &dyn TableService,
    owner: Uuid,
    id: TaskId,
    patch: &TaskPatch,
) -> Result<(), BackendError> {
    tables
        .update(Table::Todos, &row_filter(owner, id), serde_json::to_value(patch)?)
        .await
}

async fn detach_category(
    tables: &dyn TableService,
    owner: Uuid,
    id: CategoryId,
) -> Result<(), BackendError> {
    let filter = Filter::new()
        .eq("category_id", id)
        .eq("user_id", owner.to_string());
    tables
        .update(
            Table::Todos,
            &filter,
            serde_json::to_value(TaskPatch::detach_category())?,
        )
        .await
}

fn decode_rows<T: DeserializeOwned>(rows: Vec<Value>) -> Result<Vec<T>, BackendError> {
    rows.into_iter()
        .map(|row| serde_json::from_value(row).map_err(BackendError::from))
        .collect()
}

fn first_row<T: DeserializeOwned>(rows: Vec<Value>) -> Result<T, BackendError> {
    let row = rows.into_iter().next().ok_or(BackendError::NoRows)?;
    Ok(serde_json::from_value(row)?)
}

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub type TaskId = i64;
pub type CategoryId = i64;

/// Ids below zero are client-side placeholders that were never
/// acknowledged by the table service.
pub fn is_placeholder(id: i64) -> bool {
    id < 0
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, Default)]
#[serde(rename_all = "snake_case")]
pub enum Status {
    #[default]
    NotStarted,
    InProgress,
    Completed,
}

impl Status {
    pub fn next(self) -> Self {
        match self {
            Status::NotStarted => Status::InProgress,
            Status::InProgress => Status::Completed,
            Status::Completed => Status::NotStarted,
        }
    }

    pub fn is_completed(self) -> bool {
        self == Status::Completed
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Status::NotStarted => "not_started",
            Status::InProgress => "in_progress",
            Status::Completed => "completed",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(from = "TaskRow", into = "TaskRow")]
pub struct Task {
    pub id: TaskId,
    pub user_id: Uuid,
    pub text: String,
    pub status: Status,
    pub category_id: Option<CategoryId>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Task {
    pub fn completed(&self) -> bool {
        self.status.is_completed()
    }
}

impl AsRef<Task> for Task {
    fn as_ref(&self) -> &Task {
        self
    }
}

/// Wire shape of a `todos` row. Older rows carry only `is_complete`, newer
/// ones carry `status` as well; `status` wins when both are present.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct TaskRow {
    id: TaskId,
    user_id: Uuid,
    task: String,
    #[serde(default)]
    status: Option<Status>,
    #[serde(default)]
    is_complete: Option<bool>,
    #[serde(default)]
    category_id: Option<CategoryId>,
    created_at: DateTime<Utc>,
    #[serde(default)]
    updated_at: Option<DateTime<Utc>>,
}

impl From<TaskRow> for Task {
    fn from(row: TaskRow) -> Self {
        let status = match (row.status, row.is_complete) {
            (Some(status), _) => status,
            (None, Some(true)) => Status::Completed,
            (None, _) => Status::NotStarted,
        };
        Self {
            id: row.id,
            user_id: row.user_id,
            text: row.task,
            status,
            category_id: row.category_id,
            created_at: row.created_at,
            updated_at: row.updated_at.unwrap_or(row.created_at),
        }
    }
}

impl From<Task> for TaskRow {
    fn from(task: Task) -> Self {
        let is_complete = task.completed();
        Self {
            id: task.id,
            user_id: task.user_id,
            task: task.text,
            status: Some(task.status),
            is_complete: Some(is_complete),
            category_id: task.category_id,
            created_at: task.created_at,
            updated_at: Some(task.updated_at),
        }
    }
}

/// Insert payload for `todos`; the service assigns the id.
#[derive(Debug, Clone, Serialize)]
pub struct NewTask {
    pub user_id: Uuid,
    pub task: String,
    pub status: Status,
    pub is_complete: bool,
    pub category_id: Option<CategoryId>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl From<&Task> for NewTask {
    fn from(task: &Task) -> Self {
        Self {
            user_id: task.user_id,
            task: task.text.clone(),
            status: task.status,
            is_complete: task.completed(),
            category_id: task.category_id,
            created_at: task.created_at,
            updated_at: task.updated_at,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, PartialEq)]
pub struct TaskPatch {
    #[serde(rename = "task", skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<Status>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub is_complete: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub category_id: Option<Option<CategoryId>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<DateTime<Utc>>,
}

impl TaskPatch {
    pub fn status(status: Status, now: DateTime<Utc>) -> Self {
        Self {
            status: Some(status),
            is_complete: Some(status.is_completed()),
            updated_at: Some(now),
            ..Self::default()
        }
    }

    pub fn text(text: String, now: DateTime<Utc>) -> Self {
        Self {
            text: Some(text),
            updated_at: Some(now),
            ..Self::default()
        }
    }

    pub fn detach_category() -> Self {
        Self {
            category_id: Some(None),
            ..Self::default()
        }
    }

    /// Every user-editable column of `task`, used when re-sending a change.
    pub fn from_task(task: &Task) -> Self {
        Self {
            text: Some(task.text.clone()),
            status: Some(task.status),
            is_complete: Some(task.completed()),
            category_id: Some(task.category_id),
            updated_at: Some(task.updated_at),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum CategoryColor {
    Blue,
    Green,
    Purple,
    Pink,
    Yellow,
    Red,
}

impl CategoryColor {
    pub const PALETTE: [CategoryColor; 6] = [
        CategoryColor::Blue,
        CategoryColor::Green,
        CategoryColor::Purple,
        CategoryColor::Pink,
        CategoryColor::Yellow,
        CategoryColor::Red,
    ];

    pub fn random() -> Self {
        Self::PALETTE[rand::random_range(0..Self::PALETTE.len())]
    }

    pub fn as_str(self) -> &'static str {
        match self {
            CategoryColor::Blue => "blue",
            CategoryColor::Green => "green",
            CategoryColor::Purple => "purple",
            CategoryColor::Pink => "pink",
            CategoryColor::Yellow => "yellow",
            CategoryColor::Red => "red",
        }
    }

    /// ANSI foreground code used by the terminal renderer.
    pub fn ansi_code(self) -> &'static str {
        match self {
            CategoryColor::Blue => "34",
            CategoryColor::Green => "32",
            CategoryColor::Purple => "35",
            CategoryColor::Pink => "95",
            CategoryColor::Yellow => "33",
            CategoryColor::Red => "31",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Category {
    pub id: CategoryId,
    pub user_id: Uuid,
    pub name: String,
    pub color: CategoryColor,
}

impl Category {
    pub fn matches_name(&self, name: &str) -> bool {
        self.name.to_lowercase() == name.trim().to_lowercase()
    }
}

/// Upsert payload for `categories`, unique on `(user_id, name_key)`.
#[derive(Debug, Clone, Serialize)]
pub struct NewCategory {
    pub user_id: Uuid,
    pub name: String,
    pub name_key: String,
    pub color: CategoryColor,
}

impl From<&Category> for NewCategory {
    fn from(category: &Category) -> Self {
        Self {
            user_id: category.user_id,
            name: category.name.clone(),
            name_key: category.name.to_lowercase(),
            color: category.color,
        }
    }
}

//! Interfaces of the hosted services the client talks to: password auth with
//! change notifications, and row-level CRUD over the `todos` and
//! `categories` tables.

use std::fmt;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::watch;
use uuid::Uuid;

use crate::error::BackendError;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct User {
    pub id: Uuid,
    #[serde(default)]
    pub email: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Table {
    Todos,
    Categories,
}

impl Table {
    pub fn as_str(self) -> &'static str {
        match self {
            Table::Todos => "todos",
            Table::Categories => "categories",
        }
    }
}

impl fmt::Display for Table {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Conjunction of column equality tests.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Filter {
    conditions: Vec<(String, Value)>,
}

impl Filter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn eq(mut self, column: &str, value: impl Into<Value>) -> Self {
        self.conditions.push((column.to_string(), value.into()));
        self
    }

    pub fn conditions(&self) -> &[(String, Value)] {
        &self.conditions
    }

    pub fn matches(&self, row: &Value) -> bool {
        self.conditions
            .iter()
            .all(|(column, expected)| row.get(column).unwrap_or(&Value::Null) == expected)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Order {
    pub column: String,
    pub ascending: bool,
}

impl Order {
    pub fn asc(column: &str) -> Self {
        Self {
            column: column.to_string(),
            ascending: true,
        }
    }

    pub fn desc(column: &str) -> Self {
        Self {
            column: column.to_string(),
            ascending: false,
        }
    }
}

#[async_trait]
pub trait AuthProvider: Send + Sync {
    async fn sign_in(&self, email: &str, password: &str) -> Result<User, BackendError>;

    /// Registers an account. The new user is not signed in; most providers
    /// require the address to be verified first.
    async fn sign_up(&self, email: &str, password: &str) -> Result<User, BackendError>;

    async fn sign_out(&self) -> Result<(), BackendError>;

    async fn current_user(&self) -> Result<Option<User>, BackendError>;

    fn subscribe(&self) -> AuthSubscription;
}

#[async_trait]
pub trait TableService: Send + Sync {
    async fn select(
        &self,
        table: Table,
        filter: &Filter,
        order: Option<&Order>,
    ) -> Result<Vec<Value>, BackendError>;

    /// Returns the inserted rows as stored, including generated ids.
    async fn insert(&self, table: Table, rows: Vec<Value>) -> Result<Vec<Value>, BackendError>;

    /// Insert, or keep the existing row sharing the `on_conflict` columns
    /// untouched. Returns the stored rows either way.
    async fn upsert(
        &self,
        table: Table,
        rows: Vec<Value>,
        on_conflict: &[&str],
    ) -> Result<Vec<Value>, BackendError>;

    async fn update(&self, table: Table, filter: &Filter, patch: Value)
    -> Result<(), BackendError>;

    async fn delete(&self, table: Table, filter: &Filter) -> Result<(), BackendError>;
}

/// Broadcasts the signed-in user to every live [`AuthSubscription`].
#[derive(Debug)]
pub struct AuthEvents {
    tx: watch::Sender<Option<User>>,
}

impl AuthEvents {
    pub fn new(initial: Option<User>) -> Self {
        let (tx, _) = watch::channel(initial);
        Self { tx }
    }

    pub fn publish(&self, user: Option<User>) {
        self.tx.send_replace(user);
    }

    pub fn subscribe(&self) -> AuthSubscription {
        AuthSubscription {
            rx: self.tx.subscribe(),
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

/// Live registration for auth-state changes; dropping it unsubscribes.
#[derive(Debug)]
pub struct AuthSubscription {
    rx: watch::Receiver<Option<User>>,
}

impl AuthSubscription {
    /// Waits for the next change. `None` once the provider is gone.
    pub async fn changed(&mut self) -> Option<Option<User>> {
        self.rx.changed().await.ok()?;
        Some(self.rx.borrow_and_update().clone())
    }
}

//! In-process implementation of both backend interfaces.
//!
//! Row visibility follows the hosted service's row-level policies: every
//! table call acts only on rows owned by the signed-in user. State can
//! optionally be snapshotted to a JSON file so the CLI can run without a
//! server; that file keeps credentials unhashed and is meant for local use.

use std::cmp::Ordering;
use std::collections::{BTreeMap, VecDeque};
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::DateTime;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tempfile::NamedTempFile;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use crate::backend::{
    AuthEvents, AuthProvider, AuthSubscription, Filter, Order, Table, TableService, User,
};
use crate::error::BackendError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Op {
    SignIn,
    SignUp,
    SignOut,
    CurrentUser,
    Select,
    Insert,
    Upsert,
    Update,
    Delete,
}

impl Op {
    fn name(self) -> &'static str {
        match self {
            Op::SignIn => "sign_in",
            Op::SignUp => "sign_up",
            Op::SignOut => "sign_out",
            Op::CurrentUser => "current_user",
            Op::Select => "select",
            Op::Insert => "insert",
            Op::Upsert => "upsert",
            Op::Update => "update",
            Op::Delete => "delete",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct Account {
    user: User,
    password: String,
    confirmed: bool,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct Snapshot {
    accounts: Vec<Account>,
    session: Option<User>,
    tables: BTreeMap<Table, Vec<Value>>,
    next_id: i64,
}

#[derive(Debug, Default)]
struct Faults {
    pending: VecDeque<Op>,
    calls: BTreeMap<Op, usize>,
}

#[derive(Debug)]
pub struct MemoryBackend {
    path: Option<PathBuf>,
    require_confirmation: bool,
    state: Mutex<Snapshot>,
    faults: Mutex<Faults>,
    events: AuthEvents,
}

impl Default for MemoryBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self {
            path: None,
            require_confirmation: false,
            state: Mutex::new(Snapshot {
                next_id: 1,
                ..Snapshot::default()
            }),
            faults: Mutex::new(Faults::default()),
            events: AuthEvents::new(None),
        }
    }

    /// Opens (or starts) a snapshot file; every successful mutation rewrites it.
    #[instrument(skip(path))]
    pub fn open(path: &Path) -> anyhow::Result<Self> {
        let snapshot = if path.exists() {
            let raw = fs::read_to_string(path)?;
            if raw.trim().is_empty() {
                Snapshot::default()
            } else {
                serde_json::from_str(&raw)?
            }
        } else {
            Snapshot::default()
        };
        let snapshot = Snapshot {
            next_id: snapshot.next_id.max(1),
            ..snapshot
        };
        info!(
            path = %path.display(),
            accounts = snapshot.accounts.len(),
            signed_in = snapshot.session.is_some(),
            "opened local backend"
        );

        let events = AuthEvents::new(snapshot.session.clone());
        Ok(Self {
            path: Some(path.to_path_buf()),
            require_confirmation: false,
            state: Mutex::new(snapshot),
            faults: Mutex::new(Faults::default()),
            events,
        })
    }

    /// New sign-ups must be confirmed with [`MemoryBackend::confirm_email`]
    /// before they can sign in.
    pub fn requiring_confirmation(mut self) -> Self {
        self.require_confirmation = true;
        self
    }

    /// Registers a confirmed account without touching the session.
    pub fn register(&self, email: &str, password: &str) -> User {
        let user = User {
            id: Uuid::new_v4(),
            email: Some(email.to_string()),
        };
        self.state.lock().accounts.push(Account {
            user: user.clone(),
            password: password.to_string(),
            confirmed: true,
        });
        user
    }

    pub fn confirm_email(&self, email: &str) -> bool {
        let mut state = self.state.lock();
        let Some(account) = state
            .accounts
            .iter_mut()
            .find(|account| account.user.email.as_deref() == Some(email))
        else {
            return false;
        };
        account.confirmed = true;
        true
    }

    /// Makes the next call of `op` fail once.
    pub fn fail_next(&self, op: Op) {
        self.faults.lock().pending.push_back(op);
    }

    /// Number of calls of `op` received so far, failed ones included.
    pub fn calls(&self, op: Op) -> usize {
        self.faults.lock().calls.get(&op).copied().unwrap_or(0)
    }

    pub fn events(&self) -> &AuthEvents {
        &self.events
    }

    /// Raw rows of `table` regardless of owner, for inspection.
    pub fn rows(&self, table: Table) -> Vec<Value> {
        self.state
            .lock()
            .tables
            .get(&table)
            .cloned()
            .unwrap_or_default()
    }

    /// Inserts rows as-is, bypassing ownership checks; ids are assigned
    /// when missing.
    pub fn seed(&self, table: Table, rows: Vec<Value>) -> Vec<Value> {
        let mut state = self.state.lock();
        rows.into_iter()
            .map(|row| insert_row(&mut state, table, row))
            .collect()
    }

    fn enter(&self, op: Op) -> Result<(), BackendError> {
        let mut faults = self.faults.lock();
        *faults.calls.entry(op).or_default() += 1;
        if let Some(idx) = faults.pending.iter().position(|pending| *pending == op) {
            faults.pending.remove(idx);
            warn!(op = op.name(), "injecting backend failure");
            return Err(BackendError::Injected(op.name()));
        }
        Ok(())
    }

    fn owner(state: &Snapshot) -> Result<Uuid, BackendError> {
        state
            .session
            .as_ref()
            .map(|user| user.id)
            .ok_or(BackendError::Unauthenticated)
    }

    fn save(&self, state: &Snapshot) -> Result<(), BackendError> {
        let Some(path) = self.path.as_deref() else {
            return Ok(());
        };
        debug!(file = %path.display(), "saving local backend snapshot");

        let write = || -> anyhow::Result<()> {
            let dir = path.parent().unwrap_or_else(|| Path::new("."));
            fs::create_dir_all(dir)?;
            let mut temp = NamedTempFile::new_in(dir)?;
            serde_json::to_writer(&mut temp, state)?;
            temp.flush()?;
            temp.persist(path)?;
            Ok(())
        };
        write().map_err(|err| {
            BackendError::Transport(format!("failed to persist {}: {err:#}", path.display()))
        })
    }
}

#[async_trait]
impl AuthProvider for MemoryBackend {
    #[instrument(skip(self, password))]
    async fn sign_in(&self, email: &str, password: &str) -> Result<User, BackendError> {
        self.enter(Op::SignIn)?;
        let user = {
            let mut state = self.state.lock();
            let account = state
                .accounts
                .iter()
                .find(|account| {
                    account.user.email.as_deref() == Some(email) && account.password == password
                })
                .cloned()
                .ok_or_else(|| BackendError::Rejected("Invalid login credentials".to_string()))?;
            if !account.confirmed {
                return Err(BackendError::Rejected("Email not confirmed".to_string()));
            }
            state.session = Some(account.user.clone());
            self.save(&state)?;
            account.user
        };
        self.events.publish(Some(user.clone()));
        Ok(user)
    }

    #[instrument(skip(self, password))]
    async fn sign_up(&self, email: &str, password: &str) -> Result<User, BackendError> {
        self.enter(Op::SignUp)?;
        if password.len() < 6 {
            return Err(BackendError::Rejected(
                "Password should be at least 6 characters".to_string(),
            ));
        }
        let mut state = self.state.lock();
        if state
            .accounts
            .iter()
            .any(|account| account.user.email.as_deref() == Some(email))
        {
            return Err(BackendError::Rejected("User already registered".to_string()));
        }
        let user = User {
            id: Uuid::new_v4(),
            email: Some(email.to_string()),
        };
        state.accounts.push(Account {
            user: user.clone(),
            password: password.to_string(),
            confirmed: !self.require_confirmation,
        });
        self.save(&state)?;
        Ok(user)
    }

    #[instrument(skip(self))]
    async fn sign_out(&self) -> Result<(), BackendError> {
        self.enter(Op::SignOut)?;
        {
            let mut state = self.state.lock();
            state.session = None;
            self.save(&state)?;
        }
        self.events.publish(None);
        Ok(())
    }

    async fn current_user(&self) -> Result<Option<User>, BackendError> {
        self.enter(Op::CurrentUser)?;
        Ok(self.state.lock().session.clone())
    }

    fn subscribe(&self) -> AuthSubscription {
        self.events.subscribe()
    }
}

#[async_trait]
impl TableService for MemoryBackend {
    #[instrument(skip(self, filter, order), fields(table = %table))]
    async fn select(
        &self,
        table: Table,
        filter: &Filter,
        order: Option<&Order>,
    ) -> Result<Vec<Value>, BackendError> {
        self.enter(Op::Select)?;
        let state = self.state.lock();
        let owner = Self::owner(&state)?;
        let mut rows: Vec<Value> = state
            .tables
            .get(&table)
            .map(|rows| {
                rows.iter()
                    .filter(|row| owned_by(row, owner) && filter.matches(row))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default();

        if let Some(order) = order {
            rows.sort_by(|a, b| {
                let ord = compare_values(
                    a.get(&order.column).unwrap_or(&Value::Null),
                    b.get(&order.column).unwrap_or(&Value::Null),
                )
                .then_with(|| compare_values(&a["id"], &b["id"]));
                if order.ascending { ord } else { ord.reverse() }
            });
        }

        debug!(count = rows.len(), "selected rows");
        Ok(rows)
    }

    #[instrument(skip(self, rows), fields(table = %table, count = rows.len()))]
    async fn insert(&self, table: Table, rows: Vec<Value>) -> Result<Vec<Value>, BackendError> {
        self.enter(Op::Insert)?;
        let mut state = self.state.lock();
        let owner = Self::owner(&state)?;
        check_owned(&rows, owner)?;

        let inserted = rows
            .into_iter()
            .map(|row| insert_row(&mut state, table, row))
            .collect();
        self.save(&state)?;
        Ok(inserted)
    }

    #[instrument(skip(self, rows), fields(table = %table, count = rows.len()))]
    async fn upsert(
        &self,
        table: Table,
        rows: Vec<Value>,
        on_conflict: &[&str],
    ) -> Result<Vec<Value>, BackendError> {
        self.enter(Op::Upsert)?;
        let mut state = self.state.lock();
        let owner = Self::owner(&state)?;
        check_owned(&rows, owner)?;

        let mut out = Vec::with_capacity(rows.len());
        for row in rows {
            let key = on_conflict.iter().fold(Filter::new(), |filter, column| {
                filter.eq(column, row.get(*column).cloned().unwrap_or(Value::Null))
            });
            let existing = state
                .tables
                .entry(table)
                .or_default()
                .iter_mut()
                .find(|candidate| key.matches(candidate));
            match existing {
                Some(existing) => {
                    debug!("upsert matched existing row");
                    out.push(existing.clone());
                }
                None => out.push(insert_row(&mut state, table, row)),
            }
        }
        self.save(&state)?;
        Ok(out)
    }

    #[instrument(skip(self, filter, patch), fields(table = %table))]
    async fn update(
        &self,
        table: Table,
        filter: &Filter,
        patch: Value,
    ) -> Result<(), BackendError> {
        self.enter(Op::Update)?;
        let mut state = self.state.lock();
        let owner = Self::owner(&state)?;
        let mut changed = 0usize;
        for row in state.tables.entry(table).or_default().iter_mut() {
            if owned_by(row, owner) && filter.matches(row) {
                merge(row, &patch);
                changed += 1;
            }
        }
        debug!(changed, "updated rows");
        self.save(&state)?;
        Ok(())
    }

    #[instrument(skip(self, filter), fields(table = %table))]
    async fn delete(&self, table: Table, filter: &Filter) -> Result<(), BackendError> {
        self.enter(Op::Delete)?;
        let mut state = self.state.lock();
        let owner = Self::owner(&state)?;
        let rows = state.tables.entry(table).or_default();
        let before = rows.len();
        rows.retain(|row| !(owned_by(row, owner) && filter.matches(row)));
        debug!(removed = before - rows.len(), "deleted rows");
        self.save(&state)?;
        Ok(())
    }
}

fn insert_row(state: &mut Snapshot, table: Table, mut row: Value) -> Value {
    if row.get("id").is_none_or(Value::is_null) {
        let id = state.next_id.max(1);
        state.next_id = id + 1;
        if let Value::Object(map) = &mut row {
            map.insert("id".to_string(), Value::from(id));
        }
    } else if let Some(id) = row.get("id").and_then(Value::as_i64) {
        state.next_id = state.next_id.max(id + 1);
    }
    state.tables.entry(table).or_default().push(row.clone());
    row
}

fn owned_by(row: &Value, owner: Uuid) -> bool {
    row.get("user_id").and_then(Value::as_str) == Some(owner.to_string().as_str())
}

fn check_owned(rows: &[Value], owner: Uuid) -> Result<(), BackendError> {
    if rows.iter().all(|row| owned_by(row, owner)) {
        Ok(())
    } else {
        Err(BackendError::Service {
            status: 403,
            message: "new row violates row-level security policy".to_string(),
        })
    }
}

fn merge(target: &mut Value, patch: &Value) {
    let (Value::Object(target), Value::Object(patch)) = (target, patch) else {
        return;
    };
    let patch: &Map<String, Value> = patch;
    for (key, value) in patch {
        if key != "id" {
            target.insert(key.clone(), value.clone());
        }
    }
}

/// Orders numbers numerically, RFC 3339 timestamps chronologically and
/// everything else by its string form; nulls sort first.
fn compare_values(a: &Value, b: &Value) -> Ordering {
    match (a, b) {
        (Value::Null, Value::Null) => Ordering::Equal,
        (Value::Null, _) => Ordering::Less,
        (_, Value::Null) => Ordering::Greater,
        (Value::Number(x), Value::Number(y)) => x
            .as_f64()
            .partial_cmp(&y.as_f64())
            .unwrap_or(Ordering::Equal),
        (Value::String(x), Value::String(y)) => {
            match (DateTime::parse_from_rfc3339(x), DateTime::parse_from_rfc3339(y)) {
                (Ok(x), Ok(y)) => x.cmp(&y),
                _ => x.cmp(y),
            }
        }
        (Value::Bool(x), Value::Bool(y)) => x.cmp(y),
        _ => a.to_string().cmp(&b.to_string()),
    }
}

//! Client for a Supabase-compatible hosted backend: GoTrue password auth
//! under `/auth/v1` and PostgREST tables under `/rest/v1`.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use reqwest::header::{AUTHORIZATION, HeaderMap, HeaderValue};
use reqwest::{Method, RequestBuilder, Response, StatusCode, Url};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tracing::{debug, info, instrument, warn};

use crate::backend::{
    AuthEvents, AuthProvider, AuthSubscription, Filter, Order, Table, TableService, User,
};
use crate::error::BackendError;
use crate::kv::KvStore;

const SESSION_KEY: &str = "tally.auth.session";

#[derive(Debug, Clone)]
pub struct RestSettings {
    pub url: String,
    pub api_key: String,
    pub timeout: Duration,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct Session {
    access_token: String,
    #[serde(default)]
    refresh_token: Option<String>,
    user: User,
}

pub struct RestBackend {
    client: reqwest::Client,
    base: String,
    api_key: String,
    kv: Arc<KvStore>,
    session: Mutex<Option<Session>>,
    events: AuthEvents,
}

impl RestBackend {
    /// Builds the HTTP client and restores any session saved in `kv`.
    #[instrument(skip(settings, kv), fields(url = %settings.url))]
    pub async fn connect(settings: RestSettings, kv: Arc<KvStore>) -> Result<Self, BackendError> {
        let mut headers = HeaderMap::new();
        headers.insert(
            "apikey",
            HeaderValue::from_str(&settings.api_key)
                .map_err(|err| BackendError::Rejected(format!("invalid api key: {err}")))?,
        );
        let client = reqwest::Client::builder()
            .timeout(settings.timeout)
            .default_headers(headers)
            .build()?;

        let session = match kv.get(SESSION_KEY).await {
            Some(raw) => match serde_json::from_str::<Session>(&raw) {
                Ok(session) => Some(session),
                Err(err) => {
                    warn!(error = %err, "discarding unreadable stored session");
                    None
                }
            },
            None => None,
        };
        info!(restored = session.is_some(), "connected to hosted backend");

        let events = AuthEvents::new(session.as_ref().map(|s| s.user.clone()));
        Ok(Self {
            client,
            base: settings.url.trim_end_matches('/').to_string(),
            api_key: settings.api_key,
            kv,
            session: Mutex::new(session),
            events,
        })
    }

    fn bearer(&self) -> String {
        let token = self
            .session
            .lock()
            .as_ref()
            .map(|session| session.access_token.clone())
            .unwrap_or_else(|| self.api_key.clone());
        format!("Bearer {token}")
    }

    fn endpoint(&self, path: &str, query: &[(String, String)]) -> Result<Url, BackendError> {
        Url::parse_with_params(&format!("{}{}", self.base, path), query)
            .map_err(|err| BackendError::Transport(format!("invalid backend url: {err}")))
    }

    fn request(
        &self,
        method: Method,
        path: &str,
        query: &[(String, String)],
    ) -> Result<RequestBuilder, BackendError> {
        Ok(self
            .client
            .request(method, self.endpoint(path, query)?)
            .header(AUTHORIZATION, self.bearer()))
    }

    fn table_request(
        &self,
        method: Method,
        table: Table,
        query: &[(String, String)],
    ) -> Result<RequestBuilder, BackendError> {
        self.request(method, &format!("/rest/v1/{table}"), query)
    }

    async fn store_session(&self, session: Option<Session>) {
        let user = session.as_ref().map(|s| s.user.clone());
        let result = match &session {
            Some(session) => match serde_json::to_string(session) {
                Ok(raw) => self.kv.set(SESSION_KEY, &raw).await,
                Err(err) => {
                    warn!(error = %err, "failed to encode session");
                    Ok(())
                }
            },
            None => self.kv.delete(SESSION_KEY).await,
        };
        if let Err(err) = result {
            warn!(error = %err, "failed to persist session; it will not survive restart");
        }
        *self.session.lock() = session;
        self.events.publish(user);
    }
}

#[async_trait]
impl AuthProvider for RestBackend {
    #[instrument(skip(self, password))]
    async fn sign_in(&self, email: &str, password: &str) -> Result<User, BackendError> {
        let query = [("grant_type".to_string(), "password".to_string())];
        let response = self
            .client
            .post(self.endpoint("/auth/v1/token", &query)?)
            .json(&json!({ "email": email, "password": password }))
            .send()
            .await?;
        let session: Session = check(response).await?.json().await?;
        let user = session.user.clone();
        self.store_session(Some(session)).await;
        Ok(user)
    }

    #[instrument(skip(self, password))]
    async fn sign_up(&self, email: &str, password: &str) -> Result<User, BackendError> {
        let response = self
            .client
            .post(self.endpoint("/auth/v1/signup", &[])?)
            .json(&json!({ "email": email, "password": password }))
            .send()
            .await?;
        let body: Value = check(response).await?.json().await?;
        // Auto-confirming projects answer with a session, the others with the
        // bare user.
        let user = body.get("user").cloned().unwrap_or(body);
        Ok(serde_json::from_value(user)?)
    }

    #[instrument(skip(self))]
    async fn sign_out(&self) -> Result<(), BackendError> {
        if self.session.lock().is_none() {
            return Ok(());
        }
        let response = self
            .request(Method::POST, "/auth/v1/logout", &[])?
            .send()
            .await?;
        if response.status() != StatusCode::UNAUTHORIZED {
            check(response).await?;
        }
        self.store_session(None).await;
        Ok(())
    }

    #[instrument(skip(self))]
    async fn current_user(&self) -> Result<Option<User>, BackendError> {
        if self.session.lock().is_none() {
            return Ok(None);
        }
        let response = self
            .request(Method::GET, "/auth/v1/user", &[])?
            .send()
            .await?;
        if response.status() == StatusCode::UNAUTHORIZED {
            info!("stored session expired");
            self.store_session(None).await;
            return Ok(None);
        }
        let user: User = check(response).await?.json().await?;
        Ok(Some(user))
    }

    fn subscribe(&self) -> AuthSubscription {
        self.events.subscribe()
    }
}

#[async_trait]
impl TableService for RestBackend {
    #[instrument(skip(self, filter, order), fields(table = %table))]
    async fn select(
        &self,
        table: Table,
        filter: &Filter,
        order: Option<&Order>,
    ) -> Result<Vec<Value>, BackendError> {
        let mut query = vec![("select".to_string(), "*".to_string())];
        query.extend(query_pairs(filter, order));
        let response = self
            .table_request(Method::GET, table, &query)?
            .send()
            .await?;
        let rows: Vec<Value> = check(response).await?.json().await?;
        debug!(count = rows.len(), "selected rows");
        Ok(rows)
    }

    #[instrument(skip(self, rows), fields(table = %table, count = rows.len()))]
    async fn insert(&self, table: Table, rows: Vec<Value>) -> Result<Vec<Value>, BackendError> {
        let response = self
            .table_request(Method::POST, table, &[])?
            .header("Prefer", "return=representation")
            .json(&rows)
            .send()
            .await?;
        Ok(check(response).await?.json().await?)
    }

    #[instrument(skip(self, rows), fields(table = %table, count = rows.len()))]
    async fn upsert(
        &self,
        table: Table,
        rows: Vec<Value>,
        on_conflict: &[&str],
    ) -> Result<Vec<Value>, BackendError> {
        let query = [("on_conflict".to_string(), on_conflict.join(","))];
        let response = self
            .table_request(Method::POST, table, &query)?
            .header("Prefer", "return=representation,resolution=ignore-duplicates")
            .json(&rows)
            .send()
            .await?;
        let mut stored: Vec<Value> = check(response).await?.json().await?;

        // Ignored duplicates are not echoed back; fetch the rows already there.
        for row in &rows {
            let key = conflict_key(row, on_conflict);
            if stored.iter().any(|candidate| key.matches(candidate)) {
                continue;
            }
            debug!("upsert hit an existing row; selecting it");
            stored.extend(self.select(table, &key, None).await?);
        }
        Ok(stored)
    }

    #[instrument(skip(self, filter, patch), fields(table = %table))]
    async fn update(
        &self,
        table: Table,
        filter: &Filter,
        patch: Value,
    ) -> Result<(), BackendError> {
        let response = self
            .table_request(Method::PATCH, table, &query_pairs(filter, None))?
            .header("Prefer", "return=minimal")
            .json(&patch)
            .send()
            .await?;
        check(response).await?;
        Ok(())
    }

    #[instrument(skip(self, filter), fields(table = %table))]
    async fn delete(&self, table: Table, filter: &Filter) -> Result<(), BackendError> {
        let response = self
            .table_request(Method::DELETE, table, &query_pairs(filter, None))?
            .send()
            .await?;
        check(response).await?;
        Ok(())
    }
}

/// PostgREST query parameters for an equality filter and optional order.
fn conflict_key(row: &Value, columns: &[&str]) -> Filter {
    columns.iter().fold(Filter::new(), |filter, column| {
        filter.eq(column, row.get(*column).cloned().unwrap_or(Value::Null))
    })
}

pub fn query_pairs(filter: &Filter, order: Option<&Order>) -> Vec<(String, String)> {
    let mut pairs: Vec<(String, String)> = filter
        .conditions()
        .iter()
        .map(|(column, value)| {
            let operand = match value {
                Value::Null => "is.null".to_string(),
                Value::String(text) => format!("eq.{text}"),
                other => format!("eq.{other}"),
            };
            (column.clone(), operand)
        })
        .collect();

    if let Some(order) = order {
        let direction = if order.ascending { "asc" } else { "desc" };
        pairs.push(("order".to_string(), format!("{}.{direction}", order.column)));
    }
    pairs
}

async fn check(response: Response) -> Result<Response, BackendError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    let message = error_message(&body).unwrap_or_else(|| {
        status
            .canonical_reason()
            .unwrap_or("request failed")
            .to_string()
    });
    warn!(status = %status, message = %message, "backend returned an error");

    if status == StatusCode::BAD_REQUEST || status == StatusCode::UNPROCESSABLE_ENTITY {
        // Auth endpoints report bad credentials and weak passwords this way.
        return Err(BackendError::Rejected(message));
    }
    Err(BackendError::Service {
        status: status.as_u16(),
        message,
    })
}

fn error_message(body: &str) -> Option<String> {
    let value: Value = serde_json::from_str(body).ok()?;
    ["error_description", "msg", "message", "error"]
        .iter()
        .find_map(|key| value.get(*key).and_then(Value::as_str))
        .map(str::to_string)
}

#[cfg(test)]
mod tests {
    use serde_json::json;
    use uuid::Uuid;

    use super::{conflict_key, error_message, query_pairs};
    use crate::backend::{Filter, Order};

    #[test]
    fn equality_filters_become_postgrest_operators() {
        let owner = Uuid::nil();
        let filter = Filter::new()
            .eq("user_id", owner.to_string())
            .eq("is_complete", true)
            .eq("category_id", json!(null))
            .eq("id", 12);

        let pairs = query_pairs(&filter, Some(&Order::desc("created_at")));
        assert_eq!(
            pairs,
            vec![
                ("user_id".to_string(), format!("eq.{owner}")),
                ("is_complete".to_string(), "eq.true".to_string()),
                ("category_id".to_string(), "is.null".to_string()),
                ("id".to_string(), "eq.12".to_string()),
                ("order".to_string(), "created_at.desc".to_string()),
            ]
        );
    }

    #[test]
    fn conflict_key_finds_the_stored_row_of_a_duplicate() {
        let owner = Uuid::nil();
        let sent = json!({ "user_id": owner, "name": "WORK", "name_key": "work", "color": "red" });
        let stored = json!({ "id": 4, "user_id": owner, "name": "Work", "name_key": "work", "color": "blue" });
        let other = json!({ "id": 5, "user_id": owner, "name": "Home", "name_key": "home", "color": "red" });

        let key = conflict_key(&sent, &["user_id", "name_key"]);
        assert!(key.matches(&stored));
        assert!(!key.matches(&other));
    }

    #[test]
    fn error_message_prefers_descriptive_fields() {
        assert_eq!(
            error_message(r#"{"error":"invalid_grant","error_description":"Invalid login credentials"}"#)
                .as_deref(),
            Some("Invalid login credentials")
        );
        assert_eq!(
            error_message(r#"{"code":"23505","message":"duplicate key"}"#).as_deref(),
            Some("duplicate key")
        );
        assert_eq!(error_message("<html>"), None);
    }
}

use async_trait::async_trait;
use chrono::{DateTime, Duration, SecondsFormat, Utc};
use serde_json::{json, Map, Value};
use std::{
    cmp::Ordering,
    collections::{HashMap, HashSet},
    future::Future,
    sync::Arc,
    time::Duration as StdDuration,
};
use tokio::sync::{broadcast, Mutex, Notify};

use crate::{
    backend::{Backend, Filter, RowQuery},
    error::{FeedError, Result},
    types::{AuthEvent, AuthEventKind, AuthResponse, Session, User},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Op {
    Select,
    Insert,
    Upsert,
    Delete,
    Rpc,
    Upload,
    RemoveObjects,
    SignUp,
    SignIn,
    SignOut,
    GetSession,
}

struct Account {
    user: User,
    password: String,
    confirmed: bool,
}

#[derive(Default)]
struct Inner {
    tables: HashMap<String, Vec<Value>>,
    objects: HashMap<String, Vec<u8>>,
    accounts: HashMap<String, Account>,
    session: Option<Session>,
    failing: HashSet<Op>,
    last_timestamp: Option<DateTime<Utc>>,
}

impl Inner {
    fn check(&self, op: Op) -> Result<()> {
        if self.failing.contains(&op) {
            return Err(FeedError::api(503, None, format!("{:?} unavailable", op)));
        }
        Ok(())
    }

    // Strictly increasing so insertion order is also creation order
    fn next_timestamp(&mut self) -> String {
        let mut now = Utc::now();
        if let Some(last) = self.last_timestamp {
            if now <= last {
                now = last + Duration::microseconds(1);
            }
        }
        self.last_timestamp = Some(now);
        now.to_rfc3339_opts(SecondsFormat::Micros, true)
    }
}

/// Polls `check` until it holds, failing after a couple of seconds.
pub async fn wait_until<F, Fut>(mut check: F)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let polled = tokio::time::timeout(StdDuration::from_secs(2), async {
        while !check().await {
            tokio::time::sleep(StdDuration::from_millis(2)).await;
        }
    })
    .await;
    assert!(polled.is_ok(), "condition not reached within 2s");
}

/// In-process backend for tests: tables of JSON rows, an object bucket map and password accounts.
pub struct MemoryBackend {
    inner: Mutex<Inner>,
    gates: Mutex<HashMap<Op, Arc<Notify>>>,
    events: broadcast::Sender<AuthEvent>,
    profile_function: bool,
    auto_confirm: bool,
    confirm_trigger: bool,
    unordered_reads: bool,
}

impl MemoryBackend {
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(16);
        Self {
            inner: Mutex::new(Inner::default()),
            gates: Mutex::new(HashMap::new()),
            events,
            profile_function: true,
            auto_confirm: true,
            confirm_trigger: false,
            unordered_reads: false,
        }
    }

    /// RPC calls fail with `42883` as if the function was never created.
    pub fn without_profile_function(mut self) -> Self {
        self.profile_function = false;
        self
    }

    /// Sign-up answers with a user and no session.
    pub fn without_auto_confirm(mut self) -> Self {
        self.auto_confirm = false;
        self
    }

    /// Accounts are confirmed server-side right after sign-up.
    pub fn with_confirm_trigger(mut self) -> Self {
        self.confirm_trigger = true;
        self
    }

    /// Reads come back in the reverse of the requested order.
    pub fn with_unordered_reads(mut self) -> Self {
        self.unordered_reads = true;
        self
    }

    pub async fn fail(&self, op: Op) {
        self.inner.lock().await.failing.insert(op);
    }

    pub async fn recover(&self, op: Op) {
        self.inner.lock().await.failing.remove(&op);
    }

    /// Calls of `op` wait until `release(op)`.
    pub async fn hold(&self, op: Op) {
        self.gates
            .lock()
            .await
            .entry(op)
            .or_insert_with(|| Arc::new(Notify::new()));
    }

    pub async fn release(&self, op: Op) {
        if let Some(gate) = self.gates.lock().await.remove(&op) {
            gate.notify_waiters();
        }
    }

    async fn pass(&self, op: Op) {
        let Some(gate) = self.gates.lock().await.get(&op).cloned() else {
            return;
        };
        let released = gate.notified();
        tokio::pin!(released);
        // register before checking again so a release in between is not missed
        released.as_mut().enable();
        if self.gates.lock().await.contains_key(&op) {
            released.await;
        }
    }

    pub async fn rows(&self, table: &str) -> Vec<Value> {
        self.inner
            .lock()
            .await
            .tables
            .get(table)
            .cloned()
            .unwrap_or_default()
    }

    pub async fn seed(&self, table: &str, row: Value) {
        self.inner
            .lock()
            .await
            .tables
            .entry(table.to_string())
            .or_default()
            .push(row);
    }

    pub async fn object_keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self.inner.lock().await.objects.keys().cloned().collect();
        keys.sort();
        keys
    }

    fn new_session(user: &User) -> Session {
        Session {
            access_token: format!("access-{}", uuid::Uuid::new_v4()),
            refresh_token: format!("refresh-{}", uuid::Uuid::new_v4()),
            token_type: "bearer".to_string(),
            expires_in: 3600,
            expires_at: Some(Utc::now().timestamp() + 3600),
            user: user.clone(),
        }
    }

    fn emit(&self, kind: AuthEventKind, session: Option<Session>) {
        let _ = self.events.send(AuthEvent { kind, session });
    }
}

fn matches(row: &Value, filters: &[Filter]) -> bool {
    filters.iter().all(|f| match row.get(&f.column) {
        Some(Value::String(s)) => s == &f.value,
        Some(Value::Null) | None => false,
        Some(other) => other.to_string() == f.value,
    })
}

fn compare(a: Option<&Value>, b: Option<&Value>) -> Ordering {
    match (a, b) {
        (Some(Value::String(a)), Some(Value::String(b))) => a.cmp(b),
        (Some(Value::Number(a)), Some(Value::Number(b))) => a
            .as_f64()
            .partial_cmp(&b.as_f64())
            .unwrap_or(Ordering::Equal),
        _ => Ordering::Equal,
    }
}

fn project(row: &Value, columns: &[String]) -> Value {
    if columns.is_empty() || columns.iter().any(|c| c == "*") {
        return row.clone();
    }
    let mut out = Map::new();
    for column in columns {
        out.insert(
            column.clone(),
            row.get(column).cloned().unwrap_or(Value::Null),
        );
    }
    Value::Object(out)
}

fn merge(target: &mut Value, patch: Value) {
    if let (Value::Object(target), Value::Object(patch)) = (target, patch) {
        for (k, v) in patch {
            target.insert(k, v);
        }
    }
}

#[async_trait]
impl Backend for MemoryBackend {
    async fn select(&self, table: &str, query: &RowQuery) -> Result<Vec<Value>> {
        self.pass(Op::Select).await;
        let inner = self.inner.lock().await;
        inner.check(Op::Select)?;

        let mut rows: Vec<&Value> = inner
            .tables
            .get(table)
            .map(|rows| rows.iter().filter(|r| matches(r, &query.filters)).collect())
            .unwrap_or_default();

        if let Some(order) = &query.order {
            rows.sort_by(|a, b| {
                let ord = compare(a.get(&order.column), b.get(&order.column));
                if order.ascending {
                    ord
                } else {
                    ord.reverse()
                }
            });
        }
        if self.unordered_reads {
            rows.reverse();
        }
        if let Some(limit) = query.limit {
            rows.truncate(limit);
        }

        Ok(rows.into_iter().map(|r| project(r, &query.columns)).collect())
    }

    async fn insert(&self, table: &str, mut row: Value) -> Result<()> {
        self.pass(Op::Insert).await;
        let mut inner = self.inner.lock().await;
        inner.check(Op::Insert)?;

        let Some(fields) = row.as_object_mut() else {
            return Err(FeedError::api(400, Some("PGRST102".to_string()), "row must be an object"));
        };
        if !fields.contains_key("id") {
            fields.insert("id".to_string(), json!(uuid::Uuid::new_v4().to_string()));
        }
        if !fields.contains_key("created_at") {
            fields.insert("created_at".to_string(), json!(inner.next_timestamp()));
        }
        if table == "posts" && row.get("author_id").map_or(true, Value::is_null) {
            return Err(FeedError::api(
                400,
                Some("23502".to_string()),
                "null value in column \"author_id\" violates not-null constraint",
            ));
        }

        inner.tables.entry(table.to_string()).or_default().push(row);
        Ok(())
    }

    async fn upsert(&self, table: &str, row: Value, on_conflict: &str) -> Result<()> {
        let mut inner = self.inner.lock().await;
        inner.check(Op::Upsert)?;

        let key = row.get(on_conflict).cloned();
        let rows = inner.tables.entry(table.to_string()).or_default();
        match rows
            .iter_mut()
            .find(|r| key.is_some() && r.get(on_conflict) == key.as_ref())
        {
            Some(existing) => merge(existing, row),
            None => rows.push(row),
        }
        Ok(())
    }

    async fn delete(&self, table: &str, filters: &[Filter]) -> Result<()> {
        self.pass(Op::Delete).await;
        let mut inner = self.inner.lock().await;
        inner.check(Op::Delete)?;
        if let Some(rows) = inner.tables.get_mut(table) {
            rows.retain(|r| !matches(r, filters));
        }
        Ok(())
    }

    async fn rpc(&self, function: &str, args: Value) -> Result<Value> {
        {
            let inner = self.inner.lock().await;
            inner.check(Op::Rpc)?;
        }
        if !self.profile_function || function != "create_user_profile" {
            return Err(FeedError::api(
                404,
                Some("42883".to_string()),
                format!("function {} does not exist", function),
            ));
        }

        let row = json!({
            "id": args["user_id"],
            "username": args["user_username"],
            "email": args["user_email"],
        });
        let mut inner = self.inner.lock().await;
        let rows = inner.tables.entry("profiles".to_string()).or_default();
        match rows.iter_mut().find(|r| r.get("id") == row.get("id")) {
            Some(existing) => merge(existing, row),
            None => {
                let mut row = row;
                merge(&mut row, json!({ "avatar_url": null, "bio": null }));
                rows.push(row);
            }
        }
        Ok(Value::Null)
    }

    async fn upload_object(
        &self,
        bucket: &str,
        path: &str,
        bytes: Vec<u8>,
        _content_type: &str,
    ) -> Result<()> {
        let mut inner = self.inner.lock().await;
        inner.check(Op::Upload)?;
        let key = format!("{}/{}", bucket, path);
        if inner.objects.contains_key(&key) {
            return Err(FeedError::api(409, None, "The resource already exists"));
        }
        inner.objects.insert(key, bytes);
        Ok(())
    }

    async fn remove_objects(&self, bucket: &str, paths: &[String]) -> Result<()> {
        let mut inner = self.inner.lock().await;
        inner.check(Op::RemoveObjects)?;
        for path in paths {
            inner.objects.remove(&format!("{}/{}", bucket, path));
        }
        Ok(())
    }

    fn public_url(&self, bucket: &str, path: &str) -> String {
        format!("memory://storage/v1/object/public/{}/{}", bucket, path)
    }

    async fn sign_up(&self, email: &str, password: &str, metadata: Value) -> Result<AuthResponse> {
        let mut inner = self.inner.lock().await;
        inner.check(Op::SignUp)?;
        if inner.accounts.contains_key(email) {
            return Err(FeedError::api(422, None, "User already registered"));
        }

        let user = User {
            id: uuid::Uuid::new_v4().to_string(),
            email: Some(email.to_string()),
            user_metadata: metadata,
            created_at: Some(inner.next_timestamp()),
        };
        inner.accounts.insert(
            email.to_string(),
            Account {
                user: user.clone(),
                password: password.to_string(),
                confirmed: self.auto_confirm || self.confirm_trigger,
            },
        );

        if !self.auto_confirm {
            return Ok(AuthResponse {
                user: Some(user),
                session: None,
            });
        }

        let session = Self::new_session(&user);
        inner.session = Some(session.clone());
        drop(inner);
        self.emit(AuthEventKind::SignedIn, Some(session.clone()));
        Ok(AuthResponse::from_session(session))
    }

    async fn sign_in_with_password(&self, email: &str, password: &str) -> Result<AuthResponse> {
        let mut inner = self.inner.lock().await;
        inner.check(Op::SignIn)?;

        let user = match inner.accounts.get(email) {
            Some(account) if account.password != password => {
                return Err(FeedError::api(400, None, "Invalid login credentials"))
            }
            Some(account) if !account.confirmed => {
                return Err(FeedError::api(400, None, "Email not confirmed"))
            }
            Some(account) => account.user.clone(),
            None => return Err(FeedError::api(400, None, "Invalid login credentials")),
        };

        let session = Self::new_session(&user);
        inner.session = Some(session.clone());
        drop(inner);
        self.emit(AuthEventKind::SignedIn, Some(session.clone()));
        Ok(AuthResponse::from_session(session))
    }

    async fn sign_out(&self) -> Result<()> {
        let mut inner = self.inner.lock().await;
        inner.session = None;
        let outcome = inner.check(Op::SignOut);
        drop(inner);
        self.emit(AuthEventKind::SignedOut, None);
        outcome
    }

    async fn get_session(&self) -> Result<Option<Session>> {
        let inner = self.inner.lock().await;
        inner.check(Op::GetSession)?;
        Ok(inner.session.clone())
    }

    async fn get_user(&self) -> Result<Option<User>> {
        Ok(self.get_session().await?.map(|s| s.user))
    }

    fn auth_events(&self) -> broadcast::Receiver<AuthEvent> {
        self.events.subscribe()
    }
}

use async_trait::async_trait;
use chrono::Utc;
use reqwest::{Method, RequestBuilder, Response};
use serde_json::{json, Value};
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};
use url::Url;

use crate::{
    backend::{Backend, Filter, RowQuery},
    error::{ErrorBody, FeedError, Result},
    session_store::SessionStore,
    types::{AuthEvent, AuthEventKind, AuthResponse, Session, User},
};

// Refresh sessions that expire this close to now
const REFRESH_MARGIN_SECS: i64 = 10;

#[derive(Debug, Clone)]
pub struct SupabaseConfig {
    pub url: String,
    pub anon_key: String,
}

/// `Backend` over a hosted Supabase project: PostgREST, GoTrue and Storage.
pub struct SupabaseClient {
    http: reqwest::Client,
    base_url: Url,
    anon_key: String,
    sessions: Arc<dyn SessionStore>,
    events: broadcast::Sender<AuthEvent>,
}

impl SupabaseClient {
    pub fn new(config: SupabaseConfig, sessions: Arc<dyn SessionStore>) -> Result<Self> {
        let anon_key = config.anon_key.trim().to_string();
        if anon_key.is_empty() {
            return Err(FeedError::InvalidInput("Supabase anon key is empty".to_string()));
        }

        let mut base_url = Url::parse(config.url.trim())?;
        if !base_url.path().ends_with('/') {
            let path = format!("{}/", base_url.path());
            base_url.set_path(&path);
        }

        let (events, _) = broadcast::channel(16);

        Ok(Self {
            http: reqwest::Client::new(),
            base_url,
            anon_key,
            sessions,
            events,
        })
    }

    fn endpoint(&self, path: &str) -> Result<Url> {
        Ok(self.base_url.join(path)?)
    }

    fn anon_request(&self, method: Method, url: Url) -> RequestBuilder {
        self.http
            .request(method, url)
            .header("apikey", &self.anon_key)
            .bearer_auth(&self.anon_key)
    }

    // Row and storage calls run as the signed-in user when there is one
    async fn user_request(&self, method: Method, url: Url) -> RequestBuilder {
        let token = match self.get_session().await {
            Ok(Some(session)) => session.access_token,
            Ok(None) => self.anon_key.clone(),
            Err(e) => {
                warn!("Falling back to anonymous request: {}", e);
                self.anon_key.clone()
            }
        };
        self.http
            .request(method, url)
            .header("apikey", &self.anon_key)
            .bearer_auth(token)
    }

    async fn send(builder: RequestBuilder) -> Result<Response> {
        let response = builder.send().await?;
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }

        let raw = response.text().await.unwrap_or_default();
        let body: ErrorBody = serde_json::from_str(&raw).unwrap_or_default();
        Err(body.into_error(status.as_u16(), raw.trim()))
    }

    fn emit(&self, kind: AuthEventKind, session: Option<Session>) {
        // No receivers is fine
        let _ = self.events.send(AuthEvent { kind, session });
    }

    async fn store_session(&self, mut session: Session, kind: AuthEventKind) -> Result<Session> {
        if session.expires_at.is_none() && session.expires_in > 0 {
            session.expires_at = Some(Utc::now().timestamp() + session.expires_in);
        }
        self.sessions.save(&session).await?;
        self.emit(kind, Some(session.clone()));
        Ok(session)
    }

    async fn refresh_session(&self, refresh_token: &str) -> Result<Session> {
        let mut url = self.endpoint("auth/v1/token")?;
        url.query_pairs_mut()
            .append_pair("grant_type", "refresh_token");

        let result = Self::send(
            self.anon_request(Method::POST, url)
                .json(&json!({ "refresh_token": refresh_token })),
        )
        .await;

        match result {
            Ok(response) => {
                let session: Session = response.json().await?;
                debug!("Refreshed session for {}", session.user.id);
                self.store_session(session, AuthEventKind::TokenRefreshed)
                    .await
            }
            Err(e) => {
                warn!("Session refresh failed, signing out locally: {}", e);
                if let Err(clear_err) = self.sessions.clear().await {
                    warn!("Failed to clear stored session: {}", clear_err);
                }
                self.emit(AuthEventKind::SignedOut, None);
                Err(e)
            }
        }
    }
}

fn order_param(column: &str, ascending: bool) -> String {
    format!("{}.{}", column, if ascending { "asc" } else { "desc" })
}

#[async_trait]
impl Backend for SupabaseClient {
    async fn select(&self, table: &str, query: &RowQuery) -> Result<Vec<Value>> {
        let mut url = self.endpoint(&format!("rest/v1/{}", table))?;
        {
            let mut pairs = url.query_pairs_mut();
            if query.columns.is_empty() {
                pairs.append_pair("select", "*");
            } else {
                pairs.append_pair("select", &query.columns.join(","));
            }
            for filter in &query.filters {
                pairs.append_pair(&filter.column, &format!("eq.{}", filter.value));
            }
            if let Some(order) = &query.order {
                pairs.append_pair("order", &order_param(&order.column, order.ascending));
            }
            if let Some(limit) = query.limit {
                pairs.append_pair("limit", &limit.to_string());
            }
        }

        let response = Self::send(self.user_request(Method::GET, url).await).await?;
        Ok(response.json().await?)
    }

    async fn insert(&self, table: &str, row: Value) -> Result<()> {
        let url = self.endpoint(&format!("rest/v1/{}", table))?;
        Self::send(
            self.user_request(Method::POST, url)
                .await
                .header("Prefer", "return=minimal")
                .json(&row),
        )
        .await?;
        Ok(())
    }

    async fn upsert(&self, table: &str, row: Value, on_conflict: &str) -> Result<()> {
        let mut url = self.endpoint(&format!("rest/v1/{}", table))?;
        url.query_pairs_mut().append_pair("on_conflict", on_conflict);
        Self::send(
            self.user_request(Method::POST, url)
                .await
                .header("Prefer", "resolution=merge-duplicates,return=minimal")
                .json(&row),
        )
        .await?;
        Ok(())
    }

    async fn delete(&self, table: &str, filters: &[Filter]) -> Result<()> {
        if filters.is_empty() {
            return Err(FeedError::InvalidInput(format!(
                "refusing unfiltered delete on {}",
                table
            )));
        }

        let mut url = self.endpoint(&format!("rest/v1/{}", table))?;
        {
            let mut pairs = url.query_pairs_mut();
            for filter in filters {
                pairs.append_pair(&filter.column, &format!("eq.{}", filter.value));
            }
        }
        Self::send(self.user_request(Method::DELETE, url).await).await?;
        Ok(())
    }

    async fn rpc(&self, function: &str, args: Value) -> Result<Value> {
        let url = self.endpoint(&format!("rest/v1/rpc/{}", function))?;
        let response = Self::send(self.user_request(Method::POST, url).await.json(&args)).await?;
        let text = response.text().await?;
        if text.trim().is_empty() {
            return Ok(Value::Null);
        }
        Ok(serde_json::from_str(&text)?)
    }

    async fn upload_object(
        &self,
        bucket: &str,
        path: &str,
        bytes: Vec<u8>,
        content_type: &str,
    ) -> Result<()> {
        let url = self.endpoint(&format!("storage/v1/object/{}/{}", bucket, path))?;
        Self::send(
            self.user_request(Method::POST, url)
                .await
                .header("Content-Type", content_type)
                .header("x-upsert", "false")
                .body(bytes),
        )
        .await?;
        Ok(())
    }

    async fn remove_objects(&self, bucket: &str, paths: &[String]) -> Result<()> {
        let url = self.endpoint(&format!("storage/v1/object/{}", bucket))?;
        Self::send(
            self.user_request(Method::DELETE, url)
                .await
                .json(&json!({ "prefixes": paths })),
        )
        .await?;
        Ok(())
    }

    fn public_url(&self, bucket: &str, path: &str) -> String {
        format!(
            "{}storage/v1/object/public/{}/{}",
            self.base_url, bucket, path
        )
    }

    async fn sign_up(&self, email: &str, password: &str, metadata: Value) -> Result<AuthResponse> {
        let url = self.endpoint("auth/v1/signup")?;
        let response = Self::send(self.anon_request(Method::POST, url).json(&json!({
            "email": email,
            "password": password,
            "data": metadata,
        })))
        .await?;

        // Auto-confirm projects answer with a session, others with the bare user
        let body: Value = response.json().await?;
        if body.get("access_token").is_some() {
            let session: Session = serde_json::from_value(body)?;
            let session = self.store_session(session, AuthEventKind::SignedIn).await?;
            info!("Signed up and signed in {}", session.user.id);
            Ok(AuthResponse::from_session(session))
        } else {
            let user: User = serde_json::from_value(body)?;
            info!("Signed up {} pending confirmation", user.id);
            Ok(AuthResponse {
                user: Some(user),
                session: None,
            })
        }
    }

    async fn sign_in_with_password(&self, email: &str, password: &str) -> Result<AuthResponse> {
        let mut url = self.endpoint("auth/v1/token")?;
        url.query_pairs_mut().append_pair("grant_type", "password");

        let response = Self::send(
            self.anon_request(Method::POST, url)
                .json(&json!({ "email": email, "password": password })),
        )
        .await?;
        let session: Session = response.json().await?;
        let session = self.store_session(session, AuthEventKind::SignedIn).await?;
        info!("Signed in {}", session.user.id);
        Ok(AuthResponse::from_session(session))
    }

    async fn sign_out(&self) -> Result<()> {
        let current = self.sessions.load().await.unwrap_or_else(|e| {
            warn!("Could not read stored session: {}", e);
            None
        });

        let remote = match current {
            Some(session) => {
                let url = self.endpoint("auth/v1/logout")?;
                Self::send(
                    self.http
                        .post(url)
                        .header("apikey", &self.anon_key)
                        .bearer_auth(&session.access_token),
                )
                .await
                .map(|_| ())
            }
            None => Ok(()),
        };

        // The local session goes away even if the server call failed
        self.sessions.clear().await?;
        self.emit(AuthEventKind::SignedOut, None);
        remote
    }

    async fn get_session(&self) -> Result<Option<Session>> {
        let Some(session) = self.sessions.load().await? else {
            return Ok(None);
        };
        if !session.expires_within(Utc::now(), REFRESH_MARGIN_SECS) {
            return Ok(Some(session));
        }
        self.refresh_session(&session.refresh_token).await.map(Some)
    }

    async fn get_user(&self) -> Result<Option<User>> {
        let Some(session) = self.get_session().await? else {
            return Ok(None);
        };
        let url = self.endpoint("auth/v1/user")?;
        let response = Self::send(
            self.http
                .get(url)
                .header("apikey", &self.anon_key)
                .bearer_auth(&session.access_token),
        )
        .await?;
        Ok(Some(response.json().await?))
    }

    fn auth_events(&self) -> broadcast::Receiver<AuthEvent> {
        self.events.subscribe()
    }
}

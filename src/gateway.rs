use serde::de::DeserializeOwned;
use serde_json::{json, Value};
use std::{sync::Arc, time::Duration};
use tokio::sync::broadcast::{self, error::RecvError};
use tracing::{debug, error, info, warn};

use crate::{
    backend::{Backend, Filter, RowQuery},
    error::Result,
    images::storage_path_from_public_url,
    types::{
        AuthEvent, AuthResponse, NewPostRow, PostPayload, PostRecord, ProfilePayload,
        ProfileRecord, Session, User,
    },
};

const POSTS_TABLE: &str = "posts";
const PROFILES_TABLE: &str = "profiles";
const POST_COLUMNS: &str = "id, author_id, author_username, content, image_url, created_at";
const PROFILE_COLUMNS: &str = "id, username, email, avatar_url, bio";
pub const IMAGE_BUCKET: &str = "posts";

const PROFILE_FUNCTION: &str = "create_user_profile";
// Postgres undefined_function
const UNDEFINED_FUNCTION: &str = "42883";

const SIGN_UP_CONFIRM_DELAY: Duration = Duration::from_millis(500);

/// Domain operations on top of the backend. Holds no state of its own.
pub struct Gateway {
    pub(crate) backend: Arc<dyn Backend>,
    confirm_delay: Duration,
}

fn decode_rows<T: DeserializeOwned>(rows: Vec<Value>) -> Result<Vec<T>> {
    rows.into_iter()
        .map(|row| serde_json::from_value(row).map_err(Into::into))
        .collect()
}

impl Gateway {
    pub fn new(backend: Arc<dyn Backend>) -> Self {
        Self {
            backend,
            confirm_delay: SIGN_UP_CONFIRM_DELAY,
        }
    }

    /// How long sign-up waits for a server-side confirm before retrying sign-in.
    pub fn with_confirm_delay(mut self, delay: Duration) -> Self {
        self.confirm_delay = delay;
        self
    }

    // Posts

    pub async fn create_post(&self, payload: &PostPayload) -> Result<()> {
        let row = serde_json::to_value(NewPostRow::from(payload))?;
        self.backend
            .insert(POSTS_TABLE, row)
            .await
            .inspect_err(|e| error!("Failed to create post: {}", e))
    }

    pub async fn fetch_feed_posts(&self) -> Result<Vec<PostRecord>> {
        let query = RowQuery::select(POST_COLUMNS).order("created_at", false);
        let rows = self
            .backend
            .select(POSTS_TABLE, &query)
            .await
            .inspect_err(|e| error!("Failed to fetch posts: {}", e))?;
        decode_rows(rows)
    }

    pub async fn fetch_posts_by_user(&self, author_id: &str) -> Result<Vec<PostRecord>> {
        let query = RowQuery::select(POST_COLUMNS)
            .eq("author_id", author_id)
            .order("created_at", false);
        let rows = self
            .backend
            .select(POSTS_TABLE, &query)
            .await
            .inspect_err(|e| error!("Failed to fetch posts for {}: {}", author_id, e))?;
        decode_rows(rows)
    }

    /// Deletes the post row. A stored image behind `image_url` is removed
    /// best-effort; only the row deletion can fail the call.
    pub async fn delete_post(&self, post_id: &str, image_url: Option<&str>) -> Result<()> {
        if let Some(path) = image_url.and_then(storage_path_from_public_url) {
            if let Err(e) = self
                .backend
                .remove_objects(IMAGE_BUCKET, std::slice::from_ref(&path))
                .await
            {
                warn!("Failed to remove image {} from storage: {}", path, e);
            }
        }

        self.backend
            .delete(POSTS_TABLE, &[Filter::eq("id", post_id)])
            .await
            .inspect_err(|e| error!("Failed to delete post {}: {}", post_id, e))?;
        info!("Deleted post {}", post_id);
        Ok(())
    }

    // Profiles

    /// Upserts the profile, preferring the privileged database function and
    /// falling back to a direct upsert when the function does not exist.
    pub async fn create_profile(&self, payload: &ProfilePayload) -> Result<()> {
        let args = json!({
            "user_id": payload.user_id,
            "user_username": payload.username,
            "user_email": payload.email,
        });

        match self.backend.rpc(PROFILE_FUNCTION, args).await {
            Ok(_) => Ok(()),
            Err(e) if e.code() == Some(UNDEFINED_FUNCTION) => {
                debug!("{} is not installed, upserting profile directly", PROFILE_FUNCTION);
                let row = serde_json::to_value(ProfileRecord::from(payload))?;
                self.backend
                    .upsert(PROFILES_TABLE, row, "id")
                    .await
                    .inspect_err(|e| error!("Failed to create profile: {}", e))
            }
            Err(e) => {
                error!("Failed to create profile via {}: {}", PROFILE_FUNCTION, e);
                Err(e)
            }
        }
    }

    pub async fn fetch_profile(&self, user_id: &str) -> Result<Option<ProfileRecord>> {
        let query = RowQuery::select(PROFILE_COLUMNS).eq("id", user_id).limit(1);
        let rows = self
            .backend
            .select(PROFILES_TABLE, &query)
            .await
            .inspect_err(|e| error!("Failed to fetch profile {}: {}", user_id, e))?;
        Ok(decode_rows(rows)?.into_iter().next())
    }

    // Auth

    pub async fn sign_in(&self, email: &str, password: &str) -> Result<AuthResponse> {
        self.backend
            .sign_in_with_password(email.trim(), password)
            .await
    }

    /// Registers the account. When the backend returns a user without a
    /// session, a follow-up sign-in is attempted; its failure is ignored.
    pub async fn sign_up(&self, email: &str, password: &str, username: &str) -> Result<AuthResponse> {
        let email = email.trim();
        let response = self
            .backend
            .sign_up(email, password, json!({ "username": username.trim() }))
            .await?;

        if response.user.is_some() && response.session.is_none() {
            tokio::time::sleep(self.confirm_delay).await;
            match self.backend.sign_in_with_password(email, password).await {
                Ok(signed_in) => return Ok(signed_in),
                Err(e) => debug!("Follow-up sign-in after sign-up failed: {}", e),
            }
        }

        Ok(response)
    }

    pub async fn sign_out(&self) -> Result<()> {
        self.backend.sign_out().await
    }

    pub async fn current_user(&self) -> Result<Option<User>> {
        self.backend.get_user().await
    }

    pub async fn current_session(&self) -> Result<Option<Session>> {
        self.backend.get_session().await
    }

    pub fn subscribe_to_auth_changes(&self) -> AuthSubscription {
        AuthSubscription {
            events: self.backend.auth_events(),
        }
    }
}

/// Inbound auth events. Dropping the subscription unsubscribes.
pub struct AuthSubscription {
    events: broadcast::Receiver<AuthEvent>,
}

impl AuthSubscription {
    pub async fn next(&mut self) -> Option<AuthEvent> {
        loop {
            match self.events.recv().await {
                Ok(event) => return Some(event),
                Err(RecvError::Lagged(missed)) => {
                    warn!("Auth subscription skipped {} events", missed);
                }
                Err(RecvError::Closed) => return None,
            }
        }
    }
}

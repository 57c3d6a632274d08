use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// Feed table row
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PostRecord {
    pub id: String,
    pub author_id: String,
    pub author_username: String,
    #[serde(default)]
    pub content: String,
    pub image_url: Option<String>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct PostPayload {
    pub author_id: String,
    pub author_username: String,
    pub content: String,
    pub image_url: Option<String>,
}

// Insert body; id and created_at are assigned by the backend
#[derive(Debug, Serialize)]
pub struct NewPostRow<'a> {
    pub author_id: &'a str,
    pub author_username: &'a str,
    pub content: &'a str,
    pub image_url: Option<&'a str>,
}

impl<'a> From<&'a PostPayload> for NewPostRow<'a> {
    fn from(payload: &'a PostPayload) -> Self {
        Self {
            author_id: &payload.author_id,
            author_username: &payload.author_username,
            content: &payload.content,
            image_url: payload.image_url.as_deref(),
        }
    }
}

// Profile table row
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProfileRecord {
    pub id: String,
    pub username: String,
    pub email: String,
    pub avatar_url: Option<String>,
    pub bio: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ProfilePayload {
    pub user_id: String,
    pub username: String,
    pub email: String,
    pub avatar_url: Option<String>,
    pub bio: Option<String>,
}

impl From<&ProfilePayload> for ProfileRecord {
    fn from(payload: &ProfilePayload) -> Self {
        Self {
            id: payload.user_id.clone(),
            username: payload.username.clone(),
            email: payload.email.clone(),
            avatar_url: payload.avatar_url.clone(),
            bio: payload.bio.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct User {
    pub id: String,
    pub email: Option<String>,
    #[serde(default)]
    pub user_metadata: serde_json::Value,
    pub created_at: Option<String>,
}

impl User {
    pub fn username(&self) -> Option<&str> {
        self.user_metadata.get("username").and_then(|v| v.as_str())
    }

    /// Name stamped on new posts: metadata username, then email, then "Anonymous".
    pub fn display_name(&self) -> String {
        self.username()
            .or(self.email.as_deref())
            .unwrap_or("Anonymous")
            .to_string()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Session {
    pub access_token: String,
    pub refresh_token: String,
    #[serde(default = "default_token_type")]
    pub token_type: String,
    #[serde(default)]
    pub expires_in: i64,
    // unix seconds
    pub expires_at: Option<i64>,
    pub user: User,
}

fn default_token_type() -> String {
    "bearer".to_string()
}

impl Session {
    pub fn expires_within(&self, now: DateTime<Utc>, margin_secs: i64) -> bool {
        match self.expires_at {
            Some(at) => at <= now.timestamp() + margin_secs,
            None => false,
        }
    }
}

/// Result of sign-up or sign-in. Sign-up without auto-confirm yields a user and no session.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct AuthResponse {
    pub user: Option<User>,
    pub session: Option<Session>,
}

impl AuthResponse {
    pub fn from_session(session: Session) -> Self {
        Self {
            user: Some(session.user.clone()),
            session: Some(session),
        }
    }

    pub fn user(&self) -> Option<&User> {
        self.user
            .as_ref()
            .or_else(|| self.session.as_ref().map(|s| &s.user))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthEventKind {
    SignedIn,
    SignedOut,
    TokenRefreshed,
}

#[derive(Debug, Clone, PartialEq)]
pub struct AuthEvent {
    pub kind: AuthEventKind,
    pub session: Option<Session>,
}

impl AuthEvent {
    pub fn user(&self) -> Option<&User> {
        self.session.as_ref().map(|s| &s.user)
    }
}

use chrono::Local;
use std::{path::Path, sync::Arc};
use tracing::{debug, error, info, warn};

use crate::{
    auth_store::AuthStore,
    error::{FeedError, Result},
    gateway::Gateway,
    posts_store::{PostsStore, ADD_POST_ERROR},
    types::{PostPayload, PostRecord, ProfilePayload, ProfileRecord, User},
};

#[derive(Debug, Clone, PartialEq)]
pub enum SignUpOutcome {
    SignedIn(User),
    PendingConfirmation,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ComposeOutcome {
    NotSignedIn,
    // nothing to share: blank text and no image
    Empty,
    Shared,
    // saved, but the feed could not be reloaded afterwards
    SharedWithWarning(String),
    Failed(String),
}

#[derive(Debug, Clone, PartialEq)]
pub struct FeedView {
    pub posts: Vec<PostRecord>,
    pub error: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct AccountView {
    pub user: User,
    pub profile: Option<ProfileRecord>,
    pub posts: Vec<PostRecord>,
    pub error: Option<String>,
}

/// The stores plus the gateway, wired the way each screen of the client uses them.
pub struct App {
    gateway: Arc<Gateway>,
    auth: AuthStore,
    posts: PostsStore,
}

impl App {
    pub async fn start(gateway: Arc<Gateway>) -> Self {
        let auth = AuthStore::new(Arc::clone(&gateway));
        auth.initialize().await;
        let restored = auth.snapshot().await;
        debug!(
            "Auth ready, restored user: {:?}",
            restored.user.as_ref().map(|u| &u.id)
        );
        let posts = PostsStore::new(Arc::clone(&gateway));
        Self {
            gateway,
            auth,
            posts,
        }
    }

    pub async fn shutdown(&self) {
        self.auth.teardown().await;
    }

    async fn require_user(&self) -> Result<User> {
        self.auth.user().await.ok_or(FeedError::NotAuthenticated)
    }

    /// Registers, then makes sure a profile row exists. A profile failure is
    /// only logged since a server-side trigger may already have created it.
    pub async fn sign_up(&self, email: &str, password: &str, username: &str) -> Result<SignUpOutcome> {
        let response = self.gateway.sign_up(email, password, username).await?;

        if let Some(user) = response.user() {
            let profile = ProfilePayload {
                user_id: user.id.clone(),
                username: username.trim().to_string(),
                email: email.trim().to_string(),
                avatar_url: None,
                bio: None,
            };
            if let Err(e) = self.gateway.create_profile(&profile).await {
                warn!("Profile creation failed, relying on server trigger: {}", e);
            }
        }

        match response.session {
            Some(session) => {
                self.auth.set_session(Some(session.clone())).await;
                Ok(SignUpOutcome::SignedIn(session.user))
            }
            None => Ok(SignUpOutcome::PendingConfirmation),
        }
    }

    pub async fn sign_in(&self, email: &str, password: &str) -> Result<User> {
        let response = self.gateway.sign_in(email, password).await?;
        self.auth.set_session(response.session.clone()).await;
        response.user().cloned().ok_or(FeedError::NotAuthenticated)
    }

    pub async fn sign_out(&self) -> Result<()> {
        self.auth.sign_out().await
    }

    pub async fn feed(&self) -> FeedView {
        self.posts.load_feed_posts().await;
        let error = self.posts.snapshot().await.error;
        FeedView {
            posts: self.posts.sorted_feed().await,
            error,
        }
    }

    pub async fn account(&self) -> Result<AccountView> {
        self.require_user().await?;
        // ask the backend so a revoked session shows up here
        let user = self
            .gateway
            .current_user()
            .await?
            .ok_or(FeedError::NotAuthenticated)?;
        let profile = self.gateway.fetch_profile(&user.id).await?;
        self.posts.load_user_posts(&user.id).await;
        let error = self.posts.snapshot().await.error;
        Ok(AccountView {
            user,
            profile,
            posts: self.posts.sorted_user_posts().await,
            error,
        })
    }

    /// Shares a post, uploading `image` first. An upload failure is logged and
    /// the post goes out without the image.
    pub async fn compose(&self, content: &str, image: Option<&Path>) -> ComposeOutcome {
        let Some(user) = self.auth.user().await else {
            self.posts.clear_error().await;
            return ComposeOutcome::NotSignedIn;
        };
        if content.trim().is_empty() && image.is_none() {
            return ComposeOutcome::Empty;
        }

        self.posts.clear_error().await;

        let image_url = match image {
            Some(file) => match self.gateway.upload_image(file, &user.id).await {
                Ok(url) => Some(url),
                Err(e) => {
                    error!("Failed to upload image {}: {}", file.display(), e);
                    None
                }
            },
            None => None,
        };

        self.posts
            .add_post(PostPayload {
                author_id: user.id.clone(),
                author_username: user.display_name(),
                content: content.trim().to_string(),
                image_url,
            })
            .await;

        match self.posts.snapshot().await.error {
            Some(message) if message == ADD_POST_ERROR => ComposeOutcome::Failed(message),
            Some(message) => {
                warn!("Post shared but the feed reload failed");
                ComposeOutcome::SharedWithWarning(message)
            }
            None => ComposeOutcome::Shared,
        }
    }

    pub async fn delete(&self, post_id: &str) -> Result<()> {
        let user = self.require_user().await?;
        // resolve the image url before the row disappears
        self.posts.load_user_posts(&user.id).await;
        self.posts.delete_post(post_id, Some(&user.id)).await?;
        info!("Post {} deleted", post_id);
        Ok(())
    }
}

pub fn format_post(post: &PostRecord) -> String {
    let when = post
        .created_at
        .with_timezone(&Local)
        .format("%d %b %H:%M");
    let mut out = format!("[{}] {} · {}", post.id, post.author_username, when);
    if !post.content.is_empty() {
        out.push_str(&format!("\n  {}", post.content));
    }
    if let Some(url) = &post.image_url {
        out.push_str(&format!("\n  image: {}", url));
    }
    out
}

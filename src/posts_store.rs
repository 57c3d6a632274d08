use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{error, info};

use crate::{
    error::Result,
    gateway::Gateway,
    types::{PostPayload, PostRecord},
};

pub const LOAD_FEED_ERROR: &str = "Unable to load posts. Pull to refresh to try again.";
pub const LOAD_USER_POSTS_ERROR: &str = "Unable to load your posts. Pull to refresh to try again.";
pub const ADD_POST_ERROR: &str = "We couldn't share your post. Please try again.";
pub const DELETE_POST_ERROR: &str = "Unable to delete post. Please try again.";

#[derive(Debug, Clone, Default, PartialEq)]
pub struct PostsState {
    pub feed_posts: Vec<PostRecord>,
    pub user_posts: Vec<PostRecord>,
    pub is_loading: bool,
    pub is_submitting: bool,
    pub error: Option<String>,
}

/// Newest first by `created_at`, whatever order the rows arrived in.
pub fn newest_first(posts: &[PostRecord]) -> Vec<PostRecord> {
    let mut sorted = posts.to_vec();
    sorted.sort_by(|a, b| b.created_at.cmp(&a.created_at));
    sorted
}

/// Client-side state for the shared feed and the current user's posts.
///
/// Every mutation is followed by a full reload from the backend rather than
/// a local patch, so the displayed lists never drift from the server for
/// longer than one round trip. Overlapping calls are not coordinated; the
/// last one to finish wins.
#[derive(Clone)]
pub struct PostsStore {
    gateway: Arc<Gateway>,
    state: Arc<RwLock<PostsState>>,
}

impl PostsStore {
    pub fn new(gateway: Arc<Gateway>) -> Self {
        Self {
            gateway,
            state: Arc::new(RwLock::new(PostsState::default())),
        }
    }

    pub async fn snapshot(&self) -> PostsState {
        self.state.read().await.clone()
    }

    pub async fn sorted_feed(&self) -> Vec<PostRecord> {
        newest_first(&self.state.read().await.feed_posts)
    }

    pub async fn sorted_user_posts(&self) -> Vec<PostRecord> {
        newest_first(&self.state.read().await.user_posts)
    }

    pub async fn load_feed_posts(&self) {
        {
            let mut state = self.state.write().await;
            state.is_loading = true;
            state.error = None;
        }

        let result = self.gateway.fetch_feed_posts().await;

        let mut state = self.state.write().await;
        state.is_loading = false;
        match result {
            Ok(posts) => state.feed_posts = posts,
            Err(e) => {
                error!("Failed to load feed posts: {}", e);
                state.error = Some(LOAD_FEED_ERROR.to_string());
            }
        }
    }

    pub async fn load_user_posts(&self, user_id: &str) {
        {
            let mut state = self.state.write().await;
            state.is_loading = true;
            state.error = None;
        }

        let result = self.gateway.fetch_posts_by_user(user_id).await;

        let mut state = self.state.write().await;
        state.is_loading = false;
        match result {
            Ok(posts) => state.user_posts = posts,
            Err(e) => {
                error!("Failed to load posts for {}: {}", user_id, e);
                state.error = Some(LOAD_USER_POSTS_ERROR.to_string());
            }
        }
    }

    pub async fn add_post(&self, payload: PostPayload) {
        {
            let mut state = self.state.write().await;
            state.is_submitting = true;
            state.error = None;
        }

        let payload = PostPayload {
            content: payload.content.trim().to_string(),
            ..payload
        };

        match self.gateway.create_post(&payload).await {
            Ok(()) => {
                info!("Shared post by {}", payload.author_id);
                self.load_feed_posts().await;
                self.state.write().await.is_submitting = false;
            }
            Err(e) => {
                error!("Failed to create post: {}", e);
                let mut state = self.state.write().await;
                state.error = Some(ADD_POST_ERROR.to_string());
                state.is_submitting = false;
            }
        }
    }

    /// Deletes remotely, then reloads the feed and, given `author_id`, that
    /// author's posts. A failed delete is recorded and returned; reloads that
    /// already ran are kept.
    pub async fn delete_post(&self, post_id: &str, author_id: Option<&str>) -> Result<()> {
        let image_url = {
            let mut state = self.state.write().await;
            state.is_submitting = true;
            state.error = None;
            state
                .feed_posts
                .iter()
                .chain(state.user_posts.iter())
                .find(|p| p.id == post_id)
                .and_then(|p| p.image_url.clone())
        };

        if let Err(e) = self.gateway.delete_post(post_id, image_url.as_deref()).await {
            error!("Failed to delete post {}: {}", post_id, e);
            let mut state = self.state.write().await;
            state.error = Some(DELETE_POST_ERROR.to_string());
            state.is_submitting = false;
            return Err(e);
        }

        self.load_feed_posts().await;
        if let Some(author_id) = author_id {
            self.load_user_posts(author_id).await;
        }
        self.state.write().await.is_submitting = false;
        Ok(())
    }

    pub async fn clear_error(&self) {
        self.state.write().await.error = None;
    }
}

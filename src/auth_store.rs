use std::sync::Arc;
use tokio::{sync::RwLock, task::JoinHandle};
use tracing::{debug, error, warn};

use crate::{
    error::Result,
    gateway::Gateway,
    types::{Session, User},
};

#[derive(Debug, Clone, PartialEq)]
pub struct AuthState {
    pub user: Option<User>,
    pub session: Option<Session>,
    pub is_loading: bool,
}

impl Default for AuthState {
    fn default() -> Self {
        Self {
            user: None,
            session: None,
            is_loading: true,
        }
    }
}

/// Read-only mirror of the backend session, kept current by the auth event channel.
#[derive(Clone)]
pub struct AuthStore {
    gateway: Arc<Gateway>,
    state: Arc<RwLock<AuthState>>,
    listener: Arc<RwLock<Option<JoinHandle<()>>>>,
}

impl AuthStore {
    pub fn new(gateway: Arc<Gateway>) -> Self {
        Self {
            gateway,
            state: Arc::new(RwLock::new(AuthState::default())),
            listener: Arc::new(RwLock::new(None)),
        }
    }

    pub async fn snapshot(&self) -> AuthState {
        self.state.read().await.clone()
    }

    pub async fn user(&self) -> Option<User> {
        self.state.read().await.user.clone()
    }

    pub async fn set_session(&self, session: Option<Session>) {
        let mut state = self.state.write().await;
        state.user = session.as_ref().map(|s| s.user.clone());
        state.session = session;
    }

    /// Loads the persisted session once and starts following auth events.
    pub async fn initialize(&self) {
        // subscribe first so a change racing the initial read is not lost
        let mut subscription = self.gateway.subscribe_to_auth_changes();

        match self.gateway.current_session().await {
            Ok(session) => {
                let mut state = self.state.write().await;
                state.user = session.as_ref().map(|s| s.user.clone());
                state.session = session;
                state.is_loading = false;
            }
            Err(e) => {
                error!("Failed to initialize auth: {}", e);
                self.state.write().await.is_loading = false;
            }
        }

        let store = self.clone();
        let handle = tokio::spawn(async move {
            while let Some(event) = subscription.next().await {
                debug!("Auth event {:?} for {:?}", event.kind, event.user().map(|u| &u.id));
                store.set_session(event.session).await;
            }
        });

        if let Some(previous) = self.listener.write().await.replace(handle) {
            previous.abort();
        }
    }

    /// Stops following auth events.
    pub async fn teardown(&self) {
        if let Some(handle) = self.listener.write().await.take() {
            handle.abort();
        }
    }

    /// Signs out remotely and always clears the local mirror.
    pub async fn sign_out(&self) -> Result<()> {
        let result = self.gateway.sign_out().await;
        if let Err(e) = &result {
            warn!("Backend sign-out failed: {}", e);
        }
        self.set_session(None).await;
        result
    }
}

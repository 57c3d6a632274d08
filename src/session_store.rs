use async_trait::async_trait;
use std::path::PathBuf;
use tracing::debug;

use crate::{error::Result, types::Session};

/// Client-side persistence for the auth session.
#[async_trait]
pub trait SessionStore: Send + Sync {
    async fn load(&self) -> Result<Option<Session>>;
    async fn save(&self, session: &Session) -> Result<()>;
    async fn clear(&self) -> Result<()>;
}

#[cfg(test)]
#[derive(Default)]
pub struct MemorySessionStore {
    session: tokio::sync::RwLock<Option<Session>>,
}

#[cfg(test)]
#[async_trait]
impl SessionStore for MemorySessionStore {
    async fn load(&self) -> Result<Option<Session>> {
        Ok(self.session.read().await.clone())
    }

    async fn save(&self, session: &Session) -> Result<()> {
        *self.session.write().await = Some(session.clone());
        Ok(())
    }

    async fn clear(&self) -> Result<()> {
        *self.session.write().await = None;
        Ok(())
    }
}

/// Keeps the session as JSON on disk so it survives between runs.
pub struct FileSessionStore {
    path: PathBuf,
}

impl FileSessionStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

#[async_trait]
impl SessionStore for FileSessionStore {
    async fn load(&self) -> Result<Option<Session>> {
        match tokio::fs::read(&self.path).await {
            Ok(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn save(&self, session: &Session) -> Result<()> {
        let bytes = serde_json::to_vec_pretty(session)?;
        tokio::fs::write(&self.path, bytes).await?;
        debug!("Saved session to {}", self.path.display());
        Ok(())
    }

    async fn clear(&self) -> Result<()> {
        match tokio::fs::remove_file(&self.path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

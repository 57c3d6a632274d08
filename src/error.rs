use serde::Deserialize;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum FeedError {
    #[error("{message}")]
    Api {
        status: u16,
        code: Option<String>,
        message: String,
    },

    #[error("request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("invalid response: {0}")]
    Json(#[from] serde_json::Error),

    #[error("file error: {0}")]
    Io(#[from] std::io::Error),

    #[error("invalid backend url: {0}")]
    Url(#[from] url::ParseError),

    #[error("not signed in")]
    NotAuthenticated,

    #[error("invalid input: {0}")]
    InvalidInput(String),
}

impl FeedError {
    pub fn api(status: u16, code: Option<String>, message: impl Into<String>) -> Self {
        FeedError::Api {
            status,
            code,
            message: message.into(),
        }
    }

    /// Backend error code (Postgres SQLSTATE for table and RPC calls).
    pub fn code(&self) -> Option<&str> {
        match self {
            FeedError::Api { code, .. } => code.as_deref(),
            _ => None,
        }
    }
}

pub type Result<T> = std::result::Result<T, FeedError>;

// PostgREST, GoTrue and Storage each shape their error bodies differently.
#[derive(Debug, Default, Deserialize)]
pub(crate) struct ErrorBody {
    code: Option<serde_json::Value>,
    error_code: Option<String>,
    message: Option<String>,
    msg: Option<String>,
    error_description: Option<String>,
    error: Option<String>,
}

impl ErrorBody {
    pub(crate) fn into_error(self, status: u16, raw: &str) -> FeedError {
        let code = self.error_code.or_else(|| match self.code {
            Some(serde_json::Value::String(s)) => Some(s),
            _ => None,
        });
        let message = self
            .message
            .or(self.msg)
            .or(self.error_description)
            .or(self.error)
            .unwrap_or_else(|| {
                if raw.is_empty() {
                    format!("backend returned status {}", status)
                } else {
                    raw.to_string()
                }
            });
        FeedError::api(status, code, message)
    }
}

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::broadcast;

use crate::{
    error::Result,
    types::{AuthEvent, AuthResponse, Session, User},
};

#[derive(Debug, Clone, PartialEq)]
pub struct Filter {
    pub column: String,
    pub value: String,
}

impl Filter {
    pub fn eq(column: &str, value: &str) -> Self {
        Self {
            column: column.to_string(),
            value: value.to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Order {
    pub column: String,
    pub ascending: bool,
}

/// A single-table read: column list, equality filters, optional ordering and limit.
#[derive(Debug, Clone, PartialEq)]
pub struct RowQuery {
    pub columns: Vec<String>,
    pub filters: Vec<Filter>,
    pub order: Option<Order>,
    pub limit: Option<usize>,
}

impl RowQuery {
    pub fn select(columns: &str) -> Self {
        Self {
            columns: columns
                .split(',')
                .map(|c| c.trim().to_string())
                .filter(|c| !c.is_empty())
                .collect(),
            filters: Vec::new(),
            order: None,
            limit: None,
        }
    }

    pub fn eq(mut self, column: &str, value: &str) -> Self {
        self.filters.push(Filter::eq(column, value));
        self
    }

    pub fn order(mut self, column: &str, ascending: bool) -> Self {
        self.order = Some(Order {
            column: column.to_string(),
            ascending,
        });
        self
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }
}

/// The hosted backend-as-a-service: tables, RPC, object storage and auth.
#[async_trait]
pub trait Backend: Send + Sync {
    async fn select(&self, table: &str, query: &RowQuery) -> Result<Vec<Value>>;
    async fn insert(&self, table: &str, row: Value) -> Result<()>;
    async fn upsert(&self, table: &str, row: Value, on_conflict: &str) -> Result<()>;
    async fn delete(&self, table: &str, filters: &[Filter]) -> Result<()>;
    async fn rpc(&self, function: &str, args: Value) -> Result<Value>;

    async fn upload_object(
        &self,
        bucket: &str,
        path: &str,
        bytes: Vec<u8>,
        content_type: &str,
    ) -> Result<()>;
    async fn remove_objects(&self, bucket: &str, paths: &[String]) -> Result<()>;
    fn public_url(&self, bucket: &str, path: &str) -> String;

    async fn sign_up(&self, email: &str, password: &str, metadata: Value) -> Result<AuthResponse>;
    async fn sign_in_with_password(&self, email: &str, password: &str) -> Result<AuthResponse>;
    async fn sign_out(&self) -> Result<()>;
    async fn get_session(&self) -> Result<Option<Session>>;
    async fn get_user(&self) -> Result<Option<User>>;

    fn auth_events(&self) -> broadcast::Receiver<AuthEvent>;
}

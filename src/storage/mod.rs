// Persistence layer. Agent rows and the externally-owned api_keys table
// sit behind one trait so tests run against the in-memory backend while
// deployments use Postgres.

mod memory;
mod postgres;

use crate::config::Config;
use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::sync::Arc;
use tracing::warn;

pub use memory::MemoryStorage;
pub use postgres::PostgresStorage;

#[derive(Debug, Clone)]
pub struct AgentRecord {
    pub user_id: i64,
    pub agent_id: String,
    pub agent_name: String,
    pub api_key: String,
    pub endpoint_url_run: Option<String>,
    pub status: String,
    pub last_connected_at: Option<DateTime<Utc>>,
    pub last_disconnected_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct UpsertAgentParams {
    pub user_id: i64,
    pub agent_id: String,
    pub agent_name: String,
    pub api_key: String,
    pub endpoint_url_run: Option<String>,
}

/// Which timestamp a status change should touch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusTouch {
    None,
    Connected,
    Disconnected,
}

#[derive(Debug, Clone)]
pub struct ApiKeyRecord {
    pub user_id: i64,
    pub access_token: String,
    pub is_active: bool,
    pub updated_at: DateTime<Utc>,
}

#[async_trait]
pub trait Storage: Send + Sync {
    async fn ensure_initialized(&self) -> Result<()>;

    /// Insert a new agent row (status `awaiting_qr`) or refresh an
    /// existing one. On update: name and key always, endpoint only when
    /// the stored value is still null; `user_id` and `created_at` never
    /// change.
    async fn upsert_agent(&self, params: &UpsertAgentParams) -> Result<AgentRecord>;

    async fn get_agent(&self, agent_id: &str) -> Result<Option<AgentRecord>>;

    async fn set_status(&self, agent_id: &str, status: &str, touch: StatusTouch) -> Result<()>;

    /// Rows worth re-ensuring at startup.
    async fn list_bootstrappable(&self) -> Result<Vec<AgentRecord>>;

    async fn latest_active_api_key(&self, user_id: i64) -> Result<Option<ApiKeyRecord>>;

    /// Copy the latest active key for the user into the agent row.
    async fn sync_api_key(&self, user_id: i64, agent_id: &str) -> Result<()>;

    /// Returns whether a row existed.
    async fn delete_agent(&self, agent_id: &str) -> Result<bool>;
}

/// Pick a backend from configuration. An empty DB_URL keeps everything
/// in memory, which is enough for development and tests.
pub fn build_storage(config: &Config) -> Result<Arc<dyn Storage>> {
    let dsn = config.db_url.trim();
    if dsn.is_empty() {
        warn!("DB_URL not set, using in-memory storage (agent rows will not survive restarts)");
        return Ok(Arc::new(MemoryStorage::new()));
    }
    Ok(Arc::new(PostgresStorage::new(dsn)?))
}

// Postgres backend over a deadpool connection pool. Schema bootstrap is
// idempotent; api_keys is externally owned, we only create it so a fresh
// database boots.
use super::{AgentRecord, ApiKeyRecord, Storage, StatusTouch, UpsertAgentParams};
use anyhow::{anyhow, Result};
use async_trait::async_trait;
use deadpool_postgres::{Manager, ManagerConfig, Pool, RecyclingMethod};
use std::time::Duration;
use tokio_postgres::{NoTls, Row};

const POOL_SIZE: usize = 16;
const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS agents (
    user_id BIGINT NOT NULL,
    agent_id TEXT NOT NULL,
    agent_name TEXT NOT NULL,
    api_key TEXT NOT NULL,
    endpoint_url_run TEXT,
    status TEXT NOT NULL DEFAULT 'awaiting_qr',
    last_connected_at TIMESTAMPTZ,
    last_disconnected_at TIMESTAMPTZ,
    created_at TIMESTAMPTZ NOT NULL DEFAULT now(),
    updated_at TIMESTAMPTZ NOT NULL DEFAULT now(),
    PRIMARY KEY (user_id, agent_id)
);
CREATE UNIQUE INDEX IF NOT EXISTS agents_agent_id_key ON agents (agent_id);
CREATE TABLE IF NOT EXISTS api_keys (
    user_id BIGINT NOT NULL,
    access_token TEXT NOT NULL,
    is_active BOOLEAN NOT NULL DEFAULT TRUE,
    updated_at TIMESTAMPTZ NOT NULL DEFAULT now()
);
CREATE INDEX IF NOT EXISTS api_keys_user_idx ON api_keys (user_id, updated_at DESC);
"#;

const AGENT_COLUMNS: &str = "user_id, agent_id, agent_name, api_key, endpoint_url_run, status, \
     last_connected_at, last_disconnected_at, created_at, updated_at";

pub struct PostgresStorage {
    pool: Pool,
}

impl PostgresStorage {
    pub fn new(dsn: &str) -> Result<Self> {
        let mut config = dsn
            .parse::<tokio_postgres::Config>()
            .map_err(|err| anyhow!("invalid DB_URL: {err}"))?;
        config.connect_timeout(CONNECT_TIMEOUT);
        let manager_config = ManagerConfig {
            recycling_method: RecyclingMethod::Fast,
        };
        let manager = Manager::from_config(config, NoTls, manager_config);
        let pool = Pool::builder(manager)
            .max_size(POOL_SIZE)
            .build()
            .map_err(|err| anyhow!("postgres pool build failed: {err}"))?;
        Ok(Self { pool })
    }

    async fn client(&self) -> Result<deadpool_postgres::Client> {
        Ok(self.pool.get().await?)
    }
}

fn row_to_agent(row: &Row) -> AgentRecord {
    AgentRecord {
        user_id: row.get("user_id"),
        agent_id: row.get("agent_id"),
        agent_name: row.get("agent_name"),
        api_key: row.get("api_key"),
        endpoint_url_run: row.get("endpoint_url_run"),
        status: row.get("status"),
        last_connected_at: row.get("last_connected_at"),
        last_disconnected_at: row.get("last_disconnected_at"),
        created_at: row.get("created_at"),
        updated_at: row.get("updated_at"),
    }
}

#[async_trait]
impl Storage for PostgresStorage {
    async fn ensure_initialized(&self) -> Result<()> {
        let client = self.client().await?;
        client.batch_execute(SCHEMA).await?;
        Ok(())
    }

    async fn upsert_agent(&self, params: &UpsertAgentParams) -> Result<AgentRecord> {
        let client = self.client().await?;
        let query = format!(
            "INSERT INTO agents (user_id, agent_id, agent_name, api_key, endpoint_url_run, status) \
             VALUES ($1, $2, $3, $4, $5, 'awaiting_qr') \
             ON CONFLICT (agent_id) DO UPDATE SET \
                 agent_name = EXCLUDED.agent_name, \
                 api_key = EXCLUDED.api_key, \
                 endpoint_url_run = COALESCE(agents.endpoint_url_run, EXCLUDED.endpoint_url_run), \
                 updated_at = now() \
             RETURNING {AGENT_COLUMNS}"
        );
        let row = client
            .query_one(
                &query,
                &[
                    &params.user_id,
                    &params.agent_id,
                    &params.agent_name,
                    &params.api_key,
                    &params.endpoint_url_run,
                ],
            )
            .await?;
        Ok(row_to_agent(&row))
    }

    async fn get_agent(&self, agent_id: &str) -> Result<Option<AgentRecord>> {
        let client = self.client().await?;
        let query = format!("SELECT {AGENT_COLUMNS} FROM agents WHERE agent_id = $1");
        let row = client.query_opt(&query, &[&agent_id]).await?;
        Ok(row.as_ref().map(row_to_agent))
    }

    async fn set_status(&self, agent_id: &str, status: &str, touch: StatusTouch) -> Result<()> {
        let client = self.client().await?;
        let touch_connected = touch == StatusTouch::Connected;
        let touch_disconnected = touch == StatusTouch::Disconnected;
        client
            .execute(
                "UPDATE agents SET \
                     status = $2, \
                     updated_at = now(), \
                     last_connected_at = CASE WHEN $3 THEN now() ELSE last_connected_at END, \
                     last_disconnected_at = CASE WHEN $4 THEN now() ELSE last_disconnected_at END \
                 WHERE agent_id = $1",
                &[&agent_id, &status, &touch_connected, &touch_disconnected],
            )
            .await?;
        Ok(())
    }

    async fn list_bootstrappable(&self) -> Result<Vec<AgentRecord>> {
        let client = self.client().await?;
        let query = format!(
            "SELECT {AGENT_COLUMNS} FROM agents \
             WHERE status IN ('connected', 'awaiting_qr', 'disconnected') \
             ORDER BY updated_at DESC"
        );
        let rows = client.query(&query, &[]).await?;
        Ok(rows.iter().map(row_to_agent).collect())
    }

    async fn latest_active_api_key(&self, user_id: i64) -> Result<Option<ApiKeyRecord>> {
        let client = self.client().await?;
        let row = client
            .query_opt(
                "SELECT user_id, access_token, is_active, updated_at FROM api_keys \
                 WHERE user_id = $1 AND is_active \
                 ORDER BY updated_at DESC LIMIT 1",
                &[&user_id],
            )
            .await?;
        Ok(row.map(|row| ApiKeyRecord {
            user_id: row.get("user_id"),
            access_token: row.get("access_token"),
            is_active: row.get("is_active"),
            updated_at: row.get("updated_at"),
        }))
    }

    async fn sync_api_key(&self, user_id: i64, agent_id: &str) -> Result<()> {
        let client = self.client().await?;
        client
            .execute(
                "UPDATE agents SET api_key = latest.access_token, updated_at = now() \
                 FROM (SELECT access_token FROM api_keys \
                       WHERE user_id = $1 AND is_active \
                       ORDER BY updated_at DESC LIMIT 1) AS latest \
                 WHERE agents.agent_id = $2",
                &[&user_id, &agent_id],
            )
            .await?;
        Ok(())
    }

    async fn delete_agent(&self, agent_id: &str) -> Result<bool> {
        let client = self.client().await?;
        let affected = client
            .execute("DELETE FROM agents WHERE agent_id = $1", &[&agent_id])
            .await?;
        Ok(affected > 0)
    }
}

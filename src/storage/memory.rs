// In-memory backend. Mirrors the Postgres semantics closely enough for
// the supervisor tests: upsert keeps user_id/created_at, endpoint only
// fills when null, statuses touch the matching timestamp.
use super::{AgentRecord, ApiKeyRecord, Storage, StatusTouch, UpsertAgentParams};
use anyhow::Result;
use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;
use std::collections::HashMap;

#[derive(Default)]
pub struct MemoryStorage {
    agents: Mutex<HashMap<String, AgentRecord>>,
    api_keys: Mutex<Vec<ApiKeyRecord>>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    /// Test hook: seed an api_keys row the way the external issuer would.
    pub fn insert_api_key(&self, user_id: i64, access_token: &str, is_active: bool) {
        self.api_keys.lock().push(ApiKeyRecord {
            user_id,
            access_token: access_token.to_string(),
            is_active,
            updated_at: Utc::now(),
        });
    }
}

#[async_trait]
impl Storage for MemoryStorage {
    async fn ensure_initialized(&self) -> Result<()> {
        Ok(())
    }

    async fn upsert_agent(&self, params: &UpsertAgentParams) -> Result<AgentRecord> {
        let now = Utc::now();
        let mut agents = self.agents.lock();
        let record = agents
            .entry(params.agent_id.clone())
            .and_modify(|existing| {
                existing.agent_name = params.agent_name.clone();
                existing.api_key = params.api_key.clone();
                if existing.endpoint_url_run.is_none() {
                    existing.endpoint_url_run = params.endpoint_url_run.clone();
                }
                existing.updated_at = now;
            })
            .or_insert_with(|| AgentRecord {
                user_id: params.user_id,
                agent_id: params.agent_id.clone(),
                agent_name: params.agent_name.clone(),
                api_key: params.api_key.clone(),
                endpoint_url_run: params.endpoint_url_run.clone(),
                status: "awaiting_qr".to_string(),
                last_connected_at: None,
                last_disconnected_at: None,
                created_at: now,
                updated_at: now,
            });
        Ok(record.clone())
    }

    async fn get_agent(&self, agent_id: &str) -> Result<Option<AgentRecord>> {
        Ok(self.agents.lock().get(agent_id).cloned())
    }

    async fn set_status(&self, agent_id: &str, status: &str, touch: StatusTouch) -> Result<()> {
        let now = Utc::now();
        if let Some(record) = self.agents.lock().get_mut(agent_id) {
            record.status = status.to_string();
            record.updated_at = now;
            match touch {
                StatusTouch::Connected => record.last_connected_at = Some(now),
                StatusTouch::Disconnected => record.last_disconnected_at = Some(now),
                StatusTouch::None => {}
            }
        }
        Ok(())
    }

    async fn list_bootstrappable(&self) -> Result<Vec<AgentRecord>> {
        Ok(self
            .agents
            .lock()
            .values()
            .filter(|record| {
                matches!(
                    record.status.as_str(),
                    "connected" | "awaiting_qr" | "disconnected"
                )
            })
            .cloned()
            .collect())
    }

    async fn latest_active_api_key(&self, user_id: i64) -> Result<Option<ApiKeyRecord>> {
        Ok(self
            .api_keys
            .lock()
            .iter()
            .filter(|key| key.user_id == user_id && key.is_active)
            .max_by_key(|key| key.updated_at)
            .cloned())
    }

    async fn sync_api_key(&self, user_id: i64, agent_id: &str) -> Result<()> {
        let latest = self.latest_active_api_key(user_id).await?;
        if let Some(key) = latest {
            if let Some(record) = self.agents.lock().get_mut(agent_id) {
                record.api_key = key.access_token;
                record.updated_at = Utc::now();
            }
        }
        Ok(())
    }

    async fn delete_agent(&self, agent_id: &str) -> Result<bool> {
        Ok(self.agents.lock().remove(agent_id).is_some())
    }
}

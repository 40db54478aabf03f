// AI backend proxy. One operation: POST the run payload to the agent's
// endpoint and pull a reply string out of whatever shape comes back.
use crate::error::{coded, ErrorCode};
use crate::metrics;
use crate::storage::AgentRecord;
use anyhow::Result;
use serde_json::Value;
use std::time::{Duration, Instant};

pub const AI_DEADLINE: Duration = Duration::from_secs(60);

#[derive(Debug, Clone)]
pub struct RunOutcome {
    pub reply: Option<String>,
    pub raw: Value,
}

pub struct AiProxy {
    http: reqwest::Client,
    base_url: String,
}

impl AiProxy {
    pub fn new(http: reqwest::Client, base_url: impl Into<String>) -> Self {
        Self {
            http,
            base_url: base_url.into(),
        }
    }

    pub fn resolve_endpoint(&self, record: &AgentRecord) -> String {
        record
            .endpoint_url_run
            .as_deref()
            .map(str::trim)
            .filter(|value| !value.is_empty())
            .map(|value| value.to_string())
            .unwrap_or_else(|| default_endpoint(&self.base_url, &record.agent_id))
    }

    pub async fn execute_run(
        &self,
        record: &AgentRecord,
        payload: &Value,
        trace_id: &str,
    ) -> Result<RunOutcome> {
        let endpoint = self.resolve_endpoint(record);
        let agent_id = record.agent_id.as_str();
        let started = Instant::now();

        let response = self
            .http
            .post(&endpoint)
            .bearer_auth(&record.api_key)
            .header("x-trace-id", trace_id)
            .timeout(AI_DEADLINE)
            .json(payload)
            .send()
            .await;
        let response = match response {
            Ok(response) => response,
            Err(err) if err.is_timeout() => {
                metrics::record_error(agent_id, ErrorCode::AiTimeout.as_str());
                return Err(coded(
                    ErrorCode::AiTimeout,
                    format!("AI call exceeded {}s deadline", AI_DEADLINE.as_secs()),
                ));
            }
            Err(err) => {
                metrics::record_error(agent_id, ErrorCode::AiDownstreamError.as_str());
                return Err(coded(
                    ErrorCode::AiDownstreamError,
                    format!("AI call failed: {err}"),
                ));
            }
        };

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            metrics::record_error(agent_id, ErrorCode::AiDownstreamError.as_str());
            return Err(coded(
                ErrorCode::AiDownstreamError,
                format!("AI backend returned {status}: {body}"),
            ));
        }

        let raw: Value = match response.json().await {
            Ok(value) => value,
            Err(err) if err.is_timeout() => {
                metrics::record_error(agent_id, ErrorCode::AiTimeout.as_str());
                return Err(coded(
                    ErrorCode::AiTimeout,
                    format!("AI call exceeded {}s deadline", AI_DEADLINE.as_secs()),
                ));
            }
            Err(err) => {
                metrics::record_error(agent_id, ErrorCode::AiDownstreamError.as_str());
                return Err(coded(
                    ErrorCode::AiDownstreamError,
                    format!("AI response decode failed: {err}"),
                ));
            }
        };

        metrics::ai_latency_for(agent_id).observe(started.elapsed().as_secs_f64());
        Ok(RunOutcome {
            reply: extract_reply(&raw),
            raw,
        })
    }
}

/// Default per-agent run endpoint derived from the backend base URL.
pub fn default_endpoint(base_url: &str, agent_id: &str) -> String {
    let base = base_url.trim().trim_end_matches('/');
    if base.ends_with("/agents") {
        format!("{base}/{agent_id}/execute")
    } else {
        format!("{base}/agents/{agent_id}/execute")
    }
}

/// Probe the known reply fields in order; the first non-empty trimmed
/// string wins.
pub fn extract_reply(data: &Value) -> Option<String> {
    const PROBES: &[&[&str]] = &[
        &["reply"],
        &["response"],
        &["result", "reply"],
        &["result", "response"],
        &["output"],
    ];
    for path in PROBES {
        let mut node = data;
        for key in *path {
            match node.get(key) {
                Some(next) => node = next,
                None => {
                    node = &Value::Null;
                    break;
                }
            }
        }
        if let Some(text) = node.as_str() {
            let trimmed = text.trim();
            if !trimmed.is_empty() {
                return Some(trimmed.to_string());
            }
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use serde_json::json;

    fn record(endpoint: Option<&str>) -> AgentRecord {
        let now = Utc::now();
        AgentRecord {
            user_id: 1,
            agent_id: "a1".to_string(),
            agent_name: "Agent".to_string(),
            api_key: "k1".to_string(),
            endpoint_url_run: endpoint.map(|value| value.to_string()),
            status: "connected".to_string(),
            last_connected_at: None,
            last_disconnected_at: None,
            created_at: now,
            updated_at: now,
        }
    }

    #[test]
    fn default_endpoint_appends_agents_segment() {
        assert_eq!(
            default_endpoint("http://ai.local", "a1"),
            "http://ai.local/agents/a1/execute"
        );
        assert_eq!(
            default_endpoint("http://ai.local///", "a1"),
            "http://ai.local/agents/a1/execute"
        );
        assert_eq!(
            default_endpoint("http://ai.local/agents", "a1"),
            "http://ai.local/agents/a1/execute"
        );
    }

    #[test]
    fn per_agent_override_wins() {
        let proxy = AiProxy::new(reqwest::Client::new(), "http://ai.local");
        assert_eq!(
            proxy.resolve_endpoint(&record(Some("http://custom/run"))),
            "http://custom/run"
        );
        assert_eq!(
            proxy.resolve_endpoint(&record(None)),
            "http://ai.local/agents/a1/execute"
        );
        assert_eq!(
            proxy.resolve_endpoint(&record(Some("   "))),
            "http://ai.local/agents/a1/execute"
        );
    }

    #[test]
    fn reply_probes_in_documented_order() {
        assert_eq!(
            extract_reply(&json!({ "reply": "first", "response": "second" })),
            Some("first".to_string())
        );
        assert_eq!(
            extract_reply(&json!({ "response": "  padded  " })),
            Some("padded".to_string())
        );
        assert_eq!(
            extract_reply(&json!({ "result": { "reply": "nested" } })),
            Some("nested".to_string())
        );
        assert_eq!(
            extract_reply(&json!({ "result": { "response": "deep" } })),
            Some("deep".to_string())
        );
        assert_eq!(
            extract_reply(&json!({ "output": "tail" })),
            Some("tail".to_string())
        );
    }

    #[test]
    fn empty_and_missing_replies_are_none() {
        assert_eq!(extract_reply(&json!({ "reply": "   " })), None);
        assert_eq!(extract_reply(&json!({ "reply": 42 })), None);
        assert_eq!(extract_reply(&json!({})), None);
        // An empty probe falls through to the next one.
        assert_eq!(
            extract_reply(&json!({ "reply": "", "output": "fallback" })),
            Some("fallback".to_string())
        );
    }
}

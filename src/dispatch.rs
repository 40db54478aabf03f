// Inbound dispatch pipeline: filter -> rate-limited AI call -> reply.
// AI failures never reach the human sender; they fan out to the
// developer JID instead.
use crate::ai::AiProxy;
use crate::client::{ChatClient, InboundMessage};
use crate::jid::jid_digits;
use crate::metrics;
use crate::scheduler::RateScheduler;
use crate::storage::AgentRecord;
use anyhow::Result;
use chrono::Utc;
use serde_json::{json, Value};
use std::sync::Arc;
use tracing::{debug, warn};
use uuid::Uuid;

/// Everything the pipeline needs from the live session at event time.
pub struct InboundContext {
    pub client: Arc<dyn ChatClient>,
    pub record: AgentRecord,
    pub bot_jid: Option<String>,
}

pub struct Dispatcher {
    ai: Arc<AiProxy>,
    scheduler: Arc<RateScheduler>,
    developer_jid: String,
}

impl Dispatcher {
    pub fn new(ai: Arc<AiProxy>, scheduler: Arc<RateScheduler>, developer_jid: String) -> Self {
        Self {
            ai,
            scheduler,
            developer_jid,
        }
    }

    /// Submit the message's AI job onto the agent queue. The push itself
    /// is synchronous so inbound order equals send order; waiting for
    /// the result (and the failure fallback) happens off the event pump.
    pub async fn handle(&self, ctx: InboundContext, message: InboundMessage) {
        if !should_process(&message, ctx.bot_jid.as_deref()) {
            debug!(
                agent_id = %ctx.record.agent_id,
                from = %message.from,
                "inbound message filtered"
            );
            return;
        }

        let agent_id = ctx.record.agent_id.clone();
        metrics::MESSAGES_RECEIVED.with_label_values(&[&agent_id]).inc();

        let trace_id = format!("run_{}", Uuid::new_v4().simple());
        let payload = build_run_payload(&message);
        let submitted = {
            let client = ctx.client.clone();
            let record = ctx.record.clone();
            let ai = self.ai.clone();
            let from = message.from.clone();
            let trace_id = trace_id.clone();
            let agent_label = agent_id.clone();
            self.scheduler.submit(&agent_id, move || async move {
                run_and_reply(client, record, ai, from, payload, trace_id, agent_label).await
            })
        };

        let outcome = Outcome {
            scheduler: self.scheduler.clone(),
            developer_jid: self.developer_jid.clone(),
            ctx,
            message,
            trace_id,
        };
        match submitted {
            Ok(rx) => {
                tokio::spawn(async move {
                    match rx.await {
                        Ok(Ok(_)) => {}
                        Ok(Err(err)) => outcome.notify_developer(&err).await,
                        Err(_) => {
                            warn!(
                                agent_id = %outcome.ctx.record.agent_id,
                                "inbound AI job was dropped"
                            );
                        }
                    }
                });
            }
            Err(err) => outcome.notify_developer(&err).await,
        }
    }
}

struct Outcome {
    scheduler: Arc<RateScheduler>,
    developer_jid: String,
    ctx: InboundContext,
    message: InboundMessage,
    trace_id: String,
}

impl Outcome {
    /// Developer fallback goes through the same agent queue so it cannot
    /// jump ahead of in-flight sends. The human sender never hears about
    /// the failure.
    async fn notify_developer(&self, err: &anyhow::Error) {
        warn!(
            agent_id = %self.ctx.record.agent_id,
            from = %self.message.from,
            trace_id = %self.trace_id,
            "inbound AI call failed: {err:#}"
        );
        let text = format!(
            "AI run failed\nagent: {}\nfrom: {}\nreason: {err:#}\ntrace: {}\nmessage: {}\ntime: {}",
            self.ctx.record.agent_id,
            self.message.from,
            self.trace_id,
            self.message.body,
            Utc::now().to_rfc3339(),
        );
        let client = self.ctx.client.clone();
        let developer_jid = self.developer_jid.clone();
        let delivered = self
            .scheduler
            .enqueue(&self.ctx.record.agent_id, move || async move {
                client.send_message(&developer_jid, &text, None).await?;
                Ok(Value::Null)
            })
            .await;
        if let Err(err) = delivered {
            warn!(
                agent_id = %self.ctx.record.agent_id,
                "developer notification failed: {err:#}"
            );
        }
    }
}

async fn run_and_reply(
    client: Arc<dyn ChatClient>,
    record: AgentRecord,
    ai: Arc<AiProxy>,
    from: String,
    payload: Value,
    trace_id: String,
    agent_id: String,
) -> Result<Value> {
    // Typing indicator brackets the AI call; clearing it is advisory on
    // both the success and the failure path.
    let _ = client.send_typing(&from, true).await;
    let outcome = ai.execute_run(&record, &payload, &trace_id).await;
    let _ = client.send_typing(&from, false).await;

    let outcome = outcome?;
    if let Some(reply) = outcome.reply {
        client.send_message(&from, &reply, None).await?;
        metrics::MESSAGES_SENT.with_label_values(&[&agent_id]).inc();
    }
    Ok(Value::Null)
}

/// Filtering plus group gating. Group chats only pass when the bot is
/// mentioned, either properly or by its digits appearing in the body.
pub fn should_process(message: &InboundMessage, bot_jid: Option<&str>) -> bool {
    if message.from_me {
        return false;
    }
    if message.is_status || message.from == "status@broadcast" {
        return false;
    }
    if message.is_channel || message.from.ends_with("@newsletter") {
        return false;
    }
    if message.message_type != "chat" {
        return false;
    }
    if message.is_group() {
        let Some(bot_jid) = bot_jid else {
            return false;
        };
        if message.mentioned_ids.iter().any(|id| id == bot_jid) {
            return true;
        }
        let bot_digits = jid_digits(bot_jid);
        if bot_digits.is_empty() {
            return false;
        }
        let body_digits: String = message
            .body
            .chars()
            .filter(|c| c.is_ascii_digit())
            .collect();
        return body_digits.contains(&bot_digits);
    }
    true
}

pub fn build_run_payload(message: &InboundMessage) -> Value {
    json!({
        "input": message.body,
        "parameters": {
            "max_steps": 5,
            "metadata": {
                "whatsapp_name": message.notify_name,
                "chat_name": message.chat_name,
            },
        },
        "session_id": message.from,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn chat_message(from: &str, body: &str) -> InboundMessage {
        InboundMessage {
            id: "m1".to_string(),
            from: from.to_string(),
            body: body.to_string(),
            message_type: "chat".to_string(),
            ..Default::default()
        }
    }

    #[test]
    fn direct_chat_messages_pass() {
        assert!(should_process(&chat_message("628123@c.us", "hi"), None));
    }

    #[test]
    fn own_status_and_channel_traffic_is_dropped() {
        let mut own = chat_message("628123@c.us", "hi");
        own.from_me = true;
        assert!(!should_process(&own, None));

        assert!(!should_process(&chat_message("status@broadcast", "hi"), None));

        let mut channel = chat_message("123@newsletter", "hi");
        assert!(!should_process(&channel, None));
        channel.from = "628123@c.us".to_string();
        channel.is_channel = true;
        assert!(!should_process(&channel, None));

        let mut media = chat_message("628123@c.us", "hi");
        media.message_type = "image".to_string();
        assert!(!should_process(&media, None));
    }

    #[test]
    fn group_requires_mention_or_digits() {
        let bot = Some("628111@c.us");

        let plain = chat_message("g1@g.us", "hi");
        assert!(!should_process(&plain, bot));

        let mut mentioned = chat_message("g1@g.us", "hi");
        mentioned.mentioned_ids = vec!["628111@c.us".to_string()];
        assert!(should_process(&mentioned, bot));

        let digits = chat_message("g1@g.us", "hi @628111");
        assert!(should_process(&digits, bot));

        // Fuzzy: the bot number buried in arbitrary digits still matches.
        let buried = chat_message("g1@g.us", "order 9962811105");
        assert!(should_process(&buried, bot));

        assert!(!should_process(&chat_message("g1@g.us", "hi"), None));
    }

    #[test]
    fn run_payload_shape() {
        let mut message = chat_message("628123@c.us", "hello there");
        message.notify_name = Some("Dina".to_string());
        message.chat_name = Some("Dina W".to_string());
        let payload = build_run_payload(&message);
        assert_eq!(payload["input"], "hello there");
        assert_eq!(payload["parameters"]["max_steps"], 5);
        assert_eq!(payload["parameters"]["metadata"]["whatsapp_name"], "Dina");
        assert_eq!(payload["session_id"], "628123@c.us");
    }
}

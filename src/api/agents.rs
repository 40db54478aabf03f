// Bearer-authenticated agent endpoints: AI runs and out-of-band sends.
// Authentication happens in the auth middleware before these handlers
// run.
use crate::api::errors::{error_response, from_error, new_trace_id};
use crate::error::ErrorCode;
use crate::media::MediaRequest;
use crate::state::AppState;
use axum::extract::{Path, State};
use axum::response::Response;
use axum::routing::post;
use axum::{Json, Router};
use serde::Deserialize;
use serde_json::{json, Map, Value};
use std::sync::Arc;
use tracing::warn;

pub fn router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/agents/{agent_id}/run", post(run_agent))
        .route("/agents/{agent_id}/messages", post(send_message))
        .route("/agents/{agent_id}/media", post(send_media))
}

#[derive(Debug, Deserialize)]
struct RunBody {
    input: Option<String>,
    message: Option<String>,
    #[serde(alias = "sessionId")]
    session_id: Option<String>,
    parameters: Option<Value>,
}

async fn run_agent(
    State(state): State<Arc<AppState>>,
    Path(agent_id): Path<String>,
    Json(body): Json<RunBody>,
) -> Result<Json<Value>, Response> {
    let input = body
        .input
        .or(body.message)
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
        .ok_or_else(|| error_response(ErrorCode::InvalidPayload, "input is required"))?;

    let record = state
        .storage
        .get_agent(&agent_id)
        .await
        .map_err(|err| from_error(&err))?
        .ok_or_else(|| {
            error_response(
                ErrorCode::SessionNotFound,
                format!("no session record for agent {agent_id}"),
            )
        })?;

    let mut payload = Map::new();
    payload.insert("input".to_string(), Value::String(input));
    payload.insert(
        "parameters".to_string(),
        body.parameters.clone().unwrap_or_else(|| json!({})),
    );
    if let Some(session_id) = body.session_id.as_deref() {
        payload.insert(
            "session_id".to_string(),
            Value::String(session_id.to_string()),
        );
    }

    let trace_id = new_trace_id("run");
    let outcome = state
        .ai
        .execute_run(&record, &Value::Object(payload), &trace_id)
        .await
        .map_err(|err| from_error(&err))?;

    // Reply delivery back over the chat network is best-effort; the HTTP
    // caller still gets the reply either way.
    let mut reply_sent = false;
    if let (Some(reply), Some(session_id)) = (outcome.reply.as_deref(), body.session_id.as_deref())
    {
        match state
            .supervisor
            .send_text(&agent_id, session_id, reply, None)
            .await
        {
            Ok(_) => reply_sent = true,
            Err(err) => {
                warn!(agent_id = %agent_id, "run reply delivery failed: {err:#}");
            }
        }
    }

    Ok(Json(json!({
        "reply": outcome.reply,
        "replySent": reply_sent,
    })))
}

#[derive(Debug, Deserialize)]
struct SendMessageBody {
    to: Option<String>,
    message: Option<String>,
    #[serde(alias = "quotedMessageId")]
    quoted_message_id: Option<String>,
}

async fn send_message(
    State(state): State<Arc<AppState>>,
    Path(agent_id): Path<String>,
    Json(body): Json<SendMessageBody>,
) -> Result<Json<Value>, Response> {
    let to = require_field(body.to.as_deref(), "to")?;
    let message = require_field(body.message.as_deref(), "message")?;
    let delivered = state
        .supervisor
        .send_text(&agent_id, to, message, body.quoted_message_id.clone())
        .await
        .map_err(|err| from_error(&err))?;
    Ok(Json(delivered))
}

#[derive(Debug, Deserialize)]
struct SendMediaBody {
    to: Option<String>,
    caption: Option<String>,
    #[serde(flatten)]
    media: MediaRequest,
}

async fn send_media(
    State(state): State<Arc<AppState>>,
    Path(agent_id): Path<String>,
    Json(body): Json<SendMediaBody>,
) -> Result<Json<Value>, Response> {
    let to = require_field(body.to.as_deref(), "to")?;
    let prepared = state
        .media
        .prepare(body.media)
        .await
        .map_err(|err| from_error(&err))?;
    let mut delivered = state
        .supervisor
        .send_media(&agent_id, to, prepared.handle, body.caption.clone())
        .await
        .map_err(|err| from_error(&err))?;
    if let (Some(path), Some(map)) = (prepared.preview_path, delivered.as_object_mut()) {
        map.insert(
            "previewPath".to_string(),
            Value::String(path.to_string_lossy().into_owned()),
        );
    }
    Ok(Json(delivered))
}

fn require_field<'a>(value: Option<&'a str>, name: &str) -> Result<&'a str, Response> {
    value
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .ok_or_else(|| {
            error_response(ErrorCode::InvalidPayload, format!("{name} is required"))
        })
}

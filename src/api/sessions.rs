// Session lifecycle endpoints.
use crate::api::errors::{error_response, from_error, new_trace_id};
use crate::error::ErrorCode;
use crate::state::AppState;
use axum::extract::{Path, State};
use axum::response::Response;
use axum::routing::{delete, get, post};
use axum::{Json, Router};
use serde::Deserialize;
use serde_json::{json, Value};
use std::sync::Arc;

pub fn router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/sessions", post(create_session))
        .route("/sessions/{agent_id}", get(get_session))
        .route("/sessions/{agent_id}", delete(delete_session))
        .route("/sessions/{agent_id}/reconnect", post(reconnect_session))
        .route("/sessions/{agent_id}/qr", post(generate_qr))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CreateSessionBody {
    user_id: Option<i64>,
    agent_id: Option<String>,
    agent_name: Option<String>,
    #[serde(alias = "apikey")]
    api_key: Option<String>,
}

async fn create_session(
    State(state): State<Arc<AppState>>,
    Json(body): Json<CreateSessionBody>,
) -> Result<Json<Value>, Response> {
    let user_id = body
        .user_id
        .ok_or_else(|| error_response(ErrorCode::InvalidPayload, "userId is required"))?;
    let agent_id = require_field(body.agent_id.as_deref(), "agentId")?;
    let agent_name = require_field(body.agent_name.as_deref(), "agentName")?;

    let view = state
        .supervisor
        .create_or_resume(user_id, agent_id, agent_name, body.api_key.as_deref())
        .await
        .map_err(|err| from_error(&err))?;
    Ok(Json(json!({
        "data": view,
        "traceId": new_trace_id("req"),
    })))
}

async fn get_session(
    State(state): State<Arc<AppState>>,
    Path(agent_id): Path<String>,
) -> Result<Json<Value>, Response> {
    let view = state
        .supervisor
        .get_status(&agent_id)
        .await
        .map_err(|err| from_error(&err))?;
    Ok(Json(json!(view)))
}

async fn delete_session(
    State(state): State<Arc<AppState>>,
    Path(agent_id): Path<String>,
) -> Result<Json<Value>, Response> {
    let outcome = state
        .supervisor
        .delete(&agent_id)
        .await
        .map_err(|err| from_error(&err))?;
    Ok(Json(json!(outcome)))
}

async fn reconnect_session(
    State(state): State<Arc<AppState>>,
    Path(agent_id): Path<String>,
) -> Result<Json<Value>, Response> {
    let view = state
        .supervisor
        .reconnect(&agent_id)
        .await
        .map_err(|err| from_error(&err))?;
    Ok(Json(json!(view)))
}

async fn generate_qr(
    State(state): State<Arc<AppState>>,
    Path(agent_id): Path<String>,
) -> Result<Json<Value>, Response> {
    let view = state
        .supervisor
        .generate_qr(&agent_id)
        .await
        .map_err(|err| from_error(&err))?;
    Ok(Json(json!(view)))
}

fn require_field<'a>(value: Option<&'a str>, name: &str) -> Result<&'a str, Response> {
    value
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .ok_or_else(|| {
            error_response(ErrorCode::InvalidPayload, format!("{name} is required"))
        })
}

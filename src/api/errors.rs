// Unified HTTP error shaping: every non-2xx body carries a stable code,
// a message and a trace id, with the trace id mirrored in a header.
use crate::error::{code_of, ErrorCode};
use axum::http::header::{HeaderName, HeaderValue};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;
use uuid::Uuid;

pub(crate) const TRACE_HEADER: &str = "x-trace-id";

pub fn new_trace_id(prefix: &str) -> String {
    format!("{prefix}_{}", Uuid::new_v4().simple())
}

pub fn error_response(code: ErrorCode, message: impl Into<String>) -> Response {
    let message = message.into();
    let trace_id = new_trace_id("err");
    let status =
        StatusCode::from_u16(code.http_status()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    let payload = json!({
        "error": {
            "code": code.as_str(),
            "message": message,
            "traceId": trace_id,
        }
    });
    let mut response = (status, Json(payload)).into_response();
    if let Ok(value) = HeaderValue::from_str(&trace_id) {
        response
            .headers_mut()
            .insert(HeaderName::from_static(TRACE_HEADER), value);
    }
    response
}

/// Translate a failure bubbling out of the core. Uncoded errors collapse
/// to the generic 502 wrap.
pub fn from_error(err: &anyhow::Error) -> Response {
    error_response(code_of(err), format!("{err:#}"))
}

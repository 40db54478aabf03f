// Bearer authentication for the /agents surface. A mismatched token is
// rejected but also schedules a background key sync, so a freshly
// rotated key heals the row without blocking the request path.
use crate::api::errors::{error_response, from_error};
use crate::error::ErrorCode;
use crate::state::AppState;
use axum::body::Body;
use axum::http::header::AUTHORIZATION;
use axum::http::{HeaderMap, Method, Request, StatusCode};
use axum::middleware::Next;
use axum::response::Response;
use std::sync::Arc;
use tracing::warn;

pub async fn bearer_guard(
    axum::extract::State(state): axum::extract::State<Arc<AppState>>,
    request: Request<Body>,
    next: Next,
) -> Result<Response, StatusCode> {
    if request.method() == Method::OPTIONS {
        return Ok(next.run(request).await);
    }
    let Some(agent_id) = protected_agent_id(request.uri().path()) else {
        return Ok(next.run(request).await);
    };

    let Some(provided) = extract_bearer_token(request.headers()) else {
        return Ok(error_response(
            ErrorCode::Unauthorized,
            "missing bearer token",
        ));
    };

    let record = match state.storage.get_agent(&agent_id).await {
        Ok(Some(record)) => record,
        Ok(None) => {
            return Ok(error_response(
                ErrorCode::SessionNotFound,
                format!("no session record for agent {agent_id}"),
            ));
        }
        Err(err) => return Ok(from_error(&err)),
    };

    if record.api_key == provided {
        return Ok(next.run(request).await);
    }

    let storage = state.storage.clone();
    let user_id = record.user_id;
    tokio::spawn(async move {
        if let Err(err) = storage.sync_api_key(user_id, &agent_id).await {
            warn!(agent_id = %agent_id, "api key sync failed: {err:#}");
        }
    });
    Ok(error_response(
        ErrorCode::Unauthorized,
        "bearer token mismatch",
    ))
}

/// The agent id for paths under the authenticated surface, None for
/// everything else.
pub fn protected_agent_id(path: &str) -> Option<String> {
    let rest = path.strip_prefix("/agents/")?;
    let agent_id = rest.split('/').next().unwrap_or_default();
    if agent_id.is_empty() {
        return None;
    }
    Some(agent_id.to_string())
}

/// Pull the token out of an `Authorization: Bearer <token>` header. The
/// scheme match is case-insensitive; anything with a different scheme,
/// no token, or trailing garbage is rejected.
pub fn extract_bearer_token(headers: &HeaderMap) -> Option<String> {
    let header = headers.get(AUTHORIZATION)?.to_str().ok()?;
    let mut parts = header.split_whitespace();
    let scheme = parts.next()?;
    let token = parts.next()?;
    if !scheme.eq_ignore_ascii_case("bearer") || parts.next().is_some() {
        return None;
    }
    Some(token.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    #[test]
    fn only_agent_paths_are_protected() {
        assert_eq!(
            protected_agent_id("/agents/a1/run"),
            Some("a1".to_string())
        );
        assert_eq!(
            protected_agent_id("/agents/a1/messages"),
            Some("a1".to_string())
        );
        assert_eq!(protected_agent_id("/agents/"), None);
        assert_eq!(protected_agent_id("/sessions"), None);
        assert_eq!(protected_agent_id("/health"), None);
    }

    #[test]
    fn bearer_extraction_tolerates_case_and_padding() {
        let mut headers = HeaderMap::new();
        headers.insert(AUTHORIZATION, HeaderValue::from_static("Bearer tok-1"));
        assert_eq!(extract_bearer_token(&headers), Some("tok-1".to_string()));

        headers.insert(AUTHORIZATION, HeaderValue::from_static("bearer  padded "));
        assert_eq!(extract_bearer_token(&headers), Some("padded".to_string()));

        headers.insert(AUTHORIZATION, HeaderValue::from_static("Basic dXNlcg=="));
        assert_eq!(extract_bearer_token(&headers), None);

        headers.insert(AUTHORIZATION, HeaderValue::from_static("Bearer "));
        assert_eq!(extract_bearer_token(&headers), None);

        headers.insert(AUTHORIZATION, HeaderValue::from_static("Bearer one two"));
        assert_eq!(extract_bearer_token(&headers), None);
    }
}

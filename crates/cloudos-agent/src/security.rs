use axum::{
    body::Body,
    extract::{Query, State},
    http::{HeaderMap, Request, Uri},
    middleware::Next,
    response::{IntoResponse, Response},
};

use crate::error_payload::ApiError;
use crate::http::AppState;

fn bearer_token(headers: &HeaderMap) -> Option<&str> {
    let raw = headers.get(axum::http::header::AUTHORIZATION)?.to_str().ok()?;
    let token = raw.trim().strip_prefix("Bearer ")?.trim();
    (!token.is_empty()).then_some(token)
}

#[derive(serde::Deserialize)]
struct TokenQuery {
    token: Option<String>,
}

// Browsers cannot attach headers to a WebSocket handshake, so `?token=` is accepted too.
fn query_token(uri: &Uri) -> Option<String> {
    let Query(q) = Query::<TokenQuery>::try_from_uri(uri).ok()?;
    q.token.filter(|v| !v.is_empty())
}

fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.iter().zip(b).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}

pub(crate) fn token_ok(expected: Option<&str>, headers: &HeaderMap, uri: &Uri) -> bool {
    let Some(expected) = expected else {
        return true;
    };
    bearer_token(headers)
        .map(str::to_owned)
        .or_else(|| query_token(uri))
        .is_some_and(|got| constant_time_eq(got.as_bytes(), expected.as_bytes()))
}

// Middleware: static bearer token for /os/*. Open when no token is configured.
pub async fn require_token(State(state): State<AppState>, req: Request<Body>, next: Next) -> Response {
    if !token_ok(state.api_token.as_deref(), req.headers(), req.uri()) {
        tracing::warn!(path = %req.uri().path(), "rejected request without valid token");
        return ApiError::unauthorized().into_response();
    }
    next.run(req).await
}

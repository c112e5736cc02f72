//! Cross-cutting HTTP middleware, applied as an explicit, fixed-order
//! layer stack in `web/mod.rs` rather than decorator/reflection stacking:
//! security headers → request tracing id → input sanitization → rate
//! limit → auth is composed there; this module holds each layer's
//! implementation.

use axum::body::{to_bytes, Body};
use axum::extract::{Request, State};
use axum::http::{HeaderValue, StatusCode};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tracing::Instrument;
use uuid::Uuid;

use crate::error::{render, AppError};
use crate::web::state::AppState;

/// Pull the tracing id stamped by `request_id` back out of a request's
/// extensions; empty if this layer somehow runs before that one.
fn request_id_of(request: &Request) -> String {
    request.extensions().get::<RequestId>().map(|id| id.0.clone()).unwrap_or_default()
}

tokio::task_local! {
    /// Mirrors the per-request `RequestId` extension for the rare call
    /// site that only has `AppError::into_response` to work with (the
    /// blanket `?`-propagated handler path, which never sees the
    /// `Request` itself to pull the extension from directly).
    pub static CURRENT_REQUEST_ID: String;
}

pub const MAX_FIELD_LEN: usize = 8 * 1024;
pub const MAX_JSON_DEPTH: usize = 16;
pub const REQUEST_DEADLINE: Duration = Duration::from_secs(10);

/// Conservative, self-audited denylist for a basic SQL-keyword-sequence
/// check on free-text fields. Matches are case-insensitive substrings;
/// this is a defense-in-depth layer, not a substitute for parameterized
/// queries (every query in this crate already is one).
const SQL_DENYLIST: &[&str] = &[
    "drop table",
    "drop database",
    "union select",
    "; delete from",
    "; insert into",
    "xp_cmdshell",
    "--",
];

pub async fn security_headers(request: Request, next: Next) -> Response {
    let mut response = next.run(request).await;
    let headers = response.headers_mut();
    headers.insert("x-content-type-options", HeaderValue::from_static("nosniff"));
    headers.insert("x-frame-options", HeaderValue::from_static("DENY"));
    headers.insert("referrer-policy", HeaderValue::from_static("no-referrer"));
    response
}

/// First layer: stamps a request id, attaches it to a tracing span that
/// wraps the rest of the chain, and echoes it back as a response header.
pub async fn request_id(mut request: Request, next: Next) -> Response {
    let request_id = Uuid::new_v4().to_string();
    request.extensions_mut().insert(RequestId(request_id.clone()));

    let span = tracing::info_span!("request", request_id = %request_id, path = %request.uri().path());
    let mut response = CURRENT_REQUEST_ID
        .scope(request_id.clone(), async { next.run(request).instrument(span).await })
        .await;
    if let Ok(value) = HeaderValue::from_str(&request_id) {
        response.headers_mut().insert("x-request-id", value);
    }
    response
}

#[derive(Debug, Clone)]
pub struct RequestId(pub String);

/// HTML-encodes `<`, `>`, `&` in string leaves and rejects payloads whose
/// JSON depth or per-field length exceed the configured limits, or that
/// match the SQL denylist. Runs before the handler, after tracing.
pub async fn input_sanitization(request: Request, next: Next) -> Response {
    let request_id = request_id_of(&request);
    let (parts, body) = request.into_parts();

    let method_has_body = matches!(parts.method.as_str(), "POST" | "PUT" | "PATCH");
    if !method_has_body {
        let request = Request::from_parts(parts, body);
        return next.run(request).await;
    }

    let bytes = match to_bytes(body, 1024 * 1024).await {
        Ok(bytes) => bytes,
        Err(_) => {
            return render(&AppError::Validation("request body too large".into()), parts.uri.path(), &request_id);
        }
    };

    if bytes.is_empty() {
        let request = Request::from_parts(parts, Body::from(bytes));
        return next.run(request).await;
    }

    let value: Value = match serde_json::from_slice(&bytes) {
        Ok(value) => value,
        Err(_) => {
            return render(&AppError::Validation("malformed JSON body".into()), parts.uri.path(), &request_id);
        }
    };

    if json_depth(&value) > MAX_JSON_DEPTH {
        return render(&AppError::Validation("JSON nesting too deep".into()), parts.uri.path(), &request_id);
    }

    if let Err(reason) = check_leaves(&value) {
        return render(&AppError::Validation(reason), parts.uri.path(), &request_id);
    }

    let sanitized = sanitize_strings(value);
    let sanitized_bytes = match serde_json::to_vec(&sanitized) {
        Ok(bytes) => bytes,
        Err(_) => {
            return render(
                &AppError::Internal(anyhow::anyhow!("re-serialization failed")),
                parts.uri.path(),
                &request_id,
            )
        }
    };

    let request = Request::from_parts(parts, Body::from(sanitized_bytes));
    next.run(request).await
}

fn json_depth(value: &Value) -> usize {
    match value {
        Value::Object(map) => 1 + map.values().map(json_depth).max().unwrap_or(0),
        Value::Array(items) => 1 + items.iter().map(json_depth).max().unwrap_or(0),
        _ => 0,
    }
}

fn check_leaves(value: &Value) -> Result<(), String> {
    match value {
        Value::String(s) => {
            if s.len() > MAX_FIELD_LEN {
                return Err("field exceeds maximum length".to_string());
            }
            let lower = s.to_ascii_lowercase();
            if SQL_DENYLIST.iter().any(|pattern| lower.contains(pattern)) {
                return Err("field contains a disallowed pattern".to_string());
            }
            Ok(())
        }
        Value::Object(map) => {
            for v in map.values() {
                check_leaves(v)?;
            }
            Ok(())
        }
        Value::Array(items) => {
            for v in items {
                check_leaves(v)?;
            }
            Ok(())
        }
        _ => Ok(()),
    }
}

fn sanitize_strings(value: Value) -> Value {
    match value {
        Value::String(s) => Value::String(html_encode(&s)),
        Value::Object(map) => {
            Value::Object(map.into_iter().map(|(k, v)| (k, sanitize_strings(v))).collect())
        }
        Value::Array(items) => Value::Array(items.into_iter().map(sanitize_strings).collect()),
        other => other,
    }
}

fn html_encode(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    for ch in input.chars() {
        match ch {
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '&' => out.push_str("&amp;"),
            other => out.push(other),
        }
    }
    out
}

/// Rate-limit layer: runs before auth, so a rate-limit check rejects
/// abusive traffic before it can amplify a brute-force attack through
/// auth cost. Scope/key are picked from the request path and, where
/// available, the caller's api-key header; unauthenticated routes fall
/// back to a per-IP default scope.
pub async fn rate_limit(State(state): State<Arc<AppState>>, request: Request, next: Next) -> Response {
    let path = request.uri().path().to_string();
    let request_id = request_id_of(&request);
    let (scope, rule) = scope_for_path(&path, &state);

    let key = request
        .headers()
        .get("x-api-key")
        .and_then(|v| v.to_str().ok())
        .map(|k| k.to_string())
        .unwrap_or_else(|| client_ip(&request));

    match state.cache.rate_limit(&format!("{scope}:{key}"), rule.limit, rule.window).await {
        Ok(outcome) if !outcome.allowed => render(
            &AppError::RateLimited { limit: outcome.limit, remaining: outcome.remaining, reset_at: outcome.reset_at },
            &path,
            &request_id,
        ),
        Ok(_) => next.run(request).await,
        Err(err) => {
            tracing::warn!(error = %err, "liveness cache rate limit check failed, failing open");
            next.run(request).await
        }
    }
}

fn scope_for_path(path: &str, state: &AppState) -> (&'static str, crate::config::RateLimitRule) {
    let limits = &state.settings.rate_limits;
    if path.ends_with("/devices/register") {
        ("registration", limits.registration.clone())
    } else if path.ends_with("/devices/telemetry") {
        ("telemetry", limits.telemetry.clone())
    } else if path.ends_with("/devices/heartbeat") {
        ("heartbeat", limits.heartbeat.clone())
    } else {
        ("default", limits.default.clone())
    }
}

fn client_ip(request: &Request) -> String {
    request
        .headers()
        .get("x-forwarded-for")
        .and_then(|v| v.to_str().ok())
        .map(|v| v.split(',').next().unwrap_or(v).trim().to_string())
        .unwrap_or_else(|| "unknown".to_string())
}

/// Authentication layer: resolves `X-API-Key` for device endpoints and
/// attaches the authenticated `Device` to request extensions; handlers
/// pull it back out rather than re-authenticating.
pub async fn device_auth(State(state): State<Arc<AppState>>, mut request: Request, next: Next) -> Response {
    let path = request.uri().path().to_string();
    let request_id = request_id_of(&request);
    let api_key = request
        .headers()
        .get("x-api-key")
        .and_then(|v| v.to_str().ok())
        .map(|s| s.to_string());

    let Some(api_key) = api_key else {
        return render(&AppError::AuthRequired, &path, &request_id);
    };

    match state.auth.authenticate(&api_key).await {
        Ok(Some(device)) => {
            request.extensions_mut().insert(device);
            next.run(request).await
        }
        Ok(None) => render(&AppError::AuthFailed, &path, &request_id),
        Err(err) => render(&AppError::Internal(err), &path, &request_id),
    }
}

pub async fn admin_auth(State(state): State<Arc<AppState>>, request: Request, next: Next) -> Response {
    let path = request.uri().path().to_string();
    let request_id = request_id_of(&request);
    let presented = request
        .headers()
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("admin "))
        .map(|s| s.to_string());

    match presented {
        Some(token) if state.auth.authorize_admin(&token) => next.run(request).await,
        Some(_) => render(&AppError::AuthFailed, &path, &request_id),
        None => render(&AppError::AuthRequired, &path, &request_id),
    }
}

pub async fn request_timeout(request: Request, next: Next) -> Response {
    match tokio::time::timeout(REQUEST_DEADLINE, next.run(request)).await {
        Ok(response) => response,
        Err(_) => (StatusCode::GATEWAY_TIMEOUT, "request exceeded deadline").into_response(),
    }
}

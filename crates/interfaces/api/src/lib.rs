//! HMAC- or Basic-auth-protected HTTP surface for the knowledge base
//! facade (spec §6.2): refresh, per-profile cleanup/sync, and prune.
//!
//! Each route is mounted twice: under `/internal/knowledge/...` for HMAC
//! callers and under `/knowledge/...` for Basic-auth callers, mirroring
//! the dual client-side path the bot service's Celery tasks use
//! (HMAC-preferred, falling back to `AI_COACH_REFRESH_USER`/`_PASSWORD`
//! when no HMAC secret is configured).

use std::sync::Arc;

use axum::body::Bytes;
use axum::extract::{Path, Query, State};
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::IntoResponse;
use axum::routing::post;
use axum::{Json, Router};
use base64::Engine as _;
use coachkb_config::AppConfig;
use coachkb_core::KnowledgeBase;
use coachkb_engine::Engine;
use hmac::{Hmac, Mac};
use serde::Deserialize;
use serde_json::json;
use sha2::Sha256;
use tracing::warn;

type HmacSha256 = Hmac<Sha256>;

#[derive(Clone)]
struct AuthConfig {
    key_id: String,
    api_key: String,
    max_clock_skew_s: i64,
    refresh_user: String,
    refresh_password: String,
}

struct ApiState<E: Engine + 'static> {
    kb: Arc<KnowledgeBase<E>>,
    auth: AuthConfig,
}

impl<E: Engine + 'static> Clone for ApiState<E> {
    fn clone(&self) -> Self {
        Self { kb: self.kb.clone(), auth: self.auth.clone() }
    }
}

fn sign(secret: &str, timestamp: i64, body: &[u8]) -> String {
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes()).expect("HMAC accepts any key length");
    mac.update(timestamp.to_string().as_bytes());
    mac.update(b".");
    mac.update(body);
    hex::encode(mac.finalize().into_bytes())
}

fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    let mut diff = 0u8;
    for (x, y) in a.iter().zip(b.iter()) {
        diff |= x ^ y;
    }
    diff == 0
}

fn verify_hmac(headers: &HeaderMap, body: &[u8], key_id: &str, api_key: &str, max_skew_s: i64) -> bool {
    let Some(given_key_id) = headers.get("X-Key-Id").and_then(|v| v.to_str().ok()) else { return false };
    if !constant_time_eq(given_key_id.as_bytes(), key_id.as_bytes()) {
        return false;
    }
    let Some(ts) = headers.get("X-TS").and_then(|v| v.to_str().ok()).and_then(|v| v.parse::<i64>().ok()) else {
        return false;
    };
    if (chrono::Utc::now().timestamp() - ts).abs() > max_skew_s {
        return false;
    }
    let Some(sig) = headers.get("X-Sig").and_then(|v| v.to_str().ok()) else { return false };
    constant_time_eq(sign(api_key, ts, body).as_bytes(), sig.as_bytes())
}

fn verify_basic(headers: &HeaderMap, user: &str, password: &str) -> bool {
    let Some(raw) = headers.get(header::AUTHORIZATION).and_then(|v| v.to_str().ok()) else { return false };
    let Some(encoded) = raw.strip_prefix("Basic ") else { return false };
    let Ok(decoded) = base64::engine::general_purpose::STANDARD.decode(encoded) else { return false };
    let Ok(text) = String::from_utf8(decoded) else { return false };
    let Some((given_user, given_password)) = text.split_once(':') else { return false };
    constant_time_eq(given_user.as_bytes(), user.as_bytes()) && constant_time_eq(given_password.as_bytes(), password.as_bytes())
}

/// Accepts whichever credential the caller actually sent: an `X-Sig`
/// header means HMAC, otherwise fall back to HTTP Basic.
fn authorized(headers: &HeaderMap, body: &[u8], auth: &AuthConfig) -> bool {
    if headers.contains_key("X-Sig") {
        verify_hmac(headers, body, &auth.key_id, &auth.api_key, auth.max_clock_skew_s)
    } else {
        verify_basic(headers, &auth.refresh_user, &auth.refresh_password)
    }
}

#[derive(Deserialize, Default)]
struct RefreshQuery {
    #[serde(default)]
    force: bool,
}

#[derive(Deserialize, Default)]
struct ReasonBody {
    reason: Option<String>,
}

async fn refresh_handler<E: Engine + 'static>(
    State(state): State<ApiState<E>>,
    Query(query): Query<RefreshQuery>,
    headers: HeaderMap,
    body: Bytes,
) -> impl IntoResponse {
    if !authorized(&headers, &body, &state.auth) {
        return StatusCode::UNAUTHORIZED.into_response();
    }
    match state.kb.refresh(query.force).await {
        Ok(()) => Json(json!({ "status": "ok" })).into_response(),
        Err(err) => {
            warn!(detail = %err, "kb_api.refresh_failed");
            (StatusCode::INTERNAL_SERVER_ERROR, Json(json!({ "status": "error", "error": err.to_string() }))).into_response()
        }
    }
}

async fn cleanup_handler<E: Engine + 'static>(
    State(state): State<ApiState<E>>,
    Path(profile_id): Path<u64>,
    headers: HeaderMap,
    body: Bytes,
) -> impl IntoResponse {
    if !authorized(&headers, &body, &state.auth) {
        return StatusCode::UNAUTHORIZED.into_response();
    }
    let reason = serde_json::from_slice::<ReasonBody>(&body).ok().and_then(|b| b.reason).unwrap_or_else(|| "profile_deleted".to_string());
    match state.kb.cleanup_profile(profile_id, &reason).await {
        Ok(()) => Json(json!({ "status": "ok" })).into_response(),
        Err(err) => {
            warn!(profile_id, detail = %err, "kb_api.cleanup_failed");
            (StatusCode::INTERNAL_SERVER_ERROR, Json(json!({ "status": "error", "error": err.to_string() }))).into_response()
        }
    }
}

async fn sync_handler<E: Engine + 'static>(
    State(state): State<ApiState<E>>,
    Path(profile_id): Path<u64>,
    headers: HeaderMap,
    body: Bytes,
) -> impl IntoResponse {
    if !authorized(&headers, &body, &state.auth) {
        return StatusCode::UNAUTHORIZED.into_response();
    }
    let reason = serde_json::from_slice::<ReasonBody>(&body).ok().and_then(|b| b.reason).unwrap_or_else(|| "profile_updated".to_string());
    match state.kb.sync_profile(profile_id, &reason).await {
        Ok(()) => Json(json!({ "status": "ok" })).into_response(),
        Err(err) => {
            warn!(profile_id, detail = %err, "kb_api.sync_failed");
            (StatusCode::INTERNAL_SERVER_ERROR, Json(json!({ "status": "error", "error": err.to_string() }))).into_response()
        }
    }
}

async fn prune_handler<E: Engine + 'static>(State(state): State<ApiState<E>>, headers: HeaderMap, body: Bytes) -> impl IntoResponse {
    if !authorized(&headers, &body, &state.auth) {
        return StatusCode::UNAUTHORIZED.into_response();
    }
    match state.kb.prune().await {
        Ok(()) => Json(json!({ "status": "ok" })).into_response(),
        Err(err) => {
            warn!(detail = %err, "kb_api.prune_failed");
            (StatusCode::INTERNAL_SERVER_ERROR, Json(json!({ "status": "error", "error": err.to_string() }))).into_response()
        }
    }
}

/// Builds the full router, mounted twice per internal route (HMAC path
/// under `/internal/...`, Basic-auth path under `/knowledge/...`) so
/// either calling convention reaches the same handler.
pub fn build_router<E: Engine + 'static>(kb: Arc<KnowledgeBase<E>>, config: &AppConfig) -> Router {
    let state = ApiState {
        kb,
        auth: AuthConfig {
            key_id: config.internal_auth.key_id.clone(),
            api_key: config.internal_auth.api_key.clone(),
            max_clock_skew_s: config.bot_callback.max_clock_skew_s,
            refresh_user: config.refresh_api.user.clone(),
            refresh_password: config.refresh_api.password.clone(),
        },
    };

    Router::new()
        .route("/knowledge/refresh/", post(refresh_handler::<E>))
        .route("/internal/knowledge/profiles/:id/cleanup/", post(cleanup_handler::<E>))
        .route("/knowledge/profiles/:id/cleanup/", post(cleanup_handler::<E>))
        .route("/internal/knowledge/profiles/:id/sync/", post(sync_handler::<E>))
        .route("/knowledge/profiles/:id/sync/", post(sync_handler::<E>))
        .route("/internal/knowledge/prune/", post(prune_handler::<E>))
        .route("/knowledge/prune/", post(prune_handler::<E>))
        .with_state(state)
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    fn headers_with(key: &'static str, value: &str) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(key, HeaderValue::from_str(value).unwrap());
        headers
    }

    #[test]
    fn constant_time_eq_rejects_different_lengths() {
        assert!(!constant_time_eq(b"abc", b"ab"));
    }

    #[test]
    fn verify_hmac_accepts_matching_signature() {
        let body = b"{}";
        let ts = chrono::Utc::now().timestamp();
        let sig = sign("secret", ts, body);
        let mut headers = headers_with("X-Key-Id", "internal");
        headers.insert("X-TS", HeaderValue::from_str(&ts.to_string()).unwrap());
        headers.insert("X-Sig", HeaderValue::from_str(&sig).unwrap());
        assert!(verify_hmac(&headers, body, "internal", "secret", 300));
    }

    #[test]
    fn verify_hmac_rejects_stale_timestamp() {
        let body = b"{}";
        let ts = chrono::Utc::now().timestamp() - 10_000;
        let sig = sign("secret", ts, body);
        let mut headers = headers_with("X-Key-Id", "internal");
        headers.insert("X-TS", HeaderValue::from_str(&ts.to_string()).unwrap());
        headers.insert("X-Sig", HeaderValue::from_str(&sig).unwrap());
        assert!(!verify_hmac(&headers, body, "internal", "secret", 300));
    }

    #[test]
    fn verify_basic_accepts_matching_credentials() {
        let encoded = base64::engine::general_purpose::STANDARD.encode(b"ai_coach:topsecret");
        let headers = headers_with("authorization", &format!("Basic {encoded}"));
        assert!(verify_basic(&headers, "ai_coach", "topsecret"));
    }

    #[test]
    fn verify_basic_rejects_wrong_password() {
        let encoded = base64::engine::general_purpose::STANDARD.encode(b"ai_coach:wrong");
        let headers = headers_with("authorization", &format!("Basic {encoded}"));
        assert!(!verify_basic(&headers, "ai_coach", "topsecret"));
    }

    #[test]
    fn authorized_falls_back_to_basic_when_no_signature_header_present() {
        let encoded = base64::engine::general_purpose::STANDARD.encode(b"ai_coach:topsecret");
        let headers = headers_with("authorization", &format!("Basic {encoded}"));
        let auth = AuthConfig {
            key_id: "internal".to_string(),
            api_key: "secret".to_string(),
            max_clock_skew_s: 300,
            refresh_user: "ai_coach".to_string(),
            refresh_password: "topsecret".to_string(),
        };
        assert!(authorized(&headers, b"{}", &auth));
    }
}

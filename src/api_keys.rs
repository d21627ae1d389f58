// LibertAI gateway — API key set
//
// Holds the process-wide set of valid bearer keys. The set is replaced
// wholesale after each successful refresh from the admin backend; a
// failed refresh never shrinks it. After a replace, the keys are pushed
// to every replica as a signed bundle.

use std::collections::HashSet;
use std::sync::Arc;

use axum::extract::State;
use axum::http::{HeaderMap, StatusCode, header};
use axum::response::IntoResponse;
use serde::Deserialize;
use serde_json::json;
use tokio::sync::RwLock;

use crate::crypto;
use crate::state::AppState;

#[derive(Clone, Default)]
pub struct KeySet {
    inner: Arc<RwLock<Arc<HashSet<String>>>>,
}

impl KeySet {
    pub async fn contains(&self, key: &str) -> bool {
        self.inner.read().await.contains(key)
    }

    pub async fn current(&self) -> Arc<HashSet<String>> {
        self.inner.read().await.clone()
    }

    pub async fn replace(&self, keys: HashSet<String>) {
        *self.inner.write().await = Arc::new(keys);
    }
}

#[derive(Deserialize)]
struct KeyListResponse {
    keys: Vec<String>,
}

/// GET {backend}/api-keys/admin/list. Any failure returns `Err` so the
/// caller keeps the previous set.
async fn fetch_active_keys(state: &AppState) -> Result<HashSet<String>, String> {
    let url = format!("{}/api-keys/admin/list", state.config.backend_api_url);

    let response = state
        .control_client
        .get(&url)
        .header("x-admin-token", &state.config.backend_secret_token)
        .send()
        .await
        .map_err(|e| format!("request failed: {e}"))?;

    if response.status() != reqwest::StatusCode::OK {
        return Err(format!("backend returned {}", response.status()));
    }

    let body: KeyListResponse = response
        .json()
        .await
        .map_err(|e| format!("invalid response body: {e}"))?;

    Ok(body.keys.into_iter().collect())
}

/// Refresh the key set from the admin backend, then redistribute it to
/// every replica. Fetch failures retain the previous set; distribution
/// failures are logged per endpoint and never roll back the update.
pub async fn refresh_keys(state: &AppState) {
    match fetch_active_keys(state).await {
        Ok(keys) => {
            tracing::debug!("keys: refreshed, {} active keys", keys.len());
            state.keys.replace(keys).await;
        }
        Err(e) => {
            tracing::error!("keys: refresh failed, keeping previous set: {e}");
        }
    }

    distribute_keys(state).await;
}

/// POST the signed key bundle to `{replica}/libertai/api-keys` for every
/// distinct replica URL in the catalogue.
async fn distribute_keys(state: &AppState) {
    let mut endpoints: Vec<String> = state
        .config
        .models
        .values()
        .flatten()
        .map(|replica| format!("{}/libertai/api-keys", replica.url))
        .collect();
    endpoints.sort();
    endpoints.dedup();

    if endpoints.is_empty() {
        return;
    }

    let mut keys: Vec<String> = state.keys.current().await.iter().cloned().collect();
    keys.sort();

    let payload = match crypto::create_signed_payload(&json!({ "keys": keys }), &state.config.private_key_b64) {
        Ok(p) => p,
        Err(e) => {
            tracing::error!("keys: failed to sign key bundle: {e}");
            return;
        }
    };

    for endpoint in endpoints {
        match state.control_client.post(&endpoint).json(&payload).send().await {
            Ok(response) if response.status() == reqwest::StatusCode::OK => {}
            Ok(response) => {
                tracing::error!("keys: {endpoint} rejected key bundle: {}", response.status());
            }
            Err(e) => {
                tracing::error!("keys: failed to send key bundle to {endpoint}: {e}");
            }
        }
    }
}

/// GET /libertai/auth/check — 200 when the bearer token is in the key
/// set, 401 otherwise.
#[utoipa::path(
    get,
    path = "/libertai/auth/check",
    tag = "auth",
    responses(
        (status = 200, description = "Token is valid"),
        (status = 401, description = "Missing or unknown token"),
    )
)]
pub async fn check_auth(State(state): State<AppState>, headers: HeaderMap) -> impl IntoResponse {
    if let Some(token) = bearer_token(&headers) {
        if state.keys.contains(token).await {
            return (StatusCode::OK, "OK");
        }
    }
    (StatusCode::UNAUTHORIZED, "Unauthorized")
}

/// Extract the token from an `Authorization: Bearer …` header.
pub fn bearer_token(headers: &HeaderMap) -> Option<&str> {
    headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .filter(|token| !token.is_empty())
}

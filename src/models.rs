// LibertAI gateway — model catalogue endpoints

use axum::Json;
use axum::extract::State;
use serde_json::{Value, json};

use crate::state::AppState;

/// GET /libertai/models — model → currently healthy replica URLs.
#[utoipa::path(
    get,
    path = "/libertai/models",
    tag = "models",
    responses((status = 200, description = "Healthy replica URLs per model"))
)]
pub async fn models_list(State(state): State<AppState>) -> Json<Value> {
    let healthy = state.health.healthy_model_urls().await;

    let mut data = serde_json::Map::new();
    for model in state.config.models.keys() {
        let servers = healthy.get(model).cloned().unwrap_or_default();
        data.insert(model.clone(), json!({ "servers": servers }));
    }

    Json(Value::Object(data))
}

/// GET /v1/models — the catalogue in OpenAI list format.
#[utoipa::path(
    get,
    path = "/v1/models",
    tag = "models",
    responses((status = 200, description = "OpenAI-compatible model list"))
)]
pub async fn openai_models_list(State(state): State<AppState>) -> Json<Value> {
    let created = chrono::Utc::now().timestamp();

    let data: Vec<Value> = state
        .config
        .models
        .keys()
        .map(|model| {
            json!({
                "id": model,
                "object": "model",
                "created": created,
                "owned_by": "libertai",
            })
        })
        .collect();

    Json(json!({ "object": "list", "data": data }))
}

/// GET /api/health — gateway self-health (not a replica probe).
#[utoipa::path(
    get,
    path = "/api/health",
    tag = "health",
    responses((status = 200, description = "Gateway status"))
)]
pub async fn health(State(state): State<AppState>) -> Json<Value> {
    let healthy = state.health.healthy_model_urls().await;
    let replicas_total: usize = state.config.models.values().map(|r| r.len()).sum();
    let replicas_healthy: usize = healthy.values().map(|urls| urls.len()).sum();

    Json(json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
        "uptime_seconds": state.start_time.elapsed().as_secs(),
        "models": state.config.models.len(),
        "replicas_total": replicas_total,
        "replicas_healthy": replicas_healthy,
    }))
}

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::Deserialize;
use serde_json::{json, Value};
use std::sync::{atomic::Ordering, Arc};
use tracing::info;

use crate::clock::Window;
use crate::config::{Config, LimitConfig, ProviderConfig, ProviderKind};
use crate::errors::RelayError;
use crate::state::AppState;
use crate::usage::ScopeId;

pub fn router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/api/providers", get(list_providers).post(create_provider))
        .route(
            "/api/providers/:id",
            get(get_provider).put(update_provider).delete(delete_provider),
        )
        .route("/api/usage", get(get_usage))
        .route("/api/usage/reset", post(reset_usage))
        .route("/api/limits", get(get_limits).put(put_limits))
        .route("/api/status", get(status))
        .route("/api/system/restart", post(restart))
}

fn not_found(what: &str) -> Response {
    let body = json!({"error": {"message": format!("{} not found", what), "type": "not_found"}});
    (StatusCode::NOT_FOUND, Json(body)).into_response()
}

/// Validate, publish, then write the config file (with its `.bak` sibling).
fn apply_and_save(state: &AppState, new_cfg: Config) -> Result<(), RelayError> {
    state
        .apply_config(new_cfg.clone())
        .map_err(|e| RelayError::InvalidRequest(format!("configuration rejected: {}", e)))?;
    new_cfg
        .save_to_path(&state.settings.config_path)
        .map_err(|e| RelayError::Internal(format!("failed to persist configuration: {}", e)))?;
    Ok(())
}

// ----------------------
// Providers
// ----------------------

fn provider_json(state: &AppState, p: &ProviderConfig) -> Value {
    let usage = state.counters.snapshot(&ScopeId::provider(&p.id));
    json!({
        "config": p,
        "health": state.health.view(&p.id),
        "usage": usage,
    })
}

async fn list_providers(State(state): State<Arc<AppState>>) -> Json<Value> {
    let cfg = state.cfg.read().clone();
    let providers: Vec<Value> = cfg.providers.iter().map(|p| provider_json(&state, p)).collect();
    let virtuals: Vec<Value> = cfg
        .virtual_providers
        .iter()
        .map(|v| {
            let eligible = v
                .members
                .iter()
                .filter(|m| state.health.eligible(&m.provider))
                .count();
            json!({
                "config": v,
                "state": derived_virtual_state(eligible, v.members.len()),
                "usage": state.counters.snapshot(&ScopeId::virtual_provider(&v.id)),
            })
        })
        .collect();
    Json(json!({"providers": providers, "virtual_providers": virtuals}))
}

fn derived_virtual_state(eligible: usize, total: usize) -> &'static str {
    if eligible == 0 {
        "unavailable"
    } else if eligible < total {
        "degraded"
    } else {
        "healthy"
    }
}

async fn get_provider(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Response {
    let cfg = state.cfg.read().clone();
    match cfg.providers.iter().find(|p| p.id == id) {
        Some(p) => Json(provider_json(&state, p)).into_response(),
        None => not_found("provider"),
    }
}

async fn create_provider(
    State(state): State<Arc<AppState>>,
    Json(provider): Json<ProviderConfig>,
) -> Response {
    let mut new_cfg = state.cfg.read().clone();
    new_cfg.providers.push(provider.clone());
    match apply_and_save(&state, new_cfg) {
        Ok(()) => {
            info!(provider = %provider.id, "provider created");
            (StatusCode::CREATED, Json(json!({"status": "created", "id": provider.id})))
                .into_response()
        }
        Err(e) => e.into_response(),
    }
}

async fn update_provider(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Json(provider): Json<ProviderConfig>,
) -> Response {
    if provider.id != id {
        return RelayError::InvalidRequest("provider id in body does not match path".to_string())
            .into_response();
    }
    let mut new_cfg = state.cfg.read().clone();
    let Some(slot) = new_cfg.providers.iter_mut().find(|p| p.id == id) else {
        return not_found("provider");
    };
    *slot = provider;
    match apply_and_save(&state, new_cfg) {
        Ok(()) => {
            info!(provider = %id, "provider updated");
            Json(json!({"status": "updated", "id": id})).into_response()
        }
        Err(e) => e.into_response(),
    }
}

async fn delete_provider(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Response {
    let mut new_cfg = state.cfg.read().clone();
    let before = new_cfg.providers.len();
    new_cfg.providers.retain(|p| p.id != id);
    if new_cfg.providers.len() == before {
        return not_found("provider");
    }
    // Virtual providers referencing the removed id fail validation, which
    // keeps the old snapshot in place; in-flight requests keep the snapshot
    // they already hold either way.
    match apply_and_save(&state, new_cfg) {
        Ok(()) => {
            info!(provider = %id, "provider deleted");
            Json(json!({"status": "deleted", "id": id})).into_response()
        }
        Err(e) => e.into_response(),
    }
}

// ----------------------
// Usage
// ----------------------

async fn get_usage(State(state): State<Arc<AppState>>) -> Json<Value> {
    let mut ids = state.counters.scope_ids();
    ids.sort_by_key(|s| s.to_string());
    let scopes: Vec<Value> = ids
        .into_iter()
        .map(|scope| {
            let counters = state.counters.snapshot(&scope);
            json!({"scope": scope, "label": scope.to_string(), "windows": counters})
        })
        .collect();
    Json(json!({"scopes": scopes}))
}

#[derive(Debug, Deserialize)]
struct ResetRequest {
    scope: String,
    #[serde(default)]
    windows: Option<Vec<Window>>,
}

async fn reset_usage(
    State(state): State<Arc<AppState>>,
    Json(req): Json<ResetRequest>,
) -> Response {
    let snapshot = state.registry.snapshot();
    let Some(scope) = snapshot.resolve_scope(&req.scope) else {
        return RelayError::InvalidRequest(format!("unknown scope {}", req.scope)).into_response();
    };
    let windows = req.windows.unwrap_or_else(|| Window::ALL.to_vec());
    state.counters.reset(&scope, &windows);
    info!(scope = %scope, "usage counters reset");
    Json(json!({"status": "ok"})).into_response()
}

// ----------------------
// Limits
// ----------------------

async fn get_limits(State(state): State<Arc<AppState>>) -> Json<Vec<LimitConfig>> {
    Json(state.cfg.read().limits.clone())
}

async fn put_limits(
    State(state): State<Arc<AppState>>,
    Json(limits): Json<Vec<LimitConfig>>,
) -> Response {
    let mut new_cfg = state.cfg.read().clone();
    new_cfg.limits = limits;
    match apply_and_save(&state, new_cfg) {
        Ok(()) => Json(json!({"status": "ok"})).into_response(),
        Err(e) => e.into_response(),
    }
}

// ----------------------
// Status / restart
// ----------------------

async fn status(State(state): State<Arc<AppState>>) -> Json<Value> {
    let snapshot = state.registry.snapshot();
    let cfg = state.cfg.read().clone();
    let mut providers = Vec::with_capacity(cfg.providers.len());
    for p in &cfg.providers {
        let usage = state.counters.snapshot(&ScopeId::provider(&p.id));
        let kind = match &p.kind {
            ProviderKind::Http { .. } => "http",
            ProviderKind::Local { .. } => "local",
        };
        providers.push(json!({
            "id": p.id,
            "name": p.name(),
            "kind": kind,
            "enabled": p.enabled,
            "health": state.health.view(&p.id),
            "requests_minute": usage.minute.requests,
            "requests_day": usage.day.requests,
            "errors_day": usage.day.errors,
            "cost_day": usage.day.cost,
        }));
    }
    let virtuals: Vec<Value> = cfg
        .virtual_providers
        .iter()
        .map(|v| {
            let eligible = v
                .members
                .iter()
                .filter(|m| state.health.eligible(&m.provider))
                .count();
            json!({
                "id": v.id,
                "name": v.name(),
                "members": v.members.len(),
                "eligible_members": eligible,
                "state": derived_virtual_state(eligible, v.members.len()),
            })
        })
        .collect();
    Json(json!({
        "config_version": snapshot.version,
        "total_requests": state.total_requests.load(Ordering::Relaxed),
        "providers": providers,
        "virtual_providers": virtuals,
    }))
}

/// Re-read the config file, republish, and flush a usage snapshot. The
/// process itself stays up; in-flight requests finish on their snapshot.
async fn restart(State(state): State<Arc<AppState>>) -> Response {
    let cfg = match Config::load_from_path(&state.settings.config_path) {
        Ok(cfg) => cfg,
        Err(e) => {
            return RelayError::Internal(format!("failed to reload configuration: {}", e))
                .into_response()
        }
    };
    if let Err(e) = state.apply_config(cfg) {
        return RelayError::InvalidRequest(format!("configuration rejected: {}", e))
            .into_response();
    }
    if let Err(e) = state.counters.persist(&state.settings.usage_path) {
        return RelayError::Internal(format!("failed to persist usage: {}", e)).into_response();
    }
    info!("system restarted from persisted configuration");
    Json(json!({"status": "restarted"})).into_response()
}

// src/routes/settings_routes.rs

use axum::{
    extract::State,
    routing::{delete, get, put},
    Json, Router,
};
use serde::Serialize;

use crate::{
    error::ApiError,
    gateway::EvolutionSettings,
    middleware::auth_context::AuthContext,
    models::{AppState, OkData, OkResponse},
    settings::SettingsStore,
};

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/settings/evolution", get(get_evolution))
        .route("/settings/evolution", put(save_evolution))
        .route("/settings/evolution", delete(clear_evolution))
}

#[derive(Debug, Serialize)]
pub struct EvolutionResponse {
    pub data: EvolutionData,
}

#[derive(Debug, Serialize)]
pub struct EvolutionData {
    pub configured: bool,
    pub base_url: Option<String>,
    pub instance: Option<String>,
    /// The key itself is never echoed back.
    pub has_api_key: bool,
}

pub async fn get_evolution(
    State(state): State<AppState>,
    auth: AuthContext,
) -> Result<Json<EvolutionResponse>, ApiError> {
    let settings = SettingsStore::new(state.db.clone())
        .evolution(&auth.operator_id)
        .await
        .map_err(ApiError::db)?;

    let data = match settings {
        Some(s) => EvolutionData {
            configured: s.is_complete(),
            has_api_key: !s.api_key.trim().is_empty(),
            base_url: Some(s.base_url),
            instance: Some(s.instance),
        },
        None => EvolutionData {
            configured: false,
            base_url: None,
            instance: None,
            has_api_key: false,
        },
    };

    Ok(Json(EvolutionResponse { data }))
}

pub async fn save_evolution(
    State(state): State<AppState>,
    auth: AuthContext,
    Json(req): Json<EvolutionSettings>,
) -> Result<Json<OkResponse>, ApiError> {
    if !req.is_complete() {
        return Err(ApiError::BadRequest(
            "VALIDATION_ERROR",
            "base_url, api_key and instance are all required".into(),
        ));
    }

    SettingsStore::new(state.db.clone())
        .save_evolution(&auth.operator_id, &req)
        .await
        .map_err(ApiError::db)?;

    Ok(Json(OkResponse {
        data: OkData { ok: true },
    }))
}

pub async fn clear_evolution(
    State(state): State<AppState>,
    auth: AuthContext,
) -> Result<Json<OkResponse>, ApiError> {
    SettingsStore::new(state.db.clone())
        .clear_evolution(&auth.operator_id)
        .await
        .map_err(ApiError::db)?;

    Ok(Json(OkResponse {
        data: OkData { ok: true },
    }))
}

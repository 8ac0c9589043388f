//! Runtime log filter routes.

use axum::{
    Json, Router,
    extract::{State, rejection::JsonRejection},
    routing::get,
};
use serde::{Deserialize, Serialize};

use crate::api::error::{ApiError, ApiResult};
use crate::api::server::AppState;
use crate::logging::available_modules;

pub fn router() -> Router<AppState> {
    Router::new().route("/", get(get_logging_config).put(update_log_filter))
}

#[derive(Debug, Deserialize)]
pub struct UpdateLogFilterRequest {
    pub filter: String,
}

#[derive(Debug, Serialize)]
pub struct ModuleInfo {
    pub name: String,
    pub description: String,
}

#[derive(Debug, Serialize)]
pub struct LoggingConfigResponse {
    pub filter: String,
    pub available_modules: Vec<ModuleInfo>,
}

fn response_for(filter: String) -> LoggingConfigResponse {
    LoggingConfigResponse {
        filter,
        available_modules: available_modules()
            .into_iter()
            .map(|(name, description)| ModuleInfo {
                name: name.to_string(),
                description: description.to_string(),
            })
            .collect(),
    }
}

async fn get_logging_config(State(state): State<AppState>) -> ApiResult<Json<LoggingConfigResponse>> {
    let config = state
        .logging_config
        .as_ref()
        .ok_or_else(|| ApiError::service_unavailable("Logging configuration not available"))?;
    Ok(Json(response_for(config.get_filter())))
}

async fn update_log_filter(
    State(state): State<AppState>,
    payload: Result<Json<UpdateLogFilterRequest>, JsonRejection>,
) -> ApiResult<Json<LoggingConfigResponse>> {
    let Json(request) = payload.map_err(|e| ApiError::bad_request(e.body_text()))?;
    let config = state
        .logging_config
        .as_ref()
        .ok_or_else(|| ApiError::service_unavailable("Logging configuration not available"))?;

    config.set_filter(&request.filter)?;
    Ok(Json(response_for(config.get_filter())))
}

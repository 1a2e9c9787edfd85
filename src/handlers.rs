//! Configuration endpoints: read the effective configuration (credentials
//! redacted) and tune the runtime budgets without a restart.

use crate::error::{AppError, AppResult};
use crate::state::AppState;

use actix_web::{web, HttpResponse};
use serde_json::json;
use tracing::info;

/// GET /api/v1/config — the effective configuration with the API key
/// redacted. Credentials never leave the process.
pub async fn get_config(state: web::Data<AppState>) -> AppResult<HttpResponse> {
    let mut config = state.get_config();
    if !config.provider.api_key.is_empty() {
        config.provider.api_key = "***".to_string();
    }

    let body = serde_json::to_value(&config)
        .map_err(|err| AppError::Internal(err.to_string()))?;
    Ok(HttpResponse::Ok().json(body))
}

/// PUT /api/v1/config — partial update of the tunable budgets (throttle cap,
/// idle/session timeouts, reaper period, provider tuning). The reaper reads
/// the new budgets on its next sweep; connections accepted from now on use
/// the new frame cap.
pub async fn update_config(state: web::Data<AppState>, body: String) -> AppResult<HttpResponse> {
    // Update a copy so a rejected body leaves the live configuration intact
    let mut updated = state.get_config();
    updated
        .update_from_json(&body)
        .map_err(|err| AppError::BadRequest(err.to_string()))?;

    info!(
        frames_per_minute = updated.limits.frames_per_minute,
        idle_timeout_secs = updated.limits.idle_timeout_secs,
        session_timeout_secs = updated.limits.session_timeout_secs,
        "runtime configuration updated"
    );
    *state.config.write().unwrap() = updated;

    Ok(HttpResponse::Ok().json(json!({
        "status": "updated",
        "timestamp": chrono::Utc::now().to_rfc3339()
    })))
}

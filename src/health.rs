use crate::state::AppState;
use actix_web::{web, HttpResponse};
use serde_json::json;

pub async fn health_check(state: web::Data<AppState>) -> HttpResponse {
    let metrics = state.metrics_snapshot();
    let config = state.get_config();

    HttpResponse::Ok().json(json!({
        "status": "healthy",
        "timestamp": chrono::Utc::now().to_rfc3339(),
        "uptime_seconds": state.uptime_seconds(),
        "service": {
            "name": "voice-relay-backend",
            "version": env!("CARGO_PKG_VERSION"),
            "host": config.server.host,
            "port": config.server.port
        },
        "provider": {
            "connector": state.connector.name(),
            "connect_timeout_secs": config.provider.connect_timeout_secs
        },
        "relay": {
            "active_connections": metrics.active_connections,
            "registered_connections": state.registry.len(),
            "sessions_opened": metrics.sessions_opened,
            "provider_failures": metrics.provider_failures
        }
    }))
}

pub async fn detailed_metrics(state: web::Data<AppState>) -> HttpResponse {
    let metrics = state.metrics_snapshot();
    let config = state.get_config();
    let uptime_seconds = state.uptime_seconds();

    let admission_total = metrics.frames_forwarded + metrics.frames_throttled;
    let throttle_rate = if admission_total > 0 {
        metrics.frames_throttled as f64 / admission_total as f64
    } else {
        0.0
    };

    HttpResponse::Ok().json(json!({
        "timestamp": chrono::Utc::now().to_rfc3339(),
        "uptime_seconds": uptime_seconds,
        "http": {
            "total_requests": metrics.http_requests,
            "total_errors": metrics.http_errors
        },
        "relay": {
            "active_connections": metrics.active_connections,
            "sessions_opened": metrics.sessions_opened,
            "evictions": metrics.evictions,
            "provider_failures": metrics.provider_failures
        },
        "audio": {
            "frames_forwarded": metrics.frames_forwarded,
            "frames_throttled": metrics.frames_throttled,
            "throttle_rate": throttle_rate,
            "frame_cap_per_minute": config.limits.frames_per_minute
        },
        "transcripts": {
            "partial": metrics.partial_transcripts,
            "final": metrics.final_transcripts
        },
        "budgets": {
            "idle_timeout_secs": config.limits.idle_timeout_secs,
            "session_timeout_secs": config.limits.session_timeout_secs,
            "reaper_interval_secs": config.limits.reaper_interval_secs
        }
    }))
}

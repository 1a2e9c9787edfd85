//! # Error Handling
//!
//! Two error families live here:
//!
//! - [`AppError`]: errors surfaced over the HTTP surface (health, config
//!   endpoints), converted to JSON responses via actix's `ResponseError`.
//! - [`ProviderError`]: failures at the upstream STT boundary (handshake
//!   rejected, transport dropped). These never become HTTP responses — the
//!   relay reports them to the affected client as a single `error` event over
//!   the WebSocket and tears that one connection down. One client's provider
//!   failure must never affect another client's connection.

use actix_web::{HttpResponse, ResponseError};
use serde_json::json;
use std::fmt;

/// Errors returned by HTTP request handlers.
#[derive(Debug)]
pub enum AppError {
    /// Server-side problems (lock poisoning, serialization failures)
    Internal(String),

    /// Client sent invalid or malformed data
    BadRequest(String),

    /// Configuration loading or validation problems
    ConfigError(String),
}

impl fmt::Display for AppError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AppError::Internal(msg) => write!(f, "Internal error: {}", msg),
            AppError::BadRequest(msg) => write!(f, "Bad request: {}", msg),
            AppError::ConfigError(msg) => write!(f, "Configuration error: {}", msg),
        }
    }
}

impl ResponseError for AppError {
    fn error_response(&self) -> HttpResponse {
        let (status, error_type, message) = match self {
            AppError::Internal(msg) => (
                actix_web::http::StatusCode::INTERNAL_SERVER_ERROR,
                "internal_error",
                msg.clone(),
            ),
            AppError::BadRequest(msg) => (
                actix_web::http::StatusCode::BAD_REQUEST,
                "bad_request",
                msg.clone(),
            ),
            AppError::ConfigError(msg) => (
                actix_web::http::StatusCode::BAD_REQUEST,
                "config_error",
                msg.clone(),
            ),
        };

        HttpResponse::build(status).json(json!({
            "error": {
                "type": error_type,
                "message": message,
                "timestamp": chrono::Utc::now().to_rfc3339()
            }
        }))
    }
}

impl From<anyhow::Error> for AppError {
    fn from(err: anyhow::Error) -> Self {
        AppError::Internal(err.to_string())
    }
}

/// JSON parsing failures on the HTTP surface are the client's fault.
impl From<serde_json::Error> for AppError {
    fn from(err: serde_json::Error) -> Self {
        AppError::BadRequest(format!("JSON parsing error: {}", err))
    }
}

impl From<config::ConfigError> for AppError {
    fn from(err: config::ConfigError) -> Self {
        AppError::ConfigError(err.to_string())
    }
}

pub type AppResult<T> = Result<T, AppError>;

/// Failures at the upstream STT provider boundary.
///
/// None of these are retried automatically within a client session; the relay
/// surfaces them once and closes the affected connection with a
/// distinguishable close code.
#[derive(Debug)]
pub enum ProviderError {
    /// The provider handshake could not be completed (bad endpoint,
    /// TLS/upgrade failure, connection refused)
    Handshake(String),

    /// The provider explicitly rejected the session (auth, quota, bad config)
    Rejected(String),

    /// The transport failed after the handshake started
    Transport(String),
}

impl fmt::Display for ProviderError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProviderError::Handshake(msg) => write!(f, "provider handshake failed: {}", msg),
            ProviderError::Rejected(msg) => write!(f, "provider rejected session: {}", msg),
            ProviderError::Transport(msg) => write!(f, "provider transport error: {}", msg),
        }
    }
}

impl std::error::Error for ProviderError {}

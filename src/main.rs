//! # Voice Relay Backend - Main Application Entry Point
//!
//! Entry point for the voice-relay-backend server: a WebSocket relay that
//! sits between browser microphone clients and a streaming speech-to-text
//! provider. Clients connect to `/ws/audio`, stream binary PCM audio, and
//! receive canonical transcript events back on the same socket.
//!
//! ## Application Architecture:
//! - **config**: Layered configuration (config.toml + environment variables)
//! - **state**: Shared application state, relay metrics, session registry
//! - **health**: Health and metrics endpoints
//! - **middleware**: Request telemetry (logging + metrics)
//! - **handlers**: Runtime configuration endpoints
//! - **websocket**: The per-connection relay actor (Relay Core)
//! - **registry**: Connection registry and the idle/session reaper
//! - **throttle**: Per-connection audio frame rate limiting
//! - **translate**: Provider message → canonical event translation
//! - **provider**: Connector trait plus the streaming and mock connectors
//! - **error**: Custom error types and HTTP error responses

mod config;
mod error;
mod handlers;
mod health;
mod middleware;
mod provider;
mod registry;
mod state;
mod throttle;
mod translate;
mod websocket;

use actix_cors::Cors;
use actix_web::{middleware::Logger, web, App, HttpServer};
use anyhow::Result;
use config::AppConfig;
use state::AppState;
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Global shutdown flag, set by the signal handler task and polled by main.
static SHUTDOWN_SIGNAL: AtomicBool = AtomicBool::new(false);

/// The main application entry point.
///
/// Loads and validates configuration, builds the provider connector, starts
/// the background reaper, and serves HTTP + WebSocket traffic until a
/// shutdown signal arrives.
#[actix_web::main]
async fn main() -> Result<()> {
    // Load environment variables from .env file (if it exists)
    dotenv::dotenv().ok();

    init_tracing()?;

    let config = AppConfig::load()?;
    config.validate()?;

    info!("Starting voice-relay-backend v{}", env!("CARGO_PKG_VERSION"));
    info!(
        "Configuration loaded: {}:{} (connector: {})",
        config.server.host, config.server.port, config.provider.kind
    );

    let connector = provider::connector_from_config(&config.provider)?;
    let app_state = AppState::new(config.clone(), connector);
    let bind_addr = format!("{}:{}", config.server.host, config.server.port);

    // The reaper enforces idle and session budgets across all connections;
    // it re-reads the budgets each tick so runtime config updates apply
    registry::spawn_reaper(app_state.registry.clone(), app_state.config.clone());

    setup_signal_handlers();

    info!("Starting HTTP server on {}", bind_addr);

    let server = HttpServer::new(move || {
        // Browser microphone clients connect cross-origin
        let cors = Cors::default()
            .allow_any_origin()
            .allow_any_method()
            .allow_any_header()
            .max_age(3600);

        App::new()
            .app_data(web::Data::new(app_state.clone()))
            .wrap(cors)
            .wrap(Logger::default())
            .wrap(middleware::RequestTelemetry)
            .route("/ws/audio", web::get().to(websocket::audio_relay))
            .service(
                web::scope("/api/v1")
                    .route("/health", web::get().to(health::health_check))
                    .route("/metrics", web::get().to(health::detailed_metrics))
                    .route("/config", web::get().to(handlers::get_config))
                    .route("/config", web::put().to(handlers::update_config)),
            )
            // Also provide health check at root level for convenience
            .route("/health", web::get().to(health::health_check))
    })
    .bind(&bind_addr)?
    .run();

    let server_handle = server.handle();
    let server_task = tokio::spawn(server);

    // Race the server against the shutdown signal
    tokio::select! {
        result = server_task => {
            match result {
                Ok(server_result) => {
                    if let Err(e) = server_result {
                        error!("Server error: {}", e);
                    }
                }
                Err(e) => {
                    error!("Server task error: {}", e);
                }
            }
        }
        _ = wait_for_shutdown() => {
            info!("Shutdown signal received, stopping server...");
            server_handle.stop(true).await;
        }
    }

    info!("Server stopped gracefully");
    Ok(())
}

/// Initialize the tracing (logging) system.
///
/// `RUST_LOG` controls the filter; without it, the relay logs at debug and
/// actix-web at info.
fn init_tracing() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "voice_relay_backend=debug,actix_web=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    Ok(())
}

/// Install SIGTERM/SIGINT handlers that trip the global shutdown flag.
fn setup_signal_handlers() {
    tokio::spawn(async {
        let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("Failed to install SIGTERM handler");
        let mut sigint = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::interrupt())
            .expect("Failed to install SIGINT handler");

        tokio::select! {
            _ = sigterm.recv() => {
                info!("Received SIGTERM");
            }
            _ = sigint.recv() => {
                info!("Received SIGINT");
            }
        }

        SHUTDOWN_SIGNAL.store(true, Ordering::SeqCst);
    });
}

/// Poll the shutdown flag until it trips.
async fn wait_for_shutdown() {
    while !SHUTDOWN_SIGNAL.load(Ordering::SeqCst) {
        tokio::time::sleep(tokio::time::Duration::from_millis(100)).await;
    }
}

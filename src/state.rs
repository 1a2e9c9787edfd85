//! # Application State Management
//!
//! Shared state accessed by HTTP handlers, the relay actors and the reaper:
//! the configuration (read-mostly, runtime-tunable budgets), the relay
//! metrics counters, the session registry and the one connector selected at
//! startup. Everything mutable sits behind `Arc<RwLock<_>>`; locks are held
//! only long enough to copy data out.

use crate::config::AppConfig;
use crate::provider::SttConnector;
use crate::registry::SessionRegistry;
use crate::translate::TranscriptKind;

use std::sync::{Arc, RwLock};
use std::time::Instant;

/// Shared application state, cheap to clone.
#[derive(Clone)]
pub struct AppState {
    /// Application configuration (budgets can be updated at runtime)
    pub config: Arc<RwLock<AppConfig>>,

    /// Relay counters, updated by connection actors and HTTP middleware
    pub metrics: Arc<RwLock<RelayMetrics>>,

    /// Live client connections, swept by the reaper
    pub registry: SessionRegistry,

    /// Provider connector selected at process start
    pub connector: Arc<dyn SttConnector>,

    /// When the server started
    pub start_time: Instant,
}

/// Counters describing relay traffic since server start.
#[derive(Debug, Default, Clone)]
pub struct RelayMetrics {
    /// Total HTTP requests processed (health/config surface, WS upgrades)
    pub http_requests: u64,

    /// HTTP requests that ended in a 4xx/5xx
    pub http_errors: u64,

    /// Currently connected clients
    pub active_connections: u32,

    /// Provider sessions successfully opened
    pub sessions_opened: u64,

    /// Audio frames admitted by the throttle and handed to the connector
    pub frames_forwarded: u64,

    /// Audio frames dropped by throttle admission (expected under overload,
    /// not an error)
    pub frames_throttled: u64,

    /// Partial transcripts delivered to clients
    pub partial_transcripts: u64,

    /// Final transcripts delivered to clients
    pub final_transcripts: u64,

    /// Provider open failures and mid-stream provider errors
    pub provider_failures: u64,

    /// Connections evicted by the reaper
    pub evictions: u64,
}

impl AppState {
    pub fn new(config: AppConfig, connector: Arc<dyn SttConnector>) -> Self {
        Self {
            config: Arc::new(RwLock::new(config)),
            metrics: Arc::new(RwLock::new(RelayMetrics::default())),
            registry: SessionRegistry::new(),
            connector,
            start_time: Instant::now(),
        }
    }

    /// Copy of the current configuration; cloning releases the lock
    /// immediately.
    pub fn get_config(&self) -> AppConfig {
        self.config.read().unwrap().clone()
    }

    pub fn record_http_request(&self, is_error: bool) {
        let mut metrics = self.metrics.write().unwrap();
        metrics.http_requests += 1;
        if is_error {
            metrics.http_errors += 1;
        }
    }

    pub fn connection_opened(&self) {
        self.metrics.write().unwrap().active_connections += 1;
    }

    pub fn connection_closed(&self) {
        let mut metrics = self.metrics.write().unwrap();
        if metrics.active_connections > 0 {
            metrics.active_connections -= 1;
        }
    }

    pub fn record_session_opened(&self) {
        self.metrics.write().unwrap().sessions_opened += 1;
    }

    pub fn record_frame_forwarded(&self) {
        self.metrics.write().unwrap().frames_forwarded += 1;
    }

    pub fn record_frame_throttled(&self) {
        self.metrics.write().unwrap().frames_throttled += 1;
    }

    pub fn record_transcript(&self, kind: TranscriptKind) {
        let mut metrics = self.metrics.write().unwrap();
        match kind {
            TranscriptKind::Partial => metrics.partial_transcripts += 1,
            TranscriptKind::Final => metrics.final_transcripts += 1,
        }
    }

    pub fn record_provider_failure(&self) {
        self.metrics.write().unwrap().provider_failures += 1;
    }

    pub fn record_eviction(&self) {
        self.metrics.write().unwrap().evictions += 1;
    }

    /// Consistent copy of the counters for the metrics endpoint.
    pub fn metrics_snapshot(&self) -> RelayMetrics {
        self.metrics.read().unwrap().clone()
    }

    pub fn uptime_seconds(&self) -> u64 {
        self.start_time.elapsed().as_secs()
    }
}

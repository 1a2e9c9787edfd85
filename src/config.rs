//! # Configuration Management
//!
//! Loads relay configuration from multiple sources:
//! - TOML configuration files (config.toml)
//! - Environment variables (with APP_ prefix)
//! - Default values (built into the code)
//!
//! ## Configuration Priority (highest to lowest):
//! 1. Special-cased environment variables (HOST, PORT, STT_API_KEY)
//! 2. Environment variables (APP_SERVER_HOST, APP_LIMITS_FRAMESPERMINUTE, ...)
//! 3. Configuration file (config.toml)
//! 4. Default values (defined in the Default impl)
//!
//! The throttle cap and idle/session timeouts are deliberately configuration,
//! not constants: the correct values depend on the actual rate limits of the
//! STT provider the deployment points at. The defaults below are the
//! historically used ones (120 frames/min, 5 min idle, 30 min session).

use crate::provider::AudioFormat;

use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::env;
use std::time::Duration;

/// Main application configuration that contains all settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub provider: ProviderConfig,
    pub audio: AudioConfig,
    pub limits: LimitsConfig,
}

/// Server-specific configuration settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

/// Upstream STT provider settings. Credentials are process-wide and read-only
/// after startup — never per-request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderConfig {
    /// Connector selection: "streaming" (real WSS provider) or "mock"
    /// (no-op fallback that accepts audio and emits nothing)
    pub kind: String,

    /// WSS endpoint of the provider's streaming API
    pub endpoint: String,

    /// Static API key sent on the WSS upgrade request
    pub api_key: String,

    /// Upper bound on the provider handshake; a session that has not opened
    /// by then is reported to the client as an upstream failure
    pub connect_timeout_secs: u64,

    /// Optional provider tuning: end-of-utterance confidence threshold,
    /// forwarded once in the initial configuration payload
    pub end_of_utterance_confidence: Option<f64>,
}

impl ProviderConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }
}

/// Fixed audio format for the deployment. Clients and provider both speak raw
/// PCM in this format; the relay never resamples or re-frames.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AudioConfig {
    pub sample_rate: u32,
    pub channels: u16,
    pub bits_per_sample: u16,
    pub encoding: String,
}

impl AudioConfig {
    pub fn to_format(&self) -> AudioFormat {
        AudioFormat {
            sample_rate: self.sample_rate,
            channels: self.channels,
            bits_per_sample: self.bits_per_sample,
            encoding: self.encoding.clone(),
        }
    }
}

/// Throttling and lifecycle budgets.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LimitsConfig {
    /// Audio frames admitted upstream per client per 60-second window;
    /// frames beyond the cap are dropped, not queued
    pub frames_per_minute: u32,

    /// A connection with no client frames for this long is evicted
    pub idle_timeout_secs: u64,

    /// A connection older than this is evicted regardless of activity
    pub session_timeout_secs: u64,

    /// How often the reaper sweeps the registry
    pub reaper_interval_secs: u64,
}

impl LimitsConfig {
    pub fn idle_budget(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_secs)
    }

    pub fn session_budget(&self) -> Duration {
        Duration::from_secs(self.session_timeout_secs)
    }

    pub fn reaper_interval(&self) -> Duration {
        Duration::from_secs(self.reaper_interval_secs)
    }
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            server: ServerConfig {
                host: "127.0.0.1".to_string(),
                port: 8080,
            },
            provider: ProviderConfig {
                kind: "mock".to_string(),
                endpoint: "wss://api.example-stt.com/v1/listen".to_string(),
                api_key: String::new(),
                connect_timeout_secs: 10,
                end_of_utterance_confidence: None,
            },
            audio: AudioConfig {
                sample_rate: 16_000,
                channels: 1,
                bits_per_sample: 16,
                encoding: "linear16".to_string(),
            },
            limits: LimitsConfig {
                frames_per_minute: 120,
                idle_timeout_secs: 300,
                session_timeout_secs: 1800,
                reaper_interval_secs: 60,
            },
        }
    }
}

impl AppConfig {
    /// Load configuration from defaults, config.toml and the environment.
    pub fn load() -> Result<Self> {
        let mut settings = config::Config::builder()
            .add_source(config::Config::try_from(&AppConfig::default())?)
            .add_source(config::File::with_name("config").required(false))
            .add_source(config::Environment::with_prefix("APP").separator("_"));

        // Special-cased variables used by deployment platforms and secret
        // stores; these don't follow the APP_ prefix convention
        if let Ok(host) = env::var("HOST") {
            settings = settings.set_override("server.host", host)?;
        }

        if let Ok(port) = env::var("PORT") {
            settings = settings.set_override("server.port", port)?;
        }

        if let Ok(key) = env::var("STT_API_KEY") {
            settings = settings.set_override("provider.api_key", key)?;
        }

        let config = settings.build()?.try_deserialize()?;
        Ok(config)
    }

    /// Validate that the configuration values make sense. Called once after
    /// load and again before any runtime update is accepted.
    pub fn validate(&self) -> Result<()> {
        if self.server.port == 0 {
            return Err(anyhow::anyhow!("Server port cannot be 0"));
        }

        match self.provider.kind.as_str() {
            "mock" => {}
            "streaming" => {
                if self.provider.endpoint.is_empty() {
                    return Err(anyhow::anyhow!(
                        "Provider endpoint is required for the streaming connector"
                    ));
                }
                if !self.provider.endpoint.starts_with("ws") {
                    return Err(anyhow::anyhow!(
                        "Provider endpoint must be a ws:// or wss:// URL"
                    ));
                }
                if self.provider.api_key.is_empty() {
                    return Err(anyhow::anyhow!(
                        "Provider API key is required for the streaming connector \
                         (set STT_API_KEY)"
                    ));
                }
            }
            other => {
                return Err(anyhow::anyhow!("Unknown provider kind: {}", other));
            }
        }

        if self.provider.connect_timeout_secs == 0 {
            return Err(anyhow::anyhow!("Provider connect timeout must be greater than 0"));
        }

        if self.audio.sample_rate == 0 {
            return Err(anyhow::anyhow!("Audio sample rate must be greater than 0"));
        }

        if self.audio.bits_per_sample != 16 {
            return Err(anyhow::anyhow!(
                "Only 16-bit PCM is supported (got {} bits)",
                self.audio.bits_per_sample
            ));
        }

        if self.limits.frames_per_minute == 0 {
            return Err(anyhow::anyhow!("Frame cap must be greater than 0"));
        }

        if self.limits.idle_timeout_secs == 0 || self.limits.session_timeout_secs == 0 {
            return Err(anyhow::anyhow!("Idle and session timeouts must be greater than 0"));
        }

        if self.limits.reaper_interval_secs == 0 {
            return Err(anyhow::anyhow!("Reaper interval must be greater than 0"));
        }

        Ok(())
    }

    /// Apply a partial update from a JSON body (runtime tuning endpoint).
    ///
    /// Only the tunable budgets and provider tuning can change at runtime;
    /// server binding, credentials and audio format are fixed per process.
    /// Existing connections keep their admission cap; the reaper picks up new
    /// budgets on its next sweep.
    pub fn update_from_json(&mut self, json_str: &str) -> Result<()> {
        let partial: serde_json::Value = serde_json::from_str(json_str)?;

        if let Some(limits) = partial.get("limits") {
            if let Some(cap) = limits.get("frames_per_minute").and_then(|v| v.as_u64()) {
                self.limits.frames_per_minute = cap as u32;
            }
            if let Some(idle) = limits.get("idle_timeout_secs").and_then(|v| v.as_u64()) {
                self.limits.idle_timeout_secs = idle;
            }
            if let Some(session) = limits.get("session_timeout_secs").and_then(|v| v.as_u64()) {
                self.limits.session_timeout_secs = session;
            }
            if let Some(period) = limits.get("reaper_interval_secs").and_then(|v| v.as_u64()) {
                self.limits.reaper_interval_secs = period;
            }
        }

        if let Some(provider) = partial.get("provider") {
            if let Some(threshold) = provider
                .get("end_of_utterance_confidence")
                .and_then(|v| v.as_f64())
            {
                self.provider.end_of_utterance_confidence = Some(threshold);
            }
        }

        self.validate()?;
        Ok(())
    }
}

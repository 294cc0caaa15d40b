//! # Configuration Management
//!
//! Loads application configuration from multiple sources:
//! - TOML configuration files (config.toml)
//! - Environment variables (with APP_ prefix)
//! - Default values (built into the code)
//!
//! ## Configuration Priority (highest to lowest):
//! 1. Environment variables (APP_SERVER_HOST, GEMINI_API_KEY, etc.)
//! 2. Configuration file (config.toml)
//! 3. Default values (defined in the Default impl)
//!
//! The backend API key is deliberately env-only (`GEMINI_API_KEY`): it never
//! appears in config.toml, GET /config responses, or runtime updates.

use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::env;

/// Main application configuration that contains all settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub backend: BackendConfig,
    pub audio: AudioConfig,
    pub performance: PerformanceConfig,
}

/// Server-specific configuration settings.
///
/// ## Common values:
/// - `host = "127.0.0.1"`: Only accept connections from localhost (development)
/// - `host = "0.0.0.0"`: Accept connections from any IP address (production)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

/// AI speech backend connection settings.
///
/// ## Fields:
/// - `url`: the backend's bidirectional streaming WebSocket endpoint
/// - `api_key`: credential appended to the connection URL (env-only)
/// - `model`: backend model identifier sent in the setup message
/// - `system_instruction`: persona/behaviour prompt sent in the setup message
/// - `connect_timeout_secs`: how long the setup handshake may take before the
///   session is failed with a handshake error
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackendConfig {
    pub url: String,
    #[serde(skip_serializing)]
    pub api_key: Option<String>,
    pub model: String,
    pub system_instruction: String,
    pub connect_timeout_secs: u64,
}

/// Audio format contract between client, relay and backend.
///
/// ## Fields:
/// - `input_sample_rate`: rate the backend expects for inbound speech (16 kHz)
/// - `output_sample_rate`: rate of the backend's synthesized speech (24 kHz);
///   the relay forwards those bytes untouched, the playback decoder needs the
///   rate to interpret raw PCM
/// - `channels` / `bit_depth`: mono, 16-bit signed PCM on both legs
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AudioConfig {
    pub input_sample_rate: u32,
    pub output_sample_rate: u32,
    pub channels: u8,
    pub bit_depth: u8,
}

/// Performance tuning configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PerformanceConfig {
    /// Maximum number of concurrent relay sessions (one per client socket)
    pub max_concurrent_sessions: usize,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            server: ServerConfig {
                host: "127.0.0.1".to_string(),
                port: 8082,
            },
            backend: BackendConfig {
                url: "wss://generativelanguage.googleapis.com/ws/google.ai.generativelanguage.v1alpha.GenerativeService.BidiGenerateContent".to_string(),
                api_key: None,
                model: "models/gemini-2.0-flash-exp".to_string(),
                system_instruction: "You are a helpful AI assistant for a guided virtual tour. \
                                     Respond naturally and conversationally in a friendly tone. \
                                     Keep responses concise and engaging."
                    .to_string(),
                connect_timeout_secs: 10,
            },
            audio: AudioConfig {
                input_sample_rate: 16_000,
                output_sample_rate: 24_000,
                channels: 1,
                bit_depth: 16,
            },
            performance: PerformanceConfig {
                max_concurrent_sessions: 10,
            },
        }
    }
}

impl AppConfig {
    /// Load configuration from multiple sources in priority order.
    ///
    /// ## Loading process:
    /// 1. Start with built-in defaults
    /// 2. Override with values from config.toml (if it exists)
    /// 3. Override with environment variables prefixed with APP_
    /// 4. Handle special cases: HOST and PORT (deployment platforms) and
    ///    GEMINI_API_KEY (the backend credential is env-only)
    pub fn load() -> Result<Self> {
        let mut settings = config::Config::builder()
            .add_source(config::Config::try_from(&AppConfig::default())?)
            .add_source(config::File::with_name("config").required(false))
            .add_source(config::Environment::with_prefix("APP").separator("_"));

        // Deployment platforms commonly inject these without the APP_ prefix.
        if let Ok(host) = env::var("HOST") {
            settings = settings.set_override("server.host", host)?;
        }

        if let Ok(port) = env::var("PORT") {
            settings = settings.set_override("server.port", port)?;
        }

        let mut config: AppConfig = settings.build()?.try_deserialize()?;

        if let Ok(key) = env::var("GEMINI_API_KEY") {
            config.backend.api_key = Some(key);
        }

        Ok(config)
    }

    /// Validate that the configuration values make sense.
    ///
    /// Catching configuration errors at startup prevents runtime failures
    /// with clear messages about what's wrong.
    pub fn validate(&self) -> Result<()> {
        if self.server.port == 0 {
            return Err(anyhow::anyhow!("Server port cannot be 0"));
        }

        if self.backend.url.is_empty() {
            return Err(anyhow::anyhow!("Backend URL cannot be empty"));
        }

        if !self.backend.url.starts_with("ws://") && !self.backend.url.starts_with("wss://") {
            return Err(anyhow::anyhow!(
                "Backend URL must be a ws:// or wss:// endpoint"
            ));
        }

        if self.backend.connect_timeout_secs == 0 {
            return Err(anyhow::anyhow!("Backend connect timeout must be at least 1s"));
        }

        if self.audio.input_sample_rate == 0 || self.audio.output_sample_rate == 0 {
            return Err(anyhow::anyhow!("Audio sample rates must be greater than 0"));
        }

        if self.audio.channels == 0 {
            return Err(anyhow::anyhow!("Audio channel count must be greater than 0"));
        }

        if self.audio.bit_depth != 16 {
            return Err(anyhow::anyhow!(
                "Only 16-bit PCM is supported on the backend leg"
            ));
        }

        if self.performance.max_concurrent_sessions == 0 {
            return Err(anyhow::anyhow!("Max concurrent sessions must be greater than 0"));
        }

        Ok(())
    }

    /// Update configuration from a JSON string (used for runtime config updates).
    ///
    /// ## Partial updates:
    /// Only the provided fields change; for example `{"server": {"port": 9000}}`
    /// updates nothing but the port. The backend API key cannot be set this
    /// way. The result is re-validated before it is accepted.
    pub fn update_from_json(&mut self, json_str: &str) -> Result<()> {
        let partial_config: serde_json::Value = serde_json::from_str(json_str)?;

        if let Some(server) = partial_config.get("server") {
            if let Some(host) = server.get("host").and_then(|v| v.as_str()) {
                self.server.host = host.to_string();
            }
            if let Some(port) = server.get("port").and_then(|v| v.as_u64()) {
                self.server.port = port as u16;
            }
        }

        if let Some(backend) = partial_config.get("backend") {
            if let Some(url) = backend.get("url").and_then(|v| v.as_str()) {
                self.backend.url = url.to_string();
            }
            if let Some(model) = backend.get("model").and_then(|v| v.as_str()) {
                self.backend.model = model.to_string();
            }
            if let Some(instruction) = backend.get("system_instruction").and_then(|v| v.as_str()) {
                self.backend.system_instruction = instruction.to_string();
            }
            if let Some(timeout) = backend.get("connect_timeout_secs").and_then(|v| v.as_u64()) {
                self.backend.connect_timeout_secs = timeout;
            }
        }

        if let Some(audio) = partial_config.get("audio") {
            if let Some(rate) = audio.get("input_sample_rate").and_then(|v| v.as_u64()) {
                self.audio.input_sample_rate = rate as u32;
            }
            if let Some(rate) = audio.get("output_sample_rate").and_then(|v| v.as_u64()) {
                self.audio.output_sample_rate = rate as u32;
            }
        }

        if let Some(performance) = partial_config.get("performance") {
            if let Some(sessions) = performance
                .get("max_concurrent_sessions")
                .and_then(|v| v.as_u64())
            {
                self.performance.max_concurrent_sessions = sessions as usize;
            }
        }

        self.validate()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = AppConfig::default();
        assert_eq!(config.server.host, "127.0.0.1");
        assert_eq!(config.server.port, 8082);
        assert_eq!(config.audio.input_sample_rate, 16_000);
        assert_eq!(config.audio.output_sample_rate, 24_000);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_validation() {
        let mut config = AppConfig::default();
        config.server.port = 0;
        assert!(config.validate().is_err());

        let mut config = AppConfig::default();
        config.backend.url = "http://not-a-websocket".to_string();
        assert!(config.validate().is_err());

        let mut config = AppConfig::default();
        config.audio.bit_depth = 24;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_config_update() {
        let mut config = AppConfig::default();
        let json = r#"{"server": {"port": 9090}, "backend": {"model": "models/other"}}"#;
        assert!(config.update_from_json(json).is_ok());
        assert_eq!(config.server.port, 9090);
        assert_eq!(config.backend.model, "models/other");
        // Other fields should remain unchanged
        assert_eq!(config.server.host, "127.0.0.1");
        assert_eq!(config.audio.input_sample_rate, 16_000);
    }

    #[test]
    fn test_config_update_rejects_invalid() {
        let mut config = AppConfig::default();
        let json = r#"{"performance": {"max_concurrent_sessions": 0}}"#;
        assert!(config.update_from_json(json).is_err());
    }

    #[test]
    fn test_api_key_never_serialized() {
        let mut config = AppConfig::default();
        config.backend.api_key = Some("secret".to_string());
        let json = serde_json::to_string(&config).unwrap();
        assert!(!json.contains("secret"));
    }
}

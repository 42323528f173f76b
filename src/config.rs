//! # Configuration Management
//!
//! This module handles loading and managing gateway configuration from multiple sources:
//! - TOML configuration files (config.toml)
//! - Environment variables (with APP_ prefix)
//! - Default values (built into the code)
//!
//! ## Key Rust Concepts Used:
//! - **Serde**: Converts between these structs and TOML, JSON and environment values
//! - **Nested structs**: One struct per configuration section
//! - **Result<T, E>**: Loading and validation report problems instead of panicking
//!
//! ## Configuration Priority (highest to lowest):
//! 1. Environment variables (APP_SERVER__PORT, APP_AUDIO__SAMPLE_RATE, etc.)
//! 2. Configuration file (config.toml)
//! 3. Default values (defined in the Default impl)

use crate::audio::processor::{AudioEncoding, AudioFormat};
use crate::speech::VoiceGender;
use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::env;

/// Recognizer backends that can be selected with `recognition.backend`.
pub const KNOWN_RECOGNITION_BACKENDS: &[&str] = &["mock"];

/// Main gateway configuration.
///
/// ## Why separate config structs:
/// Each section maps to one concern (network, audio format, recognizer,
/// synthesizer, authentication, limits) and to one `[section]` in config.toml.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub audio: AudioConfig,
    pub recognition: RecognitionSettings,
    pub synthesis: SynthesisSettings,
    pub auth: AuthConfig,
    pub performance: PerformanceConfig,
}

/// Server-specific configuration settings.
///
/// ## Common values:
/// - `host = "127.0.0.1"`: Only accept connections from localhost (development)
/// - `host = "0.0.0.0"`: Accept connections from any IP address (production)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

/// Connection-wide audio format and windowing.
///
/// ## Fields:
/// - `encoding`: `mulaw` (G.711 µ-law, 1 byte/sample) or `linear16` (16-bit LE PCM)
/// - `window_duration_ms`: audio duration after which a recognition window rotates
/// - `silence_threshold`: mean squared normalised amplitude below which a chunk counts as silent
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AudioConfig {
    pub encoding: AudioEncoding,
    pub sample_rate: u32,
    pub channels: u8,
    pub language_code: String,
    pub window_duration_ms: u32,
    pub silence_threshold: f64,
}

impl AudioConfig {
    pub fn format(&self) -> AudioFormat {
        AudioFormat::new(self.encoding, self.sample_rate, self.channels)
    }

    /// Window boundary in bytes (40 000 for 5 s of 8 kHz µ-law).
    pub fn window_threshold_bytes(&self) -> usize {
        self.format().window_threshold_bytes(self.window_duration_ms)
    }
}

/// Streaming recognizer settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecognitionSettings {
    /// Backend name; only "mock" is built in
    pub backend: String,
    /// How much audio the mock recognizer needs before it produces a
    /// transcript; must be shorter than a window
    pub mock_transcript_after_ms: u32,
}

/// Speech synthesis settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SynthesisSettings {
    pub language_code: String,
    pub voice_gender: VoiceGender,
    pub encoding: AudioEncoding,
    /// Length of the placeholder audio produced by the silence synthesizer
    pub silence_duration_ms: u32,
}

/// Upgrade authentication.
///
/// Keys can be supplied from the environment as a comma separated list:
/// `APP_AUTH__API_KEYS=key-one,key-two`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuthConfig {
    pub enabled: bool,
    pub api_keys: Vec<String>,
}

/// Limits and connection timing.
///
/// ## Tuning guidelines:
/// - `heartbeat_interval_secs` must stay below `client_timeout_secs`, otherwise
///   healthy clients would be dropped between two pings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PerformanceConfig {
    pub max_concurrent_sessions: usize,
    pub heartbeat_interval_secs: u64,
    pub client_timeout_secs: u64,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            server: ServerConfig {
                host: "127.0.0.1".to_string(),
                port: 8080,
            },
            audio: AudioConfig {
                encoding: AudioEncoding::Mulaw,
                sample_rate: 8000,
                channels: 1,
                language_code: "en-US".to_string(),
                window_duration_ms: 5000,
                silence_threshold: 0.0001,
            },
            recognition: RecognitionSettings {
                backend: "mock".to_string(),
                mock_transcript_after_ms: 2000,
            },
            synthesis: SynthesisSettings {
                language_code: "en-US".to_string(),
                voice_gender: VoiceGender::Neutral,
                encoding: AudioEncoding::Mulaw,
                silence_duration_ms: 5000,
            },
            auth: AuthConfig {
                enabled: false,
                api_keys: Vec::new(),
            },
            performance: PerformanceConfig {
                max_concurrent_sessions: 100,
                heartbeat_interval_secs: 30,
                client_timeout_secs: 60,
            },
        }
    }
}

impl AppConfig {
    /// Load configuration from multiple sources in priority order.
    ///
    /// ## Configuration Loading Process:
    /// 1. Start with built-in defaults
    /// 2. Override with values from config.toml (if it exists)
    /// 3. Override with environment variables prefixed with APP_
    /// 4. Handle special cases for HOST and PORT environment variables
    ///
    /// ## Environment Variable Examples:
    /// - `APP_SERVER__HOST=0.0.0.0`: Override server host
    /// - `APP_AUDIO__ENCODING=linear16`: Switch the connection audio format
    /// - `APP_AUTH__ENABLED=true`: Turn on API key checks
    /// - `PORT=3000`: Special case for deployment platforms
    ///
    /// Section names contain no underscores but field names do, so nesting
    /// uses a double underscore.
    pub fn load() -> Result<Self> {
        let mut settings = config::Config::builder()
            .add_source(config::Config::try_from(&AppConfig::default())?)
            .add_source(config::File::with_name("config").required(false))
            .add_source(
                config::Environment::with_prefix("APP")
                    .prefix_separator("_")
                    .separator("__")
                    .try_parsing(true)
                    .list_separator(",")
                    .with_list_parse_key("auth.api_keys"),
            );

        if let Ok(host) = env::var("HOST") {
            settings = settings.set_override("server.host", host)?;
        }

        if let Ok(port) = env::var("PORT") {
            settings = settings.set_override("server.port", port)?;
        }

        let config = settings.build()?.try_deserialize()?;
        Ok(config)
    }

    /// Validate that the configuration values make sense.
    ///
    /// ## What this checks:
    /// - Server port is not 0
    /// - Audio format and window duration are non-zero
    /// - Silence threshold is a finite, non-negative number
    /// - The recognizer backend is one the gateway knows how to build
    /// - Authentication, when enabled, has at least one key
    /// - Heartbeats fire more often than the client timeout
    pub fn validate(&self) -> Result<()> {
        if self.server.port == 0 {
            return Err(anyhow::anyhow!("Server port cannot be 0"));
        }

        if self.audio.sample_rate == 0 {
            return Err(anyhow::anyhow!("Audio sample rate must be greater than 0"));
        }

        if self.audio.channels == 0 {
            return Err(anyhow::anyhow!("Audio channel count must be greater than 0"));
        }

        if self.audio.window_duration_ms == 0 {
            return Err(anyhow::anyhow!("Window duration must be greater than 0"));
        }

        if !self.audio.silence_threshold.is_finite() || self.audio.silence_threshold < 0.0 {
            return Err(anyhow::anyhow!(
                "Silence threshold must be a non-negative number, got {}",
                self.audio.silence_threshold
            ));
        }

        if !KNOWN_RECOGNITION_BACKENDS.contains(&self.recognition.backend.as_str()) {
            return Err(anyhow::anyhow!(
                "Unknown recognition backend '{}' (available: {})",
                self.recognition.backend,
                KNOWN_RECOGNITION_BACKENDS.join(", ")
            ));
        }

        if self.recognition.backend == "mock"
            && self.recognition.mock_transcript_after_ms >= self.audio.window_duration_ms
        {
            return Err(anyhow::anyhow!(
                "Mock transcript delay ({} ms) must be shorter than the window duration ({} ms)",
                self.recognition.mock_transcript_after_ms,
                self.audio.window_duration_ms
            ));
        }

        if self.auth.enabled && self.auth.api_keys.iter().all(|k| k.trim().is_empty()) {
            return Err(anyhow::anyhow!(
                "Authentication is enabled but no API keys are configured"
            ));
        }

        if self.performance.max_concurrent_sessions == 0 {
            return Err(anyhow::anyhow!("Max concurrent sessions must be greater than 0"));
        }

        if self.performance.heartbeat_interval_secs == 0
            || self.performance.heartbeat_interval_secs >= self.performance.client_timeout_secs
        {
            return Err(anyhow::anyhow!(
                "Heartbeat interval ({}s) must be non-zero and shorter than the client timeout ({}s)",
                self.performance.heartbeat_interval_secs,
                self.performance.client_timeout_secs
            ));
        }

        Ok(())
    }

    /// Update configuration from a JSON string (used for runtime config updates).
    ///
    /// ## What this does:
    /// 1. Parse the JSON string into a generic value
    /// 2. Merge it section by section over the current configuration
    /// 3. Validate the merged result
    /// 4. Apply it only if validation passed
    ///
    /// ## Partial updates:
    /// Send just `{"audio": {"window_duration_ms": 3000}}` to change only the
    /// window length. Unknown sections and fields are ignored.
    pub fn update_from_json(&mut self, json_str: &str) -> Result<()> {
        let partial: serde_json::Value = serde_json::from_str(json_str)?;
        if !partial.is_object() {
            return Err(anyhow::anyhow!("Configuration update must be a JSON object"));
        }

        let mut merged = serde_json::to_value(&*self)?;
        merge_json(&mut merged, &partial);

        let candidate: AppConfig = serde_json::from_value(merged)?;
        candidate.validate()?;
        *self = candidate;
        Ok(())
    }
}

/// Recursively overlay `patch` onto `base`, keeping only keys `base` already has.
fn merge_json(base: &mut serde_json::Value, patch: &serde_json::Value) {
    match (base, patch) {
        (serde_json::Value::Object(base), serde_json::Value::Object(patch)) => {
            for (key, value) in patch {
                if let Some(existing) = base.get_mut(key) {
                    merge_json(existing, value);
                }
            }
        }
        (base, patch) => *base = patch.clone(),
    }
}

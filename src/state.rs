//! # Application State Management
//!
//! Shared state handed to every HTTP handler and every connection actor.
//!
//! ## Key Rust Concepts:
//!
//! ### Arc (Atomically Reference Counted)
//! - **Purpose**: Lets every worker thread hold the same registry and configuration
//! - **Memory safety**: The data is freed when the last clone is dropped
//!
//! ### parking_lot::RwLock
//! - **Purpose**: Many readers or one writer, like `std::sync::RwLock`
//! - **No poisoning**: `read()`/`write()` return the guard directly, so there
//!   is no `unwrap()` on every access
//!
//! ## What lives here:
//! - Runtime configuration (updatable through the config API)
//! - The `ConnectionRegistry` that owns all live sessions
//! - The upgrade `Authenticator`, rebuilt when auth settings change
//! - HTTP request metrics collected by the metrics middleware

use crate::audio::session::{SessionBackends, SessionSettings};
use crate::auth::{build_authenticator, Authenticator};
use crate::config::AppConfig;
use crate::registry::ConnectionRegistry;
use crate::speech::{build_speech_backend, build_synthesis_backend};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

#[derive(Clone)]
pub struct AppState {
    /// Gateway configuration (can be updated at runtime)
    pub config: Arc<RwLock<AppConfig>>,

    /// Live connections and their sessions
    pub registry: Arc<ConnectionRegistry>,

    authenticator: Arc<RwLock<Arc<dyn Authenticator>>>,

    /// HTTP metrics, updated by every request
    pub metrics: Arc<RwLock<AppMetrics>>,

    /// When the server started
    pub start_time: Instant,
}

/// HTTP request metrics.
///
/// Session counts are not tracked here; the registry is the single source
/// of truth for live sessions.
#[derive(Debug, Default, Clone)]
pub struct AppMetrics {
    pub request_count: u64,
    pub error_count: u64,
    /// Key: endpoint pattern (e.g., "GET /api/v1/sessions")
    pub endpoint_metrics: HashMap<String, EndpointMetric>,
}

#[derive(Debug, Default, Clone)]
pub struct EndpointMetric {
    pub request_count: u64,
    pub total_duration_ms: u64,
    pub error_count: u64,
}

impl AppState {
    /// Build the state from configuration, constructing the speech backends.
    ///
    /// ## Errors:
    /// Fails when the configured recognizer backend cannot be built. This is
    /// fatal at startup.
    pub fn from_config(config: AppConfig) -> anyhow::Result<Self> {
        let backends = SessionBackends {
            speech: build_speech_backend(&config)?,
            synthesis: build_synthesis_backend(&config),
        };
        let registry = Arc::new(ConnectionRegistry::new(
            SessionSettings::from_config(&config),
            backends,
        ));
        let authenticator = build_authenticator(&config.auth);
        Ok(Self::new(config, registry, authenticator))
    }

    pub fn new(
        config: AppConfig,
        registry: Arc<ConnectionRegistry>,
        authenticator: Arc<dyn Authenticator>,
    ) -> Self {
        Self {
            config: Arc::new(RwLock::new(config)),
            registry,
            authenticator: Arc::new(RwLock::new(authenticator)),
            metrics: Arc::new(RwLock::new(AppMetrics::default())),
            start_time: Instant::now(),
        }
    }

    /// Get a copy of the current configuration.
    ///
    /// Cloning releases the lock immediately, so other threads aren't blocked.
    pub fn get_config(&self) -> AppConfig {
        self.config.read().clone()
    }

    pub fn authenticator(&self) -> Arc<dyn Authenticator> {
        self.authenticator.read().clone()
    }

    /// Validate and apply a new configuration.
    ///
    /// ## Side effects:
    /// - Sessions created afterwards use the new audio/recognition/synthesis settings
    /// - The authenticator is rebuilt from the new `auth` section
    /// - Live sessions keep the settings they were created with
    pub fn update_config(&self, new_config: AppConfig) -> anyhow::Result<()> {
        new_config.validate()?;

        self.registry
            .update_settings(SessionSettings::from_config(&new_config));
        *self.authenticator.write() = build_authenticator(&new_config.auth);
        *self.config.write() = new_config;
        Ok(())
    }

    pub fn increment_request_count(&self) {
        self.metrics.write().request_count += 1;
    }

    pub fn increment_error_count(&self) {
        self.metrics.write().error_count += 1;
    }

    /// Record detailed metrics for a specific endpoint.
    ///
    /// The first time an endpoint is seen a zeroed `EndpointMetric` is created.
    pub fn record_endpoint_request(&self, endpoint: &str, duration_ms: u64, is_error: bool) {
        let mut metrics = self.metrics.write();
        let endpoint_metric = metrics
            .endpoint_metrics
            .entry(endpoint.to_string())
            .or_default();

        endpoint_metric.request_count += 1;
        endpoint_metric.total_duration_ms += duration_ms;
        if is_error {
            endpoint_metric.error_count += 1;
        }
    }

    /// Snapshot of current metrics, cloned so no lock is held while serializing.
    pub fn get_metrics_snapshot(&self) -> AppMetrics {
        self.metrics.read().clone()
    }

    pub fn get_uptime_seconds(&self) -> u64 {
        self.start_time.elapsed().as_secs()
    }
}

impl AppMetrics {
    pub fn error_rate(&self) -> f64 {
        if self.request_count > 0 {
            self.error_count as f64 / self.request_count as f64
        } else {
            0.0
        }
    }
}

impl EndpointMetric {
    pub fn average_duration_ms(&self) -> f64 {
        if self.request_count > 0 {
            self.total_duration_ms as f64 / self.request_count as f64
        } else {
            0.0
        }
    }

    /// Error rate between 0.0 (no errors) and 1.0 (every request failed).
    pub fn error_rate(&self) -> f64 {
        if self.request_count > 0 {
            self.error_count as f64 / self.request_count as f64
        } else {
            0.0
        }
    }
}

//! # Application State Management
//!
//! Shared state accessed by HTTP handlers, the WebSocket actors and the
//! middleware simultaneously.
//!
//! ## Arc<RwLock<T>> Pattern
//! - **Arc**: multiple ownership (every handler and actor holds a reference)
//! - **RwLock**: multiple readers OR one writer at a time
//! - Reads (config lookups, metric snapshots) are frequent and cheap;
//!   writes (counter bumps, runtime config updates) hold the lock briefly.
//!
//! Relay counters live here rather than in the session manager because they
//! outlive individual sessions and feed the /metrics endpoint.

use crate::config::AppConfig;
use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::Instant;

/// The main application state shared across all request handlers and actors.
#[derive(Debug, Clone)]
pub struct AppState {
    /// Application configuration (can be updated at runtime)
    pub config: Arc<RwLock<AppConfig>>,

    /// Relay and HTTP metrics (constantly updated)
    pub metrics: Arc<RwLock<AppMetrics>>,

    /// When the server started (never changes)
    pub start_time: Instant,
}

/// Metrics collected across all HTTP requests and relay sessions.
#[derive(Debug, Default)]
pub struct AppMetrics {
    /// Total number of HTTP requests processed since server start
    pub request_count: u64,

    /// Total number of HTTP errors encountered since server start
    pub error_count: u64,

    /// Current number of live relay sessions (one per client socket)
    pub active_sessions: u32,

    /// Total relay sessions accepted since server start
    pub sessions_started: u64,

    /// Inbound binary audio frames received from clients
    pub audio_frames_in: u64,

    /// Outbound binary audio frames relayed from the backend
    pub audio_frames_out: u64,

    /// Inbound chunks dropped (decode failure or no turn in flight)
    pub chunks_dropped: u64,

    /// Detailed metrics for each API endpoint (URL path)
    pub endpoint_metrics: HashMap<String, EndpointMetric>,
}

/// Detailed performance metrics for a specific API endpoint.
#[derive(Debug, Default, Clone)]
pub struct EndpointMetric {
    /// Number of requests to this specific endpoint
    pub request_count: u64,

    /// Total time spent processing all requests to this endpoint (milliseconds)
    pub total_duration_ms: u64,

    /// Number of errors that occurred for this endpoint
    pub error_count: u64,
}

impl AppState {
    /// Create a new AppState with the given configuration.
    pub fn new(config: AppConfig) -> Self {
        Self {
            config: Arc::new(RwLock::new(config)),
            metrics: Arc::new(RwLock::new(AppMetrics::default())),
            start_time: Instant::now(),
        }
    }

    /// Get a copy of the current configuration.
    ///
    /// Cloning releases the lock immediately, so other threads aren't
    /// blocked; AppConfig is cheap to clone.
    pub fn get_config(&self) -> AppConfig {
        self.config.read().unwrap().clone()
    }

    /// Update the configuration with validation.
    pub fn update_config(&self, new_config: AppConfig) -> Result<(), String> {
        match new_config.validate() {
            Ok(_) => {
                *self.config.write().unwrap() = new_config;
                Ok(())
            }
            Err(e) => Err(e.to_string()),
        }
    }

    /// Increment the total request counter (called by middleware for every request).
    pub fn increment_request_count(&self) {
        let mut metrics = self.metrics.write().unwrap();
        metrics.request_count += 1;
    }

    /// Increment the total error counter (called when any request fails).
    pub fn increment_error_count(&self) {
        let mut metrics = self.metrics.write().unwrap();
        metrics.error_count += 1;
    }

    /// Record detailed metrics for a specific endpoint.
    pub fn record_endpoint_request(&self, endpoint: &str, duration_ms: u64, is_error: bool) {
        let mut metrics = self.metrics.write().unwrap();

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

    /// Record a new relay session (socket accepted).
    pub fn record_session_started(&self) {
        let mut metrics = self.metrics.write().unwrap();
        metrics.sessions_started += 1;
        metrics.active_sessions += 1;
    }

    /// Record a relay session ending.
    ///
    /// Underflow-guarded: u32 would panic on wrap, and a double decrement
    /// must not poison the counter.
    pub fn record_session_closed(&self) {
        let mut metrics = self.metrics.write().unwrap();
        if metrics.active_sessions > 0 {
            metrics.active_sessions -= 1;
        }
    }

    /// Record one inbound binary audio frame.
    pub fn record_audio_frame_in(&self) {
        self.metrics.write().unwrap().audio_frames_in += 1;
    }

    /// Record one outbound binary audio frame.
    pub fn record_audio_frame_out(&self) {
        self.metrics.write().unwrap().audio_frames_out += 1;
    }

    /// Record an inbound chunk that was dropped rather than forwarded.
    pub fn record_chunk_dropped(&self) {
        self.metrics.write().unwrap().chunks_dropped += 1;
    }

    /// Get a snapshot of current metrics (used for the /metrics endpoint).
    ///
    /// Clones the data so the lock isn't held while the HTTP response is
    /// serialized.
    pub fn get_metrics_snapshot(&self) -> AppMetrics {
        let metrics = self.metrics.read().unwrap();
        AppMetrics {
            request_count: metrics.request_count,
            error_count: metrics.error_count,
            active_sessions: metrics.active_sessions,
            sessions_started: metrics.sessions_started,
            audio_frames_in: metrics.audio_frames_in,
            audio_frames_out: metrics.audio_frames_out,
            chunks_dropped: metrics.chunks_dropped,
            endpoint_metrics: metrics.endpoint_metrics.clone(),
        }
    }

    /// Get server uptime in seconds.
    pub fn get_uptime_seconds(&self) -> u64 {
        self.start_time.elapsed().as_secs()
    }
}

impl EndpointMetric {
    /// Average response time for this endpoint in milliseconds.
    pub fn average_duration_ms(&self) -> f64 {
        if self.request_count > 0 {
            self.total_duration_ms as f64 / self.request_count as f64
        } else {
            0.0
        }
    }

    /// Error rate for this endpoint as a fraction (0.0 to 1.0).
    pub fn error_rate(&self) -> f64 {
        if self.request_count > 0 {
            self.error_count as f64 / self.request_count as f64
        } else {
            0.0
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_session_counters() {
        let state = AppState::new(AppConfig::default());
        state.record_session_started();
        state.record_session_started();
        state.record_session_closed();

        let snapshot = state.get_metrics_snapshot();
        assert_eq!(snapshot.sessions_started, 2);
        assert_eq!(snapshot.active_sessions, 1);
    }

    #[test]
    fn test_session_close_underflow_guard() {
        let state = AppState::new(AppConfig::default());
        state.record_session_closed();
        assert_eq!(state.get_metrics_snapshot().active_sessions, 0);
    }

    #[test]
    fn test_endpoint_metrics() {
        let state = AppState::new(AppConfig::default());
        state.record_endpoint_request("GET /health", 10, false);
        state.record_endpoint_request("GET /health", 30, true);

        let snapshot = state.get_metrics_snapshot();
        let metric = snapshot.endpoint_metrics.get("GET /health").unwrap();
        assert_eq!(metric.request_count, 2);
        assert_eq!(metric.error_count, 1);
        assert!((metric.average_duration_ms() - 20.0).abs() < f64::EPSILON);
        assert!((metric.error_rate() - 0.5).abs() < f64::EPSILON);
    }
}

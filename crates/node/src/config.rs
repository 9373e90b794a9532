//! Node configuration loaded from environment variables.

use std::time::Duration;

use event_bus::EventBusConfig;

/// Server configuration with sensible defaults.
///
/// Reads from environment variables:
/// - `HOST`: bind address (default: `"0.0.0.0"`)
/// - `PORT`: listen port (default: `3000`)
/// - `RUST_LOG`: tracing filter directive (default: `"info"`)
/// - `QUEUE_SCHEDULER_MS`: delayed-message promotion interval (default: `500`)
/// - the `EVENT_BUS_*` variables read by [`EventBusConfig::from_env`]
#[derive(Debug, Clone)]
pub struct Config {
    pub host: String,
    pub port: u16,
    pub log_level: String,
    pub queue_scheduler_interval: Duration,
    pub bus: EventBusConfig,
}

impl Config {
    /// Loads configuration from environment variables, falling back to defaults.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            host: std::env::var("HOST").unwrap_or(defaults.host),
            port: std::env::var("PORT")
                .ok()
                .and_then(|p| p.parse().ok())
                .unwrap_or(defaults.port),
            log_level: std::env::var("RUST_LOG").unwrap_or(defaults.log_level),
            queue_scheduler_interval: std::env::var("QUEUE_SCHEDULER_MS")
                .ok()
                .and_then(|ms| ms.parse().ok())
                .filter(|&ms: &u64| ms > 0)
                .map(Duration::from_millis)
                .unwrap_or(defaults.queue_scheduler_interval),
            bus: EventBusConfig::from_env(),
        }
    }

    /// Returns the `"host:port"` bind address string.
    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 3000,
            log_level: "info".to_string(),
            queue_scheduler_interval: Duration::from_millis(500),
            bus: EventBusConfig::default(),
        }
    }
}

//! Event bus configuration loaded from environment variables.

use std::time::Duration;

use crate::retry::RetryPolicy;

/// Event bus settings with defaults.
///
/// Reads from environment variables:
/// - `EVENT_BUS_DEAD_LETTER` (default: `true`)
/// - `EVENT_BUS_MAX_RETRIES` (default: `3`)
/// - `EVENT_BUS_RETRY_DELAY_MS` (default: `1000`)
/// - `EVENT_BUS_BACKOFF_MULTIPLIER` (default: `2.0`)
/// - `EVENT_BUS_MAX_RETRY_DELAY_MS` (default: `30000`)
/// - `EVENT_BUS_RETRY_POLL_MS` (default: `1000`)
/// - `EVENT_BUS_HANDLER_TIMEOUT_MS` (default: `30000`, `0` disables the timeout)
#[derive(Debug, Clone, PartialEq)]
pub struct EventBusConfig {
    pub enable_dead_letter_queue: bool,

    /// Used by subscriptions that do not bring their own policy.
    pub default_retry_policy: RetryPolicy,

    /// How often the retry worker looks for due retries.
    pub retry_poll_interval: Duration,

    pub handler_timeout: Option<Duration>,
}

impl Default for EventBusConfig {
    fn default() -> Self {
        Self {
            enable_dead_letter_queue: true,
            default_retry_policy: RetryPolicy::default(),
            retry_poll_interval: Duration::from_secs(1),
            handler_timeout: Some(Duration::from_secs(30)),
        }
    }
}

impl EventBusConfig {
    /// Loads configuration from environment variables, falling back to defaults.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Builds a configuration from any key lookup. Unparseable values fall
    /// back to the default.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let defaults = Self::default();
        let parse_ms = |key: &str| {
            lookup(key)
                .and_then(|v| v.trim().parse::<u64>().ok())
                .map(Duration::from_millis)
        };

        let default_policy = defaults.default_retry_policy;
        let default_retry_policy = RetryPolicy {
            max_retries: lookup("EVENT_BUS_MAX_RETRIES")
                .and_then(|v| v.trim().parse().ok())
                .unwrap_or(default_policy.max_retries),
            retry_delay: parse_ms("EVENT_BUS_RETRY_DELAY_MS").unwrap_or(default_policy.retry_delay),
            backoff_multiplier: lookup("EVENT_BUS_BACKOFF_MULTIPLIER")
                .and_then(|v| v.trim().parse().ok())
                .unwrap_or(default_policy.backoff_multiplier),
            max_retry_delay: parse_ms("EVENT_BUS_MAX_RETRY_DELAY_MS")
                .unwrap_or(default_policy.max_retry_delay),
        };

        let handler_timeout = match parse_ms("EVENT_BUS_HANDLER_TIMEOUT_MS") {
            Some(Duration::ZERO) => None,
            Some(timeout) => Some(timeout),
            None => defaults.handler_timeout,
        };

        Self {
            enable_dead_letter_queue: lookup("EVENT_BUS_DEAD_LETTER")
                .and_then(|v| parse_bool(&v))
                .unwrap_or(defaults.enable_dead_letter_queue),
            default_retry_policy,
            retry_poll_interval: parse_ms("EVENT_BUS_RETRY_POLL_MS")
                .filter(|interval| !interval.is_zero())
                .unwrap_or(defaults.retry_poll_interval),
            handler_timeout,
        }
    }
}

fn parse_bool(value: &str) -> Option<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

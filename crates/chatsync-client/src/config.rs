//! Client configuration loaded from environment variables.
//!
//! Every setting has a default so the client can start against a local
//! server with no configuration at all.

use std::time::Duration;

use chatsync_shared::constants::{
    DEFAULT_API_URL, DEFAULT_EVENT_BUFFER, DEFAULT_HISTORY_PAGE, DEFAULT_RECONNECT_ATTEMPTS,
    DEFAULT_RECONNECT_BASE_SECS, DEFAULT_RECONNECT_MAX_SECS, DEFAULT_REQUEST_TIMEOUT_SECS,
};

/// What the engine does when the push channel drops on its own.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum RetryPolicy {
    /// Stay disconnected until `reconnect` is called.
    #[default]
    Never,
    /// Reopen after an exponentially growing delay.
    Backoff {
        base: Duration,
        max: Duration,
        max_attempts: u32,
    },
}

impl RetryPolicy {
    pub fn backoff() -> Self {
        RetryPolicy::Backoff {
            base: Duration::from_secs(DEFAULT_RECONNECT_BASE_SECS),
            max: Duration::from_secs(DEFAULT_RECONNECT_MAX_SECS),
            max_attempts: DEFAULT_RECONNECT_ATTEMPTS,
        }
    }

    /// Delay before retry number `attempt` (0-based), or `None` once retries
    /// are exhausted or disabled.
    pub fn delay_for(&self, attempt: u32) -> Option<Duration> {
        match self {
            RetryPolicy::Never => None,
            RetryPolicy::Backoff {
                base,
                max,
                max_attempts,
            } => {
                if attempt >= *max_attempts {
                    return None;
                }
                let factor = 1u32.checked_shl(attempt).unwrap_or(u32::MAX);
                Some(base.saturating_mul(factor).min(*max))
            }
        }
    }
}

#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Base URL of the REST API.
    /// Env: `CHATSYNC_API_URL`
    /// Default: `http://localhost:8080`
    pub api_url: String,

    /// Base URL of the push endpoint.
    /// Env: `CHATSYNC_WS_URL`
    /// Default: derived from `api_url` (`http` → `ws`, `https` → `wss`).
    pub ws_url: String,

    /// Messages per history page.
    /// Env: `CHATSYNC_HISTORY_PAGE`
    /// Default: `50`
    pub history_page_size: u32,

    /// Per-request timeout for REST calls.
    /// Env: `CHATSYNC_REQUEST_TIMEOUT_SECS`
    /// Default: `15`
    pub request_timeout: Duration,

    /// Capacity of the channel, command and observer queues.
    /// Env: `CHATSYNC_EVENT_BUFFER`
    /// Default: `256`
    pub event_buffer: usize,

    /// Env: `CHATSYNC_RETRY` (`never` / `backoff`)
    /// Default: `never`
    pub retry: RetryPolicy,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            api_url: DEFAULT_API_URL.to_string(),
            ws_url: derive_ws_url(DEFAULT_API_URL),
            history_page_size: DEFAULT_HISTORY_PAGE,
            request_timeout: Duration::from_secs(DEFAULT_REQUEST_TIMEOUT_SECS),
            event_buffer: DEFAULT_EVENT_BUFFER,
            retry: RetryPolicy::Never,
        }
    }
}

impl ClientConfig {
    /// Load configuration from environment variables, falling back to defaults.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Same as [`ClientConfig::from_env`] with an arbitrary variable source.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let mut config = Self::default();

        if let Some(url) = lookup("CHATSYNC_API_URL") {
            let url = url.trim_end_matches('/').to_string();
            config.ws_url = derive_ws_url(&url);
            config.api_url = url;
        }

        if let Some(url) = lookup("CHATSYNC_WS_URL") {
            config.ws_url = url.trim_end_matches('/').to_string();
        }

        if let Some(val) = lookup("CHATSYNC_HISTORY_PAGE") {
            match val.parse::<u32>() {
                Ok(n) if n > 0 => config.history_page_size = n,
                _ => tracing::warn!(value = %val, "Invalid CHATSYNC_HISTORY_PAGE, using default"),
            }
        }

        if let Some(val) = lookup("CHATSYNC_REQUEST_TIMEOUT_SECS") {
            match val.parse::<u64>() {
                Ok(n) if n > 0 => config.request_timeout = Duration::from_secs(n),
                _ => tracing::warn!(
                    value = %val,
                    "Invalid CHATSYNC_REQUEST_TIMEOUT_SECS, using default"
                ),
            }
        }

        if let Some(val) = lookup("CHATSYNC_EVENT_BUFFER") {
            match val.parse::<usize>() {
                Ok(n) if n > 0 => config.event_buffer = n,
                _ => tracing::warn!(value = %val, "Invalid CHATSYNC_EVENT_BUFFER, using default"),
            }
        }

        if let Some(val) = lookup("CHATSYNC_RETRY") {
            match val.to_ascii_lowercase().as_str() {
                "never" | "off" | "false" | "0" => config.retry = RetryPolicy::Never,
                "backoff" | "on" | "true" | "1" => config.retry = RetryPolicy::backoff(),
                _ => tracing::warn!(value = %val, "Invalid CHATSYNC_RETRY, using default"),
            }
        }

        config
    }
}

/// Map an HTTP base URL onto the matching WebSocket scheme.
pub fn derive_ws_url(api_url: &str) -> String {
    if let Some(rest) = api_url.strip_prefix("https://") {
        format!("wss://{rest}")
    } else if let Some(rest) = api_url.strip_prefix("http://") {
        format!("ws://{rest}")
    } else {
        api_url.to_string()
    }
}

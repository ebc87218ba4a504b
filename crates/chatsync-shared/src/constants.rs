/// Application name
pub const APP_NAME: &str = "chatsync";

/// Default REST API base URL
pub const DEFAULT_API_URL: &str = "http://localhost:8080";

/// Path of the push endpoint, relative to the WebSocket base URL
pub const PUSH_PATH: &str = "/ws/";

/// Query parameter carrying the bearer token on the push endpoint
pub const PUSH_TOKEN_PARAM: &str = "token";

/// Default number of messages requested per history page
pub const DEFAULT_HISTORY_PAGE: u32 = 50;

/// Default REST request timeout in seconds
pub const DEFAULT_REQUEST_TIMEOUT_SECS: u64 = 15;

/// Default capacity of the engine's internal channels
pub const DEFAULT_EVENT_BUFFER: usize = 256;

/// Reconnect backoff defaults (used only when the backoff policy is enabled)
pub const DEFAULT_RECONNECT_BASE_SECS: u64 = 2;
pub const DEFAULT_RECONNECT_MAX_SECS: u64 = 30;
pub const DEFAULT_RECONNECT_ATTEMPTS: u32 = 10;

//! Application configuration constants
//!
//! Central location for wire endpoints, cursor format, timing and
//! retry boundaries used throughout the store and sync engine.

// ===== Wire Protocol =====

/// Endpoint path for notebook (folder) synchronization
pub const NOTEBOOK_SYNC_PATH: &str = "/annotations/v1/folders/sync";

/// Endpoint path shared by the annotation id probe and full fetch
pub const ANNOTATION_SYNC_PATH: &str = "/annotations/v1/annotations/sync";

/// `syncStatus` hint sent on a first-ever sync so the service does not
/// replay tombstones we never knew about
pub const NOT_DELETED_SYNC_STATUS: &str = "notdeleted";

// ===== Change Cursor =====

/// Version tag leading the cursor's text encoding
pub const TOKEN_FORMAT_VERSION: &str = "1";

/// Settings key under which the cursor is persisted
pub const SYNC_TOKEN_SETTING_KEY: &str = "sync_token";

// ===== Sync Timing =====

/// Pause the service asks clients to observe between sync rounds
pub const DEFAULT_SYNC_GRACE_PERIOD_SECS: u64 = 10;

/// Per-request timeout for the annotation service
pub const DEFAULT_REQUEST_TIMEOUT_SECS: u64 = 30;

// ===== Retry Limits =====

/// Attempts per request, including the first one
pub const DEFAULT_MAX_ATTEMPTS: u32 = 3;

/// Delay before the first retry in milliseconds
pub const DEFAULT_RETRY_INITIAL_DELAY_MS: u64 = 500;

/// Upper bound on a single retry delay in milliseconds
pub const DEFAULT_RETRY_MAX_DELAY_MS: u64 = 10_000;

/// Hard ceiling on configured attempts so a bad settings file cannot
/// stall a round indefinitely
pub const MAX_ALLOWED_ATTEMPTS: u32 = 10;

// ===== Notifications =====

/// Buffered change notifications per subscriber before lagging
pub const NOTIFICATION_CHANNEL_CAPACITY: usize = 256;

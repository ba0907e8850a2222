//! Application-wide constants
//!
//! Centralized location for event names, limits and defaults
//! that are used across multiple modules.

use std::time::Duration;

/// Default REST API base URL
pub const DEFAULT_BASE_URL: &str = "http://127.0.0.1:3000/api";

/// Default wake cooldown per channel label
pub const DEFAULT_WAKE_COOLDOWN_SECS: u64 = 30;

/// Default upper bound for a single wake command run
pub const DEFAULT_WAKE_TIMEOUT_SECS: u64 = 30;

/// Default interval between channel discovery passes
pub const DEFAULT_REFRESH_INTERVAL_SECS: u64 = 60;

/// Default lifetime requested for stream credentials
pub const DEFAULT_TOKEN_TTL_SECS: u64 = 3600;

// Normalization limits
/// Maximum preview length in characters before truncation
pub const PREVIEW_MAX_CHARS: usize = 200;
/// Characters of the preview that take part in the dedup key
pub const DEDUP_PREVIEW_CHARS: usize = 50;
/// Maximum wake message length in characters
pub const WAKE_MESSAGE_MAX_CHARS: usize = 500;
/// Appended to truncated text
pub const ELLIPSIS: &str = "...";
/// Author name used when the payload carries none
pub const UNKNOWN_AUTHOR: &str = "unknown";

/// How long a delivered event blocks identical redeliveries
pub const DEDUP_WINDOW: Duration = Duration::from_secs(5);

// Rate limiting
/// Delay used when a 429 response carries no retry hint
pub const DEFAULT_RATE_LIMIT_DELAY: Duration = Duration::from_secs(5);
/// Upper bound on a server-provided retry hint
pub const MAX_RATE_LIMIT_DELAY: Duration = Duration::from_secs(300);
/// Attempts per request before a rate limit becomes an error
pub const RATE_LIMIT_MAX_ATTEMPTS: usize = 5;

// Shutdown bounds
pub const SHUTDOWN_STEP_TIMEOUT: Duration = Duration::from_secs(2);

// Transport reconnect backoff
pub const RECONNECT_BASE_DELAY: Duration = Duration::from_secs(1);
pub const RECONNECT_MAX_DELAY: Duration = Duration::from_secs(30);

/// Server error code for an expired connection token
pub const TOKEN_EXPIRED_CODE: u32 = 109;

// Event types carried in publication payloads
pub mod events {
    pub const MESSAGE_SENT: &str = "MessageSent";
    pub const MENTION_RECEIVED: &str = "MentionReceived";
    pub const DM_CREATED: &str = "DmCreated";
    pub const DM_MESSAGE_RECEIVED: &str = "DmMessageReceived";
    pub const REACTION_ADDED: &str = "ReactionAdded";
    pub const THREAD_CREATED: &str = "ThreadCreated";

    // Intentionally ignored
    pub const TYPING_STARTED: &str = "TypingStarted";
    pub const TYPING_STOPPED: &str = "TypingStopped";
    pub const MESSAGE_UPDATED: &str = "MessageUpdated";
    pub const MESSAGE_DELETED: &str = "MessageDeleted";
    pub const REACTION_REMOVED: &str = "ReactionRemoved";
    pub const THREAD_UPDATED: &str = "ThreadUpdated";
}

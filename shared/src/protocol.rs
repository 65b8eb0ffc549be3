/// Server-sent event name carrying one log line to a viewer
pub const NEW_LOG_EVENT: &str = "new_log";

/// Short code shape
pub const CODE_LENGTH: usize = 6;
pub const CODE_ALPHABET: &[u8] = b"abcdefghijklmnopqrstuvwxyzABCDEFGHIJKLMNOPQRSTUVWXYZ0123456789";

/// Length of the per-subscription token in webhook callback paths
pub const ROUTE_TOKEN_LENGTH: usize = 20;

/// Plaintext body served for unknown or expired links
pub const INVALID_CODE_MESSAGE: &str = "Invalid or Expired Code!";

/// Path prefixes
pub const VIEW_PREFIX: &str = "/view";
pub const WEBHOOK_PATH: &str = "/webhook";

/// Provider resource for push subscriptions
pub const LOG_STREAMS_RESOURCE: &str = "log-streams";

/// Status the provider answers a successful subscription with
pub const PROVIDER_CREATED_STATUS: u16 = 201;

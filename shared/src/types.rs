use std::collections::BTreeSet;
use std::fmt;
use chrono::{DateTime, Utc};
use serde::{Serialize, Deserialize};

/// A shareable link binding a short code to a provider credential and service.
/// The credential never leaves the daemon, so this type is deliberately not `Serialize`.
#[derive(Clone, PartialEq, Eq)]
pub struct CodeEntry {
    /// Short code, e.g. "ab12CD"
    pub code: String,

    /// Provider API key used to subscribe to the service's logs
    pub credential: String,

    /// Provider identifier of the monitored service, e.g. "srv-abc123"
    pub service_id: String,

    /// When the link was minted
    pub created_at: DateTime<Utc>,

    /// When the link stops resolving; `None` never expires
    pub expires_at: Option<DateTime<Utc>>,
}

impl CodeEntry {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.is_some_and(|at| at <= now)
    }
}

impl fmt::Debug for CodeEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CodeEntry")
            .field("code", &self.code)
            .field("credential", &"<redacted>")
            .field("service_id", &self.service_id)
            .field("created_at", &self.created_at)
            .field("expires_at", &self.expires_at)
            .finish()
    }
}

/// One push subscription registered with the upstream log provider.
/// There is at most one per credential/service pair; every link for that
/// pair shares it.
#[derive(Clone, PartialEq, Eq)]
pub struct StreamSession {
    /// Identifier assigned by the provider
    pub stream_id: String,

    /// Credential that created the subscription, kept for teardown
    pub credential: String,

    pub service_id: String,

    /// Token in the callback path the provider pushes to
    pub route: String,

    /// Links whose viewers receive this stream's lines
    pub codes: BTreeSet<String>,

    pub created_at: DateTime<Utc>,
}

impl StreamSession {
    /// Whether this session subscribes the given pair.
    pub fn serves(&self, credential: &str, service_id: &str) -> bool {
        self.credential == credential && self.service_id == service_id
    }
}

impl fmt::Debug for StreamSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StreamSession")
            .field("stream_id", &self.stream_id)
            .field("credential", &"<redacted>")
            .field("service_id", &self.service_id)
            .field("route", &self.route)
            .field("codes", &self.codes)
            .field("created_at", &self.created_at)
            .finish()
    }
}

/// A log record as pushed by the provider's webhook, after normalization.
/// Missing fields read as empty strings.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProviderLogRecord {
    #[serde(default)]
    pub message: String,

    #[serde(default)]
    pub timestamp: String,
}

/// A log line as delivered to viewers in a `new_log` event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogEvent {
    pub message: String,
    pub time: String,
}

impl From<ProviderLogRecord> for LogEvent {
    fn from(record: ProviderLogRecord) -> Self {
        Self {
            message: record.message,
            time: record.timestamp,
        }
    }
}

use std::sync::Arc;
use serde_json::{Map, Value};
use shared::types::{LogEvent, ProviderLogRecord};
use crate::relay::broadcaster::Broadcaster;

/// Where a webhook delivery should go
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Route<'a> {
    /// Links bound to the subscription the callback belongs to
    Groups(&'a [String]),
    /// No link to route by; the batch has no correlation token
    Untagged,
}

/// Normalize a webhook body into records, one per object element.
/// Missing, null, or non-string fields read as text; anything that is not an
/// object is skipped.
pub fn parse_batch(body: &[u8]) -> Vec<ProviderLogRecord> {
    let items = match serde_json::from_slice::<Value>(body) {
        Ok(Value::Array(items)) => items,
        Ok(Value::Null) => return Vec::new(),
        Ok(other) => {
            tracing::warn!("Ignoring webhook body that is not an array: {}", kind(&other));
            return Vec::new();
        }
        Err(e) => {
            tracing::warn!("Ignoring malformed webhook body: {}", e);
            return Vec::new();
        }
    };

    items
        .into_iter()
        .enumerate()
        .filter_map(|(index, item)| match item {
            Value::Object(fields) => Some(ProviderLogRecord {
                message: text_field(&fields, "message"),
                timestamp: text_field(&fields, "timestamp"),
            }),
            other => {
                tracing::warn!("Skipping webhook element {}: {}", index, kind(&other));
                None
            }
        })
        .collect()
}

fn text_field(fields: &Map<String, Value>, key: &str) -> String {
    match fields.get(key) {
        None | Some(Value::Null) => String::new(),
        Some(Value::String(text)) => text.clone(),
        Some(other) => other.to_string(),
    }
}

fn kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

/// Turns provider push batches into broadcaster publishes.
pub struct Ingress {
    broadcaster: Arc<Broadcaster>,
    untagged_fanout: bool,
}

impl Ingress {
    pub fn new(broadcaster: Arc<Broadcaster>, untagged_fanout: bool) -> Self {
        Self {
            broadcaster,
            untagged_fanout,
        }
    }

    /// Publish every record in batch order. Returns the number of deliveries
    /// made; the provider is acknowledged regardless.
    pub fn ingest(&self, route: Route<'_>, batch: Vec<ProviderLogRecord>) -> usize {
        if batch.is_empty() {
            return 0;
        }

        if route == Route::Untagged && !self.untagged_fanout {
            tracing::warn!("Dropped untagged batch of {} lines", batch.len());
            return 0;
        }

        let lines = batch.len();
        let delivered: usize = batch
            .into_iter()
            .map(LogEvent::from)
            .map(|event| match route {
                Route::Groups(codes) => codes
                    .iter()
                    .map(|code| self.broadcaster.publish(code, &event))
                    .sum::<usize>(),
                Route::Untagged => self.broadcaster.publish_all(&event),
            })
            .sum();

        tracing::debug!("Ingested {} lines via {:?}, {} deliveries", lines, route, delivered);
        delivered
    }
}

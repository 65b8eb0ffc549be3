//! Fan-out of log lines to connected viewers, grouped by short code.
//!
//! ```text
//!   connect() ──► Connected ──join(code)──► Joined ──leave()──► (gone)
//!
//!   publish(code, event)
//!        │
//!        └──► try_send to every member of `code`, in member order,
//!             while holding the table lock
//! ```
//!
//! Holding the lock across a publish makes it the single writer for every
//! group, so members see events in the order they were published. Sends never
//! block: a full viewer queue drops the event for that viewer only, and a
//! closed queue is pruned from its group.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};
use shared::types::LogEvent;
use thiserror::Error;

pub type ConnectionId = u64;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum JoinError {
    #[error("connection {0} is not connected")]
    UnknownConnection(ConnectionId),
    #[error("connection {0} already joined {1}")]
    AlreadyJoined(ConnectionId, String),
}

/// Returned by `leave` for a session that was in a group.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Departure {
    pub code: String,
    /// No members remain in the group
    pub group_empty: bool,
}

enum SessionState {
    Connected,
    Joined(String),
}

#[derive(Default)]
struct Table {
    next_id: ConnectionId,
    sessions: HashMap<ConnectionId, SessionState>,
    groups: HashMap<String, HashMap<ConnectionId, flume::Sender<LogEvent>>>,
}

impl Table {
    fn remove_member(&mut self, code: &str, id: ConnectionId) -> bool {
        let Some(members) = self.groups.get_mut(code) else {
            return true;
        };
        members.remove(&id);
        if members.is_empty() {
            self.groups.remove(code);
            true
        } else {
            false
        }
    }

    fn deliver(&mut self, code: &str, event: &LogEvent) -> usize {
        let Some(members) = self.groups.get(code) else {
            return 0;
        };

        let mut delivered = 0;
        let mut closed = Vec::new();
        for (&id, tx) in members {
            match tx.try_send(event.clone()) {
                Ok(()) => delivered += 1,
                Err(flume::TrySendError::Full(_)) => {
                    tracing::warn!("Viewer {} on {} is lagging, dropped a line", id, code);
                }
                Err(flume::TrySendError::Disconnected(_)) => closed.push(id),
            }
        }

        for id in closed {
            tracing::debug!("Pruning closed viewer {} from {}", id, code);
            self.sessions.remove(&id);
            self.remove_member(code, id);
        }

        delivered
    }
}

pub struct Broadcaster {
    table: Mutex<Table>,
    viewer_buffer: usize,
}

impl Broadcaster {
    pub fn new(viewer_buffer: usize) -> Self {
        Self {
            table: Mutex::new(Table::default()),
            viewer_buffer: viewer_buffer.max(1),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Table> {
        self.table.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Register a new transport connection and return its id
    pub fn connect(&self) -> ConnectionId {
        let mut table = self.lock();
        table.next_id += 1;
        let id = table.next_id;
        table.sessions.insert(id, SessionState::Connected);
        id
    }

    /// Put a connected session into the group for `code`. Each session joins
    /// exactly once; the receiver yields every event published afterwards.
    pub fn join(&self, id: ConnectionId, code: &str) -> Result<flume::Receiver<LogEvent>, JoinError> {
        let mut table = self.lock();
        match table.sessions.get(&id) {
            None => return Err(JoinError::UnknownConnection(id)),
            Some(SessionState::Joined(current)) => {
                return Err(JoinError::AlreadyJoined(id, current.clone()));
            }
            Some(SessionState::Connected) => {}
        }

        let (tx, rx) = flume::bounded(self.viewer_buffer);
        table.sessions.insert(id, SessionState::Joined(code.to_string()));
        table.groups.entry(code.to_string()).or_default().insert(id, tx);

        tracing::debug!("Viewer {} joined {}", id, code);
        Ok(rx)
    }

    /// Remove a session. Safe to call repeatedly.
    pub fn leave(&self, id: ConnectionId) -> Option<Departure> {
        let mut table = self.lock();
        match table.sessions.remove(&id)? {
            SessionState::Connected => None,
            SessionState::Joined(code) => {
                let group_empty = table.remove_member(&code, id);
                tracing::debug!("Viewer {} left {}", id, code);
                Some(Departure { code, group_empty })
            }
        }
    }

    /// Deliver to every member of one group. Returns how many accepted it.
    pub fn publish(&self, code: &str, event: &LogEvent) -> usize {
        self.lock().deliver(code, event)
    }

    /// Deliver to every member of every group.
    pub fn publish_all(&self, event: &LogEvent) -> usize {
        let mut table = self.lock();
        let codes: Vec<String> = table.groups.keys().cloned().collect();
        codes.iter().map(|code| table.deliver(code, event)).sum()
    }

    pub fn group_size(&self, code: &str) -> usize {
        self.lock().groups.get(code).map_or(0, HashMap::len)
    }

    pub fn viewer_count(&self) -> usize {
        self.lock().groups.values().map(HashMap::len).sum()
    }
}

use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use futures::stream::{BoxStream, Stream, StreamExt};
use shared::types::LogEvent;
use tokio_util::sync::CancellationToken;
use crate::relay::broadcaster::{Broadcaster, ConnectionId, Departure, JoinError};
use crate::upstream::streams::StreamManager;

/// Stops a link's upstream streams once its last viewer leaves, unless the
/// daemon is shutting down (those streams are resumed on the next start).
#[derive(Clone)]
pub struct IdleTeardown {
    pub streams: Arc<StreamManager>,
    pub shutdown: CancellationToken,
}

/// Live feed for one viewer connection. Dropping it (the client went away)
/// leaves the broadcast group.
pub struct ViewerFeed {
    // Declared first so the group is left before the receiver closes
    membership: Membership,
    events: BoxStream<'static, LogEvent>,
}

struct Membership {
    id: ConnectionId,
    /// Group joined, once the join succeeded
    code: Option<String>,
    broadcaster: Arc<Broadcaster>,
    on_idle: Option<IdleTeardown>,
}

impl ViewerFeed {
    pub fn open(
        broadcaster: Arc<Broadcaster>,
        code: &str,
        on_idle: Option<IdleTeardown>,
    ) -> Result<Self, JoinError> {
        let id = broadcaster.connect();
        let mut membership = Membership {
            id,
            code: None,
            broadcaster: broadcaster.clone(),
            on_idle,
        };
        let rx = broadcaster.join(id, code)?;
        membership.code = Some(code.to_string());

        tracing::info!("Viewer {} watching {} ({} in group)", id, code, broadcaster.group_size(code));
        Ok(Self {
            membership,
            events: rx.into_stream().boxed(),
        })
    }

    #[cfg(test)]
    pub fn connection_id(&self) -> ConnectionId {
        self.membership.id
    }
}

impl Stream for ViewerFeed {
    type Item = LogEvent;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<LogEvent>> {
        self.events.poll_next_unpin(cx)
    }
}

impl Drop for Membership {
    fn drop(&mut self) {
        let departure = match (self.broadcaster.leave(self.id), self.code.take()) {
            (Some(departure), _) => departure,
            // Already pruned by a publish that found the queue closed
            (None, Some(code)) => Departure {
                group_empty: self.broadcaster.group_size(&code) == 0,
                code,
            },
            (None, None) => return,
        };
        tracing::info!("Viewer {} stopped watching {}", self.id, departure.code);

        if !departure.group_empty {
            return;
        }
        let Some(IdleTeardown { streams, shutdown }) = self.on_idle.clone() else {
            return;
        };
        if shutdown.is_cancelled() {
            return;
        }
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                let broadcaster = self.broadcaster.clone();
                handle.spawn(async move {
                    // Someone may have started watching again meanwhile
                    if broadcaster.group_size(&departure.code) > 0 {
                        return;
                    }
                    let stopped = streams.stop_for_code(&departure.code).await;
                    if stopped > 0 {
                        tracing::info!("Stopped {} idle streams for {}", stopped, departure.code);
                    }
                });
            }
            Err(_) => {
                tracing::warn!("No runtime to stop idle streams for {}", departure.code);
            }
        }
    }
}

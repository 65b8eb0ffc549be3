use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use anyhow::Result;
use chrono::{DateTime, Utc};
use tokio_util::sync::CancellationToken;
use shared::protocol::WEBHOOK_PATH;
use shared::types::StreamSession;
use crate::config::{RestartPolicy, StreamsConfig};
use crate::error::{RelayError, RelayResult};
use crate::registry::code::{fingerprint, generate_route_token};
use crate::registry_manager::RegistryHandle;
use crate::relay::broadcaster::Broadcaster;
use crate::upstream::client::ProviderClient;

/// Tracks the push subscriptions this daemon holds with the provider.
///
/// One subscription per credential/service pair. Links for the same pair are
/// bound to it, and the provider pushes to a per-subscription route so ingress
/// can find every bound link. The in-memory table is authoritative while the
/// process runs; every change is mirrored into the registry store so a restart
/// can reconcile.
pub struct StreamManager {
    client: ProviderClient,
    registry: RegistryHandle,
    base_url: String,
    sessions: Mutex<HashMap<String, StreamSession>>,
    /// First sweep that found a bound link without viewers
    unwatched_since: Mutex<HashMap<String, DateTime<Utc>>>,
}

fn guard<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl StreamManager {
    pub fn new(client: ProviderClient, registry: RegistryHandle, public_base_url: &str) -> Self {
        Self {
            client,
            registry,
            base_url: public_base_url.trim_end_matches('/').to_string(),
            sessions: Mutex::new(HashMap::new()),
            unwatched_since: Mutex::new(HashMap::new()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, StreamSession>> {
        guard(&self.sessions)
    }

    /// Webhook target handed to the provider for a subscription's route
    pub fn callback_url(&self, route: &str) -> String {
        format!("{}{}/{}", self.base_url, WEBHOOK_PATH, route)
    }

    /// Links bound to the subscription pushing to `route`, or `None` if no
    /// active subscription uses it.
    pub fn codes_for_route(&self, route: &str) -> Option<Vec<String>> {
        self.lock()
            .values()
            .find(|s| s.route == route)
            .map(|s| s.codes.iter().cloned().collect())
    }

    /// Reuse the pair's subscription if there is one, binding `code` to it.
    async fn attach(&self, credential: &str, service_id: &str, code: Option<&str>) -> Option<String> {
        let (stream_id, newly_bound) = {
            let mut sessions = self.lock();
            let session = sessions.values_mut().find(|s| s.serves(credential, service_id))?;
            let newly_bound = code.filter(|code| session.codes.insert(code.to_string()));
            (session.stream_id.clone(), newly_bound)
        };

        if let Some(code) = newly_bound {
            tracing::info!("Bound {} to stream {}", code, stream_id);
            if let Err(e) = self.registry.bind_code(&stream_id, code).await {
                tracing::warn!("Binding of {} to stream {} not persisted: {}", code, stream_id, e);
            }
        }
        Some(stream_id)
    }

    /// Subscribe the service's logs, delivering them to the group for `code`.
    /// A pair that already has a subscription returns the existing stream id.
    pub async fn subscribe(
        &self,
        credential: &str,
        service_id: &str,
        code: Option<&str>,
    ) -> RelayResult<String> {
        if let Some(stream_id) = self.attach(credential, service_id, code).await {
            tracing::debug!("Reusing stream {} for service {}", stream_id, service_id);
            return Ok(stream_id);
        }

        let route = generate_route_token();
        let callback = self.callback_url(&route);
        let stream_id = self
            .client
            .create_log_stream(credential, service_id, &callback)
            .await?;

        let session = StreamSession {
            stream_id: stream_id.clone(),
            credential: credential.to_string(),
            service_id: service_id.to_string(),
            route,
            codes: code.map(str::to_string).into_iter().collect(),
            created_at: Utc::now(),
        };

        // A concurrent subscribe for the same pair may have won while we were
        // talking to the provider.
        let lost = {
            let mut sessions = self.lock();
            if sessions.values().any(|s| s.serves(credential, service_id)) {
                true
            } else {
                sessions.insert(stream_id.clone(), session.clone());
                false
            }
        };

        if lost {
            tracing::info!("Discarding duplicate stream {} for service {}", stream_id, service_id);
            if let Err(e) = self.client.delete_log_stream(credential, &stream_id).await {
                tracing::warn!("Failed to delete duplicate stream {}: {}", stream_id, e);
            }
            if let Some(existing) = self.attach(credential, service_id, code).await {
                return Ok(existing);
            }
            // The winner was torn down meanwhile
            return Err(RelayError::UpstreamUnreachable(format!(
                "stream for service {} was released during subscribe",
                service_id
            )));
        }

        if let Err(e) = self.registry.save_stream(session).await {
            tracing::warn!("Stream {} is active but not persisted: {}", stream_id, e);
        }

        tracing::info!(
            "Subscribed stream {} for service {} (key {}) -> {}",
            stream_id,
            service_id,
            fingerprint(credential),
            callback
        );
        Ok(stream_id)
    }

    /// Tear down a subscription. Unknown ids are a no-op and return false.
    /// Provider and store failures are logged rather than returned.
    pub async fn unsubscribe(&self, stream_id: &str) -> bool {
        let removed = self.lock().remove(stream_id);
        let Some(session) = removed else {
            tracing::debug!("Unsubscribe for unknown stream {}", stream_id);
            return false;
        };

        if let Err(e) = self.registry.delete_stream(stream_id).await {
            tracing::warn!("Failed to forget stream {}: {}", stream_id, e);
        }

        if let Err(e) = self.client.delete_log_stream(&session.credential, stream_id).await {
            tracing::warn!("Provider teardown of stream {} failed: {}", stream_id, e);
        }

        tracing::info!("Unsubscribed stream {} for service {}", stream_id, session.service_id);
        true
    }

    /// Unbind `code` from every subscription. Subscriptions left without any
    /// link are torn down; returns how many were.
    pub async fn stop_for_code(&self, code: &str) -> usize {
        let mut unbound = Vec::new();
        let mut orphaned = Vec::new();
        {
            let mut sessions = self.lock();
            for session in sessions.values_mut() {
                if !session.codes.remove(code) {
                    continue;
                }
                if session.codes.is_empty() {
                    orphaned.push(session.stream_id.clone());
                } else {
                    unbound.push(session.stream_id.clone());
                }
            }
        }
        guard(&self.unwatched_since).remove(code);

        for stream_id in unbound {
            tracing::info!("Unbound {} from stream {}", code, stream_id);
            if let Err(e) = self.registry.unbind_code(&stream_id, code).await {
                tracing::warn!("Unbinding of {} from stream {} not persisted: {}", code, stream_id, e);
            }
        }

        let mut stopped = 0;
        for stream_id in orphaned {
            if self.unsubscribe(&stream_id).await {
                stopped += 1;
            }
        }
        stopped
    }

    /// Release links that expired, or that nobody has watched for
    /// `idle_grace`. Covers subscriptions no viewer ever attached to, such as
    /// those resumed after a restart. Returns how many subscriptions stopped.
    pub async fn sweep(
        &self,
        now: DateTime<Utc>,
        idle_grace: Option<chrono::Duration>,
        watched: impl Fn(&str) -> bool,
    ) -> usize {
        let bound: BTreeSet<String> = self
            .lock()
            .values()
            .flat_map(|s| s.codes.iter().cloned())
            .collect();
        guard(&self.unwatched_since).retain(|code, _| bound.contains(code));

        let mut stopped = 0;
        for code in bound {
            if watched(&code) {
                guard(&self.unwatched_since).remove(&code);
                continue;
            }

            let reason = match self.registry.resolve(&code).await {
                Err(RelayError::NotFound(_)) => Some("expired"),
                Err(e) => {
                    tracing::warn!("Could not check link {}: {}", code, e);
                    None
                }
                Ok(_) => idle_grace.and_then(|grace| {
                    let since = *guard(&self.unwatched_since).entry(code.clone()).or_insert(now);
                    (now - since >= grace).then_some("unwatched")
                }),
            };

            if let Some(reason) = reason {
                let count = self.stop_for_code(&code).await;
                tracing::info!("Released {} link {}, stopped {} streams", reason, code, count);
                stopped += count;
            }
        }
        stopped
    }

    /// Reconcile subscriptions persisted by a previous run
    pub async fn restore(&self, policy: RestartPolicy) -> RelayResult<usize> {
        let persisted = self.registry.list_streams().await?;
        let count = persisted.len();

        match policy {
            RestartPolicy::Resume => {
                let mut sessions = self.lock();
                for session in persisted {
                    sessions.insert(session.stream_id.clone(), session);
                }
                tracing::info!("Resumed {} persisted streams", count);
            }
            RestartPolicy::Teardown => {
                for session in persisted {
                    if let Err(e) = self
                        .client
                        .delete_log_stream(&session.credential, &session.stream_id)
                        .await
                    {
                        tracing::warn!("Failed to tear down stream {}: {}", session.stream_id, e);
                    }
                    if let Err(e) = self.registry.delete_stream(&session.stream_id).await {
                        tracing::warn!("Failed to forget stream {}: {}", session.stream_id, e);
                    }
                }
                tracing::info!("Tore down {} persisted streams", count);
            }
        }

        Ok(count)
    }

    #[cfg(test)]
    pub fn session(&self, stream_id: &str) -> Option<StreamSession> {
        self.lock().get(stream_id).cloned()
    }

    pub fn active_count(&self) -> usize {
        self.lock().len()
    }
}

/// Stream maintenance loop - releases expired and unwatched links until cancelled
pub async fn run(
    streams: Arc<StreamManager>,
    broadcaster: Arc<Broadcaster>,
    config: StreamsConfig,
    cancel: CancellationToken,
) -> Result<()> {
    let mut sweep_interval = tokio::time::interval(
        std::time::Duration::from_secs(config.sweep_interval_secs.max(1))
    );
    let idle_grace = config.idle_grace();

    loop {
        tokio::select! {
            _ = sweep_interval.tick() => {
                let stopped = streams
                    .sweep(Utc::now(), idle_grace, |code| broadcaster.group_size(code) > 0)
                    .await;
                if stopped > 0 {
                    tracing::info!("Sweep stopped {} streams", stopped);
                }
            }
            _ = cancel.cancelled() => {
                tracing::info!("Stream maintenance shutting down");
                break;
            }
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use crate::config::RegistryConfig;
    use crate::registry::db::RegistryDb;
    use crate::upstream::mock::MockProvider;

    fn manager(provider: &MockProvider, registry: &RegistryHandle) -> StreamManager {
        let client = ProviderClient::new(&provider.config()).unwrap();
        StreamManager::new(client, registry.clone(), "https://relay.example.com/")
    }

    fn registry() -> RegistryHandle {
        RegistryHandle::spawn(RegistryDb::open(":memory:").unwrap(), &RegistryConfig::default())
    }

    async fn live_code(registry: &RegistryHandle) -> String {
        registry.create_code("k1".into(), "s1".into()).await.unwrap().code
    }

    fn codes(list: &[&str]) -> BTreeSet<String> {
        list.iter().map(|c| c.to_string()).collect()
    }

    #[tokio::test]
    async fn test_subscribe_records_and_persists_session() {
        let provider = MockProvider::start().await;
        let registry = registry();
        let streams = manager(&provider, &registry);

        let stream_id = streams.subscribe("k1", "s1", Some("ab12CD")).await.unwrap();

        let session = streams.session(&stream_id).unwrap();
        assert_eq!(session.credential, "k1");
        assert_eq!(session.codes, codes(&["ab12CD"]));
        assert_eq!(
            provider.calls()[0].body["url"],
            format!("https://relay.example.com/webhook/{}", session.route)
        );
        assert_eq!(streams.codes_for_route(&session.route), Some(vec!["ab12CD".to_string()]));

        let persisted = registry.list_streams().await.unwrap();
        assert_eq!(persisted.len(), 1);
        assert_eq!(persisted[0].stream_id, stream_id);
        assert_eq!(persisted[0].route, session.route);
        assert_eq!(persisted[0].codes, session.codes);
    }

    #[tokio::test]
    async fn test_rejected_subscribe_creates_no_session() {
        let provider = MockProvider::start().await;
        provider.respond_with(401, "unauthorized");
        let registry = registry();
        let streams = manager(&provider, &registry);

        let err = streams.subscribe("bad", "s1", Some("ab12CD")).await.unwrap_err();
        assert!(matches!(err, RelayError::UpstreamRejected(ref body) if body == "unauthorized"));
        assert_eq!(streams.active_count(), 0);
        assert!(registry.list_streams().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_one_stream_per_pair() {
        let provider = MockProvider::start().await;
        let registry = registry();
        let streams = manager(&provider, &registry);

        let raw = streams.subscribe("k1", "s1", None).await.unwrap();
        let linked = streams.subscribe("k1", "s1", Some("ab12CD")).await.unwrap();
        let other_link = streams.subscribe("k1", "s1", Some("XYZ999")).await.unwrap();

        assert_eq!(raw, linked);
        assert_eq!(raw, other_link);
        assert_eq!(provider.calls_with("POST"), 1);
        assert_eq!(streams.active_count(), 1);
        assert_eq!(streams.session(&raw).unwrap().codes, codes(&["XYZ999", "ab12CD"]));
        assert_eq!(registry.list_streams().await.unwrap()[0].codes, codes(&["XYZ999", "ab12CD"]));

        streams.subscribe("k1", "s2", Some("ab12CD")).await.unwrap();
        assert_eq!(streams.active_count(), 2, "another service gets its own stream");
    }

    #[tokio::test]
    async fn test_concurrent_subscribes_keep_one_stream() {
        let provider = MockProvider::start().await;
        provider.delay_creates(Duration::from_millis(100));
        let registry = registry();
        let streams = manager(&provider, &registry);

        let (first, second) = tokio::join!(
            streams.subscribe("k1", "s1", Some("ab12CD")),
            streams.subscribe("k1", "s1", Some("XYZ999")),
        );
        let (first, second) = (first.unwrap(), second.unwrap());

        assert_eq!(first, second);
        assert_eq!(provider.calls_with("POST"), 2);
        assert_eq!(provider.calls_with("DELETE"), 1);
        assert_eq!(streams.active_count(), 1);
        assert_eq!(streams.session(&first).unwrap().codes, codes(&["XYZ999", "ab12CD"]));

        let deleted = provider.calls().into_iter().find(|c| c.method == "DELETE").unwrap();
        assert_ne!(deleted.path, format!("/log-streams/{}", first), "the loser is deleted");

        let persisted = registry.list_streams().await.unwrap();
        assert_eq!(persisted.len(), 1);
        assert_eq!(persisted[0].codes, codes(&["XYZ999", "ab12CD"]));
    }

    #[tokio::test]
    async fn test_unknown_route_has_no_codes() {
        let provider = MockProvider::start().await;
        let streams = manager(&provider, &registry());

        let stream_id = streams.subscribe("k1", "s1", None).await.unwrap();
        let route = streams.session(&stream_id).unwrap().route;

        assert_eq!(streams.codes_for_route(&route), Some(Vec::new()));
        assert_eq!(streams.codes_for_route("not-a-route"), None);
    }

    #[tokio::test]
    async fn test_unsubscribe_unknown_is_noop() {
        let provider = MockProvider::start().await;
        let streams = manager(&provider, &registry());

        assert!(!streams.unsubscribe("str-unknown").await);
        assert!(provider.calls().is_empty());
    }

    #[tokio::test]
    async fn test_unsubscribe_deletes_upstream_and_locally() {
        let provider = MockProvider::start().await;
        let registry = registry();
        let streams = manager(&provider, &registry);

        let stream_id = streams.subscribe("k1", "s1", Some("ab12CD")).await.unwrap();
        assert!(streams.unsubscribe(&stream_id).await);
        assert!(!streams.unsubscribe(&stream_id).await);

        assert_eq!(streams.active_count(), 0);
        assert!(registry.list_streams().await.unwrap().is_empty());
        let deletes: Vec<_> = provider.calls().into_iter().filter(|c| c.method == "DELETE").collect();
        assert_eq!(deletes.len(), 1);
        assert_eq!(deletes[0].path, format!("/log-streams/{}", stream_id));
        assert_eq!(deletes[0].authorization.as_deref(), Some("Bearer k1"));
    }

    #[tokio::test]
    async fn test_unsubscribe_survives_provider_failure() {
        let provider = MockProvider::start().await;
        let streams = manager(&provider, &registry());

        let stream_id = streams.subscribe("k1", "s1", None).await.unwrap();
        provider.respond_with(500, "boom");

        assert!(streams.unsubscribe(&stream_id).await);
        assert_eq!(streams.active_count(), 0);
    }

    #[tokio::test]
    async fn test_stop_for_code_only_stops_orphaned_streams() {
        let provider = MockProvider::start().await;
        let registry = registry();
        let streams = manager(&provider, &registry);

        let shared = streams.subscribe("k1", "s1", Some("ab12CD")).await.unwrap();
        streams.subscribe("k1", "s1", Some("XYZ999")).await.unwrap();
        let single = streams.subscribe("k2", "s2", Some("ab12CD")).await.unwrap();

        assert_eq!(streams.stop_for_code("ab12CD").await, 1);
        assert!(streams.session(&single).is_none());
        assert_eq!(streams.session(&shared).unwrap().codes, codes(&["XYZ999"]));
        assert_eq!(registry.list_streams().await.unwrap()[0].codes, codes(&["XYZ999"]));
        assert_eq!(provider.calls_with("DELETE"), 1);
    }

    #[tokio::test]
    async fn test_sweep_releases_unwatched_link_after_grace() {
        let provider = MockProvider::start().await;
        let registry = registry();
        let streams = manager(&provider, &registry);
        let code = live_code(&registry).await;
        streams.subscribe("k1", "s1", Some(&code)).await.unwrap();

        let grace = Some(chrono::Duration::seconds(60));
        let t0 = Utc::now();
        assert_eq!(streams.sweep(t0, grace, |_| false).await, 0);
        assert_eq!(streams.sweep(t0 + chrono::Duration::seconds(30), grace, |_| false).await, 0);
        assert_eq!(streams.active_count(), 1);

        assert_eq!(streams.sweep(t0 + chrono::Duration::seconds(60), grace, |_| false).await, 1);
        assert_eq!(streams.active_count(), 0);
        assert_eq!(provider.calls_with("DELETE"), 1);
    }

    #[tokio::test]
    async fn test_sweep_restarts_grace_when_watched() {
        let provider = MockProvider::start().await;
        let registry = registry();
        let streams = manager(&provider, &registry);
        let code = live_code(&registry).await;
        streams.subscribe("k1", "s1", Some(&code)).await.unwrap();

        let grace = Some(chrono::Duration::seconds(60));
        let t0 = Utc::now();
        let at = |secs| t0 + chrono::Duration::seconds(secs);
        streams.sweep(at(0), grace, |_| false).await;
        streams.sweep(at(50), grace, |_| true).await;
        assert_eq!(streams.sweep(at(100), grace, |_| false).await, 0);
        assert_eq!(streams.sweep(at(159), grace, |_| false).await, 0);
        assert_eq!(streams.sweep(at(160), grace, |_| false).await, 1);
    }

    #[tokio::test]
    async fn test_sweep_releases_expired_link_without_grace() {
        let provider = MockProvider::start().await;
        let registry = registry();
        let streams = manager(&provider, &registry);
        let code = live_code(&registry).await;

        streams.subscribe("k1", "s1", Some(&code)).await.unwrap();
        streams.subscribe("k9", "s9", Some("gone99")).await.unwrap();

        assert_eq!(streams.sweep(Utc::now(), None, |_| false).await, 1);
        assert_eq!(streams.active_count(), 1);
        assert_eq!(streams.sweep(Utc::now(), None, |_| false).await, 0, "live links are kept");
    }

    #[tokio::test]
    async fn test_resumed_streams_without_viewers_are_swept() {
        let provider = MockProvider::start().await;
        let registry = registry();
        let code = live_code(&registry).await;
        manager(&provider, &registry)
            .subscribe("k1", "s1", Some(&code))
            .await
            .unwrap();

        // Fresh manager simulates a restart over the same store
        let resumed = manager(&provider, &registry);
        assert_eq!(resumed.restore(RestartPolicy::Resume).await.unwrap(), 1);

        let grace = Some(chrono::Duration::seconds(60));
        let t0 = Utc::now();
        resumed.sweep(t0, grace, |_| false).await;
        assert_eq!(resumed.sweep(t0 + chrono::Duration::seconds(61), grace, |_| false).await, 1);
        assert!(registry.list_streams().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_restore_resume_and_teardown() {
        let provider = MockProvider::start().await;
        let registry = registry();

        let stream_id = manager(&provider, &registry)
            .subscribe("k1", "s1", Some("ab12CD"))
            .await
            .unwrap();

        let resumed = manager(&provider, &registry);
        assert_eq!(resumed.restore(RestartPolicy::Resume).await.unwrap(), 1);
        let session = resumed.session(&stream_id).unwrap();
        assert_eq!(resumed.codes_for_route(&session.route), Some(vec!["ab12CD".to_string()]));

        let torn_down = manager(&provider, &registry);
        assert_eq!(torn_down.restore(RestartPolicy::Teardown).await.unwrap(), 1);
        assert_eq!(torn_down.active_count(), 0);
        assert!(registry.list_streams().await.unwrap().is_empty());
        assert_eq!(provider.calls_with("DELETE"), 1);
    }

    #[tokio::test]
    async fn test_teardown_continues_past_store_errors() {
        let provider = MockProvider::start().await;
        let db = RegistryDb::open(":memory:").unwrap();
        for (stream_id, route) in [("str-a", "route-a"), ("str-b", "route-b")] {
            db.save_stream(&StreamSession {
                stream_id: stream_id.to_string(),
                credential: "k1".to_string(),
                service_id: stream_id.to_string(),
                route: route.to_string(),
                codes: BTreeSet::new(),
                created_at: Utc::now(),
            })
            .unwrap();
        }
        db.connection()
            .execute_batch(
                "CREATE TRIGGER keep_streams BEFORE DELETE ON upstream_streams
                 BEGIN SELECT RAISE(ABORT, 'read only'); END;",
            )
            .unwrap();
        let registry = RegistryHandle::spawn(db, &RegistryConfig::default());

        let streams = manager(&provider, &registry);
        assert_eq!(streams.restore(RestartPolicy::Teardown).await.unwrap(), 2);
        assert_eq!(provider.calls_with("DELETE"), 2);
    }
}

use std::thread;
use chrono::Utc;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use anyhow::Result;
use shared::types::{CodeEntry, StreamSession};
use crate::config::RegistryConfig;
use crate::error::{RelayError, RelayResult};
use crate::registry::code::{fingerprint, generate_code, is_well_formed};
use crate::registry::db::RegistryDb;

/// Commands sent to the registry thread
pub enum RegistryCommand {
    CreateCode {
        credential: String,
        service_id: String,
        ttl: Option<chrono::Duration>,
        max_attempts: u32,
        reply: oneshot::Sender<Result<Option<CodeEntry>>>,
    },
    GetCode(String, oneshot::Sender<Result<Option<CodeEntry>>>),
    ReapExpired(oneshot::Sender<Result<u64>>),
    SaveStream(StreamSession, oneshot::Sender<Result<()>>),
    BindCode { stream_id: String, code: String, reply: oneshot::Sender<Result<()>> },
    UnbindCode { stream_id: String, code: String, reply: oneshot::Sender<Result<()>> },
    DeleteStream(String, oneshot::Sender<Result<bool>>),
    ListStreams(oneshot::Sender<Result<Vec<StreamSession>>>),
    Shutdown,
}

/// Handle to the code registry. The database lives on its own thread;
/// every clone talks to that single owner.
#[derive(Clone)]
pub struct RegistryHandle {
    tx: mpsc::Sender<RegistryCommand>,
    ttl: Option<chrono::Duration>,
    max_attempts: u32,
}

impl RegistryHandle {
    /// Spawn the registry thread over an opened database
    pub fn spawn(db: RegistryDb, config: &RegistryConfig) -> Self {
        Self::spawn_with_generator(db, config, generate_code)
    }

    /// Like `spawn`, drawing candidate codes from `generate`
    pub fn spawn_with_generator(
        db: RegistryDb,
        config: &RegistryConfig,
        mut generate: impl FnMut() -> String + Send + 'static,
    ) -> Self {
        let (tx, mut rx) = mpsc::channel::<RegistryCommand>(256);

        thread::spawn(move || {
            while let Some(cmd) = rx.blocking_recv() {
                match cmd {
                    RegistryCommand::CreateCode { credential, service_id, ttl, max_attempts, reply } => {
                        let result = insert_fresh_code(&db, &mut generate, credential, service_id, ttl, max_attempts);
                        let _ = reply.send(result);
                    }
                    RegistryCommand::GetCode(code, reply) => {
                        let _ = reply.send(db.get_code(&code));
                    }
                    RegistryCommand::ReapExpired(reply) => {
                        let _ = reply.send(db.delete_expired(Utc::now()));
                    }
                    RegistryCommand::SaveStream(session, reply) => {
                        let _ = reply.send(db.save_stream(&session));
                    }
                    RegistryCommand::BindCode { stream_id, code, reply } => {
                        let _ = reply.send(db.bind_code(&stream_id, &code));
                    }
                    RegistryCommand::UnbindCode { stream_id, code, reply } => {
                        let _ = reply.send(db.unbind_code(&stream_id, &code));
                    }
                    RegistryCommand::DeleteStream(stream_id, reply) => {
                        let _ = reply.send(db.delete_stream(&stream_id));
                    }
                    RegistryCommand::ListStreams(reply) => {
                        let _ = reply.send(db.list_streams());
                    }
                    RegistryCommand::Shutdown => {
                        tracing::info!("Registry thread shutting down");
                        break;
                    }
                }
            }
        });

        Self {
            tx,
            ttl: config.code_ttl(),
            max_attempts: config.max_code_attempts.max(1),
        }
    }

    async fn request<T>(
        &self,
        build: impl FnOnce(oneshot::Sender<Result<T>>) -> RegistryCommand,
    ) -> RelayResult<T> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(build(reply))
            .await
            .map_err(|_| RelayError::StorageUnavailable("registry is not running".to_string()))?;
        rx.await
            .map_err(|_| RelayError::StorageUnavailable("registry dropped the request".to_string()))?
            .map_err(|e| RelayError::StorageUnavailable(format!("{:#}", e)))
    }

    /// Mint a new code for the pair. Taken codes are regenerated.
    pub async fn create_code(&self, credential: String, service_id: String) -> RelayResult<CodeEntry> {
        let ttl = self.ttl;
        let max_attempts = self.max_attempts;
        self.request(|reply| RegistryCommand::CreateCode {
            credential,
            service_id,
            ttl,
            max_attempts,
            reply,
        })
        .await?
        .ok_or_else(|| {
            RelayError::StorageUnavailable(format!(
                "no free code after {} attempts",
                max_attempts
            ))
        })
    }

    /// Look up a live code. Unknown, malformed, and expired codes are all `NotFound`.
    pub async fn resolve(&self, code: &str) -> RelayResult<CodeEntry> {
        if !is_well_formed(code) {
            return Err(RelayError::NotFound(code.to_string()));
        }

        self.request(|reply| RegistryCommand::GetCode(code.to_string(), reply))
            .await?
            .filter(|entry| !entry.is_expired(Utc::now()))
            .ok_or_else(|| RelayError::NotFound(code.to_string()))
    }

    /// Delete expired codes, returning how many were removed
    pub async fn reap_expired(&self) -> RelayResult<u64> {
        self.request(RegistryCommand::ReapExpired).await
    }

    pub async fn save_stream(&self, session: StreamSession) -> RelayResult<()> {
        self.request(|reply| RegistryCommand::SaveStream(session, reply)).await
    }

    pub async fn bind_code(&self, stream_id: &str, code: &str) -> RelayResult<()> {
        self.request(|reply| RegistryCommand::BindCode {
            stream_id: stream_id.to_string(),
            code: code.to_string(),
            reply,
        })
        .await
    }

    pub async fn unbind_code(&self, stream_id: &str, code: &str) -> RelayResult<()> {
        self.request(|reply| RegistryCommand::UnbindCode {
            stream_id: stream_id.to_string(),
            code: code.to_string(),
            reply,
        })
        .await
    }

    pub async fn delete_stream(&self, stream_id: &str) -> RelayResult<bool> {
        self.request(|reply| RegistryCommand::DeleteStream(stream_id.to_string(), reply)).await
    }

    pub async fn list_streams(&self) -> RelayResult<Vec<StreamSession>> {
        self.request(RegistryCommand::ListStreams).await
    }

    /// Shutdown the registry thread
    pub async fn shutdown(&self) -> Result<()> {
        self.tx.send(RegistryCommand::Shutdown).await?;
        Ok(())
    }
}

fn insert_fresh_code(
    db: &RegistryDb,
    generate: &mut impl FnMut() -> String,
    credential: String,
    service_id: String,
    ttl: Option<chrono::Duration>,
    max_attempts: u32,
) -> Result<Option<CodeEntry>> {
    let created_at = Utc::now();
    let mut entry = CodeEntry {
        code: String::new(),
        credential,
        service_id,
        created_at,
        expires_at: ttl.map(|ttl| created_at + ttl),
    };

    for attempt in 1..=max_attempts {
        entry.code = generate();
        if db.insert_code(&entry)? {
            tracing::info!(
                "Issued code {} for service {} (key {})",
                entry.code,
                entry.service_id,
                fingerprint(&entry.credential)
            );
            return Ok(Some(entry));
        }
        tracing::debug!("Code {} already taken (attempt {})", entry.code, attempt);
    }

    Ok(None)
}

/// Registry maintenance loop - reaps expired codes until cancelled
pub async fn run(
    registry: RegistryHandle,
    config: RegistryConfig,
    cancel: CancellationToken,
) -> Result<()> {
    let mut reap_interval = tokio::time::interval(
        std::time::Duration::from_secs(config.reap_interval_secs.max(1))
    );

    loop {
        tokio::select! {
            _ = reap_interval.tick() => {
                match registry.reap_expired().await {
                    Ok(0) => {}
                    Ok(count) => tracing::info!("Reaped {} expired codes", count),
                    Err(e) => tracing::error!("Failed to reap expired codes: {}", e),
                }
            }
            _ = cancel.cancelled() => {
                tracing::info!("Registry maintenance shutting down");
                break;
            }
        }
    }

    Ok(())
}

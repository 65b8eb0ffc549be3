use std::collections::BTreeSet;
use std::path::Path;
use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use rusqlite::{Connection, params, OptionalExtension};
use shared::types::{CodeEntry, StreamSession};

pub struct RegistryDb {
    conn: Connection,
}

impl RegistryDb {
    /// Open or create the SQLite database with WAL mode enabled
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create directory: {}", parent.display()))?;
        }

        let conn = Connection::open(path)
            .with_context(|| format!("Failed to open database: {}", path.display()))?;

        conn.execute_batch("PRAGMA journal_mode=WAL;")
            .context("Failed to enable WAL mode")?;

        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS codes (
                code        TEXT PRIMARY KEY,
                credential  TEXT NOT NULL,
                service_id  TEXT NOT NULL,
                created_at  TEXT NOT NULL,
                expires_at  TEXT
            );

            CREATE INDEX IF NOT EXISTS idx_codes_expires_at ON codes(expires_at);

            CREATE TABLE IF NOT EXISTS upstream_streams (
                stream_id   TEXT PRIMARY KEY,
                credential  TEXT NOT NULL,
                service_id  TEXT NOT NULL,
                route       TEXT NOT NULL UNIQUE,
                created_at  TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS upstream_stream_codes (
                stream_id   TEXT NOT NULL,
                code        TEXT NOT NULL,
                PRIMARY KEY (stream_id, code)
            );
            "#,
        )
        .context("Failed to create database schema")?;

        Ok(Self { conn })
    }

    /// Insert a new code entry. Returns false if the code is already taken;
    /// existing rows are never overwritten.
    pub fn insert_code(&self, entry: &CodeEntry) -> Result<bool> {
        let inserted = self.conn.execute(
            r#"
            INSERT OR IGNORE INTO codes (code, credential, service_id, created_at, expires_at)
            VALUES (?1, ?2, ?3, ?4, ?5)
            "#,
            params![
                &entry.code,
                &entry.credential,
                &entry.service_id,
                entry.created_at.to_rfc3339(),
                entry.expires_at.map(|at| at.to_rfc3339()),
            ],
        )
        .context("Failed to insert code")?;

        Ok(inserted == 1)
    }

    /// Get a code entry regardless of expiry
    pub fn get_code(&self, code: &str) -> Result<Option<CodeEntry>> {
        let entry = self
            .conn
            .query_row(
                "SELECT code, credential, service_id, created_at, expires_at
                 FROM codes WHERE code = ?1",
                params![code],
                Self::row_to_code,
            )
            .optional()
            .context("Failed to query code")?;

        Ok(entry)
    }

    /// Delete codes whose expiry has passed
    pub fn delete_expired(&self, now: DateTime<Utc>) -> Result<u64> {
        let count = self.conn.execute(
            "DELETE FROM codes WHERE expires_at IS NOT NULL AND expires_at <= ?1",
            params![now.to_rfc3339()],
        )
        .context("Failed to delete expired codes")?;

        Ok(count as u64)
    }

    /// Persist a stream session. Bound codes are added, never removed, so a
    /// stale save cannot undo a concurrent `bind_code`.
    pub fn save_stream(&self, session: &StreamSession) -> Result<()> {
        let tx = self.conn.unchecked_transaction()
            .context("Failed to begin transaction")?;

        tx.execute(
            r#"
            INSERT INTO upstream_streams (stream_id, credential, service_id, route, created_at)
            VALUES (?1, ?2, ?3, ?4, ?5)
            ON CONFLICT(stream_id) DO UPDATE SET
                credential = excluded.credential,
                service_id = excluded.service_id,
                route = excluded.route
            "#,
            params![
                &session.stream_id,
                &session.credential,
                &session.service_id,
                &session.route,
                session.created_at.to_rfc3339(),
            ],
        )
        .context("Failed to save stream session")?;

        for code in &session.codes {
            tx.execute(
                "INSERT OR IGNORE INTO upstream_stream_codes (stream_id, code) VALUES (?1, ?2)",
                params![&session.stream_id, code],
            )
            .context("Failed to save stream code")?;
        }

        tx.commit().context("Failed to commit stream session")?;
        Ok(())
    }

    pub fn bind_code(&self, stream_id: &str, code: &str) -> Result<()> {
        self.conn.execute(
            "INSERT OR IGNORE INTO upstream_stream_codes (stream_id, code) VALUES (?1, ?2)",
            params![stream_id, code],
        )
        .context("Failed to bind code to stream")?;
        Ok(())
    }

    pub fn unbind_code(&self, stream_id: &str, code: &str) -> Result<()> {
        self.conn.execute(
            "DELETE FROM upstream_stream_codes WHERE stream_id = ?1 AND code = ?2",
            params![stream_id, code],
        )
        .context("Failed to unbind code from stream")?;
        Ok(())
    }

    /// Remove a stream session and its bindings. Returns true if a session was deleted.
    pub fn delete_stream(&self, stream_id: &str) -> Result<bool> {
        let tx = self.conn.unchecked_transaction()
            .context("Failed to begin transaction")?;

        let count = tx.execute(
            "DELETE FROM upstream_streams WHERE stream_id = ?1",
            params![stream_id],
        )
        .context("Failed to delete stream session")?;
        tx.execute(
            "DELETE FROM upstream_stream_codes WHERE stream_id = ?1",
            params![stream_id],
        )
        .context("Failed to delete stream codes")?;

        tx.commit().context("Failed to commit stream deletion")?;
        Ok(count > 0)
    }

    /// All persisted stream sessions with their bound codes, oldest first
    pub fn list_streams(&self) -> Result<Vec<StreamSession>> {
        let mut stmt = self
            .conn
            .prepare(
                "SELECT stream_id, credential, service_id, route, created_at
                 FROM upstream_streams ORDER BY created_at"
            )
            .context("Failed to prepare query")?;

        let mut sessions = stmt
            .query_map([], Self::row_to_stream)
            .context("Failed to query stream sessions")?
            .collect::<Result<Vec<_>, _>>()
            .context("Failed to collect stream sessions")?;

        let mut codes_stmt = self
            .conn
            .prepare("SELECT code FROM upstream_stream_codes WHERE stream_id = ?1 ORDER BY code")
            .context("Failed to prepare query")?;

        for session in &mut sessions {
            session.codes = codes_stmt
                .query_map(params![&session.stream_id], |row| row.get(0))
                .context("Failed to query stream codes")?
                .collect::<Result<BTreeSet<String>, _>>()
                .context("Failed to collect stream codes")?;
        }

        Ok(sessions)
    }

    #[cfg(test)]
    pub(crate) fn connection(&self) -> &Connection {
        &self.conn
    }

    fn row_to_code(row: &rusqlite::Row) -> Result<CodeEntry, rusqlite::Error> {
        let created_at_str: String = row.get(3)?;
        let expires_at_str: Option<String> = row.get(4)?;

        Ok(CodeEntry {
            code: row.get(0)?,
            credential: row.get(1)?,
            service_id: row.get(2)?,
            created_at: parse_timestamp(3, &created_at_str)?,
            expires_at: expires_at_str
                .map(|s| parse_timestamp(4, &s))
                .transpose()?,
        })
    }

    fn row_to_stream(row: &rusqlite::Row) -> Result<StreamSession, rusqlite::Error> {
        let created_at_str: String = row.get(4)?;

        Ok(StreamSession {
            stream_id: row.get(0)?,
            credential: row.get(1)?,
            service_id: row.get(2)?,
            route: row.get(3)?,
            codes: BTreeSet::new(),
            created_at: parse_timestamp(4, &created_at_str)?,
        })
    }
}

fn parse_timestamp(column: usize, value: &str) -> Result<DateTime<Utc>, rusqlite::Error> {
    DateTime::parse_from_rfc3339(value)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(
            column,
            rusqlite::types::Type::Text,
            Box::new(e),
        ))
}

//! Embedded SQLite state store

use super::{KeyGuard, KeyLockDir, StateStore};
use crate::error::{Result, StateError};
use crate::record::{ResourceRecord, ScopePath, validate_segment};
use async_trait::async_trait;
use rusqlite::{Connection, OptionalExtension, params};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS resources (
    scope TEXT NOT NULL,
    id TEXT NOT NULL,
    kind TEXT NOT NULL,
    status TEXT NOT NULL,
    record TEXT NOT NULL,
    updated_at TEXT NOT NULL,
    PRIMARY KEY (scope, id)
);

CREATE INDEX IF NOT EXISTS idx_resources_scope ON resources(scope);
";

/// Stores records in one SQLite table
pub struct SqliteStateStore {
    path: PathBuf,
    conn: Arc<Mutex<Connection>>,
    locks: KeyLockDir,
}

impl SqliteStateStore {
    /// Open or create the database at `path`
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let conn = Connection::open(&path)?;
        conn.execute_batch(SCHEMA)?;

        let mut lock_dir = path.clone().into_os_string();
        lock_dir.push(".locks");

        Ok(Self {
            path,
            conn: Arc::new(Mutex::new(conn)),
            locks: KeyLockDir::new(PathBuf::from(lock_dir)),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn with_conn<T, F>(&self, f: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&Connection) -> Result<T> + Send + 'static,
    {
        let conn = self.conn.clone();
        tokio::task::spawn_blocking(move || {
            let conn = conn
                .lock()
                .map_err(|_| StateError::Backend("sqlite connection poisoned".into()))?;
            f(&conn)
        })
        .await?
    }
}

#[async_trait]
impl StateStore for SqliteStateStore {
    fn name(&self) -> &str {
        "sqlite"
    }

    async fn get(&self, scope: &ScopePath, id: &str) -> Result<Option<ResourceRecord>> {
        let scope_key = scope.to_string();
        let id = id.to_string();
        let key = scope.fqn(&id);

        let raw: Option<String> = self
            .with_conn(move |conn| {
                conn.query_row(
                    "SELECT record FROM resources WHERE scope = ?1 AND id = ?2",
                    params![scope_key, id],
                    |row| row.get(0),
                )
                .optional()
                .map_err(StateError::from)
            })
            .await?;

        let Some(raw) = raw else {
            return Ok(None);
        };
        let record: ResourceRecord = serde_json::from_str(&raw).map_err(|e| StateError::Corrupt {
            key,
            message: e.to_string(),
        })?;
        record.check_version()?;
        Ok(Some(record))
    }

    async fn set(&self, scope: &ScopePath, id: &str, record: &ResourceRecord) -> Result<()> {
        validate_segment(id)?;
        let scope_key = scope.to_string();
        let id = id.to_string();
        let kind = record.kind.clone();
        let status = record.status.to_string();
        let updated_at = record.updated_at.to_rfc3339();
        let raw = serde_json::to_string(record)?;

        self.with_conn(move |conn| {
            conn.execute(
                "INSERT INTO resources (scope, id, kind, status, record, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)
                 ON CONFLICT(scope, id) DO UPDATE SET
                    kind = excluded.kind,
                    status = excluded.status,
                    record = excluded.record,
                    updated_at = excluded.updated_at",
                params![scope_key, id, kind, status, raw, updated_at],
            )?;
            Ok(())
        })
        .await?;

        tracing::debug!("Wrote state record {} ({})", scope.fqn(&record.id), record.status);
        Ok(())
    }

    async fn delete(&self, scope: &ScopePath, id: &str) -> Result<()> {
        let scope_key = scope.to_string();
        let id = id.to_string();
        self.with_conn(move |conn| {
            conn.execute(
                "DELETE FROM resources WHERE scope = ?1 AND id = ?2",
                params![scope_key, id],
            )?;
            Ok(())
        })
        .await
    }

    async fn list(&self, scope: &ScopePath) -> Result<Vec<String>> {
        let scope_key = scope.to_string();
        self.with_conn(move |conn| {
            let mut stmt = conn.prepare("SELECT id FROM resources WHERE scope = ?1 ORDER BY id")?;
            let ids = stmt
                .query_map(params![scope_key], |row| row.get::<_, String>(0))?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(ids)
        })
        .await
    }

    async fn list_scopes(&self, prefix: &ScopePath) -> Result<Vec<ScopePath>> {
        let exact = prefix.to_string();
        let nested = format!("{}/", exact);
        let raw: Vec<String> = self
            .with_conn(move |conn| {
                // substr comparison avoids LIKE wildcards in scope names
                let mut stmt = conn.prepare(
                    "SELECT DISTINCT scope FROM resources
                     WHERE scope = ?1 OR substr(scope, 1, length(?2)) = ?2
                     ORDER BY scope",
                )?;
                let scopes = stmt
                    .query_map(params![exact, nested], |row| row.get::<_, String>(0))?
                    .collect::<rusqlite::Result<Vec<_>>>()?;
                Ok(scopes)
            })
            .await?;

        let mut scopes = raw
            .into_iter()
            .map(|s| s.parse::<ScopePath>())
            .collect::<Result<Vec<_>>>()?;
        scopes.sort();
        Ok(scopes)
    }

    async fn lock(&self, scope: &ScopePath, id: &str) -> Result<KeyGuard> {
        validate_segment(id)?;
        self.locks.lock(scope, id).await
    }
}

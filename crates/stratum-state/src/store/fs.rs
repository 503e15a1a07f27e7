//! Filesystem state store
//!
//! Layout under the project root:
//!
//! ```text
//! .stratum/
//!   state/<app>/<stage>/<scope>.../<id>.json
//!   locks/<key>.lock
//! ```

use super::{KeyGuard, KeyLockDir, StateStore};
use crate::error::{Result, StateError};
use crate::record::{ResourceRecord, ScopePath, validate_segment};
use async_trait::async_trait;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::fs;

const STATE_DIR: &str = ".stratum";
const RECORDS_DIR: &str = "state";
const LOCKS_DIR: &str = "locks";
const RECORD_EXT: &str = "json";

/// Stores each record as a pretty-printed JSON file
pub struct FileSystemStateStore {
    records_dir: PathBuf,
    locks: KeyLockDir,
}

impl FileSystemStateStore {
    pub fn new(project_root: impl AsRef<Path>) -> Self {
        let state_dir = project_root.as_ref().join(STATE_DIR);
        Self {
            records_dir: state_dir.join(RECORDS_DIR),
            locks: KeyLockDir::new(state_dir.join(LOCKS_DIR)),
        }
    }

    pub fn with_lock_timeout(mut self, timeout: Duration) -> Self {
        self.locks = self.locks.with_timeout(timeout);
        self
    }

    fn scope_dir(&self, scope: &ScopePath) -> PathBuf {
        scope
            .segments()
            .iter()
            .fold(self.records_dir.clone(), |dir, segment| dir.join(segment))
    }

    fn record_path(&self, scope: &ScopePath, id: &str) -> Result<PathBuf> {
        validate_segment(id)?;
        Ok(self
            .scope_dir(scope)
            .join(format!("{}.{}", id, RECORD_EXT)))
    }

    fn scope_from_dir(&self, dir: &Path) -> Option<ScopePath> {
        let relative = dir.strip_prefix(&self.records_dir).ok()?;
        let segments: Vec<String> = relative
            .components()
            .map(|c| c.as_os_str().to_string_lossy().into_owned())
            .collect();
        ScopePath::from_segments(segments).ok()
    }
}

#[async_trait]
impl StateStore for FileSystemStateStore {
    fn name(&self) -> &str {
        "filesystem"
    }

    async fn init(&self) -> Result<()> {
        if !self.records_dir.exists() {
            fs::create_dir_all(&self.records_dir).await?;
            tracing::debug!("Created state directory: {}", self.records_dir.display());
        }
        Ok(())
    }

    async fn get(&self, scope: &ScopePath, id: &str) -> Result<Option<ResourceRecord>> {
        let path = self.record_path(scope, id)?;
        let content = match fs::read_to_string(&path).await {
            Ok(content) => content,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };

        let record: ResourceRecord =
            serde_json::from_str(&content).map_err(|e| StateError::Corrupt {
                key: scope.fqn(id),
                message: e.to_string(),
            })?;
        record.check_version()?;
        Ok(Some(record))
    }

    async fn set(&self, scope: &ScopePath, id: &str, record: &ResourceRecord) -> Result<()> {
        let path = self.record_path(scope, id)?;
        let dir = self.scope_dir(scope);
        fs::create_dir_all(&dir).await?;

        // Write to a temp file first so a crash never leaves a torn record
        let tmp = dir.join(format!(".{}.{}.tmp", id, std::process::id()));
        let content = serde_json::to_string_pretty(record)?;
        fs::write(&tmp, content).await?;
        fs::rename(&tmp, &path).await?;

        tracing::debug!("Wrote state record {} ({})", scope.fqn(id), record.status);
        Ok(())
    }

    async fn delete(&self, scope: &ScopePath, id: &str) -> Result<()> {
        let path = self.record_path(scope, id)?;
        match fs::remove_file(&path).await {
            Ok(()) => {}
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(()),
            Err(e) => return Err(e.into()),
        }
        tracing::debug!("Deleted state record {}", scope.fqn(id));

        // Prune empty scope directories up to the records root
        let mut dir = self.scope_dir(scope);
        while dir != self.records_dir {
            match fs::remove_dir(&dir).await {
                Ok(()) => {}
                Err(_) => break,
            }
            match dir.parent() {
                Some(parent) => dir = parent.to_path_buf(),
                None => break,
            }
        }
        Ok(())
    }

    async fn list(&self, scope: &ScopePath) -> Result<Vec<String>> {
        let dir = self.scope_dir(scope);
        let mut entries = match fs::read_dir(&dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut ids = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            if !entry.file_type().await?.is_file() {
                continue;
            }
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some(RECORD_EXT) {
                continue;
            }
            // Temp files end in `.tmp`, so dotted ids such as `.env` are records too
            if let Some(stem) = path.file_stem().and_then(|s| s.to_str()) {
                ids.push(stem.to_string());
            }
        }
        ids.sort();
        Ok(ids)
    }

    async fn list_scopes(&self, prefix: &ScopePath) -> Result<Vec<ScopePath>> {
        let mut scopes = Vec::new();
        let mut pending = vec![self.scope_dir(prefix)];

        while let Some(dir) = pending.pop() {
            let mut entries = match fs::read_dir(&dir).await {
                Ok(entries) => entries,
                Err(e) if e.kind() == ErrorKind::NotFound => continue,
                Err(e) => return Err(e.into()),
            };

            let mut has_records = false;
            while let Some(entry) = entries.next_entry().await? {
                let file_type = entry.file_type().await?;
                if file_type.is_dir() {
                    pending.push(entry.path());
                } else if entry.path().extension().and_then(|e| e.to_str()) == Some(RECORD_EXT)
                {
                    has_records = true;
                }
            }

            if has_records {
                if let Some(scope) = self.scope_from_dir(&dir) {
                    scopes.push(scope);
                }
            }
        }

        scopes.sort();
        Ok(scopes)
    }

    async fn lock(&self, scope: &ScopePath, id: &str) -> Result<KeyGuard> {
        validate_segment(id)?;
        self.locks.lock(scope, id).await
    }
}

//! State store abstraction
//!
//! Every backend persists [`ResourceRecord`]s keyed by `(scope path, id)` and
//! can enumerate them by scope path prefix, which the orphan pass relies on.

mod fs;
mod http;
mod memory;
mod sqlite;

pub use fs::FileSystemStateStore;
pub use http::HttpStateStore;
pub use memory::MemoryStateStore;
pub use sqlite::SqliteStateStore;

use crate::error::Result;
use crate::lock::{Lock, LockGuard};
use crate::record::{ResourceRecord, ScopePath};
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::time::Duration;

const DEFAULT_KEY_LOCK_TIMEOUT: Duration = Duration::from_secs(120);

/// Persistence backend for resource records
#[async_trait]
pub trait StateStore: Send + Sync {
    /// Backend name for logs (e.g. "filesystem", "sqlite")
    fn name(&self) -> &str;

    /// Prepare the backend (create directories, tables, check reachability)
    async fn init(&self) -> Result<()> {
        Ok(())
    }

    async fn get(&self, scope: &ScopePath, id: &str) -> Result<Option<ResourceRecord>>;

    async fn set(&self, scope: &ScopePath, id: &str, record: &ResourceRecord) -> Result<()>;

    /// Remove a record; removing an absent record is not an error
    async fn delete(&self, scope: &ScopePath, id: &str) -> Result<()>;

    /// Ids recorded directly in `scope`, sorted
    async fn list(&self, scope: &ScopePath) -> Result<Vec<String>>;

    /// Scope paths at or below `prefix` that hold at least one record, sorted
    async fn list_scopes(&self, prefix: &ScopePath) -> Result<Vec<ScopePath>>;

    /// Exclusive guard for one key, held across a read-decide-write
    async fn lock(&self, scope: &ScopePath, id: &str) -> Result<KeyGuard>;
}

/// Exclusive access to one `(scope, id)` key
#[derive(Debug)]
pub struct KeyGuard {
    inner: GuardInner,
}

#[derive(Debug)]
enum GuardInner {
    File(LockGuard),
    Memory(tokio::sync::OwnedMutexGuard<()>),
}

impl KeyGuard {
    pub fn from_lock(guard: LockGuard) -> Self {
        Self {
            inner: GuardInner::File(guard),
        }
    }

    pub fn from_mutex(guard: tokio::sync::OwnedMutexGuard<()>) -> Self {
        Self {
            inner: GuardInner::Memory(guard),
        }
    }

    pub async fn release(self) -> Result<()> {
        match self.inner {
            GuardInner::File(guard) => guard.release().await,
            GuardInner::Memory(guard) => {
                drop(guard);
                Ok(())
            }
        }
    }
}

/// Per-key lock files in a machine-local directory
#[derive(Debug, Clone)]
pub(crate) struct KeyLockDir {
    dir: PathBuf,
    timeout: Duration,
}

impl KeyLockDir {
    pub(crate) fn new(dir: impl AsRef<Path>) -> Self {
        Self {
            dir: dir.as_ref().to_path_buf(),
            timeout: DEFAULT_KEY_LOCK_TIMEOUT,
        }
    }

    pub(crate) fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub(crate) async fn lock(&self, scope: &ScopePath, id: &str) -> Result<KeyGuard> {
        let lock = Lock::new(&self.dir, &scope.fqn(id)).with_poll_interval(Duration::from_millis(25));
        let guard = lock.wait_timeout(self.timeout).await?;
        Ok(KeyGuard::from_lock(guard))
    }
}

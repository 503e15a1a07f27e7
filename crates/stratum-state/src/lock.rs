//! Advisory lock files
//!
//! A lock is a file created with `create_new` in a machine-local directory.
//! It guards short critical sections such as one resource transition or a
//! credential refresh. It is not a distributed lock.

use crate::error::{Result, StateError};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::fs;
use tokio::io::AsyncWriteExt;

const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(100);
const DEFAULT_STALE_AFTER: Duration = Duration::from_secs(60 * 60);

/// A named lock backed by a file
#[derive(Debug, Clone)]
pub struct Lock {
    key: String,
    path: PathBuf,
    poll_interval: Duration,
    stale_after: Duration,
}

/// Lock information written into the lock file
#[derive(Debug, Serialize, Deserialize)]
struct LockInfo {
    holder: String,
    pid: u32,
    acquired_at: DateTime<Utc>,
}

impl Lock {
    pub fn new(dir: impl AsRef<Path>, key: &str) -> Self {
        let path = dir
            .as_ref()
            .join(format!("{}.lock", sanitize_key(key)));
        Self {
            key: key.to_string(),
            path,
            poll_interval: DEFAULT_POLL_INTERVAL,
            stale_after: DEFAULT_STALE_AFTER,
        }
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn with_stale_after(mut self, stale_after: Duration) -> Self {
        self.stale_after = stale_after;
        self
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Try to take the lock; `None` when someone else holds it
    pub async fn acquire(&self) -> Result<Option<LockGuard>> {
        if let Some(dir) = self.path.parent() {
            fs::create_dir_all(dir).await?;
        }

        match self.create_lock_file().await {
            Ok(guard) => Ok(Some(guard)),
            Err(e) if e.kind() == ErrorKind::AlreadyExists => {
                if self.remove_if_stale().await? {
                    match self.create_lock_file().await {
                        Ok(guard) => Ok(Some(guard)),
                        Err(e) if e.kind() == ErrorKind::AlreadyExists => Ok(None),
                        Err(e) => Err(e.into()),
                    }
                } else {
                    Ok(None)
                }
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Poll until the lock is free, then take it
    pub async fn wait(&self) -> Result<LockGuard> {
        loop {
            if let Some(guard) = self.acquire().await? {
                return Ok(guard);
            }
            tracing::trace!("Waiting for lock {}", self.key);
            tokio::time::sleep(self.poll_interval).await;
        }
    }

    /// Like [`Lock::wait`] but gives up after `timeout`
    pub async fn wait_timeout(&self, timeout: Duration) -> Result<LockGuard> {
        tokio::time::timeout(timeout, self.wait())
            .await
            .map_err(|_| StateError::LockTimeout(self.key.clone()))?
    }

    /// Whether the lock is currently held
    pub async fn check(&self) -> Result<bool> {
        match fs::metadata(&self.path).await {
            Ok(_) => Ok(true),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    async fn create_lock_file(&self) -> std::io::Result<LockGuard> {
        let mut file = fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&self.path)
            .await?;

        let info = LockInfo {
            holder: std::env::var("HOSTNAME")
                .or_else(|_| std::env::var("HOST"))
                .unwrap_or_else(|_| "unknown".to_string()),
            pid: std::process::id(),
            acquired_at: Utc::now(),
        };
        let content = serde_json::to_vec(&info).map_err(std::io::Error::other)?;
        file.write_all(&content).await?;
        file.flush().await?;

        tracing::trace!("Acquired lock {}", self.key);
        Ok(LockGuard {
            key: self.key.clone(),
            path: self.path.clone(),
            released: false,
        })
    }

    async fn remove_if_stale(&self) -> Result<bool> {
        let content = match fs::read_to_string(&self.path).await {
            Ok(content) => content,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(true),
            Err(e) => return Err(e.into()),
        };

        match serde_json::from_str::<LockInfo>(&content) {
            Ok(info) => {
                let age = Utc::now().signed_duration_since(info.acquired_at);
                let stale = age
                    .to_std()
                    .map(|age| age >= self.stale_after)
                    .unwrap_or(false);
                if !stale {
                    return Ok(false);
                }
                tracing::warn!(
                    "Removing stale lock {} held by {} (pid {}) since {}",
                    self.key,
                    info.holder,
                    info.pid,
                    info.acquired_at
                );
            }
            Err(_) => {
                // Unreadable info: the holder is still writing it or died doing so
                let modified = match fs::metadata(&self.path).await {
                    Ok(metadata) => metadata.modified()?,
                    Err(e) if e.kind() == ErrorKind::NotFound => return Ok(true),
                    Err(e) => return Err(e.into()),
                };
                let stale = modified
                    .elapsed()
                    .map(|age| age >= self.stale_after)
                    .unwrap_or(false);
                if !stale {
                    return Ok(false);
                }
                tracing::warn!("Removing stale lock {} with unreadable holder info", self.key);
            }
        }

        match fs::remove_file(&self.path).await {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(true),
            Err(e) => Err(e.into()),
        }
    }
}

/// RAII guard for a held lock
#[derive(Debug)]
pub struct LockGuard {
    key: String,
    path: PathBuf,
    released: bool,
}

impl LockGuard {
    pub fn key(&self) -> &str {
        &self.key
    }

    /// Release the lock
    pub async fn release(mut self) -> Result<()> {
        self.released = true;
        match fs::remove_file(&self.path).await {
            Ok(()) => {
                tracing::trace!("Released lock {}", self.key);
                Ok(())
            }
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        if !self.released {
            let _ = std::fs::remove_file(&self.path);
        }
    }
}

/// Turn an arbitrary key into a file name
pub fn sanitize_key(key: &str) -> String {
    let readable: String = key
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' || c == '_' {
                c
            } else {
                '_'
            }
        })
        .take(80)
        .collect();
    // Distinct keys may sanitize to the same text, so keep them apart with a hash
    let digest = blake3::hash(key.as_bytes()).to_hex();
    format!("{}-{}", readable, &digest[..16])
}

//! In-process state store, used for tests and throwaway runs

use super::{KeyGuard, StateStore};
use crate::error::Result;
use crate::record::{ResourceRecord, ScopePath, validate_segment};
use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use tokio::sync::Mutex;

type Key = (ScopePath, String);

#[derive(Default)]
pub struct MemoryStateStore {
    records: Mutex<BTreeMap<Key, ResourceRecord>>,
    key_locks: Mutex<HashMap<Key, Arc<Mutex<()>>>>,
    writes: AtomicUsize,
}

impl MemoryStateStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of `set`/`delete` calls so far
    pub fn write_count(&self) -> usize {
        self.writes.load(Ordering::SeqCst)
    }

    pub async fn len(&self) -> usize {
        self.records.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.records.lock().await.is_empty()
    }
}

#[async_trait]
impl StateStore for MemoryStateStore {
    fn name(&self) -> &str {
        "memory"
    }

    async fn get(&self, scope: &ScopePath, id: &str) -> Result<Option<ResourceRecord>> {
        let records = self.records.lock().await;
        Ok(records.get(&(scope.clone(), id.to_string())).cloned())
    }

    async fn set(&self, scope: &ScopePath, id: &str, record: &ResourceRecord) -> Result<()> {
        validate_segment(id)?;
        self.writes.fetch_add(1, Ordering::SeqCst);
        self.records
            .lock()
            .await
            .insert((scope.clone(), id.to_string()), record.clone());
        Ok(())
    }

    async fn delete(&self, scope: &ScopePath, id: &str) -> Result<()> {
        self.writes.fetch_add(1, Ordering::SeqCst);
        self.records
            .lock()
            .await
            .remove(&(scope.clone(), id.to_string()));
        Ok(())
    }

    async fn list(&self, scope: &ScopePath) -> Result<Vec<String>> {
        let records = self.records.lock().await;
        Ok(records
            .keys()
            .filter(|(s, _)| s == scope)
            .map(|(_, id)| id.clone())
            .collect())
    }

    async fn list_scopes(&self, prefix: &ScopePath) -> Result<Vec<ScopePath>> {
        let records = self.records.lock().await;
        let mut scopes: Vec<ScopePath> = records
            .keys()
            .filter(|(s, _)| s.starts_with(prefix))
            .map(|(s, _)| s.clone())
            .collect();
        scopes.dedup();
        Ok(scopes)
    }

    async fn lock(&self, scope: &ScopePath, id: &str) -> Result<KeyGuard> {
        let mutex = {
            let mut locks = self.key_locks.lock().await;
            // Entries only the map refers to are neither held nor awaited
            locks.retain(|_, mutex| Arc::strong_count(mutex) > 1);
            locks
                .entry((scope.clone(), id.to_string()))
                .or_default()
                .clone()
        };
        Ok(KeyGuard::from_mutex(mutex.lock_owned().await))
    }
}

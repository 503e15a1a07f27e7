//! Scope tree
//!
//! A [`Scope`] is one node of the namespace tree of a pass. The root scope
//! (`app/stage`) owns the state store handle, the handler registry, the
//! emulator controller and the cancellation token; children borrow them.
//! Each scope remembers which resource ids were seen during the pass so the
//! orphan pass can tell survivors from orphans.

use crate::action::{ActionType, PassReport};
use crate::error::{EngineError, Result};
use crate::options::{Phase, ScopeOptions};
use crate::resource::{HandlerContext, LifecycleEvent};
use serde_json::Value;
use std::collections::{BTreeSet, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use stratum_state::secret::ensure_no_sealed;
use stratum_state::{ResourceRecord, ScopePath, StateStore};
use tracing::debug;

/// State shared by every scope of one tree
pub(crate) struct Shared {
    pub(crate) options: ScopeOptions,
    pub(crate) store: Arc<dyn StateStore>,
    pub(crate) root_path: ScopePath,
    report: Mutex<PassReport>,
}

pub(crate) struct ScopeInner {
    name: String,
    path: ScopePath,
    parent: Option<Weak<ScopeInner>>,
    pub(crate) shared: Arc<Shared>,
    children: Mutex<Vec<Scope>>,
    declared: Mutex<HashSet<String>>,
    seen: Mutex<BTreeSet<String>>,
    finalized: AtomicBool,
}

/// A node of the scope tree
#[derive(Clone)]
pub struct Scope {
    pub(crate) inner: Arc<ScopeInner>,
}

impl std::fmt::Debug for Scope {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Scope")
            .field("path", &self.inner.path)
            .field("phase", &self.phase())
            .finish_non_exhaustive()
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

impl Scope {
    /// Root scope of `options.app` / `options.stage`
    pub fn root(options: ScopeOptions, store: Arc<dyn StateStore>) -> Result<Self> {
        let path = ScopePath::root(&options.app, &options.stage)
            .map_err(|e| EngineError::InvalidId(e.to_string()))?;
        let shared = Arc::new(Shared {
            options,
            store,
            root_path: path.clone(),
            report: Mutex::new(PassReport::new()),
        });
        Ok(Self::with_parts(path.name().to_string(), path, None, shared))
    }

    fn with_parts(
        name: String,
        path: ScopePath,
        parent: Option<Weak<ScopeInner>>,
        shared: Arc<Shared>,
    ) -> Self {
        Self {
            inner: Arc::new(ScopeInner {
                name,
                path,
                parent,
                shared,
                children: Mutex::new(Vec::new()),
                declared: Mutex::new(HashSet::new()),
                seen: Mutex::new(BTreeSet::new()),
                finalized: AtomicBool::new(false),
            }),
        }
    }

    /// Child scope `name`, created on first use
    pub fn child(&self, name: &str) -> Result<Scope> {
        let path = self
            .inner
            .path
            .child(name)
            .map_err(|e| EngineError::InvalidId(e.to_string()))?;

        let mut children = lock(&self.inner.children);
        if let Some(existing) = children.iter().find(|c| c.name() == name) {
            return Ok(existing.clone());
        }
        let child = Self::with_parts(
            name.to_string(),
            path,
            Some(Arc::downgrade(&self.inner)),
            Arc::clone(&self.inner.shared),
        );
        children.push(child.clone());
        debug!("Entered scope {}", child.path());
        Ok(child)
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn path(&self) -> &ScopePath {
        &self.inner.path
    }

    pub fn parent(&self) -> Option<Scope> {
        self.inner
            .parent
            .as_ref()
            .and_then(Weak::upgrade)
            .map(|inner| Scope { inner })
    }

    pub fn phase(&self) -> Phase {
        self.inner.shared.options.phase
    }

    pub fn stage(&self) -> &str {
        &self.inner.shared.options.stage
    }

    pub fn app(&self) -> &str {
        &self.inner.shared.options.app
    }

    pub fn is_local(&self) -> bool {
        self.inner.shared.options.local
    }

    pub fn store(&self) -> &Arc<dyn StateStore> {
        &self.inner.shared.store
    }

    pub fn options(&self) -> &ScopeOptions {
        &self.inner.shared.options
    }

    /// Ids seen in this scope during the current pass
    pub fn seen_ids(&self) -> BTreeSet<String> {
        lock(&self.inner.seen).clone()
    }

    /// Child scopes in creation order
    pub fn children(&self) -> Vec<Scope> {
        lock(&self.inner.children).clone()
    }

    pub fn is_finalized(&self) -> bool {
        self.inner.finalized.load(Ordering::SeqCst)
    }

    /// Actions taken so far by the whole tree
    pub fn report(&self) -> PassReport {
        lock(&self.inner.shared.report).clone()
    }

    /// This scope and all of its descendants, parents before children
    pub fn descendants(&self) -> Vec<Scope> {
        let mut all = vec![self.clone()];
        let mut index = 0;
        while index < all.len() {
            let children = all[index].children();
            all.extend(children);
            index += 1;
        }
        all
    }

    pub(crate) fn is_cancelled(&self) -> bool {
        self.inner.shared.options.cancellation.is_cancelled()
    }

    /// Reject an id declared twice in this scope during one pass
    pub(crate) fn declare(&self, id: &str) -> Result<()> {
        if !lock(&self.inner.declared).insert(id.to_string()) {
            return Err(EngineError::DuplicateId {
                scope: self.path().to_string(),
                id: id.to_string(),
            });
        }
        Ok(())
    }

    pub(crate) fn mark_seen(&self, id: &str) {
        lock(&self.inner.seen).insert(id.to_string());
    }

    pub(crate) fn unmark_seen(&self, id: &str) {
        lock(&self.inner.seen).remove(id);
    }

    pub(crate) fn mark_finalized(&self) -> bool {
        !self.inner.finalized.swap(true, Ordering::SeqCst)
    }

    pub(crate) fn record_action(&self, action: ActionType, fqn: &str) {
        lock(&self.inner.shared.report).record(action, fqn);
    }

    pub(crate) fn handler_context(
        &self,
        scope: &ScopePath,
        id: &str,
        event: LifecycleEvent,
        output: Option<Value>,
        adopt: bool,
    ) -> HandlerContext {
        let options = &self.inner.shared.options;
        HandlerContext {
            id: id.to_string(),
            fqn: scope.fqn(id),
            event,
            phase: options.phase,
            scope: scope.clone(),
            app: options.app.clone(),
            stage: options.stage.clone(),
            local: options.local,
            output: output.filter(|v| !v.is_null()),
            adopt,
            emulator: options.emulator.clone(),
        }
    }

    /// Read a record and open its sealed secrets
    pub(crate) async fn load_record(
        &self,
        scope: &ScopePath,
        id: &str,
    ) -> Result<Option<ResourceRecord>> {
        let Some(mut record) = self.store().get(scope, id).await? else {
            return Ok(None);
        };
        record.check_version()?;

        match &self.inner.shared.options.cipher {
            Some(cipher) => {
                record.props = cipher.unseal(&record.props)?;
                record.output = cipher.unseal(&record.output)?;
                record.pending_replacements = record
                    .pending_replacements
                    .iter()
                    .map(|p| cipher.unseal(p))
                    .collect::<stratum_state::Result<_>>()?;
            }
            None => {
                ensure_no_sealed(&record.props)?;
                ensure_no_sealed(&record.output)?;
                for pending in &record.pending_replacements {
                    ensure_no_sealed(pending)?;
                }
            }
        }
        Ok(Some(record))
    }

    /// Seal secrets and write a record
    pub(crate) async fn store_record(
        &self,
        scope: &ScopePath,
        record: &ResourceRecord,
    ) -> Result<()> {
        match &self.inner.shared.options.cipher {
            Some(cipher) => {
                let mut sealed = record.clone();
                sealed.props = cipher.seal(&record.props)?;
                sealed.output = cipher.seal(&record.output)?;
                sealed.pending_replacements = record
                    .pending_replacements
                    .iter()
                    .map(|p| cipher.seal(p))
                    .collect::<stratum_state::Result<_>>()?;
                self.store().set(scope, &record.id, &sealed).await?;
            }
            None => self.store().set(scope, &record.id, record).await?,
        }
        debug!("Stored {} ({})", record.fqn, record.status);
        Ok(())
    }

    /// Write a record of this scope; anything recorded counts as seen
    pub(crate) async fn persist(&self, record: &ResourceRecord) -> Result<()> {
        self.store_record(self.path(), record).await?;
        self.mark_seen(&record.id);
        Ok(())
    }

    /// Remove a record of this scope
    pub(crate) async fn forget(&self, id: &str) -> Result<()> {
        self.store().delete(self.path(), id).await?;
        self.unmark_seen(id);
        Ok(())
    }
}

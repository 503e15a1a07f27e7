//! Orphan pass
//!
//! After the program has declared everything, records that were not seen in
//! this pass (or, in `destroy`, every record) are deleted. Deletion runs over
//! the whole subtree of the finalized scope at once so dependents are always
//! removed before what they depend on, also across scopes.

use crate::action::{ActionType, PassReport};
use crate::error::{EngineError, Result};
use crate::lifecycle::PendingReplacement;
use crate::options::Phase;
use crate::resource::ResourceHandler;
use crate::scope::Scope;
use std::cmp::Reverse;
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use stratum_state::{ResourceRecord, ResourceStatus, ScopePath};
use tracing::{debug, info};

struct Doomed {
    scope: ScopePath,
    record: ResourceRecord,
    handler: Arc<dyn ResourceHandler>,
}

impl Scope {
    /// Delete what this scope and its descendants no longer declare
    ///
    /// Finalizing a scope also finalizes its descendants; finalizing twice is
    /// a no-op.
    pub async fn finalize(&self) -> Result<PassReport> {
        if !self.mark_finalized() {
            return Ok(PassReport::new());
        }
        let live = self.descendants();
        for scope in live.iter().skip(1) {
            scope.mark_finalized();
        }

        if self.phase() == Phase::Read {
            return Ok(PassReport::new());
        }
        if self.is_cancelled() {
            return Err(EngineError::Cancelled);
        }

        let doomed = self.collect_doomed(&live).await?;
        if doomed.is_empty() {
            debug!("Nothing to remove under {}", self.path());
            return Ok(PassReport::new());
        }

        self.check_survivors(&doomed).await?;
        let order = deletion_order(&doomed)?;

        let mut report = PassReport::new();
        let mut doomed: Vec<Option<Doomed>> = doomed.into_iter().map(Some).collect();
        for index in order {
            let Some(target) = doomed[index].take() else {
                continue;
            };
            if self.is_cancelled() {
                return Err(EngineError::Cancelled);
            }

            let fqn = target.record.fqn.clone();
            let guard = self.store().lock(&target.scope, &target.record.id).await?;
            let result = self.delete_recorded(target).await;
            let released = guard.release().await;
            result?;
            released?;

            info!("delete {}", fqn);
            self.record_action(ActionType::Delete, &fqn);
            report.record(ActionType::Delete, fqn);
        }

        info!(
            "Removed {} resource(s) under {}",
            report.count(ActionType::Delete),
            self.path()
        );
        Ok(report)
    }

    /// Orphans of live scopes plus everything in scopes not created this pass
    async fn collect_doomed(&self, live: &[Scope]) -> Result<Vec<Doomed>> {
        let live: HashMap<&ScopePath, &Scope> = live.iter().map(|s| (s.path(), s)).collect();
        let destroy = self.phase() == Phase::Destroy;

        let mut doomed = Vec::new();
        for scope_path in self.store().list_scopes(self.path()).await? {
            let seen = match live.get(&scope_path) {
                Some(scope) if !destroy => scope.seen_ids(),
                _ => BTreeSet::new(),
            };
            for id in self.store().list(&scope_path).await? {
                if seen.contains(&id) {
                    continue;
                }
                let Some(record) = self.load_record(&scope_path, &id).await? else {
                    continue;
                };
                let handler = self.options().registry.get(&record.kind).ok_or_else(|| {
                    EngineError::UnknownKind {
                        kind: record.kind.clone(),
                        fqn: record.fqn.clone(),
                    }
                })?;
                debug!("{} is no longer declared", record.fqn);
                doomed.push(Doomed {
                    scope: scope_path.clone(),
                    record,
                    handler,
                });
            }
        }
        Ok(doomed)
    }

    /// Fail when a record that stays depends on one about to be deleted
    async fn check_survivors(&self, doomed: &[Doomed]) -> Result<()> {
        let doomed_fqns: BTreeSet<&str> = doomed.iter().map(|d| d.record.fqn.as_str()).collect();
        let root = &self.inner.shared.root_path;

        for scope_path in self.store().list_scopes(root).await? {
            for id in self.store().list(&scope_path).await? {
                let fqn = scope_path.fqn(&id);
                if doomed_fqns.contains(fqn.as_str()) {
                    continue;
                }
                let Some(record) = self.store().get(&scope_path, &id).await? else {
                    continue;
                };
                if let Some(dependency) = record
                    .dependencies
                    .iter()
                    .find(|d| doomed_fqns.contains(d.as_str()))
                {
                    return Err(EngineError::Dependency(format!(
                        "{} still depends on {}, which is no longer declared",
                        record.fqn, dependency
                    )));
                }
            }
        }
        Ok(())
    }

    async fn delete_recorded(&self, target: Doomed) -> Result<()> {
        let Doomed {
            scope,
            mut record,
            handler,
        } = target;

        record.transition(ResourceStatus::Deleting);
        self.store_record(&scope, &record).await?;

        while let Some(entry) = record.pending_replacements.first().cloned() {
            let old: PendingReplacement = serde_json::from_value(entry)?;
            let old_handler = if old.kind == handler.kind() {
                Arc::clone(&handler)
            } else {
                self.options().registry.get(&old.kind).ok_or_else(|| {
                    EngineError::UnknownKind {
                        kind: old.kind.clone(),
                        fqn: record.fqn.clone(),
                    }
                })?
            };
            if let Err(e) = self.run_delete(&old_handler, &scope, &record.id, &old).await {
                return Err(self.fail_at(&scope, &mut record, e).await);
            }
            record.pending_replacements.remove(0);
            self.store_record(&scope, &record).await?;
        }

        let target = PendingReplacement {
            kind: record.kind.clone(),
            props: record.props.clone(),
            output: record.output.clone(),
        };
        if let Err(e) = self.run_delete(&handler, &scope, &record.id, &target).await {
            return Err(self.fail_at(&scope, &mut record, e).await);
        }

        self.store().delete(&scope, &record.id).await?;
        Ok(())
    }
}

/// Dependents before dependencies; ties go to deeper scopes, then ids
fn deletion_order(doomed: &[Doomed]) -> Result<Vec<usize>> {
    let index: HashMap<&str, usize> = doomed
        .iter()
        .enumerate()
        .map(|(i, d)| (d.record.fqn.as_str(), i))
        .collect();

    // blockers[i]: doomed records that depend on i and must go first
    let mut blockers = vec![0usize; doomed.len()];
    let mut depends_on: Vec<Vec<usize>> = vec![Vec::new(); doomed.len()];
    for (i, d) in doomed.iter().enumerate() {
        for dependency in &d.record.dependencies {
            if let Some(&j) = index.get(dependency.as_str()) {
                if !depends_on[i].contains(&j) {
                    depends_on[i].push(j);
                    blockers[j] += 1;
                }
            }
        }
    }

    let key = |i: usize| {
        (
            Reverse(doomed[i].scope.depth()),
            doomed[i].record.id.clone(),
            doomed[i].record.fqn.clone(),
            i,
        )
    };
    let mut ready: BTreeSet<_> = (0..doomed.len())
        .filter(|&i| blockers[i] == 0)
        .map(key)
        .collect();

    let mut order = Vec::with_capacity(doomed.len());
    while let Some(next) = ready.pop_first() {
        let i = next.3;
        order.push(i);
        for &j in &depends_on[i] {
            blockers[j] -= 1;
            if blockers[j] == 0 {
                ready.insert(key(j));
            }
        }
    }

    if order.len() < doomed.len() {
        let mut stuck: Vec<&str> = (0..doomed.len())
            .filter(|i| !order.contains(i))
            .map(|i| doomed[i].record.fqn.as_str())
            .collect();
        stuck.sort();
        return Err(EngineError::Dependency(format!(
            "dependency cycle among {}",
            stuck.join(", ")
        )));
    }
    Ok(order)
}

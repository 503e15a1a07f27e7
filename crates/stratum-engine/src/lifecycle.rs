//! Resource lifecycle engine
//!
//! `Scope::apply` loads the prior record of a declaration, decides which
//! transition to run, calls the handler and persists the result. Every
//! transition writes its non-terminal status (`creating`, `updating`,
//! `deleting`) before the handler is called, so an interrupted pass is
//! resumed on the next run instead of being assumed complete.

use crate::action::{ActionType, Applied};
use crate::error::{EngineError, Result};
use crate::options::Phase;
use crate::resource::{
    Change, Declaration, HandlerError, LifecycleEvent, Outcome, ReplaceStrategy, ResourceHandler,
};
use crate::scope::Scope;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use stratum_state::record::validate_segment;
use stratum_state::{ResourceRecord, ResourceStatus, ScopePath};
use tracing::{info, warn};

/// An old object waiting to be deleted after its replacement was created
#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) struct PendingReplacement {
    pub kind: String,
    pub props: Value,
    pub output: Value,
}

enum Created {
    Done,
    Conflict { name: String },
}

enum Updated {
    Done,
    ReplaceRequested,
}

fn non_null(value: &Value) -> Option<Value> {
    (!value.is_null()).then(|| value.clone())
}

impl Scope {
    /// Reconcile one declared resource against its recorded state
    pub async fn apply(&self, decl: Declaration) -> Result<Applied> {
        validate_segment(&decl.id).map_err(|e| EngineError::InvalidId(e.to_string()))?;
        self.declare(&decl.id)?;
        let fqn = self.path().fqn(&decl.id);

        match self.phase() {
            Phase::Read => self.apply_read(&decl, fqn).await,
            Phase::Destroy => {
                // Teardown happens in the orphan pass; the id stays unseen
                let output = self
                    .load_record(self.path(), &decl.id)
                    .await?
                    .map(|r| r.output)
                    .unwrap_or(Value::Null);
                Ok(Applied {
                    id: decl.id,
                    fqn,
                    action: ActionType::Read,
                    output,
                })
            }
            Phase::Up => {
                if self.is_cancelled() {
                    return Err(EngineError::Cancelled);
                }
                let guard = self.store().lock(self.path(), &decl.id).await?;
                let result = self.reconcile(&decl, &fqn).await;
                let released = guard.release().await;
                let applied = result?;
                released?;
                Ok(applied)
            }
        }
    }

    async fn apply_read(&self, decl: &Declaration, fqn: String) -> Result<Applied> {
        let (action, output) = match self.load_record(self.path(), &decl.id).await? {
            Some(record) => {
                self.mark_seen(&decl.id);
                (ActionType::Read, record.output)
            }
            None => (ActionType::Create, Value::Null),
        };
        self.record_action(action, &fqn);
        Ok(Applied {
            id: decl.id.clone(),
            fqn,
            action,
            output,
        })
    }

    async fn reconcile(&self, decl: &Declaration, fqn: &str) -> Result<Applied> {
        let handler = &decl.handler;
        let options = self.options();
        let adopt = decl.adopt.unwrap_or(options.adopt);
        let force = decl.force || options.force;
        let dependencies = self.resolve_dependencies(&decl.depends_on);

        let Some(prior) = self.load_record(self.path(), &decl.id).await? else {
            info!("Creating {}", fqn);
            let mut record = ResourceRecord::new(self.path(), &decl.id, handler.kind())
                .with_props(decl.props.clone())
                .with_dependencies(dependencies);
            if let Created::Conflict { name } =
                self.run_create(handler, &mut record, None, adopt, false).await?
            {
                // Nothing of ours exists remotely; drop the placeholder record
                self.forget(&decl.id).await?;
                return Err(EngineError::Conflict {
                    fqn: fqn.to_string(),
                    name,
                });
            }
            return self.finish(handler, record, ActionType::Create).await;
        };

        self.mark_seen(&decl.id);
        let mut record = prior.clone();
        record.dependencies = dependencies;

        let action = match prior.status {
            ResourceStatus::Deleting
                if prior.kind != handler.kind()
                    || handler.diff(&prior.props, &decl.props) != Change::None =>
            {
                // The recorded object is not the desired one; finish deleting it first
                info!("Resuming replacement of {}", fqn);
                let old = PendingReplacement {
                    kind: prior.kind.clone(),
                    props: prior.props.clone(),
                    output: prior.output.clone(),
                };
                self.delete_then_create(handler, &mut record, old, &decl.props, adopt)
                    .await?;
                ActionType::Replace
            }
            ResourceStatus::Creating | ResourceStatus::Deleting | ResourceStatus::Deleted => {
                info!("Resuming create of {} (was {})", fqn, prior.status);
                record.kind = handler.kind().to_string();
                record.props = decl.props.clone();
                let prior_output = non_null(&prior.output);
                if let Created::Conflict { name } = self
                    .run_create(handler, &mut record, prior_output, adopt, true)
                    .await?
                {
                    return Err(EngineError::Conflict {
                        fqn: fqn.to_string(),
                        name,
                    });
                }
                ActionType::Create
            }
            ResourceStatus::Updating => {
                info!("Resuming update of {}", fqn);
                record.props = decl.props.clone();
                self.update_or_replace(handler, &mut record, &prior, adopt)
                    .await?
            }
            ResourceStatus::Created if prior.kind != handler.kind() => {
                info!("Replacing {} ({} -> {})", fqn, prior.kind, handler.kind());
                self.replace(handler, &mut record, &prior, &decl.props, adopt)
                    .await?;
                ActionType::Replace
            }
            ResourceStatus::Created => {
                let policy = handler.policy();
                match handler.diff(&prior.props, &decl.props) {
                    Change::None if !force && !policy.always_fresh => {
                        if record.dependencies != prior.dependencies {
                            self.persist(&record).await?;
                        }
                        ActionType::NoOp
                    }
                    Change::Replace => {
                        info!("Replacing {}", fqn);
                        self.replace(handler, &mut record, &prior, &decl.props, adopt)
                            .await?;
                        ActionType::Replace
                    }
                    Change::None | Change::Update => {
                        info!("Updating {}", fqn);
                        record.props = decl.props.clone();
                        self.update_or_replace(handler, &mut record, &prior, adopt)
                            .await?
                    }
                }
            }
        };

        self.finish(handler, record, action).await
    }

    async fn finish(
        &self,
        handler: &Arc<dyn ResourceHandler>,
        mut record: ResourceRecord,
        action: ActionType,
    ) -> Result<Applied> {
        if !record.pending_replacements.is_empty() {
            self.flush_replacements(handler, &mut record).await?;
        }
        self.record_action(action, &record.fqn);
        if action != ActionType::NoOp {
            info!("{} {}", action, record.fqn);
        }
        Ok(Applied {
            id: record.id,
            fqn: record.fqn,
            action,
            output: record.output,
        })
    }

    /// Run update; fall back to replacement when the handler asks for it
    async fn update_or_replace(
        &self,
        handler: &Arc<dyn ResourceHandler>,
        record: &mut ResourceRecord,
        prior: &ResourceRecord,
        adopt: bool,
    ) -> Result<ActionType> {
        let desired = record.props.clone();
        match self
            .run_update(handler, record, non_null(&prior.output), adopt)
            .await?
        {
            Updated::Done => Ok(ActionType::Update),
            Updated::ReplaceRequested => {
                info!("{} cannot be updated in place, replacing", record.fqn);
                self.replace(handler, record, prior, &desired, adopt).await?;
                Ok(ActionType::Replace)
            }
        }
    }

    async fn replace(
        &self,
        handler: &Arc<dyn ResourceHandler>,
        record: &mut ResourceRecord,
        prior: &ResourceRecord,
        desired: &Value,
        adopt: bool,
    ) -> Result<()> {
        let old = PendingReplacement {
            kind: prior.kind.clone(),
            props: prior.props.clone(),
            output: prior.output.clone(),
        };
        record.kind = handler.kind().to_string();

        match handler.policy().replace_strategy {
            ReplaceStrategy::CreateBeforeDelete => {
                record
                    .pending_replacements
                    .push(serde_json::to_value(&old)?);
                record.props = desired.clone();
                record.output = Value::Null;

                if let Created::Conflict { name } =
                    self.run_create(handler, record, None, adopt, false).await?
                {
                    // Put the old object back in charge
                    record.kind = old.kind;
                    record.props = old.props;
                    record.output = old.output;
                    record.pending_replacements.pop();
                    record.transition(ResourceStatus::Created);
                    self.persist(record).await?;
                    return Err(EngineError::Conflict {
                        fqn: record.fqn.clone(),
                        name,
                    });
                }
                Ok(())
            }
            ReplaceStrategy::DeleteBeforeCreate => {
                record.kind = old.kind.clone();
                record.props = old.props.clone();
                record.output = old.output.clone();
                record.transition(ResourceStatus::Deleting);
                self.persist(record).await?;
                self.delete_then_create(handler, record, old, desired, adopt)
                    .await
            }
        }
    }

    /// Delete the old object of a `deleting` record, then create the desired one
    async fn delete_then_create(
        &self,
        handler: &Arc<dyn ResourceHandler>,
        record: &mut ResourceRecord,
        old: PendingReplacement,
        desired: &Value,
        adopt: bool,
    ) -> Result<()> {
        let old_handler = self.handler_for(&old.kind, &record.fqn, handler)?;
        if let Err(e) = self.run_delete(&old_handler, self.path(), &record.id, &old).await {
            return Err(self.fail(record, e).await);
        }

        record.kind = handler.kind().to_string();
        record.props = desired.clone();
        record.output = Value::Null;
        if let Created::Conflict { name } =
            self.run_create(handler, record, None, adopt, false).await?
        {
            self.forget(&record.id).await?;
            return Err(EngineError::Conflict {
                fqn: record.fqn.clone(),
                name,
            });
        }
        Ok(())
    }

    /// Persist `creating`, call create, persist `created`
    async fn run_create(
        &self,
        handler: &Arc<dyn ResourceHandler>,
        record: &mut ResourceRecord,
        prior_output: Option<Value>,
        adopt: bool,
        resumed: bool,
    ) -> Result<Created> {
        record.transition(ResourceStatus::Creating);
        self.persist(record).await?;

        let ctx = self.handler_context(
            self.path(),
            &record.id,
            LifecycleEvent::Create,
            prior_output.clone(),
            adopt,
        );
        match handler.handle(&ctx, &record.props).await {
            Ok(Outcome::Output(output)) => {
                record.output = output;
                record.transition(ResourceStatus::Created);
                self.persist(record).await?;
                Ok(Created::Done)
            }
            Ok(other) => Err(self
                .fail(
                    record,
                    anyhow::anyhow!("create returned {:?} instead of an output", other),
                )
                .await),
            Err(HandlerError::AlreadyExists { name, existing }) if adopt || resumed => {
                info!("Adopting existing object '{}' for {}", name, record.fqn);
                let discovered = existing.or(prior_output);
                match self.run_update(handler, record, discovered, true).await? {
                    Updated::Done => Ok(Created::Done),
                    Updated::ReplaceRequested => Err(self
                        .fail(
                            record,
                            anyhow::anyhow!("adopted object '{}' cannot be updated in place", name),
                        )
                        .await),
                }
            }
            Err(HandlerError::AlreadyExists { name, .. }) => Ok(Created::Conflict { name }),
            Err(HandlerError::Failed(e)) => Err(self.fail(record, e).await),
        }
    }

    /// Persist `updating`, call update, persist `created`
    async fn run_update(
        &self,
        handler: &Arc<dyn ResourceHandler>,
        record: &mut ResourceRecord,
        prior_output: Option<Value>,
        adopt: bool,
    ) -> Result<Updated> {
        record.transition(ResourceStatus::Updating);
        self.persist(record).await?;

        let ctx = self.handler_context(
            self.path(),
            &record.id,
            LifecycleEvent::Update,
            prior_output,
            adopt,
        );
        match handler.handle(&ctx, &record.props).await {
            Ok(Outcome::Output(output)) => {
                record.output = output;
                record.transition(ResourceStatus::Created);
                self.persist(record).await?;
                Ok(Updated::Done)
            }
            Ok(Outcome::Replace) => Ok(Updated::ReplaceRequested),
            Ok(Outcome::Destroyed) => Err(self
                .fail(record, anyhow::anyhow!("update reported the object as destroyed"))
                .await),
            Err(e @ HandlerError::AlreadyExists { .. }) => {
                Err(self.fail(record, anyhow::Error::new(e)).await)
            }
            Err(HandlerError::Failed(e)) => Err(self.fail(record, e).await),
        }
    }

    /// Call delete for an object described by `target`
    pub(crate) async fn run_delete(
        &self,
        handler: &Arc<dyn ResourceHandler>,
        scope: &ScopePath,
        id: &str,
        target: &PendingReplacement,
    ) -> anyhow::Result<()> {
        let ctx = self.handler_context(
            scope,
            id,
            LifecycleEvent::Delete,
            non_null(&target.output),
            false,
        );
        match handler.handle(&ctx, &target.props).await {
            Ok(Outcome::Replace) => Err(anyhow::anyhow!("delete cannot be answered with replace")),
            Ok(_) => Ok(()),
            Err(e) => Err(anyhow::Error::new(e)),
        }
    }

    /// Delete old objects left behind by create-before-delete replacements
    async fn flush_replacements(
        &self,
        declared: &Arc<dyn ResourceHandler>,
        record: &mut ResourceRecord,
    ) -> Result<()> {
        while let Some(entry) = record.pending_replacements.first().cloned() {
            let old: PendingReplacement = serde_json::from_value(entry)?;
            let handler = self.handler_for(&old.kind, &record.fqn, declared)?;

            info!("Deleting replaced object of {}", record.fqn);
            if let Err(e) = self.run_delete(&handler, self.path(), &record.id, &old).await {
                return Err(self.fail(record, e).await);
            }
            record.pending_replacements.remove(0);
            self.persist(record).await?;
        }
        Ok(())
    }

    /// Handler for `kind`, preferring the declaring handler when kinds match
    fn handler_for(
        &self,
        kind: &str,
        fqn: &str,
        declared: &Arc<dyn ResourceHandler>,
    ) -> Result<Arc<dyn ResourceHandler>> {
        if declared.kind() == kind {
            return Ok(Arc::clone(declared));
        }
        self.options()
            .registry
            .get(kind)
            .ok_or_else(|| EngineError::UnknownKind {
                kind: kind.to_string(),
                fqn: fqn.to_string(),
            })
    }

    /// Keep the current status, remember the failure and hand the error back
    pub(crate) async fn fail_at(
        &self,
        scope: &ScopePath,
        record: &mut ResourceRecord,
        source: anyhow::Error,
    ) -> EngineError {
        warn!("{} failed while {}: {:#}", record.fqn, record.status, source);
        record.mark_failed(format!("{:#}", source));
        if let Err(e) = self.store_record(scope, record).await {
            warn!("Could not record failure of {}: {}", record.fqn, e);
        }
        EngineError::Handler {
            fqn: record.fqn.clone(),
            source,
        }
    }

    async fn fail(&self, record: &mut ResourceRecord, source: anyhow::Error) -> EngineError {
        self.fail_at(self.path(), record, source).await
    }

    fn resolve_dependencies(&self, depends_on: &[String]) -> Vec<String> {
        let mut resolved: Vec<String> = Vec::new();
        for dependency in depends_on {
            let fqn = if dependency.contains('/') {
                dependency.clone()
            } else {
                self.path().fqn(dependency)
            };
            if !resolved.contains(&fqn) {
                resolved.push(fqn);
            }
        }
        resolved
    }
}

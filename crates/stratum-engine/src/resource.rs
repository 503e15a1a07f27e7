//! Resource handler contract
//!
//! Every concrete resource type implements [`ResourceHandler`]. The engine
//! decides *which* lifecycle event to run; the handler only talks to the
//! outside world for that event and returns the new output.

use crate::emulator::EmulatorController;
use crate::options::Phase;
use async_trait::async_trait;
use serde::Serialize;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use stratum_state::ScopePath;
use thiserror::Error;

/// Order of operations when a change forces replacement
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ReplaceStrategy {
    /// Create the new object, then delete the old one
    #[default]
    CreateBeforeDelete,
    /// Delete the old object first (e.g. globally unique names)
    DeleteBeforeCreate,
}

/// Per-type behaviour the engine needs to know about
#[derive(Debug, Clone, Default)]
pub struct ResourcePolicy {
    pub replace_strategy: ReplaceStrategy,

    /// Refresh on every pass even when nothing changed (read-through resources)
    pub always_fresh: bool,

    /// Top-level props that force replacement when changed
    pub replace_on: Vec<String>,
}

impl ResourcePolicy {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn replace_strategy(mut self, strategy: ReplaceStrategy) -> Self {
        self.replace_strategy = strategy;
        self
    }

    pub fn always_fresh(mut self) -> Self {
        self.always_fresh = true;
        self
    }

    pub fn replace_on<I, S>(mut self, fields: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.replace_on = fields.into_iter().map(Into::into).collect();
        self
    }
}

/// Result of comparing prior and desired props
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Change {
    None,
    Update,
    Replace,
}

/// Structural comparison honouring `replace_on`
pub fn default_diff(policy: &ResourcePolicy, prior: &Value, desired: &Value) -> Change {
    if prior == desired {
        return Change::None;
    }
    let forces_replace = policy
        .replace_on
        .iter()
        .any(|field| prior.get(field) != desired.get(field));
    if forces_replace {
        Change::Replace
    } else {
        Change::Update
    }
}

/// Lifecycle event a handler is asked to perform
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LifecycleEvent {
    Create,
    Update,
    Delete,
}

impl std::fmt::Display for LifecycleEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LifecycleEvent::Create => write!(f, "create"),
            LifecycleEvent::Update => write!(f, "update"),
            LifecycleEvent::Delete => write!(f, "delete"),
        }
    }
}

/// What a handler returns
#[derive(Debug, Clone, PartialEq)]
pub enum Outcome {
    /// The new output of the resource
    Output(Value),
    /// The object is gone (answer to a delete)
    Destroyed,
    /// The update cannot be done in place; recreate the object
    Replace,
}

/// Handler failures
#[derive(Error, Debug)]
pub enum HandlerError {
    /// The remote object already exists
    #[error("'{name}' already exists")]
    AlreadyExists {
        name: String,
        /// Output describing the discovered object, used for adoption
        existing: Option<Value>,
    },

    #[error(transparent)]
    Failed(#[from] anyhow::Error),
}

/// Everything a handler gets to know about the current call
#[derive(Debug, Clone)]
pub struct HandlerContext {
    pub id: String,
    pub fqn: String,
    pub event: LifecycleEvent,
    pub phase: Phase,
    pub scope: ScopePath,
    pub app: String,
    pub stage: String,
    pub local: bool,
    /// Prior output, if any
    pub output: Option<Value>,
    /// Claim a pre-existing object instead of failing
    pub adopt: bool,
    pub(crate) emulator: Option<EmulatorController>,
}

impl HandlerContext {
    /// Deterministic default physical name: `<app>-<id>-<stage>`
    pub fn physical_name(&self) -> String {
        physical_name(&self.app, &self.id, &self.stage)
    }

    pub fn output_as<T: serde::de::DeserializeOwned>(&self) -> Option<T> {
        self.output
            .as_ref()
            .and_then(|v| serde_json::from_value(v.clone()).ok())
    }

    /// Local emulator of this run, when running in local mode
    pub fn emulator(&self) -> Option<&EmulatorController> {
        self.emulator.as_ref()
    }

    /// Signal a completed delete
    pub fn destroy(&self) -> Outcome {
        Outcome::Destroyed
    }

    /// Signal that the update must be done by recreating the object
    pub fn replace(&self) -> Outcome {
        Outcome::Replace
    }

    /// Build an output outcome from any serializable value
    pub fn output<T: Serialize>(&self, value: &T) -> Result<Outcome, HandlerError> {
        let value = serde_json::to_value(value).map_err(anyhow::Error::from)?;
        Ok(Outcome::Output(value))
    }
}

pub fn physical_name(app: &str, id: &str, stage: &str) -> String {
    format!("{}-{}-{}", app, id, stage)
        .to_lowercase()
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' { c } else { '-' })
        .collect()
}

/// A resource type
#[async_trait]
pub trait ResourceHandler: Send + Sync {
    /// Type tag stored in every record of this type
    fn kind(&self) -> &str;

    fn policy(&self) -> ResourcePolicy {
        ResourcePolicy::default()
    }

    fn diff(&self, prior: &Value, desired: &Value) -> Change {
        default_diff(&self.policy(), prior, desired)
    }

    /// Perform `ctx.event`. For deletes, `props` are the last-applied props.
    async fn handle(&self, ctx: &HandlerContext, props: &Value) -> Result<Outcome, HandlerError>;
}

/// Handlers by kind, used to delete records whose declaration is gone
#[derive(Clone, Default)]
pub struct HandlerRegistry {
    handlers: HashMap<String, Arc<dyn ResourceHandler>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, handler: Arc<dyn ResourceHandler>) -> &mut Self {
        self.handlers.insert(handler.kind().to_string(), handler);
        self
    }

    pub fn with(mut self, handler: Arc<dyn ResourceHandler>) -> Self {
        self.register(handler);
        self
    }

    pub fn get(&self, kind: &str) -> Option<Arc<dyn ResourceHandler>> {
        self.handlers.get(kind).cloned()
    }

    pub fn kinds(&self) -> Vec<&str> {
        let mut kinds: Vec<&str> = self.handlers.keys().map(String::as_str).collect();
        kinds.sort();
        kinds
    }
}

impl std::fmt::Debug for HandlerRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HandlerRegistry")
            .field("kinds", &self.kinds())
            .finish()
    }
}

/// A desired resource, as declared by the program
#[derive(Clone)]
pub struct Declaration {
    pub id: String,
    pub handler: Arc<dyn ResourceHandler>,
    pub props: Value,
    /// Same-scope ids or full FQNs
    pub depends_on: Vec<String>,
    /// Overrides the run-wide adopt flag
    pub adopt: Option<bool>,
    /// Run the update handler even when nothing changed
    pub force: bool,
}

impl Declaration {
    pub fn new(id: impl Into<String>, handler: Arc<dyn ResourceHandler>, props: Value) -> Self {
        Self {
            id: id.into(),
            handler,
            props,
            depends_on: Vec::new(),
            adopt: None,
            force: false,
        }
    }

    pub fn typed<T: Serialize>(
        id: impl Into<String>,
        handler: Arc<dyn ResourceHandler>,
        props: &T,
    ) -> serde_json::Result<Self> {
        Ok(Self::new(id, handler, serde_json::to_value(props)?))
    }

    pub fn depends_on(mut self, dependency: impl Into<String>) -> Self {
        self.depends_on.push(dependency.into());
        self
    }

    pub fn adopt(mut self, adopt: bool) -> Self {
        self.adopt = Some(adopt);
        self
    }

    pub fn force(mut self, force: bool) -> Self {
        self.force = force;
        self
    }
}

impl std::fmt::Debug for Declaration {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Declaration")
            .field("id", &self.id)
            .field("kind", &self.handler.kind())
            .field("depends_on", &self.depends_on)
            .finish()
    }
}

use async_trait::async_trait;
use serde_json::{Value, json};
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex};
use stratum_engine::{
    HandlerContext, HandlerError, HandlerRegistry, LifecycleEvent, Outcome, Phase,
    ReplaceStrategy, ResourceHandler, ResourcePolicy, ScopeOptions,
};
use stratum_state::MemoryStateStore;

/// Remote objects shared by every fake handler of a test
#[derive(Clone, Default)]
pub struct FakeCloud {
    pub objects: Arc<Mutex<BTreeMap<String, Value>>>,
    pub calls: Arc<Mutex<Vec<(LifecycleEvent, String)>>>,
}

impl FakeCloud {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn calls(&self) -> Vec<(LifecycleEvent, String)> {
        self.calls.lock().unwrap().clone()
    }

    #[allow(dead_code)]
    pub fn calls_for(&self, fqn: &str) -> Vec<LifecycleEvent> {
        self.calls()
            .into_iter()
            .filter(|(_, f)| f == fqn)
            .map(|(e, _)| e)
            .collect()
    }

    #[allow(dead_code)]
    pub fn count(&self, event: LifecycleEvent) -> usize {
        self.calls().iter().filter(|(e, _)| *e == event).count()
    }

    #[allow(dead_code)]
    pub fn object_names(&self) -> Vec<String> {
        self.objects.lock().unwrap().keys().cloned().collect()
    }

    #[allow(dead_code)]
    pub fn insert(&self, name: &str, value: Value) {
        self.objects.lock().unwrap().insert(name.to_string(), value);
    }
}

/// How a fake handler misbehaves
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[allow(dead_code)]
pub enum Fault {
    /// Fail before touching the remote side
    Fail,
    /// Create the remote object, then fail (lost response)
    FailAfterCreate,
}

pub struct FakeHandler {
    kind: String,
    policy: ResourcePolicy,
    cloud: FakeCloud,
    replace_on_update: bool,
    faults: Mutex<HashMap<LifecycleEvent, Vec<Fault>>>,
}

#[allow(dead_code)]
impl FakeHandler {
    pub fn new(kind: &str, cloud: &FakeCloud) -> Self {
        Self {
            kind: kind.to_string(),
            policy: ResourcePolicy::default(),
            cloud: cloud.clone(),
            replace_on_update: false,
            faults: Mutex::new(HashMap::new()),
        }
    }

    pub fn with_policy(mut self, policy: ResourcePolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn replacing(self, fields: &[&str], strategy: ReplaceStrategy) -> Self {
        self.with_policy(
            ResourcePolicy::new()
                .replace_on(fields.iter().copied())
                .replace_strategy(strategy),
        )
    }

    pub fn replace_on_update(mut self) -> Self {
        self.replace_on_update = true;
        self
    }

    /// Misbehave on the next call of `event`
    pub fn fault(&self, event: LifecycleEvent, fault: Fault) {
        self.faults
            .lock()
            .unwrap()
            .entry(event)
            .or_default()
            .push(fault);
    }

    pub fn arc(self) -> Arc<dyn ResourceHandler> {
        Arc::new(self)
    }

    fn take_fault(&self, event: LifecycleEvent) -> Option<Fault> {
        let mut faults = self.faults.lock().unwrap();
        let queue = faults.get_mut(&event)?;
        if queue.is_empty() {
            None
        } else {
            Some(queue.remove(0))
        }
    }

    fn object_name(ctx: &HandlerContext, props: &Value) -> String {
        props
            .get("name")
            .and_then(Value::as_str)
            .map(str::to_string)
            .unwrap_or_else(|| ctx.physical_name())
    }
}

#[async_trait]
impl ResourceHandler for FakeHandler {
    fn kind(&self) -> &str {
        &self.kind
    }

    fn policy(&self) -> ResourcePolicy {
        self.policy.clone()
    }

    async fn handle(&self, ctx: &HandlerContext, props: &Value) -> Result<Outcome, HandlerError> {
        self.cloud
            .calls
            .lock()
            .unwrap()
            .push((ctx.event, ctx.fqn.clone()));
        let fault = self.take_fault(ctx.event);
        if fault == Some(Fault::Fail) {
            return Err(anyhow::anyhow!("injected {} failure", ctx.event).into());
        }

        let name = Self::object_name(ctx, props);
        let mut objects = self.cloud.objects.lock().unwrap();
        match ctx.event {
            LifecycleEvent::Create => {
                if let Some(existing) = objects.get(&name) {
                    return Err(HandlerError::AlreadyExists {
                        name,
                        existing: Some(existing.clone()),
                    });
                }
                let output = json!({ "name": name, "props": props });
                objects.insert(name, output.clone());
                if fault == Some(Fault::FailAfterCreate) {
                    return Err(anyhow::anyhow!("connection reset").into());
                }
                Ok(Outcome::Output(output))
            }
            LifecycleEvent::Update => {
                if self.replace_on_update {
                    return Ok(ctx.replace());
                }
                let current = ctx
                    .output
                    .as_ref()
                    .and_then(|o| o.get("name"))
                    .and_then(Value::as_str)
                    .map(str::to_string)
                    .unwrap_or(name);
                let output = json!({ "name": current, "props": props });
                objects.insert(current, output.clone());
                Ok(Outcome::Output(output))
            }
            LifecycleEvent::Delete => {
                if let Some(current) = ctx
                    .output
                    .as_ref()
                    .and_then(|o| o.get("name"))
                    .and_then(Value::as_str)
                {
                    objects.remove(current);
                }
                Ok(ctx.destroy())
            }
        }
    }
}

#[allow(dead_code)]
pub fn options(phase: Phase) -> ScopeOptions {
    ScopeOptions::new("shop", "dev").with_phase(phase)
}

#[allow(dead_code)]
pub fn store() -> Arc<MemoryStateStore> {
    Arc::new(MemoryStateStore::new())
}

#[allow(dead_code)]
pub fn registry(handlers: &[Arc<dyn ResourceHandler>]) -> HandlerRegistry {
    let mut registry = HandlerRegistry::new();
    for handler in handlers {
        registry.register(Arc::clone(handler));
    }
    registry
}

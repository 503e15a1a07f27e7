//! Local emulation controller
//!
//! In local mode resources do not call real providers. Resources that
//! support live reload register with the [`EmulatorController`] owned by
//! the root scope and publish their options through a [`ConfigSource`]; a
//! watch loop per resource pushes only the changed options into the shared
//! [`Emulator`]. [`EmulatorController::apply`] publishes and waits for the
//! loop's result so a failed upsert fails the handler.

use crate::cancel::Cancellation;
use crate::error::{EngineError, Result};
use crate::watch::{ConfigSource, ConfigStream};
use async_trait::async_trait;
use futures_util::future::join_all;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{Mutex, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// A local stand-in for a provider
#[async_trait]
pub trait Emulator: Send + Sync {
    async fn start(&mut self) -> anyhow::Result<()>;

    /// Add `name` or apply new options to it
    async fn upsert(&mut self, name: &str, options: &Value) -> anyhow::Result<()>;

    async fn remove(&mut self, name: &str) -> anyhow::Result<()>;

    /// Release everything the emulator holds
    async fn shutdown(&mut self) -> anyhow::Result<()>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ControllerState {
    Idle,
    Running,
    Disposed,
}

/// Outcome of the last value a watch loop handled
#[derive(Debug, Clone, Default)]
struct ApplyReport {
    attempt: u64,
    options: Value,
    error: Option<String>,
}

struct LiveLoop {
    source: ConfigSource<Value>,
    reports: watch::Receiver<ApplyReport>,
    cancel: Cancellation,
    task: JoinHandle<()>,
}

struct Inner {
    emulator: Arc<Mutex<Box<dyn Emulator>>>,
    state: std::sync::Mutex<ControllerState>,
    loops: std::sync::Mutex<HashMap<String, LiveLoop>>,
    cancellation: Cancellation,
}

/// Owner of the emulator for one run
#[derive(Clone)]
pub struct EmulatorController {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for EmulatorController {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EmulatorController")
            .field("live", &self.names())
            .finish_non_exhaustive()
    }
}

impl EmulatorController {
    pub fn new(emulator: Box<dyn Emulator>) -> Self {
        Self::with_cancellation(emulator, Cancellation::new())
    }

    /// Watch loops stop when `cancellation` fires
    pub fn with_cancellation(emulator: Box<dyn Emulator>, cancellation: Cancellation) -> Self {
        Self {
            inner: Arc::new(Inner {
                emulator: Arc::new(Mutex::new(emulator)),
                state: std::sync::Mutex::new(ControllerState::Idle),
                loops: std::sync::Mutex::new(HashMap::new()),
                cancellation,
            }),
        }
    }

    /// Start the emulator. Calling it again is a no-op.
    pub async fn init(&self) -> Result<()> {
        if self.state() != ControllerState::Idle {
            return Ok(());
        }
        let mut emulator = self.inner.emulator.lock().await;
        emulator
            .start()
            .await
            .map_err(|e| EngineError::Emulator(format!("failed to start: {:#}", e)))?;
        self.set_state(ControllerState::Running);
        info!("Local emulator started");
        Ok(())
    }

    pub fn is_running(&self) -> bool {
        self.state() == ControllerState::Running
    }

    /// Live configuration source of `name`, starting its watch loop on first use
    pub fn live(&self, name: &str) -> Result<ConfigSource<Value>> {
        self.entry(name).map(|(source, _)| source)
    }

    /// Publish `options` for `name` and wait until its watch loop has applied them
    pub async fn apply(&self, name: &str, options: Value) -> Result<()> {
        let (source, mut reports) = self.entry(name)?;
        let start = reports.borrow_and_update().attempt;
        source.publish(options.clone());

        loop {
            {
                let report = reports.borrow_and_update();
                if report.attempt > start {
                    if report.options == options {
                        return match &report.error {
                            None => Ok(()),
                            Some(message) => Err(EngineError::Emulator(format!(
                                "failed to apply '{}': {}",
                                name, message
                            ))),
                        };
                    }
                    // Superseded by a newer value before the loop got to ours
                    if source.current().as_ref() != Some(&options) {
                        return Ok(());
                    }
                }
            }
            if reports.changed().await.is_err() {
                return Err(EngineError::Emulator(format!(
                    "live loop for '{}' stopped before applying options",
                    name
                )));
            }
        }
    }

    fn entry(&self, name: &str) -> Result<(ConfigSource<Value>, watch::Receiver<ApplyReport>)> {
        if !self.is_running() {
            return Err(EngineError::Emulator(format!(
                "cannot register '{}': emulator is not running",
                name
            )));
        }

        let mut loops = self.lock_loops();
        if let Some(existing) = loops.get(name) {
            return Ok((existing.source.clone(), existing.reports.clone()));
        }

        let source = ConfigSource::new();
        let (report_tx, reports) = watch::channel(ApplyReport::default());
        let cancel = self.inner.cancellation.child();
        let task = tokio::spawn(run_live_loop(
            name.to_string(),
            source.subscribe(),
            report_tx,
            cancel.clone(),
            Arc::clone(&self.inner.emulator),
        ));
        debug!("Started live loop for {}", name);
        loops.insert(
            name.to_string(),
            LiveLoop {
                source: source.clone(),
                reports: reports.clone(),
                cancel,
                task,
            },
        );
        Ok((source, reports))
    }

    /// Stop the watch loop of `name`; it removes `name` from the emulator
    pub async fn stop(&self, name: &str) -> Result<()> {
        let removed = self.lock_loops().remove(name);
        if let Some(live) = removed {
            live.cancel.cancel();
            live.task
                .await
                .map_err(|e| EngineError::Emulator(format!("live loop for '{}': {}", name, e)))?;
        }
        Ok(())
    }

    /// Names with a running watch loop
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.lock_loops().keys().cloned().collect();
        names.sort();
        names
    }

    /// Stop every loop and shut the emulator down. Idempotent.
    pub async fn dispose(&self) -> Result<()> {
        if self.state() == ControllerState::Disposed {
            return Ok(());
        }
        let was_running = self.is_running();
        self.set_state(ControllerState::Disposed);

        let loops: Vec<(String, LiveLoop)> = self.lock_loops().drain().collect();
        for (_, live) in &loops {
            live.cancel.cancel();
        }
        let results = join_all(loops.into_iter().map(|(name, live)| async move {
            (name, live.task.await)
        }))
        .await;
        for (name, result) in results {
            if let Err(e) = result {
                warn!("Live loop for {} ended abnormally: {}", name, e);
            }
        }

        if was_running {
            let mut emulator = self.inner.emulator.lock().await;
            emulator
                .shutdown()
                .await
                .map_err(|e| EngineError::Emulator(format!("failed to shut down: {:#}", e)))?;
            info!("Local emulator stopped");
        }
        Ok(())
    }

    fn state(&self) -> ControllerState {
        match self.inner.state.lock() {
            Ok(state) => *state,
            Err(poisoned) => *poisoned.into_inner(),
        }
    }

    fn set_state(&self, state: ControllerState) {
        match self.inner.state.lock() {
            Ok(mut current) => *current = state,
            Err(poisoned) => *poisoned.into_inner() = state,
        }
    }

    fn lock_loops(&self) -> std::sync::MutexGuard<'_, HashMap<String, LiveLoop>> {
        match self.inner.loops.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

async fn run_live_loop(
    name: String,
    mut stream: ConfigStream<Value>,
    reports: watch::Sender<ApplyReport>,
    cancel: Cancellation,
    emulator: Arc<Mutex<Box<dyn Emulator>>>,
) {
    let mut applied: Option<Value> = None;
    let mut attempt = 0;

    while let Some(options) = stream.next(&cancel).await {
        attempt += 1;
        let error = if applied.as_ref() == Some(&options) {
            debug!("{}: options unchanged", name);
            None
        } else {
            let mut emulator = emulator.lock().await;
            match emulator.upsert(&name, &options).await {
                Ok(()) => {
                    info!("{}: applied new options", name);
                    applied = Some(options.clone());
                    None
                }
                Err(e) => {
                    warn!("{}: failed to apply options: {:#}", name, e);
                    Some(format!("{:#}", e))
                }
            }
        };
        reports.send_replace(ApplyReport {
            attempt,
            options,
            error,
        });
    }

    if applied.is_some() {
        let mut emulator = emulator.lock().await;
        if let Err(e) = emulator.remove(&name).await {
            warn!("{}: failed to remove from emulator: {:#}", name, e);
        }
    }
    debug!("{}: live loop stopped", name);
}

//! One pass of a program over the scope tree

use crate::action::PassReport;
use crate::error::Result;
use crate::options::ScopeOptions;
use crate::resource::HandlerRegistry;
use crate::scope::Scope;
use std::future::Future;
use std::sync::Arc;
use stratum_state::StateStore;
use tracing::{info, warn};

/// Run `program` in a fresh root scope and finalize it
///
/// Finalization only happens when the program succeeded. An emulator that is
/// not running yet is started for the pass and disposed afterwards; one that
/// is already running belongs to the caller (e.g. a dev session) and is left
/// alone.
pub async fn run<F, Fut>(
    options: ScopeOptions,
    store: Arc<dyn StateStore>,
    registry: HandlerRegistry,
    program: F,
) -> Result<PassReport>
where
    F: FnOnce(Scope) -> Fut,
    Fut: Future<Output = Result<()>>,
{
    let options = options.with_registry(registry);
    let phase = options.phase;
    let emulator = match (&options.emulator, options.local) {
        (Some(emulator), true) if !emulator.is_running() => Some(emulator.clone()),
        _ => None,
    };

    store.init().await?;
    let root = Scope::root(options, store)?;
    info!("Running {} pass for {}", phase, root.path());

    if let Some(emulator) = &emulator {
        emulator.init().await?;
    }

    let outcome: Result<PassReport> = async {
        program(root.clone()).await?;
        root.finalize().await?;
        Ok(root.report())
    }
    .await;

    if let Some(emulator) = emulator {
        if let Err(e) = emulator.dispose().await {
            if outcome.is_ok() {
                return Err(e);
            }
            warn!("Failed to stop local emulator: {}", e);
        }
    }

    if let Ok(report) = &outcome {
        info!("{}", report.summary());
    }
    outcome
}

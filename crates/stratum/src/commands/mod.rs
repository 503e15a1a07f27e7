pub mod deploy;
pub mod destroy;
pub mod dev;
pub mod run;

use crate::resources;
use crate::stack::Stack;
use stratum_config::Profile;
use stratum_engine::{
    Applied, Cancellation, EmulatorController, Phase, PassReport, ScopeOptions,
};

/// コマンド共通のオプション
#[derive(Debug, Clone)]
pub struct Invocation {
    pub stage: String,
    pub profile: Profile,
    pub force: bool,
    pub adopt: bool,
    pub quiet: bool,
}

/// 1回のパスの結果
pub enum PassOutcome {
    Completed {
        report: PassReport,
        applied: Vec<Applied>,
    },
    /// 割り込みで中断した (失敗ではない)
    Interrupted,
}

/// スタックを1パス実行する
pub async fn execute_pass(
    stack: &Stack,
    invocation: &Invocation,
    phase: Phase,
    cancellation: Cancellation,
    emulator: Option<EmulatorController>,
) -> anyhow::Result<PassOutcome> {
    let store = stack.open_store(&invocation.profile).await?;

    let mut options = ScopeOptions::new(&stack.manifest.app, &invocation.stage)
        .with_phase(phase)
        .with_local(emulator.is_some())
        .with_force(invocation.force)
        .with_adopt(invocation.adopt)
        .with_cancellation(cancellation);
    if let Some(cipher) = stack.cipher()? {
        options = options.with_cipher(cipher);
    }
    if let Some(emulator) = emulator {
        options = options.with_emulator(emulator);
    }

    let registry = resources::registry();
    let mut applied = Vec::new();
    let collected = &mut applied;
    let handlers = &registry;
    let result = stratum_engine::run(options, store, registry.clone(), move |scope| {
        stack.declare(scope, handlers, collected)
    })
    .await;

    match result {
        Ok(report) => Ok(PassOutcome::Completed { report, applied }),
        Err(e) if e.is_cancelled() => Ok(PassOutcome::Interrupted),
        Err(e) => Err(e.into()),
    }
}

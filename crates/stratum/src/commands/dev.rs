use super::{Invocation, PassOutcome, execute_pass};
use crate::emulator::ProcessEmulator;
use crate::stack::Stack;
use crate::utils;
use crate::watcher::FileWatcher;
use colored::Colorize;
use stratum_engine::{Cancellation, EmulatorController, Phase, install_interrupt_handler};
use tracing::debug;

/// ローカルモードで実行し、ファイル変更のたびにパスをやり直す
pub async fn handle(stack: Stack, invocation: &Invocation) -> anyhow::Result<()> {
    println!("{}", "開発モードを開始します...".blue().bold());
    println!("📄 {}", stack.path.display().to_string().cyan());
    println!("ステージ: {}", invocation.stage.cyan());

    let session = Cancellation::new();
    install_interrupt_handler(session.clone());

    let emulator =
        EmulatorController::with_cancellation(Box::new(ProcessEmulator::new()), session.child());
    emulator.init().await?;

    let result = watch_loop(stack, invocation, &session, &emulator).await;

    if let Err(e) = emulator.dispose().await {
        eprintln!("{} {}", "⚠ エミュレータの停止に失敗しました:".yellow(), e);
    }
    println!("{}", "開発モードを終了しました".blue());
    result
}

async fn watch_loop(
    mut stack: Stack,
    invocation: &Invocation,
    session: &Cancellation,
    emulator: &EmulatorController,
) -> anyhow::Result<()> {
    loop {
        println!();
        match execute_pass(
            &stack,
            invocation,
            Phase::Up,
            session.clone(),
            Some(emulator.clone()),
        )
        .await
        {
            Ok(PassOutcome::Completed { report, .. }) => {
                if report.has_changes() {
                    utils::print_report(&report);
                } else {
                    println!("{}", "変更はありません".green());
                }
            }
            Ok(PassOutcome::Interrupted) => return Ok(()),
            // 失敗しても監視は続ける
            Err(e) => eprintln!("{} {:#}", "✗ パスが失敗しました:".red().bold(), e),
        }

        let mut watcher = FileWatcher::new(
            &stack.root,
            vec![stack.path.clone()],
            &stack.manifest.watch,
        )
        .await;
        println!(
            "{}",
            format!("変更を待っています ({} ファイル, Ctrl+C で終了)", watcher.watched()).dimmed()
        );

        loop {
            let Some(changed) = watcher.changed(session).await else {
                return Ok(());
            };
            for path in &changed {
                println!("  ✎ {}", path.display());
            }
            // 定義が壊れている間は前の定義のまま待つ
            match stack.reload() {
                Ok(reloaded) => {
                    stack = reloaded;
                    break;
                }
                Err(e) => {
                    eprintln!("{} {:#}", "✗ スタック定義を読み込めません:".red().bold(), e);
                    debug!("前回の定義を維持します");
                }
            }
        }
    }
}

use super::{Invocation, PassOutcome, execute_pass};
use crate::stack::Stack;
use crate::utils;
use colored::Colorize;
use stratum_engine::{Cancellation, Phase, install_interrupt_handler};

pub async fn handle(stack: &Stack, invocation: &Invocation) -> anyhow::Result<()> {
    if !invocation.quiet {
        println!("{}", "デプロイを開始します...".blue().bold());
        println!("📄 {}", stack.path.display().to_string().cyan());
        println!("ステージ: {}", invocation.stage.cyan());
        println!();
    }

    let cancellation = Cancellation::new();
    install_interrupt_handler(cancellation.clone());

    match execute_pass(stack, invocation, Phase::Up, cancellation, None).await? {
        PassOutcome::Completed { report, .. } => {
            if !invocation.quiet {
                utils::print_report(&report);
                if !report.has_changes() {
                    println!("{}", "変更はありません".green());
                }
            }
        }
        PassOutcome::Interrupted => {
            println!("{}", "中断しました (実行中の処理は完了しています)".yellow());
        }
    }
    Ok(())
}

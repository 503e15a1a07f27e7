use super::{Invocation, PassOutcome, execute_pass};
use crate::stack::Stack;
use crate::utils;
use colored::Colorize;
use stratum_engine::{ActionType, Cancellation, Phase, install_interrupt_handler};

pub async fn handle(stack: &Stack, invocation: &Invocation) -> anyhow::Result<()> {
    if !invocation.quiet {
        println!(
            "{}",
            format!("ステージ {} のリソースを削除します...", invocation.stage)
                .red()
                .bold()
        );
        println!("📄 {}", stack.path.display().to_string().cyan());
        println!();
    }

    let cancellation = Cancellation::new();
    install_interrupt_handler(cancellation.clone());

    match execute_pass(stack, invocation, Phase::Destroy, cancellation, None).await? {
        PassOutcome::Completed { report, .. } => {
            if !invocation.quiet {
                if report.count(ActionType::Delete) == 0 {
                    println!("{}", "削除するリソースはありません".green());
                } else {
                    utils::print_report(&report);
                }
            }
        }
        PassOutcome::Interrupted => {
            println!("{}", "中断しました (実行中の処理は完了しています)".yellow());
        }
    }
    Ok(())
}

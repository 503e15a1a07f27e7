use super::{Invocation, PassOutcome, execute_pass};
use crate::stack::Stack;
use crate::utils;
use colored::Colorize;
use stratum_engine::{ActionType, Cancellation, Phase, install_interrupt_handler};

/// 記録済みの出力を表示する (何も変更しない)
pub async fn handle(stack: &Stack, invocation: &Invocation) -> anyhow::Result<()> {
    let cancellation = Cancellation::new();
    install_interrupt_handler(cancellation.clone());

    let applied = match execute_pass(stack, invocation, Phase::Read, cancellation, None).await? {
        PassOutcome::Completed { applied, .. } => applied,
        PassOutcome::Interrupted => {
            println!("{}", "中断しました".yellow());
            return Ok(());
        }
    };

    for resource in &applied {
        if resource.action == ActionType::Create {
            println!("{} {}", resource.fqn.cyan(), "(未作成)".dimmed());
            continue;
        }
        let output = serde_json::to_string(&utils::redact(&resource.output))?;
        println!("{} {}", resource.fqn.cyan(), output);
    }
    Ok(())
}

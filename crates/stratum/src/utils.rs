use colored::Colorize;
use serde_json::Value;
use stratum_engine::{ActionType, PassReport};
use stratum_state::Secret;

/// ステージ名を決定する (引数 > $USER > "dev")
pub fn determine_stage_name(stage: Option<String>) -> String {
    stage
        .filter(|s| !s.is_empty())
        .or_else(|| std::env::var("USER").ok().filter(|u| !u.is_empty()))
        .unwrap_or_else(|| "dev".to_string())
}

/// パスの結果を表示
pub fn print_report(report: &PassReport) {
    for (action, fqns) in &report.actions {
        let mark = match action {
            ActionType::Create => "+".green(),
            ActionType::Update => "~".yellow(),
            ActionType::Replace => "±".yellow(),
            ActionType::Delete => "-".red(),
            ActionType::NoOp | ActionType::Read => continue,
        };
        for fqn in fqns {
            println!("  {} {} ({})", mark, fqn.cyan(), action);
        }
    }
    println!();
    println!("{}", report.summary().to_string().bold());
}

/// 出力中の Secret を伏せ字にする
pub fn redact(value: &Value) -> Value {
    if Secret::is_secret_value(value) {
        return Value::String("****".to_string());
    }
    match value {
        Value::Object(map) => Value::Object(
            map.iter()
                .map(|(k, v)| (k.clone(), redact(v)))
                .collect(),
        ),
        Value::Array(items) => Value::Array(items.iter().map(redact).collect()),
        other => other.clone(),
    }
}

//! dev モードのプロセスエミュレータ

use crate::resources::ProcessProps;
use anyhow::Context;
use async_trait::async_trait;
use colored::Colorize;
use serde_json::Value;
use std::collections::HashMap;
use std::process::Stdio;
use stratum_engine::Emulator;
use tokio::process::{Child, Command};
use tracing::{debug, info, warn};

/// `process` リソースを子プロセスとして動かす
#[derive(Default)]
pub struct ProcessEmulator {
    children: HashMap<String, Child>,
}

impl ProcessEmulator {
    pub fn new() -> Self {
        Self::default()
    }

    async fn kill(&mut self, name: &str) {
        if let Some(mut child) = self.children.remove(name) {
            if let Err(e) = child.kill().await {
                warn!("{} の停止に失敗しました: {}", name, e);
            }
        }
    }
}

#[async_trait]
impl Emulator for ProcessEmulator {
    async fn start(&mut self) -> anyhow::Result<()> {
        debug!("プロセスエミュレータを開始");
        Ok(())
    }

    /// 設定が変わったプロセスだけがここに来る
    async fn upsert(&mut self, name: &str, options: &Value) -> anyhow::Result<()> {
        let spec: ProcessProps =
            serde_json::from_value(options.clone()).context("process の設定が不正です")?;

        let restarting = self.children.contains_key(name);
        self.kill(name).await;

        let mut command = Command::new(&spec.command);
        command
            .args(&spec.args)
            .envs(&spec.env)
            .stdin(Stdio::null())
            .kill_on_drop(true);
        if let Some(cwd) = &spec.cwd {
            command.current_dir(cwd);
        }

        let child = command
            .spawn()
            .with_context(|| format!("{} を起動できません: {}", name, spec.command_line()))?;
        info!("{} を起動しました (pid {:?})", name, child.id());
        println!(
            "  {} {} ({})",
            if restarting { "↻".yellow() } else { "▶".green() },
            name.cyan(),
            spec.command_line()
        );
        self.children.insert(name.to_string(), child);
        Ok(())
    }

    async fn remove(&mut self, name: &str) -> anyhow::Result<()> {
        if self.children.contains_key(name) {
            self.kill(name).await;
            println!("  {} {}", "■".red(), name.cyan());
        }
        Ok(())
    }

    async fn shutdown(&mut self) -> anyhow::Result<()> {
        let names: Vec<String> = self.children.keys().cloned().collect();
        for name in names {
            self.kill(&name).await;
        }
        debug!("プロセスエミュレータを終了");
        Ok(())
    }
}

use anyhow::Context;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::path::PathBuf;
use stratum_engine::{
    HandlerContext, HandlerError, LifecycleEvent, Outcome, ResourceHandler, ResourcePolicy,
};
use tracing::debug;

/// `type: process`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProcessProps {
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    #[serde(default)]
    pub cwd: Option<PathBuf>,
}

impl ProcessProps {
    pub fn command_line(&self) -> String {
        std::iter::once(self.command.as_str())
            .chain(self.args.iter().map(String::as_str))
            .collect::<Vec<_>>()
            .join(" ")
    }
}

#[derive(Debug, Serialize)]
struct ProcessOutput {
    command: String,
    /// エミュレータで起動しているか
    running: bool,
}

/// ローカルモードではエミュレータに登録し、それ以外では宣言内容を記録するだけ
pub struct ProcessHandler;

#[async_trait]
impl ResourceHandler for ProcessHandler {
    fn kind(&self) -> &str {
        "process"
    }

    /// 毎パス呼び出してエミュレータに最新の設定を渡す
    /// (変更がなければ watch ループ側で無視される)
    fn policy(&self) -> ResourcePolicy {
        ResourcePolicy::new().always_fresh()
    }

    async fn handle(&self, ctx: &HandlerContext, props: &Value) -> Result<Outcome, HandlerError> {
        let spec: ProcessProps =
            serde_json::from_value(props.clone()).context("process の設定が不正です")?;
        let emulator = ctx.emulator().filter(|_| ctx.local);

        match ctx.event {
            LifecycleEvent::Create | LifecycleEvent::Update => {
                let running = match emulator {
                    Some(emulator) => {
                        // 起動に失敗したら created として記録しない
                        emulator
                            .apply(&ctx.fqn, props.clone())
                            .await
                            .map_err(anyhow::Error::from)?;
                        true
                    }
                    None => {
                        debug!("{}: ローカルモードではないので起動しません", ctx.fqn);
                        false
                    }
                };
                ctx.output(&ProcessOutput {
                    command: spec.command_line(),
                    running,
                })
            }
            LifecycleEvent::Delete => {
                if let Some(emulator) = emulator {
                    emulator.stop(&ctx.fqn).await.map_err(anyhow::Error::from)?;
                }
                Ok(ctx.destroy())
            }
        }
    }
}

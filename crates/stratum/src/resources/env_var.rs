use anyhow::Context;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use stratum_engine::{
    HandlerContext, HandlerError, LifecycleEvent, Outcome, ResourceHandler, ResourcePolicy,
};

/// `type: env_var`: 環境変数を読むだけのリソース
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EnvVarProps {
    pub name: String,
    #[serde(default)]
    pub default: Option<String>,
}

#[derive(Debug, Serialize)]
struct EnvVarOutput<'a> {
    name: &'a str,
    value: String,
    /// 既定値を使ったか
    defaulted: bool,
}

pub struct EnvVarHandler;

#[async_trait]
impl ResourceHandler for EnvVarHandler {
    fn kind(&self) -> &str {
        "env_var"
    }

    /// 値は毎回読み直す
    fn policy(&self) -> ResourcePolicy {
        ResourcePolicy::new().always_fresh()
    }

    async fn handle(&self, ctx: &HandlerContext, props: &Value) -> Result<Outcome, HandlerError> {
        let props: EnvVarProps =
            serde_json::from_value(props.clone()).context("env_var の設定が不正です")?;

        if ctx.event == LifecycleEvent::Delete {
            return Ok(ctx.destroy());
        }

        let (value, defaulted) = match std::env::var(&props.name) {
            Ok(value) => (value, false),
            Err(_) => match props.default {
                Some(default) => (default, true),
                None => {
                    return Err(anyhow::anyhow!(
                        "環境変数 {} が設定されていません (default もありません)",
                        props.name
                    )
                    .into());
                }
            },
        };

        ctx.output(&EnvVarOutput {
            name: &props.name,
            value,
            defaulted,
        })
    }
}

use anyhow::Context;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::io::ErrorKind;
use std::path::PathBuf;
use stratum_engine::{
    HandlerContext, HandlerError, LifecycleEvent, Outcome, ReplaceStrategy, ResourceHandler,
    ResourcePolicy,
};
use tokio::fs;
use tracing::info;

/// `type: directory`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DirectoryProps {
    pub path: PathBuf,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct DirectoryOutput {
    path: PathBuf,
    /// 自分で作ったディレクトリだけ削除する
    created: bool,
}

pub struct DirectoryHandler;

#[async_trait]
impl ResourceHandler for DirectoryHandler {
    fn kind(&self) -> &str {
        "directory"
    }

    fn policy(&self) -> ResourcePolicy {
        ResourcePolicy::new()
            .replace_strategy(ReplaceStrategy::CreateBeforeDelete)
            .replace_on(["path"])
    }

    async fn handle(&self, ctx: &HandlerContext, props: &Value) -> Result<Outcome, HandlerError> {
        let props: DirectoryProps =
            serde_json::from_value(props.clone()).context("directory の設定が不正です")?;

        match ctx.event {
            LifecycleEvent::Create => {
                let existed = ensure_dir(&props.path).await?;
                ctx.output(&DirectoryOutput {
                    path: props.path,
                    created: !existed,
                })
            }
            LifecycleEvent::Update => {
                let prior = ctx.output_as::<DirectoryOutput>();
                let existed = ensure_dir(&props.path).await?;
                let created = match prior {
                    Some(prior) if prior.path == props.path => prior.created,
                    _ => !existed,
                };
                ctx.output(&DirectoryOutput {
                    path: props.path,
                    created,
                })
            }
            LifecycleEvent::Delete => {
                let created = ctx
                    .output_as::<DirectoryOutput>()
                    .map(|o| o.created)
                    .unwrap_or(false);
                if !created {
                    info!("{} は既存のディレクトリなので残します", props.path.display());
                    return Ok(ctx.destroy());
                }
                match fs::remove_dir_all(&props.path).await {
                    Ok(()) => {}
                    Err(e) if e.kind() == ErrorKind::NotFound => {}
                    Err(e) => {
                        return Err(anyhow::Error::new(e)
                            .context(format!("{} を削除できません", props.path.display()))
                            .into());
                    }
                }
                Ok(ctx.destroy())
            }
        }
    }
}

/// ディレクトリを作成し、元から存在していたかを返す
async fn ensure_dir(path: &std::path::Path) -> anyhow::Result<bool> {
    match fs::metadata(path).await {
        Ok(meta) if meta.is_dir() => Ok(true),
        Ok(_) => anyhow::bail!("{} はディレクトリではありません", path.display()),
        Err(e) if e.kind() == ErrorKind::NotFound => {
            fs::create_dir_all(path)
                .await
                .with_context(|| format!("{} を作成できません", path.display()))?;
            Ok(false)
        }
        Err(e) => Err(e.into()),
    }
}

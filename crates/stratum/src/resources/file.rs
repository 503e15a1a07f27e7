use anyhow::Context;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use stratum_engine::{
    HandlerContext, HandlerError, LifecycleEvent, Outcome, ReplaceStrategy, ResourceHandler,
    ResourcePolicy,
};
use stratum_state::Secret;
use tokio::fs;

/// `type: file`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FileProps {
    pub path: PathBuf,
    pub content: String,
    /// 内容を Secret として保存する
    #[serde(default)]
    pub secret: bool,
}

impl FileProps {
    /// エンジンに渡す props (secret の場合は内容を Secret で包む)
    pub fn to_props(&self) -> Value {
        if self.secret {
            json!({ "path": self.path, "content": Secret::new(self.content.clone()) })
        } else {
            json!({ "path": self.path, "content": self.content })
        }
    }
}

#[derive(Debug, Deserialize)]
struct StoredFile {
    path: PathBuf,
    content: FileContent,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum FileContent {
    Plain(String),
    Secret(Secret),
}

impl FileContent {
    fn as_str(&self) -> &str {
        match self {
            FileContent::Plain(s) => s,
            FileContent::Secret(s) => s.expose(),
        }
    }
}

/// 出力には内容そのものではなくハッシュだけを残す
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct FileOutput {
    path: PathBuf,
    digest: String,
    size: usize,
}

impl FileOutput {
    fn of(path: &Path, content: &str) -> Self {
        Self {
            path: path.to_path_buf(),
            digest: blake3::hash(content.as_bytes()).to_hex().to_string(),
            size: content.len(),
        }
    }
}

pub struct FileHandler;

#[async_trait]
impl ResourceHandler for FileHandler {
    fn kind(&self) -> &str {
        "file"
    }

    fn policy(&self) -> ResourcePolicy {
        ResourcePolicy::new()
            .replace_strategy(ReplaceStrategy::DeleteBeforeCreate)
            .replace_on(["path"])
    }

    async fn handle(&self, ctx: &HandlerContext, props: &Value) -> Result<Outcome, HandlerError> {
        let file: StoredFile =
            serde_json::from_value(props.clone()).context("file の設定が不正です")?;

        match ctx.event {
            LifecycleEvent::Create => {
                if let Some(existing) = read_existing(&file.path).await? {
                    return Err(HandlerError::AlreadyExists {
                        name: file.path.display().to_string(),
                        existing: Some(serde_json::to_value(FileOutput::of(
                            &file.path, &existing,
                        ))
                        .map_err(anyhow::Error::from)?),
                    });
                }
                write(&file).await?;
                ctx.output(&FileOutput::of(&file.path, file.content.as_str()))
            }
            LifecycleEvent::Update => {
                write(&file).await?;
                ctx.output(&FileOutput::of(&file.path, file.content.as_str()))
            }
            LifecycleEvent::Delete => {
                match fs::remove_file(&file.path).await {
                    Ok(()) => {}
                    Err(e) if e.kind() == ErrorKind::NotFound => {}
                    Err(e) => {
                        return Err(anyhow::Error::new(e)
                            .context(format!("{} を削除できません", file.path.display()))
                            .into());
                    }
                }
                Ok(ctx.destroy())
            }
        }
    }
}

async fn read_existing(path: &Path) -> anyhow::Result<Option<String>> {
    match fs::read(path).await {
        Ok(bytes) => Ok(Some(String::from_utf8_lossy(&bytes).into_owned())),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
        Err(e) => Err(anyhow::Error::new(e).context(format!("{} を読めません", path.display()))),
    }
}

async fn write(file: &StoredFile) -> anyhow::Result<()> {
    if let Some(parent) = file.path.parent() {
        fs::create_dir_all(parent)
            .await
            .with_context(|| format!("{} を作成できません", parent.display()))?;
    }
    fs::write(&file.path, file.content.as_str())
        .await
        .with_context(|| format!("{} に書き込めません", file.path.display()))
}

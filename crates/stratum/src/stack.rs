//! スタックの読み込みと宣言
//!
//! 定義ファイルから状態ストア・暗号化キーを用意し、リソースをスコープツリーに
//! 宣言していく。

use crate::manifest::{Backend, Manifest, ResourceDecl, ScopeDecl};
use anyhow::Context;
use async_trait::async_trait;
use futures_util::FutureExt;
use futures_util::future::LocalBoxFuture;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use stratum_config::{ConfigError, CredentialStore, Credentials, Profile, TokenRefresher};
use stratum_engine::{Applied, Declaration, EngineError, HandlerRegistry, Scope};
use stratum_state::{
    FileSystemStateStore, HttpStateStore, SecretCipher, SqliteStateStore, StateStore,
};
use tracing::debug;

const STATE_DIR: &str = ".stratum";

pub struct Stack {
    /// 定義ファイルのパス
    pub path: PathBuf,
    /// 定義ファイルのあるディレクトリ (相対パスの基準)
    pub root: PathBuf,
    pub manifest: Manifest,
}

impl Stack {
    /// 定義ファイルを探して読み込む
    pub fn discover() -> anyhow::Result<Self> {
        let path = stratum_config::find_stack_file().map_err(|e| match e {
            ConfigError::StackFileNotFound => anyhow::anyhow!(
                "スタック定義ファイルが見つかりません (stratum.yaml を作成するか STRATUM_STACK_PATH を指定してください)"
            ),
            other => other.into(),
        })?;
        Self::load(&path)
    }

    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let path = std::path::absolute(path)
            .with_context(|| format!("{} を解決できません", path.display()))?;
        let root = path
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from("."));
        let manifest = Manifest::load(&path)?;
        Ok(Self {
            path,
            root,
            manifest,
        })
    }

    /// 読み直す (dev モードでの再読み込み用)
    pub fn reload(&self) -> anyhow::Result<Self> {
        Self::load(&self.path)
    }

    fn resolve(&self, path: &Path) -> PathBuf {
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.root.join(path)
        }
    }

    pub async fn open_store(&self, profile: &Profile) -> anyhow::Result<Arc<dyn StateStore>> {
        let state = &self.manifest.state;
        let store: Arc<dyn StateStore> = match state.backend {
            Backend::Filesystem => {
                let root = state
                    .path
                    .as_deref()
                    .map(|p| self.resolve(p))
                    .unwrap_or_else(|| self.root.clone());
                Arc::new(FileSystemStateStore::new(root))
            }
            Backend::Sqlite => {
                let db = state
                    .path
                    .as_deref()
                    .map(|p| self.resolve(p))
                    .unwrap_or_else(|| self.root.join(STATE_DIR).join("state.db"));
                Arc::new(SqliteStateStore::open(&db).with_context(|| {
                    format!("SQLite データベースを開けません: {}", db.display())
                })?)
            }
            Backend::Http => {
                let url = state
                    .url
                    .clone()
                    .context("state.url が設定されていません")?;
                let token = match &state.credentials {
                    Some(provider) => {
                        let credentials = CredentialStore::open_default()?
                            .get_fresh(profile, provider, &ExpiredRefresher)
                            .await?;
                        Some(credentials.bearer().expose().to_string())
                    }
                    None => None,
                };
                Arc::new(HttpStateStore::new(
                    url,
                    token,
                    self.root.join(STATE_DIR).join("locks"),
                ))
            }
        };
        debug!("状態ストア: {:?}", state.backend);
        Ok(store)
    }

    /// パスワードの環境変数があれば暗号化キーを作る
    pub fn cipher(&self) -> anyhow::Result<Option<SecretCipher>> {
        let env = self.manifest.password_env();
        match std::env::var(env) {
            Ok(password) if !password.is_empty() => Ok(Some(
                SecretCipher::from_passphrase(&password).context("暗号化キーを作成できません")?,
            )),
            _ if self.manifest.has_secrets() => anyhow::bail!(
                "secret: true のリソースがあります。環境変数 {} にパスワードを設定してください",
                env
            ),
            _ => Ok(None),
        }
    }

    /// 定義ファイルの内容をスコープツリーに宣言する
    pub fn declare<'a>(
        &'a self,
        scope: Scope,
        registry: &'a HandlerRegistry,
        applied: &'a mut Vec<Applied>,
    ) -> LocalBoxFuture<'a, stratum_engine::Result<()>> {
        declare_level(
            scope,
            &self.root,
            &self.manifest.resources,
            &self.manifest.scopes,
            registry,
            applied,
        )
    }
}

fn declare_level<'a>(
    scope: Scope,
    base: &'a Path,
    resources: &'a [ResourceDecl],
    scopes: &'a [ScopeDecl],
    registry: &'a HandlerRegistry,
    applied: &'a mut Vec<Applied>,
) -> LocalBoxFuture<'a, stratum_engine::Result<()>> {
    async move {
        for resource in resources {
            let kind = resource.spec.kind();
            let handler = registry
                .get(kind)
                .ok_or_else(|| EngineError::UnknownKind {
                    kind: kind.to_string(),
                    fqn: scope.path().fqn(&resource.id),
                })?;

            let mut decl = Declaration::new(&resource.id, handler, resource.spec.to_props(base)?);
            decl.depends_on = resource.depends_on.clone();
            decl.adopt = resource.adopt;
            applied.push(scope.apply(decl).await?);
        }

        for child in scopes {
            let child_scope = scope.child(&child.name)?;
            declare_level(
                child_scope,
                base,
                &child.resources,
                &child.scopes,
                registry,
                applied,
            )
            .await?;
        }
        Ok(())
    }
    .boxed_local()
}

/// OAuth の更新フローは持たないので、期限切れなら再ログインを促す
struct ExpiredRefresher;

#[async_trait]
impl TokenRefresher for ExpiredRefresher {
    async fn refresh(
        &self,
        provider: &str,
        _credentials: &Credentials,
    ) -> stratum_config::Result<Credentials> {
        Err(ConfigError::Refresh {
            provider: provider.to_string(),
            message: "トークンの有効期限が切れています。再ログインしてください".to_string(),
        })
    }
}

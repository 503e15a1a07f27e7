//! スタック定義ファイル (YAML)
//!
//! ```yaml
//! app: shop
//! state:
//!   backend: filesystem
//! password_env: SHOP_STATE_PASSWORD
//! watch: ["src/**/*.toml"]
//! resources:
//!   - id: data
//!     type: directory
//!     path: ./data
//! scopes:
//!   - name: api
//!     resources:
//!       - id: server
//!         type: process
//!         command: ./api
//!         depends_on: [shop/dev/data]
//! ```

use crate::resources::{DirectoryProps, EnvVarProps, FileProps, ProcessProps};
use anyhow::Context;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashSet;
use std::path::{Path, PathBuf};

/// パスワード用の環境変数の既定名
pub const DEFAULT_PASSWORD_ENV: &str = "STRATUM_PASSWORD";

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Manifest {
    pub app: String,
    #[serde(default)]
    pub state: StateConfig,
    #[serde(default)]
    pub password_env: Option<String>,
    /// dev モードで監視する追加の glob
    #[serde(default)]
    pub watch: Vec<String>,
    #[serde(default)]
    pub resources: Vec<ResourceDecl>,
    #[serde(default)]
    pub scopes: Vec<ScopeDecl>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct StateConfig {
    #[serde(default)]
    pub backend: Backend,
    /// filesystem: プロジェクトルート, sqlite: DB ファイル
    #[serde(default)]
    pub path: Option<PathBuf>,
    /// http バックエンドのベース URL
    #[serde(default)]
    pub url: Option<String>,
    /// http バックエンドの認証に使うプロバイダ名
    #[serde(default)]
    pub credentials: Option<String>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Backend {
    #[default]
    Filesystem,
    Sqlite,
    Http,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScopeDecl {
    pub name: String,
    #[serde(default)]
    pub resources: Vec<ResourceDecl>,
    #[serde(default)]
    pub scopes: Vec<ScopeDecl>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResourceDecl {
    pub id: String,
    #[serde(default)]
    pub depends_on: Vec<String>,
    #[serde(default)]
    pub adopt: Option<bool>,
    #[serde(flatten)]
    pub spec: ResourceSpec,
}

/// リソース本体 (`type` で判別、未知のタイプはエラー)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ResourceSpec {
    Directory(DirectoryProps),
    File(FileProps),
    EnvVar(EnvVarProps),
    Process(ProcessProps),
}

impl ResourceSpec {
    /// ハンドラの kind
    pub fn kind(&self) -> &'static str {
        match self {
            ResourceSpec::Directory(_) => "directory",
            ResourceSpec::File(_) => "file",
            ResourceSpec::EnvVar(_) => "env_var",
            ResourceSpec::Process(_) => "process",
        }
    }

    pub fn is_secret(&self) -> bool {
        matches!(self, ResourceSpec::File(file) if file.secret)
    }

    /// 相対パスを `base` 基準に解決して props にする
    pub fn to_props(&self, base: &Path) -> serde_json::Result<Value> {
        match self {
            ResourceSpec::Directory(dir) => serde_json::to_value(DirectoryProps {
                path: resolve(base, &dir.path),
            }),
            ResourceSpec::File(file) => Ok(FileProps {
                path: resolve(base, &file.path),
                ..file.clone()
            }
            .to_props()),
            ResourceSpec::EnvVar(var) => serde_json::to_value(var),
            ResourceSpec::Process(process) => serde_json::to_value(ProcessProps {
                cwd: Some(resolve(base, process.cwd.as_deref().unwrap_or(Path::new(".")))),
                ..process.clone()
            }),
        }
    }
}

fn resolve(base: &Path, path: &Path) -> PathBuf {
    let joined = if path.is_absolute() {
        path.to_path_buf()
    } else {
        base.join(path)
    };
    // "./" などを取り除いて props が安定するようにする
    joined.components().collect()
}

impl Manifest {
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("{} を読み込めません", path.display()))?;
        Self::parse(&content).with_context(|| format!("{} の解析に失敗しました", path.display()))
    }

    pub fn parse(content: &str) -> anyhow::Result<Self> {
        let manifest: Manifest = serde_yaml::from_str(content)?;
        manifest.validate()?;
        Ok(manifest)
    }

    /// パスワード用の環境変数名
    pub fn password_env(&self) -> &str {
        self.password_env.as_deref().unwrap_or(DEFAULT_PASSWORD_ENV)
    }

    /// secret: true のリソースを含むか
    pub fn has_secrets(&self) -> bool {
        fn any_secret(resources: &[ResourceDecl], scopes: &[ScopeDecl]) -> bool {
            resources.iter().any(|r| r.spec.is_secret())
                || scopes.iter().any(|s| any_secret(&s.resources, &s.scopes))
        }
        any_secret(&self.resources, &self.scopes)
    }

    fn validate(&self) -> anyhow::Result<()> {
        if self.app.trim().is_empty() {
            anyhow::bail!("app が空です");
        }
        match self.state.backend {
            Backend::Http if self.state.url.is_none() => {
                anyhow::bail!("state.backend が http の場合は state.url が必要です")
            }
            _ => {}
        }
        validate_level("(root)", &self.resources, &self.scopes)
    }
}

/// 同じ階層での id / スコープ名の重複を検出
fn validate_level(location: &str, resources: &[ResourceDecl], scopes: &[ScopeDecl]) -> anyhow::Result<()> {
    let mut ids = HashSet::new();
    for resource in resources {
        if !ids.insert(resource.id.as_str()) {
            anyhow::bail!("{} でリソース id '{}' が重複しています", location, resource.id);
        }
    }

    let mut names = HashSet::new();
    for scope in scopes {
        if !names.insert(scope.name.as_str()) {
            anyhow::bail!("{} でスコープ名 '{}' が重複しています", location, scope.name);
        }
        validate_level(&scope.name, &scope.resources, &scope.scopes)?;
    }
    Ok(())
}

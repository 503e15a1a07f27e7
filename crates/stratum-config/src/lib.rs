pub mod credentials;
pub mod error;

pub use credentials::{CredentialStore, Credentials, TokenRefresher};
pub use error::*;

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// 既定のプロファイル名
pub const DEFAULT_PROFILE: &str = "default";

/// Stratumの設定ディレクトリを取得
///
/// `STRATUM_CONFIG_DIR` が設定されていればそれを使う
pub fn get_config_dir() -> Result<PathBuf> {
    let config_dir = match std::env::var_os("STRATUM_CONFIG_DIR") {
        Some(dir) => PathBuf::from(dir),
        None => dirs::config_dir()
            .ok_or(ConfigError::ConfigDirNotFound)?
            .join("stratum"),
    };

    if !config_dir.exists() {
        std::fs::create_dir_all(&config_dir)?;
    }

    Ok(config_dir)
}

/// プロジェクトのスタックファイルを探す
///
/// 以下の優先順位で検索:
/// 1. 環境変数 STRATUM_STACK_PATH (直接パス指定)
/// 2. カレントディレクトリ: stratum.local.yaml, .stratum.local.yaml, stratum.yaml, .stratum.yaml
/// 3. ./.stratum/ ディレクトリ内: 同様の順序
pub fn find_stack_file() -> Result<PathBuf> {
    // 1. 環境変数で直接指定
    if let Ok(stack_path) = std::env::var("STRATUM_STACK_PATH") {
        let path = PathBuf::from(stack_path);
        if path.exists() {
            return Ok(path);
        }
    }

    let current_dir = std::env::current_dir()?;
    let candidates = [
        "stratum.local.yaml",
        ".stratum.local.yaml",
        "stratum.yaml",
        ".stratum.yaml",
    ];

    // 2. カレントディレクトリで検索
    for filename in &candidates {
        let path = current_dir.join(filename);
        if path.exists() {
            return Ok(path);
        }
    }

    // 3. ./.stratum/ ディレクトリで検索
    let stratum_dir = current_dir.join(".stratum");
    if stratum_dir.is_dir() {
        for filename in &candidates {
            let path = stratum_dir.join(filename);
            if path.exists() {
                return Ok(path);
            }
        }
    }

    Err(ConfigError::StackFileNotFound)
}

/// 認証情報のまとまり (例: 個人用と業務用)
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Profile(String);

impl Profile {
    pub fn new(name: impl Into<String>) -> Result<Self> {
        let name = name.into();
        validate_name(&name)?;
        Ok(Self(name))
    }

    /// 明示指定 > STRATUM_PROFILE > "default"
    pub fn resolve(explicit: Option<&str>) -> Result<Self> {
        match explicit {
            Some(name) => Self::new(name),
            None => match std::env::var("STRATUM_PROFILE") {
                Ok(name) if !name.is_empty() => Self::new(name),
                _ => Ok(Self::default()),
            },
        }
    }

    pub fn name(&self) -> &str {
        &self.0
    }
}

impl Default for Profile {
    fn default() -> Self {
        Self(DEFAULT_PROFILE.to_string())
    }
}

impl std::fmt::Display for Profile {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl TryFrom<String> for Profile {
    type Error = ConfigError;

    fn try_from(value: String) -> Result<Self> {
        Self::new(value)
    }
}

impl From<Profile> for String {
    fn from(profile: Profile) -> Self {
        profile.0
    }
}

/// プロファイル名・プロバイダ名はファイル名になるので英数字と `-` `_` のみ
pub(crate) fn validate_name(name: &str) -> Result<()> {
    let valid = !name.is_empty()
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');
    if valid {
        Ok(())
    } else {
        Err(ConfigError::InvalidName(name.to_string()))
    }
}

//! プロバイダ認証情報の保存と更新
//!
//! `<config>/credentials/<profile>/<provider>.json` に1件ずつ保存する。
//! OAuth トークンの更新はロックファイルで直列化し、複数プロセスが同時に
//! 更新してトークンを上書きし合わないようにする。

use crate::error::{ConfigError, Result};
use crate::{Profile, validate_name};
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use stratum_state::{Lock, Secret};
use tokio::fs;
use tracing::{debug, info};

/// 期限切れとみなす余裕 (秒)
const EXPIRY_SKEW_SECS: i64 = 60;

/// プロバイダの認証情報
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Credentials {
    /// 期限なしの API トークン
    ApiToken { token: Secret },
    /// 更新が必要な OAuth トークン
    Oauth {
        access_token: Secret,
        refresh_token: Secret,
        expires_at: DateTime<Utc>,
        #[serde(default)]
        scopes: Vec<String>,
    },
}

impl Credentials {
    /// API 呼び出しに渡すトークン
    pub fn bearer(&self) -> &Secret {
        match self {
            Credentials::ApiToken { token } => token,
            Credentials::Oauth { access_token, .. } => access_token,
        }
    }

    /// `now` から60秒以内に期限が切れるか
    pub fn needs_refresh(&self, now: DateTime<Utc>) -> bool {
        match self {
            Credentials::ApiToken { .. } => false,
            Credentials::Oauth { expires_at, .. } => {
                *expires_at <= now + Duration::seconds(EXPIRY_SKEW_SECS)
            }
        }
    }
}

/// OAuth トークンを更新する処理 (プロバイダごとに実装)
#[async_trait]
pub trait TokenRefresher: Send + Sync {
    async fn refresh(&self, provider: &str, credentials: &Credentials) -> Result<Credentials>;
}

/// ファイルベースの認証情報ストア
#[derive(Debug, Clone)]
pub struct CredentialStore {
    root: PathBuf,
}

impl CredentialStore {
    /// `config_dir/credentials` 以下を使う
    pub fn new(config_dir: impl AsRef<Path>) -> Self {
        Self {
            root: config_dir.as_ref().join("credentials"),
        }
    }

    /// 既定の設定ディレクトリのストア
    pub fn open_default() -> Result<Self> {
        Ok(Self::new(crate::get_config_dir()?))
    }

    fn path(&self, profile: &Profile, provider: &str) -> Result<PathBuf> {
        validate_name(provider)?;
        Ok(self
            .root
            .join(profile.name())
            .join(format!("{}.json", provider)))
    }

    fn lock(&self, profile: &Profile, provider: &str) -> Lock {
        Lock::new(
            self.root.join(".locks"),
            &format!("credentials-{}-{}", profile, provider),
        )
    }

    pub async fn get(&self, profile: &Profile, provider: &str) -> Result<Option<Credentials>> {
        let path = self.path(profile, provider)?;
        match fs::read_to_string(&path).await {
            Ok(content) => Ok(Some(serde_json::from_str(&content)?)),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    pub async fn set(
        &self,
        profile: &Profile,
        provider: &str,
        credentials: &Credentials,
    ) -> Result<()> {
        let path = self.path(profile, provider)?;
        if let Some(dir) = path.parent() {
            fs::create_dir_all(dir).await?;
        }

        // 一時ファイルに書いてから rename する
        let tmp = path.with_extension("json.tmp");
        fs::write(&tmp, serde_json::to_vec_pretty(credentials)?).await?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            fs::set_permissions(&tmp, std::fs::Permissions::from_mode(0o600)).await?;
        }
        fs::rename(&tmp, &path).await?;

        debug!("認証情報を保存しました: {}/{}", profile, provider);
        Ok(())
    }

    pub async fn delete(&self, profile: &Profile, provider: &str) -> Result<()> {
        let path = self.path(profile, provider)?;
        match fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    /// プロファイルに保存されているプロバイダ名 (ソート済み)
    pub async fn list_providers(&self, profile: &Profile) -> Result<Vec<String>> {
        let dir = self.root.join(profile.name());
        let mut entries = match fs::read_dir(&dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut providers = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            if let Some(stem) = path.file_stem().and_then(|s| s.to_str()) {
                providers.push(stem.to_string());
            }
        }
        providers.sort();
        Ok(providers)
    }

    /// 有効な認証情報を取得する (必要ならロックを取って更新)
    pub async fn get_fresh(
        &self,
        profile: &Profile,
        provider: &str,
        refresher: &dyn TokenRefresher,
    ) -> Result<Credentials> {
        let credentials = self.require(profile, provider).await?;
        if !credentials.needs_refresh(Utc::now()) {
            return Ok(credentials);
        }

        let guard = self.lock(profile, provider).wait().await?;
        let result = self.refresh_locked(profile, provider, refresher).await;
        guard.release().await?;
        result
    }

    async fn refresh_locked(
        &self,
        profile: &Profile,
        provider: &str,
        refresher: &dyn TokenRefresher,
    ) -> Result<Credentials> {
        // 待っている間に別プロセスが更新したかもしれない
        let current = self.require(profile, provider).await?;
        if !current.needs_refresh(Utc::now()) {
            debug!("{}/{} は別プロセスで更新済み", profile, provider);
            return Ok(current);
        }

        let refreshed = refresher.refresh(provider, &current).await?;
        self.set(profile, provider, &refreshed).await?;
        info!("トークンを更新しました: {}/{}", profile, provider);
        Ok(refreshed)
    }

    async fn require(&self, profile: &Profile, provider: &str) -> Result<Credentials> {
        self.get(profile, provider)
            .await?
            .ok_or_else(|| ConfigError::CredentialsNotFound {
                profile: profile.to_string(),
                provider: provider.to_string(),
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tempfile::tempdir;

    struct CountingRefresher {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl TokenRefresher for CountingRefresher {
        async fn refresh(&self, _provider: &str, credentials: &Credentials) -> Result<Credentials> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            // 同時更新が起きたら2回目が走るように少し待つ
            tokio::time::sleep(std::time::Duration::from_millis(50)).await;
            let Credentials::Oauth {
                refresh_token,
                scopes,
                ..
            } = credentials
            else {
                return Err(ConfigError::Refresh {
                    provider: "test".into(),
                    message: "not an oauth credential".into(),
                });
            };
            Ok(Credentials::Oauth {
                access_token: Secret::new("fresh"),
                refresh_token: refresh_token.clone(),
                expires_at: Utc::now() + Duration::hours(1),
                scopes: scopes.clone(),
            })
        }
    }

    fn expired() -> Credentials {
        Credentials::Oauth {
            access_token: Secret::new("stale"),
            refresh_token: Secret::new("refresh"),
            expires_at: Utc::now() - Duration::minutes(5),
            scopes: vec!["deploy".into()],
        }
    }

    #[tokio::test]
    async fn test_set_get_delete() {
        let temp_dir = tempdir().unwrap();
        let store = CredentialStore::new(temp_dir.path());
        let profile = Profile::default();

        assert!(store.get(&profile, "cloud").await.unwrap().is_none());

        let creds = Credentials::ApiToken {
            token: Secret::new("abc"),
        };
        store.set(&profile, "cloud", &creds).await.unwrap();
        store.set(&profile, "dns", &expired()).await.unwrap();

        assert_eq!(store.get(&profile, "cloud").await.unwrap(), Some(creds));
        assert_eq!(
            store.list_providers(&profile).await.unwrap(),
            vec!["cloud", "dns"]
        );

        // ファイル上は type タグ付きで保存される
        let raw = std::fs::read_to_string(
            temp_dir.path().join("credentials/default/cloud.json"),
        )
        .unwrap();
        assert!(raw.contains("\"type\": \"api_token\""));

        store.delete(&profile, "cloud").await.unwrap();
        store.delete(&profile, "cloud").await.unwrap();
        assert_eq!(store.list_providers(&profile).await.unwrap(), vec!["dns"]);
    }

    #[tokio::test]
    async fn test_invalid_provider_name() {
        let temp_dir = tempdir().unwrap();
        let store = CredentialStore::new(temp_dir.path());
        let result = store.get(&Profile::default(), "../escape").await;
        assert!(matches!(result, Err(ConfigError::InvalidName(_))));
    }

    #[tokio::test]
    async fn test_get_fresh_skips_valid_tokens() {
        let temp_dir = tempdir().unwrap();
        let store = CredentialStore::new(temp_dir.path());
        let profile = Profile::default();
        let refresher = CountingRefresher {
            calls: AtomicUsize::new(0),
        };

        let valid = Credentials::Oauth {
            access_token: Secret::new("ok"),
            refresh_token: Secret::new("r"),
            expires_at: Utc::now() + Duration::hours(1),
            scopes: vec![],
        };
        store.set(&profile, "cloud", &valid).await.unwrap();

        let creds = store.get_fresh(&profile, "cloud", &refresher).await.unwrap();
        assert_eq!(creds, valid);
        assert_eq!(refresher.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_get_fresh_refreshes_once_across_callers() {
        let temp_dir = tempdir().unwrap();
        let store = CredentialStore::new(temp_dir.path());
        let profile = Profile::default();
        store.set(&profile, "cloud", &expired()).await.unwrap();

        let refresher = Arc::new(CountingRefresher {
            calls: AtomicUsize::new(0),
        });
        let mut tasks = Vec::new();
        for _ in 0..4 {
            let store = store.clone();
            let profile = profile.clone();
            let refresher = Arc::clone(&refresher);
            tasks.push(tokio::spawn(async move {
                store
                    .get_fresh(&profile, "cloud", refresher.as_ref())
                    .await
                    .unwrap()
            }));
        }
        for task in tasks {
            let creds = task.await.unwrap();
            assert_eq!(creds.bearer().expose(), "fresh");
        }

        assert_eq!(refresher.calls.load(Ordering::SeqCst), 1);
        assert!(
            !store
                .get(&profile, "cloud")
                .await
                .unwrap()
                .unwrap()
                .needs_refresh(Utc::now())
        );
    }

    #[tokio::test]
    async fn test_get_fresh_missing_credentials() {
        let temp_dir = tempdir().unwrap();
        let store = CredentialStore::new(temp_dir.path());
        let refresher = CountingRefresher {
            calls: AtomicUsize::new(0),
        };
        let result = store
            .get_fresh(&Profile::default(), "cloud", &refresher)
            .await;
        assert!(matches!(
            result,
            Err(ConfigError::CredentialsNotFound { .. })
        ));
    }

    #[test]
    fn test_api_tokens_never_expire() {
        let creds = Credentials::ApiToken {
            token: Secret::new("t"),
        };
        assert!(!creds.needs_refresh(Utc::now()));
        assert!(expired().needs_refresh(Utc::now()));
    }
}

use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("設定ディレクトリが見つかりません")]
    ConfigDirNotFound,

    #[error(
        "スタックファイルが見つかりません。以下の場所を確認してください:\n\
        - カレントディレクトリ: stratum.local.yaml, .stratum.local.yaml, stratum.yaml, .stratum.yaml\n\
        - ./.stratum/ ディレクトリ\n\
        または STRATUM_STACK_PATH 環境変数で直接指定できます"
    )]
    StackFileNotFound,

    #[error("無効な名前: '{0}' (英数字と - _ のみ使用できます)")]
    InvalidName(String),

    #[error("認証情報が見つかりません: profile={profile}, provider={provider}")]
    CredentialsNotFound { profile: String, provider: String },

    #[error("トークンの更新に失敗しました ({provider}): {message}")]
    Refresh { provider: String, message: String },

    #[error("IO エラー: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON エラー: {0}")]
    Json(#[from] serde_json::Error),

    #[error("ロックエラー: {0}")]
    Lock(#[from] stratum_state::StateError),
}

pub type Result<T> = std::result::Result<T, ConfigError>;

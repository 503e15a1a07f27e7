#![allow(deprecated)] // TODO: cargo_bin → cargo_bin_cmd! へ移行

use assert_cmd::Command;
use std::fs;
use std::path::PathBuf;
use tempfile::TempDir;

pub struct TestProject {
    pub root: TempDir,
}

impl TestProject {
    pub fn new() -> Self {
        let root = tempfile::tempdir().unwrap();
        Self { root }
    }

    pub fn write_stack(&self, content: &str) {
        let path = self.root.path().join("stratum.yaml");
        fs::write(path, content).unwrap();
    }

    pub fn path(&self) -> PathBuf {
        self.root.path().to_path_buf()
    }

    /// プロジェクトディレクトリで実行する stratum コマンド
    pub fn stratum(&self) -> Command {
        let mut cmd = Command::cargo_bin("stratum").unwrap();
        cmd.current_dir(self.root.path())
            .env("STRATUM_CONFIG_DIR", self.root.path().join(".config"))
            .env("NO_COLOR", "1")
            .env_remove("STRATUM_STACK_PATH")
            .env_remove("STRATUM_STAGE")
            .env_remove("STRATUM_PROFILE")
            .env_remove("STRATUM_PASSWORD")
            .env_remove("RUST_LOG");
        cmd
    }

    #[allow(dead_code)]
    pub fn read(&self, relative: &str) -> Option<String> {
        fs::read_to_string(self.root.path().join(relative)).ok()
    }

    /// 状態ファイル (.stratum/state/<scope>/<id>.json)
    #[allow(dead_code)]
    pub fn state_record(&self, scope: &str, id: &str) -> Option<serde_json::Value> {
        let path = self
            .root
            .path()
            .join(".stratum/state")
            .join(scope)
            .join(format!("{}.json", id));
        let content = fs::read_to_string(path).ok()?;
        serde_json::from_str(&content).ok()
    }
}

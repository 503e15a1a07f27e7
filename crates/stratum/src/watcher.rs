//! dev モードのファイル監視 (mtime ポーリング)
//!
//! 走査は `spawn_blocking` 上で行い、非同期ランタイムのスレッドを塞がない

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use stratum_engine::Cancellation;
use tracing::{debug, warn};

const DEFAULT_INTERVAL: Duration = Duration::from_millis(500);

type Snapshot = BTreeMap<PathBuf, Option<SystemTime>>;

/// 監視対象 (走査スレッドと共有する)
struct Targets {
    files: Vec<PathBuf>,
    patterns: Vec<String>,
}

pub struct FileWatcher {
    targets: Arc<Targets>,
    interval: Duration,
    snapshot: Snapshot,
}

impl FileWatcher {
    /// `files` は常に監視、`patterns` は `base` 基準の glob
    pub async fn new(base: &Path, files: Vec<PathBuf>, patterns: &[String]) -> Self {
        let patterns = patterns
            .iter()
            .map(|p| {
                if Path::new(p).is_absolute() {
                    p.clone()
                } else {
                    base.join(p).to_string_lossy().into_owned()
                }
            })
            .collect();
        let mut watcher = Self {
            targets: Arc::new(Targets { files, patterns }),
            interval: DEFAULT_INTERVAL,
            snapshot: Snapshot::new(),
        };
        watcher.snapshot = watcher.scan().await;
        watcher
    }

    #[cfg(test)]
    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    /// 監視中のファイル数
    pub fn watched(&self) -> usize {
        self.snapshot.len()
    }

    /// 変更があるまで待ち、変わったパスを返す。キャンセルされたら None
    pub async fn changed(&mut self, cancel: &Cancellation) -> Option<Vec<PathBuf>> {
        loop {
            tokio::select! {
                _ = cancel.cancelled() => return None,
                _ = tokio::time::sleep(self.interval) => {}
            }

            let current = self.scan().await;
            let changed = diff(&self.snapshot, &current);
            if changed.is_empty() {
                continue;
            }

            // 保存途中の連続書き込みをまとめる
            tokio::time::sleep(self.interval).await;
            self.snapshot = self.scan().await;
            debug!("変更を検出: {:?}", changed);
            return Some(changed);
        }
    }

    async fn scan(&self) -> Snapshot {
        let targets = Arc::clone(&self.targets);
        match tokio::task::spawn_blocking(move || targets.scan()).await {
            Ok(snapshot) => snapshot,
            Err(e) => {
                warn!("ファイルの走査に失敗しました: {}", e);
                self.snapshot.clone()
            }
        }
    }
}

impl Targets {
    fn scan(&self) -> Snapshot {
        let mut snapshot = Snapshot::new();
        for file in &self.files {
            snapshot.insert(file.clone(), modified(file));
        }
        for pattern in &self.patterns {
            let entries = match glob::glob(pattern) {
                Ok(entries) => entries,
                Err(e) => {
                    warn!("watch パターン '{}' が不正です: {}", pattern, e);
                    continue;
                }
            };
            for path in entries.flatten() {
                if path.is_file() {
                    let mtime = modified(&path);
                    snapshot.insert(path, mtime);
                }
            }
        }
        snapshot
    }
}

fn modified(path: &Path) -> Option<SystemTime> {
    std::fs::metadata(path).and_then(|m| m.modified()).ok()
}

fn diff(before: &Snapshot, after: &Snapshot) -> Vec<PathBuf> {
    let mut changed: Vec<PathBuf> = after
        .iter()
        .filter(|(path, mtime)| before.get(*path) != Some(*mtime))
        .map(|(path, _)| path.clone())
        .collect();
    changed.extend(
        before
            .keys()
            .filter(|path| !after.contains_key(*path))
            .cloned(),
    );
    changed
}

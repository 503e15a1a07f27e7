//! 組み込みのリソースタイプ

mod directory;
mod env_var;
mod file;
mod process;

pub use directory::{DirectoryHandler, DirectoryProps};
pub use env_var::{EnvVarHandler, EnvVarProps};
pub use file::{FileHandler, FileProps};
pub use process::{ProcessHandler, ProcessProps};

use std::sync::Arc;
use stratum_engine::HandlerRegistry;

/// 全組み込みタイプを登録したレジストリ
pub fn registry() -> HandlerRegistry {
    HandlerRegistry::new()
        .with(Arc::new(DirectoryHandler))
        .with(Arc::new(FileHandler))
        .with(Arc::new(EnvVarHandler))
        .with(Arc::new(ProcessHandler))
}

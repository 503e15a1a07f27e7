//! Stratum State
//!
//! Persistence layer of the Stratum engine: resource records, the pluggable
//! [`StateStore`] contract and its backends, secret sealing, and advisory
//! lock files.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────┐
//! │                  stratum-engine                   │
//! │         (scope tree, lifecycle, orphans)          │
//! └─────────────────┬────────────────────────────────┘
//!                   │  get / set / delete / list / lock
//! ┌─────────────────▼────────────────────────────────┐
//! │                 trait StateStore                  │
//! └──┬──────────────┬───────────────┬────────────┬───┘
//!    │              │               │            │
//! ┌──▼───────┐ ┌────▼─────┐ ┌───────▼──┐ ┌───────▼──┐
//! │filesystem│ │  sqlite  │ │   http   │ │  memory  │
//! └──────────┘ └──────────┘ └──────────┘ └──────────┘
//! ```

pub mod error;
pub mod lock;
pub mod record;
pub mod secret;
pub mod store;

// Re-exports
pub use error::{Result, StateError};
pub use lock::{Lock, LockGuard};
pub use record::{RECORD_VERSION, ResourceRecord, ResourceStatus, ScopePath};
pub use secret::{Secret, SecretCipher};
pub use store::{
    FileSystemStateStore, HttpStateStore, KeyGuard, MemoryStateStore, SqliteStateStore,
    StateStore,
};

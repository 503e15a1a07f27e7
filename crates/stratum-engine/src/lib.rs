//! Stratum Engine
//!
//! Reconciles declared resources against recorded state.
//!
//! A program declares resources inside a [`Scope`] tree. For each
//! declaration the lifecycle engine loads the prior record, decides between
//! create, update, replace and no-op, calls the resource's
//! [`ResourceHandler`] and persists the result. Once the program is done the
//! orphan pass deletes what is no longer declared, dependents first.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────┐
//! │              user program / stratum CLI           │
//! └─────────────────┬────────────────────────────────┘
//!                   │ Scope::apply(Declaration)
//! ┌─────────────────▼────────────────────────────────┐
//! │                  stratum-engine                   │
//! │  ┌────────────┐ ┌─────────────┐ ┌──────────────┐ │
//! │  │ scope tree │ │  lifecycle  │ │ orphan pass  │ │
//! │  └────────────┘ └──────┬──────┘ └──────────────┘ │
//! │  ┌─────────────────────▼─────┐ ┌──────────────┐  │
//! │  │ trait ResourceHandler     │ │  emulator +  │  │
//! │  └───────────────────────────┘ │  watch loop  │  │
//! │                                └──────────────┘  │
//! └─────────────────┬────────────────────────────────┘
//!                   │
//! ┌─────────────────▼────────────────────────────────┐
//! │             stratum-state (StateStore)            │
//! └──────────────────────────────────────────────────┘
//! ```

pub mod action;
pub mod cancel;
pub mod emulator;
pub mod error;
mod finalize;
mod lifecycle;
pub mod options;
pub mod resource;
pub mod runner;
pub mod scope;
pub mod watch;

// Re-exports
pub use action::{ActionType, Applied, PassReport, PassSummary};
pub use cancel::{Cancellation, install_interrupt_handler};
pub use emulator::{Emulator, EmulatorController};
pub use error::{EngineError, Result};
pub use options::{Phase, ScopeOptions};
pub use resource::{
    Change, Declaration, HandlerContext, HandlerError, HandlerRegistry, LifecycleEvent, Outcome,
    ReplaceStrategy, ResourceHandler, ResourcePolicy, default_diff, physical_name,
};
pub use runner::run;
pub use scope::Scope;
pub use watch::{ConfigSource, ConfigStream};

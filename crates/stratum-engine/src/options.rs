//! Phase and run-wide options

use crate::cancel::Cancellation;
use crate::emulator::EmulatorController;
use crate::resource::HandlerRegistry;
use serde::{Deserialize, Serialize};
use stratum_state::SecretCipher;

/// What a pass does to the outside world
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Phase {
    /// Apply declarations
    #[default]
    Up,
    /// Tear down everything recorded
    Destroy,
    /// Inspect only, no mutation
    Read,
}

impl std::fmt::Display for Phase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Phase::Up => write!(f, "up"),
            Phase::Destroy => write!(f, "destroy"),
            Phase::Read => write!(f, "read"),
        }
    }
}

/// Options propagated from the root scope to every descendant
#[derive(Debug, Clone)]
pub struct ScopeOptions {
    pub app: String,
    pub stage: String,
    pub phase: Phase,
    /// Local emulation instead of real provider calls
    pub local: bool,
    /// Run update handlers even for unchanged resources
    pub force: bool,
    /// Claim pre-existing objects instead of failing
    pub adopt: bool,
    pub cipher: Option<SecretCipher>,
    pub emulator: Option<EmulatorController>,
    pub registry: HandlerRegistry,
    pub cancellation: Cancellation,
}

impl ScopeOptions {
    pub fn new(app: impl Into<String>, stage: impl Into<String>) -> Self {
        Self {
            app: app.into(),
            stage: stage.into(),
            phase: Phase::Up,
            local: false,
            force: false,
            adopt: false,
            cipher: None,
            emulator: None,
            registry: HandlerRegistry::new(),
            cancellation: Cancellation::new(),
        }
    }

    pub fn with_phase(mut self, phase: Phase) -> Self {
        self.phase = phase;
        self
    }

    pub fn with_local(mut self, local: bool) -> Self {
        self.local = local;
        self
    }

    pub fn with_force(mut self, force: bool) -> Self {
        self.force = force;
        self
    }

    pub fn with_adopt(mut self, adopt: bool) -> Self {
        self.adopt = adopt;
        self
    }

    pub fn with_cipher(mut self, cipher: SecretCipher) -> Self {
        self.cipher = Some(cipher);
        self
    }

    pub fn with_emulator(mut self, emulator: EmulatorController) -> Self {
        self.emulator = Some(emulator);
        self
    }

    pub fn with_registry(mut self, registry: HandlerRegistry) -> Self {
        self.registry = registry;
        self
    }

    pub fn with_cancellation(mut self, cancellation: Cancellation) -> Self {
        self.cancellation = cancellation;
        self
    }
}

//! Actions taken on resources and the per-pass report

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Type of action applied to a resource
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionType {
    /// A new object was created (or, in read phase, would be)
    Create,
    /// An existing object was updated in place
    Update,
    /// The object was recreated
    Replace,
    /// The object was deleted
    Delete,
    /// Nothing changed; the cached output was returned
    NoOp,
    /// Read-only inspection of recorded state
    Read,
}

impl std::fmt::Display for ActionType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ActionType::Create => write!(f, "create"),
            ActionType::Update => write!(f, "update"),
            ActionType::Replace => write!(f, "replace"),
            ActionType::Delete => write!(f, "delete"),
            ActionType::NoOp => write!(f, "no-op"),
            ActionType::Read => write!(f, "read"),
        }
    }
}

/// Result of declaring one resource
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Applied {
    pub id: String,
    pub fqn: String,
    pub action: ActionType,
    pub output: serde_json::Value,
}

impl Applied {
    /// Get an output field as a specific type
    pub fn get<T: serde::de::DeserializeOwned>(&self, key: &str) -> Option<T> {
        self.output
            .get(key)
            .and_then(|v| serde_json::from_value(v.clone()).ok())
    }
}

/// What one pass did
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PassReport {
    /// FQNs grouped by action
    pub actions: BTreeMap<ActionType, Vec<String>>,
}

impl PassReport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&mut self, action: ActionType, fqn: impl Into<String>) {
        self.actions.entry(action).or_default().push(fqn.into());
    }

    pub fn merge(&mut self, other: PassReport) {
        for (action, fqns) in other.actions {
            self.actions.entry(action).or_default().extend(fqns);
        }
    }

    pub fn fqns(&self, action: ActionType) -> &[String] {
        self.actions.get(&action).map(Vec::as_slice).unwrap_or_default()
    }

    pub fn count(&self, action: ActionType) -> usize {
        self.fqns(action).len()
    }

    pub fn has_changes(&self) -> bool {
        [
            ActionType::Create,
            ActionType::Update,
            ActionType::Replace,
            ActionType::Delete,
        ]
        .iter()
        .any(|a| self.count(*a) > 0)
    }

    pub fn summary(&self) -> PassSummary {
        PassSummary {
            create: self.count(ActionType::Create),
            update: self.count(ActionType::Update),
            replace: self.count(ActionType::Replace),
            delete: self.count(ActionType::Delete),
            no_change: self.count(ActionType::NoOp) + self.count(ActionType::Read),
        }
    }
}

/// Summary of a pass
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PassSummary {
    pub create: usize,
    pub update: usize,
    pub replace: usize,
    pub delete: usize,
    pub no_change: usize,
}

impl std::fmt::Display for PassSummary {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} created, {} updated, {} replaced, {} deleted, {} unchanged",
            self.create, self.update, self.replace, self.delete, self.no_change
        )
    }
}

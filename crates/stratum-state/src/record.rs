//! Persisted resource records and the scope paths that key them

use crate::error::{Result, StateError};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Current on-disk record format
pub const RECORD_VERSION: u32 = 1;

/// Path of a scope in the scope tree (`app/stage/child/...`)
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ScopePath(Vec<String>);

impl ScopePath {
    /// Path of the root scope of one stage of an app
    pub fn root(app: &str, stage: &str) -> Result<Self> {
        Self::from_segments([app, stage])
    }

    pub fn from_segments<I, S>(segments: I) -> Result<Self>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let segments: Vec<String> = segments.into_iter().map(Into::into).collect();
        if segments.is_empty() {
            return Err(StateError::InvalidKey("scope path must not be empty".into()));
        }
        for segment in &segments {
            validate_segment(segment)?;
        }
        Ok(Self(segments))
    }

    /// Append a child scope name
    pub fn child(&self, name: &str) -> Result<Self> {
        validate_segment(name)?;
        let mut segments = self.0.clone();
        segments.push(name.to_string());
        Ok(Self(segments))
    }

    pub fn parent(&self) -> Option<Self> {
        if self.0.len() <= 1 {
            return None;
        }
        Some(Self(self.0[..self.0.len() - 1].to_vec()))
    }

    pub fn name(&self) -> &str {
        self.0.last().map(String::as_str).unwrap_or_default()
    }

    pub fn depth(&self) -> usize {
        self.0.len()
    }

    pub fn segments(&self) -> &[String] {
        &self.0
    }

    /// Whether `prefix` is this path or one of its ancestors
    pub fn starts_with(&self, prefix: &ScopePath) -> bool {
        self.0.len() >= prefix.0.len() && self.0[..prefix.0.len()] == prefix.0[..]
    }

    /// Fully qualified name of a resource in this scope
    pub fn fqn(&self, id: &str) -> String {
        format!("{}/{}", self, id)
    }
}

impl fmt::Display for ScopePath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.join("/"))
    }
}

impl TryFrom<String> for ScopePath {
    type Error = StateError;

    fn try_from(value: String) -> Result<Self> {
        Self::from_segments(value.split('/'))
    }
}

impl From<ScopePath> for String {
    fn from(path: ScopePath) -> Self {
        path.to_string()
    }
}

impl std::str::FromStr for ScopePath {
    type Err = StateError;

    fn from_str(s: &str) -> Result<Self> {
        Self::from_segments(s.split('/'))
    }
}

/// Validate a scope name or resource id
pub fn validate_segment(segment: &str) -> Result<()> {
    if segment.is_empty() {
        return Err(StateError::InvalidKey("empty name".into()));
    }
    if segment.contains('/') || segment == "." || segment == ".." {
        return Err(StateError::InvalidKey(format!(
            "'{}' must not contain '/' or be a relative path component",
            segment
        )));
    }
    Ok(())
}

/// Lifecycle status of a resource record
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResourceStatus {
    /// Create started but not confirmed
    Creating,
    /// Remote object exists and matches the recorded output
    Created,
    /// Update or replacement started but not confirmed
    Updating,
    /// Delete started but not confirmed
    Deleting,
    /// Remote object is gone
    Deleted,
}

impl ResourceStatus {
    /// Terminal statuses need no resumption
    pub fn is_terminal(&self) -> bool {
        matches!(self, ResourceStatus::Created | ResourceStatus::Deleted)
    }
}

impl fmt::Display for ResourceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ResourceStatus::Creating => write!(f, "creating"),
            ResourceStatus::Created => write!(f, "created"),
            ResourceStatus::Updating => write!(f, "updating"),
            ResourceStatus::Deleting => write!(f, "deleting"),
            ResourceStatus::Deleted => write!(f, "deleted"),
        }
    }
}

/// One persisted resource, keyed by `(scope path, id)`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceRecord {
    /// Record format version
    #[serde(default = "default_version")]
    pub version: u32,

    /// Resource type tag (e.g. "file", "process")
    pub kind: String,

    /// Resource id within its scope
    pub id: String,

    /// Fully qualified name (`scope/path/id`)
    pub fqn: String,

    pub status: ResourceStatus,

    /// Last-applied input properties
    pub props: serde_json::Value,

    /// Last-produced output
    pub output: serde_json::Value,

    /// FQNs this resource depends on
    #[serde(default)]
    pub dependencies: Vec<String>,

    /// Outputs of replaced objects that still have to be deleted
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub pending_replacements: Vec<serde_json::Value>,

    /// Error of the last failed attempt
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,

    pub created_at: DateTime<Utc>,

    pub updated_at: DateTime<Utc>,
}

fn default_version() -> u32 {
    RECORD_VERSION
}

impl ResourceRecord {
    pub fn new(scope: &ScopePath, id: impl Into<String>, kind: impl Into<String>) -> Self {
        let id = id.into();
        let now = Utc::now();
        Self {
            version: RECORD_VERSION,
            kind: kind.into(),
            fqn: scope.fqn(&id),
            id,
            status: ResourceStatus::Creating,
            props: serde_json::Value::Null,
            output: serde_json::Value::Null,
            dependencies: Vec::new(),
            pending_replacements: Vec::new(),
            error: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn with_status(mut self, status: ResourceStatus) -> Self {
        self.status = status;
        self
    }

    pub fn with_props(mut self, props: serde_json::Value) -> Self {
        self.props = props;
        self
    }

    pub fn with_output(mut self, output: serde_json::Value) -> Self {
        self.output = output;
        self
    }

    pub fn with_dependencies(mut self, dependencies: Vec<String>) -> Self {
        self.dependencies = dependencies;
        self
    }

    /// Move to a new status, clearing any previous failure
    pub fn transition(&mut self, status: ResourceStatus) {
        self.status = status;
        self.error = None;
        self.updated_at = Utc::now();
    }

    /// Keep the current status and remember why the attempt failed
    pub fn mark_failed(&mut self, error: impl Into<String>) {
        self.error = Some(error.into());
        self.updated_at = Utc::now();
    }

    pub fn get_output<T: serde::de::DeserializeOwned>(&self, key: &str) -> Option<T> {
        self.output
            .get(key)
            .and_then(|v| serde_json::from_value(v.clone()).ok())
    }

    /// Reject records written by a newer version
    pub fn check_version(&self) -> Result<()> {
        if self.version > RECORD_VERSION {
            return Err(StateError::UnsupportedVersion {
                found: self.version,
                supported: RECORD_VERSION,
            });
        }
        Ok(())
    }
}
